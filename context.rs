//! Encryption contexts.
//!
//! A context binds a key to the fixed profile (HKDF-SHA256 key derivation,
//! XChaCha20-Poly1305 sealing) and the fixed compression algorithm (deflate).
//! Writers create a fresh context; readers recover one in two phases: the
//! self-describing parameters are parsed from the front of the stream without
//! a key, then the caller's key is injected.
//!
//! ## Context Header
//!
//! ```text
//! [magic:4 "SPK1"][version:1][profile:2][compression:2][chunk_size:4][salt:32][nonce_prefix:19]
//! ```
//!
//! All integers are big-endian. The header is 64 bytes.

use crate::error::{ArchiveError, Result};
use crate::key_manager::SymmetricKey;
use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use hkdf::Hkdf;
use rand_core::RngCore;
use sha2::Sha256;
use std::io::{self, Read, Write};
use tracing::debug;
use zeroize::Zeroize;

pub const CONTEXT_MAGIC: [u8; 4] = *b"SPK1";
pub const CONTEXT_VERSION: u8 = 1;
pub const CONTEXT_HEADER_LEN: usize = 64;

pub const SALT_LEN: usize = 32;
pub const NONCE_PREFIX_LEN: usize = 19;

/// Plaintext bytes per sealed frame (64KB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

const HKDF_INFO_PREFIX: &[u8] = b"sealpack stream v1";

/// Key derivation and sealing profile.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    HkdfSha256XChaCha20Poly1305 = 0x0001,
}

impl TryFrom<u16> for Profile {
    type Error = ArchiveError;

    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            0x0001 => Ok(Self::HkdfSha256XChaCha20Poly1305),
            other => Err(ArchiveError::io(format!(
                "unknown encryption profile 0x{:04x}",
                other
            ))),
        }
    }
}

/// Per-frame compression algorithm.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Deflate = 0x0001,
}

impl TryFrom<u16> for Compression {
    type Error = ArchiveError;

    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            0x0001 => Ok(Self::Deflate),
            other => Err(ArchiveError::io(format!(
                "unknown compression algorithm 0x{:04x}",
                other
            ))),
        }
    }
}

pub const PROFILE: Profile = Profile::HkdfSha256XChaCha20Poly1305;
pub const COMPRESSION: Compression = Compression::Deflate;

pub struct EncryptionContext {
    profile: Profile,
    compression: Compression,
    chunk_size: u32,
    salt: [u8; SALT_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    stream_key: Option<[u8; 32]>,
}

impl Drop for EncryptionContext {
    fn drop(&mut self) {
        if let Some(key) = self.stream_key.as_mut() {
            key.zeroize();
        }
    }
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("profile", &self.profile)
            .field("compression", &self.compression)
            .field("chunk_size", &self.chunk_size)
            .field("keyed", &self.stream_key.is_some())
            .finish_non_exhaustive()
    }
}

impl EncryptionContext {
    /// Fresh context for writing, bound to `key`.
    pub fn for_write(key: &SymmetricKey) -> Result<Self> {
        key.validate()?;

        let mut salt = [0u8; SALT_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_prefix);

        let mut ctx = Self {
            profile: PROFILE,
            compression: COMPRESSION,
            chunk_size: DEFAULT_CHUNK_SIZE,
            salt,
            nonce_prefix,
            stream_key: None,
        };
        ctx.set_symmetric_key(key)?;
        Ok(ctx)
    }

    /// Parse the context header from the front of `reader`. No key is needed
    /// and the result cannot seal or open frames until a key is injected.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; CONTEXT_HEADER_LEN];
        reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ArchiveError::io("stream too short for context header"),
            _ => ArchiveError::io(format!("reading context header: {}", e)),
        })?;
        Self::decode(&buf)
    }

    /// Phase one then phase two: parse the header and inject `key`.
    pub fn recover_for_read<R: Read>(reader: &mut R, key: &SymmetricKey) -> Result<Self> {
        let mut ctx = Self::read_from(reader)?;
        ctx.set_symmetric_key(key)?;
        Ok(ctx)
    }

    /// Validate `key` and derive the per-stream sealing key from it.
    pub fn set_symmetric_key(&mut self, key: &SymmetricKey) -> Result<()> {
        key.validate()?;

        let mut info = Vec::with_capacity(HKDF_INFO_PREFIX.len() + CONTEXT_HEADER_LEN);
        info.extend_from_slice(HKDF_INFO_PREFIX);
        info.extend_from_slice(&self.encode());

        let hk = Hkdf::<Sha256>::new(Some(&self.salt), key.as_bytes());
        let mut derived = [0u8; 32];
        hk.expand(&info, &mut derived)
            .map_err(|_| ArchiveError::invalid_key("HKDF expand failed"))?;

        if let Some(old) = self.stream_key.as_mut() {
            old.zeroize();
        }
        self.stream_key = Some(derived);
        debug!(profile = ?self.profile, "symmetric key injected into context");
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    pub fn encode(&self) -> [u8; CONTEXT_HEADER_LEN] {
        let mut out = [0u8; CONTEXT_HEADER_LEN];
        out[0..4].copy_from_slice(&CONTEXT_MAGIC);
        out[4] = CONTEXT_VERSION;
        out[5..7].copy_from_slice(&(self.profile as u16).to_be_bytes());
        out[7..9].copy_from_slice(&(self.compression as u16).to_be_bytes());
        out[9..13].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[13..45].copy_from_slice(&self.salt);
        out[45..64].copy_from_slice(&self.nonce_prefix);
        out
    }

    fn decode(buf: &[u8; CONTEXT_HEADER_LEN]) -> Result<Self> {
        if buf[0..4] != CONTEXT_MAGIC {
            return Err(ArchiveError::io("not an encrypted stream (bad magic)"));
        }
        if buf[4] != CONTEXT_VERSION {
            return Err(ArchiveError::io(format!(
                "unsupported context version: {}",
                buf[4]
            )));
        }

        let profile = Profile::try_from(u16::from_be_bytes([buf[5], buf[6]]))?;
        let compression = Compression::try_from(u16::from_be_bytes([buf[7], buf[8]]))?;
        let chunk_size = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ArchiveError::io(format!(
                "chunk size {} out of range",
                chunk_size
            )));
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[13..45]);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&buf[45..64]);

        Ok(Self {
            profile,
            compression,
            chunk_size,
            salt,
            nonce_prefix,
            stream_key: None,
        })
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size as usize
    }

    pub fn has_key(&self) -> bool {
        self.stream_key.is_some()
    }

    pub(crate) fn nonce_prefix(&self) -> &[u8; NONCE_PREFIX_LEN] {
        &self.nonce_prefix
    }

    pub(crate) fn cipher(&self) -> Result<XChaCha20Poly1305> {
        let key = self
            .stream_key
            .as_ref()
            .ok_or_else(|| ArchiveError::invalid_key("context has no key"))?;
        XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| ArchiveError::invalid_key("derived key has wrong length"))
    }
}
