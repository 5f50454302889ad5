//! Symmetric keys and key file storage.
//!
//! [`SymmetricKey`] is the secret every operation takes. It accepts any
//! length so that callers get a proper [`ArchiveError::InvalidKey`] from the
//! operation instead of a panic at construction. [`KeyManager`] loads or
//! creates the raw 32-byte key file used by the command line tool.
//!
//! ## Security Features
//!
//! - Key bytes are zeroized on drop
//! - New key files are created with Unix permissions 0600
//! - Keys are generated with `OsRng`

use crate::error::{ArchiveError, Result};
use anyhow::{bail, Context};
use rand_core::{OsRng, RngCore};
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroize;

/// Required key length in bits.
pub const KEY_BITS: usize = 256;

/// Required key length in bytes.
pub const KEY_LEN: usize = KEY_BITS / 8;

/// Opaque secret key material.
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: Vec<u8>,
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bits", &self.bit_count())
            .finish_non_exhaustive()
    }
}

impl SymmetricKey {
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self {
            bytes: bytes.as_ref().to_vec(),
        }
    }

    /// Fresh 256-bit key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn bit_count(&self) -> usize {
        self.bytes.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Fails with [`ArchiveError::InvalidKey`] unless the key is exactly 256 bits.
    pub fn validate(&self) -> Result<()> {
        if self.bit_count() != KEY_BITS {
            return Err(ArchiveError::invalid_key(format!(
                "expected a {}-bit key, got {} bits",
                KEY_BITS,
                self.bit_count()
            )));
        }
        Ok(())
    }
}

/// Handles key file generation and loading.
/// In production: prefer a hardware key store or OS keyring.
pub struct KeyManager {
    key: SymmetricKey,
}

impl KeyManager {
    pub async fn new(cfg: &crate::config::Config) -> anyhow::Result<Self> {
        let path = Path::new(&cfg.key_path);

        let key = if fs::try_exists(path)
            .await
            .with_context(|| format!("checking existence of {}", path.display()))?
        {
            info!(path = %path.display(), "loading existing encryption key");
            let mut data = fs::read(path)
                .await
                .with_context(|| format!("reading key from {}", path.display()))?;
            if data.len() != KEY_LEN {
                warn!(path = %path.display(), found_bytes = data.len(), "invalid key size");
                let found = data.len();
                data.zeroize();
                bail!(
                    "expected {}-byte key at {} but found {} bytes",
                    KEY_LEN,
                    path.display(),
                    found
                );
            }
            let key = SymmetricKey::from_bytes(&data);
            data.zeroize();
            key
        } else {
            info!(path = %path.display(), "generating new encryption key");
            let key = SymmetricKey::generate();

            #[cfg(unix)]
            {
                let path_buf = path.to_path_buf();
                let key_clone = key.clone();
                tokio::task::spawn_blocking(move || {
                    use std::fs::OpenOptions;
                    use std::io::Write;
                    use std::os::unix::fs::OpenOptionsExt;

                    let mut f = OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(&path_buf)?;
                    f.write_all(key_clone.as_bytes())?;
                    Ok::<(), anyhow::Error>(())
                })
                .await??;
            }
            #[cfg(not(unix))]
            {
                fs::write(path, key.as_bytes()).await?;
            }

            key
        };

        Ok(Self { key })
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    #[test]
    fn validate_accepts_only_256_bits() {
        assert!(SymmetricKey::from_bytes([7u8; 32]).validate().is_ok());

        for len in [0usize, 16, 31, 33, 64] {
            let err = SymmetricKey::from_bytes(vec![7u8; len]).validate().unwrap_err();
            assert!(matches!(err, ArchiveError::InvalidKey(_)), "len {len}");
        }
    }

    #[test]
    fn generated_keys_are_distinct() {
        let a = SymmetricKey::generate();
        let b = SymmetricKey::generate();
        assert_eq!(a.bit_count(), KEY_BITS);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn debug_does_not_print_key_bytes() {
        let key = SymmetricKey::from_bytes([0xABu8; 32]);
        let shown = format!("{key:?}");
        assert!(shown.contains("256"));
        assert!(!shown.contains("171"));
    }

    #[tokio::test]
    async fn key_manager_creates_then_reloads_key() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let key_path = tmp.path().join("sealpack.key");
        let cfg = Config::new(key_path.to_string_lossy(), "spk");

        let created = KeyManager::new(&cfg).await?;
        assert_eq!(std::fs::read(&key_path)?.len(), KEY_LEN);

        let loaded = KeyManager::new(&cfg).await?;
        assert_eq!(created.key().as_bytes(), loaded.key().as_bytes());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }

    #[tokio::test]
    async fn key_manager_rejects_short_key_file() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let key_path = tmp.path().join("short.key");
        std::fs::write(&key_path, [1u8; 16])?;
        let cfg = Config::new(key_path.to_string_lossy(), "spk");

        assert!(KeyManager::new(&cfg).await.is_err());
        Ok(())
    }
}
