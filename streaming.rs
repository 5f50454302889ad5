//! Byte-oriented stream stages.
//!
//! This module provides the file, encryption and decryption stages that
//! make up the byte half of every pipeline, and [`process_bytes`] for bulk
//! transfer between them.
//!
//! ## Encrypted Stream Format
//!
//! ```text
//! [context header:64][frame1][frame2]...[final frame]
//!
//! Each frame:
//! [flags:1][length:4][sealed deflate(chunk)]
//! ```
//!
//! Frames are sealed with XChaCha20-Poly1305 under the per-stream key. The
//! nonce is `nonce_prefix || counter || final` and the context header is the
//! associated data, so reordering, truncation or header tampering fails
//! authentication. Exactly one frame carries the final flag.

use crate::context::EncryptionContext;
use crate::error::{ArchiveError, Result};
use crate::resources::{Closable, StageHandle};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use tracing::debug;

/// Permission bits for every file a pipeline creates.
pub const OUTPUT_FILE_MODE: u32 = 0o644;

const FLAG_FINAL: u8 = 0x01;
const FRAME_HEADER_LEN: usize = 5;
const TAG_LEN: usize = 16;

/// Upper bound on a sealed frame; deflate never expands a chunk by more than
/// a small constant factor.
fn max_frame_len(chunk_size: usize) -> usize {
    chunk_size + chunk_size / 2 + 1024 + TAG_LEN
}

fn frame_nonce(prefix: &[u8], counter: u32, last: bool) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[..prefix.len()].copy_from_slice(prefix);
    nonce[19..23].copy_from_slice(&counter.to_be_bytes());
    nonce[23] = u8::from(last);
    XNonce::from(nonce)
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stage already closed")
}

enum FileMode {
    Reader(BufReader<File>),
    Writer(File),
}

/// A file opened read-only or write-only.
pub struct FileStage {
    inner: Option<FileMode>,
}

impl FileStage {
    pub fn open_read(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            inner: Some(FileMode::Reader(BufReader::new(file))),
        })
    }

    /// Create or truncate `path` with mode 0644.
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(OUTPUT_FILE_MODE);
        }
        let file = options.open(path)?;
        Ok(Self {
            inner: Some(FileMode::Writer(file)),
        })
    }
}

impl Read for FileStage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(FileMode::Reader(r)) => r.read(buf),
            Some(FileMode::Writer(_)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file stage opened for writing",
            )),
            None => Err(closed()),
        }
    }
}

impl Write for FileStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(FileMode::Writer(w)) => w.write(buf),
            Some(FileMode::Reader(_)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file stage opened for reading",
            )),
            None => Err(closed()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(FileMode::Writer(w)) => w.flush(),
            Some(FileMode::Reader(_)) => Ok(()),
            None => Err(closed()),
        }
    }
}

impl Closable for FileStage {
    fn close(&mut self) -> Result<()> {
        if let Some(FileMode::Writer(mut file)) = self.inner.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Sealing state, dropped on close.
struct Sealer {
    cipher: XChaCha20Poly1305,
    context: EncryptionContext,
    aad: Vec<u8>,
    counter: u32,
}

impl Sealer {
    fn new(context: EncryptionContext) -> Result<Self> {
        let cipher = context.cipher()?;
        let aad = context.encode().to_vec();
        Ok(Self {
            cipher,
            context,
            aad,
            counter: 0,
        })
    }

    fn nonce(&self, last: bool) -> XNonce {
        frame_nonce(self.context.nonce_prefix(), self.counter, last)
    }

    fn advance(&mut self) -> Result<()> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| ArchiveError::format("frame counter exhausted"))?;
        Ok(())
    }
}

/// Compresses and seals everything written to it into its sink.
///
/// The context header is written when the stage is created. Call
/// [`EncryptionStage::finish`] to seal the final frame; closing without
/// finishing discards buffered data and leaves an unterminated stream.
pub struct EncryptionStage<W: Write> {
    sink: StageHandle<W>,
    sealer: Option<Sealer>,
    buffer: Vec<u8>,
    chunk_size: usize,
    finished: bool,
}

impl<W: Write> EncryptionStage<W> {
    pub fn new(sink: StageHandle<W>, context: EncryptionContext) -> Result<Self> {
        let mut sink = sink;
        context.write_to(&mut sink)?;
        let chunk_size = context.chunk_size();
        debug!(chunk_size, "encryption stage started");
        Ok(Self {
            sink,
            sealer: Some(Sealer::new(context)?),
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            finished: false,
        })
    }

    fn seal_frame(&mut self, last: bool) -> Result<()> {
        let sealer = self.sealer.as_mut().ok_or_else(closed)?;

        let mut deflater = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        deflater.write_all(&self.buffer)?;
        let compressed = deflater.finish()?;

        let nonce = sealer.nonce(last);
        let ciphertext = sealer
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &compressed,
                    aad: &sealer.aad,
                },
            )
            .map_err(|e| ArchiveError::format(format!("encryption failed: {}", e)))?;

        let flags = if last { FLAG_FINAL } else { 0 };
        let len = u32::try_from(ciphertext.len())
            .map_err(|_| ArchiveError::format("sealed frame too large"))?;
        self.sink.write_all(&[flags])?;
        self.sink.write_all(&len.to_be_bytes())?;
        self.sink.write_all(&ciphertext)?;

        debug!(
            frame = sealer.counter,
            plaintext = self.buffer.len(),
            sealed = ciphertext.len(),
            last,
            "frame sealed"
        );
        sealer.advance()?;
        self.buffer.clear();
        Ok(())
    }

    /// Seal buffered data as the final frame and flush the sink.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.seal_frame(true)?;
        self.finished = true;
        self.sink.flush()?;
        Ok(())
    }
}

impl<W: Write> Write for EncryptionStage<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "encryption stage already finished",
            ));
        }
        if self.sealer.is_none() {
            return Err(closed());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        // A full chunk is sealed only once more data proves it is not the last.
        if self.buffer.len() == self.chunk_size {
            self.seal_frame(false)?;
        }
        let room = self.chunk_size - self.buffer.len();
        let n = room.min(buf.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl<W: Write> Closable for EncryptionStage<W> {
    fn close(&mut self) -> Result<()> {
        if !self.finished && self.sealer.is_some() {
            debug!("encryption stage closed before finish; stream left unterminated");
        }
        self.sealer = None;
        self.buffer.clear();
        Ok(())
    }
}

/// Opens and inflates frames pulled from its source.
pub struct DecryptionStage<R: Read> {
    source: StageHandle<R>,
    sealer: Option<Sealer>,
    plaintext: Vec<u8>,
    pos: usize,
    chunk_size: usize,
    done: bool,
}

impl<R: Read> DecryptionStage<R> {
    /// `context` must already hold the caller's key.
    pub fn new(source: StageHandle<R>, context: EncryptionContext) -> Result<Self> {
        let chunk_size = context.chunk_size();
        Ok(Self {
            source,
            sealer: Some(Sealer::new(context)?),
            plaintext: Vec::new(),
            pos: 0,
            chunk_size,
            done: false,
        })
    }

    fn open_frame(&mut self) -> Result<()> {
        let sealer = self.sealer.as_mut().ok_or_else(closed)?;

        let mut frame_header = [0u8; FRAME_HEADER_LEN];
        self.source.read_exact(&mut frame_header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ArchiveError::format("truncated stream: missing final frame")
            }
            _ => ArchiveError::from(e),
        })?;

        let flags = frame_header[0];
        if flags & !FLAG_FINAL != 0 {
            return Err(ArchiveError::format(format!("unknown frame flags 0x{:02x}", flags)));
        }
        let last = flags & FLAG_FINAL != 0;
        let len = u32::from_be_bytes([
            frame_header[1],
            frame_header[2],
            frame_header[3],
            frame_header[4],
        ]) as usize;
        if len < TAG_LEN || len > max_frame_len(self.chunk_size) {
            return Err(ArchiveError::format(format!("frame length {} out of range", len)));
        }

        let mut ciphertext = vec![0u8; len];
        self.source.read_exact(&mut ciphertext).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ArchiveError::format("truncated frame"),
            _ => ArchiveError::from(e),
        })?;

        let nonce = sealer.nonce(last);
        let compressed = sealer
            .cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: &ciphertext,
                    aad: &sealer.aad,
                },
            )
            .map_err(|_| {
                ArchiveError::authentication(format!("frame {} failed authentication", sealer.counter))
            })?;

        let mut plaintext = Vec::with_capacity(self.chunk_size);
        DeflateDecoder::new(compressed.as_slice())
            .take(self.chunk_size as u64 + 1)
            .read_to_end(&mut plaintext)
            .map_err(|e| ArchiveError::format(format!("inflating frame: {}", e)))?;
        if plaintext.len() > self.chunk_size {
            return Err(ArchiveError::format("frame inflates beyond chunk size"));
        }

        debug!(frame = sealer.counter, plaintext = plaintext.len(), last, "frame opened");
        sealer.advance()?;

        if last {
            let mut probe = [0u8; 1];
            if self.source.read(&mut probe)? != 0 {
                return Err(ArchiveError::format("trailing data after final frame"));
            }
            self.done = true;
        }

        self.plaintext = plaintext;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for DecryptionStage<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.plaintext.len() {
            if self.done {
                return Ok(0);
            }
            self.open_frame()?;
        }
        let n = (self.plaintext.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.plaintext[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl<R: Read> Closable for DecryptionStage<R> {
    fn close(&mut self) -> Result<()> {
        self.sealer = None;
        self.plaintext.clear();
        self.pos = 0;
        Ok(())
    }
}

/// Copy every byte from `reader` to `writer`. Returns the number of bytes
/// transferred.
pub fn process_bytes<R, W>(reader: &mut R, writer: &mut W) -> Result<i64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let copied = io::copy(reader, writer)?;
    writer.flush()?;
    i64::try_from(copied).map_err(|_| ArchiveError::io("transfer size exceeds i64"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_manager::SymmetricKey;
    use std::io::Cursor;

    const CHUNK: usize = crate::context::DEFAULT_CHUNK_SIZE as usize;

    fn key(byte: u8) -> SymmetricKey {
        SymmetricKey::from_bytes([byte; 32])
    }

    fn seal(plaintext: &[u8], k: &SymmetricKey) -> Vec<u8> {
        let sink = StageHandle::new(Vec::new());
        let ctx = EncryptionContext::for_write(k).expect("context");
        let mut stage = EncryptionStage::new(sink.clone(), ctx).expect("stage");
        let mut reader = Cursor::new(plaintext.to_vec());
        let n = process_bytes(&mut reader, &mut stage).expect("copy");
        assert_eq!(n, plaintext.len() as i64);
        stage.finish().expect("finish");
        let out = sink.borrow().clone();
        out
    }

    fn open(sealed: &[u8], k: &SymmetricKey) -> Result<Vec<u8>> {
        let source = StageHandle::new(Cursor::new(sealed.to_vec()));
        let ctx = EncryptionContext::recover_for_read(&mut source.clone(), k)?;
        let mut stage = DecryptionStage::new(source, ctx)?;
        let mut out = Vec::new();
        process_bytes(&mut stage, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_stream_round_trip_small() {
        let plaintext = b"hello world, this is a test message";
        let sealed = seal(plaintext, &key(0x42));
        assert_eq!(open(&sealed, &key(0x42)).expect("open"), plaintext);
    }

    #[test]
    fn test_stream_round_trip_multi_frame() {
        // Exact multiples exercise the "full buffer is not yet final" path.
        for len in [CHUNK, CHUNK * 3, CHUNK * 3 + 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = seal(&plaintext, &key(0x42));
            assert_eq!(open(&sealed, &key(0x42)).expect("open"), plaintext, "len {len}");
        }
    }

    #[test]
    fn test_empty_stream_round_trip() {
        let sealed = seal(b"", &key(1));
        assert!(open(&sealed, &key(1)).expect("open").is_empty());
    }

    #[test]
    fn test_compressible_input_shrinks() {
        let plaintext = vec![0x42u8; CHUNK * 2];
        let sealed = seal(&plaintext, &key(1));
        assert!(sealed.len() < plaintext.len() / 10);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let sealed = seal(b"secret data", &key(1));
        match open(&sealed, &key(2)) {
            Err(ArchiveError::Authentication(_)) => {}
            other => panic!("expected authentication failure, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_frame_fails_authentication() {
        let mut sealed = seal(b"secret data", &key(1));
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&sealed, &key(1)), Err(ArchiveError::Authentication(_))));
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let plaintext = vec![7u8; CHUNK * 2 + 10];
        let sealed = seal(&plaintext, &key(1));
        let cut = &sealed[..sealed.len() - 3];
        assert!(open(cut, &key(1)).is_err());

        // Dropping the final frame entirely must not look like a clean end.
        let header_only = &sealed[..crate::context::CONTEXT_HEADER_LEN];
        assert!(matches!(open(header_only, &key(1)), Err(ArchiveError::Format(_))));
    }

    #[test]
    fn test_trailing_data_is_rejected() {
        let mut sealed = seal(b"payload", &key(1));
        sealed.extend_from_slice(b"junk");
        assert!(matches!(open(&sealed, &key(1)), Err(ArchiveError::Format(_))));
    }

    #[test]
    fn test_oversized_frame_length_is_rejected() {
        let mut sealed = seal(b"payload", &key(1));
        let len_at = crate::context::CONTEXT_HEADER_LEN + 1;
        sealed[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        match open(&sealed, &key(1)) {
            Err(ArchiveError::Format(msg)) => assert!(msg.contains("out of range"), "{msg}"),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn test_frame_inflating_past_chunk_size_is_rejected() {
        let sink = StageHandle::new(Vec::new());
        let ctx = EncryptionContext::for_write(&key(1)).expect("context");
        let mut stage = EncryptionStage::new(sink.clone(), ctx).expect("stage");
        // The header still advertises CHUNK; the frame carries one byte more.
        stage.chunk_size = CHUNK + 1;
        stage.write_all(&vec![9u8; CHUNK + 1]).expect("write");
        stage.finish().expect("finish");

        let sealed = sink.borrow().clone();
        match open(&sealed, &key(1)) {
            Err(ArchiveError::Format(msg)) => assert!(msg.contains("beyond chunk size"), "{msg}"),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn test_unfinished_stage_is_not_sealed() {
        let sink = StageHandle::new(Vec::new());
        let ctx = EncryptionContext::for_write(&key(1)).expect("context");
        let mut stage = EncryptionStage::new(sink.clone(), ctx).expect("stage");
        stage.write_all(b"partial").expect("write");
        stage.close().expect("close");
        assert!(stage.write(b"more").is_err());
        assert!(stage.finish().is_err());

        let sealed = sink.borrow().clone();
        assert!(matches!(open(&sealed, &key(1)), Err(ArchiveError::Format(_))));
    }

    #[test]
    fn test_file_stage_modes() -> Result<()> {
        let tmp = tempfile::TempDir::new()?;
        let path = tmp.path().join("out.bin");

        let mut w = FileStage::create(&path)?;
        w.write_all(b"abc")?;
        assert!(w.read(&mut [0u8; 4]).is_err());
        w.close()?;
        assert!(w.write(b"x").is_err());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o777, OUTPUT_FILE_MODE);
        }

        let mut r = FileStage::open_read(&path)?;
        let mut s = String::new();
        r.read_to_string(&mut s)?;
        assert_eq!(s, "abc");
        assert!(r.write(b"x").is_err());
        Ok(())
    }
}
