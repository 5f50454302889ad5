//! Encrypt and decrypt directories, files and in-memory data.
//!
//! Every operation follows the same shape: validate the key, build or
//! recover an [`EncryptionContext`], assemble the pipeline through a
//! [`ResourceGuard`](crate::resources::ResourceGuard), then run a bulk
//! transfer or the envelope codec. All stages are released in reverse order
//! before the operation returns, whether it succeeded or not.
//!
//! ## Pipelines
//!
//! - directory: `file <- encrypt <- encode <- tree` / `file -> decrypt -> decode -> extract`
//! - file: `file -> encrypt -> file` / `file -> decrypt -> file`
//! - data: `file <- encrypt <- encode <- envelope` / `file -> decrypt -> decode -> envelope`

use crate::archive::{process_entries, DecodeStage, EncodeStage, ExtractStage, KeySet};
use crate::context::EncryptionContext;
use crate::envelope::{read_envelope, write_envelope};
use crate::error::Result;
use crate::key_manager::SymmetricKey;
use crate::resources::with_resources;
use crate::streaming::{process_bytes, DecryptionStage, EncryptionStage, FileStage};
use std::path::Path;
use tracing::{debug, info};

/// Archive the contents of `path` into the encrypted file `output`.
pub fn encrypt_directory(path: &Path, output: &Path, key: &SymmetricKey) -> Result<()> {
    key.validate()?;
    debug!(source = %path.display(), output = %output.display(), "encrypting directory");

    with_resources(|guard| {
        let context = EncryptionContext::for_write(key)?;
        let file = guard.acquire("output file", || FileStage::create(output))?;
        let encryptor = guard.acquire("encryption", || EncryptionStage::new(file, context))?;
        let encoder = guard.acquire("encode", || {
            Ok::<_, String>(EncodeStage::new(encryptor.clone()))
        })?;

        let entries = encoder
            .borrow_mut()
            .write_directory_contents(path, &KeySet::directory_default())?;
        encryptor.borrow_mut().finish()?;

        info!(
            source = %path.display(),
            output = %output.display(),
            entries,
            "directory encrypted"
        );
        Ok(())
    })
}

/// Extract the encrypted archive `path` into `output`. Returns the number of
/// entries extracted.
pub fn decrypt_directory(path: &Path, output: &Path, key: &SymmetricKey) -> Result<usize> {
    key.validate()?;
    debug!(source = %path.display(), output = %output.display(), "decrypting directory");

    with_resources(|guard| {
        let mut file = guard.acquire("source file", || FileStage::open_read(path))?;
        let context = EncryptionContext::recover_for_read(&mut file, key)?;
        let decryptor = guard.acquire("decryption", || DecryptionStage::new(file, context))?;
        let decoder = guard.acquire("decode", || {
            Ok::<_, String>(DecodeStage::new(decryptor))
        })?;
        let extractor = guard.acquire("extract", || ExtractStage::new(output))?;

        let count = process_entries(&mut *decoder.borrow_mut(), &mut *extractor.borrow_mut())?;

        info!(
            source = %path.display(),
            output = %output.display(),
            entries = count,
            "directory decrypted"
        );
        Ok(count)
    })
}

/// Encrypt `source` into `destination`. Returns the plaintext byte count.
pub fn encrypt_file(source: &Path, destination: &Path, key: &SymmetricKey) -> Result<i64> {
    key.validate()?;
    debug!(source = %source.display(), destination = %destination.display(), "encrypting file");

    with_resources(|guard| {
        let context = EncryptionContext::for_write(key)?;
        let mut input = guard.acquire("source file", || FileStage::open_read(source))?;
        let output = guard.acquire("destination file", || FileStage::create(destination))?;
        let mut encryptor = guard.acquire("encryption", || EncryptionStage::new(output, context))?;

        let bytes = process_bytes(&mut input, &mut encryptor)?;
        encryptor.borrow_mut().finish()?;

        info!(source = %source.display(), bytes, "file encrypted");
        Ok(bytes)
    })
}

/// Decrypt `source` into `destination`. Returns the plaintext byte count.
pub fn decrypt_file(source: &Path, destination: &Path, key: &SymmetricKey) -> Result<i64> {
    key.validate()?;
    debug!(source = %source.display(), destination = %destination.display(), "decrypting file");

    with_resources(|guard| {
        let mut input = guard.acquire("source file", || FileStage::open_read(source))?;
        let context = EncryptionContext::recover_for_read(&mut input, key)?;
        let mut decryptor = guard.acquire("decryption", || DecryptionStage::new(input, context))?;
        let mut output = guard.acquire("destination file", || FileStage::create(destination))?;

        let bytes = process_bytes(&mut decryptor, &mut output)?;

        info!(source = %source.display(), bytes, "file decrypted");
        Ok(bytes)
    })
}

/// Encrypt `data` as a single envelope into `destination`.
pub fn encrypt_data(data: &[u8], destination: &Path, key: &SymmetricKey) -> Result<()> {
    key.validate()?;
    debug!(destination = %destination.display(), bytes = data.len(), "encrypting data");

    with_resources(|guard| {
        let context = EncryptionContext::for_write(key)?;
        let output = guard.acquire("destination file", || FileStage::create(destination))?;
        let encryptor = guard.acquire("encryption", || EncryptionStage::new(output, context))?;
        let encoder = guard.acquire("encode", || {
            Ok::<_, String>(EncodeStage::new(encryptor.clone()))
        })?;

        write_envelope(&mut *encoder.borrow_mut(), data)?;
        encryptor.borrow_mut().finish()?;

        info!(destination = %destination.display(), bytes = data.len(), "data encrypted");
        Ok(())
    })
}

/// Decrypt the envelope stored in `source`.
pub fn decrypt_data(source: &Path, key: &SymmetricKey) -> Result<Vec<u8>> {
    key.validate()?;
    debug!(source = %source.display(), "decrypting data");

    with_resources(|guard| {
        let mut input = guard.acquire("source file", || FileStage::open_read(source))?;
        let context = EncryptionContext::recover_for_read(&mut input, key)?;
        let decryptor = guard.acquire("decryption", || DecryptionStage::new(input, context))?;
        let decoder = guard.acquire("decode", || {
            Ok::<_, String>(DecodeStage::new(decryptor))
        })?;

        let data = read_envelope(&mut *decoder.borrow_mut())?;

        info!(source = %source.display(), bytes = data.len(), "data decrypted");
        Ok(data)
    })
}
