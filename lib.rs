//! # sealpack - Compressed, Authenticated Encryption for Files and Trees
//!
//! sealpack encrypts directories, single files and in-memory buffers into
//! self-describing encrypted files. Data is deflate-compressed and sealed with
//! XChaCha20-Poly1305 under a per-file key derived with HKDF-SHA256.
//!
//! ## Features
//!
//! - **Pipelines**: file, encryption, encode and extract stages chained together
//! - **Guaranteed teardown**: stages are released in reverse order on every exit path
//! - **Self-describing output**: readers recover all parameters from the file header
//! - **Envelopes**: raw data is stored as a single tagged blob
//!
//! ## Quick Start
//!
//! ```no_run
//! use sealpack::{archiver, SymmetricKey};
//! use std::path::Path;
//!
//! fn main() -> Result<(), sealpack::ArchiveError> {
//!     let key = SymmetricKey::generate();
//!
//!     archiver::encrypt_data(b"sensitive data", Path::new("secret.spk"), &key)?;
//!     let data = archiver::decrypt_data(Path::new("secret.spk"), &key)?;
//!     assert_eq!(data, b"sensitive data");
//!
//!     archiver::encrypt_directory(Path::new("docs"), Path::new("docs.spk"), &key)?;
//!     let entries = archiver::decrypt_directory(Path::new("docs.spk"), Path::new("restored"), &key)?;
//!     println!("restored {} entries", entries);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod archiver;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod key_manager;
pub mod resources;
pub mod streaming;

// Re-export common types for convenience
pub use error::ArchiveError;
pub use key_manager::SymmetricKey;
