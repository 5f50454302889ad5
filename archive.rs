//! Structured entry streams.
//!
//! An archive is a sequence of entries. Each entry is a [`Header`] (ordered
//! typed fields keyed by 3-character tags) followed by the bytes of every
//! blob field it declares, in declaration order.
//!
//! ## Entry Format
//!
//! ```text
//! [magic:4 "SPE1"][field_count:2][field]...[blob bytes]...
//!
//! Each field:
//! [tag:3][kind:1][value]
//!   kind 0 string: [len:2][utf8]
//!   kind 1 uint:   [u64]
//!   kind 2 blob:   [size:8]
//! ```
//!
//! A clean end of stream where a header would start ends the archive.

use crate::error::{ArchiveError, Result};
use crate::resources::{Closable, StageHandle};
use crate::streaming::OUTPUT_FILE_MODE;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

pub const ENTRY_MAGIC: [u8; 4] = *b"SPE1";

const KIND_STRING: u8 = 0;
const KIND_UINT: u8 = 1;
const KIND_BLOB: u8 = 2;

const MAX_FIELDS: u16 = 256;

/// Three-character ASCII field tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldKey([u8; 3]);

impl FieldKey {
    pub const TYP: FieldKey = FieldKey(*b"TYP");
    pub const PAT: FieldKey = FieldKey(*b"PAT");
    pub const DAT: FieldKey = FieldKey(*b"DAT");

    pub fn new(tag: &str) -> Result<Self> {
        let bytes = tag.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(ArchiveError::invalid_value(format!(
                "field key must be 3 ASCII characters: {:?}",
                tag
            )));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldKey({})", self.as_str())
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    String(String),
    UInt(u64),
    /// Descriptor only; the bytes follow the header.
    Blob { size: u64 },
}

/// Entry types carried in the `TYP` field.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    RegularFile = b'F',
    Directory = b'D',
}

impl EntryType {
    pub fn code(self) -> u64 {
        self as u8 as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match u8::try_from(code).ok()? {
            b'F' => Some(Self::RegularFile),
            b'D' => Some(Self::Directory),
            _ => None,
        }
    }
}

/// Ordered typed fields of one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(FieldKey, FieldValue)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: FieldKey, value: FieldValue) {
        self.fields.push((key, value));
    }

    pub fn field(&self, key: FieldKey) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = FieldKey> + '_ {
        self.fields.iter().map(|(k, _)| *k)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn blobs(&self) -> impl Iterator<Item = (FieldKey, u64)> + '_ {
        self.fields.iter().filter_map(|(k, v)| match v {
            FieldValue::Blob { size } => Some((*k, *size)),
            _ => None,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let count = u16::try_from(self.fields.len())
            .ok()
            .filter(|n| *n <= MAX_FIELDS)
            .ok_or_else(|| ArchiveError::invalid_value("too many header fields"))?;

        let mut out = Vec::with_capacity(6 + self.fields.len() * 12);
        out.extend_from_slice(&ENTRY_MAGIC);
        out.extend_from_slice(&count.to_be_bytes());
        for (key, value) in &self.fields {
            out.extend_from_slice(&key.0);
            match value {
                FieldValue::String(s) => {
                    let len = u16::try_from(s.len()).map_err(|_| {
                        ArchiveError::invalid_value(format!("string field {} too long", key))
                    })?;
                    out.push(KIND_STRING);
                    out.extend_from_slice(&len.to_be_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                FieldValue::UInt(v) => {
                    out.push(KIND_UINT);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                FieldValue::Blob { size } => {
                    out.push(KIND_BLOB);
                    out.extend_from_slice(&size.to_be_bytes());
                }
            }
        }
        Ok(out)
    }

    /// Read one header. `Ok(None)` on a clean end of stream.
    pub fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Self>> {
        let mut magic = [0u8; 4];
        let mut filled = 0;
        while filled < magic.len() {
            match reader.read(&mut magic[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(ArchiveError::format("truncated entry header")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if magic != ENTRY_MAGIC {
            return Err(ArchiveError::format("bad entry magic"));
        }

        let count = u16::from_be_bytes(read_array(reader)?);
        if count > MAX_FIELDS {
            return Err(ArchiveError::format(format!("{} header fields", count)));
        }

        let mut header = Header::new();
        for _ in 0..count {
            let key = FieldKey(read_array(reader)?);
            let kind = read_array::<1, _>(reader)?[0];
            let value = match kind {
                KIND_STRING => {
                    let len = u16::from_be_bytes(read_array(reader)?) as usize;
                    let mut buf = vec![0u8; len];
                    read_exact(reader, &mut buf)?;
                    let s = String::from_utf8(buf).map_err(|_| {
                        ArchiveError::format(format!("field {} is not UTF-8", key))
                    })?;
                    FieldValue::String(s)
                }
                KIND_UINT => FieldValue::UInt(u64::from_be_bytes(read_array(reader)?)),
                KIND_BLOB => FieldValue::Blob {
                    size: u64::from_be_bytes(read_array(reader)?),
                },
                other => {
                    return Err(ArchiveError::format(format!(
                        "field {} has unknown kind {}",
                        key, other
                    )))
                }
            };
            header.append(key, value);
        }
        Ok(Some(header))
    }
}

fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ArchiveError::format("truncated entry header"),
        _ => ArchiveError::from(e),
    })
}

fn read_array<const N: usize, R: Read + ?Sized>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    read_exact(reader, &mut buf)?;
    Ok(buf)
}

/// Set of field categories to record when archiving a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet(Vec<FieldKey>);

impl KeySet {
    /// `TYP,PAT,DAT`: entry type, relative path, file contents.
    pub fn directory_default() -> Self {
        Self(vec![FieldKey::TYP, FieldKey::PAT, FieldKey::DAT])
    }

    pub fn contains(&self, key: FieldKey) -> bool {
        self.0.contains(&key)
    }
}

impl FromStr for KeySet {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        let mut keys = Vec::new();
        for tag in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let key = FieldKey::new(tag)?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Err(ArchiveError::invalid_value("empty key set"));
        }
        Ok(Self(keys))
    }
}

/// Writes entries into a byte sink.
pub struct EncodeStage<W: Write> {
    sink: Option<StageHandle<W>>,
    pending: VecDeque<(FieldKey, u64)>,
}

impl<W: Write> EncodeStage<W> {
    pub fn new(sink: StageHandle<W>) -> Self {
        Self {
            sink: Some(sink),
            pending: VecDeque::new(),
        }
    }

    fn sink(&mut self) -> Result<&mut StageHandle<W>> {
        self.sink
            .as_mut()
            .ok_or_else(|| ArchiveError::io("encode stage closed"))
    }

    /// Write `header`. Every blob it declares must then be written with
    /// [`EncodeStage::write_blob`] before the next header.
    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        if let Some((key, _)) = self.pending.front() {
            return Err(ArchiveError::invalid_value(format!(
                "blob {} of previous entry not written",
                key
            )));
        }
        let bytes = header.encode()?;
        self.sink()?.write_all(&bytes)?;
        self.pending.extend(header.blobs());
        Ok(())
    }

    pub fn write_blob(&mut self, key: FieldKey, data: &[u8]) -> Result<()> {
        let mut reader = data;
        self.copy_blob(key, &mut reader)
    }

    /// Stream the next pending blob, which must be `key`, from `reader`.
    /// Exactly the declared number of bytes must be available.
    pub fn copy_blob<R: Read + ?Sized>(&mut self, key: FieldKey, reader: &mut R) -> Result<()> {
        let size = match self.pending.front() {
            Some((k, size)) if *k == key => *size,
            Some((k, _)) => {
                return Err(ArchiveError::invalid_value(format!(
                    "expected blob {}, got {}",
                    k, key
                )))
            }
            None => {
                return Err(ArchiveError::invalid_value(format!(
                    "no pending blob for {}",
                    key
                )))
            }
        };

        let sink = self.sink()?;
        let copied = io::copy(&mut reader.take(size), sink)?;
        if copied != size {
            return Err(ArchiveError::io(format!(
                "blob {} declared {} bytes but source provided {}",
                key, size, copied
            )));
        }
        self.pending.pop_front();
        Ok(())
    }

    /// Archive every descendant of `root`, recording only the fields in
    /// `keys`. Returns the number of entries written.
    pub fn write_directory_contents(&mut self, root: &Path, keys: &KeySet) -> Result<usize> {
        let meta = fs::metadata(root)?;
        if !meta.is_dir() {
            return Err(ArchiveError::invalid_value(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let mut count = 0;
        self.archive_dir(root, Path::new(""), keys, &mut count)?;
        debug!(root = %root.display(), entries = count, "directory archived");
        Ok(count)
    }

    fn archive_dir(
        &mut self,
        dir: &Path,
        rel: &Path,
        keys: &KeySet,
        count: &mut usize,
    ) -> Result<()> {
        let mut children = fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        // Sort for consistent ordering
        children.sort();

        for path in children {
            let name = match path.file_name() {
                Some(name) => name.to_owned(),
                None => continue,
            };
            if name.to_str().is_none() {
                warn!(path = %path.display(), "skipping entry with non UTF-8 name");
                continue;
            }
            let rel_path = rel.join(&name);
            let file_type = fs::symlink_metadata(&path)?.file_type();

            if file_type.is_dir() {
                self.write_entry(EntryType::Directory, &rel_path, None, keys)?;
                *count += 1;
                self.archive_dir(&path, &rel_path, keys, count)?;
            } else if file_type.is_file() {
                let mut file = File::open(&path)?;
                let size = file.metadata()?.len();
                self.write_entry(EntryType::RegularFile, &rel_path, Some((size, &mut file)), keys)?;
                *count += 1;
            } else {
                warn!(path = %path.display(), "skipping entry that is neither file nor directory");
            }
        }
        Ok(())
    }

    fn write_entry(
        &mut self,
        kind: EntryType,
        rel_path: &Path,
        data: Option<(u64, &mut File)>,
        keys: &KeySet,
    ) -> Result<()> {
        let mut header = Header::new();
        if keys.contains(FieldKey::TYP) {
            header.append(FieldKey::TYP, FieldValue::UInt(kind.code()));
        }
        if keys.contains(FieldKey::PAT) {
            header.append(FieldKey::PAT, FieldValue::String(archive_path(rel_path)?));
        }
        let blob = data.filter(|_| keys.contains(FieldKey::DAT));
        if let Some((size, _)) = &blob {
            header.append(FieldKey::DAT, FieldValue::Blob { size: *size });
        }

        self.write_header(&header)?;
        if let Some((_, file)) = blob {
            self.copy_blob(FieldKey::DAT, file)?;
        }
        Ok(())
    }
}

impl<W: Write> Closable for EncodeStage<W> {
    fn close(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
        }
        Ok(())
    }
}

/// `/`-separated relative path for the PAT field.
fn archive_path(rel: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                ArchiveError::invalid_value(format!("non UTF-8 path: {}", rel.display()))
            })?),
            other => {
                return Err(ArchiveError::invalid_value(format!(
                    "unexpected path component {:?}",
                    other
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Reads entries from a byte source.
pub struct DecodeStage<R: Read> {
    source: Option<StageHandle<R>>,
    pending: VecDeque<(FieldKey, u64)>,
}

impl<R: Read> DecodeStage<R> {
    pub fn new(source: StageHandle<R>) -> Self {
        Self {
            source: Some(source),
            pending: VecDeque::new(),
        }
    }

    fn source(&mut self) -> Result<&mut StageHandle<R>> {
        self.source
            .as_mut()
            .ok_or_else(|| ArchiveError::io("decode stage closed"))
    }

    /// Next header, skipping any unread blobs of the previous entry.
    /// `Ok(None)` once the archive is exhausted.
    pub fn read_header(&mut self) -> Result<Option<Header>> {
        self.skip_pending()?;
        let header = Header::decode(self.source()?)?;
        if let Some(h) = &header {
            self.pending.extend(h.blobs());
        }
        Ok(header)
    }

    fn skip_pending(&mut self) -> Result<()> {
        while let Some((key, size)) = self.pending.pop_front() {
            let skipped = io::copy(&mut self.source()?.take(size), &mut io::sink())?;
            if skipped != size {
                return Err(ArchiveError::format(format!("blob {} truncated", key)));
            }
        }
        Ok(())
    }

    /// Seek forward to blob `key` of the current entry, discarding earlier
    /// blobs. Returns its size.
    fn seek_blob(&mut self, key: FieldKey) -> Result<u64> {
        loop {
            match self.pending.front().copied() {
                Some((k, size)) if k == key => return Ok(size),
                Some((k, size)) => {
                    self.pending.pop_front();
                    let skipped = io::copy(&mut self.source()?.take(size), &mut io::sink())?;
                    if skipped != size {
                        return Err(ArchiveError::format(format!("blob {} truncated", k)));
                    }
                }
                None => {
                    return Err(ArchiveError::invalid_value(format!(
                        "no unread blob {} in current entry",
                        key
                    )))
                }
            }
        }
    }

    /// Fill `buf` with blob `key`; `buf` must be exactly the declared size.
    pub fn read_blob(&mut self, key: FieldKey, buf: &mut [u8]) -> Result<()> {
        let size = self.seek_blob(key)?;
        if size != buf.len() as u64 {
            return Err(ArchiveError::invalid_value(format!(
                "blob {} is {} bytes, buffer is {}",
                key,
                size,
                buf.len()
            )));
        }
        read_blob_bytes(self.source()?, buf, key)?;
        self.pending.pop_front();
        Ok(())
    }

    /// Stream blob `key` into `writer`. Returns the bytes copied.
    pub fn copy_blob<W: Write + ?Sized>(&mut self, key: FieldKey, writer: &mut W) -> Result<u64> {
        let size = self.seek_blob(key)?;
        let copied = io::copy(&mut self.source()?.take(size), writer)?;
        if copied != size {
            return Err(ArchiveError::format(format!("blob {} truncated", key)));
        }
        self.pending.pop_front();
        Ok(copied)
    }
}

fn read_blob_bytes<R: Read + ?Sized>(source: &mut R, buf: &mut [u8], key: FieldKey) -> Result<()> {
    source.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ArchiveError::format(format!("blob {} truncated", key)),
        _ => ArchiveError::from(e),
    })
}

impl<R: Read> Closable for DecodeStage<R> {
    fn close(&mut self) -> Result<()> {
        self.source = None;
        self.pending.clear();
        Ok(())
    }
}

/// Materializes entries under a destination directory.
pub struct ExtractStage {
    root: Option<PathBuf>,
}

impl ExtractStage {
    /// Creates `root` if needed.
    pub fn new(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: Some(root.to_path_buf()),
        })
    }

    /// Create the entry described by `header`, pulling its data from `decode`.
    pub fn write_entry<R: Read>(&mut self, header: &Header, decode: &mut DecodeStage<R>) -> Result<()> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| ArchiveError::io("extract stage closed"))?;

        let kind = match header.field(FieldKey::TYP) {
            Some(FieldValue::UInt(code)) => EntryType::from_code(*code).ok_or_else(|| {
                ArchiveError::invalid_value(format!("unsupported entry type {}", code))
            })?,
            _ => return Err(ArchiveError::invalid_value("entry has no TYP field")),
        };
        let rel = match header.field(FieldKey::PAT) {
            Some(FieldValue::String(p)) => p.as_str(),
            _ => return Err(ArchiveError::invalid_value("entry has no PAT field")),
        };
        let target = root.join(safe_relative_path(rel)?);

        match kind {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                debug!(path = rel, "directory extracted");
            }
            EntryType::RegularFile => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut options = OpenOptions::new();
                options.write(true).create(true).truncate(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(OUTPUT_FILE_MODE);
                }
                let mut file = options.open(&target)?;
                let bytes = match header.field(FieldKey::DAT) {
                    Some(FieldValue::Blob { .. }) => decode.copy_blob(FieldKey::DAT, &mut file)?,
                    Some(_) => return Err(ArchiveError::invalid_value("DAT is not a blob")),
                    None => 0,
                };
                file.flush()?;
                debug!(path = rel, bytes, "file extracted");
            }
        }
        Ok(())
    }
}

impl Closable for ExtractStage {
    fn close(&mut self) -> Result<()> {
        self.root = None;
        Ok(())
    }
}

/// Reject absolute paths and anything that climbs out of the root.
fn safe_relative_path(rel: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for part in rel.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(ArchiveError::invalid_value(format!(
                    "path escapes destination: {}",
                    rel
                )))
            }
            p if Path::new(p)
                .components()
                .any(|c| !matches!(c, Component::Normal(_))) =>
            {
                return Err(ArchiveError::invalid_value(format!("unsafe path: {}", rel)))
            }
            p => out.push(p),
        }
    }
    if rel.starts_with('/') || out.as_os_str().is_empty() {
        return Err(ArchiveError::invalid_value(format!("unsafe path: {:?}", rel)));
    }
    Ok(out)
}

/// Move every entry from `decode` into `extract`. Returns the entry count.
pub fn process_entries<R: Read>(decode: &mut DecodeStage<R>, extract: &mut ExtractStage) -> Result<usize> {
    let mut count = 0;
    while let Some(header) = decode.read_header()? {
        extract.write_entry(&header, decode)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn encoder() -> (StageHandle<Vec<u8>>, EncodeStage<Vec<u8>>) {
        let sink = StageHandle::new(Vec::new());
        let stage = EncodeStage::new(sink.clone());
        (sink, stage)
    }

    fn decoder(bytes: Vec<u8>) -> DecodeStage<Cursor<Vec<u8>>> {
        DecodeStage::new(StageHandle::new(Cursor::new(bytes)))
    }

    fn file_header(path: &str, size: u64) -> Header {
        let mut h = Header::new();
        h.append(FieldKey::TYP, FieldValue::UInt(EntryType::RegularFile.code()));
        h.append(FieldKey::PAT, FieldValue::String(path.to_string()));
        h.append(FieldKey::DAT, FieldValue::Blob { size });
        h
    }

    #[test]
    fn headers_and_blobs_decode_in_order() -> Result<()> {
        let (sink, mut enc) = encoder();
        enc.write_header(&file_header("a.txt", 5))?;
        enc.write_blob(FieldKey::DAT, b"hello")?;
        enc.write_header(&file_header("b.txt", 3))?;
        enc.write_blob(FieldKey::DAT, b"abc")?;
        let bytes = sink.borrow().clone();

        let mut dec = decoder(bytes);
        let first = dec.read_header()?.expect("first entry");
        assert_eq!(first, file_header("a.txt", 5));
        let mut buf = [0u8; 5];
        dec.read_blob(FieldKey::DAT, &mut buf)?;
        assert_eq!(&buf, b"hello");

        // Unread blob of the second entry is skipped on the next read.
        let second = dec.read_header()?.expect("second entry");
        assert_eq!(second.field(FieldKey::PAT), Some(&FieldValue::String("b.txt".into())));
        assert!(dec.read_header()?.is_none());
        Ok(())
    }

    #[test]
    fn encoder_enforces_blob_order_and_size() {
        let (_sink, mut enc) = encoder();
        enc.write_header(&file_header("a", 4)).expect("header");

        assert!(enc.write_blob(FieldKey::PAT, b"abcd").is_err());
        assert!(enc.write_header(&file_header("b", 1)).is_err());
        assert!(enc.write_blob(FieldKey::DAT, b"abc").is_err());
    }

    #[test]
    fn truncated_header_is_a_format_error() {
        let bytes = file_header("a", 1).encode().expect("encode");
        let mut dec = decoder(bytes[..bytes.len() - 2].to_vec());
        assert!(matches!(dec.read_header(), Err(ArchiveError::Format(_))));

        let mut dec = decoder(b"XXXX".to_vec());
        assert!(matches!(dec.read_header(), Err(ArchiveError::Format(_))));
    }

    #[test]
    fn key_set_parsing() {
        let keys: KeySet = "TYP,PAT,DAT".parse().expect("parse");
        assert_eq!(keys, KeySet::directory_default());
        assert!("TYPE".parse::<KeySet>().is_err());
        assert!("".parse::<KeySet>().is_err());
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        for bad in ["../x", "a/../../x", "/etc/passwd", "", "."] {
            assert!(safe_relative_path(bad).is_err(), "{bad}");
        }
        assert_eq!(safe_relative_path("a/b/c.txt").unwrap(), PathBuf::from("a/b/c.txt"));
    }

    #[test]
    fn directory_round_trip_through_entries() -> Result<()> {
        let src = TempDir::new()?;
        fs::create_dir_all(src.path().join("nested/deeper"))?;
        fs::write(src.path().join("top.txt"), b"top")?;
        fs::write(src.path().join("nested/deeper/leaf.bin"), [1u8, 2, 3])?;
        fs::write(src.path().join("nested/empty.txt"), b"")?;

        let (sink, mut enc) = encoder();
        let written = enc.write_directory_contents(src.path(), &KeySet::directory_default())?;
        assert_eq!(written, 5);

        let dst = TempDir::new()?;
        let mut dec = decoder(sink.borrow().clone());
        let mut extract = ExtractStage::new(dst.path())?;
        assert_eq!(process_entries(&mut dec, &mut extract)?, 5);

        assert_eq!(fs::read(dst.path().join("top.txt"))?, b"top");
        assert_eq!(fs::read(dst.path().join("nested/deeper/leaf.bin"))?, [1u8, 2, 3]);
        assert!(fs::read(dst.path().join("nested/empty.txt"))?.is_empty());
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_names_are_skipped() -> Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let src = TempDir::new()?;
        fs::write(src.path().join("ok.txt"), b"kept")?;
        fs::write(src.path().join(OsStr::from_bytes(b"bad\xff.txt")), b"dropped")?;
        fs::create_dir_all(src.path().join(OsStr::from_bytes(b"dir\xfe")).join("inner"))?;

        let (sink, mut enc) = encoder();
        let written = enc.write_directory_contents(src.path(), &KeySet::directory_default())?;
        assert_eq!(written, 1);

        let mut dec = decoder(sink.borrow().clone());
        let header = dec.read_header()?.expect("entry");
        assert_eq!(header.field(FieldKey::PAT), Some(&FieldValue::String("ok.txt".into())));
        assert!(dec.read_header()?.is_none());
        Ok(())
    }

    #[test]
    fn key_set_limits_recorded_fields() -> Result<()> {
        let src = TempDir::new()?;
        fs::write(src.path().join("f.txt"), b"data")?;

        let (sink, mut enc) = encoder();
        let keys: KeySet = "TYP,PAT".parse()?;
        enc.write_directory_contents(src.path(), &keys)?;

        let mut dec = decoder(sink.borrow().clone());
        let header = dec.read_header()?.expect("entry");
        assert!(header.field(FieldKey::DAT).is_none());
        assert_eq!(header.len(), 2);
        Ok(())
    }

    #[test]
    fn extract_rejects_escaping_entry() -> Result<()> {
        let (sink, mut enc) = encoder();
        enc.write_header(&file_header("../evil.txt", 1))?;
        enc.write_blob(FieldKey::DAT, b"x")?;

        let dst = TempDir::new()?;
        let mut dec = decoder(sink.borrow().clone());
        let mut extract = ExtractStage::new(&dst.path().join("out"))?;
        assert!(matches!(
            process_entries(&mut dec, &mut extract),
            Err(ArchiveError::InvalidValue(_))
        ));
        assert!(!dst.path().join("evil.txt").exists());
        Ok(())
    }
}
