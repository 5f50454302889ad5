//! Single-blob envelope for raw data payloads.
//!
//! ```text
//! Header{PAT="data", TYP='F', DAT=blob(N)} followed by N bytes
//! ```
//!
//! Only `DAT` is interpreted on read. A missing `DAT`, a `DAT` that is not a
//! blob, and a zero-length `DAT` are all rejected as invalid values.

use crate::archive::{DecodeStage, EncodeStage, EntryType, FieldKey, FieldValue, Header};
use crate::error::{ArchiveError, Result};
use std::io::{Read, Write};
use tracing::debug;

/// Value of the `PAT` field.
pub const ENVELOPE_PATH: &str = "data";

const ENVELOPE_LAYOUT: [FieldKey; 3] = [FieldKey::PAT, FieldKey::TYP, FieldKey::DAT];

/// Envelope header for a payload of `len` bytes.
pub fn envelope_header(len: u64) -> Header {
    let mut header = Header::new();
    header.append(FieldKey::PAT, FieldValue::String(ENVELOPE_PATH.to_string()));
    header.append(FieldKey::TYP, FieldValue::UInt(EntryType::RegularFile.code()));
    header.append(FieldKey::DAT, FieldValue::Blob { size: len });
    header
}

fn check_layout(header: &Header) -> Result<()> {
    if !header.keys().eq(ENVELOPE_LAYOUT) {
        return Err(ArchiveError::invalid_value(
            "envelope header must be exactly PAT, TYP, DAT",
        ));
    }
    Ok(())
}

/// Write `data` as a single envelope.
pub fn write_envelope<W: Write>(encode: &mut EncodeStage<W>, data: &[u8]) -> Result<()> {
    let header = envelope_header(data.len() as u64);
    check_layout(&header)?;
    encode.write_header(&header)?;
    encode.write_blob(FieldKey::DAT, data)?;
    debug!(bytes = data.len(), "envelope written");
    Ok(())
}

/// Read the payload of the next envelope.
pub fn read_envelope<R: Read>(decode: &mut DecodeStage<R>) -> Result<Vec<u8>> {
    let header = decode
        .read_header()?
        .ok_or_else(|| ArchiveError::invalid_value("stream holds no envelope"))?;

    let size = match header.field(FieldKey::DAT) {
        Some(FieldValue::Blob { size }) if *size > 0 => *size,
        Some(FieldValue::Blob { .. }) => {
            return Err(ArchiveError::invalid_value("DAT blob is empty"))
        }
        Some(_) => return Err(ArchiveError::invalid_value("DAT is not a blob")),
        None => return Err(ArchiveError::invalid_value("envelope has no DAT field")),
    };

    let len = usize::try_from(size)
        .map_err(|_| ArchiveError::invalid_value(format!("DAT size {} too large", size)))?;
    let mut data = vec![0u8; len];
    decode.read_blob(FieldKey::DAT, &mut data)?;
    debug!(bytes = len, "envelope read");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::StageHandle;
    use std::io::Cursor;

    fn encoded(build: impl FnOnce(&mut EncodeStage<Vec<u8>>) -> Result<()>) -> Vec<u8> {
        let sink = StageHandle::new(Vec::new());
        let mut encode = EncodeStage::new(sink.clone());
        build(&mut encode).expect("encode");
        let bytes = sink.borrow().clone();
        bytes
    }

    fn decode(bytes: Vec<u8>) -> Result<Vec<u8>> {
        let mut stage = DecodeStage::new(StageHandle::new(Cursor::new(bytes)));
        read_envelope(&mut stage)
    }

    #[test]
    fn envelope_round_trip() {
        let bytes = encoded(|e| write_envelope(e, b"payload bytes"));
        assert_eq!(decode(bytes).expect("decode"), b"payload bytes");
    }

    #[test]
    fn header_layout_is_fixed() {
        let header = envelope_header(9);
        assert!(header.keys().eq(ENVELOPE_LAYOUT));
        assert_eq!(
            header.field(FieldKey::PAT),
            Some(&FieldValue::String("data".into()))
        );
        assert_eq!(header.field(FieldKey::TYP), Some(&FieldValue::UInt(b'F' as u64)));
        assert_eq!(header.field(FieldKey::DAT), Some(&FieldValue::Blob { size: 9 }));
    }

    #[test]
    fn zero_length_dat_is_invalid() {
        let bytes = encoded(|e| write_envelope(e, b""));
        assert!(matches!(decode(bytes), Err(ArchiveError::InvalidValue(_))));
    }

    #[test]
    fn missing_dat_is_invalid() {
        let bytes = encoded(|e| {
            let mut header = Header::new();
            header.append(FieldKey::PAT, FieldValue::String("data".into()));
            header.append(FieldKey::TYP, FieldValue::UInt(EntryType::RegularFile.code()));
            e.write_header(&header)
        });
        assert!(matches!(decode(bytes), Err(ArchiveError::InvalidValue(_))));
    }

    #[test]
    fn non_blob_dat_is_invalid() {
        let bytes = encoded(|e| {
            let mut header = Header::new();
            header.append(FieldKey::DAT, FieldValue::UInt(12));
            e.write_header(&header)
        });
        assert!(matches!(decode(bytes), Err(ArchiveError::InvalidValue(_))));
    }

    #[test]
    fn only_dat_is_required_on_read() {
        let bytes = encoded(|e| {
            let mut header = Header::new();
            header.append(FieldKey::DAT, FieldValue::Blob { size: 3 });
            e.write_header(&header)?;
            e.write_blob(FieldKey::DAT, b"xyz")
        });
        assert_eq!(decode(bytes).expect("decode"), b"xyz");
    }

    #[test]
    fn empty_stream_is_invalid() {
        assert!(matches!(decode(Vec::new()), Err(ArchiveError::InvalidValue(_))));
    }
}
