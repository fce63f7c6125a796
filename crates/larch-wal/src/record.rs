//! Log record wire format.
//!
//! A record on disk is `length (4) | lsn (8) | prev_lsn (8) | payload |
//! checksum (8)`. The checksum covers everything before it. An EOF record
//! has a zero-length payload and marks the logical end of a log file.

use bytes::{Buf, BufMut, Bytes};

use larch_common::constants::LOG_RECORD_OVERHEAD;
use larch_common::Lsn;

use crate::error::{LogError, LogResult};

/// A materialised log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// LSN of this record.
    pub lsn: Lsn,
    /// LSN of the preceding record in log order (not the transaction
    /// chain; that lives inside the payload envelope).
    pub prev_lsn: Lsn,
    /// Record payload; empty for EOF records.
    pub data: Bytes,
}

impl LogRecord {
    /// Total on-disk size of this record.
    pub fn stored_length(&self) -> usize {
        LOG_RECORD_OVERHEAD + self.data.len()
    }

    /// Returns true if this is an EOF marker record.
    pub fn is_eof(&self) -> bool {
        self.data.is_empty()
    }
}

/// Total on-disk size of a record with a payload of `data_len` bytes.
pub fn stored_length(data_len: usize) -> usize {
    LOG_RECORD_OVERHEAD + data_len
}

/// Serialises a record into `out`, returning the number of bytes written.
///
/// The caller guarantees `out` has room for `stored_length(data.len())`
/// bytes.
pub fn encode(out: &mut [u8], lsn: Lsn, prev_lsn: Lsn, data: &[u8]) -> usize {
    let reclen = stored_length(data.len());
    debug_assert!(out.len() >= reclen);
    {
        let mut buf = &mut out[..reclen];
        buf.put_u32(reclen as u32);
        buf.put_slice(&lsn.to_be_bytes());
        buf.put_slice(&prev_lsn.to_be_bytes());
        buf.put_slice(data);
    }
    let checksum = checksum_of(&out[..reclen - 8]);
    (&mut out[reclen - 8..reclen]).put_u64(checksum);
    reclen
}

/// Parses and validates a record expected to carry LSN `expect_lsn`.
///
/// Fails with [`LogError::Corrupt`] on a checksum mismatch, or when the
/// stored LSN does not match the expected one (a stale record left over
/// from a previous use of the file).
pub fn decode(expect_lsn: Lsn, raw: &[u8]) -> LogResult<LogRecord> {
    if raw.len() < LOG_RECORD_OVERHEAD {
        return Err(LogError::corrupt(expect_lsn, "record truncated"));
    }
    let mut buf = &raw[..];
    let reclen = buf.get_u32() as usize;
    if reclen < LOG_RECORD_OVERHEAD || reclen > raw.len() {
        return Err(LogError::corrupt(expect_lsn, "invalid record length"));
    }
    let mut lsn_bytes = [0u8; 8];
    buf.copy_to_slice(&mut lsn_bytes);
    let lsn = Lsn::from_be_bytes(lsn_bytes);
    buf.copy_to_slice(&mut lsn_bytes);
    let prev_lsn = Lsn::from_be_bytes(lsn_bytes);

    let data_len = reclen - LOG_RECORD_OVERHEAD;
    let data = Bytes::copy_from_slice(&buf[..data_len]);
    buf.advance(data_len);
    let stored_checksum = buf.get_u64();

    let computed = checksum_of(&raw[..reclen - 8]);
    if stored_checksum != computed {
        return Err(LogError::corrupt(expect_lsn, "checksum mismatch"));
    }
    if lsn != expect_lsn {
        return Err(LogError::corrupt(
            expect_lsn,
            format!("record carries LSN {}", lsn),
        ));
    }
    Ok(LogRecord { lsn, prev_lsn, data })
}

/// CRC32 over the record bytes, widened into the 8-byte checksum slot.
fn checksum_of(bytes: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    u64::from(hasher.finalize())
}

/// Header at the start of every online log file: the owning group's id
/// and the logical index of the log file currently stored there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFileHeader {
    /// Group id character.
    pub group_id: char,
    /// Logical log file index.
    pub index: u32,
}

impl LogFileHeader {
    /// Serialized size: group id (2) + index (4).
    pub const SIZE: usize = 6;

    /// Encodes the header.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.group_id as u16);
        buf.put_u32(self.index);
    }

    /// Decodes a header.
    pub fn decode(buf: &mut impl Buf) -> LogResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(LogError::anchor_corrupt("log file header truncated"));
        }
        let raw_id = buf.get_u16();
        let group_id = char::from_u32(u32::from(raw_id))
            .ok_or_else(|| LogError::anchor_corrupt("log file header has invalid group id"))?;
        let index = buf.get_u32();
        Ok(Self { group_id, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let lsn = Lsn::new(1, 6);
        let prev = Lsn::NULL;
        let data = b"hello, larch";
        let mut out = vec![0u8; stored_length(data.len())];
        let n = encode(&mut out, lsn, prev, data);
        assert_eq!(n, out.len());

        let rec = decode(lsn, &out).unwrap();
        assert_eq!(rec.lsn, lsn);
        assert_eq!(rec.prev_lsn, prev);
        assert_eq!(rec.data.as_ref(), data);
        assert!(!rec.is_eof());
    }

    #[test]
    fn test_eof_record() {
        let lsn = Lsn::new(2, 100);
        let mut out = vec![0u8; LOG_RECORD_OVERHEAD];
        encode(&mut out, lsn, Lsn::new(2, 50), &[]);
        let rec = decode(lsn, &out).unwrap();
        assert!(rec.is_eof());
        assert_eq!(rec.stored_length(), LOG_RECORD_OVERHEAD);
    }

    #[test]
    fn test_checksum_detects_flip() {
        let lsn = Lsn::new(1, 6);
        let mut out = vec![0u8; stored_length(4)];
        encode(&mut out, lsn, Lsn::NULL, b"data");
        out[21] ^= 0xff;
        assert!(matches!(
            decode(lsn, &out),
            Err(LogError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_lsn_mismatch_detected() {
        let lsn = Lsn::new(1, 6);
        let mut out = vec![0u8; stored_length(4)];
        encode(&mut out, lsn, Lsn::NULL, b"data");
        assert!(decode(Lsn::new(1, 7), &out).is_err());
    }

    #[test]
    fn test_file_header_roundtrip() {
        let hdr = LogFileHeader {
            group_id: 'a',
            index: 42,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), LogFileHeader::SIZE);
        let decoded = LogFileHeader::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, hdr);
    }
}
