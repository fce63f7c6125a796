//! The transactional log-record envelope.
//!
//! Every log record written through the transaction manager carries this
//! envelope inside the WAL payload: the owning transaction, the module
//! that knows how to redo/undo it, category flags, the per-transaction
//! previous LSN, the undo-next LSN for compensation records, and the
//! primary page id. The module-specific payload is opaque here; each
//! module serialises its own tagged enum.

use bytes::{Buf, BufMut, Bytes};

use larch_common::{Lsn, PageId, PageNumber, TxnId};

use crate::error::{TxnError, TxnResult};

/// Module id of the transaction manager's own records (commit, abort,
/// checkpoint).
pub const TXN_MODULE_ID: u8 = 0;

bitflags::bitflags! {
    /// Log record categories.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        /// Describes a forward page change.
        const REDO = 0b0000_0001;
        /// Has an undo handler.
        const UNDO = 0b0000_0010;
        /// Compensation record: redone, never undone.
        const CLR = 0b0000_0100;
        /// Undo is logical; the key's page may have moved.
        const LOGICAL_UNDO = 0b0000_1000;
        /// Redo applies to several declared pages.
        const MULTI_PAGE = 0b0001_0000;
    }
}

/// A transactional log record.
#[derive(Debug, Clone)]
pub struct TxRecord {
    /// LSN, known once the record has been appended or read back.
    pub lsn: Lsn,
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Module that owns the payload.
    pub module_id: u8,
    /// Record categories.
    pub flags: RecordFlags,
    /// Previous record of the same transaction.
    pub prev_lsn: Lsn,
    /// For compensation records: next record to undo.
    pub undo_next_lsn: Lsn,
    /// Primary page the record applies to.
    pub page_id: PageId,
    /// Module-specific payload.
    pub payload: Bytes,
}

impl TxRecord {
    /// Creates a record ready for `log_insert`; the transaction manager
    /// stamps `txn_id` and `prev_lsn`.
    pub fn new(module_id: u8, flags: RecordFlags, page_id: PageId, payload: Bytes) -> Self {
        Self {
            lsn: Lsn::NULL,
            txn_id: TxnId::INVALID,
            module_id,
            flags,
            prev_lsn: Lsn::NULL,
            undo_next_lsn: Lsn::NULL,
            page_id,
            payload,
        }
    }

    /// True for compensation records.
    pub fn is_clr(&self) -> bool {
        self.flags.contains(RecordFlags::CLR)
    }

    /// True for records with an undo handler.
    pub fn is_undoable(&self) -> bool {
        self.flags.contains(RecordFlags::UNDO) && !self.is_clr()
    }

    /// True for records that change pages forward.
    pub fn is_redoable(&self) -> bool {
        self.flags.contains(RecordFlags::REDO)
    }

    /// Serialises the envelope and payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(34 + self.payload.len());
        buf.put_u64(self.txn_id.as_u64());
        buf.put_u8(self.module_id);
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.prev_lsn.to_be_bytes());
        buf.put_slice(&self.undo_next_lsn.to_be_bytes());
        buf.put_u32(self.page_id.container_id());
        buf.put_u32(self.page_id.page_number().as_u32());
        buf.put_slice(&self.payload);
        buf
    }

    /// Parses an envelope read back from the log at `lsn`.
    pub fn decode(lsn: Lsn, mut data: &[u8]) -> TxnResult<Self> {
        if data.len() < 34 {
            return Err(TxnError::bad_record("envelope truncated"));
        }
        let txn_id = TxnId::new(data.get_u64());
        let module_id = data.get_u8();
        let flags = RecordFlags::from_bits_truncate(data.get_u8());
        let mut raw = [0u8; 8];
        data.copy_to_slice(&mut raw);
        let prev_lsn = Lsn::from_be_bytes(raw);
        data.copy_to_slice(&mut raw);
        let undo_next_lsn = Lsn::from_be_bytes(raw);
        let container_id = data.get_u32();
        let page_number = PageNumber::new(data.get_u32());
        let payload = Bytes::copy_from_slice(data);
        Ok(Self {
            lsn,
            txn_id,
            module_id,
            flags,
            prev_lsn,
            undo_next_lsn,
            page_id: PageId::new(container_id, page_number),
            payload,
        })
    }
}

/// Payloads of the transaction manager's own records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnPayload {
    /// Transaction committed.
    Commit,
    /// Transaction rolled back to completion.
    Abort,
    /// Checkpoint: active transactions and the dirty page table.
    Checkpoint {
        /// Active transactions with their first and last LSNs.
        active: Vec<(TxnId, Lsn, Lsn)>,
        /// Dirty pages keyed by first-dirty LSN.
        dirty: Vec<(PageId, Lsn)>,
    },
}

impl TxnPayload {
    const TAG_COMMIT: u8 = 1;
    const TAG_ABORT: u8 = 2;
    const TAG_CHECKPOINT: u8 = 3;

    /// Serialises the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        match self {
            TxnPayload::Commit => buf.put_u8(Self::TAG_COMMIT),
            TxnPayload::Abort => buf.put_u8(Self::TAG_ABORT),
            TxnPayload::Checkpoint { active, dirty } => {
                buf.put_u8(Self::TAG_CHECKPOINT);
                buf.put_u32(active.len() as u32);
                for (txn, first, last) in active {
                    buf.put_u64(txn.as_u64());
                    buf.put_slice(&first.to_be_bytes());
                    buf.put_slice(&last.to_be_bytes());
                }
                buf.put_u32(dirty.len() as u32);
                for (page, lsn) in dirty {
                    buf.put_u32(page.container_id());
                    buf.put_u32(page.page_number().as_u32());
                    buf.put_slice(&lsn.to_be_bytes());
                }
            }
        }
        Bytes::from(buf)
    }

    /// Parses a payload.
    pub fn decode(mut data: &[u8]) -> TxnResult<Self> {
        if data.is_empty() {
            return Err(TxnError::bad_record("empty transaction payload"));
        }
        let tag = data.get_u8();
        match tag {
            Self::TAG_COMMIT => Ok(TxnPayload::Commit),
            Self::TAG_ABORT => Ok(TxnPayload::Abort),
            Self::TAG_CHECKPOINT => {
                let n_active = data.get_u32() as usize;
                let mut active = Vec::with_capacity(n_active);
                let mut raw = [0u8; 8];
                for _ in 0..n_active {
                    let txn = TxnId::new(data.get_u64());
                    data.copy_to_slice(&mut raw);
                    let first = Lsn::from_be_bytes(raw);
                    data.copy_to_slice(&mut raw);
                    let last = Lsn::from_be_bytes(raw);
                    active.push((txn, first, last));
                }
                let n_dirty = data.get_u32() as usize;
                let mut dirty = Vec::with_capacity(n_dirty);
                for _ in 0..n_dirty {
                    let container = data.get_u32();
                    let page = PageNumber::new(data.get_u32());
                    data.copy_to_slice(&mut raw);
                    let lsn = Lsn::from_be_bytes(raw);
                    dirty.push((PageId::new(container, page), lsn));
                }
                Ok(TxnPayload::Checkpoint { active, dirty })
            }
            other => Err(TxnError::bad_record(format!(
                "unknown transaction payload tag {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let mut rec = TxRecord::new(
            4,
            RecordFlags::REDO | RecordFlags::UNDO | RecordFlags::LOGICAL_UNDO,
            PageId::new(1, PageNumber::new(2)),
            Bytes::from_static(b"payload"),
        );
        rec.txn_id = TxnId::new(9);
        rec.prev_lsn = Lsn::new(1, 40);
        rec.undo_next_lsn = Lsn::new(1, 6);

        let bytes = rec.encode();
        let decoded = TxRecord::decode(Lsn::new(2, 80), &bytes).unwrap();
        assert_eq!(decoded.lsn, Lsn::new(2, 80));
        assert_eq!(decoded.txn_id, rec.txn_id);
        assert_eq!(decoded.module_id, 4);
        assert_eq!(decoded.flags, rec.flags);
        assert_eq!(decoded.prev_lsn, rec.prev_lsn);
        assert_eq!(decoded.undo_next_lsn, rec.undo_next_lsn);
        assert_eq!(decoded.page_id, rec.page_id);
        assert_eq!(decoded.payload.as_ref(), b"payload");
        assert!(decoded.is_undoable());
        assert!(!decoded.is_clr());
    }

    #[test]
    fn test_clr_is_never_undoable() {
        let rec = TxRecord::new(
            4,
            RecordFlags::REDO | RecordFlags::CLR | RecordFlags::UNDO,
            PageId::NULL,
            Bytes::new(),
        );
        assert!(rec.is_clr());
        assert!(!rec.is_undoable());
        assert!(rec.is_redoable());
    }

    #[test]
    fn test_txn_payload_roundtrip() {
        for payload in [
            TxnPayload::Commit,
            TxnPayload::Abort,
            TxnPayload::Checkpoint {
                active: vec![(TxnId::new(3), Lsn::new(1, 6), Lsn::new(1, 99))],
                dirty: vec![(PageId::new(1, PageNumber::new(2)), Lsn::new(1, 6))],
            },
        ] {
            let bytes = payload.encode();
            let decoded = TxnPayload::decode(&bytes).unwrap();
            assert_eq!(decoded, payload);
        }
    }
}
