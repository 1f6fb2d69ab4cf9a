//! ABI decoding of store event log data.
//!
//! The table id is the first indexed topic; everything else lives in the log data:
//!
//! - `Store_SetRecord(bytes32[] keyTuple, bytes staticData, bytes32 encodedLengths, bytes dynamicData)`
//! - `Store_DeleteRecord(bytes32[] keyTuple)`
//! - `Store_SpliceStaticData(bytes32[] keyTuple, uint48 start, bytes data)`
//! - `Store_SpliceDynamicData(bytes32[] keyTuple, uint8 dynamicFieldIndex, uint48 start,
//!   uint40 deleteCount, bytes32 encodedLengths, bytes data)`

use crate::ledger::types::{LedgerError, StoreEventKind};
use crate::store::{RowKey, RowOp, raw_record};

const WORD: usize = 32;

struct AbiReader<'a> {
    data: &'a [u8],
}

impl<'a> AbiReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn word_at(&self, offset: usize) -> Result<&'a [u8], LedgerError> {
        offset
            .checked_add(WORD)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                LedgerError::MalformedLog(format!(
                    "word at offset {} out of bounds ({} bytes)",
                    offset,
                    self.data.len()
                ))
            })
    }

    fn uint_at(&self, offset: usize) -> Result<u64, LedgerError> {
        let word = self.word_at(offset)?;
        if word[..WORD - 8].iter().any(|b| *b != 0) {
            return Err(LedgerError::MalformedLog(format!(
                "integer at offset {} does not fit in 64 bits",
                offset
            )));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&word[WORD - 8..]);
        Ok(u64::from_be_bytes(bytes))
    }

    fn usize_at(&self, offset: usize) -> Result<usize, LedgerError> {
        usize::try_from(self.uint_at(offset)?)
            .map_err(|_| LedgerError::MalformedLog(format!("value at {} too large", offset)))
    }

    /// Head slot `index` as an unsigned integer.
    fn uint(&self, index: usize) -> Result<u64, LedgerError> {
        self.uint_at(index * WORD)
    }

    /// Head slot `index` as a raw 32-byte word.
    fn bytes32(&self, index: usize) -> Result<Vec<u8>, LedgerError> {
        self.word_at(index * WORD).map(<[u8]>::to_vec)
    }

    /// Dynamic `bytes` referenced by head slot `index`.
    fn bytes(&self, index: usize) -> Result<Vec<u8>, LedgerError> {
        let offset = self.usize_at(index * WORD)?;
        let len = self.usize_at(offset)?;
        let start = offset + WORD;
        start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                LedgerError::MalformedLog(format!("bytes at offset {} out of bounds", offset))
            })
    }

    /// Dynamic `bytes32[]` referenced by head slot `index`.
    fn bytes32_array(&self, index: usize) -> Result<Vec<[u8; 32]>, LedgerError> {
        let offset = self.usize_at(index * WORD)?;
        let len = self.usize_at(offset)?;
        (0..len)
            .map(|i| {
                let word = self.word_at(offset + WORD + i * WORD)?;
                let mut out = [0u8; 32];
                out.copy_from_slice(word);
                Ok(out)
            })
            .collect()
    }
}

/// Decode the key tuple and row operation of a store event.
pub fn decode_store_event(
    kind: StoreEventKind,
    data: &[u8],
) -> Result<(RowKey, RowOp), LedgerError> {
    let reader = AbiReader::new(data);
    let key = RowKey::from_words(reader.bytes32_array(0)?);

    let op = match kind {
        StoreEventKind::SetRecord => RowOp::Set(raw_record(
            reader.bytes(1)?,
            reader.bytes32(2)?,
            reader.bytes(3)?,
        )),
        StoreEventKind::DeleteRecord => RowOp::Delete,
        StoreEventKind::SpliceStaticData => RowOp::SpliceStatic {
            start: to_usize(reader.uint(1)?)?,
            data: reader.bytes(2)?,
        },
        StoreEventKind::SpliceDynamicData => RowOp::SpliceDynamic {
            // slot 1 is the dynamic field index, the start offset is already absolute
            start: to_usize(reader.uint(2)?)?,
            delete_count: to_usize(reader.uint(3)?)?,
            encoded_lengths: reader.bytes32(4)?,
            data: reader.bytes(5)?,
        },
    };
    op.check_bounds()
        .map_err(|e| LedgerError::MalformedLog(e.to_string()))?;

    Ok((key, op))
}

fn to_usize(value: u64) -> Result<usize, LedgerError> {
    usize::try_from(value).map_err(|_| LedgerError::MalformedLog(format!("{} too large", value)))
}
