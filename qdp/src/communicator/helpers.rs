use crate::error::{QdpError, Result};
use crate::types::Rank;

/// Collective kinds carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CollectiveOp {
    Aggregate = 1,
    SparseAggregate = 2,
    QuantizedBegin = 3,
    QuantizedScatter = 4,
    QuantizedGather = 5,
}

impl CollectiveOp {
    pub(crate) fn name(self) -> &'static str {
        match self {
            CollectiveOp::Aggregate => "aggregate",
            CollectiveOp::SparseAggregate => "sparse_aggregate",
            CollectiveOp::QuantizedBegin
            | CollectiveOp::QuantizedScatter
            | CollectiveOp::QuantizedGather => "quantized_aggregate",
        }
    }
}

const HEADER_LEN: usize = 9;

/// Prefix `payload` with `[op:u8][seq:u64]`.
pub(crate) fn frame(op: CollectiveOp, seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(op as u8);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Strip and verify the header of a frame received from `src`.
pub(crate) fn unframe(mut msg: Vec<u8>, op: CollectiveOp, seq: u64, src: Rank) -> Result<Vec<u8>> {
    if msg.len() < HEADER_LEN {
        return Err(QdpError::CollectiveFailed {
            operation: op.name(),
            rank: src,
            reason: format!("truncated frame of {} bytes", msg.len()),
        });
    }
    let got_op = msg[0];
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&msg[1..HEADER_LEN]);
    let got_seq = u64::from_le_bytes(raw);
    if got_op != op as u8 || got_seq != seq {
        return Err(QdpError::CollectiveFailed {
            operation: op.name(),
            rank: src,
            reason: format!(
                "collective sequence mismatch: expected op {} seq {seq}, got op {got_op} seq {got_seq}",
                op as u8
            ),
        });
    }
    Ok(msg.split_off(HEADER_LEN))
}

/// Bounds-checked little-endian reader over a received payload.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(QdpError::BufferSizeMismatch {
                expected: end,
                actual: self.bytes.len(),
            });
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(raw))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}
