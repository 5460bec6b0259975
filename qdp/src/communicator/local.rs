//! In-process worker group.
//!
//! Workers run on separate threads of one process and talk over a full mesh
//! of unbounded channels. Every frame carries the collective kind and a
//! per-communicator sequence number, so workers that issue different
//! collective sequences fail with `CollectiveFailed` instead of mixing
//! payloads. A worker that drops its communicator makes every pending
//! collective on its peers fail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::communicator::helpers::{ByteReader, CollectiveOp, frame, unframe};
use crate::communicator::stripe::stripe_columns;
use crate::communicator::{DistributedCommunicator, QuantizedCommunicator, WorkerDescriptor};
use crate::config::QdpConfig;
use crate::element::add_slice;
use crate::error::{QdpError, Result};
use crate::quantization::{FullPrecision, QuantizedColumns, Quantizer, quantizer_for};
use crate::tensor::{Tensor, matrix_cols, matrix_rows};
use crate::types::{Device, Rank, StorageFormat};

/// One worker's endpoint of an in-process group.
///
/// # Panics
///
/// Collectives block the calling thread until every peer has taken part.
/// Calling one from inside an async runtime context panics; run each worker
/// on its own thread (or under `tokio::task::spawn_blocking`).
pub struct LocalCommunicator {
    rank: Rank,
    world_size: u32,
    /// Indexed by destination rank; `None` for self.
    senders: Vec<Option<UnboundedSender<Vec<u8>>>>,
    /// Indexed by source rank; `None` for self.
    receivers: Vec<Option<Mutex<UnboundedReceiver<Vec<u8>>>>>,
    seq: AtomicU64,
    quantizer: Arc<dyn Quantizer>,
    quantize_self_stripe: bool,
}

impl LocalCommunicator {
    /// Form a group of `world_size` connected endpoints, one per rank.
    pub fn group(world_size: u32, config: &QdpConfig) -> Result<Vec<Self>> {
        let quantizer = quantizer_for(config)?;
        Self::group_with_quantizer(world_size, quantizer, config.quantize_self_stripe)
    }

    /// Form a group that quantizes with a caller-supplied quantizer.
    pub fn group_with_quantizer(
        world_size: u32,
        quantizer: Arc<dyn Quantizer>,
        quantize_self_stripe: bool,
    ) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(QdpError::configuration("world size must be at least 1"));
        }
        let n = world_size as usize;

        let mut senders: Vec<Vec<Option<UnboundedSender<Vec<u8>>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Mutex<UnboundedReceiver<Vec<u8>>>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();

        for src in 0..n {
            for dst in 0..n {
                if src == dst {
                    continue;
                }
                let (tx, rx) = unbounded_channel();
                senders[src][dst] = Some(tx);
                receivers[dst][src] = Some(Mutex::new(rx));
            }
        }

        Ok(senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| Self {
                rank: rank as Rank,
                world_size,
                senders,
                receivers,
                seq: AtomicU64::new(0),
                quantizer: Arc::clone(&quantizer),
                quantize_self_stripe,
            })
            .collect())
    }

    /// This endpoint's rank (0-indexed).
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of workers in the group.
    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    fn host_id(rank: Rank) -> String {
        format!("local-{rank}")
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, dest: usize, op: CollectiveOp, seq: u64, payload: &[u8]) -> Result<()> {
        let Some(tx) = self.senders.get(dest).and_then(Option::as_ref) else {
            return Err(QdpError::CollectiveFailed {
                operation: op.name(),
                rank: dest as Rank,
                reason: "no channel to peer".into(),
            });
        };
        tx.send(frame(op, seq, payload))
            .map_err(|_| QdpError::CollectiveFailed {
                operation: op.name(),
                rank: dest as Rank,
                reason: "peer disconnected".into(),
            })
    }

    fn recv(&self, src: usize, op: CollectiveOp, seq: u64) -> Result<Vec<u8>> {
        let Some(rx) = self.receivers.get(src).and_then(Option::as_ref) else {
            return Err(QdpError::CollectiveFailed {
                operation: op.name(),
                rank: src as Rank,
                reason: "no channel from peer".into(),
            });
        };
        let mut rx = rx.lock().map_err(|_| QdpError::CollectiveFailed {
            operation: op.name(),
            rank: src as Rank,
            reason: "receiver lock poisoned".into(),
        })?;
        let msg = rx
            .blocking_recv()
            .ok_or_else(|| QdpError::CollectiveFailed {
                operation: op.name(),
                rank: src as Rank,
                reason: "peer disconnected".into(),
            })?;
        unframe(msg, op, seq, src as Rank)
    }

    /// Every rank contributes one payload; returns all payloads indexed by rank.
    fn all_gather(&self, op: CollectiveOp, seq: u64, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let world = self.world_size as usize;
        let me = self.rank as usize;
        for dest in (0..world).filter(|&d| d != me) {
            self.send(dest, op, seq, &payload)?;
        }
        let mut gathered = Vec::with_capacity(world);
        for src in 0..world {
            if src == me {
                gathered.push(payload.clone());
            } else {
                gathered.push(self.recv(src, op, seq)?);
            }
        }
        Ok(gathered)
    }

    /// `payloads[j]` goes to rank `j`; returns what every rank sent to us.
    fn all_to_all(
        &self,
        op: CollectiveOp,
        seq: u64,
        mut payloads: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>> {
        let world = self.world_size as usize;
        let me = self.rank as usize;
        for (dest, payload) in payloads.iter().enumerate() {
            if dest != me {
                self.send(dest, op, seq, payload)?;
            }
        }
        let own = std::mem::take(&mut payloads[me]);
        let mut received = Vec::with_capacity(world);
        for src in 0..world {
            if src == me {
                received.push(own.clone());
            } else {
                received.push(self.recv(src, op, seq)?);
            }
        }
        Ok(received)
    }

    /// Only whole-group aggregation is implemented.
    fn check_workers(&self, workers: &[WorkerDescriptor], operation: &'static str) -> Result<()> {
        let mut ranks: Vec<Rank> = workers.iter().map(|w| w.global_rank).collect();
        ranks.sort_unstable();
        ranks.dedup();
        let full: Vec<Rank> = (0..self.world_size).collect();
        if ranks != full {
            return Err(QdpError::unsupported(
                operation,
                format!(
                    "sub-group {ranks:?} of a {}-worker group",
                    self.world_size
                ),
            ));
        }
        Ok(())
    }

    /// Exchange tensor counts and fail if any rank disagrees.
    fn check_counts(&self, op: CollectiveOp, gathered: &[Vec<u8>]) -> Result<Vec<usize>> {
        let mut counts = Vec::with_capacity(gathered.len());
        for (src, payload) in gathered.iter().enumerate() {
            counts.push(ByteReader::new(payload).read_u32()? as usize);
            if counts[src] != counts[0] {
                return Err(QdpError::CollectiveFailed {
                    operation: op.name(),
                    rank: src as Rank,
                    reason: format!(
                        "tensor count mismatch: rank 0 sent {}, rank {src} sent {}",
                        counts[0], counts[src]
                    ),
                });
            }
        }
        Ok(counts)
    }

    fn self_stripe_quantizer(&self, src: usize) -> &dyn Quantizer {
        if src == self.rank as usize && !self.quantize_self_stripe {
            &FullPrecision
        } else {
            self.quantizer.as_ref()
        }
    }

    fn quantized_aggregate_one(
        &self,
        seq: u64,
        gradient: &mut Tensor,
        residual: &mut Tensor,
        stripe_residual: &mut Option<Tensor>,
    ) -> Result<()> {
        let op = CollectiveOp::QuantizedScatter;
        if gradient.format() != StorageFormat::Dense {
            return Err(QdpError::unsupported(
                op.name(),
                "sparse block-column gradients cannot be quantized",
            ));
        }
        if residual.shape() != gradient.shape() {
            return Err(QdpError::ResidualMisaligned {
                reason: format!(
                    "residual shape {:?} does not match gradient shape {:?}",
                    residual.shape(),
                    gradient.shape()
                ),
            });
        }

        let world = self.world_size as usize;
        let me = self.rank as usize;
        let rows = gradient.rows();
        let cols = gradient.cols();

        // Quantize our contribution stripe by stripe, folding in the residual.
        let input = gradient.to_f64s()?;
        let mut carried = residual.to_f64s()?;
        let mut payloads = Vec::with_capacity(world);
        for dest in 0..world {
            let span = gradient.column_span(stripe_columns(cols, world, dest));
            let q = self
                .self_stripe_quantizer(dest)
                .quantize(&input[span.clone()], rows, &mut carried[span]);
            payloads.push(q.to_wire());
        }
        residual.set_f64s(&carried)?;

        let received = self.all_to_all(op, seq, payloads)?;

        // Reduce the stripe we own and re-quantize it against the stripe residual.
        let mine = stripe_columns(cols, world, me);
        let reduced = if mine.is_empty() {
            Vec::new()
        } else {
            let Some(stripe) = stripe_residual.as_mut() else {
                return Err(QdpError::ResidualMisaligned {
                    reason: format!("missing stripe residual for columns {mine:?}"),
                });
            };
            if stripe.numel() != rows * mine.len() {
                return Err(QdpError::ResidualMisaligned {
                    reason: format!(
                        "stripe residual shape {:?} does not cover {rows}x{} elements",
                        stripe.shape(),
                        mine.len()
                    ),
                });
            }

            let mut sum = vec![0.0; rows * mine.len()];
            let mut part = vec![0.0; rows * mine.len()];
            for (src, bytes) in received.iter().enumerate() {
                let q = QuantizedColumns::from_wire(bytes)?;
                self.self_stripe_quantizer(src).dequantize(&q, &mut part)?;
                for (s, p) in sum.iter_mut().zip(&part) {
                    *s += p;
                }
            }

            let mut stripe_carried = stripe.to_f64s()?;
            let q = self.quantizer.quantize(&sum, rows, &mut stripe_carried);
            stripe.set_f64s(&stripe_carried)?;
            q.to_wire()
        };

        // Every rank expands every stripe into the full aggregate.
        let gathered = self.all_gather(CollectiveOp::QuantizedGather, seq, reduced)?;
        let mut aggregate = vec![0.0; gradient.numel()];
        for (owner, bytes) in gathered.iter().enumerate() {
            let owned = stripe_columns(cols, world, owner);
            if owned.is_empty() {
                continue;
            }
            let q = QuantizedColumns::from_wire(bytes)?;
            if q.rows != rows || q.cols != owned.len() {
                return Err(QdpError::CollectiveFailed {
                    operation: op.name(),
                    rank: owner as Rank,
                    reason: format!(
                        "stripe is {}x{}, expected {rows}x{}",
                        q.rows,
                        q.cols,
                        owned.len()
                    ),
                });
            }
            let span = gradient.column_span(owned);
            self.quantizer.dequantize(&q, &mut aggregate[span])?;
        }
        gradient.set_f64s(&aggregate)
    }
}

impl DistributedCommunicator for LocalCommunicator {
    fn workers(&self) -> Vec<WorkerDescriptor> {
        (0..self.world_size)
            .map(|rank| WorkerDescriptor {
                global_rank: rank,
                host_id: Self::host_id(rank),
            })
            .collect()
    }

    fn current_worker(&self) -> WorkerDescriptor {
        WorkerDescriptor {
            global_rank: self.rank,
            host_id: Self::host_id(self.rank),
        }
    }

    fn aggregate_in_place(
        &self,
        tensors: &mut [&mut Tensor],
        workers: &[WorkerDescriptor],
    ) -> Result<()> {
        let op = CollectiveOp::Aggregate;
        self.check_workers(workers, op.name())?;
        for t in tensors.iter() {
            if t.format() != StorageFormat::Dense {
                return Err(QdpError::unsupported(
                    op.name(),
                    "exact aggregation takes dense tensors only",
                ));
            }
        }

        // Fuse every tensor into one buffer so the group exchanges once.
        let total: usize = tensors.iter().map(|t| t.as_bytes().len()).sum();
        let mut payload = Vec::with_capacity(4 + total);
        payload.extend_from_slice(&(tensors.len() as u32).to_le_bytes());
        for t in tensors.iter() {
            payload.extend_from_slice(t.as_bytes());
        }

        let seq = self.next_seq();
        let gathered = self.all_gather(op, seq, payload)?;
        self.check_counts(op, &gathered)?;
        for (src, bytes) in gathered.iter().enumerate() {
            if bytes.len() != 4 + total {
                return Err(QdpError::CollectiveFailed {
                    operation: op.name(),
                    rank: src as Rank,
                    reason: format!(
                        "payload of {} bytes, expected {}",
                        bytes.len() - 4,
                        total
                    ),
                });
            }
        }

        // Sum in rank order so every worker gets bit-identical results.
        let mut offset = 4;
        for t in tensors.iter_mut() {
            let len = t.as_bytes().len();
            let span = offset..offset + len;
            let mut sum = gathered[0][span.clone()].to_vec();
            for other in &gathered[1..] {
                add_slice(&mut sum, &other[span.clone()], t.numel(), t.dtype())?;
            }
            t.as_bytes_mut().copy_from_slice(&sum);
            offset += len;
        }
        Ok(())
    }

    fn sparse_aggregate_in_place(&self, tensors: &mut [&mut Tensor]) -> Result<()> {
        let op = CollectiveOp::SparseAggregate;
        let mut payload = Vec::new();
        payload.extend_from_slice(&(tensors.len() as u32).to_le_bytes());
        for t in tensors.iter() {
            let Some(columns) = t.sparse_columns() else {
                return Err(QdpError::unsupported(
                    op.name(),
                    "sparse aggregation takes sparse block-column tensors only",
                ));
            };
            if t.device() == Device::Cpu {
                return Err(QdpError::unsupported(
                    op.name(),
                    "sparse block-column tensors on the CPU",
                ));
            }
            payload.extend_from_slice(&(columns.len() as u32).to_le_bytes());
            for &col in columns {
                payload.extend_from_slice(&col.to_le_bytes());
            }
            for v in t.stored_f64s()? {
                payload.extend_from_slice(&v.to_le_bytes());
            }
        }

        let seq = self.next_seq();
        let gathered = self.all_gather(op, seq, payload)?;
        self.check_counts(op, &gathered)?;

        let mut readers: Vec<ByteReader<'_>> = gathered.iter().map(|b| ByteReader::new(b)).collect();
        for r in &mut readers {
            r.read_u32()?;
        }
        for t in tensors.iter_mut() {
            let rows = t.rows();
            let mut merged: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
            for r in &mut readers {
                let n = r.read_u32()? as usize;
                let mut ids = Vec::with_capacity(n);
                for _ in 0..n {
                    ids.push(r.read_u32()?);
                }
                for col in ids {
                    let column = merged.entry(col).or_insert_with(|| vec![0.0; rows]);
                    for v in column.iter_mut() {
                        *v += r.read_f64()?;
                    }
                }
            }
            t.set_sparse_columns(merged)?;
        }
        Ok(())
    }

    fn as_quantized(&self) -> Option<&dyn QuantizedCommunicator> {
        Some(self)
    }
}

impl QuantizedCommunicator for LocalCommunicator {
    fn quantization_bits(&self) -> u32 {
        self.quantizer.bits()
    }

    fn stripe_shape(&self, shape: &[usize]) -> Option<Vec<usize>> {
        let owned = stripe_columns(
            matrix_cols(shape),
            self.world_size as usize,
            self.rank as usize,
        );
        if owned.is_empty() {
            None
        } else {
            Some(vec![matrix_rows(shape), owned.len()])
        }
    }

    fn quantized_aggregate_in_place(
        &self,
        gradients: &mut [&mut Tensor],
        residuals: &mut [Tensor],
        stripe_residuals: &mut [Option<Tensor>],
        workers: &[WorkerDescriptor],
    ) -> Result<()> {
        let op = CollectiveOp::QuantizedBegin;
        self.check_workers(workers, op.name())?;
        if residuals.len() != gradients.len() || stripe_residuals.len() != gradients.len() {
            return Err(QdpError::ResidualMisaligned {
                reason: format!(
                    "{} gradients, {} residuals, {} stripe residuals",
                    gradients.len(),
                    residuals.len(),
                    stripe_residuals.len()
                ),
            });
        }

        let seq = self.next_seq();
        let count = (gradients.len() as u32).to_le_bytes().to_vec();
        let gathered = self.all_gather(op, seq, count)?;
        self.check_counts(op, &gathered)?;

        for ((gradient, residual), stripe) in gradients
            .iter_mut()
            .zip(residuals.iter_mut())
            .zip(stripe_residuals.iter_mut())
        {
            self.quantized_aggregate_one(seq, gradient, residual, stripe)?;
        }
        Ok(())
    }
}
