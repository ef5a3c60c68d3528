//! Reliability manager: per-QP pending-operation tracking, cumulative ACK
//! draining, NAK-driven retransmission, and timeout-driven retransmission.
//! Grounded on `include/nic/rocev2/queue_pair.h`'s `retry_count` /
//! `rnr_retry_count` / `timeout` fields and `src/rocev2/queue_pair.cpp`'s
//! pending-operation bookkeeping, generalized into a standalone component
//! per `engine.h`'s separate `reliability_manager_` field.

use std::collections::{HashMap, VecDeque};

use crate::rdma::packet::AethSyndrome;
use crate::rdma::types::{psn_in_window, Handle};
use crate::rdma::wqe::{WqeOpcode, WqeStatus};

#[derive(Debug, Clone, Copy)]
pub struct ReliabilityConfig {
    /// Retries allowed before a transport timeout becomes a fatal error.
    pub max_retries: u32,
    /// Retries allowed before an RNR NAK becomes a fatal error.
    pub rnr_retry_count: u32,
    /// Timeout exponent: timeout_us = 4 * 2^min(timeout_exponent + retries_used, 31).
    pub timeout_exponent: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: 7,
            rnr_retry_count: 7,
            timeout_exponent: 14,
        }
    }
}

/// One in-flight packet awaiting acknowledgment.
struct PendingOp {
    psn: u32,
    wr_id: u64,
    opcode: WqeOpcode,
    bytes: Vec<u8>,
    total_bytes: u32,
    /// Whether this op should surface a local CQE when it completes (set
    /// only on the last packet of a multi-packet SEND/WRITE; READ
    /// completions are instead driven directly by the READ response).
    emit_completion: bool,
    send_us: u64,
    retries_remaining: u32,
    rnr_retries_remaining: u32,
}

/// A SEND/WRITE operation whose cumulative ACK arrived; the engine turns
/// this into a local CQE.
#[derive(Debug, Clone, Copy)]
pub struct CompletedSend {
    pub wr_id: u64,
    pub opcode: WqeOpcode,
    pub total_bytes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct NakOutcome {
    pub retransmit: Option<RetransmitPacket>,
    pub error_status: Option<(u64, WqeOpcode, WqeStatus)>,
}

/// An owned packet queued for retransmission.
#[derive(Debug, Clone, Default)]
pub struct RetransmitPacket(pub Vec<u8>);

#[derive(Debug, Default, Clone, Copy)]
pub struct ReliabilityStats {
    pub acks_received: u64,
    pub naks_received: u64,
    pub rnr_retries: u64,
    pub retransmissions: u64,
    pub retry_exceeded: u64,
}

pub struct ReliabilityManager {
    cfg: ReliabilityConfig,
    pending: HashMap<Handle, VecDeque<PendingOp>>,
    stats: ReliabilityStats,
}

impl ReliabilityManager {
    pub fn new(cfg: ReliabilityConfig) -> Self {
        Self {
            cfg,
            pending: HashMap::new(),
            stats: ReliabilityStats::default(),
        }
    }

    pub fn stats(&self) -> ReliabilityStats {
        self.stats
    }

    pub fn pending_count(&self, qp: Handle) -> usize {
        self.pending.get(&qp).map(VecDeque::len).unwrap_or(0)
    }

    /// Registers one outstanding wire packet for retransmission/ack
    /// tracking.
    #[allow(clippy::too_many_arguments)]
    pub fn add_pending(
        &mut self,
        qp: Handle,
        psn: u32,
        wr_id: u64,
        opcode: WqeOpcode,
        bytes: Vec<u8>,
        total_bytes: u32,
        emit_completion: bool,
        send_us: u64,
    ) {
        self.pending.entry(qp).or_default().push_back(PendingOp {
            psn,
            wr_id,
            opcode,
            bytes,
            total_bytes,
            emit_completion,
            send_us,
            retries_remaining: self.cfg.max_retries,
            rnr_retries_remaining: self.cfg.rnr_retry_count,
        });
    }

    /// Drops the pending entry for one PSN without treating it as an ACK
    /// or error (used when READ responses carry their own completion
    /// signal instead of a separate `RcAck`).
    pub fn complete_exact(&mut self, qp: Handle, psn: u32) {
        if let Some(q) = self.pending.get_mut(&qp) {
            q.retain(|op| op.psn != psn);
        }
    }

    /// Cumulative ACK: drains every pending op whose PSN is at or before
    /// `ack_psn`, returning the ones that should surface a local CQE.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn process_ack(&mut self, qp: Handle, ack_psn: u32) -> Vec<CompletedSend> {
        self.stats.acks_received += 1;
        let mut completed = Vec::new();
        if let Some(q) = self.pending.get_mut(&qp) {
            while let Some(front) = q.front() {
                if psn_le(front.psn, ack_psn) {
                    let op = q.pop_front().unwrap();
                    if op.emit_completion {
                        completed.push(CompletedSend {
                            wr_id: op.wr_id,
                            opcode: op.opcode,
                            total_bytes: op.total_bytes,
                        });
                    }
                } else {
                    break;
                }
            }
        }
        completed
    }

    /// Handles a NAK syndrome for `qp`, returning whatever retransmission
    /// or fatal-error action should follow.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn process_nak(&mut self, qp: Handle, nak_psn: u32, syndrome: AethSyndrome) -> NakOutcome {
        self.stats.naks_received += 1;
        let Some(q) = self.pending.get_mut(&qp) else {
            return NakOutcome::default();
        };
        match syndrome {
            AethSyndrome::RnrNak => {
                self.stats.rnr_retries += 1;
                let Some(front) = q.front_mut() else {
                    return NakOutcome::default();
                };
                if front.rnr_retries_remaining > 0 {
                    front.rnr_retries_remaining -= 1;
                    NakOutcome {
                        retransmit: Some(RetransmitPacket(front.bytes.clone())),
                        error_status: None,
                    }
                } else {
                    let op = q.pop_front().unwrap();
                    self.stats.retry_exceeded += 1;
                    NakOutcome {
                        retransmit: None,
                        error_status: Some((op.wr_id, op.opcode, WqeStatus::RnrRetryExceeded)),
                    }
                }
            }
            AethSyndrome::PsnSeqError => {
                self.stats.retransmissions += 1;
                if let Some(op) = q.iter().find(|o| o.psn == nak_psn) {
                    NakOutcome {
                        retransmit: Some(RetransmitPacket(op.bytes.clone())),
                        error_status: None,
                    }
                } else {
                    NakOutcome::default()
                }
            }
            AethSyndrome::InvalidRequest | AethSyndrome::RemoteAccessError | AethSyndrome::RemoteOpError => {
                let status = match syndrome {
                    AethSyndrome::InvalidRequest => WqeStatus::RemoteInvalidRequestError,
                    AethSyndrome::RemoteAccessError => WqeStatus::RemoteAccessError,
                    _ => WqeStatus::RemoteOperationError,
                };
                if let Some(op) = q.pop_front() {
                    NakOutcome {
                        retransmit: None,
                        error_status: Some((op.wr_id, op.opcode, status)),
                    }
                } else {
                    NakOutcome::default()
                }
            }
            AethSyndrome::Ack => NakOutcome::default(),
        }
    }

    /// Checks every pending op for `qp` against `now_us`, returning wire
    /// bytes that need to be resent and `(wr_id, opcode, status)` for ops
    /// whose retry budget was exhausted.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn check_timeouts(
        &mut self,
        qp: Handle,
        now_us: u64,
    ) -> (Vec<RetransmitPacket>, Vec<(u64, WqeOpcode, WqeStatus)>) {
        let mut retransmits = Vec::new();
        let mut exceeded = Vec::new();
        let Some(q) = self.pending.get_mut(&qp) else {
            return (retransmits, exceeded);
        };
        let mut i = 0;
        while i < q.len() {
            let retries_used = self.cfg.max_retries.saturating_sub(q[i].retries_remaining);
            let shift = (self.cfg.timeout_exponent + retries_used).min(31);
            let timeout_us = 4u64.saturating_mul(1u64 << shift);
            if now_us.saturating_sub(q[i].send_us) >= timeout_us {
                if q[i].retries_remaining > 0 {
                    q[i].retries_remaining -= 1;
                    q[i].send_us = now_us;
                    retransmits.push(RetransmitPacket(q[i].bytes.clone()));
                    self.stats.retransmissions += 1;
                    i += 1;
                } else {
                    let op = q.remove(i).unwrap();
                    self.stats.retry_exceeded += 1;
                    exceeded.push((op.wr_id, op.opcode, WqeStatus::TransportRetryExceeded));
                }
            } else {
                i += 1;
            }
        }
        (retransmits, exceeded)
    }

    /// Drops the pending entry matching `wr_id` without treating it as an
    /// ACK or error (used when a READ's local completion is driven by the
    /// response payload itself rather than a separate `RcAck`).
    pub fn complete_by_wr_id(&mut self, qp: Handle, wr_id: u64) {
        if let Some(q) = self.pending.get_mut(&qp) {
            q.retain(|op| op.wr_id != wr_id);
        }
    }

    /// Drops all pending state for a QP (on QP reset/destroy).
    pub fn clear_qp(&mut self, qp: Handle) {
        self.pending.remove(&qp);
    }
}

/// `true` if `a` is at or before `b` in cumulative (non-wrapping-past-
/// half-the-space) PSN order.
fn psn_le(a: u32, b: u32) -> bool {
    a == b || psn_in_window(b, a, 0x0080_0000)
}
