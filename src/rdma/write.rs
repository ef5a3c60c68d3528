//! One-sided WRITE processor. Grounded on
//! `include/nic/rocev2/rdma_write.h` (no matching `.cpp` shipped; built
//! from the header's contract plus SPEC_FULL.md §4.10).

use std::collections::HashMap;

use crate::dma::DmaEngine;
use crate::host_memory::HostMemory;
use crate::rdma::mr::MemoryRegionTable;
use crate::rdma::packet::{build_packet, AethSyndrome, Bth, RdmaOpcode, Reth};
use crate::rdma::qp::RdmaQueuePair;
use crate::rdma::types::Handle;
use crate::rdma::wqe::{Cqe, CqeOpcode, SendWqe, WqeStatus};
use crate::sgl::SglCursor;

struct WriteRecvState {
    base_va: u64,
    total: u32,
    bytes_written: u32,
    immediate: Option<u32>,
}

#[derive(Default)]
pub struct WriteProcessor {
    recv_state: HashMap<Handle, WriteRecvState>,
}

fn opcode_for(is_first: bool, is_last: bool, has_imm: bool) -> RdmaOpcode {
    match (is_first, is_last, has_imm) {
        (true, true, false) => RdmaOpcode::RcWriteOnly,
        (true, true, true) => RdmaOpcode::RcWriteOnlyImm,
        (true, false, _) => RdmaOpcode::RcWriteFirst,
        (false, false, _) => RdmaOpcode::RcWriteMiddle,
        (false, true, false) => RdmaOpcode::RcWriteLast,
        (false, true, true) => RdmaOpcode::RcWriteLastImm,
    }
}

impl WriteProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "trace", skip(self, qp, wqe, mem, dma, mrs))]
    pub fn generate_write(
        &mut self,
        qp: &mut RdmaQueuePair,
        wqe: &SendWqe,
        mem: &HostMemory,
        dma: &mut DmaEngine,
        mrs: &mut MemoryRegionTable,
        mtu_bytes: u32,
    ) -> Vec<Vec<u8>> {
        let total = wqe.sgl.total_len() as u32;
        let packet_count = total.div_ceil(mtu_bytes).max(1);
        let mut out = Vec::with_capacity(packet_count as usize);
        let mut cursor = SglCursor::default();
        let mut remote_offset = 0u32;
        for i in 0..packet_count {
            let is_first = i == 0;
            let is_last = i == packet_count - 1;
            let take = if is_last { total - i * mtu_bytes } else { mtu_bytes };
            let has_imm = is_last && wqe.immediate.is_some();
            let opcode = opcode_for(is_first, is_last, has_imm);
            let Some(spans) = cursor.advance(&wqe.sgl, take) else {
                break;
            };
            let mut payload = Vec::with_capacity(take as usize);
            for (addr, len) in spans {
                if mrs.validate_lkey(wqe.lkey, addr, len as u64, false).is_err() {
                    return Vec::new();
                }
                let mut chunk = vec![0u8; len as usize];
                if dma.read(mem, addr, &mut chunk).is_err() {
                    return Vec::new();
                }
                payload.extend_from_slice(&chunk);
            }
            let psn = qp.next_send_psn();
            let reth = if opcode.has_reth() {
                Some(Reth {
                    virtual_address: wqe.remote_addr + remote_offset as u64,
                    rkey: wqe.rkey,
                    dma_length: total,
                })
            } else {
                None
            };
            let bth = Bth {
                opcode,
                solicited_event: false,
                mig_req: false,
                pad_count: 0,
                transport_version: 0,
                partition_key: 0xFFFF,
                fecn: false,
                becn: false,
                dest_qp: qp.dest_qp,
                ack_request: is_last,
                psn,
            };
            let imm = if has_imm { wqe.immediate } else { None };
            out.push(build_packet(bth, reth, None, imm, &payload));
            remote_offset += take;
        }
        out
    }

    /// Processes a received WRITE packet, writing the payload directly to
    /// host memory via `rkey`. Returns `(cqe_if_immediate, needs_ack,
    /// ack_syndrome)`.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "trace", skip(self, qp, mem, dma, mrs, payload))]
    pub fn process_write_packet(
        &mut self,
        qp: &mut RdmaQueuePair,
        opcode: RdmaOpcode,
        reth: Option<Reth>,
        immediate: Option<u32>,
        payload: &[u8],
        mem: &mut HostMemory,
        dma: &mut DmaEngine,
        mrs: &mut MemoryRegionTable,
    ) -> (Option<Cqe>, bool, AethSyndrome) {
        let offset_in_message = if opcode.has_reth() {
            let reth = reth.expect("opcode carries RETH");
            if mrs
                .validate_rkey(reth.rkey, qp.pd, reth.virtual_address, reth.dma_length as u64, true)
                .is_err()
            {
                qp.stats.remote_errors += 1;
                return (None, true, AethSyndrome::RemoteAccessError);
            }
            self.recv_state.insert(
                qp.qp_number,
                WriteRecvState {
                    base_va: reth.virtual_address,
                    total: reth.dma_length,
                    bytes_written: 0,
                    immediate,
                },
            );
            0u32
        } else if self.recv_state.contains_key(&qp.qp_number) {
            self.recv_state
                .get(&qp.qp_number)
                .map(|s| s.bytes_written)
                .unwrap_or(0)
        } else {
            return (None, true, AethSyndrome::InvalidRequest);
        };

        let base_va = self
            .recv_state
            .get(&qp.qp_number)
            .map(|s| s.base_va)
            .unwrap_or(0);
        if dma.write(mem, base_va + offset_in_message as u64, payload).is_err() {
            return (None, true, AethSyndrome::RemoteAccessError);
        }

        if let Some(state) = self.recv_state.get_mut(&qp.qp_number) {
            state.bytes_written += payload.len() as u32;
        }

        qp.advance_recv_psn();

        if opcode.is_last_or_only() {
            let state = self.recv_state.remove(&qp.qp_number);
            let cqe = state.and_then(|s| {
                s.immediate.map(|imm| Cqe {
                    wr_id: 0,
                    qp_number: qp.qp_number,
                    opcode: CqeOpcode::Write,
                    status: WqeStatus::Success,
                    bytes_transferred: s.bytes_written,
                    immediate: Some(imm),
                })
            });
            (cqe, true, AethSyndrome::Ack)
        } else {
            (None, false, AethSyndrome::Ack)
        }
    }

    /// Drops in-progress WRITE state for a QP (e.g. on QP reset).
    pub fn clear_qp(&mut self, qp_number: Handle) {
        self.recv_state.remove(&qp_number);
    }
}
