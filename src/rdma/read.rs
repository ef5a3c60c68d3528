//! READ request/response processor. Grounded on
//! `include/nic/rocev2/rdma_read.h` (no matching `.cpp` shipped; built
//! from the header's contract plus SPEC_FULL.md §4.11).

use std::collections::HashMap;

use crate::dma::DmaEngine;
use crate::host_memory::HostMemory;
use crate::rdma::mr::MemoryRegionTable;
use crate::rdma::packet::{build_packet, Aeth, AethSyndrome, Bth, RdmaOpcode, Reth};
use crate::rdma::qp::RdmaQueuePair;
use crate::rdma::types::Handle;
use crate::rdma::wqe::{Cqe, CqeOpcode, SendWqe, WqeStatus};
use crate::sgl::{Sgl, SglCursor};

/// Requester-side state for an outstanding READ, keyed by QP number.
struct ReadRequestState {
    wr_id: u64,
    sgl: Sgl,
    cursor: SglCursor,
    lkey: Handle,
    expected_psn: u32,
    total: u32,
    bytes_received: u32,
}

#[derive(Default)]
pub struct ReadProcessor {
    requests: HashMap<Handle, ReadRequestState>,
}

impl ReadProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates the single READ_REQUEST packet for one READ WQE.
    #[tracing::instrument(level = "trace", skip(self, qp, wqe))]
    pub fn generate_read_request(&mut self, qp: &mut RdmaQueuePair, wqe: &SendWqe) -> Vec<u8> {
        let total = wqe.sgl.total_len() as u32;
        let psn = qp.next_send_psn();
        self.requests.insert(
            qp.qp_number,
            ReadRequestState {
                wr_id: wqe.wr_id,
                sgl: wqe.sgl.clone(),
                cursor: SglCursor::default(),
                lkey: wqe.lkey,
                expected_psn: psn,
                total,
                bytes_received: 0,
            },
        );
        let bth = Bth {
            opcode: RdmaOpcode::RcReadRequest,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key: 0xFFFF,
            fecn: false,
            becn: false,
            dest_qp: qp.dest_qp,
            ack_request: true,
            psn,
        };
        let reth = Reth {
            virtual_address: wqe.remote_addr,
            rkey: wqe.rkey,
            dma_length: total,
        };
        build_packet(bth, Some(reth), None, None, &[])
    }

    /// Responder side: validates the rkey and fragments the response
    /// across `mtu_bytes`. Returns the generated RESPONSE packets, or an
    /// empty vector plus an ACK-less NAK on validation failure (the
    /// caller is expected to synthesize the NAK via the reliability
    /// manager's normal path).
    #[tracing::instrument(level = "trace", skip(self, qp, mem, dma, mrs))]
    pub fn generate_read_response(
        &mut self,
        qp: &RdmaQueuePair,
        request_psn: u32,
        reth: Reth,
        mem: &HostMemory,
        dma: &mut DmaEngine,
        mrs: &mut MemoryRegionTable,
        mtu_bytes: u32,
    ) -> Result<Vec<Vec<u8>>, ()> {
        if mrs
            .validate_rkey(reth.rkey, qp.pd, reth.virtual_address, reth.dma_length as u64, false)
            .is_err()
        {
            return Err(());
        }
        let total = reth.dma_length;
        let packet_count = total.div_ceil(mtu_bytes).max(1);
        let mut out = Vec::with_capacity(packet_count as usize);
        let mut offset = 0u32;
        for i in 0..packet_count {
            let is_first = i == 0;
            let is_last = i == packet_count - 1;
            let take = if is_last { total - offset } else { mtu_bytes };
            let mut payload = vec![0u8; take as usize];
            if dma
                .read(mem, reth.virtual_address + offset as u64, &mut payload)
                .is_err()
            {
                return Err(());
            }
            let opcode = match (is_first, is_last) {
                (true, true) => RdmaOpcode::RcReadResponseOnly,
                (true, false) => RdmaOpcode::RcReadResponseFirst,
                (false, true) => RdmaOpcode::RcReadResponseLast,
                (false, false) => RdmaOpcode::RcReadResponseMiddle,
            };
            let aeth = if opcode.has_aeth() {
                Some(Aeth { syndrome: AethSyndrome::Ack, msn: 0 })
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
                psn: request_psn.wrapping_add(i) & crate::rdma::types::PSN_MASK,
            };
            out.push(build_packet(bth, None, aeth, None, &payload));
            offset += take;
        }
        Ok(out)
    }

    /// Requester side: handles one RESPONSE packet, scattering it into
    /// the local SGL via real host-memory writes. Returns a CQE once the
    /// read is fully received.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "trace", skip(self, qp, mem, dma, mrs, payload))]
    pub fn process_read_response(
        &mut self,
        qp: &RdmaQueuePair,
        opcode: RdmaOpcode,
        psn: u32,
        payload: &[u8],
        mem: &mut HostMemory,
        dma: &mut DmaEngine,
        mrs: &mut MemoryRegionTable,
    ) -> Option<Cqe> {
        let state = self.requests.get_mut(&qp.qp_number)?;
        if psn != state.expected_psn {
            return None;
        }
        let lkey = state.lkey;
        let spans = state.cursor.advance(&state.sgl, payload.len() as u32)?;
        let mut offset = 0usize;
        for (addr, len) in spans {
            mrs.validate_lkey(lkey, addr, len as u64, true).ok()?;
            dma.write(mem, addr, &payload[offset..offset + len as usize]).ok()?;
            offset += len as usize;
        }
        let state = self.requests.get_mut(&qp.qp_number)?;
        state.bytes_received += payload.len() as u32;
        state.expected_psn = state.expected_psn.wrapping_add(1) & crate::rdma::types::PSN_MASK;
        if opcode.is_last_or_only() {
            let state = self.requests.remove(&qp.qp_number)?;
            Some(Cqe {
                wr_id: state.wr_id,
                qp_number: qp.qp_number,
                opcode: CqeOpcode::Read,
                status: WqeStatus::Success,
                bytes_transferred: state.total,
                immediate: None,
            })
        } else {
            None
        }
    }

    /// Drops outstanding requester state for a QP (e.g. on QP reset).
    pub fn clear_qp(&mut self, qp_number: Handle) {
        self.requests.remove(&qp_number);
    }
}
