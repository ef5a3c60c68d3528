//! RDMA engine facade: owns the PD/MR/QP/CQ tables and every per-operation
//! processor, dispatches incoming packets by opcode, and drains send
//! queues into wire packets. Grounded on
//! `include/nic/rocev2/engine.h` (no matching `.cpp` shipped; built from
//! the header's contract plus SPEC_FULL.md §4.14).

use std::collections::HashMap;

use crate::dma::DmaEngine;
use crate::host_memory::HostMemory;
use crate::rdma::congestion::{CongestionManager, DcqcnConfig};
use crate::rdma::cq::RdmaCompletionQueue;
use crate::rdma::mr::{MemoryRegionTable, MrError};
use crate::rdma::packet::{parse_packet, RdmaOpcode};
use crate::rdma::pd::ProtectionDomainTable;
use crate::rdma::qp::{QpModifyParams, RdmaQueuePair};
use crate::rdma::read::ReadProcessor;
use crate::rdma::reliability::{ReliabilityConfig, ReliabilityManager};
use crate::rdma::send_recv::SendRecvProcessor;
use crate::rdma::types::{Handle, PathMtu, QpState};
use crate::rdma::wqe::{Cqe, CqeOpcode, RecvWqe, SendWqe, WqeOpcode, WqeStatus};
use crate::rdma::write::WriteProcessor;

#[derive(Debug, Clone, Copy)]
pub struct RdmaEngineConfig {
    pub max_pds: usize,
    pub max_mrs: usize,
    pub max_qps: usize,
    pub max_cqs: usize,
    pub default_cq_depth: usize,
    pub mtu: PathMtu,
    pub dcqcn: DcqcnConfig,
    pub reliability: ReliabilityConfig,
}

impl Default for RdmaEngineConfig {
    fn default() -> Self {
        Self {
            max_pds: 64,
            max_mrs: 256,
            max_qps: 256,
            max_cqs: 256,
            default_cq_depth: 256,
            mtu: PathMtu::Mtu1024,
            dcqcn: DcqcnConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    PdTableFull,
    PdInvalid,
    QpTableFull,
    QpNotFound,
    CqTableFull,
    CqNotFound,
    InvalidQpState,
    Mr(MrError),
}

impl From<MrError> for EngineError {
    fn from(e: MrError) -> Self {
        EngineError::Mr(e)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RdmaEngineStats {
    pub packets_processed: u64,
    pub icrc_errors: u64,
    pub unknown_qp: u64,
}

/// One packet ready to hand to the fabric (a [`crate::router::Router`] in
/// end-to-end tests).
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub data: Vec<u8>,
    pub dest_ip: [u8; 4],
    pub dest_port: u16,
    pub src_port: u16,
}

pub struct RdmaEngine {
    cfg: RdmaEngineConfig,
    pds: ProtectionDomainTable,
    mrs: MemoryRegionTable,
    qps: HashMap<Handle, RdmaQueuePair>,
    next_qp: Handle,
    cqs: HashMap<Handle, RdmaCompletionQueue>,
    next_cq: Handle,
    send_recv: SendRecvProcessor,
    write: WriteProcessor,
    read: ReadProcessor,
    congestion: CongestionManager,
    reliability: ReliabilityManager,
    current_time_us: u64,
    stats: RdmaEngineStats,
}

impl RdmaEngine {
    pub fn new(cfg: RdmaEngineConfig) -> Self {
        Self {
            mrs: MemoryRegionTable::new(cfg.max_mrs),
            congestion: CongestionManager::new(cfg.dcqcn),
            reliability: ReliabilityManager::new(cfg.reliability),
            cfg,
            pds: ProtectionDomainTable::new(),
            qps: HashMap::new(),
            next_qp: 1,
            cqs: HashMap::new(),
            next_cq: 1,
            send_recv: SendRecvProcessor::new(),
            write: WriteProcessor::new(),
            read: ReadProcessor::new(),
            current_time_us: 0,
            stats: RdmaEngineStats::default(),
        }
    }

    pub fn stats(&self) -> RdmaEngineStats {
        self.stats
    }

    pub fn reliability_stats(&self) -> crate::rdma::reliability::ReliabilityStats {
        self.reliability.stats()
    }

    pub fn congestion_stats(&self) -> crate::rdma::congestion::CongestionStats {
        self.congestion.stats()
    }

    pub fn qp(&self, qp: Handle) -> Option<&RdmaQueuePair> {
        self.qps.get(&qp)
    }

    // -- Resource management -------------------------------------------

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn create_pd(&mut self) -> Result<Handle, EngineError> {
        if self.pds.count() >= self.cfg.max_pds {
            return Err(EngineError::PdTableFull);
        }
        Ok(self.pds.allocate())
    }

    pub fn destroy_pd(&mut self, pd: Handle) -> bool {
        self.pds.deallocate(pd)
    }

    pub fn create_cq(&mut self, depth: Option<usize>) -> Result<Handle, EngineError> {
        if self.cqs.len() >= self.cfg.max_cqs {
            return Err(EngineError::CqTableFull);
        }
        let handle = self.next_cq;
        self.next_cq += 1;
        self.cqs.insert(handle, RdmaCompletionQueue::new(depth.unwrap_or(self.cfg.default_cq_depth)));
        Ok(handle)
    }

    pub fn destroy_cq(&mut self, cq: Handle) -> bool {
        self.cqs.remove(&cq).is_some()
    }

    pub fn poll_cq(&mut self, cq: Handle) -> Option<Cqe> {
        self.cqs.get_mut(&cq)?.poll()
    }

    pub fn arm_cq(&mut self, cq: Handle) -> bool {
        match self.cqs.get_mut(&cq) {
            Some(q) => {
                q.arm();
                true
            }
            None => false,
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn create_mr(
        &mut self,
        pd: Handle,
        va: u64,
        length: u64,
        access: crate::rdma::types::MrAccess,
    ) -> Result<(Handle, Handle), EngineError> {
        if !self.pds.is_valid(pd) {
            return Err(EngineError::PdInvalid);
        }
        Ok(self.mrs.register(pd, va, length, access)?)
    }

    pub fn deregister_mr(&mut self, lkey: Handle) -> bool {
        self.mrs.deregister(lkey)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn create_qp(&mut self, pd: Handle, send_cq: Handle, recv_cq: Handle) -> Result<Handle, EngineError> {
        if !self.pds.is_valid(pd) {
            return Err(EngineError::PdInvalid);
        }
        if !self.cqs.contains_key(&send_cq) || !self.cqs.contains_key(&recv_cq) {
            return Err(EngineError::CqNotFound);
        }
        if self.qps.len() >= self.cfg.max_qps {
            return Err(EngineError::QpTableFull);
        }
        let handle = self.next_qp;
        self.next_qp += 1;
        let qp = RdmaQueuePair::new(handle, pd, send_cq, recv_cq);
        self.qps.insert(handle, qp);
        Ok(handle)
    }

    pub fn destroy_qp(&mut self, qp: Handle) -> bool {
        self.send_recv.clear_qp(qp);
        self.write.clear_qp(qp);
        self.read.clear_qp(qp);
        self.reliability.clear_qp(qp);
        self.qps.remove(&qp).is_some()
    }

    pub fn modify_qp(&mut self, qp: Handle, params: QpModifyParams) -> Result<(), EngineError> {
        let entering_reset = params.target_state == Some(QpState::Reset);
        let qp_ref = self.qps.get_mut(&qp).ok_or(EngineError::QpNotFound)?;
        if !qp_ref.modify(params) {
            return Err(EngineError::InvalidQpState);
        }
        if entering_reset {
            self.send_recv.clear_qp(qp);
            self.write.clear_qp(qp);
            self.read.clear_qp(qp);
            self.reliability.clear_qp(qp);
        }
        Ok(())
    }

    pub fn post_send(&mut self, qp: Handle, wqe: SendWqe) -> Result<(), EngineError> {
        let qp_ref = self.qps.get_mut(&qp).ok_or(EngineError::QpNotFound)?;
        if !qp_ref.can_post_send() {
            return Err(EngineError::InvalidQpState);
        }
        qp_ref.send_queue.push_back(wqe);
        Ok(())
    }

    pub fn post_recv(&mut self, qp: Handle, wqe: RecvWqe) -> Result<(), EngineError> {
        let qp_ref = self.qps.get_mut(&qp).ok_or(EngineError::QpNotFound)?;
        if !qp_ref.can_post_recv() {
            return Err(EngineError::InvalidQpState);
        }
        qp_ref.recv_queue.push_back(wqe);
        Ok(())
    }

    fn cqe_opcode(op: WqeOpcode) -> CqeOpcode {
        match op {
            WqeOpcode::Send | WqeOpcode::SendWithImm => CqeOpcode::Send,
            WqeOpcode::Write | WqeOpcode::WriteWithImm => CqeOpcode::Write,
            WqeOpcode::Read => CqeOpcode::Read,
        }
    }

    fn post_to_cq(&mut self, cq: Handle, cqe: Cqe) {
        if let Some(q) = self.cqs.get_mut(&cq) {
            q.post(cqe);
        }
    }

    // -- Packet dispatch --------------------------------------------------

    /// Parses and dispatches one received RoCEv2 payload. Returns any
    /// packets the dispatch generated (ACKs, NAKs, READ responses, CNPs).
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "trace", skip(self, mem, dma, data))]
    pub fn process_incoming_packet(
        &mut self,
        mem: &mut HostMemory,
        dma: &mut DmaEngine,
        data: &[u8],
    ) -> Vec<OutgoingPacket> {
        let mut out = Vec::new();
        let parsed = match parse_packet(data) {
            Ok(p) => p,
            Err(crate::rdma::packet::PacketError::IcrcMismatch) => {
                self.stats.icrc_errors += 1;
                return out;
            }
            Err(_) => return out,
        };
        self.stats.packets_processed += 1;
        let qp_number = parsed.bth.dest_qp;
        let Some(mtu_bytes) = self.qps.get(&qp_number).map(|qp| qp.path_mtu.bytes()) else {
            self.stats.unknown_qp += 1;
            return out;
        };
        let (dest_ip, dest_port) = {
            let qp_ref = self.qps.get(&qp_number).unwrap();
            (qp_ref.dest_ip, qp_ref.dest_port)
        };

        if parsed.bth.fecn {
            let peer = self.qps.get(&qp_number).unwrap().dest_qp;
            if let Some(cnp) = self.congestion.generate_cnp(peer, qp_number, self.current_time_us) {
                out.push(OutgoingPacket { data: cnp, dest_ip, dest_port, src_port: 0 });
            }
        }

        match parsed.bth.opcode {
            RdmaOpcode::SendFirst
            | RdmaOpcode::SendMiddle
            | RdmaOpcode::SendLast
            | RdmaOpcode::SendLastImm
            | RdmaOpcode::SendOnly
            | RdmaOpcode::SendOnlyImm => {
                let qp_ref = self.qps.get_mut(&qp_number).unwrap();
                let (cqe, needs_ack, syndrome) = self.send_recv.process_recv_packet(
                    qp_ref,
                    parsed.bth.opcode,
                    parsed.bth.psn,
                    &parsed.payload,
                    parsed.immediate,
                    mem,
                    dma,
                    &mut self.mrs,
                );
                let recv_cq = qp_ref.recv_cq;
                let rq_psn = qp_ref.rq_psn;
                if let Some(cqe) = cqe {
                    self.post_to_cq(recv_cq, cqe);
                }
                if needs_ack {
                    let ack = SendRecvProcessor::generate_ack(
                        self.qps.get(&qp_number).unwrap().dest_qp,
                        parsed.bth.psn,
                        syndrome,
                        rq_psn,
                    );
                    out.push(OutgoingPacket { data: ack, dest_ip, dest_port, src_port: 0 });
                }
            }
            RdmaOpcode::RcWriteFirst
            | RdmaOpcode::RcWriteMiddle
            | RdmaOpcode::RcWriteLast
            | RdmaOpcode::RcWriteLastImm
            | RdmaOpcode::RcWriteOnly
            | RdmaOpcode::RcWriteOnlyImm => {
                let qp_ref = self.qps.get_mut(&qp_number).unwrap();
                let (cqe, needs_ack, syndrome) = self.write.process_write_packet(
                    qp_ref,
                    parsed.bth.opcode,
                    parsed.reth,
                    parsed.immediate,
                    &parsed.payload,
                    mem,
                    dma,
                    &mut self.mrs,
                );
                let recv_cq = qp_ref.recv_cq;
                let rq_psn = qp_ref.rq_psn;
                if let Some(cqe) = cqe {
                    self.post_to_cq(recv_cq, cqe);
                }
                if needs_ack {
                    let ack = SendRecvProcessor::generate_ack(
                        self.qps.get(&qp_number).unwrap().dest_qp,
                        parsed.bth.psn,
                        syndrome,
                        rq_psn,
                    );
                    out.push(OutgoingPacket { data: ack, dest_ip, dest_port, src_port: 0 });
                }
            }
            RdmaOpcode::RcReadRequest => {
                let Some(reth) = parsed.reth else { return out };
                let qp_ref = self.qps.get(&qp_number).unwrap();
                match self.read.generate_read_response(qp_ref, parsed.bth.psn, reth, mem, dma, &mut self.mrs, mtu_bytes) {
                    Ok(packets) => {
                        for p in packets {
                            out.push(OutgoingPacket { data: p, dest_ip, dest_port, src_port: 0 });
                        }
                    }
                    Err(()) => {
                        let nak = SendRecvProcessor::generate_ack(
                            qp_ref.dest_qp,
                            parsed.bth.psn,
                            crate::rdma::packet::AethSyndrome::RemoteAccessError,
                            0,
                        );
                        out.push(OutgoingPacket { data: nak, dest_ip, dest_port, src_port: 0 });
                    }
                }
            }
            RdmaOpcode::RcReadResponseFirst
            | RdmaOpcode::RcReadResponseMiddle
            | RdmaOpcode::RcReadResponseLast
            | RdmaOpcode::RcReadResponseOnly => {
                let qp_ref = self.qps.get(&qp_number).unwrap();
                if let Some(cqe) = self.read.process_read_response(
                    qp_ref,
                    parsed.bth.opcode,
                    parsed.bth.psn,
                    &parsed.payload,
                    mem,
                    dma,
                    &mut self.mrs,
                ) {
                    self.reliability.complete_by_wr_id(qp_number, cqe.wr_id);
                    let send_cq = qp_ref.send_cq;
                    self.post_to_cq(send_cq, cqe);
                }
            }
            RdmaOpcode::RcAck => {
                let Some(aeth) = parsed.aeth else { return out };
                if aeth.syndrome == crate::rdma::packet::AethSyndrome::Ack {
                    let completed = self.reliability.process_ack(qp_number, parsed.bth.psn);
                    let send_cq = self.qps.get(&qp_number).unwrap().send_cq;
                    for c in completed {
                        self.post_to_cq(
                            send_cq,
                            Cqe {
                                wr_id: c.wr_id,
                                qp_number,
                                opcode: Self::cqe_opcode(c.opcode),
                                status: WqeStatus::Success,
                                bytes_transferred: c.total_bytes,
                                immediate: None,
                            },
                        );
                    }
                } else {
                    let outcome = self.reliability.process_nak(qp_number, parsed.bth.psn, aeth.syndrome);
                    if let Some(retransmit) = outcome.retransmit {
                        out.push(OutgoingPacket { data: retransmit.0, dest_ip, dest_port, src_port: 0 });
                    }
                    if let Some((wr_id, opcode, status)) = outcome.error_status {
                        let send_cq = self.qps.get(&qp_number).unwrap().send_cq;
                        if let Some(qp_ref) = self.qps.get_mut(&qp_number) {
                            qp_ref.state = QpState::Error;
                        }
                        self.post_to_cq(
                            send_cq,
                            Cqe {
                                wr_id,
                                qp_number,
                                opcode: Self::cqe_opcode(opcode),
                                status,
                                bytes_transferred: 0,
                                immediate: None,
                            },
                        );
                    }
                }
            }
            RdmaOpcode::Cnp => {
                self.congestion.handle_cnp_received(qp_number, self.current_time_us);
            }
        }
        out
    }

    /// Drains every send-queue WQE posted on an `Rts` queue pair, generating
    /// wire packets and registering them with the reliability manager for
    /// retransmission tracking.
    #[tracing::instrument(level = "trace", skip(self, mem, dma))]
    pub fn generate_outgoing_packets(&mut self, mem: &HostMemory, dma: &mut DmaEngine) -> Vec<OutgoingPacket> {
        let mut out = Vec::new();
        let qp_numbers: Vec<Handle> = self
            .qps
            .iter()
            .filter(|(_, qp)| qp.state == QpState::Rts)
            .map(|(&n, _)| n)
            .collect();
        for qp_number in qp_numbers {
            let mtu_bytes = self.qps.get(&qp_number).unwrap().path_mtu.bytes();
            loop {
                let Some(qp_ref) = self.qps.get_mut(&qp_number) else { break };
                let Some(wqe) = qp_ref.send_queue.pop_front() else { break };
                let dest_ip = qp_ref.dest_ip;
                let dest_port = qp_ref.dest_port;
                let start_psn = qp_ref.sq_psn;
                let cqe_opcode = Self::cqe_opcode(wqe.opcode);

                let packets = match wqe.opcode {
                    WqeOpcode::Send | WqeOpcode::SendWithImm => {
                        self.send_recv.generate_send(qp_ref, &wqe, mem, dma, &mut self.mrs, mtu_bytes)
                    }
                    WqeOpcode::Write | WqeOpcode::WriteWithImm => {
                        self.write.generate_write(qp_ref, &wqe, mem, dma, &mut self.mrs, mtu_bytes)
                    }
                    WqeOpcode::Read => vec![self.read.generate_read_request(qp_ref, &wqe)],
                };

                if packets.is_empty() {
                    let send_cq = qp_ref.send_cq;
                    self.post_to_cq(
                        send_cq,
                        Cqe {
                            wr_id: wqe.wr_id,
                            qp_number,
                            opcode: cqe_opcode,
                            status: WqeStatus::LocalProtectionError,
                            bytes_transferred: 0,
                            immediate: None,
                        },
                    );
                    continue;
                }

                let total_bytes = wqe.sgl.total_len() as u32;
                let count = packets.len();
                for (i, packet) in packets.into_iter().enumerate() {
                    let psn = crate::rdma::types::advance_psn(start_psn, i as u32);
                    let last = i == count - 1;
                    self.reliability.add_pending(
                        qp_number,
                        psn,
                        wqe.wr_id,
                        wqe.opcode,
                        packet.clone(),
                        total_bytes,
                        last && !matches!(wqe.opcode, WqeOpcode::Read),
                        self.current_time_us,
                    );
                    out.push(OutgoingPacket { data: packet, dest_ip, dest_port, src_port: 0 });
                }
            }
        }
        out
    }

    /// Advances the engine's internal clock, driving congestion recovery
    /// and reliability timeouts. Returns any retransmitted packets.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn advance_time(&mut self, elapsed_us: u64) -> Vec<OutgoingPacket> {
        self.current_time_us += elapsed_us;
        self.congestion.advance_time(self.current_time_us);
        let mut out = Vec::new();
        let qp_numbers: Vec<Handle> = self.qps.keys().copied().collect();
        for qp_number in qp_numbers {
            let (dest_ip, dest_port) = {
                let qp_ref = self.qps.get(&qp_number).unwrap();
                (qp_ref.dest_ip, qp_ref.dest_port)
            };
            let (retransmits, exceeded) = self.reliability.check_timeouts(qp_number, self.current_time_us);
            for retransmit in retransmits {
                out.push(OutgoingPacket { data: retransmit.0, dest_ip, dest_port, src_port: 0 });
            }
            if !exceeded.is_empty() {
                if let Some(qp_ref) = self.qps.get_mut(&qp_number) {
                    qp_ref.state = QpState::Error;
                }
                let send_cq = self.qps.get(&qp_number).unwrap().send_cq;
                for (wr_id, opcode, status) in exceeded {
                    self.post_to_cq(
                        send_cq,
                        Cqe {
                            wr_id,
                            qp_number,
                            opcode: Self::cqe_opcode(opcode),
                            status,
                            bytes_transferred: 0,
                            immediate: None,
                        },
                    );
                }
            }
        }
        out
    }
}
