//! RoCEv2 queue pair: IB state machine, send/recv queues, PSN bookkeeping.
//! Grounded on `include/nic/rocev2/queue_pair.h`,
//! `src/rocev2/queue_pair.cpp`.

use std::collections::VecDeque;

use crate::rdma::types::{advance_psn, Handle, PathMtu, QpState};
use crate::rdma::wqe::{RecvWqe, SendWqe};

#[derive(Debug, Clone, Copy, Default)]
pub struct QpModifyParams {
    pub target_state: Option<QpState>,
    pub dest_qp: Option<Handle>,
    pub dest_ip: Option<[u8; 4]>,
    pub dest_port: Option<u16>,
    pub sq_psn: Option<u32>,
    pub rq_psn: Option<u32>,
    pub path_mtu: Option<PathMtu>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QpStats {
    pub local_errors: u64,
    pub sequence_errors: u64,
    pub remote_errors: u64,
}

pub struct RdmaQueuePair {
    pub qp_number: Handle,
    pub pd: Handle,
    pub send_cq: Handle,
    pub recv_cq: Handle,
    pub state: QpState,
    pub dest_qp: Handle,
    pub dest_ip: [u8; 4],
    pub dest_port: u16,
    pub path_mtu: PathMtu,
    pub sq_psn: u32,
    pub rq_psn: u32,
    pub last_acked_psn: u32,
    pub send_queue: VecDeque<SendWqe>,
    pub recv_queue: VecDeque<RecvWqe>,
    pub stats: QpStats,
}

impl RdmaQueuePair {
    pub fn new(qp_number: Handle, pd: Handle, send_cq: Handle, recv_cq: Handle) -> Self {
        Self {
            qp_number,
            pd,
            send_cq,
            recv_cq,
            state: QpState::Reset,
            dest_qp: 0,
            dest_ip: [0; 4],
            dest_port: crate::rdma::packet::ROCEV2_UDP_PORT,
            path_mtu: PathMtu::Mtu1024,
            sq_psn: 0,
            rq_psn: 0,
            last_acked_psn: 0,
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            stats: QpStats::default(),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, params))]
    pub fn modify(&mut self, params: QpModifyParams) -> bool {
        if let Some(target) = params.target_state {
            if !self.state.can_transition_to(target) {
                self.stats.local_errors += 1;
                tracing::warn!(qp = self.qp_number, from = ?self.state, to = ?target, "illegal qp transition");
                return false;
            }
        }
        if let Some(target) = params.target_state {
            self.state = target;
            if target == QpState::Reset {
                self.send_queue.clear();
                self.recv_queue.clear();
                self.sq_psn = 0;
                self.rq_psn = 0;
                self.last_acked_psn = 0;
            }
        }
        if let Some(v) = params.dest_qp {
            self.dest_qp = v;
        }
        if let Some(v) = params.dest_ip {
            self.dest_ip = v;
        }
        if let Some(v) = params.dest_port {
            self.dest_port = v;
        }
        if let Some(v) = params.sq_psn {
            self.sq_psn = v;
        }
        if let Some(v) = params.rq_psn {
            self.rq_psn = v;
        }
        if let Some(v) = params.path_mtu {
            self.path_mtu = v;
        }
        true
    }

    pub fn can_post_send(&self) -> bool {
        matches!(self.state, QpState::Init | QpState::Rtr | QpState::Rts)
    }

    pub fn can_post_recv(&self) -> bool {
        matches!(self.state, QpState::Init | QpState::Rtr | QpState::Rts)
    }

    pub fn next_send_psn(&mut self) -> u32 {
        let psn = self.sq_psn;
        self.sq_psn = advance_psn(self.sq_psn, 1);
        psn
    }

    pub fn advance_recv_psn(&mut self) {
        self.rq_psn = advance_psn(self.rq_psn, 1);
    }
}
