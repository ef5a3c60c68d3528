//! DCQCN congestion manager: ECN→CNP generation and per-flow rate
//! reaction. Grounded on `include/nic/rocev2/congestion.h` (no matching
//! `.cpp` shipped; built from the header's contract plus SPEC_FULL.md
//! §4.12).

use std::collections::HashMap;

use crate::rdma::packet::{build_packet, Bth, RdmaOpcode};
use crate::rdma::types::Handle;

#[derive(Debug, Clone, Copy)]
pub struct DcqcnConfig {
    pub initial_rate_mbps: u32,
    pub min_rate_mbps: u32,
    pub alpha_g: f64,
    pub rate_increase_period_us: u64,
    pub alpha_update_period_us: u64,
    pub cnp_timer_us: u64,
    pub enabled: bool,
}

impl Default for DcqcnConfig {
    fn default() -> Self {
        Self {
            initial_rate_mbps: 100_000,
            min_rate_mbps: 1_000,
            alpha_g: 1.0 / 256.0,
            rate_increase_period_us: 300,
            alpha_update_period_us: 300,
            cnp_timer_us: 50,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FlowState {
    rate_mbps: u32,
    target_rate_mbps: u32,
    alpha: f64,
    last_cnp_us: u64,
    last_increase_us: u64,
    last_alpha_us: u64,
    cnp_count: u64,
    in_recovery: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CongestionStats {
    pub cnps_generated: u64,
    pub cnps_received: u64,
    pub rate_decreases: u64,
    pub rate_increases: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecn {
    NotCapable,
    Capable,
    Ce,
}

pub struct CongestionManager {
    cfg: DcqcnConfig,
    flows: HashMap<Handle, FlowState>,
    last_cnp_by_dest: HashMap<Handle, u64>,
    stats: CongestionStats,
}

impl CongestionManager {
    pub fn new(cfg: DcqcnConfig) -> Self {
        Self {
            cfg,
            flows: HashMap::new(),
            last_cnp_by_dest: HashMap::new(),
            stats: CongestionStats::default(),
        }
    }

    pub fn stats(&self) -> CongestionStats {
        self.stats
    }

    pub fn current_rate_mbps(&self, qp: Handle) -> u32 {
        self.flows.get(&qp).map(|f| f.rate_mbps).unwrap_or(self.cfg.initial_rate_mbps)
    }

    pub fn is_congestion_marked(ecn: Ecn) -> bool {
        ecn == Ecn::Ce
    }

    /// Generates a CNP for `dest_qp`, rate-limited to one per
    /// `cnp_timer_us`. Returns `None` if disabled or rate-limited.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn generate_cnp(&mut self, dest_qp: Handle, src_qp: Handle, now_us: u64) -> Option<Vec<u8>> {
        if !self.cfg.enabled {
            return None;
        }
        let last = self.last_cnp_by_dest.get(&dest_qp).copied().unwrap_or(0);
        if now_us.saturating_sub(last) < self.cfg.cnp_timer_us && last != 0 {
            return None;
        }
        self.last_cnp_by_dest.insert(dest_qp, now_us);
        self.stats.cnps_generated += 1;
        let bth = Bth {
            opcode: RdmaOpcode::Cnp,
            solicited_event: false,
            mig_req: false,
            pad_count: 0,
            transport_version: 0,
            partition_key: 0xFFFF,
            fecn: false,
            becn: true,
            dest_qp,
            ack_request: false,
            psn: 0,
        };
        let _ = src_qp;
        Some(build_packet(bth, None, None, None, &[]))
    }

    fn flow_mut(&mut self, qp: Handle) -> &mut FlowState {
        self.flows.entry(qp).or_insert(FlowState {
            rate_mbps: self.cfg.initial_rate_mbps,
            target_rate_mbps: self.cfg.initial_rate_mbps,
            alpha: 1.0,
            last_cnp_us: 0,
            last_increase_us: 0,
            last_alpha_us: 0,
            cnp_count: 0,
            in_recovery: false,
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn handle_cnp_received(&mut self, qp: Handle, now_us: u64) {
        let min_rate = self.cfg.min_rate_mbps;
        let alpha_g = self.cfg.alpha_g;
        let flow = self.flow_mut(qp);
        flow.in_recovery = true;
        flow.target_rate_mbps = flow.rate_mbps;
        let decreased = (flow.rate_mbps as f64) * (1.0 - flow.alpha / 2.0);
        flow.rate_mbps = (decreased as u32).max(min_rate);
        flow.alpha = flow.alpha * (1.0 - alpha_g) + alpha_g;
        flow.cnp_count += 1;
        flow.last_cnp_us = now_us;
        flow.last_increase_us = now_us;
        flow.last_alpha_us = now_us;
        self.stats.cnps_received += 1;
        self.stats.rate_decreases += 1;
    }

    /// Advances time for all flows: hyper-increase/additive-increase
    /// recovery and alpha decay.
    pub fn advance_time(&mut self, now_us: u64) {
        let initial_rate = self.cfg.initial_rate_mbps;
        let period = self.cfg.rate_increase_period_us;
        let alpha_period = self.cfg.alpha_update_period_us;
        let alpha_g = self.cfg.alpha_g;
        let mut any_increase = false;
        for flow in self.flows.values_mut() {
            if flow.in_recovery && now_us.saturating_sub(flow.last_increase_us) >= period {
                if flow.rate_mbps < flow.target_rate_mbps {
                    let step = ((flow.target_rate_mbps - flow.rate_mbps) / 2).max(1);
                    flow.rate_mbps = (flow.rate_mbps + step).min(flow.target_rate_mbps);
                } else {
                    flow.rate_mbps = (flow.rate_mbps + 1).min(initial_rate);
                }
                flow.last_increase_us = now_us;
                any_increase = true;
                if flow.rate_mbps >= initial_rate {
                    flow.in_recovery = false;
                }
            }
            if now_us.saturating_sub(flow.last_alpha_us) >= alpha_period {
                flow.alpha *= 1.0 - alpha_g;
                flow.last_alpha_us = now_us;
            }
        }
        if any_increase {
            self.stats.rate_increases += 1;
        }
    }
}
