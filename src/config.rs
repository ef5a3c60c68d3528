//! Device-level configuration surface and validation. Grounded on
//! `include/nic/device.h`/`include/nic/capability.h` (consumed only as the
//! shape a configuration struct must cover; no BAR/config-space/capability
//! list emulation is built here, per SPEC_FULL.md §4.15).

use crate::eth::queue_pair::EthQueuePairConfig;
use crate::error::ConfigError;
use crate::interrupt::{AdaptiveConfig, CoalesceConfig};
use crate::rdma::engine::RdmaEngineConfig;

/// Static vector→queue mapping installed into the device's `MsixTable` at
/// construction time.
#[derive(Debug, Clone, Copy)]
pub struct MsixMapping {
    pub queue_id: u32,
    pub vector: u16,
}

pub struct DeviceConfig {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision: u8,
    pub host_memory_size: usize,
    pub queue_pair_config: Vec<EthQueuePairConfig>,
    pub num_msix_vectors: usize,
    pub msix_mapping: Vec<MsixMapping>,
    pub interrupt_coalesce: CoalesceConfig,
    pub adaptive_coalesce: AdaptiveConfig,
    pub enable_rdma: bool,
    pub rdma_config: RdmaEngineConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x1AF4,
            device_id: 0x1000,
            revision: 1,
            host_memory_size: 1 << 20,
            queue_pair_config: Vec::new(),
            num_msix_vectors: 4,
            msix_mapping: Vec::new(),
            interrupt_coalesce: CoalesceConfig::default(),
            adaptive_coalesce: AdaptiveConfig::default(),
            enable_rdma: false,
            rdma_config: RdmaEngineConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Checks the surface for internally-inconsistent values before a
    /// `Device` is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_memory_size == 0 {
            return Err(ConfigError::ZeroHostMemorySize);
        }
        let mut seen = std::collections::HashSet::new();
        for qp in &self.queue_pair_config {
            if qp.tx_capacity == 0 || qp.rx_capacity == 0 || qp.tx_cq_capacity == 0 || qp.rx_cq_capacity == 0 {
                return Err(ConfigError::ZeroRingCapacity);
            }
            if qp.weight == 0 {
                return Err(ConfigError::ZeroWeight);
            }
            if qp.max_mtu == 0 {
                return Err(ConfigError::ZeroMtu);
            }
            if !seen.insert(qp.queue_id) {
                return Err(ConfigError::DuplicateQueueId(qp.queue_id));
            }
        }
        for mapping in &self.msix_mapping {
            if mapping.vector as usize >= self.num_msix_vectors {
                return Err(ConfigError::VectorOutOfRange(mapping.vector));
            }
        }
        if self.enable_rdma {
            let r = &self.rdma_config;
            if r.max_pds == 0 || r.max_mrs == 0 || r.max_qps == 0 || r.max_cqs == 0 || r.default_cq_depth == 0 {
                return Err(ConfigError::ZeroResourceLimit);
            }
        }
        Ok(())
    }
}
