//! Ambient device facade. Grounded on `include/nic/device.h` (consumed
//! only as the shape of something that owns a `QueueManager` plus an
//! `InterruptDispatcher` and an optional `RdmaEngine`; no BAR/config-space
//! emulation is built here, per SPEC_FULL.md §4.15).

use crate::config::DeviceConfig;
use crate::dma::DmaEngine;
use crate::eth::queue_manager::QueueManager;
use crate::eth::queue_pair::EthQueuePair;
use crate::error::ConfigError;
use crate::host_memory::HostMemory;
use crate::interrupt::InterruptDispatcher;
use crate::msix::MsixTable;
use crate::rdma::engine::{OutgoingPacket, RdmaEngine};

/// A thin composition root: one host memory, one DMA engine, the Ethernet
/// queue manager, the interrupt dispatcher, and an optional RDMA engine.
pub struct Device {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision: u8,
    mem: HostMemory,
    dma: DmaEngine,
    queues: QueueManager,
    interrupts: InterruptDispatcher,
    rdma: Option<RdmaEngine>,
}

impl Device {
    pub fn new(cfg: DeviceConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let mut table = MsixTable::new(cfg.num_msix_vectors);
        for mapping in &cfg.msix_mapping {
            table.map_queue(mapping.queue_id, mapping.vector);
        }
        let interrupts = InterruptDispatcher::new(table, cfg.interrupt_coalesce, cfg.adaptive_coalesce);
        let queues = QueueManager::new(cfg.queue_pair_config.into_iter().map(EthQueuePair::new).collect());
        let rdma = cfg.enable_rdma.then(|| RdmaEngine::new(cfg.rdma_config));
        Ok(Self {
            vendor_id: cfg.vendor_id,
            device_id: cfg.device_id,
            revision: cfg.revision,
            mem: HostMemory::new(cfg.host_memory_size),
            dma: DmaEngine::new(),
            queues,
            interrupts,
            rdma,
        })
    }

    pub fn host_memory(&self) -> &HostMemory {
        &self.mem
    }

    pub fn host_memory_mut(&mut self) -> &mut HostMemory {
        &mut self.mem
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn queues_mut(&mut self) -> &mut QueueManager {
        &mut self.queues
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptDispatcher {
        &mut self.interrupts
    }

    pub fn rdma(&self) -> Option<&RdmaEngine> {
        self.rdma.as_ref()
    }

    pub fn rdma_mut(&mut self) -> Option<&mut RdmaEngine> {
        self.rdma.as_mut()
    }

    /// Delivers one received RoCEv2 payload to the device's RDMA engine,
    /// if enabled, returning any packets generated in response. A no-op
    /// returning an empty vector when RDMA is disabled.
    pub fn deliver_rdma_packet(&mut self, data: &[u8]) -> Vec<OutgoingPacket> {
        let Some(rdma) = self.rdma.as_mut() else {
            return Vec::new();
        };
        rdma.process_incoming_packet(&mut self.mem, &mut self.dma, data)
    }

    /// Advances the device's RDMA clock (a no-op when RDMA is disabled),
    /// returning any retransmits produced.
    pub fn advance_time(&mut self, elapsed_us: u64) -> Vec<OutgoingPacket> {
        match self.rdma.as_mut() {
            Some(rdma) => rdma.advance_time(elapsed_us),
            None => Vec::new(),
        }
    }

    /// Services exactly one unit of Ethernet queue work and, if RDMA is
    /// enabled, drains one round of outgoing RDMA packets through `sink`.
    /// Returns `true` if either side did work.
    pub fn process_once(&mut self, mut sink: impl FnMut(OutgoingPacket)) -> bool {
        let eth_did_work = self.queues.process_once(&mut self.mem, &mut self.dma, Some(&mut self.interrupts));
        let mut rdma_did_work = false;
        if let Some(rdma) = self.rdma.as_mut() {
            let outgoing = rdma.generate_outgoing_packets(&self.mem, &mut self.dma);
            rdma_did_work = !outgoing.is_empty();
            for packet in outgoing {
                sink(packet);
            }
        }
        eth_did_work || rdma_did_work
    }
}
