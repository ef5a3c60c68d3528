//! Weighted round-robin scheduler across Ethernet queue pairs. Grounded
//! on `include/nic/queue_manager.h`, `src/queue_manager.cpp`.

use crate::dma::DmaEngine;
use crate::eth::queue_pair::{EthQueuePair, QueuePairStats};
use crate::host_memory::HostMemory;
use crate::interrupt::InterruptDispatcher;

struct Slot {
    queue: EthQueuePair,
    credit: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueManagerStats {
    pub scheduler_skips: u64,
}

pub struct QueueManager {
    slots: Vec<Slot>,
    index: usize,
    stats: QueueManagerStats,
}

impl QueueManager {
    pub fn new(queues: Vec<EthQueuePair>) -> Self {
        let slots = queues
            .into_iter()
            .map(|q| {
                let credit = q.weight;
                Slot { queue: q, credit }
            })
            .collect();
        Self {
            slots,
            index: 0,
            stats: QueueManagerStats::default(),
        }
    }

    pub fn queue(&self, queue_id: u32) -> Option<&EthQueuePair> {
        self.slots.iter().map(|s| &s.queue).find(|q| q.queue_id == queue_id)
    }

    pub fn queue_mut(&mut self, queue_id: u32) -> Option<&mut EthQueuePair> {
        self.slots
            .iter_mut()
            .map(|s| &mut s.queue)
            .find(|q| q.queue_id == queue_id)
    }

    pub fn stats(&self) -> QueueManagerStats {
        self.stats
    }

    pub fn aggregate_queue_stats(&self) -> QueuePairStats {
        let mut total = QueuePairStats::default();
        for slot in &self.slots {
            let s = slot.queue.stats();
            total.packets_processed += s.packets_processed;
            total.drops_mtu_exceeded += s.drops_mtu_exceeded;
            total.drops_checksum += s.drops_checksum;
            total.drops_no_rx_desc += s.drops_no_rx_desc;
            total.drops_buffer_small += s.drops_buffer_small;
            total.scheduler_skip += s.scheduler_skip;
        }
        total
    }

    /// Runs at most one full rotation over the queues, giving each a turn
    /// according to its weight. Returns `true` if any queue did work.
    #[tracing::instrument(level = "trace", skip(self, mem, dma, dispatcher))]
    pub fn process_once(
        &mut self,
        mem: &mut HostMemory,
        dma: &mut DmaEngine,
        mut dispatcher: Option<&mut InterruptDispatcher>,
    ) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let n = self.slots.len();
        for _ in 0..n {
            let slot = &mut self.slots[self.index];
            if slot.queue.tx_queue_empty() && slot.queue.rx_queue_empty() {
                self.stats.scheduler_skips += 1;
                self.index = (self.index + 1) % n;
                continue;
            }
            let did_work = slot.queue.process_once(mem, dma, dispatcher.as_deref_mut());
            if did_work {
                slot.credit = slot.credit.saturating_sub(1);
                if slot.credit == 0 {
                    slot.credit = slot.queue.weight;
                    self.index = (self.index + 1) % n;
                }
                return true;
            }
            self.stats.scheduler_skips += 1;
            self.index = (self.index + 1) % n;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::queue_pair::EthQueuePairConfig;

    fn make_queue(id: u32, weight: u32) -> EthQueuePair {
        EthQueuePair::new(EthQueuePairConfig {
            queue_id: id,
            tx_capacity: 4,
            rx_capacity: 4,
            tx_cq_capacity: 4,
            rx_cq_capacity: 4,
            weight,
            max_mtu: 1500,
            enable_tx_interrupts: false,
            enable_rx_interrupts: false,
        })
    }

    #[test]
    fn empty_manager_has_no_work() {
        let mut mem = HostMemory::new(64);
        let mut dma = DmaEngine::new();
        let mut qm = QueueManager::new(vec![]);
        assert!(!qm.process_once(&mut mem, &mut dma, None));
    }

    #[test]
    fn blocked_queue_is_skipped() {
        let mut mem = HostMemory::new(64);
        let mut dma = DmaEngine::new();
        let qm = QueueManager::new(vec![make_queue(0, 1), make_queue(1, 1)]);
        let mut qm = qm;
        assert!(!qm.process_once(&mut mem, &mut dma, None));
        assert!(qm.stats().scheduler_skips >= 2);
    }
}
