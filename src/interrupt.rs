//! Coalesces completions into MSI-X interrupts, with static thresholds and
//! adaptive moderation. Grounded on `include/nic/interrupt_dispatcher.h`,
//! `src/interrupt_dispatcher.cpp`.

use std::collections::HashMap;

use crate::msix::MsixTable;

#[derive(Debug, Clone, Copy)]
pub struct CoalesceConfig {
    pub packet_threshold: u32,
    pub timer_threshold_us: u64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            packet_threshold: 1,
            timer_threshold_us: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    pub min_threshold: u32,
    pub max_threshold: u32,
    pub sample_interval: u32,
    pub high_batch: u32,
    pub low_batch: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_threshold: 1,
            max_threshold: 1,
            sample_interval: 16,
            high_batch: 8,
            low_batch: 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AdaptiveState {
    current_threshold: u32,
    interrupt_count: u32,
    total_batch: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingState {
    pending: u32,
    time_accum_us: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatcherStats {
    pub interrupts_fired: u64,
    pub coalesced_batches: u64,
    pub suppressed_disabled: u64,
    pub suppressed_masked: u64,
    pub timer_flushes: u64,
    pub manual_flushes: u64,
}

pub type DeliveryCallback = Box<dyn FnMut(u16, u32)>;

pub struct InterruptDispatcher {
    table: MsixTable,
    default_coalesce: CoalesceConfig,
    per_queue_coalesce: HashMap<u32, CoalesceConfig>,
    adaptive: AdaptiveConfig,
    pending: HashMap<u16, PendingState>,
    adaptive_state: HashMap<u16, AdaptiveState>,
    per_vector_suppressed: HashMap<u16, u64>,
    stats: DispatcherStats,
    delivery: Option<DeliveryCallback>,
}

impl InterruptDispatcher {
    pub fn new(table: MsixTable, default_coalesce: CoalesceConfig, adaptive: AdaptiveConfig) -> Self {
        Self {
            table,
            default_coalesce,
            per_queue_coalesce: HashMap::new(),
            adaptive,
            pending: HashMap::new(),
            adaptive_state: HashMap::new(),
            per_vector_suppressed: HashMap::new(),
            stats: DispatcherStats::default(),
            delivery: None,
        }
    }

    pub fn with_delivery(mut self, cb: DeliveryCallback) -> Self {
        self.delivery = Some(cb);
        self
    }

    pub fn set_queue_coalesce(&mut self, queue_id: u32, cfg: CoalesceConfig) {
        self.per_queue_coalesce.insert(queue_id, cfg);
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    pub fn table_mut(&mut self) -> &mut MsixTable {
        &mut self.table
    }

    fn effective_threshold(&self, queue_id: u32, vector: u16) -> u32 {
        if self.adaptive.enabled {
            if let Some(state) = self.adaptive_state.get(&vector) {
                return state.current_threshold.max(1);
            }
        }
        self.per_queue_coalesce
            .get(&queue_id)
            .map(|c| c.packet_threshold)
            .unwrap_or(self.default_coalesce.packet_threshold)
            .max(1)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn on_completion(&mut self, queue_id: u32) -> bool {
        let Some(vector) = self.table.vector_for_queue(queue_id) else {
            return false;
        };
        let Some(v) = self.table.vector(vector) else {
            return false;
        };
        if !v.enabled {
            self.stats.suppressed_disabled += 1;
            *self.per_vector_suppressed.entry(vector).or_default() += 1;
            return false;
        }
        if v.masked {
            self.stats.suppressed_masked += 1;
            return false;
        }
        let threshold = self.effective_threshold(queue_id, vector);
        let state = self.pending.entry(vector).or_default();
        state.pending += 1;
        if state.pending >= threshold {
            self.fire(vector);
        }
        true
    }

    fn fire(&mut self, vector: u16) {
        let batch = self.pending.get(&vector).map(|s| s.pending).unwrap_or(0);
        if batch == 0 {
            return;
        }
        if batch >= 2 {
            self.stats.coalesced_batches += 1;
        }
        self.update_adaptive(vector, batch);
        if let Some(cb) = &mut self.delivery {
            cb(vector, batch);
        }
        self.pending.remove(&vector);
        self.stats.interrupts_fired += 1;
    }

    fn update_adaptive(&mut self, vector: u16, batch: u32) {
        if !self.adaptive.enabled {
            return;
        }
        let state = self.adaptive_state.entry(vector).or_insert(AdaptiveState {
            current_threshold: self.adaptive.min_threshold,
            interrupt_count: 0,
            total_batch: 0,
        });
        state.interrupt_count += 1;
        state.total_batch += batch as u64;
        if state.interrupt_count >= self.adaptive.sample_interval {
            let avg = state.total_batch / state.interrupt_count as u64;
            if avg >= self.adaptive.high_batch as u64 && state.current_threshold < self.adaptive.max_threshold {
                state.current_threshold += 1;
            } else if avg <= self.adaptive.low_batch as u64 && state.current_threshold > self.adaptive.min_threshold {
                state.current_threshold -= 1;
            }
            state.interrupt_count = 0;
            state.total_batch = 0;
        }
    }

    /// Advances all vectors' timer accumulators by `elapsed_us`, firing any
    /// that cross the default timer threshold.
    pub fn on_timer_tick(&mut self, elapsed_us: u64) {
        if self.default_coalesce.timer_threshold_us == 0 {
            return;
        }
        let mut to_fire = Vec::new();
        for (&vector, state) in self.pending.iter_mut() {
            if state.pending == 0 {
                continue;
            }
            state.time_accum_us += elapsed_us;
            if state.time_accum_us >= self.default_coalesce.timer_threshold_us {
                to_fire.push(vector);
            }
        }
        for vector in to_fire {
            self.fire(vector);
            self.stats.timer_flushes += 1;
        }
    }

    /// Manually flushes one vector, or all pending vectors if `None`.
    pub fn flush(&mut self, vector: Option<u16>) {
        match vector {
            Some(v) => self.fire(v),
            None => {
                let vectors: Vec<u16> = self.pending.keys().copied().collect();
                for v in vectors {
                    self.fire(v);
                }
            }
        }
        self.stats.manual_flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn table_with_one_mapped_vector() -> MsixTable {
        let mut t = MsixTable::new(2);
        t.map_queue(0, 0);
        t
    }

    #[test]
    fn unmapped_queue_returns_false() {
        let t = MsixTable::new(2);
        let mut d = InterruptDispatcher::new(t, CoalesceConfig::default(), AdaptiveConfig::default());
        assert!(!d.on_completion(5));
    }

    #[test]
    fn fires_at_threshold() {
        let t = table_with_one_mapped_vector();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired2 = fired.clone();
        let mut d = InterruptDispatcher::new(
            t,
            CoalesceConfig { packet_threshold: 3, timer_threshold_us: 0 },
            AdaptiveConfig::default(),
        )
        .with_delivery(Box::new(move |v, b| fired2.borrow_mut().push((v, b))));
        d.on_completion(0);
        d.on_completion(0);
        assert!(fired.borrow().is_empty());
        d.on_completion(0);
        assert_eq!(*fired.borrow(), vec![(0, 3)]);
        assert_eq!(d.stats().interrupts_fired, 1);
    }

    #[test]
    fn masked_vector_suppresses() {
        let mut t = table_with_one_mapped_vector();
        t.vector_mut(0).unwrap().masked = true;
        let mut d = InterruptDispatcher::new(t, CoalesceConfig::default(), AdaptiveConfig::default());
        d.on_completion(0);
        assert_eq!(d.stats().suppressed_masked, 1);
    }

    #[test]
    fn adaptive_threshold_increases_on_high_batch() {
        let t = table_with_one_mapped_vector();
        let mut d = InterruptDispatcher::new(
            t,
            CoalesceConfig { packet_threshold: 1, timer_threshold_us: 0 },
            AdaptiveConfig {
                enabled: true,
                min_threshold: 1,
                max_threshold: 4,
                sample_interval: 2,
                high_batch: 1,
                low_batch: 0,
            },
        );
        d.on_completion(0);
        d.on_completion(0);
        assert!(d.adaptive_state.get(&0).unwrap().current_threshold >= 1);
    }
}
