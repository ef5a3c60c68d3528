//! Ethernet queue pair: TX/RX descriptor rings plus TX/RX completion
//! queues, segmentation, checksum and VLAN offload. Grounded on
//! `include/nic/queue_pair.h` (Ethernet) and `include/nic/tx_rx.h`.

use std::collections::VecDeque;

use crate::dma::DmaEngine;
use crate::doorbell::Doorbell;
use crate::eth::descriptor::{
    ChecksumMode, CompletionCode, CompletionEntry, RxDescriptor, TxDescriptor,
    RX_DESCRIPTOR_WIRE_SIZE, TX_DESCRIPTOR_WIRE_SIZE,
};
use crate::eth::offload::compute_checksum;
use crate::host_memory::HostMemory;
use crate::interrupt::InterruptDispatcher;
use crate::ring::DescriptorRing;

const MAX_TSO_SEGMENTS: u32 = 64;
const MAX_MSS: u16 = 9000;

/// A bounded FIFO of Ethernet completion entries.
pub struct EthCompletionQueue {
    capacity: usize,
    entries: VecDeque<CompletionEntry>,
}

impl EthCompletionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn post(&mut self, entry: CompletionEntry) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    pub fn pop(&mut self) -> Option<CompletionEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueuePairStats {
    pub packets_processed: u64,
    pub drops_mtu_exceeded: u64,
    pub drops_checksum: u64,
    pub drops_no_rx_desc: u64,
    pub drops_buffer_small: u64,
    pub scheduler_skip: u64,
}

pub struct EthQueuePairConfig {
    pub queue_id: u32,
    pub tx_capacity: usize,
    pub rx_capacity: usize,
    pub tx_cq_capacity: usize,
    pub rx_cq_capacity: usize,
    pub weight: u32,
    pub max_mtu: u32,
    pub enable_tx_interrupts: bool,
    pub enable_rx_interrupts: bool,
}

const TX_SLOT_SIZE: usize = TX_DESCRIPTOR_WIRE_SIZE;
const RX_SLOT_SIZE: usize = RX_DESCRIPTOR_WIRE_SIZE;

pub struct EthQueuePair {
    pub queue_id: u32,
    pub weight: u32,
    max_mtu: u32,
    tx_ring: DescriptorRing,
    rx_ring: DescriptorRing,
    tx_cq: EthCompletionQueue,
    rx_cq: EthCompletionQueue,
    tx_doorbell: Option<Doorbell>,
    rx_doorbell: Option<Doorbell>,
    enable_tx_interrupts: bool,
    enable_rx_interrupts: bool,
    stats: QueuePairStats,
}

impl EthQueuePair {
    pub fn new(cfg: EthQueuePairConfig) -> Self {
        Self {
            queue_id: cfg.queue_id,
            weight: cfg.weight.max(1),
            max_mtu: cfg.max_mtu,
            tx_ring: DescriptorRing::new_in_model(cfg.queue_id, cfg.tx_capacity, TX_SLOT_SIZE),
            rx_ring: DescriptorRing::new_in_model(cfg.queue_id, cfg.rx_capacity, RX_SLOT_SIZE),
            tx_cq: EthCompletionQueue::new(cfg.tx_cq_capacity),
            rx_cq: EthCompletionQueue::new(cfg.rx_cq_capacity),
            tx_doorbell: None,
            rx_doorbell: None,
            enable_tx_interrupts: cfg.enable_tx_interrupts,
            enable_rx_interrupts: cfg.enable_rx_interrupts,
            stats: QueuePairStats::default(),
        }
    }

    pub fn stats(&self) -> QueuePairStats {
        self.stats
    }

    pub fn tx_cq_mut(&mut self) -> &mut EthCompletionQueue {
        &mut self.tx_cq
    }

    pub fn rx_cq_mut(&mut self) -> &mut EthCompletionQueue {
        &mut self.rx_cq
    }

    pub fn push_tx_descriptor(&mut self, desc: TxDescriptor) -> bool {
        self.tx_ring.push(&desc.to_bytes(), None, None).is_ok()
    }

    pub fn push_rx_descriptor(&mut self, desc: RxDescriptor) -> bool {
        self.rx_ring.push(&desc.to_bytes(), None, None).is_ok()
    }

    pub fn tx_queue_empty(&self) -> bool {
        self.tx_ring.is_empty()
    }

    pub fn rx_queue_empty(&self) -> bool {
        self.rx_ring.is_empty()
    }

    fn pop_rx_descriptor(&mut self) -> Option<RxDescriptor> {
        let mut buf = vec![0u8; RX_SLOT_SIZE];
        self.rx_ring.pop(&mut buf, None, None).ok()?;
        Some(RxDescriptor::from_bytes(&buf))
    }

    /// Pops one TX descriptor, performs segmentation/offload, writes
    /// output into RX descriptors, and posts completions. Returns `true`
    /// if any work was done.
    #[tracing::instrument(level = "trace", skip(self, mem, dma, dispatcher))]
    pub fn process_once(
        &mut self,
        mem: &mut HostMemory,
        dma: &mut DmaEngine,
        dispatcher: Option<&mut InterruptDispatcher>,
    ) -> bool {
        let mut tx_buf = vec![0u8; TX_SLOT_SIZE];
        if self.tx_ring.pop(&mut tx_buf, None, None).is_err() {
            return false;
        }
        let desc = TxDescriptor::from_bytes(&tx_buf);
        self.stats.packets_processed += 1;

        if desc.length > self.max_mtu {
            self.stats.drops_mtu_exceeded += 1;
            self.post_tx_completion(desc, CompletionCode::MtuExceeded, dispatcher);
            return true;
        }

        let mut payload = vec![0u8; desc.length as usize];
        if dma.read(mem, desc.buffer_address, &mut payload).is_err() {
            self.post_tx_completion(desc, CompletionCode::Fault, dispatcher.map(|d| &mut *d));
            return true;
        }

        let segments = match self.segment(&desc, &payload) {
            Ok(segs) => segs,
            Err(code) => {
                self.post_tx_completion(desc, code, dispatcher);
                return true;
            }
        };

        let segments_produced = segments.len() as u32;
        let tso_performed = desc.flags.tso && segments_produced > 0;
        let gso_performed = desc.flags.gso && !tso_performed && segments_produced > 0;

        let mut dispatcher = dispatcher;
        for segment in segments {
            self.deliver_segment(&desc, segment, mem, dma, dispatcher.as_deref_mut());
        }

        let mut tx_completion = CompletionEntry {
            queue_id: self.queue_id,
            descriptor_index: desc.index,
            status: Some(CompletionCode::Success),
            tso_performed,
            gso_performed,
            segments_produced,
            ..Default::default()
        };
        tx_completion.status = Some(CompletionCode::Success);
        self.tx_cq.post(tx_completion);
        if self.enable_tx_interrupts {
            if let Some(d) = dispatcher.as_deref_mut() {
                d.on_completion(self.queue_id);
            }
        }
        true
    }

    fn segment(&self, desc: &TxDescriptor, payload: &[u8]) -> Result<Vec<Vec<u8>>, CompletionCode> {
        let len = payload.len() as u32;
        if desc.flags.tso {
            if desc.mss == 0 || desc.mss > MAX_MSS || desc.header_length as u32 > len {
                return Err(CompletionCode::InvalidMss);
            }
            let mss = desc.mss as u32;
            let header_len = desc.header_length as u32;
            let remaining = len - header_len;
            let count = remaining.div_ceil(mss).max(1);
            if count > MAX_TSO_SEGMENTS {
                return Err(CompletionCode::TooManySegments);
            }
            let mut segs = Vec::new();
            let mut offset = header_len;
            let mut first = true;
            while offset < len {
                let take = mss.min(len - offset);
                let mut seg = Vec::new();
                if first {
                    seg.extend_from_slice(&payload[0..header_len as usize]);
                    first = false;
                }
                seg.extend_from_slice(&payload[offset as usize..(offset + take) as usize]);
                segs.push(seg);
                offset += take;
            }
            if segs.is_empty() {
                segs.push(payload.to_vec());
            }
            return Ok(segs);
        }
        if desc.flags.gso {
            if desc.mss == 0 {
                return Ok(vec![payload.to_vec()]);
            }
            if desc.mss > MAX_MSS || desc.header_length as u32 > len {
                return Ok(vec![payload.to_vec()]);
            }
            let mss = desc.mss as u32;
            let header_len = desc.header_length as u32;
            let header = &payload[0..header_len as usize];
            let mut segs = Vec::new();
            let mut offset = header_len;
            while offset < len {
                let take = mss.min(len - offset);
                let mut seg = Vec::with_capacity(header.len() + take as usize);
                seg.extend_from_slice(header);
                seg.extend_from_slice(&payload[offset as usize..(offset + take) as usize]);
                segs.push(seg);
                offset += take;
            }
            if segs.is_empty() {
                segs.push(payload.to_vec());
            }
            return Ok(segs);
        }
        Ok(vec![payload.to_vec()])
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver_segment(
        &mut self,
        tx_desc: &TxDescriptor,
        segment: Vec<u8>,
        mem: &mut HostMemory,
        dma: &mut DmaEngine,
        mut dispatcher: Option<&mut InterruptDispatcher>,
    ) {
        let Some(rx_desc) = self.pop_rx_descriptor() else {
            self.stats.drops_no_rx_desc += 1;
            return;
        };

        let mut completion = CompletionEntry {
            queue_id: self.queue_id,
            descriptor_index: rx_desc.index,
            vlan_tag: tx_desc.vlan_tag,
            ..Default::default()
        };

        if tx_desc.flags.vlan_insert {
            completion.vlan_inserted = true;
        }
        if tx_desc.flags.vlan_insert && rx_desc.flags.vlan_strip {
            completion.vlan_stripped = true;
        }

        if tx_desc.checksum_mode != ChecksumMode::None {
            if tx_desc.flags.checksum_offload {
                let correct = compute_checksum(&segment);
                if rx_desc.flags.checksum_offload {
                    completion.checksum_verified = true;
                }
                let _ = correct;
            } else if compute_checksum(&segment) != tx_desc.checksum_value {
                self.stats.drops_checksum += 1;
                completion.status = Some(CompletionCode::ChecksumError);
                self.rx_cq.post(completion);
                if self.enable_rx_interrupts {
                    if let Some(d) = dispatcher.as_deref_mut() {
                        d.on_completion(self.queue_id);
                    }
                }
                return;
            }
        }

        let mut frame = segment;
        if tx_desc.flags.vlan_insert && !rx_desc.flags.vlan_strip {
            frame.extend_from_slice(&[0u8; 4]);
        }

        if (frame.len() as u32) > rx_desc.buffer_length {
            self.stats.drops_buffer_small += 1;
            completion.status = Some(CompletionCode::BufferTooSmall);
            self.rx_cq.post(completion);
            if self.enable_rx_interrupts {
                if let Some(d) = dispatcher.as_deref_mut() {
                    d.on_completion(self.queue_id);
                }
            }
            return;
        }

        if dma.write(mem, rx_desc.buffer_address, &frame).is_err() {
            self.stats.drops_buffer_small += 1;
            completion.status = Some(CompletionCode::Fault);
            self.rx_cq.post(completion);
            if self.enable_rx_interrupts {
                if let Some(d) = dispatcher.as_deref_mut() {
                    d.on_completion(self.queue_id);
                }
            }
            return;
        }

        completion.status = Some(CompletionCode::Success);
        self.rx_cq.post(completion);
        if self.enable_rx_interrupts {
            if let Some(d) = dispatcher.as_deref_mut() {
                d.on_completion(self.queue_id);
            }
        }
    }

    fn post_tx_completion(
        &mut self,
        desc: TxDescriptor,
        status: CompletionCode,
        dispatcher: Option<&mut InterruptDispatcher>,
    ) {
        self.tx_cq.post(CompletionEntry {
            queue_id: self.queue_id,
            descriptor_index: desc.index,
            status: Some(status),
            ..Default::default()
        });
        if self.enable_tx_interrupts {
            if let Some(d) = dispatcher {
                d.on_completion(self.queue_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::descriptor::{RxFlags, TxFlags};

    fn qp() -> EthQueuePair {
        EthQueuePair::new(EthQueuePairConfig {
            queue_id: 0,
            tx_capacity: 4,
            rx_capacity: 4,
            tx_cq_capacity: 4,
            rx_cq_capacity: 4,
            weight: 1,
            max_mtu: 1500,
            enable_tx_interrupts: false,
            enable_rx_interrupts: false,
        })
    }

    #[test]
    fn byte_for_byte_loopback_no_offload() {
        let mut mem = HostMemory::new(4096);
        let mut dma = DmaEngine::new();
        let payload = b"hello world".to_vec();
        mem.write(0, &payload).unwrap();
        let mut q = qp();
        q.push_rx_descriptor(RxDescriptor {
            buffer_address: 2048,
            buffer_length: 64,
            checksum_mode: ChecksumMode::None,
            index: 0,
            flags: RxFlags::default(),
        });
        q.push_tx_descriptor(TxDescriptor {
            buffer_address: 0,
            length: payload.len() as u32,
            checksum_mode: ChecksumMode::None,
            index: 0,
            checksum_value: 0,
            flags: TxFlags::default(),
            mss: 0,
            header_length: 0,
            vlan_tag: 0,
        });
        assert!(q.process_once(&mut mem, &mut dma, None));
        let tx_completion = q.tx_cq_mut().pop().unwrap();
        assert_eq!(tx_completion.status, Some(CompletionCode::Success));
        let rx_completion = q.rx_cq_mut().pop().unwrap();
        assert_eq!(rx_completion.status, Some(CompletionCode::Success));
        let mut landed = vec![0u8; payload.len()];
        mem.read(2048, &mut landed).unwrap();
        assert_eq!(landed, payload);
    }

    #[test]
    fn mtu_exceeded_drops_without_touching_rx() {
        let mut mem = HostMemory::new(4096);
        let mut dma = DmaEngine::new();
        let mut q = qp();
        q.push_rx_descriptor(RxDescriptor {
            buffer_address: 2048,
            buffer_length: 4000,
            checksum_mode: ChecksumMode::None,
            index: 0,
            flags: RxFlags::default(),
        });
        q.push_tx_descriptor(TxDescriptor {
            buffer_address: 0,
            length: 2000,
            checksum_mode: ChecksumMode::None,
            index: 0,
            checksum_value: 0,
            flags: TxFlags::default(),
            mss: 0,
            header_length: 0,
            vlan_tag: 0,
        });
        assert!(q.process_once(&mut mem, &mut dma, None));
        assert_eq!(q.stats().drops_mtu_exceeded, 1);
        assert!(q.rx_cq_mut().pop().is_none());
    }

    #[test]
    fn tso_splits_into_segments() {
        let mut mem = HostMemory::new(8192);
        let mut dma = DmaEngine::new();
        let header = vec![0xAAu8; 14];
        let mut payload = header.clone();
        payload.extend(vec![1u8; 3000]);
        mem.write(0, &payload).unwrap();
        let mut q = qp();
        for i in 0..4 {
            q.push_rx_descriptor(RxDescriptor {
                buffer_address: 1024 + i * 2048,
                buffer_length: 2000,
                checksum_mode: ChecksumMode::None,
                index: i as u32,
                flags: RxFlags::default(),
            });
        }
        q.push_tx_descriptor(TxDescriptor {
            buffer_address: 0,
            length: payload.len() as u32,
            checksum_mode: ChecksumMode::None,
            index: 0,
            checksum_value: 0,
            flags: TxFlags { tso: true, ..Default::default() },
            mss: 1500,
            header_length: 14,
            vlan_tag: 0,
        });
        assert!(q.process_once(&mut mem, &mut dma, None));
        let tx_completion = q.tx_cq_mut().pop().unwrap();
        assert!(tx_completion.tso_performed);
        assert_eq!(tx_completion.segments_produced, 2);
    }
}
