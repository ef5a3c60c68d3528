//! Fixed-slot producer/consumer ring with in-model or host-backed storage.
//! Grounded on `include/nic/descriptor_ring.h`, `src/descriptor_ring.cpp`.

use crate::doorbell::Doorbell;
use crate::dma::DmaEngine;
use crate::host_memory::HostMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    AccessError,
    InternalError,
}

pub type RingResult<T> = Result<T, RingError>;

enum Storage {
    InModel(Vec<u8>),
    HostBacked { base: u64 },
}

/// A fixed-capacity ring of `slot_size`-byte slots.
pub struct DescriptorRing {
    slot_size: usize,
    capacity: usize,
    producer: usize,
    consumer: usize,
    occupancy: usize,
    storage: Storage,
    queue_id: u32,
    doorbell: Option<Doorbell>,
}

impl DescriptorRing {
    /// Builds an in-model ring: slots live in an owned byte vector.
    pub fn new_in_model(queue_id: u32, capacity: usize, slot_size: usize) -> Self {
        Self {
            slot_size,
            capacity,
            producer: 0,
            consumer: 0,
            occupancy: 0,
            storage: Storage::InModel(vec![0u8; capacity * slot_size]),
            queue_id,
            doorbell: None,
        }
    }

    /// Builds a host-backed ring: slots live in [`HostMemory`] starting at
    /// `base`, moved via a [`DmaEngine`] supplied at each call.
    pub fn new_host_backed(queue_id: u32, capacity: usize, slot_size: usize, base: u64) -> Self {
        Self {
            slot_size,
            capacity,
            producer: 0,
            consumer: 0,
            occupancy: 0,
            storage: Storage::HostBacked { base },
            queue_id,
            doorbell: None,
        }
    }

    pub fn with_doorbell(mut self, doorbell: Doorbell) -> Self {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.occupancy
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy == 0
    }

    pub fn is_full(&self) -> bool {
        self.occupancy == self.capacity
    }

    pub fn producer_index(&self) -> usize {
        self.producer
    }

    pub fn consumer_index(&self) -> usize {
        self.consumer
    }

    #[tracing::instrument(level = "trace", skip(self, bytes, mem, dma))]
    pub fn push(
        &mut self,
        bytes: &[u8],
        mem: Option<&mut HostMemory>,
        dma: Option<&mut DmaEngine>,
    ) -> RingResult<()> {
        if bytes.len() != self.slot_size || self.is_full() {
            return Err(RingError::AccessError);
        }
        let slot = self.producer;
        match &mut self.storage {
            Storage::InModel(buf) => {
                let off = slot * self.slot_size;
                buf[off..off + self.slot_size].copy_from_slice(bytes);
            }
            Storage::HostBacked { base } => {
                let (mem, dma) = (
                    mem.ok_or(RingError::InternalError)?,
                    dma.ok_or(RingError::InternalError)?,
                );
                let addr = *base + (slot * self.slot_size) as u64;
                dma.write(mem, addr, bytes).map_err(|_| RingError::InternalError)?;
            }
        }
        self.producer = (self.producer + 1) % self.capacity;
        self.occupancy += 1;
        if let Some(db) = &mut self.doorbell {
            db.ring(self.producer as u32);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, buf, mem, dma))]
    pub fn pop(
        &mut self,
        buf: &mut [u8],
        mem: Option<&HostMemory>,
        dma: Option<&mut DmaEngine>,
    ) -> RingResult<()> {
        if buf.len() != self.slot_size || self.is_empty() {
            return Err(RingError::AccessError);
        }
        let slot = self.consumer;
        match &self.storage {
            Storage::InModel(data) => {
                let off = slot * self.slot_size;
                buf.copy_from_slice(&data[off..off + self.slot_size]);
            }
            Storage::HostBacked { base } => {
                let (mem, dma) = (
                    mem.ok_or(RingError::InternalError)?,
                    dma.ok_or(RingError::InternalError)?,
                );
                let addr = *base + (slot * self.slot_size) as u64;
                dma.read(mem, addr, buf).map_err(|_| RingError::InternalError)?;
            }
        }
        self.consumer = (self.consumer + 1) % self.capacity;
        self.occupancy -= 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.producer = 0;
        self.consumer = 0;
        self.occupancy = 0;
    }
}
