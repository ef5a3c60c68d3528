//! MSI-X vector table and queue→vector mapping. Grounded on
//! `include/nic/msix.h`.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct MsixVector {
    pub address: u64,
    pub data: u32,
    pub enabled: bool,
    pub masked: bool,
}

impl Default for MsixVector {
    fn default() -> Self {
        Self {
            address: 0,
            data: 0,
            enabled: true,
            masked: false,
        }
    }
}

#[derive(Default)]
pub struct MsixTable {
    vectors: Vec<MsixVector>,
    queue_to_vector: HashMap<u32, u16>,
}

impl MsixTable {
    pub fn new(num_vectors: usize) -> Self {
        Self {
            vectors: vec![MsixVector::default(); num_vectors],
            queue_to_vector: HashMap::new(),
        }
    }

    pub fn map_queue(&mut self, queue_id: u32, vector: u16) {
        self.queue_to_vector.insert(queue_id, vector);
    }

    pub fn vector_for_queue(&self, queue_id: u32) -> Option<u16> {
        self.queue_to_vector.get(&queue_id).copied()
    }

    pub fn vector(&self, vector: u16) -> Option<&MsixVector> {
        self.vectors.get(vector as usize)
    }

    pub fn vector_mut(&mut self, vector: u16) -> Option<&mut MsixVector> {
        self.vectors.get_mut(vector as usize)
    }

    pub fn num_vectors(&self) -> usize {
        self.vectors.len()
    }
}
