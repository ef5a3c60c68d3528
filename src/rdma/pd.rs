//! Protection domain table: opaque handle allocation. Grounded on
//! `include/nic/rocev2/protection_domain.h`, `src/rocev2/protection_domain.cpp`.

use std::collections::HashSet;

use crate::rdma::types::Handle;

#[derive(Default)]
pub struct ProtectionDomainTable {
    next_handle: Handle,
    live: HashSet<Handle>,
}

impl ProtectionDomainTable {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            live: HashSet::new(),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn allocate(&mut self) -> Handle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.live.insert(handle);
        handle
    }

    pub fn deallocate(&mut self, pd: Handle) -> bool {
        self.live.remove(&pd)
    }

    pub fn is_valid(&self, pd: Handle) -> bool {
        self.live.contains(&pd)
    }

    pub fn count(&self) -> usize {
        self.live.len()
    }
}
