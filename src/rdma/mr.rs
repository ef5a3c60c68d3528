//! Memory region table: lkey/rkey issuance and bounds/PD/permission
//! validation. Grounded on `include/nic/rocev2/memory_region.h`,
//! `src/rocev2/memory_region.cpp`.

use std::collections::HashMap;

use crate::rdma::types::{Handle, MrAccess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrError {
    ZeroLength,
    TableFull,
    NotFound,
    OutOfBounds,
    AccessDenied,
    PdMismatch,
}

struct MemoryRegion {
    pd: Handle,
    lkey: Handle,
    rkey: Handle,
    va: u64,
    length: u64,
    access: MrAccess,
    valid: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MrTableStats {
    pub validations: u64,
    pub access_errors: u64,
}

pub struct MemoryRegionTable {
    max_mrs: usize,
    next_key: Handle,
    by_lkey: HashMap<Handle, MemoryRegion>,
    rkey_to_lkey: HashMap<Handle, Handle>,
    stats: MrTableStats,
}

impl MemoryRegionTable {
    pub fn new(max_mrs: usize) -> Self {
        Self {
            max_mrs,
            next_key: 0x100,
            by_lkey: HashMap::new(),
            rkey_to_lkey: HashMap::new(),
            stats: MrTableStats::default(),
        }
    }

    pub fn stats(&self) -> MrTableStats {
        self.stats
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn register(
        &mut self,
        pd: Handle,
        va: u64,
        length: u64,
        access: MrAccess,
    ) -> Result<(Handle, Handle), MrError> {
        if length == 0 {
            return Err(MrError::ZeroLength);
        }
        if self.by_lkey.len() >= self.max_mrs {
            return Err(MrError::TableFull);
        }
        let lkey = self.next_key;
        let rkey = self.next_key + 1;
        self.next_key += 2;
        self.by_lkey.insert(
            lkey,
            MemoryRegion {
                pd,
                lkey,
                rkey,
                va,
                length,
                access,
                valid: true,
            },
        );
        self.rkey_to_lkey.insert(rkey, lkey);
        Ok((lkey, rkey))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn deregister(&mut self, lkey: Handle) -> bool {
        if let Some(mr) = self.by_lkey.get_mut(&lkey) {
            mr.valid = false;
            true
        } else {
            false
        }
    }

    fn bounds_ok(mr: &MemoryRegion, addr: u64, len: u64) -> bool {
        addr >= mr.va && addr.saturating_add(len) <= mr.va.saturating_add(mr.length)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn validate_lkey(
        &mut self,
        lkey: Handle,
        addr: u64,
        len: u64,
        is_write: bool,
    ) -> Result<(), MrError> {
        self.stats.validations += 1;
        let mr = self.by_lkey.get(&lkey).filter(|m| m.valid).ok_or(MrError::NotFound);
        let mr = match mr {
            Ok(mr) => mr,
            Err(e) => {
                self.stats.access_errors += 1;
                return Err(e);
            }
        };
        if !Self::bounds_ok(mr, addr, len) {
            self.stats.access_errors += 1;
            return Err(MrError::OutOfBounds);
        }
        let needed = if is_write { MrAccess::LOCAL_WRITE } else { MrAccess::LOCAL_READ };
        if !mr.access.has(needed) {
            self.stats.access_errors += 1;
            return Err(MrError::AccessDenied);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn validate_rkey(
        &mut self,
        rkey: Handle,
        pd: Handle,
        addr: u64,
        len: u64,
        is_write: bool,
    ) -> Result<(), MrError> {
        self.stats.validations += 1;
        let lkey = match self.rkey_to_lkey.get(&rkey) {
            Some(l) => *l,
            None => {
                self.stats.access_errors += 1;
                return Err(MrError::NotFound);
            }
        };
        let mr = self.by_lkey.get(&lkey).filter(|m| m.valid).ok_or(MrError::NotFound);
        let mr = match mr {
            Ok(mr) => mr,
            Err(e) => {
                self.stats.access_errors += 1;
                return Err(e);
            }
        };
        if mr.pd != pd {
            self.stats.access_errors += 1;
            return Err(MrError::PdMismatch);
        }
        if !Self::bounds_ok(mr, addr, len) {
            self.stats.access_errors += 1;
            return Err(MrError::OutOfBounds);
        }
        let needed = if is_write { MrAccess::REMOTE_WRITE } else { MrAccess::REMOTE_READ };
        if !mr.access.has(needed) {
            self.stats.access_errors += 1;
            return Err(MrError::AccessDenied);
        }
        Ok(())
    }
}
