//! Flat addressable host memory with optional address translation and
//! fault injection. Grounded on `include/nic/host_memory.h` and
//! `src/simple_host_memory.cpp`.

/// Outcome of a host memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfBounds,
    IommuFault,
    FaultInjected,
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Optional translator from an IOVA-like address to a physical-like one.
/// Installed by test code that wants to model IOMMU remapping or faults.
pub trait AddressTranslator {
    fn translate(&self, iova: u64) -> Option<u64>;
}

/// Optional fault injector consulted before every access.
pub trait FaultInjector {
    /// Return `true` to force the access at `addr` to fail.
    fn should_fault(&self, addr: u64, len: usize, is_write: bool) -> bool;
}

pub struct HostMemory {
    bytes: Vec<u8>,
    translator: Option<Box<dyn AddressTranslator>>,
    fault_injector: Option<Box<dyn FaultInjector>>,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
            translator: None,
            fault_injector: None,
        }
    }

    pub fn with_translator(mut self, translator: Box<dyn AddressTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_fault_injector(mut self, injector: Box<dyn FaultInjector>) -> Self {
        self.fault_injector = Some(injector);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn resolve(&self, addr: u64, len: usize, is_write: bool) -> MemoryResult<u64> {
        if let Some(inj) = &self.fault_injector {
            if inj.should_fault(addr, len, is_write) {
                return Err(MemoryError::FaultInjected);
            }
        }
        let phys = match &self.translator {
            Some(t) => t.translate(addr).ok_or(MemoryError::IommuFault)?,
            None => addr,
        };
        let end = phys
            .checked_add(len as u64)
            .ok_or(MemoryError::OutOfBounds)?;
        if end > self.bytes.len() as u64 {
            return Err(MemoryError::OutOfBounds);
        }
        Ok(phys)
    }

    #[tracing::instrument(level = "trace", skip(self, out))]
    pub fn read(&self, addr: u64, out: &mut [u8]) -> MemoryResult<()> {
        let phys = self.resolve(addr, out.len(), false)?;
        let start = phys as usize;
        out.copy_from_slice(&self.bytes[start..start + out.len()]);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, data))]
    pub fn write(&mut self, addr: u64, data: &[u8]) -> MemoryResult<()> {
        let phys = self.resolve(addr, data.len(), true)?;
        let start = phys as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut mem = HostMemory::new(64);
        mem.write(8, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        mem.read(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds() {
        let mem = HostMemory::new(16);
        let mut out = [0u8; 4];
        assert_eq!(mem.read(14, &mut out), Err(MemoryError::OutOfBounds));
    }

    struct AlwaysFault;
    impl FaultInjector for AlwaysFault {
        fn should_fault(&self, _addr: u64, _len: usize, _is_write: bool) -> bool {
            true
        }
    }

    #[test]
    fn fault_injection() {
        let mem = HostMemory::new(16).with_fault_injector(Box::new(AlwaysFault));
        let mut out = [0u8; 4];
        assert_eq!(mem.read(0, &mut out), Err(MemoryError::FaultInjected));
    }
}
