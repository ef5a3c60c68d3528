//! DMA engine: read/write/burst/scatter-gather transfers over
//! [`HostMemory`], with counters. Grounded on
//! `include/nic/dma_engine.h`, `dma_types.h`, `src/dma_types.cpp`.

use crate::host_memory::{HostMemory, MemoryError};
use crate::sgl::Sgl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    TranslationFault,
    OutOfBounds,
    FaultInjected,
    AccessError,
    AlignmentError,
    InternalError,
}

pub type DmaResult<T> = Result<T, DmaError>;

impl From<MemoryError> for DmaError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::OutOfBounds => DmaError::OutOfBounds,
            MemoryError::IommuFault => DmaError::TranslationFault,
            MemoryError::FaultInjected => DmaError::FaultInjected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DmaStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
}

pub struct DmaEngine {
    stats: DmaStats,
}

impl Default for DmaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaEngine {
    pub fn new() -> Self {
        Self {
            stats: DmaStats::default(),
        }
    }

    pub fn stats(&self) -> DmaStats {
        self.stats
    }

    #[tracing::instrument(level = "trace", skip(self, mem, buf))]
    pub fn read(&mut self, mem: &HostMemory, addr: u64, buf: &mut [u8]) -> DmaResult<()> {
        match mem.read(addr, buf) {
            Ok(()) => {
                self.stats.bytes_read += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.errors += 1;
                Err(e.into())
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, mem, data))]
    pub fn write(&mut self, mem: &mut HostMemory, addr: u64, data: &[u8]) -> DmaResult<()> {
        match mem.write(addr, data) {
            Ok(()) => {
                self.stats.bytes_written += data.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.errors += 1;
                Err(e.into())
            }
        }
    }

    pub fn read_burst(
        &mut self,
        mem: &HostMemory,
        addr: u64,
        buf: &mut [u8],
        beat: usize,
        stride: usize,
    ) -> DmaResult<()> {
        if beat == 0 || stride == 0 || buf.len() % beat != 0 {
            self.stats.errors += 1;
            return Err(DmaError::AlignmentError);
        }
        let beats = buf.len() / beat;
        for i in 0..beats {
            let src = addr + (i * stride) as u64;
            let dst = &mut buf[i * beat..(i + 1) * beat];
            self.read(mem, src, dst)?;
        }
        Ok(())
    }

    pub fn write_burst(
        &mut self,
        mem: &mut HostMemory,
        addr: u64,
        buf: &[u8],
        beat: usize,
        stride: usize,
    ) -> DmaResult<()> {
        if beat == 0 || stride == 0 || buf.len() % beat != 0 {
            self.stats.errors += 1;
            return Err(DmaError::AlignmentError);
        }
        let beats = buf.len() / beat;
        for i in 0..beats {
            let dst = addr + (i * stride) as u64;
            let src = &buf[i * beat..(i + 1) * beat];
            self.write(mem, dst, src)?;
        }
        Ok(())
    }

    /// Transfers between a scatter-gather list and a single contiguous
    /// buffer. `direction` determines which side is the SGL.
    #[tracing::instrument(level = "trace", skip(self, mem, sgl, contiguous_buf))]
    pub fn transfer_sgl(
        &mut self,
        mem: &mut HostMemory,
        sgl: &Sgl,
        direction: Direction,
        contiguous_buf: &mut [u8],
    ) -> DmaResult<()> {
        if sgl.is_empty() || contiguous_buf.len() < sgl.total_len() {
            self.stats.errors += 1;
            return Err(DmaError::AccessError);
        }
        let mut offset = 0usize;
        for entry in sgl.entries() {
            let len = entry.length as usize;
            match direction {
                Direction::DeviceToHost => {
                    self.write(mem, entry.address, &contiguous_buf[offset..offset + len])?;
                }
                Direction::HostToDevice => {
                    self.read(mem, entry.address, &mut contiguous_buf[offset..offset + len])?;
                }
            }
            offset += len;
        }
        Ok(())
    }
}
