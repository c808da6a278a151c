//! Memory-mapped register ports
//!
//! Port devices claim an address range and register width at construction
//! time; the CPU side reaches them only through [`IoMap::read`] and
//! [`IoMap::write`].

use crate::snapshot::{Snapshot, SnapshotError, SnapshotResult, StateReader, StateWriter};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

/// Registers in a latch port
pub const LATCH_REGISTERS: usize = 16;

/// I/O map errors
#[derive(Debug, Error)]
pub enum IoMapError {
    #[error("range {base:#x}..{end:#x} overlaps {other}")]
    Overlap { base: u32, end: u64, other: String },

    #[error("invalid register width: {0}")]
    InvalidWidth(u8),

    #[error("empty range at {0:#x}")]
    EmptyRange(u32),

    #[error("range at {0:#x} runs past the end of the address space")]
    AddressOverflow(u32),
}

/// A device reachable through register reads and writes
pub trait IoDevice {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Read `size` bytes at `address` within range `index`
    fn read_register(&mut self, index: usize, address: u32, size: u8) -> u32;

    /// Write `size` bytes of `value` at `address` within range `index`
    fn write_register(&mut self, index: usize, address: u32, size: u8, value: u32);
}

/// Shared handle to a port device
pub type IoDeviceRef = Rc<RefCell<dyn IoDevice>>;

fn size_mask(size: u8) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

fn valid_width(width: u8) -> bool {
    matches!(width, 1 | 2 | 4)
}

struct Mapping {
    base: u32,
    end: u64,
    width: u8,
    index: usize,
    device: IoDeviceRef,
}

/// Address decoder for port devices
#[derive(Default)]
pub struct IoMap {
    mappings: Vec<Mapping>,
}

impl IoMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `count` registers of `width` bytes starting at `base` for
    /// range `index` of `device`
    pub fn register(
        &mut self,
        device: &IoDeviceRef,
        index: usize,
        base: u32,
        count: u32,
        width: u8,
    ) -> Result<(), IoMapError> {
        if !valid_width(width) {
            return Err(IoMapError::InvalidWidth(width));
        }
        if count == 0 {
            return Err(IoMapError::EmptyRange(base));
        }
        let end = base as u64 + count as u64 * width as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(IoMapError::AddressOverflow(base));
        }

        if let Some(other) = self
            .mappings
            .iter()
            .find(|m| (base as u64) < m.end && (m.base as u64) < end)
        {
            return Err(IoMapError::Overlap {
                base,
                end,
                other: other.device.borrow().name().to_string(),
            });
        }

        log::info!(
            "Mapped {} range {} at {:#x}..{:#x} ({} x {} bytes)",
            device.borrow().name(),
            index,
            base,
            end,
            count,
            width
        );
        self.mappings.push(Mapping {
            base,
            end,
            width,
            index,
            device: Rc::clone(device),
        });
        Ok(())
    }

    fn find(&self, address: u32) -> Option<&Mapping> {
        self.mappings
            .iter()
            .find(|m| m.base <= address && (address as u64) < m.end)
    }

    /// Read `size` bytes at `address`. Unmapped addresses float high.
    pub fn read(&self, address: u32, size: u8) -> u32 {
        let size = if valid_width(size) { size } else { 4 };
        match self.find(address) {
            Some(m) => {
                let value = m
                    .device
                    .borrow_mut()
                    .read_register(m.index, address - m.base, size)
                    & size_mask(size);
                log::trace!("read {:#x}/{} -> {:#x}", address, size, value);
                value
            }
            None => {
                log::trace!("read from unmapped {:#x}", address);
                size_mask(size)
            }
        }
    }

    /// Write `size` bytes of `value` at `address`. Returns whether anything
    /// claimed the address.
    pub fn write(&self, address: u32, size: u8, value: u32) -> bool {
        let size = if valid_width(size) { size } else { 4 };
        match self.find(address) {
            Some(m) => {
                log::trace!("write {:#x}/{} <- {:#x}", address, size, value);
                m.device.borrow_mut().write_register(
                    m.index,
                    address - m.base,
                    size,
                    value & size_mask(size),
                );
                true
            }
            None => {
                log::trace!("write to unmapped {:#x}", address);
                false
            }
        }
    }

    /// Register width of the range covering `address`
    pub fn width_at(&self, address: u32) -> Option<u8> {
        self.find(address).map(|m| m.width)
    }
}

/// Bank of plain read/write registers
#[derive(Debug, Clone)]
pub struct LatchPort {
    name: String,
    width: u8,
    count: usize,
    registers: [u32; LATCH_REGISTERS],
}

impl LatchPort {
    /// `count` registers of `width` bytes each. `count` is clamped to
    /// [`LATCH_REGISTERS`].
    pub fn new(name: &str, count: usize, width: u8) -> Result<Self, IoMapError> {
        if !valid_width(width) {
            return Err(IoMapError::InvalidWidth(width));
        }
        Ok(Self {
            name: name.to_string(),
            width,
            count: count.min(LATCH_REGISTERS),
            registers: [0; LATCH_REGISTERS],
        })
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Current value of register `n`
    pub fn register(&self, n: usize) -> Option<u32> {
        self.registers[..self.count].get(n).copied()
    }

    fn slot(&self, address: u32) -> Option<usize> {
        let n = (address / self.width as u32) as usize;
        (n < self.count).then_some(n)
    }
}

impl IoDevice for LatchPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_register(&mut self, _index: usize, address: u32, size: u8) -> u32 {
        match self.slot(address) {
            Some(n) => {
                let shift = (address % self.width as u32) * 8;
                (self.registers[n] >> shift) & size_mask(size)
            }
            None => size_mask(size),
        }
    }

    fn write_register(&mut self, _index: usize, address: u32, size: u8, value: u32) {
        if let Some(n) = self.slot(address) {
            let shift = (address % self.width as u32) * 8;
            let mask = (size_mask(size) << shift) & size_mask(self.width);
            self.registers[n] = (self.registers[n] & !mask) | ((value << shift) & mask);
        }
    }
}

impl Snapshot for LatchPort {
    const MAGIC_START: u32 = 0x4843_544C;
    const MAGIC_END: u32 = 0x4C54_4348;
    const STATE_SIZE: usize = 4 + 4 * LATCH_REGISTERS;

    fn save_state(&self) -> Vec<u8> {
        let mut writer = StateWriter::with_capacity(Self::STATE_SIZE);
        writer.u8(self.count as u8).u8(self.width).u8(0).u8(0);
        for value in self.registers {
            writer.u32(value);
        }
        writer.finish()
    }

    fn load_state(&mut self, state: &[u8]) -> SnapshotResult<()> {
        let mut reader = StateReader::new(state);
        let count = reader.u8()? as usize;
        let width = reader.u8()?;
        reader.u8()?;
        reader.u8()?;

        if count != self.count || width != self.width {
            return Err(SnapshotError::InvalidState(format!(
                "{}: state has {} x {} byte registers, port has {} x {}",
                self.name, count, width, self.count, self.width
            )));
        }

        let mut registers = [0u32; LATCH_REGISTERS];
        for slot in registers.iter_mut() {
            *slot = reader.u32()?;
        }
        self.registers = registers;
        Ok(())
    }
}
