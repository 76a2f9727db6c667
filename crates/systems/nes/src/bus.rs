//! NES CPU address space
//!
//! $0000-$1FFF: 2KB internal RAM, mirrored every $0800
//! $2000-$3FFF: PPU registers, mirrored every 8 bytes
//! $4000-$4017: APU and I/O registers
//! $4018-$401F: normally disabled APU/I/O test registers
//! $4020-$FFFF: cartridge space (flat, no bank switching)
//!
//! Every region is plain storage: writes are kept and read back, including in
//! the register windows, so code polling a register sees what it last wrote.

use pane_core::cpu_6502::{Memory6502, STACK_BASE};
use pane_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RAM_SIZE: usize = 0x0800;
pub const PPU_REGISTERS_SIZE: usize = 0x0008;
pub const APU_REGISTERS_SIZE: usize = 0x0018;
pub const IO_UNUSED_SIZE: usize = 0x0008;
pub const CARTRIDGE_START: u16 = 0x4020;
pub const CARTRIDGE_SIZE: usize = 0x1_0000 - CARTRIDGE_START as usize;

/// Returned by reads once the backing storage is gone.
pub const OPEN_BUS: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Ram,
    PpuRegisters,
    ApuRegisters,
    IoUnused,
    Cartridge,
}

/// Reduce a CPU address to its region and the offset into that region's backing.
pub fn decode(addr: u16) -> (Region, usize) {
    let a = addr as usize;
    match addr {
        0x0000..=0x1FFF => (Region::Ram, a % RAM_SIZE),
        0x2000..=0x3FFF => (Region::PpuRegisters, (a - 0x2000) % PPU_REGISTERS_SIZE),
        0x4000..=0x4017 => (Region::ApuRegisters, a - 0x4000),
        0x4018..=0x401F => (Region::IoUnused, a - 0x4018),
        0x4020..=0xFFFF => (Region::Cartridge, a - CARTRIDGE_START as usize),
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus storage has been torn down")]
    TornDown,
    #[error("{region} snapshot is {actual} bytes, expected {expected}")]
    SnapshotSize {
        region: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Save-state image of the bus. Cartridge space is not included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub ram: Vec<u8>,
    pub ppu_registers: Vec<u8>,
    pub apu_registers: Vec<u8>,
    pub io_unused: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Regions {
    ram: [u8; RAM_SIZE],
    ppu_registers: [u8; PPU_REGISTERS_SIZE],
    apu_registers: [u8; APU_REGISTERS_SIZE],
    io_unused: [u8; IO_UNUSED_SIZE],
    cartridge: Vec<u8>,
}

impl Regions {
    fn new() -> Self {
        Self {
            ram: [0; RAM_SIZE],
            ppu_registers: [0; PPU_REGISTERS_SIZE],
            apu_registers: [0; APU_REGISTERS_SIZE],
            io_unused: [0; IO_UNUSED_SIZE],
            cartridge: vec![0; CARTRIDGE_SIZE],
        }
    }

    fn backing(&self, region: Region) -> &[u8] {
        match region {
            Region::Ram => &self.ram,
            Region::PpuRegisters => &self.ppu_registers,
            Region::ApuRegisters => &self.apu_registers,
            Region::IoUnused => &self.io_unused,
            Region::Cartridge => &self.cartridge,
        }
    }

    fn backing_mut(&mut self, region: Region) -> &mut [u8] {
        match region {
            Region::Ram => &mut self.ram,
            Region::PpuRegisters => &mut self.ppu_registers,
            Region::ApuRegisters => &mut self.apu_registers,
            Region::IoUnused => &mut self.io_unused,
            Region::Cartridge => &mut self.cartridge,
        }
    }
}

/// NES memory bus
///
/// Storage is allocated by [`Bus::new`] and released by [`Bus::teardown`].
/// After teardown every read returns the open-bus sentinel and writes are
/// dropped; nothing panics.
#[derive(Debug, Clone)]
pub struct Bus {
    regions: Option<Box<Regions>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            regions: Some(Box::new(Regions::new())),
        }
    }

    /// Free the backing storage.
    pub fn teardown(&mut self) {
        if self.regions.take().is_some() {
            log(LogCategory::Bus, LogLevel::Debug, || {
                "BUS: storage released".to_string()
            });
        }
    }

    pub fn is_live(&self) -> bool {
        self.regions.is_some()
    }

    /// Zero cartridge space, e.g. before installing a new image.
    pub fn clear_cartridge(&mut self) {
        if let Some(r) = self.regions.as_mut() {
            r.cartridge.fill(0);
        }
    }

    pub fn snapshot(&self) -> Option<BusSnapshot> {
        self.regions.as_ref().map(|r| BusSnapshot {
            ram: r.ram.to_vec(),
            ppu_registers: r.ppu_registers.to_vec(),
            apu_registers: r.apu_registers.to_vec(),
            io_unused: r.io_unused.to_vec(),
        })
    }

    /// Restore everything but cartridge space. Sizes are checked before any
    /// region is overwritten.
    pub fn restore(&mut self, s: &BusSnapshot) -> Result<(), BusError> {
        let r = self.regions.as_mut().ok_or(BusError::TornDown)?;

        let checks = [
            ("ram", RAM_SIZE, s.ram.len()),
            ("ppu_registers", PPU_REGISTERS_SIZE, s.ppu_registers.len()),
            ("apu_registers", APU_REGISTERS_SIZE, s.apu_registers.len()),
            ("io_unused", IO_UNUSED_SIZE, s.io_unused.len()),
        ];
        for (region, expected, actual) in checks {
            if expected != actual {
                return Err(BusError::SnapshotSize {
                    region,
                    expected,
                    actual,
                });
            }
        }

        r.ram.copy_from_slice(&s.ram);
        r.ppu_registers.copy_from_slice(&s.ppu_registers);
        r.apu_registers.copy_from_slice(&s.apu_registers);
        r.io_unused.copy_from_slice(&s.io_unused);
        Ok(())
    }
}

impl Memory6502 for Bus {
    fn read(&self, addr: u16) -> u8 {
        match self.regions.as_ref() {
            Some(r) => {
                let (region, offset) = decode(addr);
                r.backing(region)[offset]
            }
            None => OPEN_BUS,
        }
    }

    fn write(&mut self, addr: u16, val: u8) {
        if let Some(r) = self.regions.as_mut() {
            let (region, offset) = decode(addr);
            r.backing_mut(region)[offset] = val;
        }
    }

    // The stack primitives leave `sp` alone when there is no storage behind it.

    fn push_byte(&mut self, sp: &mut u8, val: u8) {
        if self.regions.is_some() {
            self.write(STACK_BASE | *sp as u16, val);
            *sp = sp.wrapping_sub(1);
        }
    }

    fn pull_byte(&mut self, sp: &mut u8) -> u8 {
        if self.regions.is_none() {
            return OPEN_BUS;
        }
        *sp = sp.wrapping_add(1);
        self.read(STACK_BASE | *sp as u16)
    }

    fn load_block(&mut self, src: &[u8], dst: u16) {
        log(LogCategory::Bus, LogLevel::Debug, || {
            format!(
                "BUS: load {} bytes at {:04X} ({:?})",
                src.len(),
                dst,
                decode(dst).0
            )
        });
        for (i, byte) in src.iter().enumerate() {
            self.write(dst.wrapping_add(i as u16), *byte);
        }
    }
}
