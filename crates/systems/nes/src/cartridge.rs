//! Cartridge images
//!
//! Two formats are accepted:
//! - iNES with mapper 0: 16KB PRG is mirrored at $8000 and $C000, 32KB PRG
//!   fills $8000-$FFFF. CHR data is kept but not mapped anywhere.
//! - Raw images with no header, placed so the last byte lands at $FFFF.
//!
//! Images are copied into the bus with `load_block`, so cartridge space is
//! plain storage afterwards.

use pane_core::cpu_6502::Memory6502;
use thiserror::Error;

use crate::bus::CARTRIDGE_SIZE;

pub const INES_MAGIC: &[u8; 4] = b"NES\x1A";
const HEADER_SIZE: usize = 16;
const TRAINER_SIZE: usize = 512;
const PRG_BANK_SIZE: usize = 0x4000;
const CHR_BANK_SIZE: usize = 0x2000;

#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("Image too small")]
    TooSmall,
    #[error("Unsupported mapper: {0}")]
    UnsupportedMapper(u8),
    #[error("Image truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Image too large: {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    FourScreen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    INes,
    Raw,
}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub prg_rom: Vec<u8>,
    pub chr_rom: Vec<u8>,
    pub mapper: u8,
    pub mirroring: Mirroring,
    pub format: ImageFormat,
}

impl Cartridge {
    pub fn from_bytes(data: &[u8]) -> Result<Self, CartridgeError> {
        if data.starts_with(INES_MAGIC) {
            Self::from_ines(data)
        } else {
            Self::from_raw(data)
        }
    }

    fn from_ines(data: &[u8]) -> Result<Self, CartridgeError> {
        if data.len() < HEADER_SIZE {
            return Err(CartridgeError::TooSmall);
        }
        let header = &data[..HEADER_SIZE];
        let prg_size = header[4] as usize * PRG_BANK_SIZE;
        let chr_size = header[5] as usize * CHR_BANK_SIZE;
        let mapper = (header[6] >> 4) | (header[7] & 0xF0);
        if mapper != 0 {
            return Err(CartridgeError::UnsupportedMapper(mapper));
        }
        if prg_size == 0 {
            return Err(CartridgeError::TooSmall);
        }
        if prg_size > 2 * PRG_BANK_SIZE {
            return Err(CartridgeError::TooLarge(prg_size));
        }

        // flags 6: bit 0 vertical, bit 2 trainer, bit 3 four-screen
        let mirroring = if header[6] & 0x08 != 0 {
            Mirroring::FourScreen
        } else if header[6] & 0x01 != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let trainer = if header[6] & 0x04 != 0 { TRAINER_SIZE } else { 0 };

        let prg_start = HEADER_SIZE + trainer;
        let chr_start = prg_start + prg_size;
        let expected = chr_start + chr_size;
        if data.len() < expected {
            return Err(CartridgeError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            prg_rom: data[prg_start..chr_start].to_vec(),
            chr_rom: data[chr_start..expected].to_vec(),
            mapper,
            mirroring,
            format: ImageFormat::INes,
        })
    }

    fn from_raw(data: &[u8]) -> Result<Self, CartridgeError> {
        if data.is_empty() {
            return Err(CartridgeError::TooSmall);
        }
        if data.len() > CARTRIDGE_SIZE {
            return Err(CartridgeError::TooLarge(data.len()));
        }
        Ok(Self {
            prg_rom: data.to_vec(),
            chr_rom: Vec::new(),
            mapper: 0,
            mirroring: Mirroring::Horizontal,
            format: ImageFormat::Raw,
        })
    }

    /// Where each copy of PRG data goes in the CPU address space.
    pub fn placements(&self) -> Vec<u16> {
        match self.format {
            ImageFormat::INes if self.prg_rom.len() == PRG_BANK_SIZE => vec![0x8000, 0xC000],
            ImageFormat::INes => vec![0x8000],
            ImageFormat::Raw => vec![(0x1_0000 - self.prg_rom.len()) as u16],
        }
    }

    /// Copy the image into `bus`.
    pub fn install<M: Memory6502 + ?Sized>(&self, bus: &mut M) {
        for dst in self.placements() {
            bus.load_block(&self.prg_rom, dst);
        }
    }

    /// Reset vector stored in the last bytes of PRG data.
    pub fn reset_vector(&self) -> Option<u16> {
        let len = self.prg_rom.len();
        if len < 4 {
            return None;
        }
        let lo = self.prg_rom[len - 4] as u16;
        let hi = self.prg_rom[len - 3] as u16;
        Some((hi << 8) | lo)
    }
}
