//! NES system: the 6502 core wired to the NES address map, paced by a
//! frame-timing picture unit.

mod bus;
mod cartridge;
mod config;
mod ppu;

pub use bus::{decode, Bus, BusError, BusSnapshot, Region, CARTRIDGE_SIZE, OPEN_BUS};
pub use cartridge::{Cartridge, CartridgeError, ImageFormat, Mirroring};
pub use config::NesConfig;
pub use ppu::{Ppu, PpuSnapshot, DOTS_PER_FRAME, VISIBLE_HEIGHT, VISIBLE_WIDTH};

use pane_core::cpu_6502::{Cpu6502, CpuError, CpuSnapshot, InterruptKind};
use pane_core::logging::LogFilterError;
use pane_core::{types::Frame, MountPointInfo, System};
use serde::de::Error as _;
use serde_json::Value;
use thiserror::Error;

const SAVE_STATE_VERSION: u64 = 1;
const SYSTEM_ID: &str = "nes";

#[derive(Debug, Error)]
pub enum NesError {
    #[error("CPU error: {0}")]
    Cpu(#[from] CpuError),
    #[error("Cartridge error: {0}")]
    Cartridge(#[from] CartridgeError),
    #[error("Log filter error: {0}")]
    Log(#[from] LogFilterError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("No cartridge loaded")]
    NoCartridge,
    #[error("Invalid mount point: {0}")]
    InvalidMountPoint(String),
}

/// NES system
///
/// Owns the CPU (which owns the bus) and the picture unit. Each CPU cycle is
/// preceded by `ppu_steps_per_cpu_step` picture-unit steps.
#[derive(Debug)]
pub struct NesSystem {
    cpu: Cpu6502<Bus>,
    ppu: Ppu,
    config: NesConfig,
    cartridge: Option<Cartridge>,
    powered: bool,
}

impl Default for NesSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl NesSystem {
    /// Create a system with the default configuration.
    pub fn new() -> Self {
        Self::build(NesConfig::default())
    }

    /// Create a system, applying the configuration's log filter.
    pub fn with_config(config: NesConfig) -> Result<Self, NesError> {
        if let Some(problem) = config.problem() {
            return Err(NesError::InvalidConfig(problem));
        }
        config.apply_logging()?;
        Ok(Self::build(config))
    }

    fn build(config: NesConfig) -> Self {
        Self {
            cpu: Cpu6502::with_bus(Bus::new()),
            ppu: Ppu::new(config.frame_dots),
            config,
            cartridge: None,
            powered: false,
        }
    }

    pub fn config(&self) -> &NesConfig {
        &self.config
    }

    pub fn cpu(&self) -> &Cpu6502<Bus> {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu6502<Bus> {
        &mut self.cpu
    }

    pub fn bus(&self) -> Option<&Bus> {
        self.cpu.bus()
    }

    pub fn bus_mut(&mut self) -> Option<&mut Bus> {
        self.cpu.bus_mut()
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cartridge.as_ref()
    }

    /// Power-on: start the CPU from the reset vector and restart frame timing.
    pub fn power_on(&mut self) -> Result<(), NesError> {
        self.cpu.start()?;
        self.ppu.reset();
        self.powered = true;
        Ok(())
    }

    pub fn request_interrupt(&mut self, kind: InterruptKind) {
        self.cpu.request_interrupt(kind);
    }

    /// One CPU cycle, preceded by its picture-unit steps.
    pub fn step(&mut self) -> Result<(), NesError> {
        for _ in 0..self.config.ppu_steps_per_cpu_step {
            self.ppu.step();
        }
        self.cpu.advance()?;
        Ok(())
    }

    pub fn frame_count(&self) -> u64 {
        self.ppu.frame_count()
    }
}

impl System for NesSystem {
    type Error = NesError;

    fn reset(&mut self) -> Result<(), NesError> {
        self.cpu.reset()?;
        self.ppu.reset();
        Ok(())
    }

    fn step_frame(&mut self) -> Result<Frame, NesError> {
        if !self.powered {
            return Err(NesError::NoCartridge);
        }
        while !self.ppu.should_render() {
            self.step()?;
        }
        let frame = self.ppu.frame().clone();
        self.ppu.rendered();
        Ok(frame)
    }

    fn save_state(&self) -> Value {
        serde_json::json!({
            "version": SAVE_STATE_VERSION,
            "system": SYSTEM_ID,
            "cpu": self.cpu.snapshot(),
            "bus": self.cpu.bus().and_then(Bus::snapshot),
            "ppu": self.ppu.snapshot(),
        })
    }

    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error> {
        if v["version"].as_u64() != Some(SAVE_STATE_VERSION) {
            return Err(serde_json::Error::custom("unsupported save state version"));
        }
        if v["system"].as_str() != Some(SYSTEM_ID) {
            return Err(serde_json::Error::custom("save state is for another system"));
        }

        // Decode everything before touching any component.
        let cpu: CpuSnapshot = serde_json::from_value(v["cpu"].clone())?;
        let bus: Option<BusSnapshot> = serde_json::from_value(v["bus"].clone())?;
        let ppu: PpuSnapshot = serde_json::from_value(v["ppu"].clone())?;

        if let (Some(snapshot), Some(target)) = (bus, self.cpu.bus_mut()) {
            target.restore(&snapshot).map_err(serde_json::Error::custom)?;
        }
        self.cpu.restore(&cpu);
        self.ppu.restore(&ppu);
        self.powered = true;
        Ok(())
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        vec![MountPointInfo {
            id: "Cartridge".to_string(),
            name: "Cartridge Slot".to_string(),
            extensions: vec!["nes".to_string(), "bin".to_string()],
            required: true,
        }]
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), NesError> {
        if mount_point_id != "Cartridge" {
            return Err(NesError::InvalidMountPoint(mount_point_id.to_string()));
        }

        let cartridge = Cartridge::from_bytes(data)?;
        let bus = self.cpu.bus_mut().ok_or(CpuError::UnboundBus)?;
        bus.clear_cartridge();
        cartridge.install(bus);
        self.cartridge = Some(cartridge);

        self.power_on()
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), NesError> {
        if mount_point_id != "Cartridge" {
            return Err(NesError::InvalidMountPoint(mount_point_id.to_string()));
        }

        if let Some(bus) = self.cpu.bus_mut() {
            bus.clear_cartridge();
        }
        self.cartridge = None;
        self.powered = false;
        Ok(())
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        mount_point_id == "Cartridge" && self.cartridge.is_some()
    }
}
