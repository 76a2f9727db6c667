//! MOS 6502 CPU core implementation
//!
//! This module provides a reusable, cycle-stepped 6502 that any system can drive
//! by implementing the `Memory6502` trait for its bus. One call to
//! [`Cpu6502::advance`] is one clock cycle. An instruction is decoded and its
//! operand address resolved on its first cycle; its effects on registers and
//! memory are applied on its last.

mod table;

pub use table::{lookup, AddressingMode, Instruction, Operation, CYCLES, INSTRUCTIONS, INVALID};

use crate::logging::{log, LogCategory, LogLevel};
use crate::Cpu;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First byte of the fixed stack page.
pub const STACK_BASE: u16 = 0x0100;
pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

/// Status register value after `start` (I and bit 5 set).
pub const POWER_ON_STATUS: u8 = FLAG_INTERRUPT | FLAG_UNUSED;

/// Cycles between latching an interrupt and the acknowledge sequence.
const INTERRUPT_LATENCY: u32 = 6;

/// Memory interface trait for the 6502 CPU
///
/// Systems using the 6502 implement `read`/`write` with their own address
/// decoding. Word access and the stack primitives are built on top of those
/// two, so every byte they touch goes through the system's decoder.
pub trait Memory6502 {
    /// Read a byte from memory at the given address
    fn read(&self, addr: u16) -> u8;

    /// Write a byte to memory at the given address
    fn write(&mut self, addr: u16, val: u8);

    /// Little-endian word at `addr`, `addr + 1`. Each byte is decoded
    /// independently, so a word may straddle a mirror boundary.
    fn read_word(&self, addr: u16) -> u16 {
        let lo = self.read(addr) as u16;
        let hi = self.read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    fn write_word(&mut self, addr: u16, val: u16) {
        self.write(addr, (val & 0xFF) as u8);
        self.write(addr.wrapping_add(1), (val >> 8) as u8);
    }

    /// Write to the stack page at `sp`, then decrement `sp`.
    fn push_byte(&mut self, sp: &mut u8, val: u8) {
        self.write(STACK_BASE | *sp as u16, val);
        *sp = sp.wrapping_sub(1);
    }

    /// Increment `sp`, then read from the stack page.
    fn pull_byte(&mut self, sp: &mut u8) -> u8 {
        *sp = sp.wrapping_add(1);
        self.read(STACK_BASE | *sp as u16)
    }

    /// High byte first, so the low byte ends up at the lower address.
    fn push_word(&mut self, sp: &mut u8, val: u16) {
        self.push_byte(sp, (val >> 8) as u8);
        self.push_byte(sp, (val & 0xFF) as u8);
    }

    fn pull_word(&mut self, sp: &mut u8) -> u16 {
        let lo = self.pull_byte(sp) as u16;
        let hi = self.pull_byte(sp) as u16;
        (hi << 8) | lo
    }

    /// Copy `src` into the address space starting at `dst` through `write`,
    /// so decoding and mirroring apply to the load as well.
    fn load_block(&mut self, src: &[u8], dst: u16) {
        for (i, byte) in src.iter().enumerate() {
            self.write(dst.wrapping_add(i as u16), *byte);
        }
    }
}

// Lets a driver keep ownership of its bus and lend it to the CPU.
impl<M: Memory6502 + ?Sized> Memory6502 for &mut M {
    fn read(&self, addr: u16) -> u8 {
        (**self).read(addr)
    }

    fn write(&mut self, addr: u16, val: u8) {
        (**self).write(addr, val)
    }

    fn read_word(&self, addr: u16) -> u16 {
        (**self).read_word(addr)
    }

    fn write_word(&mut self, addr: u16, val: u16) {
        (**self).write_word(addr, val)
    }

    fn push_byte(&mut self, sp: &mut u8, val: u8) {
        (**self).push_byte(sp, val)
    }

    fn pull_byte(&mut self, sp: &mut u8) -> u8 {
        (**self).pull_byte(sp)
    }

    fn push_word(&mut self, sp: &mut u8, val: u16) {
        (**self).push_word(sp, val)
    }

    fn pull_word(&mut self, sp: &mut u8) -> u16 {
        (**self).pull_word(sp)
    }

    fn load_block(&mut self, src: &[u8], dst: u16) {
        (**self).load_block(src, dst)
    }
}

/// Fatal configuration errors. None of these are retried; the driver decides
/// whether to halt or restart emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("CPU has no bus attached")]
    UnboundBus,
    #[error("unknown opcode ${opcode:02X} at ${pc:04X}")]
    UnknownOpcode { opcode: u8, pc: u16 },
    #[error("no addressing mode handler for opcode ${opcode:02X}")]
    UnknownAddressingMode { opcode: u8 },
    #[error("interrupt acknowledged with no interrupt kind set")]
    UnknownInterruptKind,
}

/// Interrupt sources that can be latched with [`Cpu6502::request_interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterruptKind {
    #[default]
    None,
    Irq,
    Nmi,
    Reset,
    /// Software interrupt; vectors like BRK.
    Software,
}

impl InterruptKind {
    /// Vector address for this kind. Each kind maps to exactly one vector.
    pub fn vector(self) -> Option<u16> {
        match self {
            InterruptKind::None => None,
            InterruptKind::Irq => Some(IRQ_VECTOR),
            InterruptKind::Nmi => Some(NMI_VECTOR),
            InterruptKind::Reset => Some(RESET_VECTOR),
            InterruptKind::Software => Some(IRQ_VECTOR),
        }
    }

    fn priority(self) -> u8 {
        match self {
            InterruptKind::None => 0,
            InterruptKind::Irq | InterruptKind::Software => 1,
            InterruptKind::Nmi => 2,
            InterruptKind::Reset => 3,
        }
    }
}

/// What the most recent `advance` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Between instructions.
    #[default]
    Idle,
    /// Opcode fetched, operand resolved, cycle count assigned.
    Fetching,
    /// Waiting out the instruction's remaining cycles.
    Running,
    /// Final cycle: the operation handler (or interrupt sequence) ran.
    Executing,
    /// Inside the latency window before an interrupt is acknowledged.
    InterruptPending,
}

/// Architectural state, as stored in save states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub pc: u16,
    pub ac: u8,
    pub x: u8,
    pub y: u8,
    pub sr: u8,
    pub sp: u8,
    pub total_cycles: u64,
}

/// MOS 6502 CPU state and execution engine
///
/// The CPU does not touch backing storage directly; every access goes through
/// the attached `Memory6502`. Attach a bus with [`Cpu6502::attach_bus`] (or
/// construct with [`Cpu6502::with_bus`]) before calling `start`.
#[derive(Debug)]
pub struct Cpu6502<M: Memory6502> {
    /// Program counter
    pub pc: u16,
    /// Accumulator
    pub ac: u8,
    /// X index register
    pub x: u8,
    /// Y index register
    pub y: u8,
    /// Status register (NV-BDIZC)
    pub sr: u8,
    /// Stack pointer (points to 0x0100 + sp)
    pub sp: u8,

    opcode: u8,
    instruction: Instruction,
    operand: u16,
    remaining: u32,
    total_cycles: u64,

    /// Latched but not yet started.
    requested: Option<InterruptKind>,
    /// Latency window running; `pending_kind` is acknowledged when it ends.
    interrupt_pending: bool,
    pending_kind: InterruptKind,

    phase: Phase,
    memory: Option<M>,
}

impl<M: Memory6502> Default for Cpu6502<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Memory6502> Cpu6502<M> {
    /// Create a CPU with no bus attached.
    pub fn new() -> Self {
        Self {
            pc: 0,
            ac: 0,
            x: 0,
            y: 0,
            sr: 0,
            sp: 0,
            opcode: 0,
            instruction: INVALID,
            operand: 0,
            remaining: 0,
            total_cycles: 0,
            requested: None,
            interrupt_pending: false,
            pending_kind: InterruptKind::None,
            phase: Phase::Idle,
            memory: None,
        }
    }

    /// Create a CPU with `memory` already attached.
    pub fn with_bus(memory: M) -> Self {
        let mut cpu = Self::new();
        cpu.attach_bus(memory);
        cpu
    }

    /// Bind the bus. Replaces any previously attached bus.
    pub fn attach_bus(&mut self, memory: M) {
        self.memory = Some(memory);
    }

    /// Unbind and return the bus, leaving the CPU unable to advance.
    pub fn detach_bus(&mut self) -> Option<M> {
        self.memory.take()
    }

    pub fn bus(&self) -> Option<&M> {
        self.memory.as_ref()
    }

    pub fn bus_mut(&mut self) -> Option<&mut M> {
        self.memory.as_mut()
    }

    /// Power-on: clear every register and counter, set SR to 0x24 and load
    /// PC from the reset vector.
    pub fn start(&mut self) -> Result<(), CpuError> {
        self.ensure_bus()?;
        self.ac = 0;
        self.x = 0;
        self.y = 0;
        self.sp = 0;
        self.sr = POWER_ON_STATUS;
        self.pc = self.read_word(RESET_VECTOR);

        self.opcode = 0;
        self.instruction = INVALID;
        self.operand = 0;
        self.remaining = 0;
        self.total_cycles = 0;
        self.requested = None;
        self.interrupt_pending = false;
        self.pending_kind = InterruptKind::None;
        self.phase = Phase::Idle;

        log(LogCategory::CPU, LogLevel::Debug, || {
            format!("CPU: start, reset vector -> PC={:04X}", self.pc)
        });
        Ok(())
    }

    /// Warm reset: set I, drop SP by three without touching memory, reload PC
    /// from the reset vector and abandon any in-flight instruction.
    pub fn reset(&mut self) -> Result<(), CpuError> {
        self.ensure_bus()?;
        self.sr |= FLAG_INTERRUPT;
        self.sp = self.sp.wrapping_sub(3);
        self.pc = self.read_word(RESET_VECTOR);
        self.remaining = 0;
        self.interrupt_pending = false;
        self.pending_kind = InterruptKind::None;
        self.phase = Phase::Idle;

        log(LogCategory::CPU, LogLevel::Debug, || {
            format!("CPU: reset -> PC={:04X} SP={:02X}", self.pc, self.sp)
        });
        Ok(())
    }

    /// Latch an interrupt. It is only taken once the CPU is idle, never in the
    /// middle of an instruction. A lower-priority request does not replace a
    /// higher-priority one that is still latched.
    pub fn request_interrupt(&mut self, kind: InterruptKind) {
        if let Some(current) = self.requested {
            if kind.priority() < current.priority() {
                return;
            }
        }
        self.requested = Some(kind);
    }

    /// Drop a latched request that has not started yet (IRQ line released).
    pub fn clear_interrupt_request(&mut self) {
        self.requested = None;
    }

    pub fn interrupt_requested(&self) -> Option<InterruptKind> {
        self.requested
    }

    /// Advance the CPU by exactly one clock cycle.
    pub fn advance(&mut self) -> Result<(), CpuError> {
        self.ensure_bus()?;
        self.total_cycles = self.total_cycles.wrapping_add(1);

        if self.remaining == 0 {
            if let Some(kind) = self.requested.filter(|k| !self.is_masked(*k)) {
                self.requested = None;
                self.pending_kind = kind;
                self.interrupt_pending = true;
                self.remaining = INTERRUPT_LATENCY;
                self.phase = Phase::InterruptPending;
                return Ok(());
            }

            self.fetch()?;
            self.remaining = self.remaining.saturating_sub(1);
            self.phase = Phase::Fetching;
            return Ok(());
        }

        if self.remaining > 1 {
            self.remaining -= 1;
            self.phase = if self.interrupt_pending {
                Phase::InterruptPending
            } else {
                Phase::Running
            };
            return Ok(());
        }

        self.remaining = 0;
        self.phase = Phase::Executing;
        if self.interrupt_pending {
            self.interrupt_pending = false;
            return self.acknowledge_interrupt();
        }
        self.execute()
    }

    /// Advance until the current instruction (or interrupt sequence) has
    /// completed. Returns the cycles spent.
    pub fn step_instruction(&mut self) -> Result<u32, CpuError> {
        let mut cycles = 0;
        loop {
            self.advance()?;
            cycles += 1;
            if self.remaining == 0 {
                return Ok(cycles);
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Cycles left before the in-flight instruction takes effect.
    pub fn remaining_cycles(&self) -> u32 {
        self.remaining
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn current_opcode(&self) -> u8 {
        self.opcode
    }

    pub fn current_instruction(&self) -> Instruction {
        self.instruction
    }

    /// Operand address resolved at fetch time for the in-flight instruction.
    pub fn operand_address(&self) -> u16 {
        self.operand
    }

    pub fn flag(&self, mask: u8) -> bool {
        self.sr & mask != 0
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            pc: self.pc,
            ac: self.ac,
            x: self.x,
            y: self.y,
            sr: self.sr,
            sp: self.sp,
            total_cycles: self.total_cycles,
        }
    }

    /// Restore registers from a snapshot. The CPU resumes at an instruction
    /// boundary with no interrupt latched.
    pub fn restore(&mut self, s: &CpuSnapshot) {
        self.pc = s.pc;
        self.ac = s.ac;
        self.x = s.x;
        self.y = s.y;
        self.sr = s.sr;
        self.sp = s.sp;
        self.total_cycles = s.total_cycles;
        self.remaining = 0;
        self.requested = None;
        self.interrupt_pending = false;
        self.pending_kind = InterruptKind::None;
        self.phase = Phase::Idle;
    }

    fn ensure_bus(&self) -> Result<(), CpuError> {
        if self.memory.is_some() {
            Ok(())
        } else {
            Err(CpuError::UnboundBus)
        }
    }

    fn is_masked(&self, kind: InterruptKind) -> bool {
        kind == InterruptKind::Irq && self.flag(FLAG_INTERRUPT)
    }

    // Bus access. `advance` checks the bus is bound before any of these run;
    // the fallbacks mirror the bus's own open-bus sentinels.

    #[inline]
    fn read(&self, addr: u16) -> u8 {
        self.memory.as_ref().map_or(0xFF, |m| m.read(addr))
    }

    #[inline]
    fn read_word(&self, addr: u16) -> u16 {
        self.memory.as_ref().map_or(0xFFFF, |m| m.read_word(addr))
    }

    #[inline]
    fn write(&mut self, addr: u16, val: u8) {
        if let Some(m) = self.memory.as_mut() {
            m.write(addr, val);
        }
    }

    fn push(&mut self, val: u8) {
        if let Some(m) = self.memory.as_mut() {
            m.push_byte(&mut self.sp, val);
        }
    }

    fn pull(&mut self) -> u8 {
        match self.memory.as_mut() {
            Some(m) => m.pull_byte(&mut self.sp),
            None => 0xFF,
        }
    }

    fn push_word(&mut self, val: u16) {
        if let Some(m) = self.memory.as_mut() {
            m.push_word(&mut self.sp, val);
        }
    }

    fn pull_word(&mut self) -> u16 {
        match self.memory.as_mut() {
            Some(m) => m.pull_word(&mut self.sp),
            None => 0xFFFF,
        }
    }

    #[inline]
    fn fetch_byte(&mut self) -> u8 {
        let v = self.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        v
    }

    #[inline]
    fn fetch_word(&mut self) -> u16 {
        let v = self.read_word(self.pc);
        self.pc = self.pc.wrapping_add(2);
        v
    }

    /// Word pointer stored in page zero; the high byte wraps to $00.
    fn read_zero_page_word(&self, zp: u8) -> u16 {
        let lo = self.read(zp as u16) as u16;
        let hi = self.read(zp.wrapping_add(1) as u16) as u16;
        (hi << 8) | lo
    }

    fn fetch(&mut self) -> Result<(), CpuError> {
        let pc = self.pc;
        self.opcode = self.fetch_byte();
        let (instruction, base_cycles) = lookup(self.opcode);
        if instruction.is_invalid() {
            log(LogCategory::CPU, LogLevel::Error, || {
                format!("CPU: unknown opcode {:02X} at PC={:04X}", self.opcode, pc)
            });
            // Stay on the bad opcode so every retry reports it again.
            self.pc = pc;
            return Err(CpuError::UnknownOpcode {
                opcode: self.opcode,
                pc,
            });
        }
        self.instruction = instruction;

        log(LogCategory::CPU, LogLevel::Trace, || {
            format!(
                "{:04X}  {:02X}  {} {:?}  A:{:02X} X:{:02X} Y:{:02X} P:{:02X} SP:{:02X} CYC:{}",
                pc,
                self.opcode,
                instruction.op.mnemonic(),
                instruction.mode,
                self.ac,
                self.x,
                self.y,
                self.sr,
                self.sp,
                self.total_cycles
            )
        });

        let penalty = self.resolve_operand()?;
        self.remaining = base_cycles as u32 + penalty;
        Ok(())
    }

    /// Compute the operand address for the decoded addressing mode, advancing
    /// PC past the operand bytes. Returns the extra cycles owed for page
    /// crossings and taken branches.
    fn resolve_operand(&mut self) -> Result<u32, CpuError> {
        let op = self.instruction.op;
        let (operand, penalty) = match self.instruction.mode {
            AddressingMode::Accumulator => (self.ac as u16, 0),
            AddressingMode::Implied => (0, 0),
            AddressingMode::Immediate => {
                let addr = self.pc;
                self.pc = self.pc.wrapping_add(1);
                (addr, 0)
            }
            AddressingMode::Absolute => (self.fetch_word(), 0),
            AddressingMode::AbsoluteX => {
                let base = self.fetch_word();
                indexed(base, self.x, op)
            }
            AddressingMode::AbsoluteY => {
                let base = self.fetch_word();
                indexed(base, self.y, op)
            }
            AddressingMode::Indirect => {
                let ptr = self.fetch_word();
                (self.read_word(ptr), 0)
            }
            AddressingMode::IndirectX => {
                let zp = self.fetch_byte().wrapping_add(self.x);
                (self.read_zero_page_word(zp), 0)
            }
            AddressingMode::IndirectY => {
                let zp = self.fetch_byte();
                let base = self.read_zero_page_word(zp);
                indexed(base, self.y, op)
            }
            AddressingMode::Relative if !op.is_branch() => {
                return Err(CpuError::UnknownAddressingMode {
                    opcode: self.opcode,
                })
            }
            AddressingMode::Relative => {
                let offset = self.fetch_byte() as i8;
                let target = self.pc.wrapping_add(offset as u16);
                (target, self.branch_penalty(op, target))
            }
            AddressingMode::ZeroPage => (self.fetch_byte() as u16, 0),
            AddressingMode::ZeroPageX => (self.fetch_byte().wrapping_add(self.x) as u16, 0),
            AddressingMode::ZeroPageY => (self.fetch_byte().wrapping_add(self.y) as u16, 0),
            AddressingMode::Invalid => {
                return Err(CpuError::UnknownAddressingMode {
                    opcode: self.opcode,
                })
            }
        };
        self.operand = operand;
        Ok(penalty)
    }

    /// +1 when the branch is taken, +1 more when the target is on another page.
    /// Flags cannot change between fetch and execute, so the decision made here
    /// matches the one the handler makes.
    fn branch_penalty(&self, op: Operation, target: u16) -> u32 {
        if !self.branch_taken(op) {
            return 0;
        }
        if page_crossed(self.pc, target) {
            2
        } else {
            1
        }
    }

    fn branch_taken(&self, op: Operation) -> bool {
        match op {
            Operation::Bcc => !self.flag(FLAG_CARRY),
            Operation::Bcs => self.flag(FLAG_CARRY),
            Operation::Bne => !self.flag(FLAG_ZERO),
            Operation::Beq => self.flag(FLAG_ZERO),
            Operation::Bpl => !self.flag(FLAG_NEGATIVE),
            Operation::Bmi => self.flag(FLAG_NEGATIVE),
            Operation::Bvc => !self.flag(FLAG_OVERFLOW),
            Operation::Bvs => self.flag(FLAG_OVERFLOW),
            _ => false,
        }
    }

    fn set_flag(&mut self, mask: u8, on: bool) {
        if on {
            self.sr |= mask;
        } else {
            self.sr &= !mask;
        }
    }

    fn set_zero_and_negative(&mut self, v: u8) {
        self.sr &= !(FLAG_ZERO | FLAG_NEGATIVE);
        if v == 0 {
            self.sr |= FLAG_ZERO;
        }
        self.sr |= v & FLAG_NEGATIVE;
    }

    /// The operand byte: the accumulator in accumulator mode, memory otherwise.
    fn operand_value(&self) -> u8 {
        if self.instruction.mode == AddressingMode::Accumulator {
            self.ac
        } else {
            self.read(self.operand)
        }
    }

    fn write_back(&mut self, val: u8) {
        if self.instruction.mode == AddressingMode::Accumulator {
            self.ac = val;
        } else {
            self.write(self.operand, val);
        }
    }

    fn read_modify_write(&mut self, f: impl FnOnce(&mut Self, u8) -> u8) {
        let v = self.operand_value();
        let result = f(self, v);
        self.set_zero_and_negative(result);
        self.write_back(result);
    }

    /// ADC core, shared with SBC (which passes the complemented operand).
    fn add_with_carry(&mut self, m: u8) {
        let carry_in = (self.sr & FLAG_CARRY) as u16;
        let sum = self.ac as u16 + m as u16 + carry_in;
        let result = sum as u8;
        self.set_flag(FLAG_CARRY, sum & 0xFF00 != 0);
        self.set_flag(
            FLAG_OVERFLOW,
            (result ^ self.ac) & (result ^ m) & 0x80 != 0,
        );
        self.ac = result;
        self.set_zero_and_negative(result);
    }

    /// Carry set when `reg >= m` (no borrow).
    fn compare(&mut self, reg: u8, m: u8) {
        let diff = reg as u16 + (!m) as u16 + 1;
        self.set_flag(FLAG_CARRY, diff & 0xFF00 != 0);
        self.set_zero_and_negative(diff as u8);
    }

    fn execute(&mut self) -> Result<(), CpuError> {
        let addr = self.operand;
        match self.instruction.op {
            Operation::Lda => {
                self.ac = self.operand_value();
                self.set_zero_and_negative(self.ac);
            }
            Operation::Ldx => {
                self.x = self.operand_value();
                self.set_zero_and_negative(self.x);
            }
            Operation::Ldy => {
                self.y = self.operand_value();
                self.set_zero_and_negative(self.y);
            }
            Operation::Sta => self.write(addr, self.ac),
            Operation::Stx => self.write(addr, self.x),
            Operation::Sty => self.write(addr, self.y),

            Operation::Adc => {
                let m = self.operand_value();
                self.add_with_carry(m);
            }
            Operation::Sbc => {
                // Decimal mode is not emulated; SBC is binary regardless of D.
                let m = self.operand_value();
                self.add_with_carry(!m);
            }
            Operation::And => {
                self.ac &= self.operand_value();
                self.set_zero_and_negative(self.ac);
            }
            Operation::Ora => {
                self.ac |= self.operand_value();
                self.set_zero_and_negative(self.ac);
            }
            Operation::Eor => {
                self.ac ^= self.operand_value();
                self.set_zero_and_negative(self.ac);
            }
            Operation::Bit => {
                let m = self.operand_value();
                self.sr &= !(FLAG_ZERO | FLAG_OVERFLOW | FLAG_NEGATIVE);
                if self.ac & m == 0 {
                    self.sr |= FLAG_ZERO;
                }
                self.sr |= m & (FLAG_OVERFLOW | FLAG_NEGATIVE);
            }
            Operation::Cmp => {
                let m = self.operand_value();
                self.compare(self.ac, m);
            }
            Operation::Cpx => {
                let m = self.operand_value();
                self.compare(self.x, m);
            }
            Operation::Cpy => {
                let m = self.operand_value();
                self.compare(self.y, m);
            }

            Operation::Asl => self.read_modify_write(|cpu, v| {
                let r = (v as u16) << 1;
                cpu.set_flag(FLAG_CARRY, r & 0xFF00 != 0);
                r as u8
            }),
            Operation::Lsr => self.read_modify_write(|cpu, v| {
                cpu.set_flag(FLAG_CARRY, v & 0x01 != 0);
                v >> 1
            }),
            Operation::Rol => self.read_modify_write(|cpu, v| {
                let r = ((v as u16) << 1) | (cpu.sr & FLAG_CARRY) as u16;
                cpu.set_flag(FLAG_CARRY, r & 0xFF00 != 0);
                r as u8
            }),
            Operation::Ror => self.read_modify_write(|cpu, v| {
                let r = (v >> 1) | ((cpu.sr & FLAG_CARRY) << 7);
                cpu.set_flag(FLAG_CARRY, v & 0x01 != 0);
                r
            }),
            Operation::Inc => self.read_modify_write(|_, v| v.wrapping_add(1)),
            Operation::Dec => self.read_modify_write(|_, v| v.wrapping_sub(1)),

            Operation::Inx => {
                self.x = self.x.wrapping_add(1);
                self.set_zero_and_negative(self.x);
            }
            Operation::Iny => {
                self.y = self.y.wrapping_add(1);
                self.set_zero_and_negative(self.y);
            }
            Operation::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.set_zero_and_negative(self.x);
            }
            Operation::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.set_zero_and_negative(self.y);
            }

            Operation::Tax => {
                self.x = self.ac;
                self.set_zero_and_negative(self.x);
            }
            Operation::Tay => {
                self.y = self.ac;
                self.set_zero_and_negative(self.y);
            }
            Operation::Txa => {
                self.ac = self.x;
                self.set_zero_and_negative(self.ac);
            }
            Operation::Tya => {
                self.ac = self.y;
                self.set_zero_and_negative(self.ac);
            }
            Operation::Tsx => {
                self.x = self.sp;
                self.set_zero_and_negative(self.x);
            }
            Operation::Txs => self.sp = self.x,

            Operation::Bcc
            | Operation::Bcs
            | Operation::Beq
            | Operation::Bne
            | Operation::Bmi
            | Operation::Bpl
            | Operation::Bvc
            | Operation::Bvs => {
                if self.branch_taken(self.instruction.op) {
                    self.pc = addr;
                }
            }
            Operation::Jmp => self.pc = addr,
            Operation::Jsr => {
                // PC already points past the operand: that is the return address.
                self.push_word(self.pc);
                self.pc = addr;
            }
            Operation::Rts => self.pc = self.pull_word(),
            Operation::Rti => {
                let s = self.pull();
                self.sr = (s & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pull_word();
            }
            Operation::Brk => {
                // BRK is followed by a padding byte; resume after it.
                let ret = self.pc.wrapping_add(1);
                log(LogCategory::Interrupts, LogLevel::Debug, || {
                    format!("CPU: BRK at PC={:04X}", ret.wrapping_sub(2))
                });
                self.push_word(ret);
                self.push(self.sr | FLAG_BREAK | FLAG_UNUSED | FLAG_INTERRUPT);
                self.sr |= FLAG_INTERRUPT;
                self.pc = self.read_word(IRQ_VECTOR);
            }

            Operation::Pha => self.push(self.ac),
            Operation::Php => self.push(self.sr | FLAG_INTERRUPT | FLAG_UNUSED),
            Operation::Pla => {
                self.ac = self.pull();
                self.set_zero_and_negative(self.ac);
            }
            Operation::Plp => {
                let s = self.pull();
                self.sr = (s & !FLAG_BREAK) | FLAG_UNUSED;
            }

            Operation::Clc => self.sr &= !FLAG_CARRY,
            Operation::Cld => self.sr &= !FLAG_DECIMAL,
            Operation::Cli => self.sr &= !FLAG_INTERRUPT,
            Operation::Clv => self.sr &= !FLAG_OVERFLOW,
            Operation::Sec => self.sr |= FLAG_CARRY,
            Operation::Sed => self.sr |= FLAG_DECIMAL,
            Operation::Sei => self.sr |= FLAG_INTERRUPT,
            Operation::Nop => {}

            Operation::Invalid => {
                return Err(CpuError::UnknownOpcode {
                    opcode: self.opcode,
                    pc: self.pc,
                })
            }
        }
        Ok(())
    }

    fn acknowledge_interrupt(&mut self) -> Result<(), CpuError> {
        let kind = std::mem::take(&mut self.pending_kind);
        let vector = kind.vector().ok_or(CpuError::UnknownInterruptKind)?;

        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!(
                "CPU: {:?} at PC={:04X}, vector {:04X}",
                kind, self.pc, vector
            )
        });

        if kind == InterruptKind::Reset {
            // The stack writes of a reset are suppressed; only SP moves.
            self.sp = self.sp.wrapping_sub(3);
        } else {
            self.push_word(self.pc);
            let mut pushed = self.sr | FLAG_INTERRUPT | FLAG_UNUSED;
            if kind == InterruptKind::Software {
                pushed |= FLAG_BREAK;
            } else {
                pushed &= !FLAG_BREAK;
            }
            self.push(pushed);
        }
        self.sr |= FLAG_INTERRUPT;
        self.pc = self.read_word(vector);
        Ok(())
    }
}

impl<M: Memory6502> Cpu for Cpu6502<M> {
    type Error = CpuError;

    fn reset(&mut self) -> Result<(), CpuError> {
        Cpu6502::reset(self)
    }

    fn step(&mut self) -> Result<u32, CpuError> {
        self.step_instruction()
    }
}

#[inline]
fn page_crossed(a: u16, b: u16) -> bool {
    (a & 0xFF00) != (b & 0xFF00)
}

/// `base + index`, plus one cycle if that crosses a page and the operation
/// does not always take the slow path anyway.
#[inline]
fn indexed(base: u16, index: u8, op: Operation) -> (u16, u32) {
    let addr = base.wrapping_add(index as u16);
    let penalty = if !op.always_writes() && page_crossed(base, addr) {
        1
    } else {
        0
    };
    (addr, penalty)
}

/// Simple array-based memory implementation for testing
#[derive(Debug, Clone)]
pub struct ArrayMemory {
    pub data: Vec<u8>,
}

impl ArrayMemory {
    pub fn new() -> Self {
        Self {
            data: vec![0; 0x10000],
        }
    }

    /// Load a program into memory and point the reset vector at it
    pub fn load_program(&mut self, offset: u16, program: &[u8]) {
        self.load_block(program, offset);
        self.write_word(RESET_VECTOR, offset);
    }
}

impl Default for ArrayMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory6502 for ArrayMemory {
    fn read(&self, addr: u16) -> u8 {
        self.data[addr as usize]
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.data[addr as usize] = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_with(program: &[u8]) -> Cpu6502<ArrayMemory> {
        let mut mem = ArrayMemory::new();
        mem.load_program(0x8000, program);
        let mut cpu = Cpu6502::with_bus(mem);
        cpu.start().expect("start");
        cpu
    }

    fn mem(cpu: &mut Cpu6502<ArrayMemory>) -> &mut ArrayMemory {
        cpu.bus_mut().expect("bus attached")
    }

    #[test]
    fn start_loads_reset_vector_and_status() {
        for vector in [0x0000u16, 0x8000, 0xC123, 0xFFFF] {
            let mut m = ArrayMemory::new();
            m.data[0x1234] = 0xAA;
            m.write_word(RESET_VECTOR, vector);
            let mut cpu = Cpu6502::with_bus(m);
            cpu.ac = 9;
            cpu.start().unwrap();
            assert_eq!(cpu.pc, vector);
            assert_eq!(cpu.sr, 0x24);
            assert_eq!((cpu.ac, cpu.x, cpu.y), (0, 0, 0));
            assert_eq!(cpu.total_cycles(), 0);
            assert_eq!(cpu.remaining_cycles(), 0);
        }
    }

    #[test]
    fn lda_immediate_sets_a_after_base_cycles() {
        let mut cpu = cpu_with(&[0xA9, 0x05, 0xEA]);
        cpu.advance().unwrap();
        assert_eq!(cpu.ac, 0, "effects are applied on the last cycle");
        assert_eq!(cpu.phase(), Phase::Fetching);
        cpu.advance().unwrap();
        assert_eq!(cpu.phase(), Phase::Executing);
        assert_eq!(cpu.ac, 5);
        assert!(!cpu.flag(FLAG_ZERO));
        assert!(!cpu.flag(FLAG_NEGATIVE));
        assert_eq!(cpu.step_instruction().unwrap(), 2);
    }

    #[test]
    fn lda_zero_sets_zero_flag() {
        let mut cpu = cpu_with(&[0xA9, 0x00]);
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0);
        assert!(cpu.flag(FLAG_ZERO));
    }

    #[test]
    fn zero_and_negative_follow_every_result() {
        for r in 0..=255u8 {
            let mut cpu = cpu_with(&[0xA2, r]); // LDX #r
            cpu.step_instruction().unwrap();
            assert_eq!(cpu.flag(FLAG_ZERO), r == 0, "r={:02X}", r);
            assert_eq!(cpu.flag(FLAG_NEGATIVE), r & 0x80 != 0, "r={:02X}", r);
        }
    }

    #[test]
    fn adc_ff_wraps_to_zero_with_carry() {
        let mut cpu = cpu_with(&[0x69, 0xFF]);
        cpu.ac = 1;
        cpu.sr &= !FLAG_CARRY;
        assert_eq!(cpu.step_instruction().unwrap(), 2);
        assert_eq!(cpu.ac, 0);
        assert!(cpu.flag(FLAG_CARRY));
        assert!(cpu.flag(FLAG_ZERO));
        assert!(!cpu.flag(FLAG_OVERFLOW));
    }

    #[test]
    fn adc_signed_overflow() {
        let mut cpu = cpu_with(&[0x69, 0x50]);
        cpu.ac = 0x50;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0xA0);
        assert!(cpu.flag(FLAG_OVERFLOW));
        assert!(cpu.flag(FLAG_NEGATIVE));
        assert!(!cpu.flag(FLAG_CARRY));
    }

    #[test]
    fn adc_leaves_unrelated_flags_alone() {
        let mut cpu = cpu_with(&[0x69, 0x01]);
        cpu.sr |= FLAG_DECIMAL;
        cpu.step_instruction().unwrap();
        assert!(cpu.flag(FLAG_DECIMAL));
        assert!(cpu.flag(FLAG_INTERRUPT));
    }

    #[test]
    fn sbc_borrows_through_carry() {
        // SEC; SBC #$01 -> 0x10 - 1 = 0x0F, no borrow
        let mut cpu = cpu_with(&[0x38, 0xE9, 0x01, 0xE9, 0x20]);
        cpu.ac = 0x10;
        cpu.step_instruction().unwrap();
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x0F);
        assert!(cpu.flag(FLAG_CARRY));
        // SBC #$20 -> borrow, carry clears
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0xEF);
        assert!(!cpu.flag(FLAG_CARRY));
        assert!(cpu.flag(FLAG_NEGATIVE));
    }

    #[test]
    fn compares_set_carry_when_register_not_less() {
        let mut cpu = cpu_with(&[0xC9, 0x10, 0xE0, 0x05, 0xC0, 0x04]);
        cpu.ac = 0x10;
        cpu.x = 0x05;
        cpu.y = 0x03;
        cpu.step_instruction().unwrap(); // CMP #$10
        assert!(cpu.flag(FLAG_ZERO) && cpu.flag(FLAG_CARRY));
        cpu.step_instruction().unwrap(); // CPX #$05
        assert!(cpu.flag(FLAG_ZERO) && cpu.flag(FLAG_CARRY));
        cpu.step_instruction().unwrap(); // CPY #$04
        assert!(!cpu.flag(FLAG_ZERO));
        assert!(!cpu.flag(FLAG_CARRY));
        assert!(cpu.flag(FLAG_NEGATIVE));
        assert_eq!(cpu.y, 0x03, "compare does not modify the register");
    }

    #[test]
    fn increments_and_decrements_touch_their_own_register() {
        // INX; INY; DEX; DEY; DEY
        let mut cpu = cpu_with(&[0xE8, 0xC8, 0xCA, 0x88, 0x88]);
        cpu.x = 0x10;
        cpu.y = 0x20;
        cpu.step_instruction().unwrap();
        assert_eq!((cpu.x, cpu.y), (0x11, 0x20));
        cpu.step_instruction().unwrap();
        assert_eq!((cpu.x, cpu.y), (0x11, 0x21));
        cpu.step_instruction().unwrap();
        assert_eq!((cpu.x, cpu.y), (0x10, 0x21));
        cpu.step_instruction().unwrap();
        assert_eq!((cpu.x, cpu.y), (0x10, 0x20));
        cpu.y = 0;
        cpu.step_instruction().unwrap();
        assert_eq!((cpu.x, cpu.y), (0x10, 0xFF));
        assert!(cpu.flag(FLAG_NEGATIVE));
    }

    #[test]
    fn inc_dec_memory() {
        // INC $10; DEC $11
        let mut cpu = cpu_with(&[0xE6, 0x10, 0xC6, 0x11]);
        mem(&mut cpu).data[0x10] = 0xFF;
        mem(&mut cpu).data[0x11] = 0x01;
        assert_eq!(cpu.step_instruction().unwrap(), 5);
        assert_eq!(mem(&mut cpu).data[0x10], 0x00);
        assert!(cpu.flag(FLAG_ZERO));
        cpu.step_instruction().unwrap();
        assert_eq!(mem(&mut cpu).data[0x11], 0x00);
        assert!(cpu.flag(FLAG_ZERO));
    }

    #[test]
    fn shifts_and_rotates_on_accumulator() {
        // ASL A; LSR A; ROL A; ROR A
        let mut cpu = cpu_with(&[0x0A, 0x4A, 0x2A, 0x6A]);
        cpu.ac = 0x81;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x02);
        assert!(cpu.flag(FLAG_CARRY));

        cpu.ac = 0x01;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x00);
        assert!(cpu.flag(FLAG_CARRY));
        assert!(cpu.flag(FLAG_ZERO));

        // carry in from LSR
        cpu.ac = 0x80;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x01);
        assert!(cpu.flag(FLAG_CARRY));

        cpu.ac = 0x02;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x81);
        assert!(!cpu.flag(FLAG_CARRY));
        assert!(cpu.flag(FLAG_NEGATIVE));
    }

    #[test]
    fn shift_memory_zero_page_x() {
        // ASL $F0,X with X=0x20 wraps to $10
        let mut cpu = cpu_with(&[0x16, 0xF0]);
        cpu.x = 0x20;
        mem(&mut cpu).data[0x10] = 0x40;
        assert_eq!(cpu.step_instruction().unwrap(), 6);
        assert_eq!(mem(&mut cpu).data[0x10], 0x80);
        assert_eq!(mem(&mut cpu).data[0x110], 0x00);
    }

    #[test]
    fn bit_copies_high_bits() {
        let mut cpu = cpu_with(&[0x24, 0x10]);
        mem(&mut cpu).data[0x10] = 0xC0;
        cpu.ac = 0x01;
        cpu.step_instruction().unwrap();
        assert!(cpu.flag(FLAG_ZERO));
        assert!(cpu.flag(FLAG_NEGATIVE));
        assert!(cpu.flag(FLAG_OVERFLOW));
        assert_eq!(cpu.ac, 0x01);
    }

    #[test]
    fn logical_ops() {
        // AND #$0F; ORA #$80; EOR #$FF
        let mut cpu = cpu_with(&[0x29, 0x0F, 0x09, 0x80, 0x49, 0xFF]);
        cpu.ac = 0x3C;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x0C);
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x8C);
        assert!(cpu.flag(FLAG_NEGATIVE));
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x73);
        assert!(!cpu.flag(FLAG_NEGATIVE));
    }

    #[test]
    fn transfers() {
        // TAX; TAY; TSX; TXS; TXA; TYA
        let mut cpu = cpu_with(&[0xAA, 0xA8, 0xBA, 0x9A, 0x8A, 0x98]);
        cpu.ac = 0x80;
        cpu.step_instruction().unwrap();
        cpu.step_instruction().unwrap();
        assert_eq!((cpu.x, cpu.y), (0x80, 0x80));
        cpu.sp = 0x00;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.x, 0x00);
        assert!(cpu.flag(FLAG_ZERO));
        cpu.x = 0x42;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.sp, 0x42);
        assert!(cpu.flag(FLAG_ZERO), "TXS leaves flags alone");
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x42);
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 0x80);
    }

    #[test]
    fn flag_instructions() {
        // SEC; SED; SEI; CLC; CLD; CLI; CLV
        let mut cpu = cpu_with(&[0x38, 0xF8, 0x78, 0x18, 0xD8, 0x58, 0xB8]);
        cpu.sr = FLAG_UNUSED | FLAG_OVERFLOW;
        for _ in 0..3 {
            cpu.step_instruction().unwrap();
        }
        assert_eq!(
            cpu.sr,
            FLAG_UNUSED | FLAG_OVERFLOW | FLAG_CARRY | FLAG_DECIMAL | FLAG_INTERRUPT
        );
        for _ in 0..4 {
            cpu.step_instruction().unwrap();
        }
        assert_eq!(cpu.sr, FLAG_UNUSED);
    }

    #[test]
    fn page_cross_penalty_absolute_x() {
        // LDA $20FF,X
        let mut cpu = cpu_with(&[0xBD, 0xFF, 0x20]);
        cpu.x = 1;
        mem(&mut cpu).data[0x2100] = 0x77;
        cpu.advance().unwrap();
        assert_eq!(cpu.remaining_cycles(), 4, "base 4 + 1 penalty - 1 spent");
        assert_eq!(cpu.operand_address(), 0x2100);
        assert_eq!(cpu.step_instruction().unwrap(), 4);
        assert_eq!(cpu.ac, 0x77);

        // STA $20FF,X never pays the penalty
        let mut cpu = cpu_with(&[0x9D, 0xFF, 0x20]);
        cpu.x = 1;
        cpu.ac = 0x55;
        assert_eq!(cpu.step_instruction().unwrap(), CYCLES[0x9D] as u32);
        assert_eq!(mem(&mut cpu).data[0x2100], 0x55);

        // no crossing, no penalty
        let mut cpu = cpu_with(&[0xBD, 0x00, 0x20]);
        cpu.x = 1;
        assert_eq!(cpu.step_instruction().unwrap(), 4);
    }

    #[test]
    fn page_cross_penalty_indirect_y() {
        // LDA ($10),Y with pointer $02F0 and Y=$20
        let mut cpu = cpu_with(&[0xB1, 0x10, 0x91, 0x10]);
        mem(&mut cpu).write_word(0x10, 0x02F0);
        mem(&mut cpu).data[0x0310] = 0x99;
        cpu.y = 0x20;
        assert_eq!(cpu.step_instruction().unwrap(), 6);
        assert_eq!(cpu.ac, 0x99);
        // STA ($10),Y
        assert_eq!(cpu.step_instruction().unwrap(), 6);
    }

    #[test]
    fn indirect_x_pointer_wraps_in_zero_page() {
        // LDA ($FE,X) with X=1 -> pointer at $FF/$00
        let mut cpu = cpu_with(&[0xA1, 0xFE]);
        cpu.x = 1;
        mem(&mut cpu).data[0xFF] = 0x34;
        mem(&mut cpu).data[0x00] = 0x12;
        mem(&mut cpu).data[0x1234] = 0xAB;
        assert_eq!(cpu.step_instruction().unwrap(), 6);
        assert_eq!(cpu.ac, 0xAB);
    }

    #[test]
    fn zero_page_y_stays_in_page_zero() {
        // LDX $FF,Y with Y=2 -> $01
        let mut cpu = cpu_with(&[0xB6, 0xFF]);
        cpu.y = 2;
        mem(&mut cpu).data[0x01] = 0x5A;
        mem(&mut cpu).data[0x101] = 0xEE;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.x, 0x5A);
    }

    #[test]
    fn beq_branches_when_zero() {
        // LDA #0; BEQ +2; LDA #1; LDA #2
        let mut cpu = cpu_with(&[0xA9, 0x00, 0xF0, 0x02, 0xA9, 0x01, 0xA9, 0x02]);
        assert_eq!(cpu.step_instruction().unwrap(), 2);
        assert_eq!(cpu.step_instruction().unwrap(), 3); // taken, same page
        assert_eq!(cpu.pc, 0x8006);
        assert_eq!(cpu.step_instruction().unwrap(), 2);
        assert_eq!(cpu.ac, 2);
    }

    #[test]
    fn branch_not_taken_and_backward_branch() {
        // BNE -2 with Z set: not taken
        let mut cpu = cpu_with(&[0xD0, 0xFE]);
        cpu.sr |= FLAG_ZERO;
        assert_eq!(cpu.step_instruction().unwrap(), 2);
        assert_eq!(cpu.pc, 0x8002);

        // BNE -2 with Z clear loops onto itself
        let mut cpu = cpu_with(&[0xD0, 0xFE]);
        cpu.sr &= !FLAG_ZERO;
        assert_eq!(cpu.step_instruction().unwrap(), 3);
        assert_eq!(cpu.pc, 0x8000);
    }

    #[test]
    fn branch_across_page_costs_two_extra() {
        let mut m = ArrayMemory::new();
        // BCS +4 at $80FC lands on $8102
        m.load_program(0x80FC, &[0xB0, 0x04]);
        let mut cpu = Cpu6502::with_bus(m);
        cpu.start().unwrap();
        cpu.sr |= FLAG_CARRY;
        assert_eq!(cpu.step_instruction().unwrap(), 4);
        assert_eq!(cpu.pc, 0x8102);
    }

    #[test]
    fn every_branch_honours_its_flag() {
        let cases = [
            (0x90u8, FLAG_CARRY, false),
            (0xB0, FLAG_CARRY, true),
            (0xD0, FLAG_ZERO, false),
            (0xF0, FLAG_ZERO, true),
            (0x10, FLAG_NEGATIVE, false),
            (0x30, FLAG_NEGATIVE, true),
            (0x50, FLAG_OVERFLOW, false),
            (0x70, FLAG_OVERFLOW, true),
        ];
        for (opcode, flag, when_set) in cases {
            for set in [false, true] {
                let mut cpu = cpu_with(&[opcode, 0x10]);
                cpu.sr = FLAG_UNUSED | if set { flag } else { 0 };
                cpu.step_instruction().unwrap();
                let expected = if set == when_set { 0x8012 } else { 0x8002 };
                assert_eq!(cpu.pc, expected, "opcode {:02X} set={}", opcode, set);
            }
        }
    }

    #[test]
    fn jmp_absolute_and_indirect() {
        let mut cpu = cpu_with(&[0x4C, 0x00, 0x81]);
        assert_eq!(cpu.step_instruction().unwrap(), 3);
        assert_eq!(cpu.pc, 0x8100);

        // JMP ($80FF): the pointer is a plain word, read from $80FF and $8100
        let mut m = ArrayMemory::new();
        m.load_program(0x9000, &[0x6C, 0xFF, 0x80]);
        m.write(0x80FF, 0x34);
        m.write(0x8100, 0x12);
        m.write(0x8000, 0x56);
        let mut cpu = Cpu6502::with_bus(m);
        cpu.start().unwrap();
        assert_eq!(cpu.step_instruction().unwrap(), 5);
        assert_eq!(cpu.pc, 0x1234);
    }

    #[test]
    fn pha_pla_roundtrip() {
        // PHA; LDA #0; PLA
        let mut cpu = cpu_with(&[0x48, 0xA9, 0x00, 0x68]);
        cpu.sp = 0xFD;
        cpu.ac = 0x7F;
        assert_eq!(cpu.step_instruction().unwrap(), 3);
        assert_eq!(cpu.sp, 0xFC);
        assert_eq!(mem(&mut cpu).data[0x01FD], 0x7F);
        assert_eq!(cpu.step_instruction().unwrap(), 2);
        assert_eq!(cpu.step_instruction().unwrap(), 4);
        assert_eq!(cpu.ac, 0x7F);
        assert_eq!(cpu.sp, 0xFD);
    }

    #[test]
    fn php_plp_force_bits() {
        // PHP; PLP
        let mut cpu = cpu_with(&[0x08, 0x28]);
        cpu.sp = 0xFF;
        cpu.sr = FLAG_CARRY | FLAG_NEGATIVE;
        cpu.step_instruction().unwrap();
        assert_eq!(
            mem(&mut cpu).data[0x01FF],
            FLAG_CARRY | FLAG_NEGATIVE | FLAG_INTERRUPT | FLAG_UNUSED
        );
        mem(&mut cpu).data[0x01FF] = 0xFF;
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.sr, 0xFF & !FLAG_BREAK);
    }

    #[test]
    fn jsr_pushes_address_after_operand_and_rts_returns() {
        // JSR $8010; LDA #1 ... $8010: RTS
        let mut cpu = cpu_with(&[0x20, 0x10, 0x80, 0xA9, 0x01]);
        mem(&mut cpu).write(0x8010, 0x60);
        cpu.sp = 0xFF;
        assert_eq!(cpu.step_instruction().unwrap(), 6);
        assert_eq!(cpu.pc, 0x8010);
        assert_eq!(cpu.sp, 0xFD);
        assert_eq!(mem(&mut cpu).read_word(0x01FE), 0x8003);
        assert_eq!(cpu.step_instruction().unwrap(), 6);
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.sp, 0xFF);
        assert_eq!(cpu.step_instruction().unwrap(), 2);
        assert_eq!(cpu.ac, 1);
    }

    #[test]
    fn brk_and_rti() {
        let mut cpu = cpu_with(&[0x00, 0xEA, 0xA9, 0x07]);
        mem(&mut cpu).write_word(IRQ_VECTOR, 0x9000);
        mem(&mut cpu).write(0x9000, 0x40); // RTI
        cpu.sp = 0xFF;
        cpu.sr = FLAG_UNUSED | FLAG_CARRY;
        assert_eq!(cpu.step_instruction().unwrap(), 7);
        assert_eq!(cpu.pc, 0x9000);
        assert!(cpu.flag(FLAG_INTERRUPT));
        let pushed = mem(&mut cpu).data[0x01FD];
        assert_eq!(pushed & FLAG_BREAK, FLAG_BREAK);
        assert_eq!(mem(&mut cpu).read_word(0x01FE), 0x8002);

        assert_eq!(cpu.step_instruction().unwrap(), 6);
        assert_eq!(cpu.pc, 0x8002);
        assert_eq!(cpu.sp, 0xFF);
        assert!(cpu.flag(FLAG_CARRY));
        assert!(!cpu.flag(FLAG_BREAK));
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.ac, 7);
    }

    #[test]
    fn irq_vectors_after_latency_window() {
        let mut cpu = cpu_with(&[0xEA, 0xEA]);
        mem(&mut cpu).write_word(IRQ_VECTOR, 0xA000);
        cpu.sr &= !FLAG_INTERRUPT;
        cpu.sp = 0xFF;
        let old_pc = cpu.pc;
        let old_sr = cpu.sr;

        cpu.request_interrupt(InterruptKind::Irq);
        cpu.advance().unwrap();
        assert_eq!(cpu.phase(), Phase::InterruptPending);
        for _ in 0..5 {
            cpu.advance().unwrap();
            assert_eq!(cpu.pc, old_pc, "nothing happens inside the window");
        }
        cpu.advance().unwrap();
        assert_eq!(cpu.phase(), Phase::Executing);
        assert_eq!(cpu.pc, 0xA000);
        assert!(cpu.flag(FLAG_INTERRUPT));
        assert_eq!(cpu.total_cycles(), 7);

        let m = cpu.bus_mut().unwrap();
        let mut sp = 0xFCu8;
        let sr = m.pull_byte(&mut sp);
        let pc = m.pull_word(&mut sp);
        assert_eq!(pc, old_pc);
        assert_eq!(sr & !(FLAG_INTERRUPT | FLAG_UNUSED), old_sr & !FLAG_UNUSED);
        assert_eq!(sr & FLAG_BREAK, 0);
        assert_eq!(sp, 0xFF);
    }

    #[test]
    fn each_interrupt_kind_uses_its_own_vector() {
        let cases = [
            (InterruptKind::Irq, 0xA000u16),
            (InterruptKind::Nmi, 0xB000),
            (InterruptKind::Reset, 0xC000),
            (InterruptKind::Software, 0xA000),
        ];
        for (kind, expected) in cases {
            let mut m = ArrayMemory::new();
            m.load_program(0xC000, &[0xEA]);
            m.write_word(IRQ_VECTOR, 0xA000);
            m.write_word(NMI_VECTOR, 0xB000);
            let mut cpu = Cpu6502::with_bus(m);
            cpu.start().unwrap();
            cpu.sr &= !FLAG_INTERRUPT;
            cpu.pc = 0x1234;
            cpu.request_interrupt(kind);
            assert_eq!(cpu.step_instruction().unwrap(), 7);
            assert_eq!(cpu.pc, expected, "{:?}", kind);
        }
    }

    #[test]
    fn reset_interrupt_does_not_write_stack() {
        let mut cpu = cpu_with(&[0xEA]);
        cpu.sp = 0xFF;
        cpu.request_interrupt(InterruptKind::Reset);
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.sp, 0xFC);
        assert_eq!(mem(&mut cpu).data[0x01FF], 0);
        assert_eq!(cpu.pc, 0x8000);
    }

    #[test]
    fn software_interrupt_pushes_break() {
        let mut cpu = cpu_with(&[0xEA]);
        cpu.sp = 0xFF;
        cpu.request_interrupt(InterruptKind::Software);
        cpu.step_instruction().unwrap();
        assert_eq!(mem(&mut cpu).data[0x01FD] & FLAG_BREAK, FLAG_BREAK);
    }

    #[test]
    fn interrupt_kind_none_is_an_error() {
        let mut cpu = cpu_with(&[0xEA]);
        cpu.request_interrupt(InterruptKind::None);
        assert_eq!(
            cpu.step_instruction(),
            Err(CpuError::UnknownInterruptKind)
        );
    }

    #[test]
    fn masked_irq_waits_for_cli() {
        // NOP; CLI; NOP
        let mut cpu = cpu_with(&[0xEA, 0x58, 0xEA]);
        mem(&mut cpu).write_word(IRQ_VECTOR, 0xA000);
        assert!(cpu.flag(FLAG_INTERRUPT));
        cpu.request_interrupt(InterruptKind::Irq);
        assert_eq!(cpu.step_instruction().unwrap(), 2); // NOP
        assert_eq!(cpu.step_instruction().unwrap(), 2); // CLI
        assert_eq!(cpu.interrupt_requested(), Some(InterruptKind::Irq));
        assert_eq!(cpu.step_instruction().unwrap(), 7);
        assert_eq!(cpu.pc, 0xA000);
        assert_eq!(cpu.interrupt_requested(), None);
    }

    #[test]
    fn cleared_irq_is_not_taken_after_cli() {
        // NOP; CLI; NOP
        let mut cpu = cpu_with(&[0xEA, 0x58, 0xEA]);
        mem(&mut cpu).write_word(IRQ_VECTOR, 0xA000);
        cpu.request_interrupt(InterruptKind::Irq);
        cpu.step_instruction().unwrap();
        cpu.clear_interrupt_request();
        assert_eq!(cpu.interrupt_requested(), None);
        cpu.step_instruction().unwrap(); // CLI
        assert_eq!(cpu.step_instruction().unwrap(), 2);
        assert_eq!(cpu.pc, 0x8003);
    }

    #[test]
    fn nmi_ignores_interrupt_disable_and_outranks_irq() {
        let mut cpu = cpu_with(&[0xEA]);
        mem(&mut cpu).write_word(NMI_VECTOR, 0xB000);
        cpu.request_interrupt(InterruptKind::Nmi);
        cpu.request_interrupt(InterruptKind::Irq);
        assert_eq!(cpu.interrupt_requested(), Some(InterruptKind::Nmi));
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.pc, 0xB000);
    }

    #[test]
    fn request_does_not_preempt_in_flight_instruction() {
        let mut cpu = cpu_with(&[0xAD, 0x00, 0x02, 0xEA]); // LDA $0200
        mem(&mut cpu).data[0x0200] = 0x42;
        mem(&mut cpu).write_word(NMI_VECTOR, 0xB000);
        cpu.advance().unwrap();
        cpu.request_interrupt(InterruptKind::Nmi);
        for _ in 0..3 {
            cpu.advance().unwrap();
        }
        assert_eq!(cpu.ac, 0x42);
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.step_instruction().unwrap(), 7);
        assert_eq!(cpu.pc, 0xB000);
    }

    #[test]
    fn warm_reset_moves_sp_without_writing() {
        let mut cpu = cpu_with(&[0xEA, 0xEA]);
        cpu.sp = 0x00;
        cpu.sr = FLAG_UNUSED;
        cpu.advance().unwrap();
        cpu.reset().unwrap();
        assert_eq!(cpu.sp, 0xFD);
        assert!(cpu.flag(FLAG_INTERRUPT));
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.remaining_cycles(), 0);
        assert!(mem(&mut cpu).data[0x0100..0x0200].iter().all(|&b| b == 0));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let mut cpu = cpu_with(&[0x02]);
        assert_eq!(
            cpu.advance(),
            Err(CpuError::UnknownOpcode {
                opcode: 0x02,
                pc: 0x8000
            })
        );
    }

    #[test]
    fn unknown_opcode_does_not_skip_ahead() {
        // $02 (no such opcode); LDA #$07
        let mut cpu = cpu_with(&[0x02, 0xA9, 0x07]);
        let err = CpuError::UnknownOpcode {
            opcode: 0x02,
            pc: 0x8000,
        };
        assert_eq!(cpu.advance(), Err(err));
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.step_instruction(), Err(err));
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.ac, 0);
    }

    #[test]
    fn relative_mode_on_non_branch_is_rejected() {
        let mut cpu = cpu_with(&[0x90, 0x00]); // BCC +0
        cpu.instruction = Instruction {
            op: Operation::Lda,
            mode: AddressingMode::Relative,
        };
        cpu.opcode = 0x90;
        assert_eq!(
            cpu.resolve_operand(),
            Err(CpuError::UnknownAddressingMode { opcode: 0x90 })
        );
    }

    #[test]
    fn unbound_bus_is_reported() {
        let mut cpu: Cpu6502<ArrayMemory> = Cpu6502::new();
        assert_eq!(cpu.start(), Err(CpuError::UnboundBus));
        assert_eq!(cpu.advance(), Err(CpuError::UnboundBus));
        assert_eq!(cpu.reset(), Err(CpuError::UnboundBus));
        assert_eq!(cpu.total_cycles(), 0);
    }

    #[test]
    fn total_cycles_count_every_advance() {
        let mut cpu = cpu_with(&[0xEA, 0xAD, 0x00, 0x02]);
        for _ in 0..6 {
            cpu.advance().unwrap();
        }
        assert_eq!(cpu.total_cycles(), 6);
        assert_eq!(cpu.phase(), Phase::Executing);
        assert_eq!(cpu.current_instruction().op, Operation::Lda);
        assert_eq!(cpu.current_opcode(), 0xAD);
    }

    #[test]
    fn borrowed_bus_can_be_attached() {
        let mut m = ArrayMemory::new();
        m.load_program(0x8000, &[0xA9, 0x33, 0x85, 0x40]);
        {
            let mut cpu = Cpu6502::with_bus(&mut m);
            cpu.start().unwrap();
            cpu.step_instruction().unwrap();
            cpu.step_instruction().unwrap();
        }
        assert_eq!(m.data[0x40], 0x33);
    }

    #[test]
    fn snapshot_restore() {
        let mut cpu = cpu_with(&[0xA9, 0x11, 0xA2, 0x22]);
        cpu.step_instruction().unwrap();
        let snap = cpu.snapshot();
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.x, 0x22);
        cpu.restore(&snap);
        assert_eq!(cpu.snapshot(), snap);
        cpu.step_instruction().unwrap();
        assert_eq!(cpu.x, 0x22);
    }

    #[test]
    fn cpu_trait_steps_instructions() {
        fn run<C: Cpu>(cpu: &mut C) -> Result<u32, C::Error> {
            cpu.step()
        }
        let mut cpu = cpu_with(&[0xAD, 0x00, 0x02]);
        assert_eq!(run(&mut cpu).unwrap(), 4);
        Cpu::reset(&mut cpu).unwrap();
        assert_eq!(cpu.pc, 0x8000);
    }
}
