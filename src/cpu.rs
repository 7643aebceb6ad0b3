//! Boundary with the instruction-emulation engine

use anyhow::Result;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::hooks::{HookChain, ServiceTable};
use crate::regs::Register;
use crate::state::CpuState;

/// Handle onto an instruction-emulation engine.
///
/// Methods take `&self`: the engine owns its own state and is re-entered from the
/// hooks it invokes while [`Cpu::run`] is on the stack.
pub trait Cpu {
    /// Load the complete register file
    fn set_state(&self, state: &CpuState);

    /// Read a single register
    fn reg(&self, reg: Register) -> u64;

    /// Write a single register. Takes effect on the next executed instruction.
    fn set_reg(&self, reg: Register, value: u64);

    /// Deliver the exception `vector` to the guest before the next instruction
    fn inject_exception(&self, vector: u32, error_code: u32);

    /// Execute until [`Cpu::stop`] is called or the guest halts.
    ///
    /// Every table in `hooks` is invoked for each event, in chain order. All guest
    /// physical memory accesses go through `services`.
    ///
    /// # Errors
    ///
    /// * The engine could not start executing
    fn run(&self, hooks: &HookChain<'_>, services: &ServiceTable) -> Result<()>;

    /// Ask the engine to return from [`Cpu::run`] at the next instruction boundary
    fn stop(&self);
}

/// Kind of a memory access reported by the engine
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum MemAccess {
    /// Data read
    Read = 0,

    /// Data write
    Write = 1,

    /// Instruction fetch
    Execute = 2,

    /// Read-modify-write
    ReadWrite = 3,
}

impl MemAccess {
    /// Returns `true` if the access modifies memory
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, MemAccess::Write | MemAccess::ReadWrite)
    }

    /// Single letter used in traces
    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            MemAccess::Read => 'R',
            MemAccess::Write => 'W',
            MemAccess::Execute => 'X',
            MemAccess::ReadWrite => 'M',
        }
    }
}

/// Event reported through the TLB-control hook
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum TlbControl {
    /// cr0 was written
    Cr0 = 10,

    /// cr3 was written. The new value is the new page table root.
    Cr3 = 11,

    /// cr4 was written
    Cr4 = 12,

    /// Hardware task switch
    TaskSwitch = 13,

    /// Context switch
    ContextSwitch = 14,

    /// `invlpg`. The new value is the invalidated linear address.
    Invlpg = 15,

    /// `invept`
    Invept = 16,

    /// `invvpid`
    Invvpid = 17,

    /// `invpcid`
    Invpcid = 18,
}
