//! Scripted emulation engine and snapshot builder shared by the integration tests

#![allow(dead_code)]

use anyhow::{ensure, Result};

use snapemu::cpu::{MemAccess, TlbControl};
use snapemu::hooks::{HookChain, ServiceTable};
use snapemu::memory::SnapshotMemory;
use snapemu::page_table::Entry;
use snapemu::{Cpu, CpuState, PhysAddr, Register, PAGE_SIZE};

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

/// Page table root of every test snapshot
pub const CR3: u64 = 0x1000;

/// Code page
pub const CODE: u64 = 0x40_0000;
pub const CODE_GPA: u64 = 0x10_0000;

/// Writable data page, filled with 0x41
pub const DATA: u64 = 0x60_0000;
pub const DATA_GPA: u64 = 0x20_0000;

/// Second writable data page right after [`DATA`], filled with 0x42
pub const DATA2: u64 = 0x60_1000;
pub const DATA2_GPA: u64 = 0x20_1000;

/// Address in a page table that does not map it
pub const UNMAPPED: u64 = 0x70_0000;

/// Address mapped to physical memory that is not part of the snapshot
pub const OUTSIDE: u64 = 0x80_0000;
pub const OUTSIDE_GPA: u64 = 0x9000_0000;

/// One event replayed by [`ScriptedCpu`]
#[derive(Debug, Clone)]
pub enum Step {
    /// Execute the instruction at `rip` made of `opcode`
    Insn { rip: u64, opcode: Vec<u8> },

    /// Read `len` bytes at `gva`/`gpa` during the last instruction
    Read { gva: u64, gpa: u64, len: usize },

    /// Write `bytes` at `gva`/`gpa` during the last instruction
    Write { gva: u64, gpa: u64, bytes: Vec<u8> },

    /// Raise exception `vector`
    Exception { vector: u32, error_code: u32 },

    /// Raise a page fault for `cr2`
    PageFault { cr2: u64 },

    /// Deliver interrupt `vector`
    Interrupt { vector: u32 },

    /// Load cr3 and report it through the TLB control hook
    WriteCr3(u64),

    /// Write a register without telling the hooks
    SetReg(Register, u64),

    /// Execute `rdrand` into rax
    Rdrand,
}

/// Single byte `nop` at `rip`
pub fn nop(rip: u64) -> Step {
    Step::Insn {
        rip,
        opcode: vec![0x90],
    }
}

/// Engine replaying a fixed list of [`Step`]s through the hook chain
#[derive(Default)]
pub struct ScriptedCpu {
    /// Register file
    regs: RefCell<CpuState>,

    /// Steps of the next run
    program: RefCell<Vec<Step>>,

    /// Set by [`Cpu::stop`]
    stopped: Cell<bool>,

    /// Fail to start the next run
    fail_start: Cell<bool>,

    /// An instruction started and has not retired yet
    in_insn: Cell<bool>,

    /// Still decode and retire the instruction whose `before_execution` stopped
    /// the run
    retire_on_stop: Cell<bool>,

    /// Exceptions injected by the backend as `(vector, error_code)`
    pub injected: RefCell<Vec<(u32, u32)>>,

    /// Bytes returned by every [`Step::Read`]
    pub reads: RefCell<Vec<Vec<u8>>>,

    /// Values returned by every [`Step::Rdrand`]
    pub rdrand: RefCell<Vec<u64>>,

    /// Number of steps replayed by the last run
    pub steps_run: Cell<usize>,
}

impl ScriptedCpu {
    /// Replace the program of the next runs
    pub fn load(&self, program: Vec<Step>) {
        *self.program.borrow_mut() = program;
    }

    /// Retire the instruction in flight when a stop arrives, as engines that only
    /// stop at instruction boundaries do
    pub fn retire_on_stop(&self) {
        self.retire_on_stop.set(true);
    }

    /// Make the next run fail to start
    pub fn fail_next_start(&self) {
        self.fail_start.set(true);
    }

    /// Retire the instruction in flight, if any
    ///
    /// # Safety
    ///
    /// `hooks` must come from a running backend
    unsafe fn retire(&self, hooks: &HookChain<'_>) {
        if self.in_insn.replace(false) {
            hooks.after_execution(0);
        }
    }

    /// Replay one step. Memory accesses and exceptions belong to the instruction in
    /// flight, which retires when the next one starts.
    ///
    /// # Safety
    ///
    /// `hooks` and `services` must come from a running backend
    unsafe fn step(&self, step: &Step, hooks: &HookChain<'_>, services: &ServiceTable) {
        match step {
            Step::Insn { rip, opcode } => {
                self.retire(hooks);

                self.set_reg(Register::Rip, *rip);
                hooks.before_execution(0);
                if self.stopped.get() {
                    if self.retire_on_stop.get() {
                        hooks.opcode(0, opcode);
                        hooks.after_execution(0);
                    }
                    return;
                }

                // Fetch through the engine's physical memory view
                let mut fetched = vec![0; opcode.len()];
                services.phys_read(CODE_GPA + (rip - CODE), &mut fetched);

                hooks.opcode(0, opcode);
                self.in_insn.set(true);
            }
            Step::Read { gva, gpa, len } => {
                let mut buf = vec![0; *len];
                services.phys_read(*gpa, &mut buf);
                hooks.lin_access(0, *gva, *gpa, *len, MemAccess::Read);
                self.reads.borrow_mut().push(buf);
            }
            Step::Write { gva, gpa, bytes } => {
                hooks.lin_access(0, *gva, *gpa, bytes.len(), MemAccess::Write);
                services.phys_write(*gpa, bytes);
            }
            Step::Exception { vector, error_code } => {
                hooks.exception(0, *vector, *error_code);
            }
            Step::PageFault { cr2 } => {
                self.set_reg(Register::Cr2, *cr2);
                hooks.exception(0, 14, 0);
            }
            Step::Interrupt { vector } => hooks.interrupt(0, *vector),
            Step::WriteCr3(cr3) => {
                self.set_reg(Register::Cr3, *cr3);
                hooks.tlb_control(0, TlbControl::Cr3, *cr3);
            }
            Step::SetReg(reg, val) => self.set_reg(*reg, *val),
            Step::Rdrand => {
                let val = services.rdrand();
                self.set_reg(Register::Rax, val);
                self.rdrand.borrow_mut().push(val);
            }
        }
    }
}

impl Cpu for ScriptedCpu {
    fn set_state(&self, state: &CpuState) {
        *self.regs.borrow_mut() = state.clone();
    }

    fn reg(&self, reg: Register) -> u64 {
        self.regs.borrow().reg(reg)
    }

    fn set_reg(&self, reg: Register, value: u64) {
        self.regs.borrow_mut().set_reg(reg, value);
    }

    fn inject_exception(&self, vector: u32, error_code: u32) {
        self.injected.borrow_mut().push((vector, error_code));
    }

    fn run(&self, hooks: &HookChain<'_>, services: &ServiceTable) -> Result<()> {
        ensure!(!self.fail_start.replace(false), "engine failed to start");

        self.stopped.set(false);
        self.in_insn.set(false);
        self.reads.borrow_mut().clear();
        self.rdrand.borrow_mut().clear();
        self.steps_run.set(0);

        // Hooks re-enter the engine, so no borrow is held while replaying
        let program = self.program.borrow().clone();
        for step in &program {
            if self.stopped.get() {
                break;
            }

            unsafe { self.step(step, hooks, services) };
            self.steps_run.set(self.steps_run.get() + 1);
        }

        if !self.stopped.get() {
            unsafe { self.retire(hooks) };
        }

        Ok(())
    }

    fn stop(&self) {
        self.stopped.set(true);
    }
}

/// Physical memory image with 4-level page tables rooted at [`CR3`]
pub struct SnapshotBuilder {
    /// Page contents keyed by physical address
    pages: BTreeMap<u64, Vec<u8>>,

    /// Next physical page handed out for a page table
    next_table: u64,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        let mut pages = BTreeMap::new();
        pages.insert(CR3, vec![0; PAGE_SIZE as usize]);
        Self {
            pages,
            next_table: CR3 + PAGE_SIZE,
        }
    }
}

impl SnapshotBuilder {
    /// Builder with only an empty PML4
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the entry at `addr`
    fn entry(&self, addr: u64) -> u64 {
        let page = &self.pages[&(addr & !0xfff)];
        let offset = (addr & 0xfff) as usize;
        u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap())
    }

    /// Write the entry at `addr`
    fn set_entry(&mut self, addr: u64, val: u64) {
        let page = self.pages.get_mut(&(addr & !0xfff)).unwrap();
        let offset = (addr & 0xfff) as usize;
        page[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
    }

    /// Fill the physical page at `gpa` with `byte`, adding it if needed
    pub fn fill(mut self, gpa: u64, byte: u8) -> Self {
        self.pages.insert(gpa, vec![byte; PAGE_SIZE as usize]);
        self
    }

    /// Map the virtual page `gva` to the physical page `gpa`. Tables are created
    /// on the way, the physical page itself is not.
    pub fn map(mut self, gva: u64, gpa: u64, writable: bool) -> Self {
        let indexes = [
            (gva >> 39) & 0x1ff,
            (gva >> 30) & 0x1ff,
            (gva >> 21) & 0x1ff,
            (gva >> 12) & 0x1ff,
        ];

        let mut table = CR3;
        for index in &indexes[..3] {
            let addr = table + index * 8;
            let entry = self.entry(addr);
            table = if entry & Entry::PRESENT == 0 {
                let next = self.next_table;
                self.next_table += PAGE_SIZE;
                self.pages.insert(next, vec![0; PAGE_SIZE as usize]);
                self.set_entry(addr, next | Entry::PRESENT | Entry::WRITABLE | Entry::USER);
                next
            } else {
                entry & 0x000f_ffff_ffff_f000
            };
        }

        let mut leaf = gpa | Entry::PRESENT | Entry::USER;
        if writable {
            leaf |= Entry::WRITABLE;
        }
        self.set_entry(table + indexes[3] * 8, leaf);

        self
    }

    /// Build the snapshot
    pub fn build(self) -> SnapshotMemory {
        SnapshotMemory::from_pages(
            self.pages
                .iter()
                .map(|(gpa, page)| (PhysAddr(*gpa), page.as_slice())),
        )
        .unwrap()
    }
}

/// Snapshot with the code page at [`CODE`], data pages at [`DATA`]/[`DATA2`], a hole
/// at [`UNMAPPED`] and a page at [`OUTSIDE`] backed by missing physical memory
pub fn snapshot() -> SnapshotMemory {
    SnapshotBuilder::new()
        .fill(CODE_GPA, 0x90)
        .fill(DATA_GPA, 0x41)
        .fill(DATA2_GPA, 0x42)
        .map(CODE, CODE_GPA, false)
        .map(DATA, DATA_GPA, true)
        .map(DATA2, DATA2_GPA, true)
        .map(OUTSIDE, OUTSIDE_GPA, true)
        .build()
}

/// 64-bit register state starting at [`CODE`]
pub fn state() -> CpuState {
    CpuState {
        rip: CODE,
        rsp: DATA + 0x800,
        cr0: 0x8005_0033,
        cr3: CR3,
        cr4: 0x0000_0620,
        efer: 0xd01,
        ..CpuState::default()
    }
}

/// Initialize logging for tests
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
