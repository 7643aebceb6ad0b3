//! Execution controller driving an emulation engine over a memory snapshot

use anyhow::{ensure, Context, Result};

use crate::addrs::{Cr3, GvaSet, PhysAddr, VirtAddr};
use crate::breakpoints::{BreakpointHandler, Breakpoints};
use crate::config::{Options, TraceType};
use crate::cpu::Cpu;
use crate::exception::{ExceptionPolicy, PAGE_FAULT};
use crate::feedback::CoverageTracker;
use crate::hooks::{HookChain, HookTable, ServiceTable};
use crate::memory::{self, page_boundaries, FaultOutcome, Memory, Page, SnapshotMemory};
use crate::page_table::{MemoryValidate, TranslationFault};
use crate::regs::Register;
use crate::rng::Rng;
use crate::state::CpuState;
use crate::stats::RunStats;
use crate::trace::Tracer;
use crate::{Execution, TestcaseResult};

use std::path::Path;
use std::rc::Rc;

/// Page fault error code: the page was present
const PF_PRESENT: u32 = 1 << 0;

/// Page fault error code: the access was a write
const PF_WRITE: u32 = 1 << 1;

/// Page fault error code: the access came from user mode
const PF_USER: u32 = 1 << 2;

/// Page fault error code: the access was an instruction fetch
const PF_FETCH: u32 = 1 << 4;

/// Custom errors the [`Backend`] can throw
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// An operation needing the snapshot was called before [`Backend::initialize`]
    #[error("Backend used before being initialized")]
    NotInitialized,

    /// The page table root of the register state is not part of the snapshot
    #[error("Page table root {0:x?} is outside of the snapshot")]
    Cr3OutsideSnapshot(Cr3),
}

/// Drives one emulation engine over one memory snapshot, one testcase at a time
pub struct Backend<C: Cpu> {
    /// The emulation engine
    pub(crate) cpu: Rc<C>,

    /// Guest memory, available once initialized
    pub(crate) memory: Option<Memory>,

    /// Code coverage of the session
    pub(crate) coverage: CoverageTracker,

    /// Breakpoint handlers
    pub(crate) breakpoints: Breakpoints<BreakpointHandler<C>>,

    /// Statistics of the last run
    pub(crate) stats: RunStats,

    /// Which exception vectors are crashes
    pub(crate) exceptions: ExceptionPolicy,

    /// Instruction budget of a run
    pub(crate) instruction_limit: Option<u64>,

    /// Page table root of the target process
    pub(crate) initial_cr3: Cr3,

    /// Trace writer, if tracing
    pub(crate) tracer: Option<Tracer>,

    /// Seed of the `rdrand` sequence
    seed: u64,

    /// Generator behind `rdrand`
    rng: Rng,

    /// Testcase of the current run
    testcase: Vec<u8>,

    /// Result requested by the first stop of the current run
    stop_request: Option<TestcaseResult>,
}

impl<C: Cpu> Backend<C> {
    /// Create an uninitialized backend over the given engine
    pub fn new(cpu: C) -> Self {
        Self {
            cpu: Rc::new(cpu),
            memory: None,
            coverage: CoverageTracker::new(),
            breakpoints: Breakpoints::new(),
            stats: RunStats::default(),
            exceptions: ExceptionPolicy::default(),
            instruction_limit: None,
            initial_cr3: Cr3(0),
            tracer: None,
            seed: 0,
            rng: Rng::from_seed(0),
            testcase: Vec::new(),
            stop_request: None,
        }
    }

    /// The underlying emulation engine
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    /// Load the `snapshot` and the register `state` and apply `options`. On failure
    /// the backend is left untouched and can be initialized again.
    ///
    /// # Errors
    ///
    /// * `options` are inconsistent
    /// * `state` is not a 64-bit paging register state
    /// * The page table root is not part of the snapshot
    /// * Failed to create the trace file
    pub fn initialize(
        &mut self,
        options: &Options,
        snapshot: SnapshotMemory,
        state: &CpuState,
    ) -> Result<()> {
        options.validate()?;

        state
            .validate()
            .context("Invalid initial register state")?;

        ensure!(
            snapshot.contains(state.cr3().root()),
            Error::Cr3OutsideSnapshot(state.cr3())
        );

        let tracer = match (&options.trace_path, options.trace_type) {
            (Some(path), trace_type) if trace_type != TraceType::None => {
                Some(Tracer::create(path, trace_type)?)
            }
            _ => None,
        };

        log::info!(
            "Initialized snapshot: {} pages, cr3 {:#x}, rip {:#x}",
            snapshot.len(),
            state.cr3,
            state.rip
        );

        self.memory = Some(Memory::new(snapshot));
        self.tracer = tracer;
        self.instruction_limit = options.instruction_limit;
        self.exceptions = options.exceptions.clone();
        self.seed = options.seed;
        self.rng = Rng::from_seed(self.seed);
        self.initial_cr3 = state.cr3();
        self.stats = RunStats::default();
        self.stop_request = None;
        self.cpu.set_state(state);

        Ok(())
    }

    /// Execute `testcase` from the current state until the guest crashes, times out,
    /// leaves the target process or is stopped by a breakpoint
    ///
    /// # Errors
    ///
    /// * The backend is not initialized
    /// * The engine failed to start
    pub fn run(&mut self, testcase: &[u8]) -> Result<TestcaseResult> {
        ensure!(self.memory.is_some(), Error::NotInitialized);

        self.testcase.clear();
        self.testcase.extend_from_slice(testcase);
        self.stop_request = None;
        self.stats.reset();
        self.coverage.start_run();

        // Hooks reach the backend through `ctx` while the engine runs, so only the
        // engine handle may be borrowed across the call
        let cpu = Rc::clone(&self.cpu);
        let ctx: *mut Self = self;
        let hooks = HookTable::new(ctx);
        let chain = HookChain::new(&hooks);
        let services = ServiceTable::new(ctx);

        let res = cpu.run(&chain, &services);

        self.flush_trace();
        res.context("Emulation engine failed to run")?;

        let result = match self.stop_request.clone() {
            Some(result) => result,
            None if self.limit_reached() => TestcaseResult::Timeout,
            None => TestcaseResult::Ok,
        };

        self.stats.aggregated_code_coverage = try_u64!(self.coverage.len());
        self.stats.new_code_coverage = try_u64!(self.coverage.last_new_coverage().len());
        self.stats.dirty_gpas = self
            .memory
            .as_ref()
            .map_or(0, |memory| try_u64!(memory.dirty_len()));

        log::debug!("Run finished: {result} | {}", self.stats);

        Ok(result)
    }

    /// Revert every page dirtied by the last run and reload the register `state`
    ///
    /// # Errors
    ///
    /// * The backend is not initialized
    /// * `state` is not a 64-bit paging register state
    pub fn restore(&mut self, state: &CpuState) -> Result<()> {
        state.validate().context("Invalid register state")?;

        let memory = self.memory.as_mut().ok_or(Error::NotInitialized)?;
        let restored = memory.restore_dirty_pages();
        log::debug!("Restored {restored} dirty pages");

        self.initial_cr3 = state.cr3();
        self.rng = Rng::from_seed(self.seed);
        self.stop_request = None;
        self.stats.reset();
        self.cpu.set_state(state);

        Ok(())
    }

    /// Stop the current run at the next instruction boundary with `result`. Only the
    /// first stop of a run counts.
    pub fn stop(&mut self, result: TestcaseResult) {
        if let Some(pending) = &self.stop_request {
            log::debug!("Ignoring stop with {result}, already stopping with {pending}");
            return;
        }

        self.stop_request = Some(result);
        self.cpu.stop();
    }

    /// Returns `true` if the current run was asked to stop
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_request.is_some()
    }

    /// Set the number of instructions a run may execute before it is a timeout
    pub fn set_limit(&mut self, instruction_limit: u64) {
        self.instruction_limit = Some(instruction_limit);
    }

    /// Current instruction budget of a run
    #[must_use]
    pub fn instruction_limit(&self) -> Option<u64> {
        self.instruction_limit
    }

    /// Returns `true` if the current run used its whole instruction budget
    fn limit_reached(&self) -> bool {
        self.instruction_limit
            .map_or(false, |limit| self.stats.instructions_executed >= limit)
    }

    /// Read `reg` from the guest
    #[must_use]
    pub fn reg(&self, reg: Register) -> u64 {
        self.cpu.reg(reg)
    }

    /// Write `reg` in the guest. Takes effect on the next executed instruction.
    pub fn set_reg(&mut self, reg: Register, val: u64) {
        self.cpu.set_reg(reg, val);
    }

    /// Current page table root of the guest
    #[must_use]
    pub fn cr3(&self) -> Cr3 {
        Cr3(self.reg(Register::Cr3))
    }

    /// Next value of the deterministic `rdrand` sequence
    pub fn rdrand(&mut self) -> u64 {
        self.rng.next()
    }

    /// Write a trace of type `trace_type` to `path` for the following runs. A
    /// [`TraceType::None`] stops tracing.
    ///
    /// # Errors
    ///
    /// * Failed to create the trace file
    pub fn set_trace_file(&mut self, path: &Path, trace_type: TraceType) -> Result<()> {
        self.flush_trace();

        self.tracer = match trace_type {
            TraceType::None => None,
            trace_type => Some(Tracer::create(path, trace_type)?),
        };

        Ok(())
    }

    /// Flush the trace file, dropping the tracer if it fails
    fn flush_trace(&mut self) {
        let Some(tracer) = self.tracer.as_mut() else {
            return;
        };

        if let Err(err) = tracer.flush() {
            log::error!("{err:?}");
            self.tracer = None;
        }
    }

    /// Log the statistics of the last run
    pub fn print_run_stats(&self) {
        log::info!("{}", self.stats);
    }

    /// Statistics of the last run
    #[must_use]
    pub fn run_stats(&self) -> RunStats {
        self.stats
    }

    /// Guest memory, once initialized
    #[must_use]
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    /// Guest memory, or [`Error::NotInitialized`]
    fn memory_mut(&mut self) -> Result<&mut Memory> {
        Ok(self.memory.as_mut().ok_or(Error::NotInitialized)?)
    }

    /// Translate `virt_addr` with the current page tables, checking the access
    /// against `validate`
    ///
    /// # Errors
    ///
    /// * The backend is not initialized
    /// * A [`TranslationFault`] if the address is not mapped or the access is denied
    pub fn virt_translate(&self, virt_addr: VirtAddr, validate: MemoryValidate) -> Result<PhysAddr> {
        let memory = self.memory.as_ref().ok_or(Error::NotInitialized)?;
        let translation = memory.translate(virt_addr, self.cr3(), validate)?;
        Ok(translation.phys_addr)
    }

    /// Bytes from `phys_addr` to the end of its page, from the dirty copy if there is
    /// one
    #[must_use]
    pub fn phys_translate(&self, phys_addr: PhysAddr) -> Option<&[u8]> {
        self.memory.as_ref()?.phys_translate(phys_addr)
    }

    /// Current contents of the page containing `phys_addr`
    #[must_use]
    pub fn get_physical_page(&self, phys_addr: PhysAddr) -> Option<&Page> {
        self.memory.as_ref()?.page(phys_addr)
    }

    /// Mark the page containing `phys_addr` dirty. Returns `false` if the page is not
    /// part of the snapshot.
    pub fn dirty_gpa(&mut self, phys_addr: PhysAddr) -> bool {
        self.memory
            .as_mut()
            .map_or(false, |memory| memory.dirty_gpa(phys_addr))
    }

    /// Dirty every page backing `len` bytes at `virt_addr`
    pub fn dirty_virtual_memory_range(&mut self, virt_addr: VirtAddr, len: u64) -> bool {
        let cr3 = self.cr3();
        self.memory.as_mut().map_or(false, |memory| {
            memory.dirty_virtual_memory_range(virt_addr, len, cr3)
        })
    }

    /// Dirty every page touched by `len` bytes at `phys_addr`
    pub fn dirty_physical_memory_range(&mut self, phys_addr: PhysAddr, len: u64) -> bool {
        self.memory
            .as_mut()
            .map_or(false, |memory| memory.dirty_physical_memory_range(phys_addr, len))
    }

    /// First page of `size` bytes at `virt_addr` that is not backed in the engine yet
    #[must_use]
    pub fn get_first_virtual_page_to_fault(&self, virt_addr: VirtAddr, size: u64) -> Option<VirtAddr> {
        let cr3 = self.cr3();
        self.memory
            .as_ref()?
            .get_first_virtual_page_to_fault(virt_addr, size, cr3)
    }

    /// Back the pages of `size` bytes at `virt_addr` before the guest touches them.
    /// Pages mapped to the snapshot are paged in. The first page the guest page
    /// tables do not map gets a page fault injected into the guest. Returns `true` if
    /// any page was serviced.
    pub fn page_faults_memory_if_needed(&mut self, virt_addr: VirtAddr, size: u64) -> bool {
        let cr3 = self.cr3();
        let Some(memory) = self.memory.as_mut() else {
            return false;
        };

        let Some(first) = memory.get_first_virtual_page_to_fault(virt_addr, size, cr3) else {
            return false;
        };

        let remaining = virt_addr.0.wrapping_add(size).wrapping_sub(first.0);
        let mut serviced = false;

        for (addr, _size) in page_boundaries(first.0, remaining) {
            let page = VirtAddr(addr).page();

            match memory.fault_in(page, cr3) {
                FaultOutcome::Resident(_) => {}
                FaultOutcome::PagedIn(phys_addr) => {
                    log::debug!("Paged in {page:x?} -> {phys_addr:x?}");
                    serviced = true;
                }
                FaultOutcome::GuestFault(fault) => {
                    let user = self.cpu.reg(Register::Cs) & 3 == 3;
                    let error_code = page_fault_error_code(&fault, user);
                    log::debug!("Injecting #PF at {page:x?} error code {error_code:#x}");

                    self.cpu.set_reg(Register::Cr2, page.0);
                    self.cpu.inject_exception(PAGE_FAULT, error_code);
                    serviced = true;
                    break;
                }
                FaultOutcome::Unresolved => {
                    log::debug!("{page:x?} can not be backed by the snapshot");
                    break;
                }
            }
        }

        serviced
    }

    /// Call `handler` every time execution reaches `virt_addr`, replacing any
    /// previous handler there. Returns `false` if `virt_addr` is reserved.
    pub fn set_breakpoint<F>(&mut self, virt_addr: VirtAddr, handler: F) -> bool
    where
        F: Fn(&mut Backend<C>, VirtAddr) -> Result<Execution> + 'static,
    {
        self.breakpoints.set(virt_addr, Rc::new(handler))
    }

    /// Remove the breakpoint at `virt_addr`. Returns `true` if there was one.
    pub fn remove_breakpoint(&mut self, virt_addr: VirtAddr) -> bool {
        self.breakpoints.remove(virt_addr).is_some()
    }

    /// Forbid breakpoints at `virt_addr`. A breakpoint already set there is removed.
    /// Returns `true` if one was.
    pub fn reserve_address(&mut self, virt_addr: VirtAddr) -> bool {
        self.breakpoints.reserve(virt_addr).is_some()
    }

    /// Invoke the breakpoint handler at `rip`, if any
    pub(crate) fn handle_breakpoint(&mut self, rip: VirtAddr) {
        let Some(handler) = self.breakpoints.get(rip) else {
            return;
        };

        match handler(self, rip) {
            Ok(Execution::Continue) => {}
            Ok(Execution::Stop(result)) => self.stop(result),
            Err(err) => {
                log::error!("Breakpoint handler at {rip:x?} failed: {err:?}");
                self.stop(TestcaseResult::Crash(format!("{err:#}")));
            }
        }
    }

    /// Addresses first executed by the last run
    #[must_use]
    pub fn last_new_coverage(&self) -> &GvaSet {
        self.coverage.last_new_coverage()
    }

    /// Remove the coverage first discovered by the last run from the session
    /// coverage. A second call without a run in between does nothing.
    pub fn revoke_last_new_coverage(&mut self) {
        self.coverage.revoke_last_new_coverage();
    }

    /// Coverage of the session
    #[must_use]
    pub fn coverage(&self) -> &CoverageTracker {
        &self.coverage
    }

    /// Testcase of the current run
    #[must_use]
    pub fn testcase(&self) -> &[u8] {
        &self.testcase
    }

    /// Read physical memory into `buf`
    ///
    /// # Errors
    ///
    /// * The backend is not initialized
    /// * Part of the range is outside of the snapshot
    pub fn phys_read(&self, phys_addr: PhysAddr, buf: &mut [u8]) -> Result<()> {
        let memory = self.memory.as_ref().ok_or(Error::NotInitialized)?;
        ensure!(
            memory.read_phys_bytes(phys_addr, buf),
            memory::Error::PhysicalAddressOutsideSnapshot(phys_addr)
        );

        Ok(())
    }

    /// Read `buf.len()` bytes at `virt_addr` with the current page tables
    ///
    /// # Errors
    ///
    /// * The backend is not initialized
    /// * Part of the range is not mapped or outside of the snapshot
    pub fn virt_read(&self, virt_addr: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let cr3 = self.cr3();
        let memory = self.memory.as_ref().ok_or(Error::NotInitialized)?;
        memory.read_bytes(virt_addr, cr3, buf)
    }

    /// Write `buf` at `virt_addr` with the current page tables, dirtying the
    /// touched pages
    ///
    /// # Errors
    ///
    /// * The backend is not initialized
    /// * Part of the range is not mapped or outside of the snapshot
    pub fn virt_write(&mut self, virt_addr: VirtAddr, buf: &[u8]) -> Result<()> {
        let cr3 = self.cr3();
        self.memory_mut()?.write_bytes_dirty(virt_addr, cr3, buf)
    }

    /// Read a `T` at `virt_addr`
    ///
    /// # Errors
    ///
    /// * Same as [`Backend::virt_read`]
    pub fn virt_read_val<T: Primitive>(&self, virt_addr: VirtAddr) -> Result<T> {
        let mut bytes = [0_u8; 8];
        let bytes = &mut bytes[..T::SIZE];
        self.virt_read(virt_addr, bytes)?;
        Ok(T::from_le_slice(bytes))
    }

    /// Write `val` at `virt_addr`
    ///
    /// # Errors
    ///
    /// * Same as [`Backend::virt_write`]
    pub fn virt_write_val<T: Primitive>(&mut self, virt_addr: VirtAddr, val: T) -> Result<()> {
        let mut bytes = [0_u8; 8];
        let bytes = &mut bytes[..T::SIZE];
        val.write_le_slice(bytes);
        self.virt_write(virt_addr, bytes)
    }
}

/// Error code pushed with a page fault raised for `fault`
fn page_fault_error_code(fault: &TranslationFault, user: bool) -> u32 {
    let mut error_code = 0;

    if let TranslationFault::AccessViolation { validate, .. } = fault {
        error_code |= PF_PRESENT;

        if validate.contains(MemoryValidate::WRITE) {
            error_code |= PF_WRITE;
        }

        if validate.contains(MemoryValidate::EXECUTE) {
            error_code |= PF_FETCH;
        }
    }

    if user {
        error_code |= PF_USER;
    }

    error_code
}

/// Integers that can be read from and written to guest memory
pub trait Primitive: Copy {
    /// Size in bytes
    const SIZE: usize;

    /// Build from `SIZE` little endian bytes
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Store into `SIZE` little endian bytes
    fn write_le_slice(self, bytes: &mut [u8]);
}

/// Implement [`Primitive`] for the given integer types
macro_rules! impl_primitive {
    ($($ty:ty),*) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0_u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le_slice(self, bytes: &mut [u8]) {
                    bytes[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_primitive!(u8, u16, u32, u64, i8, i16, i32, i64);
