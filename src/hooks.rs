//! Seam between the emulation engine's callbacks and the backend
//!
//! The engine only knows about `#[repr(C)]` tables of `extern "C"` functions. Each
//! table carries an opaque context pointer that the trampolines turn back into the
//! [`Hooks`] or [`EngineServices`] implementor before forwarding the event.

use crate::addrs::{Cr3, PhysAddr, VirtAddr};
use crate::backend::Backend;
use crate::cpu::{Cpu, MemAccess, TlbControl};
use crate::exception::{self, Exception, VectorClass};
use crate::memory::{page_boundaries, FaultOutcome};
use crate::regs::Register;
use crate::TestcaseResult;

use std::ffi::c_void;

/// Engine events the backend reacts to
pub trait Hooks {
    /// An instruction is about to execute
    fn before_execution(&mut self, cpu_id: u32);

    /// An instruction retired
    fn after_execution(&mut self, cpu_id: u32);

    /// Physical memory was accessed outside of a linear access (page walks, DMA)
    fn phy_access(&mut self, cpu_id: u32, phys_addr: PhysAddr, len: u64, access: MemAccess);

    /// Linear memory was accessed
    fn lin_access(
        &mut self,
        cpu_id: u32,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        len: u64,
        access: MemAccess,
    );

    /// An interrupt or exception is being delivered
    fn interrupt(&mut self, cpu_id: u32, vector: u32);

    /// An exception was raised
    fn exception(&mut self, cpu_id: u32, vector: u32, error_code: u32);

    /// The guest changed its address translation setup
    fn tlb_control(&mut self, cpu_id: u32, what: TlbControl, new_value: u64);

    /// The bytes of the instruction about to execute were decoded
    fn opcode(&mut self, cpu_id: u32, opcode: &[u8]);
}

/// Services the engine needs from the backend while running
pub trait EngineServices {
    /// Read guest physical memory
    fn phys_read(&mut self, phys_addr: PhysAddr, buf: &mut [u8]);

    /// Write guest physical memory
    fn phys_write(&mut self, phys_addr: PhysAddr, buf: &[u8]);

    /// Value returned by the guest's `rdrand`
    fn rdrand(&mut self) -> u64;
}

/// `before_execution`/`after_execution` callback
pub type ExecutionHookFn = unsafe extern "C" fn(ctx: *mut c_void, cpu_id: u32, insn: *mut c_void);

/// Physical memory access callback
pub type PhyAccessHookFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    cpu_id: u32,
    phys_addr: u64,
    len: usize,
    mem_type: u32,
    access: u32,
);

/// Linear memory access callback
pub type LinAccessHookFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    cpu_id: u32,
    virt_addr: u64,
    phys_addr: u64,
    len: usize,
    mem_type: u32,
    access: u32,
);

/// Interrupt callback
pub type InterruptHookFn = unsafe extern "C" fn(ctx: *mut c_void, cpu_id: u32, vector: u32);

/// Exception callback
pub type ExceptionHookFn =
    unsafe extern "C" fn(ctx: *mut c_void, cpu_id: u32, vector: u32, error_code: u32);

/// TLB control callback
pub type TlbControlHookFn =
    unsafe extern "C" fn(ctx: *mut c_void, cpu_id: u32, what: u32, new_value: u64);

/// Decoded opcode callback
pub type OpcodeHookFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    cpu_id: u32,
    insn: *const c_void,
    opcode: *const u8,
    len: usize,
    is32: bool,
    is64: bool,
);

/// Callbacks registered with the engine. Unset entries are skipped.
#[repr(C)]
#[derive(Debug)]
pub struct HookTable {
    /// Context handed back to every callback
    pub ctx: *mut c_void,

    /// Called before each instruction executes
    pub before_execution: Option<ExecutionHookFn>,
    /// Called after each instruction retires
    pub after_execution: Option<ExecutionHookFn>,
    /// Called on physical memory accesses
    pub phy_access: Option<PhyAccessHookFn>,
    /// Called on linear memory accesses
    pub lin_access: Option<LinAccessHookFn>,
    /// Called when an interrupt is delivered
    pub interrupt: Option<InterruptHookFn>,
    /// Called when an exception is raised
    pub exception: Option<ExceptionHookFn>,
    /// Called when the guest changes its translation setup
    pub tlb_control: Option<TlbControlHookFn>,
    /// Called with the bytes of each decoded instruction
    pub opcode: Option<OpcodeHookFn>,
}

impl HookTable {
    /// Table forwarding every event to `hooks`. The table must not be used after
    /// `hooks` moves or is dropped.
    #[must_use]
    pub fn new<H: Hooks>(hooks: *mut H) -> Self {
        Self {
            ctx: hooks.cast::<c_void>(),
            before_execution: Some(before_execution_trampoline::<H>),
            after_execution: Some(after_execution_trampoline::<H>),
            phy_access: Some(phy_access_trampoline::<H>),
            lin_access: Some(lin_access_trampoline::<H>),
            interrupt: Some(interrupt_trampoline::<H>),
            exception: Some(exception_trampoline::<H>),
            tlb_control: Some(tlb_control_trampoline::<H>),
            opcode: Some(opcode_trampoline::<H>),
        }
    }
}

/// Null terminated list of hook tables as expected by the engine
#[repr(transparent)]
#[derive(Debug)]
pub struct HookChain<'a>([Option<&'a HookTable>; 2]);

impl<'a> HookChain<'a> {
    /// Chain holding the single `table`
    #[must_use]
    pub fn new(table: &'a HookTable) -> Self {
        Self([Some(table), None])
    }

    /// Raw pointer to the first entry, for engines that take the C array
    #[must_use]
    pub fn as_ptr(&self) -> *const Option<&'a HookTable> {
        self.0.as_ptr()
    }

    /// Tables in chain order, up to the terminating null
    pub fn iter(&self) -> impl Iterator<Item = &'a HookTable> + '_ {
        self.0.iter().map_while(|table| *table)
    }

    /// Invoke every `before_execution` callback
    ///
    /// # Safety
    ///
    /// The context of every table must still be alive and not borrowed elsewhere
    pub unsafe fn before_execution(&self, cpu_id: u32) {
        for table in self.iter() {
            if let Some(hook) = table.before_execution {
                hook(table.ctx, cpu_id, std::ptr::null_mut());
            }
        }
    }

    /// Invoke every `after_execution` callback
    ///
    /// # Safety
    ///
    /// The context of every table must still be alive and not borrowed elsewhere
    pub unsafe fn after_execution(&self, cpu_id: u32) {
        for table in self.iter() {
            if let Some(hook) = table.after_execution {
                hook(table.ctx, cpu_id, std::ptr::null_mut());
            }
        }
    }

    /// Invoke every `phy_access` callback
    ///
    /// # Safety
    ///
    /// The context of every table must still be alive and not borrowed elsewhere
    pub unsafe fn phy_access(&self, cpu_id: u32, phys_addr: u64, len: usize, access: MemAccess) {
        for table in self.iter() {
            if let Some(hook) = table.phy_access {
                hook(table.ctx, cpu_id, phys_addr, len, 0, access.into());
            }
        }
    }

    /// Invoke every `lin_access` callback
    ///
    /// # Safety
    ///
    /// The context of every table must still be alive and not borrowed elsewhere
    pub unsafe fn lin_access(
        &self,
        cpu_id: u32,
        virt_addr: u64,
        phys_addr: u64,
        len: usize,
        access: MemAccess,
    ) {
        for table in self.iter() {
            if let Some(hook) = table.lin_access {
                hook(table.ctx, cpu_id, virt_addr, phys_addr, len, 0, access.into());
            }
        }
    }

    /// Invoke every `interrupt` callback
    ///
    /// # Safety
    ///
    /// The context of every table must still be alive and not borrowed elsewhere
    pub unsafe fn interrupt(&self, cpu_id: u32, vector: u32) {
        for table in self.iter() {
            if let Some(hook) = table.interrupt {
                hook(table.ctx, cpu_id, vector);
            }
        }
    }

    /// Invoke every `exception` callback
    ///
    /// # Safety
    ///
    /// The context of every table must still be alive and not borrowed elsewhere
    pub unsafe fn exception(&self, cpu_id: u32, vector: u32, error_code: u32) {
        for table in self.iter() {
            if let Some(hook) = table.exception {
                hook(table.ctx, cpu_id, vector, error_code);
            }
        }
    }

    /// Invoke every `tlb_control` callback
    ///
    /// # Safety
    ///
    /// The context of every table must still be alive and not borrowed elsewhere
    pub unsafe fn tlb_control(&self, cpu_id: u32, what: TlbControl, new_value: u64) {
        for table in self.iter() {
            if let Some(hook) = table.tlb_control {
                hook(table.ctx, cpu_id, what.into(), new_value);
            }
        }
    }

    /// Invoke every `opcode` callback
    ///
    /// # Safety
    ///
    /// The context of every table must still be alive and not borrowed elsewhere
    pub unsafe fn opcode(&self, cpu_id: u32, opcode: &[u8]) {
        for table in self.iter() {
            if let Some(hook) = table.opcode {
                hook(
                    table.ctx,
                    cpu_id,
                    std::ptr::null(),
                    opcode.as_ptr(),
                    opcode.len(),
                    false,
                    true,
                );
            }
        }
    }
}

unsafe extern "C" fn before_execution_trampoline<H: Hooks>(
    ctx: *mut c_void,
    cpu_id: u32,
    _insn: *mut c_void,
) {
    let hooks = &mut *ctx.cast::<H>();
    hooks.before_execution(cpu_id);
}

unsafe extern "C" fn after_execution_trampoline<H: Hooks>(
    ctx: *mut c_void,
    cpu_id: u32,
    _insn: *mut c_void,
) {
    let hooks = &mut *ctx.cast::<H>();
    hooks.after_execution(cpu_id);
}

unsafe extern "C" fn phy_access_trampoline<H: Hooks>(
    ctx: *mut c_void,
    cpu_id: u32,
    phys_addr: u64,
    len: usize,
    _mem_type: u32,
    access: u32,
) {
    let Ok(access) = MemAccess::try_from(access) else {
        log::warn!("Unknown memory access kind {access}");
        return;
    };

    let hooks = &mut *ctx.cast::<H>();
    hooks.phy_access(cpu_id, PhysAddr(phys_addr), try_u64!(len), access);
}

unsafe extern "C" fn lin_access_trampoline<H: Hooks>(
    ctx: *mut c_void,
    cpu_id: u32,
    virt_addr: u64,
    phys_addr: u64,
    len: usize,
    _mem_type: u32,
    access: u32,
) {
    let Ok(access) = MemAccess::try_from(access) else {
        log::warn!("Unknown memory access kind {access}");
        return;
    };

    let hooks = &mut *ctx.cast::<H>();
    hooks.lin_access(
        cpu_id,
        VirtAddr(virt_addr),
        PhysAddr(phys_addr),
        try_u64!(len),
        access,
    );
}

unsafe extern "C" fn interrupt_trampoline<H: Hooks>(ctx: *mut c_void, cpu_id: u32, vector: u32) {
    let hooks = &mut *ctx.cast::<H>();
    hooks.interrupt(cpu_id, vector);
}

unsafe extern "C" fn exception_trampoline<H: Hooks>(
    ctx: *mut c_void,
    cpu_id: u32,
    vector: u32,
    error_code: u32,
) {
    let hooks = &mut *ctx.cast::<H>();
    hooks.exception(cpu_id, vector, error_code);
}

unsafe extern "C" fn tlb_control_trampoline<H: Hooks>(
    ctx: *mut c_void,
    cpu_id: u32,
    what: u32,
    new_value: u64,
) {
    let Ok(what) = TlbControl::try_from(what) else {
        log::debug!("Unknown TLB control event {what}, treating as full flush");
        let hooks = &mut *ctx.cast::<H>();
        hooks.tlb_control(cpu_id, TlbControl::Cr4, new_value);
        return;
    };

    let hooks = &mut *ctx.cast::<H>();
    hooks.tlb_control(cpu_id, what, new_value);
}

unsafe extern "C" fn opcode_trampoline<H: Hooks>(
    ctx: *mut c_void,
    cpu_id: u32,
    _insn: *const c_void,
    opcode: *const u8,
    len: usize,
    _is32: bool,
    _is64: bool,
) {
    let opcode = if opcode.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(opcode, len)
    };

    let hooks = &mut *ctx.cast::<H>();
    hooks.opcode(cpu_id, opcode);
}

/// Services callable by the engine. Each takes the same context as the hooks.
#[repr(C)]
#[derive(Debug)]
pub struct ServiceTable {
    /// Context handed back to every service
    pub ctx: *mut c_void,

    /// Read `len` bytes of guest physical memory into `buf`
    pub phys_read: unsafe extern "C" fn(ctx: *mut c_void, phys_addr: u64, buf: *mut u8, len: usize),
    /// Write `len` bytes from `buf` to guest physical memory
    pub phys_write:
        unsafe extern "C" fn(ctx: *mut c_void, phys_addr: u64, buf: *const u8, len: usize),
    /// Next value of the `rdrand` sequence
    pub rdrand: unsafe extern "C" fn(ctx: *mut c_void) -> u64,
}

impl ServiceTable {
    /// Table forwarding every service to `services`. The table must not be used
    /// after `services` moves or is dropped.
    #[must_use]
    pub fn new<S: EngineServices>(services: *mut S) -> Self {
        Self {
            ctx: services.cast::<c_void>(),
            phys_read: phys_read_trampoline::<S>,
            phys_write: phys_write_trampoline::<S>,
            rdrand: rdrand_trampoline::<S>,
        }
    }

    /// Read guest physical memory into `buf`
    ///
    /// # Safety
    ///
    /// The context must still be alive and not borrowed elsewhere
    pub unsafe fn phys_read(&self, phys_addr: u64, buf: &mut [u8]) {
        (self.phys_read)(self.ctx, phys_addr, buf.as_mut_ptr(), buf.len());
    }

    /// Write `buf` to guest physical memory
    ///
    /// # Safety
    ///
    /// The context must still be alive and not borrowed elsewhere
    pub unsafe fn phys_write(&self, phys_addr: u64, buf: &[u8]) {
        (self.phys_write)(self.ctx, phys_addr, buf.as_ptr(), buf.len());
    }

    /// Get the next `rdrand` value
    ///
    /// # Safety
    ///
    /// The context must still be alive and not borrowed elsewhere
    pub unsafe fn rdrand(&self) -> u64 {
        (self.rdrand)(self.ctx)
    }
}

unsafe extern "C" fn phys_read_trampoline<S: EngineServices>(
    ctx: *mut c_void,
    phys_addr: u64,
    buf: *mut u8,
    len: usize,
) {
    if buf.is_null() || len == 0 {
        return;
    }

    let services = &mut *ctx.cast::<S>();
    services.phys_read(PhysAddr(phys_addr), std::slice::from_raw_parts_mut(buf, len));
}

unsafe extern "C" fn phys_write_trampoline<S: EngineServices>(
    ctx: *mut c_void,
    phys_addr: u64,
    buf: *const u8,
    len: usize,
) {
    if buf.is_null() || len == 0 {
        return;
    }

    let services = &mut *ctx.cast::<S>();
    services.phys_write(PhysAddr(phys_addr), std::slice::from_raw_parts(buf, len));
}

unsafe extern "C" fn rdrand_trampoline<S: EngineServices>(ctx: *mut c_void) -> u64 {
    let services = &mut *ctx.cast::<S>();
    services.rdrand()
}

impl<C: Cpu> Backend<C> {
    /// Stop the run with a crash named after `vector` and the current rip
    fn crash_on_exception(&mut self, vector: u32) {
        let rip = self.reg(Register::Rip);
        let reason = format!("{}_{rip:#x}", Exception::from(vector));
        log::debug!("Crash: {reason}");
        self.stop(TestcaseResult::Crash(reason));
    }

    /// Returns `true` if `cr3` is not the page table root the run started with
    fn left_target(&self, cr3: u64) -> bool {
        cr3 != self.initial_cr3.0
    }
}

impl<C: Cpu> Hooks for Backend<C> {
    fn before_execution(&mut self, _cpu_id: u32) {
        if self.stop_requested() {
            return;
        }

        let cr3 = self.reg(Register::Cr3);
        if self.left_target(cr3) {
            log::debug!("cr3 changed to {cr3:#x}, leaving the target");
            self.stop(TestcaseResult::Ok);
            return;
        }

        if let Some(limit) = self.instruction_limit {
            if self.stats.instructions_executed >= limit {
                self.stop(TestcaseResult::Timeout);
                return;
            }
        }

        let rip = VirtAddr(self.reg(Register::Rip));
        self.coverage.record_hit(rip);

        if let Some(tracer) = self.tracer.as_mut() {
            tracer.begin_instruction(rip);
        }

        self.handle_breakpoint(rip);

        self.stats.instructions_executed += 1;
    }

    fn after_execution(&mut self, _cpu_id: u32) {
        let Some(tracer) = self.tracer.as_mut() else {
            return;
        };

        if let Err(err) = tracer.finish_instruction() {
            log::error!("Failed to write trace {}: {err:?}", tracer.path().display());
            self.tracer = None;
        }
    }

    fn phy_access(&mut self, _cpu_id: u32, phys_addr: PhysAddr, len: u64, access: MemAccess) {
        self.stats.memory_accesses += len;

        if !access.is_write() {
            return;
        }

        let Some(memory) = self.memory.as_mut() else {
            return;
        };

        if !memory.dirty_physical_memory_range(phys_addr, len) {
            log::debug!("Write to {phys_addr:x?} ({len:#x} bytes) outside the snapshot");
        }
    }

    fn lin_access(
        &mut self,
        _cpu_id: u32,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        len: u64,
        access: MemAccess,
    ) {
        self.stats.memory_accesses += len;

        if let Some(tracer) = self.tracer.as_mut() {
            tracer.record_access(access, virt_addr, phys_addr, len);
        }

        if !access.is_write() {
            return;
        }

        let cr3 = Cr3(self.reg(Register::Cr3));
        let Some(memory) = self.memory.as_mut() else {
            return;
        };

        if !memory.dirty_virtual_memory_range(virt_addr, len, cr3) {
            // The engine already resolved the first page, dirty at least that one
            memory.dirty_physical_memory_range(phys_addr, len);
        }
    }

    fn interrupt(&mut self, _cpu_id: u32, vector: u32) {
        if self.stop_requested() || vector >= exception::FIRST_INTERRUPT_VECTOR {
            return;
        }

        if vector == exception::BREAKPOINT
            && self.exceptions.classify(vector) == VectorClass::Fatal
        {
            self.crash_on_exception(vector);
        }
    }

    fn exception(&mut self, _cpu_id: u32, vector: u32, error_code: u32) {
        if self.stop_requested() {
            return;
        }

        log::debug!(
            "Exception {} ({vector}) error code {error_code:#x}",
            Exception::from(vector)
        );

        match self.exceptions.classify(vector) {
            VectorClass::Fatal => self.crash_on_exception(vector),
            VectorClass::Benign if vector == exception::PAGE_FAULT => {
                let cr2 = VirtAddr(self.reg(Register::Cr2));
                let cr3 = Cr3(self.reg(Register::Cr3));
                let Some(memory) = self.memory.as_mut() else {
                    return;
                };

                match memory.fault_in(cr2, cr3) {
                    FaultOutcome::Unresolved => self.crash_on_exception(vector),
                    outcome => log::debug!("Page fault at {cr2:x?}: {outcome:x?}"),
                }
            }
            VectorClass::Benign => {}
        }
    }

    fn tlb_control(&mut self, _cpu_id: u32, what: TlbControl, new_value: u64) {
        let Some(memory) = self.memory.as_mut() else {
            return;
        };

        match what {
            TlbControl::Cr3 => {
                memory.flush_tlb();

                if self.left_target(new_value) && !self.stop_requested() {
                    log::debug!("cr3 written with {new_value:#x}, leaving the target");
                    self.stop(TestcaseResult::Ok);
                }
            }
            TlbControl::Invlpg => memory.flush_tlb_page(VirtAddr(new_value)),
            _ => memory.flush_tlb(),
        }
    }

    fn opcode(&mut self, _cpu_id: u32, opcode: &[u8]) {
        if let Some(tracer) = self.tracer.as_mut() {
            tracer.record_opcode(opcode);
        }
    }
}

impl<C: Cpu> EngineServices for Backend<C> {
    fn phys_read(&mut self, phys_addr: PhysAddr, buf: &mut [u8]) {
        let Some(memory) = self.memory.as_mut() else {
            buf.fill(0);
            return;
        };

        for (addr, _size) in page_boundaries(phys_addr.0, try_u64!(buf.len())) {
            memory.page_in(PhysAddr(addr));
        }

        if !memory.read_phys_bytes(phys_addr, buf) {
            log::debug!("Read of {phys_addr:x?} ({:#x} bytes) outside the snapshot", buf.len());
        }
    }

    fn phys_write(&mut self, phys_addr: PhysAddr, buf: &[u8]) {
        let Some(memory) = self.memory.as_mut() else {
            return;
        };

        for (addr, _size) in page_boundaries(phys_addr.0, try_u64!(buf.len())) {
            memory.page_in(PhysAddr(addr));
        }

        if !memory.write_phys_bytes(phys_addr, buf) {
            log::warn!(
                "Dropped write to {phys_addr:x?} ({:#x} bytes) outside the snapshot",
                buf.len()
            );
        }
    }

    fn rdrand(&mut self) -> u64 {
        Backend::rdrand(self)
    }
}
