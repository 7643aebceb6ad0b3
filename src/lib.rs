//! # snapemu
//!
//! Replay testcases against a memory snapshot on top of an instruction-emulation
//! engine
//!
//! A snapshot is a physical memory image plus a register state captured from a real
//! machine. Every run starts from that snapshot, executes a testcase until the guest
//! crashes, times out, or leaves the target process, and is then reset by reverting
//! only the pages it dirtied.
//!
//! The emulation engine itself is not part of this crate. It is driven through the
//! [`Cpu`] trait and calls back into the backend through a `#[repr(C)]` hook chain
//! ([`hooks::HookChain`]) and a table of memory services ([`hooks::ServiceTable`]).
//!
//! ## Roadmap of the repo:
//!
//! * [`Backend`] - Execution controller. Owns the snapshot memory, coverage,
//!   breakpoints and run statistics and drives the engine for one run at a time:
//!     - [`Backend::initialize`]
//!     - [`Backend::run`]
//!     - [`Backend::restore`]
//!     - [`Backend::set_breakpoint`]
//! * [`memory::Memory`] - Copy-on-write guest memory over an immutable
//!   [`memory::SnapshotMemory`]
//! * [`feedback::CoverageTracker`] - Session and per-run code coverage
//! * [`hooks`] - The seam between the engine's callbacks and the backend
//!
//! # Example:
//!
//! ```rust,ignore
//! let snapshot = SnapshotMemory::from_file(Path::new("snapshot.physmem"))?;
//! let state = CpuState::from_file(Path::new("snapshot.regs"))?;
//! let options = Options::from_file(Path::new("config.toml"))?;
//!
//! let mut backend = Backend::new(engine);
//! backend.initialize(&options, snapshot, &state)?;
//!
//! // Inject the testcase when the target reaches its read loop
//! backend.set_breakpoint(VirtAddr(0x40_1337), |backend, _addr| {
//!     let input = backend.testcase().to_vec();
//!     let buffer = VirtAddr(backend.rdi());
//!     backend.virt_write(buffer, &input)?;
//!     backend.set_rax(input.len() as u64);
//!     Ok(Execution::Continue)
//! });
//!
//! for input in corpus {
//!     let result = backend.run(&input)?;
//!     backend.restore(&state)?;
//! }
//! ```

#![deny(missing_docs)]

#[macro_use]
mod try_macros;

pub use anyhow;
pub use rand;

pub mod addrs;
pub use addrs::{Cr3, PhysAddr, VirtAddr, PAGE_SIZE};

pub mod backend;
pub use backend::{Backend, Primitive};

pub mod breakpoints;
pub use breakpoints::BreakpointHandler;

pub mod config;
pub use config::{Options, TraceType};

pub mod cpu;
pub use cpu::Cpu;

pub mod exception;
pub use exception::{Exception, ExceptionPolicy};

pub mod feedback;
pub mod hooks;
pub mod memory;
pub mod page_table;
pub use page_table::{MemoryValidate, TranslationFault};

pub mod regs;
pub use regs::Register;

pub mod rng;

pub mod state;
pub use state::CpuState;

pub mod stats;
pub use stats::RunStats;

pub mod trace;

/// Outcome of a single run
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TestcaseResult {
    /// The guest finished or left the target process
    Ok,

    /// The guest crashed. The reason names the crash, for example
    /// `GeneralProtection_0x401000`.
    Crash(String),

    /// The guest exceeded the instruction limit
    Timeout,
}

impl TestcaseResult {
    /// Returns true if the given result is a crash.
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crash(_))
    }

    /// Returns true if the given result is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl std::fmt::Display for TestcaseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestcaseResult::Ok => write!(f, "ok"),
            TestcaseResult::Crash(reason) => write!(f, "crash ({reason})"),
            TestcaseResult::Timeout => write!(f, "timeout"),
        }
    }
}

/// What to do after a breakpoint handler returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// Continue execution of the current run
    Continue,

    /// Stop the current run with the given result
    Stop(TestcaseResult),
}
