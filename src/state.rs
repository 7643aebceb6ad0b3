//! Register state captured alongside the physical memory snapshot

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_hex::{CompactPfx, SerHex};

use crate::addrs::{Cr3, VirtAddr};

use std::path::Path;

/// cr0.PE
const CR0_PE: u64 = 1 << 0;

/// cr0.PG
const CR0_PG: u64 = 1 << 31;

/// cr4.PAE
const CR4_PAE: u64 = 1 << 5;

/// efer.LMA
const EFER_LMA: u64 = 1 << 10;

/// Custom errors a [`CpuState`] can fail validation with
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Paging or protected mode is disabled in cr0
    #[error("cr0 {0:#x} does not enable protected mode with paging")]
    PagingDisabled(u64),

    /// cr4.PAE is clear, 4-level paging is not in use
    #[error("cr4 {0:#x} does not enable PAE")]
    PaeDisabled(u64),

    /// efer.LMA is clear, the snapshot was not taken in long mode
    #[error("efer {0:#x} is not in long mode")]
    NotLongMode(u64),

    /// The page table root is beyond the physical address width
    #[error("cr3 {0:#x} sets reserved bits")]
    InvalidCr3(u64),

    /// rip is not a canonical address
    #[error("rip {0:#x} is not canonical")]
    NonCanonicalRip(u64),
}

/// Segment register
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Segment {
    #[serde(with = "SerHex::<CompactPfx>")]
    pub selector: u16,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub limit: u32,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub attr: u16,
}

/// Descriptor table register (`gdtr`/`idtr`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct GlobalSegment {
    #[serde(with = "SerHex::<CompactPfx>")]
    pub base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub limit: u16,
}

/// Architectural register file of a single x86-64 core
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CpuState {
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rax: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rbx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rcx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rdx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rsi: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rdi: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rsp: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rbp: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r8: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r9: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r10: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r11: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r12: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r13: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r14: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r15: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rip: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rflags: u64,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdtr: GlobalSegment,
    pub idtr: GlobalSegment,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr0: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr2: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr3: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr4: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr8: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub xcr0: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub efer: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub kernel_gs_base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub star: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub lstar: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cstar: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub sfmask: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub tsc: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr0: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr1: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr2: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr3: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr6: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr7: u64,
}

impl CpuState {
    /// Parse a register state from JSON
    ///
    /// # Errors
    ///
    /// * The JSON does not describe a [`CpuState`]
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a register state from a JSON file
    ///
    /// # Errors
    ///
    /// * Failed to read or parse the file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read register state {}", path.display()))?;

        Self::from_json(&json).with_context(|| format!("Invalid register state {}", path.display()))
    }

    /// Page table root of this state
    #[must_use]
    pub fn cr3(&self) -> Cr3 {
        Cr3(self.cr3)
    }

    /// Check that this state is a 64-bit long mode state using 4-level paging
    ///
    /// # Errors
    ///
    /// * Paging, PAE or long mode is disabled
    /// * cr3 sets bits beyond the physical address width
    /// * rip is not canonical
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cr0 & (CR0_PE | CR0_PG) == CR0_PE | CR0_PG,
            Error::PagingDisabled(self.cr0)
        );
        ensure!(self.cr4 & CR4_PAE != 0, Error::PaeDisabled(self.cr4));
        ensure!(self.efer & EFER_LMA != 0, Error::NotLongMode(self.efer));
        ensure!(self.cr3 >> 52 == 0, Error::InvalidCr3(self.cr3));
        ensure!(
            VirtAddr(self.rip).is_canonical(),
            Error::NonCanonicalRip(self.rip)
        );

        Ok(())
    }
}
