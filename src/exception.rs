//! x86 exception vectors and the policy deciding which ones end a run

use serde::{Deserialize, Serialize};

/// Vector of the page fault exception
pub const PAGE_FAULT: u32 = 14;

/// Vector of the breakpoint exception raised by `int3`
pub const BREAKPOINT: u32 = 3;

/// First vector that is not reserved for exceptions
pub const FIRST_INTERRUPT_VECTOR: u32 = 32;

/// Architectural exception vectors
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Exception {
    DivideError,
    Debug,
    Nmi,
    Breakpoint,
    Overflow,
    BoundRangeExceeded,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss,
    SegmentNotPresent,
    StackSegmentFault,
    GeneralProtection,
    PageFault,
    X87FloatingPoint,
    AlignmentCheck,
    MachineCheck,
    SimdFloatingPoint,
    Virtualization,
    ControlProtection,

    /// A reserved or interrupt vector
    Unknown(u32),
}

impl From<u32> for Exception {
    fn from(vector: u32) -> Self {
        match vector {
            0 => Exception::DivideError,
            1 => Exception::Debug,
            2 => Exception::Nmi,
            3 => Exception::Breakpoint,
            4 => Exception::Overflow,
            5 => Exception::BoundRangeExceeded,
            6 => Exception::InvalidOpcode,
            7 => Exception::DeviceNotAvailable,
            8 => Exception::DoubleFault,
            10 => Exception::InvalidTss,
            11 => Exception::SegmentNotPresent,
            12 => Exception::StackSegmentFault,
            13 => Exception::GeneralProtection,
            14 => Exception::PageFault,
            16 => Exception::X87FloatingPoint,
            17 => Exception::AlignmentCheck,
            18 => Exception::MachineCheck,
            19 => Exception::SimdFloatingPoint,
            20 => Exception::Virtualization,
            21 => Exception::ControlProtection,
            vector => Exception::Unknown(vector),
        }
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exception::Unknown(vector) => write!(f, "Vector{vector:#x}"),
            exception => write!(f, "{exception:?}"),
        }
    }
}

/// How a vector is handled when the guest raises it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VectorClass {
    /// Expected during normal execution, handed to the fault servicing path
    Benign,

    /// Ends the run as a crash
    Fatal,
}

/// Target specific split between benign and fatal exception vectors. Any vector not
/// listed as benign is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionPolicy {
    /// Vectors that do not end the run
    #[serde(default = "default_benign_vectors")]
    pub benign_vectors: Vec<u32>,
}

fn default_benign_vectors() -> Vec<u32> {
    vec![PAGE_FAULT]
}

impl Default for ExceptionPolicy {
    fn default() -> Self {
        Self {
            benign_vectors: default_benign_vectors(),
        }
    }
}

impl ExceptionPolicy {
    /// Classify `vector`
    #[must_use]
    pub fn classify(&self, vector: u32) -> VectorClass {
        if self.benign_vectors.contains(&vector) {
            VectorClass::Benign
        } else {
            VectorClass::Fatal
        }
    }
}
