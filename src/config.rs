//! Configuration settings for a backend

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::exception::{ExceptionPolicy, FIRST_INTERRUPT_VECTOR};

use std::path::{Path, PathBuf};

/// Custom errors [`Options`] can fail validation with
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A trace type other than `None` was given without a trace file
    #[error("trace_type {0:?} needs a trace_path")]
    MissingTracePath(TraceType),

    /// A benign vector is not an exception vector
    #[error("Benign vector {0:#x} is not an exception vector")]
    InvalidBenignVector(u32),
}

/// What is written to the trace file
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceType {
    /// No trace
    #[default]
    None,

    /// One record per executed instruction
    Instructions,

    /// Instructions with their disassembly, followed by their memory accesses
    Full,
}

/// Configuration settings for a [`Backend`](crate::Backend)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Number of instructions a run may execute before it is a timeout. No limit
    /// if unset.
    #[serde(default)]
    pub instruction_limit: Option<u64>,

    /// Kind of trace written for every run
    #[serde(default)]
    pub trace_type: TraceType,

    /// Trace file to write. Tracing is off if unset.
    #[serde(default)]
    pub trace_path: Option<PathBuf>,

    /// Seed of the deterministic `rdrand` sequence
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Which exception vectors are crashes
    #[serde(default)]
    pub exceptions: ExceptionPolicy,
}

const fn default_seed() -> u64 {
    0
}

impl std::default::Default for Options {
    fn default() -> Self {
        Self {
            instruction_limit: None,
            trace_type: TraceType::default(),
            trace_path: None,
            seed: default_seed(),
            exceptions: ExceptionPolicy::default(),
        }
    }
}

impl Options {
    /// Parse [`Options`] from TOML
    ///
    /// # Errors
    ///
    /// * The TOML does not describe [`Options`]
    /// * The options fail [`Options::validate`]
    pub fn from_toml(data: &str) -> Result<Self> {
        let options: Self = toml::from_str(data)?;
        options.validate()?;
        Ok(options)
    }

    /// Check that the options are consistent
    ///
    /// # Errors
    ///
    /// * Tracing is requested without a trace file
    /// * A benign vector is an interrupt vector
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.trace_type == TraceType::None || self.trace_path.is_some(),
            Error::MissingTracePath(self.trace_type)
        );

        for vector in &self.exceptions.benign_vectors {
            ensure!(
                *vector < FIRST_INTERRUPT_VECTOR,
                Error::InvalidBenignVector(*vector)
            );
        }

        Ok(())
    }

    /// Read [`Options`] from a TOML file
    ///
    /// # Errors
    ///
    /// * Failed to read or parse the file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        Self::from_toml(&data).with_context(|| format!("Invalid config {}", path.display()))
    }
}
