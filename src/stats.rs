//! Statistics gathered by a backend over its runs

/// Counters describing the last run and the session so far
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Instructions retired by the last run
    pub instructions_executed: u64,

    /// Bytes of guest memory accessed by the last run
    pub memory_accesses: u64,

    /// Unique instruction addresses executed across the session
    pub aggregated_code_coverage: u64,

    /// Instruction addresses first discovered by the last run
    pub new_code_coverage: u64,

    /// Pages dirtied by the last run
    pub dirty_gpas: u64,
}

impl RunStats {
    /// Reset the per-run counters
    pub fn reset(&mut self) {
        self.instructions_executed = 0;
        self.memory_accesses = 0;
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Instrs: {:>10} | Mem: {:>10} | Cov: {:>8} (+{}) | Dirty: {:>6}",
            self.instructions_executed,
            self.memory_accesses,
            self.aggregated_code_coverage,
            self.new_code_coverage,
            self.dirty_gpas
        )
    }
}
