//! Execution traces written while a testcase runs

use anyhow::{Context, Result};
use iced_x86::{Decoder, DecoderOptions, FastFormatter, Instruction};

use crate::addrs::{PhysAddr, VirtAddr};
use crate::config::TraceType;
use crate::cpu::MemAccess;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Longest possible x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;

/// A memory access made by the instruction being traced
#[derive(Debug, Copy, Clone)]
struct Access {
    kind: MemAccess,
    virt_addr: VirtAddr,
    phys_addr: PhysAddr,
    len: u64,
}

/// Instruction whose record is written once it retires
#[derive(Debug, Default)]
struct PendingInstruction {
    rip: VirtAddr,
    bytes: Vec<u8>,
    accesses: Vec<Access>,
}

/// Writes one record per retired instruction to a trace file
pub struct Tracer {
    /// What to write
    trace_type: TraceType,

    /// Path of the trace file
    path: PathBuf,

    /// Buffered trace file
    writer: BufWriter<File>,

    /// Instruction currently executing, if any
    pending: Option<PendingInstruction>,

    /// Disassembly formatter for [`TraceType::Full`]
    formatter: FastFormatter,
}

impl Tracer {
    /// Create (or truncate) the trace file at `path`
    ///
    /// # Errors
    ///
    /// * Failed to create the file
    pub fn create(path: &Path, trace_type: TraceType) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create trace file {}", path.display()))?;

        let mut formatter = FastFormatter::new();
        formatter.options_mut().set_uppercase_hex(false);
        formatter.options_mut().set_use_hex_prefix(true);
        formatter.options_mut().set_always_show_memory_size(true);
        formatter
            .options_mut()
            .set_space_after_operand_separator(true);
        formatter.options_mut().set_rip_relative_addresses(true);

        Ok(Self {
            trace_type,
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            pending: None,
            formatter,
        })
    }

    /// Path of the trace file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start the record of the instruction at `rip`
    pub fn begin_instruction(&mut self, rip: VirtAddr) {
        self.pending = Some(PendingInstruction {
            rip,
            ..PendingInstruction::default()
        });
    }

    /// Attach the opcode bytes of the instruction being executed
    pub fn record_opcode(&mut self, bytes: &[u8]) {
        if let Some(pending) = self.pending.as_mut() {
            let len = bytes.len().min(MAX_INSTRUCTION_LEN);
            pending.bytes.clear();
            pending.bytes.extend_from_slice(&bytes[..len]);
        }
    }

    /// Attach a memory access to the instruction being executed. Only kept for
    /// [`TraceType::Full`].
    pub fn record_access(
        &mut self,
        kind: MemAccess,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        len: u64,
    ) {
        if self.trace_type != TraceType::Full {
            return;
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.accesses.push(Access {
                kind,
                virt_addr,
                phys_addr,
                len,
            });
        }
    }

    /// Write the record of the instruction that just retired. Does nothing unless
    /// [`Tracer::begin_instruction`] started a record since the last call.
    ///
    /// # Errors
    ///
    /// * Failed to write to the trace file
    pub fn finish_instruction(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        match self.trace_type {
            TraceType::None => {}
            TraceType::Instructions => {
                writeln!(self.writer, "{:#018x} {}", pending.rip.0, pending.bytes.len())?;
            }
            TraceType::Full => {
                let disasm = disassemble(&mut self.formatter, pending.rip, &pending.bytes);
                writeln!(
                    self.writer,
                    "{:#018x} {:<30} {disasm}",
                    pending.rip.0,
                    hex(&pending.bytes)
                )?;

                for access in &pending.accesses {
                    writeln!(
                        self.writer,
                        "    {} {:#018x} {:#014x} {:#x}",
                        access.kind.as_char(),
                        access.virt_addr.0,
                        access.phys_addr.0,
                        access.len
                    )?;
                }
            }
        }

        Ok(())
    }

    /// Flush buffered records to the trace file
    ///
    /// # Errors
    ///
    /// * Failed to write to the trace file
    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush trace file {}", self.path.display()))
    }
}

/// Bytes as a contiguous lowercase hex string
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Disassemble the instruction in `bytes` located at `rip`
fn disassemble(formatter: &mut FastFormatter, rip: VirtAddr, bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "??".to_string();
    }

    let mut instr = Instruction::default();
    let mut decoder = Decoder::with_ip(64, bytes, rip.0, DecoderOptions::NONE);
    decoder.decode_out(&mut instr);

    if instr.is_invalid() {
        return "(bad)".to_string();
    }

    let mut output = String::new();
    formatter.format(&instr, &mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(trace_type: TraceType) -> String {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.txt");

        let mut tracer = Tracer::create(&path, trace_type).unwrap();

        // mov rax, qword ptr [rbx]
        tracer.begin_instruction(VirtAddr(0x40_1000));
        tracer.record_opcode(&[0x48, 0x8b, 0x03]);
        tracer.record_access(MemAccess::Read, VirtAddr(0x40_2000), PhysAddr(0x9000), 8);
        tracer.finish_instruction().unwrap();

        // nop
        tracer.begin_instruction(VirtAddr(0x40_1003));
        tracer.record_opcode(&[0x90]);
        tracer.finish_instruction().unwrap();
        tracer.flush().unwrap();

        std::fs::read_to_string(&path).unwrap()
    }

    #[test]
    fn instruction_trace() {
        let output = trace(TraceType::Instructions);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["0x0000000000401000 3", "0x0000000000401003 1"]);
    }

    #[test]
    fn full_trace() {
        let output = trace(TraceType::Full);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0x0000000000401000 488b03"));
        assert!(lines[0].contains("mov rax,"), "{}", lines[0]);
        assert!(lines[0].contains("[rbx]"), "{}", lines[0]);
        assert_eq!(lines[1].trim(), "R 0x0000000000402000 0x000000009000 0x8");
        assert!(lines[2].ends_with("nop"), "{}", lines[2]);
    }

    #[test]
    fn retire_without_begin_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.txt");

        let mut tracer = Tracer::create(&path, TraceType::Full).unwrap();
        tracer.begin_instruction(VirtAddr(0x40_1000));
        tracer.record_opcode(&[0x90]);
        tracer.finish_instruction().unwrap();

        // Events of an instruction that never began a record
        tracer.record_opcode(&[0x48, 0x8b, 0x03]);
        tracer.record_access(MemAccess::Read, VirtAddr(0x40_2000), PhysAddr(0x9000), 8);
        tracer.finish_instruction().unwrap();
        tracer.flush().unwrap();

        let output = std::fs::read_to_string(&path).unwrap();
        assert_eq!(output.lines().count(), 1, "{output}");
        assert!(output.starts_with("0x0000000000401000 90"));
    }

    #[test]
    fn missing_opcode() {
        let mut formatter = FastFormatter::new();
        assert_eq!(disassemble(&mut formatter, VirtAddr(0), &[]), "??");
    }
}
