//! Register identifiers and accessors

use crate::backend::Backend;
use crate::cpu::Cpu;
use crate::state::CpuState;

/// Declare the [`Register`] enum along with the [`CpuState`] field each one reads
macro_rules! registers {
    ($($reg:ident => $($field:ident).+),* $(,)?) => {
        /// Registers reachable through [`Backend::reg`] and [`Backend::set_reg`]
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum Register {
            $($reg),*
        }

        impl Register {
            /// Every register
            pub const ALL: &'static [Register] = &[$(Register::$reg),*];
        }

        impl CpuState {
            /// Read `reg` from this state
            #[must_use]
            pub fn reg(&self, reg: Register) -> u64 {
                match reg {
                    $(Register::$reg => u64::from(self.$($field).+)),*
                }
            }

            /// Write `reg` in this state. Narrow registers keep the low bits of `val`.
            #[allow(clippy::cast_possible_truncation)]
            pub fn set_reg(&mut self, reg: Register, val: u64) {
                match reg {
                    $(Register::$reg => self.$($field).+ = val as _),*
                }
            }
        }
    };
}

registers! {
    Rax => rax,
    Rbx => rbx,
    Rcx => rcx,
    Rdx => rdx,
    Rsi => rsi,
    Rdi => rdi,
    Rsp => rsp,
    Rbp => rbp,
    R8 => r8,
    R9 => r9,
    R10 => r10,
    R11 => r11,
    R12 => r12,
    R13 => r13,
    R14 => r14,
    R15 => r15,
    Rip => rip,
    Rflags => rflags,
    Cr0 => cr0,
    Cr2 => cr2,
    Cr3 => cr3,
    Cr4 => cr4,
    Cr8 => cr8,
    Efer => efer,
    Xcr0 => xcr0,
    FsBase => fs.base,
    GsBase => gs.base,
    KernelGsBase => kernel_gs_base,
    Star => star,
    Lstar => lstar,
    Cstar => cstar,
    Sfmask => sfmask,
    Tsc => tsc,
    Dr0 => dr0,
    Dr1 => dr1,
    Dr2 => dr2,
    Dr3 => dr3,
    Dr6 => dr6,
    Dr7 => dr7,
    Cs => cs.selector,
    Ss => ss.selector,
    Ds => ds.selector,
    Es => es.selector,
    Fs => fs.selector,
    Gs => gs.selector,
}

/// Implement getter/setters for register accesses on the backend
///
/// # Example
///
/// ```text
/// let rax = backend.rax();
/// backend.set_rax(0x1234);
/// ```
macro_rules! impl_reg {
    ($($getter:ident, $setter:ident, $reg:ident);* $(;)?) => {
        impl<C: Cpu> Backend<C> {
            $(
                #[doc = concat!("Read the ", stringify!($getter), " register from the guest")]
                #[must_use]
                pub fn $getter(&self) -> u64 {
                    self.reg(Register::$reg)
                }

                #[doc = concat!("Write the ", stringify!($getter), " register in the guest")]
                pub fn $setter(&mut self, val: u64) {
                    self.set_reg(Register::$reg, val);
                }
            )*
        }
    };
}

impl_reg! {
    rax, set_rax, Rax;
    rbx, set_rbx, Rbx;
    rcx, set_rcx, Rcx;
    rdx, set_rdx, Rdx;
    rsi, set_rsi, Rsi;
    rdi, set_rdi, Rdi;
    rsp, set_rsp, Rsp;
    rbp, set_rbp, Rbp;
    r8, set_r8, R8;
    r9, set_r9, R9;
    r10, set_r10, R10;
    r11, set_r11, R11;
    r12, set_r12, R12;
    r13, set_r13, R13;
    r14, set_r14, R14;
    r15, set_r15, R15;
    rip, set_rip, Rip;
    rflags, set_rflags, Rflags;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_register_round_trips_through_state() {
        let mut state = CpuState::default();
        for (index, reg) in Register::ALL.iter().enumerate() {
            // Segment selectors are 16 bits wide
            let val = 0x1000 + index as u64;
            state.set_reg(*reg, val);
            assert_eq!(state.reg(*reg), val, "{reg:?}");
        }
    }

    #[test]
    fn selectors_truncate() {
        let mut state = CpuState::default();
        state.set_reg(Register::Cs, 0x1_0033);
        assert_eq!(state.reg(Register::Cs), 0x33);
        assert_eq!(state.cs.selector, 0x33);
    }

    #[test]
    fn fs_base_is_segment_base() {
        let mut state = CpuState::default();
        state.set_reg(Register::FsBase, 0x7fff_0000);
        assert_eq!(state.fs.base, 0x7fff_0000);
    }
}
