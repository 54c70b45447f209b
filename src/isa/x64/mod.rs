//! x86-64 target: register file, stack places, and the pass pipelines.

pub mod abi;
pub mod cast;
pub mod emit;
pub mod targeting;

use crate::constant_pool::ConstantPool;
use crate::context::Context;
use crate::ir::{RegClass, RegUnit, Type};
use crate::isa::TargetIsa;
use crate::regalloc::RegisterSet;
use crate::result::CodegenResult;
use crate::settings::Flags;

/// General-purpose register units.
pub const RAX: RegUnit = 0;
#[allow(missing_docs)]
pub const RCX: RegUnit = 1;
#[allow(missing_docs)]
pub const RDX: RegUnit = 2;
#[allow(missing_docs)]
pub const RBX: RegUnit = 3;
#[allow(missing_docs)]
pub const RSP: RegUnit = 4;
#[allow(missing_docs)]
pub const RBP: RegUnit = 5;
#[allow(missing_docs)]
pub const RSI: RegUnit = 6;
#[allow(missing_docs)]
pub const RDI: RegUnit = 7;
#[allow(missing_docs)]
pub const R8: RegUnit = 8;
#[allow(missing_docs)]
pub const R9: RegUnit = 9;
#[allow(missing_docs)]
pub const R10: RegUnit = 10;
#[allow(missing_docs)]
pub const R11: RegUnit = 11;
#[allow(missing_docs)]
pub const R12: RegUnit = 12;
#[allow(missing_docs)]
pub const R13: RegUnit = 13;
#[allow(missing_docs)]
pub const R14: RegUnit = 14;
#[allow(missing_docs)]
pub const R15: RegUnit = 15;

/// First XMM register unit; XMM0..XMM15 are units 16..32.
pub const XMM0: RegUnit = 16;
#[allow(missing_docs)]
pub const XMM1: RegUnit = 17;

/// Index of the 8-byte spill-slot place.
pub const QUADWORDS: usize = 0;
/// Index of the 16-byte spill-slot place.
pub const OCTWORDS: usize = 1;
/// Item sizes of the stack places.
pub const STACK_PLACES: [u32; 2] = [8, 16];

/// Callee-saved general-purpose registers in push order. `RBP` is listed
/// for completeness; with the frame pointer kept it never gets allocated,
/// so it never shows up in `used_colors`.
pub const CALLEE_SAVED: [RegUnit; 6] = [RBX, RBP, R12, R13, R14, R15];

/// System V integer argument registers in order.
pub const INT_ARGS: [RegUnit; 6] = [RDI, RSI, RDX, RCX, R8, R9];
/// System V floating-point argument registers in order.
pub const FP_ARGS: [RegUnit; 8] = [
    XMM0,
    XMM0 + 1,
    XMM0 + 2,
    XMM0 + 3,
    XMM0 + 4,
    XMM0 + 5,
    XMM0 + 6,
    XMM0 + 7,
];
/// Caller-saved general-purpose registers.
pub const INT_CLOBBERS: [RegUnit; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

const GPR8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const GPR16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const GPR32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const GPR64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const XMM: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

/// The x86-64 ISA.
pub struct X64 {
    flags: Flags,
}

impl X64 {
    /// Create the ISA with the given flags.
    pub fn new(flags: Flags) -> Self {
        Self { flags }
    }
}

impl TargetIsa for X64 {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn flags(&self) -> &Flags {
        &self.flags
    }

    fn align_of(&self, size: u32) -> u32 {
        crate::ir::next_power_of_two(size).min(16)
    }

    fn stack_alignment(&self) -> u32 {
        16
    }

    fn stack_places(&self) -> &'static [u32] {
        &STACK_PLACES
    }

    fn allocatable(&self, class: RegClass) -> RegisterSet {
        match class {
            RegClass::Gpr => {
                let mut set = RegisterSet::from_range(0..16);
                // The stack pointer is never allocated; the frame pointer
                // only when it is omitted from the prologue.
                set.remove(RSP);
                if !self.flags.omit_frame_pointer() {
                    set.remove(RBP);
                }
                if let Some(limit) = self.flags.gpr_limit() {
                    set.keep_lowest(limit as usize);
                }
                set
            }
            RegClass::Xmm => RegisterSet::from_range(16..32),
        }
    }

    fn reg_name(&self, unit: RegUnit, ty: Type) -> &'static str {
        if unit >= XMM0 {
            debug_assert!(ty.is_real() || ty == Type::Stack, "GP type in an XMM unit");
            return XMM[(unit - XMM0) as usize];
        }
        let i = unit as usize;
        match ty.bytes() {
            1 => GPR8[i],
            2 => GPR16[i],
            4 => GPR32[i],
            _ => GPR64[i],
        }
    }

    fn regalloc(&self, ctx: &mut Context) -> CodegenResult<()> {
        targeting::run_regalloc(self, ctx)
    }

    fn codegen(
        &self,
        ctx: &mut Context,
        pool: &mut ConstantPool,
        out: &mut String,
        seq: u32,
    ) -> CodegenResult<()> {
        emit::emit_function(self, ctx, pool, out, seq)
    }

    fn emit_start(&self, out: &mut String) {
        emit::emit_start(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_names_by_width() {
        let isa = X64::new(Flags::default());
        assert_eq!(isa.reg_name(RAX, Type::Int32), "eax");
        assert_eq!(isa.reg_name(RAX, Type::Int64), "rax");
        assert_eq!(isa.reg_name(RAX, Type::Bool), "al");
        assert_eq!(isa.reg_name(RDI, Type::Int16), "di");
        assert_eq!(isa.reg_name(R10, Type::Ptr), "r10");
        assert_eq!(isa.reg_name(XMM0, Type::Real32), "xmm0");
        assert_eq!(isa.reg_name(XMM0 + 15, Type::Real64), "xmm15");
    }

    #[test]
    fn reservoir_excludes_rsp_and_rbp() {
        let isa = X64::new(Flags::default());
        let gpr = isa.allocatable(RegClass::Gpr);
        assert!(!gpr.contains(RSP));
        assert!(!gpr.contains(RBP));
        assert_eq!(gpr.len(), 14);
        assert_eq!(isa.allocatable(RegClass::Xmm).len(), 16);
    }

    #[test]
    fn gpr_limit_shrinks_reservoir() {
        let flags = Flags::new(crate::settings::builder().set_gpr_limit(4));
        let isa = X64::new(flags);
        let gpr = isa.allocatable(RegClass::Gpr);
        assert_eq!(gpr.len(), 4);
        assert!(gpr.contains(RAX));
        assert!(gpr.contains(RBX));
        assert!(!gpr.contains(RSI));
    }
}
