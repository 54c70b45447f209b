//! Target ISA abstraction.
//!
//! Everything the middle end needs to know about a target sits behind the
//! [`TargetIsa`] trait: alignment rules, the stack places, the register
//! reservoirs, register naming, and the two entry points that run register
//! allocation and code generation for one function. Use [`lookup`] to get
//! the implementation for a target triple.

pub mod x64;

use crate::constant_pool::ConstantPool;
use crate::context::Context;
use crate::ir::{RegClass, RegUnit, Type};
use crate::regalloc::RegisterSet;
use crate::result::{CodegenError, CodegenResult};
use crate::settings::Flags;
use target_lexicon::{Architecture, OperatingSystem, Triple};

/// Methods implemented by a target.
pub trait TargetIsa {
    /// Short name of this ISA, e.g. `"x64"`.
    fn name(&self) -> &'static str;

    /// The compilation flags this ISA was configured with.
    fn flags(&self) -> &Flags;

    /// Alignment in bytes for an item of `size` bytes.
    fn align_of(&self, size: u32) -> u32;

    /// Required stack alignment at call boundaries.
    fn stack_alignment(&self) -> u32;

    /// Item sizes of the stack places, indexed by place number.
    fn stack_places(&self) -> &'static [u32];

    /// The allocatable registers of `class`.
    fn allocatable(&self, class: RegClass) -> RegisterSet;

    /// Assembly name of register `unit` when holding a value of type `ty`.
    fn reg_name(&self, unit: RegUnit, ty: Type) -> &'static str;

    /// Run the register allocation pipeline on one function.
    fn regalloc(&self, ctx: &mut Context) -> CodegenResult<()>;

    /// Emit assembly for one allocated function into `out`.
    fn codegen(
        &self,
        ctx: &mut Context,
        pool: &mut ConstantPool,
        out: &mut String,
        seq: u32,
    ) -> CodegenResult<()>;

    /// Emit the process entry routine once per compilation unit.
    fn emit_start(&self, out: &mut String);
}

/// Look up the ISA for `triple`, configured with `flags`.
pub fn lookup(triple: Triple, flags: Flags) -> CodegenResult<Box<dyn TargetIsa>> {
    match (triple.architecture, triple.operating_system) {
        (Architecture::X86_64, OperatingSystem::Linux) => Ok(Box::new(x64::X64::new(flags))),
        _ => Err(CodegenError::Unsupported(format!(
            "no support for target {}",
            triple
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lookup_x64_linux() {
        let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        let isa = lookup(triple, Flags::default()).unwrap();
        assert_eq!(isa.name(), "x64");
    }

    #[test]
    fn lookup_rejects_others() {
        let triple = Triple::from_str("aarch64-unknown-linux-gnu").unwrap();
        assert!(lookup(triple, Flags::default()).is_err());
    }
}
