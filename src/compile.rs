//! The whole-compilation driver: functions in, one `.s` file out.

use crate::constant_pool::ConstantPool;
use crate::context::Context;
use crate::ir::Function;
use crate::isa::TargetIsa;
use crate::result::CodegenResult;
use std::fmt::Write;

/// A compilation unit: every function destined for one assembly file,
/// together with the shared constant pool.
pub struct Compilation {
    contexts: Vec<Context>,
    pool: ConstantPool,
}

impl Compilation {
    /// Create an empty compilation unit.
    pub fn new() -> Self {
        Self {
            contexts: Vec::new(),
            pool: ConstantPool::new(),
        }
    }

    /// Add a function built by the front end. Functions are compiled and
    /// emitted in declaration order.
    pub fn declare_function(&mut self, func: Function) {
        self.contexts.push(Context::for_function(func));
    }

    /// Compile every declared function with `isa` and produce the assembly
    /// file: `.text`, the functions, the `_start` preamble, and the
    /// constant block.
    pub fn compile(mut self, isa: &dyn TargetIsa) -> CodegenResult<String> {
        let mut out = String::new();
        let _ = writeln!(out, "\t.text");

        for (seq, ctx) in self.contexts.iter_mut().enumerate() {
            ctx.build_cfg();
            ctx.construct_ssa();
            ctx.compile(isa, &mut self.pool, &mut out, seq as u32 + 1)?;
        }

        isa.emit_start(&mut out);
        self.pool.dump(&mut out);
        Ok(out)
    }
}

impl Default for Compilation {
    fn default() -> Self {
        Self::new()
    }
}
