//! Basalt code generator library.
//!
//! This crate transforms SSA-form intermediate representation into x86-64
//! assembly text. It is the middle end and back end of the Basalt compiler:
//! the front end builds an [`ir::Function`] through the operand factory and
//! instruction builder, hands it to a [`Compilation`], and receives a
//! complete `.s` file.
//!
//! The interesting machinery lives in the pass modules: [`cfg_build`] and
//! [`dominator_tree`] establish the control-flow shape, [`ssa`] constructs
//! and repairs SSA form, [`regalloc`] spills, splits, colors and coalesces,
//! and [`isa::x64`] selects instructions and prints assembly.

#![deny(missing_docs)]

pub use cranelift_entity as entity;

pub mod cfg_build;
pub mod compile;
pub mod constant_pool;
pub mod context;
pub mod defuse;
pub mod dominator_tree;
pub mod flowgraph;
pub mod ir;
pub mod isa;
pub mod liveness;
pub mod regalloc;
pub mod result;
pub mod settings;
pub mod ssa;
pub mod write;

pub use crate::compile::Compilation;
pub use crate::context::Context;
pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
