//! IR entity references.
//!
//! IR objects reference each other through compact `u32` indices into tables
//! owned by the `Function`, not through Rust references: the ownership and
//! mutability rules make pointer-shaped graphs impractical, and 32-bit
//! indices keep the in-memory representation small. There is a separate
//! index type per entity so the type system keeps them apart. Compact data
//! structures store `PackedOption<T>` instead of `Option<T>`.

use crate::entity::entity_impl;
use core::fmt;

/// An opaque reference to a basic block in a function.
///
/// Blocks are created by CFG construction, not by the front end; the front
/// end marks intended block boundaries with `Label` instructions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an instruction in a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a variable (a `Var` in the data model): either a
/// pseudo-register destined for a machine register or spill slot, or a named
/// stack location holding an aggregate.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to a constant pooled in a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Constant(u32);
entity_impl!(Constant, "const");

/// A program point: either a block boundary or a single instruction.
///
/// Dominance queries accept both granularities.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ProgramPoint {
    /// An instruction.
    Inst(Inst),
    /// A block header.
    Block(Block),
}

impl From<Inst> for ProgramPoint {
    fn from(inst: Inst) -> Self {
        Self::Inst(inst)
    }
}

impl From<Block> for ProgramPoint {
    fn from(block: Block) -> Self {
        Self::Block(block)
    }
}

impl fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Inst(i) => write!(f, "{}", i),
            Self::Block(b) => write!(f, "{}", b),
        }
    }
}
