//! Operands: variables, constants, undefined values, and their allocation
//! state.

use crate::ir::entities::{Constant, Value};
use crate::ir::types::{RegClass, Type};
use core::fmt;

/// A register unit index into the target's register file.
///
/// On x86-64 the general-purpose registers occupy units 0..16 and the XMM
/// registers units 16..32.
pub type RegUnit = u16;

/// The allocation state of a variable.
///
/// Spilled registers draw their color from the dense spill-slot index space
/// of their stack place rather than from the register file, so the two
/// assigned variants cannot be confused.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Color {
    /// Not colored yet.
    #[default]
    None,
    /// Deliberately excluded from allocation.
    ///
    /// Used for values that never materialize, e.g. comparison results fused
    /// into a following branch.
    Dont,
    /// Assigned to a register unit.
    Reg(RegUnit),
    /// Assigned to a spill slot or stack slot index.
    Slot(u32),
}

impl Color {
    /// The register unit, or panic.
    pub fn unwrap_reg(self) -> RegUnit {
        match self {
            Self::Reg(ru) => ru,
            _ => panic!("unwrap_reg expected register, found {:?}", self),
        }
    }

    /// The slot index, or panic.
    pub fn unwrap_slot(self) -> u32 {
        match self {
            Self::Slot(s) => s,
            _ => panic!("unwrap_slot expected slot, found {:?}", self),
        }
    }
}

/// What kind of variable a `Value` is.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VarKind {
    /// A pseudo-register, mapped to a machine register during coloring.
    Reg {
        /// Does this variable currently live in a spill slot?
        ///
        /// A spilled variable still takes part in coloring, but its colors
        /// come from the spill-slot pool.
        is_spilled: bool,
    },
    /// A named location on the local stack frame holding an aggregate.
    Mem {
        /// Aggregate size in bytes.
        size: u32,
    },
}

/// Data associated with a variable.
#[derive(Clone, Debug)]
pub struct VarData {
    /// Name of this variable within its function.
    ///
    /// Negative numbers are pre-SSA names: the same source-level variable
    /// across redefinitions. Non-negative numbers are SSA names with a
    /// unique definition. SSA construction replaces every negative name.
    pub number: i32,
    /// The type of the variable.
    pub ty: Type,
    /// Register or memory flavor.
    pub kind: VarKind,
    /// Allocation result.
    pub color: Color,
}

impl VarData {
    /// Is this variable in SSA form, i.e. defined exactly once?
    pub fn is_ssa(&self) -> bool {
        self.number >= 0
    }

    /// Index form of a pre-SSA name, for stack-array accesses.
    pub fn pre_ssa_index(&self) -> usize {
        debug_assert!(self.number < 0, "variable is already in SSA form");
        (-self.number) as usize
    }

    /// Is this a register variable (spilled or not)?
    pub fn is_reg(&self) -> bool {
        matches!(self.kind, VarKind::Reg { .. })
    }

    /// Is this a register variable currently in a spill slot?
    pub fn is_spilled(&self) -> bool {
        matches!(self.kind, VarKind::Reg { is_spilled: true })
    }

    /// Is this a register variable of class `rc`, regardless of spill state?
    pub fn is_reg_of_class(&self, rc: RegClass) -> bool {
        self.is_reg() && self.ty.reg_class() == Some(rc)
    }

    /// Is this a colorable register of class `rc`, i.e. not spilled and not
    /// excluded from allocation?
    pub fn colorable_reg(&self, rc: RegClass) -> bool {
        self.is_reg_of_class(rc) && !self.is_spilled() && self.color != Color::Dont
    }
}

/// A constant operand: a bit pattern interpreted through its type tag.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ConstData {
    /// The interpretation of the bits.
    pub ty: Type,
    /// The raw little-endian bit pattern, zero-extended to 64 bits.
    pub bits: u64,
}

impl ConstData {
    /// The bits truncated to the width of the type.
    pub fn truncated_bits(&self) -> u64 {
        match self.ty.bytes() {
            1 => self.bits & 0xff,
            2 => self.bits & 0xffff,
            4 => self.bits & 0xffff_ffff,
            _ => self.bits,
        }
    }
}

/// An instruction argument operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Operand {
    /// A variable.
    Value(Value),
    /// A pooled constant.
    Constant(Constant),
    /// A well-typed unknown value.
    ///
    /// Assigning `undef` is the way to keep a program strictly in SSA form
    /// when a variable has no dominating definition on some path.
    Undef(Type),
}

impl Operand {
    /// The variable, if this operand is one.
    pub fn value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The constant, if this operand is one.
    pub fn constant(self) -> Option<Constant> {
        match self {
            Self::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// Is this operand an undefined value?
    pub fn is_undef(self) -> bool {
        matches!(self, Self::Undef(_))
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Constant> for Operand {
    fn from(c: Constant) -> Self {
        Self::Constant(c)
    }
}

/// An argument slot: an operand plus an optional register constraint.
#[derive(Copy, Clone, Debug)]
pub struct Arg {
    /// The operand read by this slot.
    pub operand: Operand,
    /// If present, the physical register this argument must be assigned to.
    pub constraint: Option<RegUnit>,
}

impl Arg {
    /// An unconstrained argument.
    pub fn new(operand: impl Into<Operand>) -> Self {
        Self {
            operand: operand.into(),
            constraint: None,
        }
    }

    /// An argument pinned to a register unit.
    pub fn fixed(operand: impl Into<Operand>, ru: RegUnit) -> Self {
        Self {
            operand: operand.into(),
            constraint: Some(ru),
        }
    }
}

/// A result slot: the defined variable, the pre-SSA name it had when the
/// front end created it, and an optional register constraint.
#[derive(Copy, Clone, Debug)]
pub struct Res {
    /// The variable defined here.
    pub value: Value,
    /// The left-hand-side name before SSA renaming; liveness of phis and
    /// SSA repair key off it.
    pub old_number: i32,
    /// If present, the physical register this result must be assigned to.
    pub constraint: Option<RegUnit>,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{}", v),
            Self::Constant(c) => write!(f, "{}", c),
            Self::Undef(ty) => write!(f, "undef.{}", ty),
        }
    }
}
