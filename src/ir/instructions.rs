//! Instruction formats.
//!
//! Instructions form a closed set of variants, so they are a tagged union
//! with exhaustive matching rather than a class hierarchy. Every
//! instruction owns an ordered list of results and an ordered list of
//! arguments; the variant payload carries whatever else the format needs.

use crate::entity::packed_option::PackedOption;
use crate::ir::entities::{Block, Inst, Value};
use crate::ir::operands::{Arg, Operand, Res};
use smallvec::SmallVec;

/// Operation selector for `Assign` instructions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    /// Simple move, `r = a`.
    Mov,
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// Bitwise not.
    Not,
    /// Unary minus.
    Neg,
    /// Equality comparison, boolean result.
    Eq,
    /// Inequality comparison.
    Ne,
    /// Less-than comparison.
    Lt,
    /// Less-or-equal comparison.
    Le,
    /// Greater-than comparison.
    Gt,
    /// Greater-or-equal comparison.
    Ge,
}

impl Opcode {
    /// Does this opcode produce a boolean from two ordered operands?
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// May the two arguments be exchanged without changing the result?
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor | Self::Eq | Self::Ne
        )
    }

    /// Is this a one-argument operation?
    pub fn is_unary(self) -> bool {
        matches!(self, Self::Mov | Self::Not | Self::Neg)
    }
}

/// Back-end condition codes attached to branches when an immediately
/// preceding comparison has been fused into the jump.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CondCode {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Signed less.
    L,
    /// Signed less or equal.
    Le,
    /// Signed greater.
    G,
    /// Signed greater or equal.
    Ge,
    /// Unsigned below.
    B,
    /// Unsigned below or equal.
    Be,
    /// Unsigned above.
    A,
    /// Unsigned above or equal.
    Ae,
}

/// The variant payload of an instruction.
#[derive(Clone, Debug)]
pub enum InstructionData {
    /// Basic-block boundary marker.
    Label,
    /// `r = phi(a1, ..., ak)`; `sources[i]` is the predecessor block the
    /// i-th argument flows in from.
    Phi {
        /// Source block per argument slot, filled during SSA renaming.
        sources: SmallVec<[PackedOption<Block>; 2]>,
    },
    /// Arithmetic, comparison, unary operation or plain move.
    Assign {
        /// The operation.
        op: Opcode,
    },
    /// Unconditional jump. The target is the label instruction that opens
    /// the destination block.
    Goto {
        /// Target label.
        target: Inst,
    },
    /// Conditional branch on a boolean argument.
    Branch {
        /// Condition code set by register targeting when the defining
        /// comparison can feed the jump directly.
        cond: Option<CondCode>,
        /// Label taken when the condition holds.
        on_true: Inst,
        /// Label taken otherwise.
        on_false: Inst,
    },
    /// Materialize a variable into a spill slot. The result is a spilled
    /// register variable, the argument the variable being saved.
    Spill,
    /// Load a spilled variable back into a register.
    Reload,
    /// Memory read from `base [+ index] + offset`.
    Load {
        /// Compile-time byte offset.
        offset: i32,
    },
    /// Memory write of `args[0]` to `base [+ index] + offset`.
    Store {
        /// Compile-time byte offset.
        offset: i32,
    },
    /// Type conversion.
    Cast,
    /// ABI call to a symbol.
    Call {
        /// The called symbol.
        symbol: String,
        /// C-style variadic call?
        vararg: bool,
    },
    /// ABI projection defining the function's parameters at entry.
    SetParams,
    /// ABI projection consuming the function's results at exit.
    SetResults,
    /// Artificial use that extends a live range; emits nothing.
    Nop,
}

/// An instruction: variant data plus its result and argument slots.
#[derive(Clone, Debug)]
pub struct Instruction {
    /// Variant payload.
    pub data: InstructionData,
    /// Ordered results, each with the pre-SSA name and optional constraint.
    pub ress: SmallVec<[Res; 2]>,
    /// Ordered arguments, each with an optional constraint.
    pub args: SmallVec<[Arg; 2]>,
}

impl Instruction {
    /// Create an instruction with empty operand lists.
    pub fn new(data: InstructionData) -> Self {
        Self {
            data,
            ress: SmallVec::new(),
            args: SmallVec::new(),
        }
    }

    /// Is this a label?
    pub fn is_label(&self) -> bool {
        matches!(self.data, InstructionData::Label)
    }

    /// Is this a phi?
    pub fn is_phi(&self) -> bool {
        matches!(self.data, InstructionData::Phi { .. })
    }

    /// Is this a goto or branch?
    pub fn is_jump(&self) -> bool {
        matches!(
            self.data,
            InstructionData::Goto { .. } | InstructionData::Branch { .. }
        )
    }

    /// The jump target labels, empty for non-jumps.
    pub fn jump_targets(&self) -> SmallVec<[Inst; 2]> {
        match self.data {
            InstructionData::Goto { target } => [target].into_iter().collect(),
            InstructionData::Branch {
                on_true, on_false, ..
            } => [on_true, on_false].into_iter().collect(),
            _ => SmallVec::new(),
        }
    }

    /// Replace jump target `old` with `new`. No-op for other labels.
    pub fn retarget_jump(&mut self, old: Inst, new: Inst) {
        match &mut self.data {
            InstructionData::Goto { target } => {
                if *target == old {
                    *target = new;
                }
            }
            InstructionData::Branch {
                on_true, on_false, ..
            } => {
                if *on_true == old {
                    *on_true = new;
                }
                if *on_false == old {
                    *on_false = new;
                }
            }
            _ => {}
        }
    }

    /// Does any result or argument carry a register constraint?
    pub fn is_constrained(&self) -> bool {
        self.ress.iter().any(|r| r.constraint.is_some())
            || self.args.iter().any(|a| a.constraint.is_some())
    }

    /// Is `v` read by this instruction, i.e. does it occur in an argument?
    pub fn uses_value(&self, v: Value) -> bool {
        self.args.iter().any(|a| a.operand == Operand::Value(v))
    }

    /// Is `v` defined by this instruction?
    pub fn defines_value(&self, v: Value) -> bool {
        self.ress.iter().any(|r| r.value == v)
    }

    /// The phi result. Panics when applied to a non-phi.
    pub fn phi_result(&self) -> Value {
        debug_assert!(self.is_phi(), "phi_result on a non-phi");
        self.ress[0].value
    }

    /// The source block recorded for phi argument `i`.
    pub fn phi_source(&self, i: usize) -> Option<Block> {
        match &self.data {
            InstructionData::Phi { sources } => sources[i].expand(),
            _ => panic!("phi_source on a non-phi"),
        }
    }
}
