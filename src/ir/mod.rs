//! Representation of the intermediate language.

pub mod entities;
pub mod function;
pub mod instructions;
pub mod layout;
pub mod operands;
pub mod stackslot;
pub mod types;

pub use self::entities::{Block, Constant, Inst, ProgramPoint, Value};
pub use self::function::Function;
pub use self::instructions::{CondCode, Instruction, InstructionData, Opcode};
pub use self::layout::{BlockData, Layout};
pub use self::operands::{Arg, Color, ConstData, Operand, RegUnit, Res, VarData, VarKind};
pub use self::stackslot::{aligned_offset, next_power_of_two, StackLayout};
pub use self::types::{RegClass, Type};
