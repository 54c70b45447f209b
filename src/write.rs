//! Converting functions to text, mostly for logs and test failures.

use crate::ir::{Function, Inst, InstructionData, Opcode, Operand};
use core::fmt::{self, Write};

/// Write a one-line rendering of `inst` into `w`.
pub fn write_inst(w: &mut dyn Write, func: &Function, inst: Inst) -> fmt::Result {
    let instr = &func.insts[inst];

    if !instr.ress.is_empty() {
        for (i, res) in instr.ress.iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            write!(w, "{}", res.value)?;
            if let Some(ru) = res.constraint {
                write!(w, "@r{}", ru)?;
            }
        }
        write!(w, " = ")?;
    }

    match &instr.data {
        InstructionData::Label => {
            return write!(w, "{}:", func.layout.inst_block(inst).map_or_else(
                || "label".to_string(),
                |b| b.to_string(),
            ));
        }
        InstructionData::Phi { sources } => {
            write!(w, "phi ")?;
            for (i, arg) in instr.args.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "[{}", DisplayOperand(func, arg.operand))?;
                match sources[i].expand() {
                    Some(b) => write!(w, ": {}]", b)?,
                    None => write!(w, ": ?]")?,
                }
            }
            return Ok(());
        }
        InstructionData::Assign { op } => write!(w, "{} ", opcode_name(*op))?,
        InstructionData::Goto { target } => {
            return write!(
                w,
                "goto {}",
                func.layout
                    .inst_block(*target)
                    .map_or_else(|| format!("{}", target), |b| b.to_string())
            );
        }
        InstructionData::Branch {
            on_true, on_false, ..
        } => {
            write!(w, "br ")?;
            write!(w, "{} ", DisplayOperand(func, instr.args[0].operand))?;
            let t = func
                .layout
                .inst_block(*on_true)
                .map_or_else(|| format!("{}", on_true), |b| b.to_string());
            let f = func
                .layout
                .inst_block(*on_false)
                .map_or_else(|| format!("{}", on_false), |b| b.to_string());
            return write!(w, "{}, {}", t, f);
        }
        InstructionData::Spill => write!(w, "spill ")?,
        InstructionData::Reload => write!(w, "reload ")?,
        InstructionData::Load { offset } => write!(w, "load+{} ", offset)?,
        InstructionData::Store { offset } => write!(w, "store+{} ", offset)?,
        InstructionData::Cast => write!(w, "cast ")?,
        InstructionData::Call { symbol, .. } => write!(w, "call {} ", symbol)?,
        InstructionData::SetParams => write!(w, "setparams")?,
        InstructionData::SetResults => write!(w, "setresults ")?,
        InstructionData::Nop => write!(w, "nop ")?,
    }

    for (i, arg) in instr.args.iter().enumerate() {
        if i > 0 {
            write!(w, ", ")?;
        }
        write!(w, "{}", DisplayOperand(func, arg.operand))?;
        if let Some(ru) = arg.constraint {
            write!(w, "@r{}", ru)?;
        }
    }
    Ok(())
}

fn opcode_name(op: Opcode) -> &'static str {
    match op {
        Opcode::Mov => "mov",
        Opcode::Add => "add",
        Opcode::Sub => "sub",
        Opcode::Mul => "mul",
        Opcode::Div => "div",
        Opcode::And => "and",
        Opcode::Or => "or",
        Opcode::Xor => "xor",
        Opcode::Not => "not",
        Opcode::Neg => "neg",
        Opcode::Eq => "eq",
        Opcode::Ne => "ne",
        Opcode::Lt => "lt",
        Opcode::Le => "le",
        Opcode::Gt => "gt",
        Opcode::Ge => "ge",
    }
}

struct DisplayOperand<'a>(&'a Function, Operand);

impl fmt::Display for DisplayOperand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.1 {
            Operand::Value(v) => {
                if self.0.vars[v].is_spilled() {
                    write!(f, "@{}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Operand::Constant(c) => {
                let data = &self.0.constants[c];
                write!(f, "{}#{:#x}", data.ty, data.truncated_bits())
            }
            Operand::Undef(ty) => write!(f, "undef.{}", ty),
        }
    }
}

impl fmt::Display for Function {
    /// Multi-line rendering of the whole instruction stream.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "function {} {{", self.name)?;
        for inst in self.layout.insts() {
            let mut line = String::new();
            write_inst(&mut line, self, inst).unwrap();
            if self.insts[inst].is_label() {
                writeln!(f, "{}", line)?;
            } else {
                writeln!(f, "    {}", line)?;
            }
        }
        writeln!(f, "}}")
    }
}
