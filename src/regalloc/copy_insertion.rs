//! Copy insertion for constrained instructions.
//!
//! Register constraints can be mutually unsatisfiable as written: a
//! constant pinned to a register has no variable to color, the same
//! variable may sit in two argument slots with different constraints, and
//! an argument that lives through the instruction may be pinned to the same
//! register as a result. A copy to a fresh name linearizes each of these
//! before coloring.

use crate::ir::{Arg, Function, Inst, InstructionData, Opcode, Operand};
use crate::liveness::Liveness;
use log::debug;
use smallvec::SmallVec;

/// Insert the copies required by every constrained instruction.
pub fn run(func: &mut Function, liveness: &Liveness) {
    let insts: Vec<Inst> = func.layout.insts().collect();
    for inst in insts {
        if func.insts[inst].is_constrained() {
            insert_if_necessary(func, liveness, inst);
        }
    }
}

fn insert_if_necessary(func: &mut Function, liveness: &Liveness, inst: Inst) {
    let nargs = func.insts[inst].args.len();
    for i in 0..nargs {
        if func.insts[inst].args[i].constraint.is_none() {
            continue;
        }

        // A constrained constant is materialized into a fresh variable.
        if let Some(cst) = func.insts[inst].args[i].operand.constant() {
            let ty = func.constants[cst].ty;
            let tmp = func.new_ssa_reg(ty);
            let res = func.make_res(tmp);
            let copy = func.create_inst(
                InstructionData::Assign { op: Opcode::Mov },
                [res].into_iter().collect(),
                [Arg::new(Operand::Constant(cst))].into_iter().collect(),
            );
            func.insert_inst_before(copy, inst);
            func.insts[inst].args[i].operand = tmp.into();
            continue;
        }

        let reg = match func.insts[inst].args[i].operand.value() {
            Some(v) if func.vars[v].is_reg() => v,
            _ => continue,
        };

        // The same variable in another slot with its own constraint cannot
        // satisfy both; copy this slot.
        let mut same_arg_twice = false;
        for j in i + 1..nargs {
            if func.insts[inst].args[j].constraint.is_none() {
                continue;
            }
            if func.insts[inst].args[j].operand.value() == Some(reg) {
                insert_copy(func, i, inst);
                same_arg_twice = true;
            }
        }
        if same_arg_twice {
            // The copied slot no longer aliases; nothing below applies.
            break;
        }

        // An argument that lives through the instruction while a result is
        // pinned to the same register needs its own name.
        if !liveness.lives_through(inst, reg) {
            continue;
        }
        let constraint = func.insts[inst].args[i].constraint;
        let collides = func.insts[inst]
            .ress
            .iter()
            .any(|r| r.constraint.is_some() && r.constraint == constraint);
        if collides {
            insert_copy(func, i, inst);
        }
    }
}

/// Copy argument slot `idx` of `inst` into a fresh SSA name.
fn insert_copy(func: &mut Function, idx: usize, inst: Inst) {
    let reg = func.insts[inst].args[idx]
        .operand
        .value()
        .expect("copy of a non-variable");
    let fresh = func.clone_new_ssa(reg);
    debug!("copy {} -> {} before constrained instruction", reg, fresh);

    let res = func.make_res(fresh);
    let copy = func.create_inst(
        InstructionData::Assign { op: Opcode::Mov },
        [res].into_iter().collect(),
        [Arg::new(reg)].into_iter().collect::<SmallVec<[Arg; 2]>>(),
    );
    func.insert_inst_before(copy, inst);
    func.insts[inst].args[idx].operand = fresh.into();
}
