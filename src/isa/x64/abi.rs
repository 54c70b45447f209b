//! System V AMD64 constraint assignment.
//!
//! Parameters, results and call operands are pinned to their ABI registers
//! by rewriting the constraint slots of the `SetParams`, `SetResults` and
//! `Call` instructions. Calls additionally declare dummy results pinned to
//! the caller-saved registers, so the constrained coloring path keeps
//! live-through values in callee-saved registers.

use crate::ir::{Function, Inst, RegClass, Type};
use crate::isa::x64::{FP_ARGS, INT_ARGS, INT_CLOBBERS, RAX, RDX, XMM0, XMM1};
use crate::result::{CodegenError, CodegenResult};

/// Pin the results of `SetParams` to the argument registers.
pub fn constrain_params(func: &mut Function, inst: Inst) -> CodegenResult<()> {
    let mut next_int = 0;
    let mut next_fp = 0;
    for i in 0..func.insts[inst].ress.len() {
        let v = func.insts[inst].ress[i].value;
        let ru = match func.vars[v].ty.reg_class() {
            Some(RegClass::Gpr) => {
                let slot = INT_ARGS.get(next_int).copied();
                next_int += 1;
                slot
            }
            Some(RegClass::Xmm) => {
                let slot = FP_ARGS.get(next_fp).copied();
                next_fp += 1;
                slot
            }
            None => continue, // aggregates are passed on the stack by the front end
        };
        match ru {
            Some(ru) => func.insts[inst].ress[i].constraint = Some(ru),
            None => {
                return Err(CodegenError::ImplLimitExceeded(
                    "parameters beyond the register file".to_string(),
                ))
            }
        }
    }
    Ok(())
}

/// Pin the arguments of `SetResults` to the return registers.
pub fn constrain_results(func: &mut Function, inst: Inst) -> CodegenResult<()> {
    let mut next_int = 0;
    let mut next_fp = 0;
    for i in 0..func.insts[inst].args.len() {
        let ty = func.operand_type(func.insts[inst].args[i].operand);
        let ru = match ty.reg_class() {
            Some(RegClass::Gpr) => {
                let slot = [RAX, RDX].get(next_int).copied();
                next_int += 1;
                slot
            }
            Some(RegClass::Xmm) => {
                let slot = [XMM0, XMM1].get(next_fp).copied();
                next_fp += 1;
                slot
            }
            None => continue,
        };
        match ru {
            Some(ru) => func.insts[inst].args[i].constraint = Some(ru),
            None => {
                return Err(CodegenError::ImplLimitExceeded(
                    "results beyond the return registers".to_string(),
                ))
            }
        }
    }
    Ok(())
}

/// Pin a call's operands to the ABI registers and declare its clobbers.
pub fn constrain_call(func: &mut Function, inst: Inst) -> CodegenResult<()> {
    let mut next_int = 0;
    let mut next_fp = 0;
    for i in 0..func.insts[inst].args.len() {
        let ty = func.operand_type(func.insts[inst].args[i].operand);
        let ru = match ty.reg_class() {
            Some(RegClass::Gpr) => {
                let slot = INT_ARGS.get(next_int).copied();
                next_int += 1;
                slot
            }
            Some(RegClass::Xmm) => {
                let slot = FP_ARGS.get(next_fp).copied();
                next_fp += 1;
                slot
            }
            None => continue,
        };
        match ru {
            Some(ru) => func.insts[inst].args[i].constraint = Some(ru),
            None => {
                return Err(CodegenError::ImplLimitExceeded(
                    "call arguments beyond the register file".to_string(),
                ))
            }
        }
    }

    let mut next_int = 0;
    let mut next_fp = 0;
    for i in 0..func.insts[inst].ress.len() {
        let v = func.insts[inst].ress[i].value;
        let ru = match func.vars[v].ty.reg_class() {
            Some(RegClass::Gpr) => {
                let slot = [RAX, RDX].get(next_int).copied();
                next_int += 1;
                slot
            }
            Some(RegClass::Xmm) => {
                let slot = [XMM0, XMM1].get(next_fp).copied();
                next_fp += 1;
                slot
            }
            None => continue,
        };
        match ru {
            Some(ru) => func.insts[inst].ress[i].constraint = Some(ru),
            None => {
                return Err(CodegenError::ImplLimitExceeded(
                    "call results beyond the return registers".to_string(),
                ))
            }
        }
    }

    // Caller-saved registers not already speaking for a result die at the
    // call: pin dead dummy results to them.
    let taken: Vec<_> = func.insts[inst]
        .ress
        .iter()
        .filter_map(|r| r.constraint)
        .collect();
    for ru in INT_CLOBBERS {
        if !taken.contains(&ru) {
            let dummy = func.new_ssa_reg(Type::Int64);
            let mut res = func.make_res(dummy);
            res.constraint = Some(ru);
            func.insts[inst].ress.push(res);
        }
    }
    for ru in XMM0..XMM0 + 16 {
        if !taken.contains(&ru) {
            let dummy = func.new_ssa_reg(Type::Real64);
            let mut res = func.make_res(dummy);
            res.constraint = Some(ru);
            func.insts[inst].ress.push(res);
        }
    }
    Ok(())
}
