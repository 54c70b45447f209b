//! Register targeting and the x86-64 allocation pipeline.
//!
//! Register targeting is the pre-coloring pass: it pins ABI operands,
//! fuses comparisons into the branch that consumes them, pins `mul`/`div`
//! to their architectural RAX/RDX homes (occupying RDX with a dummy so no
//! operand lands there), hoists constants the instructions cannot take,
//! and gives narrow int-to-float casts their widening scratch.
//!
//! The pipeline below it is strict:
//!
//! ```text
//! register targeting
//!   -> spill general purpose registers
//!   -> spill XMM registers
//!   -> copy insertion
//!   -> live range splitting
//!   -> color general purpose registers
//!   -> color XMM registers
//!   -> coalesce both classes
//!   -> color spill slots, bind stack variables
//!   -> arrange the stack layout
//! ```
//!
//! with def-use and liveness recomputed between passes.

use crate::context::Context;
use crate::ir::{Arg, CondCode, Function, Inst, InstructionData, Opcode, Operand, RegClass};
use crate::isa::x64::{abi, cast, QUADWORDS, RAX, RDX, X64};
use crate::isa::TargetIsa;
use crate::liveness::Liveness;
use crate::regalloc::{coalescing, coloring, copy_insertion, spilling, split};
use crate::result::CodegenResult;
use crate::ssa;
use log::debug;
use smallvec::SmallVec;

/// Run the full allocation pipeline on one function.
pub fn run_regalloc(isa: &X64, ctx: &mut Context) -> CodegenResult<()> {
    debug!("regalloc for {}", ctx.func.name);

    // Targeting reads def-use chains (branch fusion) and liveness (dead
    // divisor detection), so the analyses come first.
    ctx.recompute_analyses();
    register_targeting(ctx)?;
    ctx.recompute_analyses();

    let r_colors = isa.allocatable(RegClass::Gpr);
    let f_colors = isa.allocatable(RegClass::Xmm);

    spilling::Spiller::new(
        &mut ctx.func,
        &ctx.cfg,
        &ctx.domtree,
        &ctx.liveness,
        &ctx.defuse,
        r_colors.len(),
        RegClass::Gpr,
    )
    .run();
    ctx.recompute_analyses();

    spilling::Spiller::new(
        &mut ctx.func,
        &ctx.cfg,
        &ctx.domtree,
        &ctx.liveness,
        &ctx.defuse,
        f_colors.len(),
        RegClass::Xmm,
    )
    .run();
    ctx.recompute_analyses();

    copy_insertion::run(&mut ctx.func, &ctx.liveness);
    ctx.recompute_analyses();

    let mut records =
        split::split_live_ranges(&mut ctx.func, &mut ctx.cfg, &ctx.liveness, &ctx.defuse);
    // New blocks invalidate the dominator tree; reconstruction needs it
    // fresh.
    ctx.recompute_domtree();
    for vdu in records.values_mut() {
        ssa::reconstruct_ssa(&mut ctx.func, &ctx.cfg, &ctx.domtree, vdu);
    }
    ctx.recompute_analyses();

    coloring::color_registers(
        &mut ctx.func,
        &ctx.domtree,
        &ctx.liveness,
        RegClass::Gpr,
        r_colors,
    );
    coloring::color_registers(
        &mut ctx.func,
        &ctx.domtree,
        &ctx.liveness,
        RegClass::Xmm,
        f_colors,
    );

    coalescing::Coalescing::new(
        &mut ctx.func,
        &ctx.cfg,
        &ctx.domtree,
        &ctx.liveness,
        &ctx.defuse,
        RegClass::Gpr,
        r_colors,
    )
    .run();
    coalescing::Coalescing::new(
        &mut ctx.func,
        &ctx.cfg,
        &ctx.domtree,
        &ctx.liveness,
        &ctx.defuse,
        RegClass::Xmm,
        f_colors,
    )
    .run();

    // All scalar spills land in quadword slots; stack variables get their
    // own region.
    coloring::color_spill_slots(&mut ctx.func, &ctx.domtree, &ctx.liveness, QUADWORDS);
    coloring::color_stack_vars(&mut ctx.func, &ctx.domtree);

    ctx.func.stack_layout.arrange();
    Ok(())
}

/// The pre-color-assignment pass.
fn register_targeting(ctx: &mut Context) -> CodegenResult<()> {
    let insts: Vec<Inst> = ctx.func.layout.insts().collect();
    for inst in insts {
        match &ctx.func.insts[inst].data {
            InstructionData::Branch { .. } => fuse_branch(ctx, inst),
            InstructionData::SetParams => abi::constrain_params(&mut ctx.func, inst)?,
            InstructionData::SetResults => abi::constrain_results(&mut ctx.func, inst)?,
            InstructionData::Call { .. } => abi::constrain_call(&mut ctx.func, inst)?,
            InstructionData::Assign { op } => {
                let op = *op;
                target_assign(&mut ctx.func, &ctx.liveness, inst, op);
            }
            InstructionData::Store { .. } => {
                // The value operand must be a register.
                if ctx.func.insts[inst].args[0].operand.constant().is_some() {
                    hoist_constant(&mut ctx.func, inst, 0);
                }
            }
            InstructionData::Cast => cast::add_scratch(&mut ctx.func, inst),
            _ => {}
        }
    }
    Ok(())
}

/// When the branch condition is a comparison defined immediately before it
/// and used nowhere else, fuse: the branch carries the condition code and
/// the comparison result never materializes.
fn fuse_branch(ctx: &mut Context, inst: Inst) {
    let cond_var = match ctx.func.insts[inst].args[0].operand.value() {
        Some(v) => v,
        None => return, // constant condition; resolved at emission
    };
    let def = match ctx.defuse.def_point(cond_var) {
        Some(d) => d,
        None => return,
    };
    if ctx.func.layout.prev_inst(inst) != Some(def.inst) {
        return;
    }
    let cmp_op = match ctx.func.insts[def.inst].data {
        InstructionData::Assign { op } if op.is_comparison() => op,
        _ => return,
    };
    // A constant comparison should have been folded by the front end.
    if ctx.func.insts[def.inst]
        .args
        .iter()
        .all(|a| a.operand.constant().is_some())
    {
        return;
    }

    if ctx.defuse.uses(cond_var).len() == 1 {
        ctx.func.vars[cond_var].color = crate::ir::Color::Dont;
    }

    let arg_ty = ctx
        .func
        .operand_type(ctx.func.insts[def.inst].args[0].operand);
    let cc = condcode_for(cmp_op, arg_ty.is_signed_int());
    match &mut ctx.func.insts[inst].data {
        InstructionData::Branch { cond, .. } => *cond = Some(cc),
        _ => unreachable!(),
    }
    debug!("fused comparison into branch at {}", inst);
}

fn condcode_for(op: Opcode, signed: bool) -> CondCode {
    match (op, signed) {
        (Opcode::Eq, _) => CondCode::Eq,
        (Opcode::Ne, _) => CondCode::Ne,
        (Opcode::Lt, true) => CondCode::L,
        (Opcode::Gt, true) => CondCode::G,
        (Opcode::Le, true) => CondCode::Le,
        (Opcode::Ge, true) => CondCode::Ge,
        (Opcode::Lt, false) => CondCode::B,
        (Opcode::Gt, false) => CondCode::A,
        (Opcode::Le, false) => CondCode::Be,
        (Opcode::Ge, false) => CondCode::Ae,
        _ => panic!("not a comparison: {:?}", op),
    }
}

/// Pin `mul`/`div` and rewrite the divisions the hardware cannot encode.
fn target_assign(func: &mut Function, liveness: &Liveness, inst: Inst, op: Opcode) {
    if op.is_comparison() {
        return;
    }
    let ty = func.vars[func.insts[inst].ress[0].value].ty;

    if op == Opcode::Div {
        debug_assert_eq!(func.insts[inst].args.len(), 2, "div takes two arguments");
        // Forbidden shapes around a divisor that dies at the division:
        //   r = c / r_dead   -> hoist the constant
        //   r = r2 / r_dead  -> keep the divisor alive past the division
        let divisor_dead = match func.insts[inst].args[1].operand.value() {
            Some(v) => !liveness.inst_live_out(inst).contains(&v),
            None => false,
        };
        if divisor_dead {
            if func.insts[inst].args[0].operand.constant().is_some() {
                hoist_constant(func, inst, 0);
            } else if let Some(divisor) = func.insts[inst].args[1].operand.value() {
                let nop = func.create_inst(
                    InstructionData::Nop,
                    SmallVec::new(),
                    [Arg::new(divisor)].into_iter().collect(),
                );
                func.insert_inst_after(nop, inst);
            }
        }
    }

    if ty.is_real() {
        return;
    }

    if op == Opcode::Mul || op == Opcode::Div {
        if op == Opcode::Mul && ty.is_signed_int() {
            // Signed multiply has a two-address form; no pinning needed.
            return;
        }

        // The hardware takes the second operand from a register only.
        if func.insts[inst].args[1].operand.constant().is_some() {
            hoist_constant(func, inst, 1);
        }

        func.insts[inst].args[0].constraint = Some(RAX);
        func.insts[inst].ress[0].constraint = Some(RAX);

        // 8-bit operations work entirely in AX.
        if ty.bytes() != 1 {
            // RDX is clobbered in all cases.
            let hi = func.new_ssa_reg(ty);
            let mut res = func.make_res(hi);
            res.constraint = Some(RDX);
            func.insts[inst].ress.push(res);

            if op == Opcode::Div {
                // No input may sit in RDX: occupy it with a dummy undef.
                let dummy = func.new_ssa_reg(ty);
                let res = func.make_res(dummy);
                let init = func.create_inst(
                    InstructionData::Assign { op: Opcode::Mov },
                    [res].into_iter().collect(),
                    [Arg::new(Operand::Undef(ty))].into_iter().collect(),
                );
                func.insert_inst_before(init, inst);
                func.insts[inst].args.push(Arg::fixed(dummy, RDX));
            }
        }
    }
}

/// Replace constant argument `idx` with a fresh variable initialized just
/// before `inst`.
fn hoist_constant(func: &mut Function, inst: Inst, idx: usize) {
    let cst = func.insts[inst].args[idx]
        .operand
        .constant()
        .expect("hoist of a non-constant");
    let ty = func.constants[cst].ty;
    let tmp = func.new_ssa_reg(ty);
    let res = func.make_res(tmp);
    let copy = func.create_inst(
        InstructionData::Assign { op: Opcode::Mov },
        [res].into_iter().collect(),
        [Arg::new(Operand::Constant(cst))].into_iter().collect(),
    );
    func.insert_inst_before(copy, inst);
    func.insts[inst].args[idx].operand = tmp.into();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Type};

    #[test]
    fn div_is_pinned_with_rdx_dummy() {
        let mut func = Function::with_name("f", &[8, 16]);
        let a = func.new_reg(Type::Int32);
        let b = func.new_reg(Type::Int32);
        let q = func.new_reg(Type::Int32);

        func.emit_label();
        func.emit_set_params(&[a, b]);
        func.emit_assign(Opcode::Div, q, a, Some(Operand::Value(b)));
        func.emit_set_results(&[Operand::Value(q)]);
        func.emit_label();

        let mut ctx = Context::for_function(func);
        ctx.build_cfg();
        ctx.construct_ssa();
        ctx.recompute_analyses();
        register_targeting(&mut ctx).unwrap();
        // The rewrites added definitions; refresh before inspecting.
        ctx.recompute_analyses();

        let div = ctx
            .func
            .layout
            .insts()
            .find(|&i| matches!(ctx.func.insts[i].data, InstructionData::Assign { op: Opcode::Div }))
            .unwrap();
        let instr = &ctx.func.insts[div];
        assert_eq!(instr.args[0].constraint, Some(RAX));
        assert_eq!(instr.ress[0].constraint, Some(RAX));
        // The extra result occupies RDX...
        assert_eq!(instr.ress[1].constraint, Some(RDX));
        // ...and a dummy undef argument keeps inputs out of it.
        assert_eq!(instr.args[2].constraint, Some(RDX));
        let dummy = instr.args[2].operand.value().unwrap();
        let init = ctx.defuse.def_point(dummy);
        // The dummy is defined by the mov-undef right before the division.
        let init = init.unwrap();
        assert!(ctx.func.insts[init.inst].args[0].operand.is_undef());
    }

    #[test]
    fn params_and_results_pinned() {
        let mut func = Function::with_name("g", &[8, 16]);
        let a = func.new_reg(Type::Int32);
        let x = func.new_reg(Type::Real64);
        let r = func.new_reg(Type::Int32);

        func.emit_label();
        func.emit_set_params(&[a, x]);
        func.emit_assign(Opcode::Mov, r, a, None);
        func.emit_set_results(&[Operand::Value(r)]);
        func.emit_label();

        let mut ctx = Context::for_function(func);
        ctx.build_cfg();
        ctx.construct_ssa();
        ctx.recompute_analyses();
        register_targeting(&mut ctx).unwrap();

        let sp = ctx
            .func
            .layout
            .insts()
            .find(|&i| matches!(ctx.func.insts[i].data, InstructionData::SetParams))
            .unwrap();
        assert_eq!(ctx.func.insts[sp].ress[0].constraint, Some(super::super::RDI));
        assert_eq!(ctx.func.insts[sp].ress[1].constraint, Some(super::super::XMM0));

        let sr = ctx
            .func
            .layout
            .insts()
            .find(|&i| matches!(ctx.func.insts[i].data, InstructionData::SetResults))
            .unwrap();
        assert_eq!(ctx.func.insts[sr].args[0].constraint, Some(RAX));
    }
}
