//! Assembly emission: AT&T-syntax x86-64 text for one allocated function.
//!
//! By the time emission runs, every variable has a register or slot color,
//! phis are pure bookkeeping (their moves are generated at the edges), and
//! the instruction stream walks straight through. Selection is a match on
//! (opcode, operand kinds, register aliasing): the same case split a
//! pattern matcher would produce, written out by hand.

use crate::constant_pool::ConstantPool;
use crate::context::Context;
use crate::defuse::DefUse;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{
    Block, Color, CondCode, Function, Inst, InstructionData, Opcode, Operand, RegClass, RegUnit,
    Type, Value,
};
use crate::isa::x64::{cast, X64};
use crate::isa::x64::{CALLEE_SAVED, OCTWORDS, QUADWORDS, RAX, XMM0, XMM1};
use crate::isa::TargetIsa;
use crate::liveness::Liveness;
use crate::regalloc::phi_lowering::{lower_phi_edge, MoveSink, TransferKind};
use crate::regalloc::RegisterSet;
use crate::result::CodegenResult;
use std::fmt::Write;

/// Emit the `_start` routine: align the stack, call `main`, and exit with
/// its return value.
pub fn emit_start(out: &mut String) {
    let _ = write!(
        out,
        "\t.type\t_start,@function\n\
         \t.globl\t_start\n\
         _start:\n\
         \t.cfi_startproc\n\
         \tandq\t$-16, %rsp\n\
         \tcall\tmain\n\
         \tmovq\t%rax, %rdi\n\
         \tmovq\t$0x3c, %rax\n\
         \tsyscall\n\
         \thlt\n\
         \t.cfi_endproc\n\n"
    );
}

/// Emit one function.
pub fn emit_function(
    isa: &X64,
    ctx: &mut Context,
    pool: &mut ConstantPool,
    out: &mut String,
    seq: u32,
) -> CodegenResult<()> {
    let mut em = FuncEmitter {
        isa,
        func: &ctx.func,
        cfg: &ctx.cfg,
        liveness: &ctx.liveness,
        defuse: &ctx.defuse,
        pool,
        out,
        seq,
    };
    em.run();
    Ok(())
}

struct FuncEmitter<'a> {
    isa: &'a X64,
    func: &'a Function,
    cfg: &'a ControlFlowGraph,
    liveness: &'a Liveness,
    defuse: &'a DefUse,
    pool: &'a mut ConstantPool,
    out: &'a mut String,
    seq: u32,
}

impl FuncEmitter<'_> {
    fn run(&mut self) {
        let name = self.func.name.clone();
        let pushes: Vec<RegUnit> = CALLEE_SAVED
            .iter()
            .copied()
            .filter(|ru| self.func.used_colors.contains(ru))
            .collect();

        // Pad the frame so RSP is 16-byte aligned at every call site:
        // return address and saved RBP cancel out, leaving the frame and
        // the callee-save pushes.
        let mut stack_size = self.func.stack_layout.size;
        let rem = (stack_size + 8 * pushes.len() as u32) % 16;
        if rem != 0 {
            stack_size += 16 - rem;
        }

        let _ = writeln!(self.out, "\t.globl\t{}", name);
        let _ = writeln!(self.out, "\t.type\t{}, @function", name);
        let _ = writeln!(self.out, "{}:", name);
        let _ = writeln!(self.out, ".LFB{}:", self.seq);
        let _ = writeln!(self.out, "\tpushq\t%rbp");
        let _ = writeln!(self.out, "\tmovq\t%rsp, %rbp");
        if stack_size != 0 {
            let _ = writeln!(self.out, "\tsubq\t${}, %rsp", stack_size);
        }
        for &ru in &pushes {
            let _ = writeln!(self.out, "\tpushq\t%{}", self.isa.reg_name(ru, Type::Int64));
        }

        let insts: Vec<Inst> = self.func.layout.insts().collect();
        let mut current: Option<Block> = None;
        let mut phis_emitted = false;

        for inst in insts {
            let instr = &self.func.insts[inst];
            match &instr.data {
                InstructionData::Label => {
                    let block = self.func.layout.inst_block(inst).expect("untagged label");
                    if let Some(old) = current {
                        // Falling through into a phi block: the moves run
                        // before the label so jumps from elsewhere skip
                        // them.
                        if !phis_emitted && self.cfg.succs(old).contains(&block) {
                            self.emit_phi_moves(old, block);
                        }
                    }
                    let _ = writeln!(self.out, "{}:", self.label_name(block));
                    current = Some(block);
                    phis_emitted = false;
                }
                InstructionData::Goto { .. } | InstructionData::Branch { .. } => {
                    let block = current.expect("jump before the first label");
                    if self.cfg.num_succs(block) == 1 {
                        self.emit_phi_moves(block, self.cfg.succs(block)[0]);
                        phis_emitted = true;
                    }
                    self.emit_inst(inst);
                }
                InstructionData::Phi { .. }
                | InstructionData::SetParams
                | InstructionData::SetResults
                | InstructionData::Nop => {}
                InstructionData::Assign { op: Opcode::Mov }
                    if instr.args[0].operand.is_undef() => {} // undef defs emit nothing
                _ => self.emit_inst(inst),
            }
        }

        for &ru in pushes.iter().rev() {
            let _ = writeln!(self.out, "\tpopq\t%{}", self.isa.reg_name(ru, Type::Int64));
        }
        if stack_size != 0 {
            let _ = writeln!(self.out, "\taddq\t${}, %rsp", stack_size);
        }
        let _ = writeln!(self.out, "\tpopq\t%rbp");
        let _ = writeln!(self.out, "\tret");
        let _ = writeln!(self.out, ".LFE{}:", self.seq);
        let _ = writeln!(self.out, "\t.size\t{}, .-{}\n", name, name);
    }

    /*
     * Operand printing.
     */

    fn label_name(&self, block: Block) -> String {
        use crate::entity::EntityRef;
        format!(".L{}_{}", self.seq, block.index())
    }

    fn label_of(&self, target: Inst) -> String {
        let block = self
            .func
            .layout
            .inst_block(target)
            .expect("jump target without block");
        self.label_name(block)
    }

    fn reg_str(&self, v: Value) -> String {
        let data = &self.func.vars[v];
        match data.color {
            Color::Reg(ru) => format!("%{}", self.isa.reg_name(ru, data.ty)),
            Color::Slot(s) => self.slot_str(s),
            c => panic!("{} reached emission uncolored: {:?}", v, c),
        }
    }

    fn slot_str(&self, slot: u32) -> String {
        format!(
            "-{}(%rbp)",
            self.func.stack_layout.slot_neg_offset(QUADWORDS, slot)
        )
    }

    /// An argument operand as an instruction operand string; float
    /// constants come from the pool, integer constants are immediates.
    fn operand_str(&mut self, op: Operand) -> String {
        match op {
            Operand::Value(v) => self.reg_str(v),
            Operand::Constant(c) => {
                let data = self.func.constants[c];
                if data.ty.is_real() {
                    format!(".LC{}", self.pool.intern_typed(data.ty, data.bits))
                } else {
                    format!("${}", data.truncated_bits())
                }
            }
            Operand::Undef(_) => panic!("undef operand reached emission"),
        }
    }

    fn color_of(&self, op: Operand) -> Option<Color> {
        op.value().map(|v| self.func.vars[v].color)
    }

    /*
     * Instruction dispatch.
     */

    fn emit_inst(&mut self, inst: Inst) {
        let instr = &self.func.insts[inst];
        match &instr.data {
            InstructionData::Assign { op } => self.emit_assign(inst, *op),
            InstructionData::Spill => {
                let src = instr.args[0].operand;
                let dst = instr.ress[0].value;
                let ty = self.func.vars[dst].ty;
                let s = self.operand_str(src);
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("mov", ty), s, d);
            }
            InstructionData::Reload => {
                let src = instr.args[0].operand;
                let dst = instr.ress[0].value;
                let ty = self.func.vars[dst].ty;
                let s = self.operand_str(src);
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("mov", ty), s, d);
            }
            InstructionData::Load { offset } => {
                let offset = *offset;
                let dst = instr.ress[0].value;
                let ty = self.func.vars[dst].ty;
                let addr = self.addr_str(inst, 0, 1, offset);
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("mov", ty), addr, d);
            }
            InstructionData::Store { offset } => {
                let offset = *offset;
                let value = instr.args[0].operand;
                let ty = self.func.operand_type(value);
                let addr = self.addr_str(inst, 1, 2, offset);
                let s = self.operand_str(value);
                let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("mov", ty), s, addr);
            }
            InstructionData::Cast => self.emit_cast(inst),
            InstructionData::Call { symbol, vararg } => {
                if *vararg {
                    // Variadic System V calls pass the XMM argument count
                    // in %al.
                    let nfp = instr
                        .args
                        .iter()
                        .filter(|a| self.func.operand_type(a.operand).is_real())
                        .count();
                    let _ = writeln!(self.out, "\tmovb\t${}, %al", nfp);
                }
                let _ = writeln!(self.out, "\tcall\t{}", symbol);
            }
            InstructionData::Goto { target } => {
                let l = self.label_of(*target);
                let _ = writeln!(self.out, "\tjmp\t{}", l);
            }
            InstructionData::Branch {
                cond,
                on_true,
                on_false,
            } => self.emit_branch(inst, *cond, *on_true, *on_false),
            InstructionData::Label
            | InstructionData::Phi { .. }
            | InstructionData::SetParams
            | InstructionData::SetResults
            | InstructionData::Nop => unreachable!("handled by the walk"),
        }
    }

    /// `base [+ index] + offset` addressing from the argument slots
    /// starting at `base_idx`.
    fn addr_str(&self, inst: Inst, base_idx: usize, index_idx: usize, offset: i32) -> String {
        let instr = &self.func.insts[inst];
        let base = instr.args[base_idx]
            .operand
            .value()
            .expect("memory access through a non-variable");
        let index = instr
            .args
            .get(index_idx)
            .and_then(|a| a.operand.value())
            .map(|v| self.reg_str(v));

        if matches!(self.func.vars[base].kind, crate::ir::VarKind::Mem { .. }) {
            let neg = self
                .func
                .stack_layout
                .mem_neg_offset(self.func.vars[base].color.unwrap_slot());
            let disp = offset as i64 - neg as i64;
            match index {
                Some(ix) => format!("{}(%rbp, {})", disp, ix),
                None => format!("{}(%rbp)", disp),
            }
        } else {
            let b = self.reg_str(base);
            let disp = if offset != 0 {
                format!("{}", offset)
            } else {
                String::new()
            };
            match index {
                Some(ix) => format!("{}({}, {})", disp, b, ix),
                None => format!("{}({})", disp, b),
            }
        }
    }

    /*
     * Assign selection.
     */

    fn emit_assign(&mut self, inst: Inst, op: Opcode) {
        let instr = &self.func.insts[inst];
        let dst = instr.ress[0].value;

        match op {
            Opcode::Mov => {
                let src = instr.args[0].operand;
                if self.color_of(src) == Some(self.func.vars[dst].color) {
                    return; // self-move
                }
                let ty = self.func.vars[dst].ty;
                let s = self.operand_str(src);
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("mov", ty), s, d);
            }
            op if op.is_comparison() => self.emit_comparison(inst, op),
            Opcode::Not => {
                let ty = self.func.vars[dst].ty;
                self.move_into_dst(inst, dst);
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t{}", mnem("not", ty), d);
            }
            Opcode::Neg => self.emit_neg(inst, dst),
            Opcode::Div if !self.func.vars[dst].ty.is_real() => self.emit_int_div(inst, dst),
            Opcode::Mul if !self.func.vars[dst].ty.is_signed_int()
                && !self.func.vars[dst].ty.is_real() =>
            {
                // Unsigned multiply: RAX/RDX pinned, one explicit operand.
                let ty = self.func.vars[dst].ty;
                let b = self.operand_str(instr.args[1].operand);
                let _ = writeln!(self.out, "\t{}\t{}", mnem("mul", ty), b);
            }
            _ => self.emit_two_address(inst, op, dst),
        }
    }

    /// Copy the first argument into the destination unless it is there
    /// already.
    fn move_into_dst(&mut self, inst: Inst, dst: Value) {
        let src = self.func.insts[inst].args[0].operand;
        if self.color_of(src) == Some(self.func.vars[dst].color) {
            return;
        }
        let ty = self.func.vars[dst].ty;
        let s = self.operand_str(src);
        let d = self.reg_str(dst);
        let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("mov", ty), s, d);
    }

    fn emit_neg(&mut self, inst: Inst, dst: Value) {
        let ty = self.func.vars[dst].ty;
        let src = self.func.insts[inst].args[0].operand;

        // Constant: negate at compile time.
        if let Some(c) = src.constant() {
            let data = self.func.constants[c];
            let folded = fold_unary_neg(ty, data.bits);
            if ty.is_real() {
                let label = self.pool.intern_typed(ty, folded);
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t.LC{}, {}", mnem("mov", ty), label, d);
            } else {
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t${}, {}", mnem("mov", ty), folded, d);
            }
            return;
        }

        self.move_into_dst(inst, dst);
        let d = self.reg_str(dst);
        // Sign-bit flip against the mask of the operand width; the wide
        // masks live in the constant block.
        match ty {
            Type::Real32 => {
                let _ = writeln!(self.out, "\txorps\t.LCS32, {}", d);
            }
            Type::Real64 => {
                let _ = writeln!(self.out, "\txorpd\t.LCS64, {}", d);
            }
            _ => match ty.bytes() {
                1 => {
                    let _ = writeln!(self.out, "\txorb\t$0x80, {}", d);
                }
                2 => {
                    let _ = writeln!(self.out, "\txorw\t$0x8000, {}", d);
                }
                4 => {
                    let _ = writeln!(self.out, "\txorl\t$0x80000000, {}", d);
                }
                _ => {
                    let _ = writeln!(self.out, "\txorq\t.LCS64, {}", d);
                }
            },
        }
    }

    fn emit_comparison(&mut self, inst: Inst, op: Opcode) {
        let instr = &self.func.insts[inst];
        let dst = instr.ress[0].value;
        let a = instr.args[0].operand;
        let b = instr.args[1].operand;

        // Two constants fold to a boolean immediate.
        if let (Some(ca), Some(cb)) = (a.constant(), b.constant()) {
            let da = self.func.constants[ca];
            let db = self.func.constants[cb];
            let bit = fold_comparison(op, da.ty, da.bits, db.bits);
            let d = self.reg_str(dst);
            let _ = writeln!(self.out, "\tmovb\t${}, {}", bit, d);
            return;
        }

        // `cmp` wants a register in the first AT&T slot; swap and reverse
        // the condition when only the left operand is a constant.
        let (x, y, op) = if a.constant().is_some() {
            (b, a, reverse_comparison(op))
        } else {
            (a, b, op)
        };
        let ty = self.func.operand_type(x);
        let xs = self.operand_str(x);
        let ys = self.operand_str(y);
        if ty.is_real() {
            let cmp = if ty == Type::Real32 { "ucomiss" } else { "ucomisd" };
            let _ = writeln!(self.out, "\t{}\t{}, {}", cmp, ys, xs);
        } else {
            let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("cmp", ty), ys, xs);
        }

        // Fused into the following branch: the flags are the result.
        if self.func.vars[dst].color == Color::Dont {
            return;
        }
        let cc = cc_str(op, ty.is_signed_int() && !ty.is_real(), false);
        let d8 = match self.func.vars[dst].color {
            Color::Reg(ru) => format!("%{}", self.isa.reg_name(ru, Type::Bool)),
            c => panic!("comparison result uncolored: {:?}", c),
        };
        let _ = writeln!(self.out, "\tset{}\t{}", cc, d8);
    }

    fn emit_int_div(&mut self, inst: Inst, dst: Value) {
        let instr = &self.func.insts[inst];
        let ty = self.func.vars[dst].ty;
        let divisor = self.operand_str(instr.args[1].operand);

        if ty.is_signed_int() {
            // Sign-extend the dividend into RDX (or AH for bytes).
            let ext = match ty.bytes() {
                1 => "cbtw",
                2 => "cwtd",
                4 => "cltd",
                _ => "cqto",
            };
            let _ = writeln!(self.out, "\t{}", ext);
            let _ = writeln!(self.out, "\t{}\t{}", mnem("idiv", ty), divisor);
        } else {
            if ty.bytes() == 1 {
                let _ = writeln!(self.out, "\tmovzbl\t%al, %eax");
            } else {
                let _ = writeln!(self.out, "\txorl\t%edx, %edx");
            }
            let _ = writeln!(self.out, "\t{}\t{}", mnem("div", ty), divisor);
        }
    }

    /// Two-address arithmetic: get the left operand into the destination,
    /// then apply the right one.
    fn emit_two_address(&mut self, inst: Inst, op: Opcode, dst: Value) {
        let instr = &self.func.insts[inst];
        let ty = self.func.vars[dst].ty;
        let a = instr.args[0].operand;
        let b = instr.args.get(1).map(|x| x.operand);

        let base = match (op, ty.is_signed_int(), ty.is_real()) {
            (Opcode::Add, _, _) => "add",
            (Opcode::Sub, _, _) => "sub",
            (Opcode::Mul, _, true) => "mul",
            (Opcode::Mul, true, _) => "imul",
            (Opcode::Mul, false, _) => "mul",
            (Opcode::Div, _, true) => "div",
            (Opcode::And, _, _) => "and",
            (Opcode::Or, _, _) => "or",
            (Opcode::Xor, _, _) => "xor",
            _ => panic!("not a two-address opcode: {:?}", op),
        };

        let b = match b {
            Some(b) => b,
            None => {
                // Unary fallback: never reached for the current opcode set.
                self.move_into_dst(inst, dst);
                return;
            }
        };

        // Constant folding at emission time.
        if let (Some(ca), Some(cb)) = (a.constant(), b.constant()) {
            let da = self.func.constants[ca];
            let db = self.func.constants[cb];
            let folded = fold_binary(op, ty, da.bits, db.bits);
            let d = self.reg_str(dst);
            if ty.is_real() {
                let label = self.pool.intern_typed(ty, folded);
                let _ = writeln!(self.out, "\t{}\t.LC{}, {}", mnem("mov", ty), label, d);
            } else {
                let _ = writeln!(self.out, "\t{}\t${}, {}", mnem("mov", ty), truncate(ty, folded), d);
            }
            return;
        }

        let dst_color = self.func.vars[dst].color;
        if self.color_of(a) == Some(dst_color) {
            // dst already holds a.
            let bs = self.operand_str(b);
            let d = self.reg_str(dst);
            let _ = writeln!(self.out, "\t{}\t{}, {}", mnem(base, ty), bs, d);
            return;
        }
        if self.color_of(b) == Some(dst_color) {
            if op.is_commutative() {
                let as_ = self.operand_str(a);
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t{}, {}", mnem(base, ty), as_, d);
                return;
            }
            if op == Opcode::Sub && !ty.is_real() {
                // dst == b: compute b - a, then negate.
                let as_ = self.operand_str(a);
                let d = self.reg_str(dst);
                let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("sub", ty), as_, d);
                let _ = writeln!(self.out, "\t{}\t{}", mnem("neg", ty), d);
                return;
            }
            // Non-commutative with an aliased right operand: park it in
            // the red zone.
            let bs = self.operand_str(b);
            let d = self.reg_str(dst);
            let as_ = self.operand_str(a);
            let _ = writeln!(self.out, "\t{}\t{}, -8(%rsp)", mnem("mov", ty), bs);
            let _ = writeln!(self.out, "\t{}\t{}, {}", mnem("mov", ty), as_, d);
            let _ = writeln!(self.out, "\t{}\t-8(%rsp), {}", mnem(base, ty), d);
            return;
        }

        // dst holds neither operand.
        self.move_into_dst(inst, dst);
        let bs = self.operand_str(b);
        let d = self.reg_str(dst);
        let _ = writeln!(self.out, "\t{}\t{}, {}", mnem(base, ty), bs, d);
    }

    fn emit_cast(&mut self, inst: Inst) {
        let instr = &self.func.insts[inst];
        let dst = instr.ress[0].value;
        let dst_ty = self.func.vars[dst].ty;
        let src = instr.args[0].operand;
        let src_ty = self.func.operand_type(src);

        let scratch = instr
            .ress
            .get(1)
            .map(|r| self.reg_str(r.value));
        let same_color = self.color_of(src) == Some(self.func.vars[dst].color);
        let s = self.operand_str(src);
        let d = self.reg_str(dst);
        cast::emit_cast(
            self.out,
            src_ty,
            dst_ty,
            &s,
            &d,
            scratch.as_deref(),
            same_color,
        );
    }

    fn emit_branch(&mut self, inst: Inst, cond: Option<CondCode>, on_true: Inst, on_false: Inst) {
        let next_label_block = self
            .func
            .layout
            .next_inst(inst)
            .and_then(|n| self.func.layout.inst_block(n));
        let true_block = self.func.layout.inst_block(on_true);
        let false_block = self.func.layout.inst_block(on_false);
        let tl = self.label_of(on_true);
        let fl = self.label_of(on_false);

        let cc = match cond {
            Some(cc) => cc,
            None => {
                let c = self.func.insts[inst].args[0].operand;
                if let Some(cst) = c.constant() {
                    // Constant condition: one unconditional jump.
                    let taken = if self.func.constants[cst].bits != 0 {
                        tl
                    } else {
                        fl
                    };
                    let _ = writeln!(self.out, "\tjmp\t{}", taken);
                    return;
                }
                let v = c.value().expect("branch on undef");
                let r8 = match self.func.vars[v].color {
                    Color::Reg(ru) => format!("%{}", self.isa.reg_name(ru, Type::Bool)),
                    c => panic!("branch condition uncolored: {:?}", c),
                };
                let _ = writeln!(self.out, "\ttestb\t{}, {}", r8, r8);
                CondCode::Ne
            }
        };

        if next_label_block == true_block {
            let _ = writeln!(self.out, "\tj{}\t{}", jcc_str(cc, true), fl);
        } else if next_label_block == false_block {
            let _ = writeln!(self.out, "\tj{}\t{}", jcc_str(cc, false), tl);
        } else {
            let _ = writeln!(self.out, "\tj{}\t{}", jcc_str(cc, false), tl);
            let _ = writeln!(self.out, "\tjmp\t{}", fl);
        }
    }

    /*
     * Phi moves.
     */

    fn emit_phi_moves(&mut self, pred: Block, succ: Block) {
        if !self.func.block_has_phis(succ) {
            return;
        }

        // Spill-slot shuffles first: they may borrow the registers the
        // later register shuffles redistribute.
        for kind in [
            TransferKind::QuadSlots,
            TransferKind::OctSlots,
            TransferKind::IntReg,
            TransferKind::XmmReg,
        ] {
            let free = self.free_scratch_regs(pred, kind);
            let mut sink = X64MoveSink {
                isa: self.isa,
                func: self.func,
                out: &mut *self.out,
                kind,
                free,
                tmp: None,
                oct_scratch: None,
                oct_scratch_saved: false,
            };
            lower_phi_edge(
                self.func,
                self.liveness,
                self.defuse,
                pred,
                succ,
                kind,
                &mut sink,
            );
        }
    }

    /// Registers available as scratch at the end of `pred` for a lowering
    /// of `kind`.
    fn free_scratch_regs(&self, pred: Block, kind: TransferKind) -> RegisterSet {
        let class = match kind {
            TransferKind::IntReg | TransferKind::QuadSlots => RegClass::Gpr,
            TransferKind::XmmReg | TransferKind::OctSlots => RegClass::Xmm,
        };
        let mut free = self.isa.allocatable(class);

        let last = self.func.layout.last_inst_of(pred);
        for &v in self.liveness.inst_live_out(last) {
            let data = &self.func.vars[v];
            if data.colorable_reg(class) {
                if let Color::Reg(ru) = data.color {
                    if free.contains(ru) {
                        free.remove(ru);
                    }
                }
            }
        }

        // Callee-saved registers the function does not use anyway would
        // force an extra push; keep them out of the scratch pool.
        if class == RegClass::Gpr {
            for ru in CALLEE_SAVED {
                if !self.func.used_colors.contains(&ru) && free.contains(ru) {
                    free.remove(ru);
                }
            }
        }
        free
    }
}

/*
 * The x64 move sink.
 */

struct X64MoveSink<'a> {
    isa: &'a X64,
    func: &'a Function,
    out: &'a mut String,
    kind: TransferKind,
    free: RegisterSet,
    tmp: Option<RegUnit>,
    oct_scratch: Option<RegUnit>,
    oct_scratch_saved: bool,
}

impl X64MoveSink<'_> {
    fn reg(&self, color: u32, ty: Type) -> String {
        format!("%{}", self.isa.reg_name(color as RegUnit, ty))
    }

    fn slot(&self, color: u32) -> String {
        let place = match self.kind {
            TransferKind::QuadSlots => QUADWORDS,
            TransferKind::OctSlots => OCTWORDS,
            _ => unreachable!("register kinds have no slots"),
        };
        format!(
            "-{}(%rbp)",
            self.func.stack_layout.slot_neg_offset(place, color)
        )
    }

    /// The octword shuffles need a register even for plain moves; borrow
    /// one, saving it to the red zone unless it is provably free.
    fn oct_scratch(&mut self) -> RegUnit {
        if let Some(ru) = self.oct_scratch {
            return ru;
        }
        let ru = if self.free.len() >= 2 {
            self.free.iter().nth(1).unwrap()
        } else {
            let _ = writeln!(self.out, "\tmovdqa\t%xmm0, -16(%rsp)");
            self.oct_scratch_saved = true;
            XMM0
        };
        self.oct_scratch = Some(ru);
        ru
    }
}

impl MoveSink for X64MoveSink<'_> {
    fn gen_move(&mut self, ty: Type, from: u32, to: u32) {
        match self.kind {
            TransferKind::IntReg | TransferKind::XmmReg => {
                let _ = writeln!(
                    self.out,
                    "\t{}\t{}, {}",
                    mnem("mov", ty),
                    self.reg(from, ty),
                    self.reg(to, ty)
                );
            }
            TransferKind::QuadSlots => {
                // Stack-to-stack without touching a register.
                let f = self.slot(from);
                let t = self.slot(to);
                let _ = writeln!(self.out, "\tpushq\t{}", f);
                let _ = writeln!(self.out, "\tpopq\t{}", t);
            }
            TransferKind::OctSlots => {
                let ru = self.oct_scratch();
                let s = self.reg(ru as u32, Type::Stack);
                let f = self.slot(from);
                let t = self.slot(to);
                let _ = writeln!(self.out, "\tmovdqa\t{}, {}", f, s);
                let _ = writeln!(self.out, "\tmovdqa\t{}, {}", s, t);
            }
        }
    }

    fn gen_reg_to_tmp(&mut self, ty: Type, from: u32) {
        match self.kind {
            TransferKind::IntReg => match self.free.first() {
                None => {
                    let _ = writeln!(self.out, "\tpushq\t{}", self.reg(from, Type::Int64));
                }
                Some(tmp) => {
                    self.tmp = Some(tmp);
                    self.gen_move(ty, from, tmp as u32);
                }
            },
            TransferKind::XmmReg => match self.free.first() {
                None => {
                    // Red zone scratch for the cycle temporary.
                    let _ = writeln!(self.out, "\tmovdqa\t{}, -16(%rsp)", self.reg(from, ty));
                }
                Some(tmp) => {
                    self.tmp = Some(tmp);
                    self.gen_move(ty, from, tmp as u32);
                }
            },
            TransferKind::QuadSlots => match self.free.first() {
                None => {
                    let _ = writeln!(self.out, "\tpushq\t%rax");
                    let _ = writeln!(self.out, "\tmovq\t{}, %rax", self.slot(from));
                    self.tmp = Some(RAX);
                }
                Some(tmp) => {
                    self.tmp = Some(tmp);
                    let _ = writeln!(
                        self.out,
                        "\tmovq\t{}, {}",
                        self.slot(from),
                        self.reg(tmp as u32, Type::Int64)
                    );
                }
            },
            TransferKind::OctSlots => match self.free.first() {
                None => {
                    let _ = writeln!(self.out, "\tmovdqa\t%xmm1, -32(%rsp)");
                    let _ = writeln!(self.out, "\tmovdqa\t{}, %xmm1", self.slot(from));
                    self.tmp = Some(XMM1);
                }
                Some(tmp) => {
                    self.tmp = Some(tmp);
                    let _ = writeln!(
                        self.out,
                        "\tmovdqa\t{}, {}",
                        self.slot(from),
                        self.reg(tmp as u32, Type::Stack)
                    );
                }
            },
        }
    }

    fn gen_tmp_to_reg(&mut self, ty: Type, to: u32) {
        match self.kind {
            TransferKind::IntReg => match self.tmp {
                None => {
                    let _ = writeln!(self.out, "\tpopq\t{}", self.reg(to, Type::Int64));
                }
                Some(tmp) => self.gen_move(ty, tmp as u32, to),
            },
            TransferKind::XmmReg => match self.tmp {
                None => {
                    let _ = writeln!(self.out, "\tmovdqa\t-16(%rsp), {}", self.reg(to, ty));
                }
                Some(tmp) => self.gen_move(ty, tmp as u32, to),
            },
            TransferKind::QuadSlots => match self.tmp {
                Some(RAX) if self.free.is_empty() => {
                    let _ = writeln!(self.out, "\tmovq\t%rax, {}", self.slot(to));
                    let _ = writeln!(self.out, "\tpopq\t%rax");
                }
                Some(tmp) => {
                    let _ = writeln!(
                        self.out,
                        "\tmovq\t{}, {}",
                        self.reg(tmp as u32, Type::Int64),
                        self.slot(to)
                    );
                }
                None => unreachable!("slot cycle without a temporary"),
            },
            TransferKind::OctSlots => match self.tmp {
                Some(XMM1) if self.free.is_empty() => {
                    let _ = writeln!(self.out, "\tmovdqa\t%xmm1, {}", self.slot(to));
                    let _ = writeln!(self.out, "\tmovdqa\t-32(%rsp), %xmm1");
                }
                Some(tmp) => {
                    let _ = writeln!(
                        self.out,
                        "\tmovdqa\t{}, {}",
                        self.reg(tmp as u32, Type::Stack),
                        self.slot(to)
                    );
                }
                None => unreachable!("slot cycle without a temporary"),
            },
        }
        self.tmp = None;
    }

    fn cleanup(&mut self) {
        if self.oct_scratch_saved {
            let _ = writeln!(self.out, "\tmovdqa\t-16(%rsp), %xmm0");
        }
    }
}

/*
 * Mnemonics, condition codes, folding.
 */

/// Attach the operand-size suffix of `ty` to a mnemonic base.
fn mnem(base: &str, ty: Type) -> String {
    let suffix = match ty {
        Type::Real32 => "ss",
        Type::Real64 => "sd",
        _ => match ty.bytes() {
            1 => "b",
            2 => "w",
            4 => "l",
            _ => "q",
        },
    };
    format!("{}{}", base, suffix)
}

fn cc_str(op: Opcode, signed: bool, neg: bool) -> &'static str {
    let cc = match (op, signed) {
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
    };
    jcc_str(cc, neg)
}

fn jcc_str(cc: CondCode, neg: bool) -> &'static str {
    match (cc, neg) {
        (CondCode::Eq, false) => "e",
        (CondCode::Eq, true) => "ne",
        (CondCode::Ne, false) => "ne",
        (CondCode::Ne, true) => "e",
        (CondCode::L, false) => "l",
        (CondCode::L, true) => "nl",
        (CondCode::Le, false) => "le",
        (CondCode::Le, true) => "nle",
        (CondCode::G, false) => "g",
        (CondCode::G, true) => "ng",
        (CondCode::Ge, false) => "ge",
        (CondCode::Ge, true) => "nge",
        (CondCode::B, false) => "b",
        (CondCode::B, true) => "nb",
        (CondCode::Be, false) => "be",
        (CondCode::Be, true) => "nbe",
        (CondCode::A, false) => "a",
        (CondCode::A, true) => "na",
        (CondCode::Ae, false) => "ae",
        (CondCode::Ae, true) => "nae",
    }
}

fn reverse_comparison(op: Opcode) -> Opcode {
    match op {
        Opcode::Eq => Opcode::Eq,
        Opcode::Ne => Opcode::Ne,
        Opcode::Lt => Opcode::Gt,
        Opcode::Gt => Opcode::Lt,
        Opcode::Le => Opcode::Ge,
        Opcode::Ge => Opcode::Le,
        _ => panic!("not a comparison: {:?}", op),
    }
}

fn truncate(ty: Type, bits: u64) -> u64 {
    match ty.bytes() {
        1 => bits & 0xff,
        2 => bits & 0xffff,
        4 => bits & 0xffff_ffff,
        _ => bits,
    }
}

fn sign_extend(ty: Type, bits: u64) -> i64 {
    match ty.bytes() {
        1 => bits as u8 as i8 as i64,
        2 => bits as u16 as i16 as i64,
        4 => bits as u32 as i32 as i64,
        _ => bits as i64,
    }
}

fn fold_unary_neg(ty: Type, bits: u64) -> u64 {
    match ty {
        Type::Real32 => (-f32::from_bits(bits as u32)).to_bits() as u64,
        Type::Real64 => (-f64::from_bits(bits)).to_bits(),
        _ => truncate(ty, (sign_extend(ty, bits).wrapping_neg()) as u64),
    }
}

/// Fold `a op b` of two constant bit patterns of type `ty`.
fn fold_binary(op: Opcode, ty: Type, a: u64, b: u64) -> u64 {
    match ty {
        Type::Real32 => {
            let (x, y) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
            let r = match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                Opcode::Div => x / y,
                _ => panic!("cannot fold {:?} on floats", op),
            };
            r.to_bits() as u64
        }
        Type::Real64 => {
            let (x, y) = (f64::from_bits(a), f64::from_bits(b));
            let r = match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                Opcode::Div => x / y,
                _ => panic!("cannot fold {:?} on floats", op),
            };
            r.to_bits()
        }
        _ if ty.is_signed_int() => {
            let (x, y) = (sign_extend(ty, a), sign_extend(ty, b));
            let r = match op {
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div => x.wrapping_div(y),
                Opcode::And => x & y,
                Opcode::Or => x | y,
                Opcode::Xor => x ^ y,
                _ => panic!("cannot fold {:?}", op),
            };
            truncate(ty, r as u64)
        }
        _ => {
            let (x, y) = (truncate(ty, a), truncate(ty, b));
            let r = match op {
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div => x / y,
                Opcode::And => x & y,
                Opcode::Or => x | y,
                Opcode::Xor => x ^ y,
                _ => panic!("cannot fold {:?}", op),
            };
            truncate(ty, r)
        }
    }
}

fn fold_comparison(op: Opcode, ty: Type, a: u64, b: u64) -> u64 {
    let holds = match ty {
        Type::Real32 => {
            let (x, y) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
            compare(op, x.partial_cmp(&y))
        }
        Type::Real64 => {
            let (x, y) = (f64::from_bits(a), f64::from_bits(b));
            compare(op, x.partial_cmp(&y))
        }
        _ if ty.is_signed_int() => {
            let (x, y) = (sign_extend(ty, a), sign_extend(ty, b));
            compare(op, x.partial_cmp(&y))
        }
        _ => {
            let (x, y) = (truncate(ty, a), truncate(ty, b));
            compare(op, x.partial_cmp(&y))
        }
    };
    holds as u64
}

fn compare(op: Opcode, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ord) {
        (Opcode::Eq, Some(Equal)) => true,
        (Opcode::Ne, Some(Less) | Some(Greater) | None) => true,
        (Opcode::Lt, Some(Less)) => true,
        (Opcode::Le, Some(Less) | Some(Equal)) => true,
        (Opcode::Gt, Some(Greater)) => true,
        (Opcode::Ge, Some(Greater) | Some(Equal)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowgraph::ControlFlowGraph;
    use crate::ir::{Function, Opcode, Operand};
    use crate::settings::Flags;
    use smallvec::SmallVec;

    /// A swap prescribed by two phis whose colors cross: lowering must
    /// rotate through a scratch register with exactly three moves.
    #[test]
    fn phi_cycle_emits_swap() {
        let mut func = Function::with_name("h", &[8, 16]);
        let x = func.new_ssa_reg(Type::Int32);
        let y = func.new_ssa_reg(Type::Int32);
        let xp = func.new_ssa_reg(Type::Int32);
        let yp = func.new_ssa_reg(Type::Int32);

        func.emit_label();
        let mid_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let end_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let one = func.new_const(Type::Int32, 1);
        let two = func.new_const(Type::Int32, 2);
        func.emit_assign(Opcode::Mov, x, one, None);
        func.emit_assign(Opcode::Mov, y, two, None);
        func.emit_goto(mid_l);
        func.layout.push_back(mid_l);
        func.emit_nop(xp);
        func.emit_nop(yp);
        func.layout.push_back(end_l);

        let mut cfg = ControlFlowGraph::new();
        crate::cfg_build::build_cfg(&mut func, &mut cfg);
        let b0 = func.entry.expand().unwrap();
        let b1 = func.layout.inst_block(mid_l).unwrap();

        // Hand-build the two phis for the edge b0 -> b1.
        for (res, arg) in [(xp, x), (yp, y)] {
            let number = func.vars[res].number;
            let phi = func.make_phi(res, number, 1);
            match &mut func.insts[phi].data {
                InstructionData::Phi { sources } => sources[0] = b0.into(),
                _ => unreachable!(),
            }
            func.insts[phi].args[0].operand = Operand::Value(arg);
            let begin = func.layout.block(b1).begin;
            func.insert_inst_after(phi, begin);
        }

        let mut domtree = crate::dominator_tree::DominatorTree::new();
        domtree.compute(&func, &cfg);
        let mut defuse = crate::defuse::DefUse::new();
        defuse.compute(&func, &domtree);
        let mut liveness = crate::liveness::Liveness::new();
        liveness.compute(&func, &cfg, &defuse);

        // Crossed colors force a cycle.
        func.vars[x].color = Color::Reg(RAX);
        func.vars[y].color = Color::Reg(crate::isa::x64::RCX);
        func.vars[xp].color = Color::Reg(crate::isa::x64::RCX);
        func.vars[yp].color = Color::Reg(RAX);

        let isa = X64::new(Flags::default());
        let mut pool = ConstantPool::new();
        let mut out = String::new();
        let mut em = FuncEmitter {
            isa: &isa,
            func: &func,
            cfg: &cfg,
            liveness: &liveness,
            defuse: &defuse,
            pool: &mut pool,
            out: &mut out,
            seq: 1,
        };
        em.emit_phi_moves(b0, b1);

        // Scratch is the lowest free caller-saved register: %edx.
        assert_eq!(
            out,
            "\tmovl\t%eax, %edx\n\tmovl\t%ecx, %eax\n\tmovl\t%edx, %ecx\n"
        );
    }

    #[test]
    fn mnemonic_suffixes() {
        assert_eq!(mnem("mov", Type::Int32), "movl");
        assert_eq!(mnem("add", Type::Int64), "addq");
        assert_eq!(mnem("add", Type::Real32), "addss");
        assert_eq!(mnem("mul", Type::Real64), "mulsd");
        assert_eq!(mnem("cmp", Type::Uint16), "cmpw");
        assert_eq!(mnem("mov", Type::Bool), "movb");
    }

    #[test]
    fn folding() {
        assert_eq!(fold_binary(Opcode::Add, Type::Int32, 3, 4), 7);
        assert_eq!(
            fold_binary(Opcode::Sub, Type::Int32, 3, 4),
            0xffff_ffff // -1 truncated to 32 bits
        );
        assert_eq!(fold_binary(Opcode::Mul, Type::Uint8, 16, 16), 0);
        let bits = fold_binary(
            Opcode::Add,
            Type::Real32,
            1.5f32.to_bits() as u64,
            0.25f32.to_bits() as u64,
        );
        assert_eq!(f32::from_bits(bits as u32), 1.75);
        assert_eq!(fold_comparison(Opcode::Lt, Type::Int8, 0xff, 1), 1);
        assert_eq!(fold_comparison(Opcode::Lt, Type::Uint8, 0xff, 1), 0);
        assert_eq!(fold_unary_neg(Type::Int32, 5), 0xffff_fffb);
    }

    #[test]
    fn condition_codes() {
        assert_eq!(cc_str(Opcode::Lt, true, false), "l");
        assert_eq!(cc_str(Opcode::Lt, false, false), "b");
        assert_eq!(jcc_str(CondCode::Ge, true), "nge");
        assert_eq!(jcc_str(CondCode::Eq, false), "e");
    }
}
