//! End-to-end scenarios: build IR the way a front end would, compile to
//! assembly text, and check the shape of the output.

use basalt_codegen::ir::{Function, InstructionData, Opcode, Operand, Type};
use basalt_codegen::isa::{self, TargetIsa};
use basalt_codegen::settings;
use basalt_codegen::Compilation;
use smallvec::SmallVec;
use std::str::FromStr;
use target_lexicon::Triple;

fn host_isa() -> Box<dyn TargetIsa> {
    let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    isa::lookup(triple, settings::Flags::default()).unwrap()
}

fn isa_with_gpr_limit(n: u8) -> Box<dyn TargetIsa> {
    let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    let flags = settings::Flags::new(settings::builder().set_gpr_limit(n));
    isa::lookup(triple, flags).unwrap()
}

fn compile_one(func: Function, isa: &dyn TargetIsa) -> String {
    let mut unit = Compilation::new();
    unit.declare_function(func);
    unit.compile(isa).expect("compilation failed")
}

fn new_label(func: &mut Function) -> basalt_codegen::ir::Inst {
    func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new())
}

/// The body of `name` between its .LFB and .LFE markers.
fn body_of<'a>(asm: &'a str, seq: u32) -> &'a str {
    let start = asm.find(&format!(".LFB{}:", seq)).unwrap();
    let end = asm.find(&format!(".LFE{}:", seq)).unwrap();
    &asm[start..end]
}

/// Straight-line add: the argument registers flow into a single `addl`
/// producing `%eax`, with no spills and no frame.
#[test]
fn s1_straight_line_add() {
    let mut func = Function::with_name("add2", &[8, 16]);
    let a = func.new_reg(Type::Int32);
    let b = func.new_reg(Type::Int32);
    let r = func.new_reg(Type::Int32);

    func.emit_label();
    func.emit_set_params(&[a, b]);
    func.emit_assign(Opcode::Add, r, a, Some(Operand::Value(b)));
    func.emit_set_results(&[Operand::Value(r)]);
    let end = new_label(&mut func);
    func.layout.push_back(end);

    let asm = compile_one(func, host_isa().as_ref());
    let body = body_of(&asm, 1);

    assert_eq!(body.matches("addl").count(), 1, "one addl expected:\n{}", body);
    assert!(body.contains("%edi") && body.contains("%esi"), "{}", body);
    assert!(body.contains("%eax"), "{}", body);
    assert!(body.contains("\tret"), "{}", body);
    // No frame: nothing spilled, nothing pushed.
    assert!(!body.contains("subq\t$"), "unexpected frame:\n{}", body);
    assert!(!body.contains("(%rbp)"), "unexpected spill:\n{}", body);
}

/// Diamond with a phi: both sources coalesce into one register, so the
/// predecessors load their constants straight into it and the join emits
/// no move.
#[test]
fn s2_diamond_phi_coalesces() {
    let mut func = Function::with_name("pick", &[8, 16]);
    let c = func.new_reg(Type::Bool);
    let x = func.new_reg(Type::Int32);

    func.emit_label();
    let then_l = new_label(&mut func);
    let else_l = new_label(&mut func);
    let join_l = new_label(&mut func);
    let end_l = new_label(&mut func);

    func.emit_set_params(&[c]);
    func.emit_branch(c, then_l, else_l);
    func.layout.push_back(then_l);
    let one = func.new_const(Type::Int32, 1);
    func.emit_assign(Opcode::Mov, x, one, None);
    func.emit_goto(join_l);
    func.layout.push_back(else_l);
    let two = func.new_const(Type::Int32, 2);
    func.emit_assign(Opcode::Mov, x, two, None);
    func.emit_goto(join_l);
    func.layout.push_back(join_l);
    func.emit_set_results(&[Operand::Value(x)]);
    func.layout.push_back(end_l);

    let asm = compile_one(func, host_isa().as_ref());
    let body = body_of(&asm, 1);

    // Find the registers the two constants land in.
    let reg_of = |imm: &str| -> &str {
        let pos = body.find(imm).unwrap_or_else(|| panic!("{} not found:\n{}", imm, body));
        let rest = &body[pos..];
        let line = rest.lines().next().unwrap();
        line.split(", ").nth(1).unwrap()
    };
    let r1 = reg_of("movl\t$1, ");
    let r2 = reg_of("movl\t$2, ");
    assert_eq!(r1, r2, "phi sources must share a register:\n{}", body);
}

/// Spill under pressure: ten simultaneously live ints with a 4-register
/// reservoir must spill, reload, and allocate an aligned frame.
#[test]
fn s3_spill_under_pressure() {
    let mut func = Function::with_name("pressure", &[8, 16]);
    let vars: Vec<_> = (0..10).map(|_| func.new_reg(Type::Int32)).collect();
    let sum = func.new_reg(Type::Int32);

    func.emit_label();
    for (i, &v) in vars.iter().enumerate() {
        let c = func.new_const(Type::Int32, i as u64 + 1);
        func.emit_assign(Opcode::Mov, v, c, None);
    }
    func.emit_assign(Opcode::Add, sum, vars[0], Some(Operand::Value(vars[1])));
    for &v in &vars[2..] {
        func.emit_assign(Opcode::Add, sum, sum, Some(Operand::Value(v)));
    }
    func.emit_set_results(&[Operand::Value(sum)]);
    let end = new_label(&mut func);
    func.layout.push_back(end);

    let asm = compile_one(func, isa_with_gpr_limit(4).as_ref());
    let body = body_of(&asm, 1);

    assert!(body.contains("(%rbp)"), "expected spill slots:\n{}", body);
    assert!(body.contains("-8(%rbp)"), "expected the first slot:\n{}", body);

    // The frame is 16-byte aligned.
    let sub = body
        .find("subq\t$")
        .map(|p| &body[p + 6..])
        .expect("expected a frame allocation");
    let size: u32 = sub[1..sub.find(',').unwrap()].parse().unwrap();
    assert_eq!(size % 16, 0, "frame size {} not 16-byte aligned", size);

    // Spills write to the frame, reloads read back.
    let stores = body
        .lines()
        .filter(|l| l.starts_with("\tmovl\t%") && l.contains("(%rbp)"))
        .count();
    assert!(stores >= 6, "expected at least 6 spills, got {}:\n{}", stores, body);
}

/// Division pins its operands: sign extension with `cltd`, the quotient in
/// RAX, and a register divisor.
#[test]
fn s4_div_targets_rax_rdx() {
    let mut func = Function::with_name("quot", &[8, 16]);
    let a = func.new_reg(Type::Int32);
    let b = func.new_reg(Type::Int32);
    let q = func.new_reg(Type::Int32);

    func.emit_label();
    func.emit_set_params(&[a, b]);
    func.emit_assign(Opcode::Div, q, a, Some(Operand::Value(b)));
    func.emit_set_results(&[Operand::Value(q)]);
    let end = new_label(&mut func);
    func.layout.push_back(end);

    let asm = compile_one(func, host_isa().as_ref());
    let body = body_of(&asm, 1);

    let cltd = body.find("\tcltd").expect("expected sign extension");
    let idiv = body.find("\tidivl\t%").expect("expected idivl on a register");
    assert!(cltd < idiv, "cltd must precede idivl:\n{}", body);
    assert!(!body.contains("idivl\t%edx"), "divisor may not be RDX:\n{}", body);
    assert!(!body.contains("idivl\t$"), "divisor may not be immediate:\n{}", body);
}

/// A loop whose phis swap two values across the back edge still compiles
/// to a well-formed body with a backward jump.
#[test]
fn s5_swap_loop_compiles() {
    let mut func = Function::with_name("swaploop", &[8, 16]);
    let c = func.new_reg(Type::Bool);
    let x = func.new_reg(Type::Int32);
    let y = func.new_reg(Type::Int32);
    let t = func.new_reg(Type::Int32);

    func.emit_label();
    let head_l = new_label(&mut func);
    let body_l = new_label(&mut func);
    let exit_l = new_label(&mut func);
    let end_l = new_label(&mut func);

    func.emit_set_params(&[c]);
    let one = func.new_const(Type::Int32, 1);
    let two = func.new_const(Type::Int32, 2);
    func.emit_assign(Opcode::Mov, x, one, None);
    func.emit_assign(Opcode::Mov, y, two, None);
    func.layout.push_back(head_l);
    func.emit_branch(c, body_l, exit_l);
    func.layout.push_back(body_l);
    // Swap across the back edge.
    func.emit_assign(Opcode::Mov, t, x, None);
    func.emit_assign(Opcode::Mov, x, y, None);
    func.emit_assign(Opcode::Mov, y, t, None);
    func.emit_goto(head_l);
    func.layout.push_back(exit_l);
    let s = func.new_reg(Type::Int32);
    func.emit_assign(Opcode::Add, s, x, Some(Operand::Value(y)));
    func.emit_set_results(&[Operand::Value(s)]);
    func.layout.push_back(end_l);

    let asm = compile_one(func, host_isa().as_ref());
    let body = body_of(&asm, 1);
    assert!(body.contains("\tjmp\t"), "expected a back edge:\n{}", body);
    assert!(body.contains("\taddl") || body.contains("\tadd"), "{}", body);
    assert!(body.contains("\tret"), "{}", body);
}

/// A value live across a call lands in a callee-saved register, which the
/// prologue pushes and the epilogue pops, keeping RSP 16-byte aligned at
/// the call site.
#[test]
fn call_preserves_live_values() {
    let mut func = Function::with_name("wrap", &[8, 16]);
    let x = func.new_reg(Type::Int32);
    let y = func.new_reg(Type::Int32);
    let t = func.new_reg(Type::Int32);
    let s = func.new_reg(Type::Int32);

    func.emit_label();
    func.emit_set_params(&[x, y]);
    func.emit_call("ext", &[t], &[Operand::Value(y)], false);
    func.emit_assign(Opcode::Add, s, x, Some(Operand::Value(t)));
    func.emit_set_results(&[Operand::Value(s)]);
    let end = new_label(&mut func);
    func.layout.push_back(end);

    let asm = compile_one(func, host_isa().as_ref());
    let body = body_of(&asm, 1);

    assert!(body.contains("\tcall\text"), "{}", body);
    assert!(body.contains("\tpushq\t%rbx") || body.contains("\tpushq\t%r12"),
        "expected a callee-save push:\n{}", body);
    // With one push and no locals, padding keeps the call site aligned.
    assert!(body.contains("subq\t$8, %rsp"), "{}", body);
}

/// Constant arithmetic folds at emission: `3 + 4` becomes `movl $7`.
#[test]
fn s6_constant_folding() {
    let mut func = Function::with_name("seven", &[8, 16]);
    let x = func.new_reg(Type::Int32);

    func.emit_label();
    let c3 = func.new_const(Type::Int32, 3);
    let c4 = func.new_const(Type::Int32, 4);
    func.emit_assign(Opcode::Add, x, c3, Some(Operand::Constant(c4)));
    func.emit_set_results(&[Operand::Value(x)]);
    let end = new_label(&mut func);
    func.layout.push_back(end);

    let asm = compile_one(func, host_isa().as_ref());
    let body = body_of(&asm, 1);

    assert!(body.contains("movl\t$7, "), "expected folded constant:\n{}", body);
    assert!(!body.contains("\taddl"), "no addition expected:\n{}", body);
}

/// The assembly file carries the expected framing: `.text`, the symbol
/// directives, `_start`, and the sign-mask constants.
#[test]
fn output_framing() {
    let mut func = Function::with_name("main", &[8, 16]);
    let r = func.new_reg(Type::Int32);
    func.emit_label();
    let c = func.new_const(Type::Int32, 0);
    func.emit_assign(Opcode::Mov, r, c, None);
    func.emit_set_results(&[Operand::Value(r)]);
    let end = new_label(&mut func);
    func.layout.push_back(end);

    let asm = compile_one(func, host_isa().as_ref());
    assert!(asm.starts_with("\t.text"));
    assert!(asm.contains("\t.globl\tmain"));
    assert!(asm.contains("\t.type\tmain, @function"));
    assert!(asm.contains(".LFB1:"));
    assert!(asm.contains(".LFE1:"));
    assert!(asm.contains("\t.size\tmain, .-main"));
    assert!(asm.contains("_start:"));
    assert!(asm.contains("\tcall\tmain"));
    assert!(asm.contains(".LCS8:"));
    assert!(asm.contains(".LCS16:"));
    assert!(asm.contains(".LCS32:"));
    assert!(asm.contains(".LCS64:"));
}

/// Floats ride the XMM bank: parameters in xmm0/xmm1, scalar SSE
/// arithmetic, the result in xmm0.
#[test]
fn float_add_uses_sse() {
    let mut func = Function::with_name("fadd", &[8, 16]);
    let a = func.new_reg(Type::Real64);
    let b = func.new_reg(Type::Real64);
    let r = func.new_reg(Type::Real64);

    func.emit_label();
    func.emit_set_params(&[a, b]);
    func.emit_assign(Opcode::Add, r, a, Some(Operand::Value(b)));
    func.emit_set_results(&[Operand::Value(r)]);
    let end = new_label(&mut func);
    func.layout.push_back(end);

    let asm = compile_one(func, host_isa().as_ref());
    let body = body_of(&asm, 1);
    assert!(body.contains("addsd"), "expected scalar double add:\n{}", body);
    assert!(body.contains("%xmm0") && body.contains("%xmm1"), "{}", body);
}

/// A fused compare-and-branch emits `cmp` + `jcc` and no `set`.
#[test]
fn compare_branch_fusion() {
    let mut func = Function::with_name("cmpbr", &[8, 16]);
    let a = func.new_reg(Type::Int32);
    let b = func.new_reg(Type::Int32);
    let c = func.new_reg(Type::Bool);
    let r = func.new_reg(Type::Int32);

    func.emit_label();
    let then_l = new_label(&mut func);
    let else_l = new_label(&mut func);
    let join_l = new_label(&mut func);
    let end_l = new_label(&mut func);

    func.emit_set_params(&[a, b]);
    func.emit_assign(Opcode::Lt, c, a, Some(Operand::Value(b)));
    func.emit_branch(c, then_l, else_l);
    func.layout.push_back(then_l);
    let one = func.new_const(Type::Int32, 1);
    func.emit_assign(Opcode::Mov, r, one, None);
    func.emit_goto(join_l);
    func.layout.push_back(else_l);
    let two = func.new_const(Type::Int32, 2);
    func.emit_assign(Opcode::Mov, r, two, None);
    func.emit_goto(join_l);
    func.layout.push_back(join_l);
    func.emit_set_results(&[Operand::Value(r)]);
    func.layout.push_back(end_l);

    let asm = compile_one(func, host_isa().as_ref());
    let body = body_of(&asm, 1);
    assert!(body.contains("\tcmpl\t"), "expected a compare:\n{}", body);
    assert!(!body.contains("\tset"), "comparison must fuse into the jump:\n{}", body);
    let has_jcc = body.contains("\tjl\t") || body.contains("\tjnl\t") || body.contains("\tjge\t");
    assert!(has_jcc, "expected a conditional jump:\n{}", body);
}
