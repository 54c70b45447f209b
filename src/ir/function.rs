//! A function: operand tables, instruction table, layout and stack frame.
//!
//! The function owns everything reachable from it — variables, constants,
//! instructions, blocks — in per-entity tables. Blocks and instructions
//! hold entity handles into these tables, never references, so the whole
//! graph is acyclic by construction and dropping the function drops it all.

use crate::entity::packed_option::PackedOption;
use crate::entity::PrimaryMap;
use crate::ir::entities::{Block, Constant, Inst, Value};
use crate::ir::instructions::{Instruction, InstructionData, Opcode};
use crate::ir::layout::Layout;
use crate::ir::operands::{Arg, ConstData, Operand, RegUnit, Res, VarData, VarKind};
use crate::ir::stackslot::StackLayout;
use crate::ir::types::Type;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// A function under compilation.
pub struct Function {
    /// Symbol name.
    pub name: String,

    /// All variables of the function.
    pub vars: PrimaryMap<Value, VarData>,

    /// Pooled constants.
    pub constants: PrimaryMap<Constant, ConstData>,

    /// All instructions, in creation order. Program order is the layout's.
    pub insts: PrimaryMap<Inst, Instruction>,

    /// Instruction list and block table.
    pub layout: Layout,

    /// The stack frame.
    pub stack_layout: StackLayout,

    /// Register units that received at least one value; drives the
    /// callee-save push set in the prologue.
    pub used_colors: FxHashSet<RegUnit>,

    /// Parameter variables declared by `SetParams`.
    pub params: Vec<Value>,

    /// Entry block, set by CFG construction.
    pub entry: PackedOption<Block>,

    /// Exit block (the block opened by the final label), set by CFG
    /// construction.
    pub exit: PackedOption<Block>,

    /// Next SSA name; increasing.
    ssa_counter: i32,

    /// Next pre-SSA name; decreasing.
    var_counter: i32,
}

impl Function {
    /// Create an empty function named `name`.
    ///
    /// `stack_places` lists the item sizes of the target's stack places.
    pub fn with_name(name: impl Into<String>, stack_places: &[u32]) -> Self {
        Self {
            name: name.into(),
            vars: PrimaryMap::new(),
            constants: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            layout: Layout::new(),
            stack_layout: StackLayout::new(stack_places),
            used_colors: FxHashSet::default(),
            params: Vec::new(),
            entry: None.into(),
            exit: None.into(),
            ssa_counter: 0,
            var_counter: -1,
        }
    }

    /// Is this the program entry function?
    pub fn is_main(&self) -> bool {
        self.name == "main"
    }

    /*
     * Operand factory.
     */

    /// Create a pre-SSA register variable of type `ty`. It must be turned
    /// into SSA names by SSA construction.
    pub fn new_reg(&mut self, ty: Type) -> Value {
        let number = self.var_counter;
        self.var_counter -= 1;
        self.vars.push(VarData {
            number,
            ty,
            kind: VarKind::Reg { is_spilled: false },
            color: Default::default(),
        })
    }

    /// Create a register variable already in SSA form.
    pub fn new_ssa_reg(&mut self, ty: Type) -> Value {
        let number = self.ssa_counter;
        self.ssa_counter += 1;
        self.vars.push(VarData {
            number,
            ty,
            kind: VarKind::Reg { is_spilled: false },
            color: Default::default(),
        })
    }

    /// Create a spilled register variable in SSA form: a fresh memory
    /// location in the spill-slot color space.
    pub fn new_spilled_ssa_reg(&mut self, ty: Type) -> Value {
        let number = self.ssa_counter;
        self.ssa_counter += 1;
        self.vars.push(VarData {
            number,
            ty,
            kind: VarKind::Reg { is_spilled: true },
            color: Default::default(),
        })
    }

    /// Create a memory variable in SSA form holding `size` aggregate bytes.
    pub fn new_mem_var(&mut self, size: u32) -> Value {
        let number = self.ssa_counter;
        self.ssa_counter += 1;
        self.vars.push(VarData {
            number,
            ty: Type::Stack,
            kind: VarKind::Mem { size },
            color: Default::default(),
        })
    }

    /// Clone `v` under a fresh SSA name, keeping its type and flavor.
    pub fn clone_new_ssa(&mut self, v: Value) -> Value {
        let number = self.ssa_counter;
        self.ssa_counter += 1;
        let data = self.vars[v].clone();
        self.vars.push(VarData {
            number,
            ty: data.ty,
            kind: data.kind,
            color: Default::default(),
        })
    }

    /// Intern a constant bit pattern of type `ty`.
    pub fn new_const(&mut self, ty: Type, bits: u64) -> Constant {
        self.constants.push(ConstData { ty, bits })
    }

    /// The type of an operand.
    pub fn operand_type(&self, op: Operand) -> Type {
        match op {
            Operand::Value(v) => self.vars[v].ty,
            Operand::Constant(c) => self.constants[c].ty,
            Operand::Undef(ty) => ty,
        }
    }

    /*
     * Instruction construction.
     */

    /// Create an instruction without placing it in the layout.
    pub fn create_inst(
        &mut self,
        data: InstructionData,
        ress: SmallVec<[Res; 2]>,
        args: SmallVec<[Arg; 2]>,
    ) -> Inst {
        self.insts.push(Instruction { data, ress, args })
    }

    /// Make a result slot for `v`, remembering its current (pre-SSA) name.
    pub fn make_res(&self, v: Value) -> Res {
        Res {
            value: v,
            old_number: self.vars[v].number,
            constraint: None,
        }
    }

    /// Create a phi for `result` with `num_args` argument slots, all
    /// initially undefined. The caller inserts it into the layout.
    pub fn make_phi(&mut self, result: Value, old_number: i32, num_args: usize) -> Inst {
        let ty = self.vars[result].ty;
        let args = (0..num_args)
            .map(|_| Arg::new(Operand::Undef(ty)))
            .collect();
        let sources = (0..num_args).map(|_| None.into()).collect();
        self.insts.push(Instruction {
            data: InstructionData::Phi { sources },
            ress: [Res {
                value: result,
                old_number,
                constraint: None,
            }]
            .into_iter()
            .collect(),
            args,
        })
    }

    /// Insert a created instruction after `pos`, joining `pos`'s block.
    pub fn insert_inst_after(&mut self, inst: Inst, pos: Inst) {
        self.layout.insert_after(inst, pos);
        if let Some(block) = self.layout.inst_block(pos) {
            self.layout.set_inst_block(inst, block);
            self.refresh_block_bounds(block);
        }
    }

    /// Insert a created instruction before `pos`, joining `pos`'s block.
    ///
    /// `pos` must not be a block's leading label; inserting there would put
    /// the instruction into the previous block.
    pub fn insert_inst_before(&mut self, inst: Inst, pos: Inst) {
        debug_assert!(
            !self.insts[pos].is_label(),
            "cannot insert before a label; use insert_inst_after on the label"
        );
        self.layout.insert_before(inst, pos);
        if let Some(block) = self.layout.inst_block(pos) {
            self.layout.set_inst_block(inst, block);
            self.refresh_block_bounds(block);
        }
    }

    /// Recompute `first_phi` and `first_ordinary` of `block` by walking its
    /// instruction range.
    pub fn refresh_block_bounds(&mut self, block: Block) {
        let mut first_phi = None;
        let mut first_ordinary = None;
        let insts: SmallVec<[Inst; 16]> = self.layout.block_insts(block).skip(1).collect();
        for inst in insts {
            if self.insts[inst].is_phi() {
                if first_phi.is_none() {
                    first_phi = Some(inst);
                }
            } else if first_ordinary.is_none() {
                first_ordinary = Some(inst);
            }
        }
        let data = self.layout.block_mut(block);
        data.first_phi = first_phi.into();
        data.first_ordinary = first_ordinary.into();
    }

    /// Does `block` contain any phi instruction?
    pub fn block_has_phis(&self, block: Block) -> bool {
        self.layout.block(block).first_phi.is_some()
    }

    /// Does `block` start with a constrained ordinary instruction?
    pub fn block_has_constrained_head(&self, block: Block) -> bool {
        match self.layout.block(block).first_ordinary.expand() {
            Some(inst) => self.insts[inst].is_constrained(),
            None => false,
        }
    }

    /*
     * Front-end builder: appends to the end of the stream.
     */

    fn append(&mut self, inst: Inst) -> Inst {
        self.layout.push_back(inst);
        inst
    }

    /// Append a label marking an intended block boundary.
    pub fn emit_label(&mut self) -> Inst {
        let inst = self.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        self.append(inst)
    }

    /// Append `res = op a [, b]`.
    pub fn emit_assign(
        &mut self,
        op: Opcode,
        res: Value,
        a: impl Into<Operand>,
        b: Option<Operand>,
    ) -> Inst {
        let mut args: SmallVec<[Arg; 2]> = SmallVec::new();
        args.push(Arg::new(a));
        if let Some(b) = b {
            args.push(Arg::new(b));
        }
        let res = self.make_res(res);
        let inst = self.create_inst(
            InstructionData::Assign { op },
            [res].into_iter().collect(),
            args,
        );
        self.append(inst)
    }

    /// Append an unconditional jump to `target`, which must be a label.
    pub fn emit_goto(&mut self, target: Inst) -> Inst {
        debug_assert!(self.insts[target].is_label(), "goto target must be a label");
        let inst = self.create_inst(
            InstructionData::Goto { target },
            SmallVec::new(),
            SmallVec::new(),
        );
        self.append(inst)
    }

    /// Append a conditional branch on `cond`.
    pub fn emit_branch(&mut self, cond: impl Into<Operand>, on_true: Inst, on_false: Inst) -> Inst {
        debug_assert!(
            self.insts[on_true].is_label() && self.insts[on_false].is_label(),
            "branch targets must be labels"
        );
        debug_assert!(on_true != on_false, "branch targets must be distinct");
        let inst = self.create_inst(
            InstructionData::Branch {
                cond: None,
                on_true,
                on_false,
            },
            SmallVec::new(),
            [Arg::new(cond)].into_iter().collect(),
        );
        self.append(inst)
    }

    /// Append `res = load base [+ index] + offset`.
    pub fn emit_load(
        &mut self,
        res: Value,
        base: Value,
        index: Option<Value>,
        offset: i32,
    ) -> Inst {
        let mut args: SmallVec<[Arg; 2]> = SmallVec::new();
        args.push(Arg::new(base));
        if let Some(ix) = index {
            args.push(Arg::new(ix));
        }
        let res = self.make_res(res);
        let inst = self.create_inst(
            InstructionData::Load { offset },
            [res].into_iter().collect(),
            args,
        );
        self.append(inst)
    }

    /// Append a store of `value`. A store through a stack variable defines
    /// a new name for it, passed as `res`.
    pub fn emit_store(
        &mut self,
        res: Option<Value>,
        value: impl Into<Operand>,
        base: Value,
        index: Option<Value>,
        offset: i32,
    ) -> Inst {
        let mut args: SmallVec<[Arg; 2]> = SmallVec::new();
        args.push(Arg::new(value));
        args.push(Arg::new(base));
        if let Some(ix) = index {
            args.push(Arg::new(ix));
        }
        let ress = match res {
            Some(r) => [self.make_res(r)].into_iter().collect(),
            None => SmallVec::new(),
        };
        let inst = self.create_inst(InstructionData::Store { offset }, ress, args);
        self.append(inst)
    }

    /// Append `res = cast a`.
    pub fn emit_cast(&mut self, res: Value, a: impl Into<Operand>) -> Inst {
        let res = self.make_res(res);
        let inst = self.create_inst(
            InstructionData::Cast,
            [res].into_iter().collect(),
            [Arg::new(a)].into_iter().collect(),
        );
        self.append(inst)
    }

    /// Append a call to `symbol`.
    pub fn emit_call(
        &mut self,
        symbol: impl Into<String>,
        ress: &[Value],
        args: &[Operand],
        vararg: bool,
    ) -> Inst {
        let ress = ress.iter().map(|&v| self.make_res(v)).collect();
        let args = args.iter().map(|&a| Arg::new(a)).collect();
        let inst = self.create_inst(
            InstructionData::Call {
                symbol: symbol.into(),
                vararg,
            },
            ress,
            args,
        );
        self.append(inst)
    }

    /// Append the `SetParams` projection declaring the parameters.
    pub fn emit_set_params(&mut self, params: &[Value]) -> Inst {
        self.params = params.to_vec();
        let ress = params.iter().map(|&v| self.make_res(v)).collect();
        let inst = self.create_inst(InstructionData::SetParams, ress, SmallVec::new());
        self.append(inst)
    }

    /// Append the `SetResults` projection consuming the results.
    pub fn emit_set_results(&mut self, results: &[Operand]) -> Inst {
        let args = results.iter().map(|&a| Arg::new(a)).collect();
        let inst = self.create_inst(InstructionData::SetResults, SmallVec::new(), args);
        self.append(inst)
    }

    /// Append an artificial use of `a`.
    pub fn emit_nop(&mut self, a: impl Into<Operand>) -> Inst {
        let inst = self.create_inst(
            InstructionData::Nop,
            SmallVec::new(),
            [Arg::new(a)].into_iter().collect(),
        );
        self.append(inst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering() {
        let mut func = Function::with_name("f", &[8, 16]);
        let a = func.new_reg(Type::Int32);
        let b = func.new_reg(Type::Int32);
        let s = func.new_ssa_reg(Type::Int32);
        assert_eq!(func.vars[a].number, -1);
        assert_eq!(func.vars[b].number, -2);
        assert_eq!(func.vars[s].number, 0);
        assert!(!func.vars[a].is_ssa());
        assert!(func.vars[s].is_ssa());
        assert_eq!(func.vars[b].pre_ssa_index(), 2);
    }

    #[test]
    fn clone_keeps_flavor() {
        let mut func = Function::with_name("f", &[8, 16]);
        let m = func.new_spilled_ssa_reg(Type::Real64);
        let c = func.clone_new_ssa(m);
        assert!(func.vars[c].is_spilled());
        assert_eq!(func.vars[c].ty, Type::Real64);
        assert_ne!(func.vars[c].number, func.vars[m].number);
    }
}
