//! Def-use analysis: the unique definition site and the list of use sites
//! of every SSA variable.
//!
//! Uses are found by walking the dominator subtree below the definition,
//! since in SSA form every non-phi use is dominated by its def. Phi
//! argument occurrences are recorded afterwards, each in its argument's
//! *source block*: a phi reads the argument at the end of the predecessor
//! it flows in from, not in its own block, and the recorded block says so.

use crate::entity::packed_option::PackedOption;
use crate::entity::SecondaryMap;
use crate::dominator_tree::DominatorTree;
use crate::ir::{Block, Function, Inst, Value};

/// One definition or use site.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DefUsePoint {
    /// The instruction defining or reading the variable.
    pub inst: Inst,
    /// The block the def or use takes effect in. For a phi-argument use
    /// this is the argument's source block, where the value must be live
    /// at the block end; for everything else it is the block of `inst`.
    pub block: Block,
}

/// Recomputable def-use information for a whole function.
#[derive(Default)]
pub struct DefUse {
    def: SecondaryMap<Value, PackedOption<Inst>>,
    def_block: SecondaryMap<Value, PackedOption<Block>>,
    uses: SecondaryMap<Value, Vec<DefUsePoint>>,
    valid: bool,
}

impl DefUse {
    /// Allocate empty def-use info.
    pub fn new() -> Self {
        Self::default()
    }

    /// Has `compute` run since the last clear?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The definition site of `v`, if it has one.
    pub fn def_point(&self, v: Value) -> Option<DefUsePoint> {
        let inst = self.def[v].expand()?;
        Some(DefUsePoint {
            inst,
            block: self.def_block[v].expand().unwrap(),
        })
    }

    /// All recorded uses of `v`.
    pub fn uses(&self, v: Value) -> &[DefUsePoint] {
        &self.uses[v]
    }

    /// Recompute everything from scratch.
    pub fn compute(&mut self, func: &Function, domtree: &DominatorTree) {
        self.def.clear();
        self.def_block.clear();
        self.uses.clear();

        self.compute_defs(func);
        self.compute_uses(func, domtree);
        self.valid = true;
    }

    /// One linear pass recording the unique definition of each variable.
    fn compute_defs(&mut self, func: &Function) {
        for inst in func.layout.insts() {
            let instr = &func.insts[inst];
            if instr.is_label() {
                continue;
            }
            let block = func.layout.inst_block(inst).expect("untagged instruction");
            for res in &instr.ress {
                debug_assert!(
                    self.def[res.value].is_none(),
                    "{} defined twice; function is not in SSA form",
                    res.value
                );
                self.def[res.value] = inst.into();
                self.def_block[res.value] = block.into();
            }
        }
    }

    /// Walk the dominator subtree below each def collecting ordinary uses,
    /// then register phi arguments.
    fn compute_uses(&mut self, func: &Function, domtree: &DominatorTree) {
        let values: Vec<Value> = func.vars.keys().collect();
        for v in values {
            let def_block = match self.def_block[v].expand() {
                Some(b) => b,
                None => continue, // dead table entry, e.g. a renamed-away name
            };
            let mut stack = vec![def_block];
            while let Some(block) = stack.pop() {
                for inst in func.layout.block_ordinary(block) {
                    if func.insts[inst].uses_value(v) {
                        self.uses[v].push(DefUsePoint { inst, block });
                    }
                }
                stack.extend(domtree.children(block).iter().copied());
            }
        }

        for block in func.layout.blocks() {
            let phis: Vec<Inst> = func.layout.block_phis(block).collect();
            for phi in phis {
                let nargs = func.insts[phi].args.len();
                for i in 0..nargs {
                    if let Some(v) = func.insts[phi].args[i].operand.value() {
                        let src = func.insts[phi]
                            .phi_source(i)
                            .expect("phi argument without source block");
                        self.uses[v].push(DefUsePoint { inst: phi, block: src });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_build::build_cfg;
    use crate::flowgraph::ControlFlowGraph;
    use crate::ir::{InstructionData, Opcode, Type};
    use crate::ssa::construct_ssa;
    use smallvec::SmallVec;

    /// A phi argument is a use at the end of its source predecessor: the
    /// recorded block must be the arm the value flows in from, never the
    /// join block holding the phi.
    #[test]
    fn phi_uses_recorded_in_source_block() {
        let mut func = Function::with_name("f", &[8, 16]);
        let c = func.new_reg(Type::Bool);
        let x = func.new_reg(Type::Int32);

        func.emit_label();
        let then_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let else_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let join_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let end_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());

        let t = func.new_const(Type::Bool, 1);
        func.emit_assign(Opcode::Mov, c, t, None);
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
        func.emit_nop(x);
        func.layout.push_back(end_l);

        let mut cfg = ControlFlowGraph::new();
        build_cfg(&mut func, &mut cfg);
        let mut domtree = crate::dominator_tree::DominatorTree::new();
        domtree.compute(&func, &cfg);
        construct_ssa(&mut func, &cfg, &domtree);

        let mut defuse = DefUse::new();
        defuse.compute(&func, &domtree);

        let join = func.layout.inst_block(join_l).unwrap();
        let phi = func.layout.block_phis(join).next().expect("phi at join");
        for (i, arg) in func.insts[phi].args.clone().iter().enumerate() {
            let v = arg.operand.value().expect("phi argument must be a value");
            let src = func.insts[phi].phi_source(i).unwrap();
            let phi_use = defuse
                .uses(v)
                .iter()
                .find(|u| u.inst == phi)
                .expect("phi argument use not recorded");
            assert_eq!(phi_use.block, src, "phi use must live in its source block");
            assert_ne!(phi_use.block, join, "phi use must not live in the join block");
        }
    }
}
