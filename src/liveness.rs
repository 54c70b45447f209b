//! Liveness analysis over SSA form.
//!
//! For every variable, walk backwards from each use until the definition is
//! found, marking per-instruction and per-block live sets along the way.
//! Phi arguments propagate only along their recorded source block, which is
//! what keeps phi semantics coherent with the no-critical-edges invariant.

use crate::defuse::DefUse;
use crate::entity::SecondaryMap;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, Value};
use rustc_hash::FxHashSet;

/// A set of live variables.
pub type LiveSet = FxHashSet<Value>;

/// Liveness sets for a whole function. All sets are recomputable; previous
/// contents are cleared by `compute`.
#[derive(Default)]
pub struct Liveness {
    inst_live_in: SecondaryMap<Inst, LiveSet>,
    inst_live_out: SecondaryMap<Inst, LiveSet>,
    block_live_in: SecondaryMap<Block, LiveSet>,
    block_live_out: SecondaryMap<Block, LiveSet>,
    valid: bool,
}

impl Liveness {
    /// Allocate empty liveness info.
    pub fn new() -> Self {
        Self::default()
    }

    /// Has `compute` run since the last clear?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Variables live into `inst`.
    pub fn inst_live_in(&self, inst: Inst) -> &LiveSet {
        &self.inst_live_in[inst]
    }

    /// Variables live out of `inst`.
    pub fn inst_live_out(&self, inst: Inst) -> &LiveSet {
        &self.inst_live_out[inst]
    }

    /// Variables live into `block`.
    pub fn block_live_in(&self, block: Block) -> &LiveSet {
        &self.block_live_in[block]
    }

    /// Variables live out of `block`.
    pub fn block_live_out(&self, block: Block) -> &LiveSet {
        &self.block_live_out[block]
    }

    /// Is `inst` the last use of `v`: live in, but not live out?
    pub fn is_last_use(&self, inst: Inst, v: Value) -> bool {
        self.inst_live_in[inst].contains(&v) && !self.inst_live_out[inst].contains(&v)
    }

    /// Does `v` live through `inst`: live both in and out?
    pub fn lives_through(&self, inst: Inst, v: Value) -> bool {
        self.inst_live_in[inst].contains(&v) && self.inst_live_out[inst].contains(&v)
    }

    /// Recompute all live sets from the def-use information.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, defuse: &DefUse) {
        debug_assert!(defuse.is_valid());
        self.inst_live_in.clear();
        self.inst_live_out.clear();
        self.block_live_in.clear();
        self.block_live_out.clear();

        let values: Vec<Value> = func.vars.keys().collect();
        let mut walked: FxHashSet<Block> = FxHashSet::default();
        let mut stack: Vec<Block> = Vec::new();

        for v in values {
            walked.clear();
            for point in defuse.uses(v) {
                if func.insts[point.inst].is_phi() {
                    // A phi use is recorded in its argument's source block:
                    // the value is live out of that block, not live into
                    // the phi's own block.
                    stack.push(point.block);
                } else {
                    self.walk_up(func, cfg, v, point.inst, &mut stack);
                }

                // Drain pending live-out-at-block work.
                while let Some(block) = stack.pop() {
                    self.block_live_out[block].insert(v);
                    if !walked.insert(block) {
                        continue;
                    }
                    let last = func.layout.last_inst_of(block);
                    self.inst_live_out[last].insert(v);
                    if !func.insts[last].defines_value(v) {
                        self.walk_up(func, cfg, v, last, &mut stack);
                    }
                }
            }
        }
        self.valid = true;
    }

    /// `v` is live into `start`; walk backwards within the block, stopping
    /// at `v`'s definition or queueing the predecessors at the block head.
    fn walk_up(
        &mut self,
        func: &Function,
        cfg: &ControlFlowGraph,
        v: Value,
        start: Inst,
        stack: &mut Vec<Block>,
    ) {
        let mut inst = start;
        loop {
            self.inst_live_in[inst].insert(v);

            let block = func.layout.inst_block(inst).expect("untagged instruction");
            if func.layout.block(block).begin == inst {
                // Reached the leading label: live into the whole block.
                self.inst_live_out[inst].insert(v);
                self.block_live_in[block].insert(v);
                for &pred in cfg.preds(block) {
                    stack.push(pred);
                }
                return;
            }

            let prev = func
                .layout
                .prev_inst(inst)
                .expect("non-label without predecessor instruction");
            self.inst_live_out[prev].insert(v);
            if func.insts[prev].defines_value(v) {
                return;
            }
            inst = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_build::build_cfg;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::{Function, InstructionData, Opcode, Type};
    use crate::ssa;
    use smallvec::SmallVec;

    /// A value defined in the entry, used after a diamond join, must be
    /// live through both arms.
    #[test]
    fn live_through_diamond() {
        let mut func = Function::with_name("f", &[8, 16]);
        let c = func.new_reg(Type::Bool);
        let a = func.new_reg(Type::Int32);
        let x = func.new_reg(Type::Int32);

        func.emit_label();
        let then_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let else_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let join_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let end_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());

        let seven = func.new_const(Type::Int32, 7);
        func.emit_assign(Opcode::Mov, a, seven, None);
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
        // Join uses both the merged x and the entry-defined a.
        let s = func.new_reg(Type::Int32);
        func.emit_assign(Opcode::Add, s, x, Some(crate::ir::Operand::Value(a)));
        func.layout.push_back(end_l);

        let mut cfg = ControlFlowGraph::new();
        build_cfg(&mut func, &mut cfg);
        let mut dt = DominatorTree::new();
        dt.compute(&func, &cfg);
        ssa::construct_ssa(&mut func, &cfg, &dt);

        let mut defuse = DefUse::new();
        defuse.compute(&func, &dt);
        let mut live = Liveness::new();
        live.compute(&func, &cfg, &defuse);

        let entry = func.entry.expand().unwrap();
        let arms = cfg.succs(entry).to_vec();
        let join = *cfg.succs(arms[0]).first().unwrap();

        // The SSA name of `a` flows through both arms into the join.
        let a_ssa = live
            .block_live_in(join)
            .iter()
            .copied()
            .find(|&v| {
                func.vars[v].ty == Type::Int32 && live.block_live_in(arms[0]).contains(&v)
            })
            .expect("a's SSA name must be live into the join");
        assert!(live.block_live_out(arms[0]).contains(&a_ssa));
        assert!(live.block_live_out(arms[1]).contains(&a_ssa));
        assert!(live.block_live_in(arms[1]).contains(&a_ssa));

        // The phi sources are live out of their arm but not live into the
        // join block itself.
        let phi = func.layout.block_phis(join).next().expect("phi at join");
        for (i, arg) in func.insts[phi].args.clone().iter().enumerate() {
            let src = func.insts[phi].phi_source(i).unwrap();
            let v = arg.operand.value().expect("phi argument must be a value");
            assert!(live.block_live_out(src).contains(&v));
            assert!(!live.block_live_in(join).contains(&v) || v == a_ssa);
        }
    }
}
