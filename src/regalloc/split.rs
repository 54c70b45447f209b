//! Live-range splitting at register-constrained instructions.
//!
//! The constrained coloring path wants every constrained instruction at the
//! top of its own block with nothing live into it except through phis: each
//! live range crossing the instruction is cut by a one-argument phi, so the
//! coloring below the cut is free to move values between registers.
//!
//! Splitting inserts blocks, so the caller must recompute dominance before
//! applying the returned SSA repair records through
//! [`crate::ssa::reconstruct_ssa`].

use crate::cfg_build::split_block;
use crate::defuse::{DefUse, DefUsePoint};
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, InstructionData, Value};
use crate::liveness::Liveness;
use crate::ssa::VarDefUse;
use log::debug;
use std::collections::BTreeMap;

/// Split every block so that constrained instructions lead their block,
/// inserting one single-argument phi per live-in variable. Returns the SSA
/// repair records, keyed by the variable they repair.
pub fn split_live_ranges(
    func: &mut Function,
    cfg: &mut ControlFlowGraph,
    liveness: &Liveness,
    defuse: &DefUse,
) -> BTreeMap<Value, VarDefUse> {
    let mut records: BTreeMap<Value, VarDefUse> = BTreeMap::new();

    let insts: Vec<Inst> = func.layout.insts().collect();
    for inst in insts {
        let instr = &func.insts[inst];
        if instr.is_label() || instr.is_phi() || !instr.is_constrained() {
            continue;
        }
        let block = func.layout.inst_block(inst).expect("untagged instruction");
        split_at(func, cfg, liveness, defuse, &mut records, inst, block);
    }
    records
}

fn split_at(
    func: &mut Function,
    cfg: &mut ControlFlowGraph,
    liveness: &Liveness,
    defuse: &DefUse,
    records: &mut BTreeMap<Value, VarDefUse>,
    inst: Inst,
    block: Block,
) {
    // Cut the block unless the instruction already leads it with a single
    // incoming edge.
    let begin = func.layout.block(block).begin;
    let leads_block = func.layout.prev_inst(inst) == Some(begin);
    let live_in_empty = liveness.inst_live_in(inst).is_empty();
    let block = if !leads_block || (cfg.num_preds(block) > 1 && !live_in_empty) {
        split_block(func, cfg, block, inst);
        func.layout.inst_block(inst).expect("untagged instruction")
    } else {
        block
    };

    if live_in_empty {
        return;
    }
    debug_assert_eq!(
        cfg.num_preds(block),
        1,
        "split block must have exactly one predecessor"
    );
    let pred = cfg.preds(block)[0];

    // One phi per live-in variable. The argument slot starts out naming the
    // phi's own result; SSA reconstruction rewires it through the
    // predecessor once dominance is fresh again.
    let mut live: Vec<Value> = liveness.inst_live_in(inst).iter().copied().collect();
    live.sort_unstable();

    for var in live {
        let fresh = func.clone_new_ssa(var);
        let old_number = func.vars[fresh].number;
        let phi = func.make_phi(fresh, old_number, 1);
        match &mut func.insts[phi].data {
            InstructionData::Phi { sources } => sources[0] = pred.into(),
            _ => unreachable!(),
        }
        func.insts[phi].args[0].operand = fresh.into();
        let begin = func.layout.block(block).begin;
        func.insert_inst_after(phi, begin);
        debug!("range split: {} -> {} at {}", var, fresh, block);

        let vdu = records.entry(var).or_insert_with(|| {
            let mut vdu = VarDefUse::new();
            let orig = defuse.def_point(var).expect("live-in without definition");
            vdu.defs.push((var, orig));
            vdu.uses
                .extend(defuse.uses(var).iter().map(|&p| (var, p)));
            vdu
        });
        vdu.defs.push((fresh, DefUsePoint { inst: phi, block }));
        // The phi's argument slot is a use at the end of the predecessor.
        vdu.uses.push((fresh, DefUsePoint { inst: phi, block: pred }));
    }

    debug_assert!(
        func.block_has_constrained_head(block),
        "constrained instruction must lead its block after splitting"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_build::build_cfg;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::{InstructionData, Opcode, Operand, Type};
    use crate::ssa::{construct_ssa, reconstruct_ssa};
    use smallvec::SmallVec;

    /// A phi-free join: both arms jump to a block whose first ordinary
    /// instruction is constrained and reads a value defined above the
    /// diamond. The join must still be cut — two predecessors consolidated
    /// onto an interposed block, one single-argument phi per live-in value
    /// — so the constrained coloring path sees an empty block live-in.
    #[test]
    fn splits_phi_free_join_with_constrained_head() {
        let mut func = Function::with_name("j", &[8, 16]);
        let c = func.new_reg(Type::Bool);
        let v = func.new_reg(Type::Int32);

        func.emit_label();
        let left_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let right_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let join_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let end_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());

        let t = func.new_const(Type::Bool, 1);
        func.emit_assign(Opcode::Mov, c, t, None);
        let seven = func.new_const(Type::Int32, 7);
        func.emit_assign(Opcode::Mov, v, seven, None);
        func.emit_branch(c, left_l, right_l);
        func.layout.push_back(left_l);
        func.emit_goto(join_l);
        func.layout.push_back(right_l);
        func.emit_goto(join_l);
        func.layout.push_back(join_l);
        let sr = func.emit_set_results(&[Operand::Value(v)]);
        func.layout.push_back(end_l);

        let mut cfg = ControlFlowGraph::new();
        build_cfg(&mut func, &mut cfg);
        let mut domtree = DominatorTree::new();
        domtree.compute(&func, &cfg);
        construct_ssa(&mut func, &cfg, &domtree);

        // Pin the result operand the way register targeting would.
        func.insts[sr].args[0].constraint = Some(0);

        let join = func.layout.inst_block(sr).unwrap();
        assert_eq!(cfg.num_preds(join), 2);
        assert!(!func.block_has_phis(join));

        let mut defuse = DefUse::new();
        defuse.compute(&func, &domtree);
        let mut liveness = Liveness::new();
        liveness.compute(&func, &cfg, &defuse);
        assert!(!liveness.inst_live_in(sr).is_empty());

        let mut records = split_live_ranges(&mut func, &mut cfg, &liveness, &defuse);
        domtree.compute(&func, &cfg);
        for vdu in records.values_mut() {
            reconstruct_ssa(&mut func, &cfg, &domtree, vdu);
        }

        // The constrained instruction now leads a single-predecessor block
        // fed through one phi, and its use was rewired to the phi result.
        let bottom = func.layout.inst_block(sr).unwrap();
        assert_eq!(cfg.num_preds(bottom), 1);
        assert!(func.block_has_constrained_head(bottom));
        let phis: Vec<_> = func.layout.block_phis(bottom).collect();
        assert_eq!(phis.len(), 1);
        assert_eq!(
            func.insts[sr].args[0].operand,
            Operand::Value(func.insts[phis[0]].phi_result())
        );
    }
}
