//! SSA construction and SSA reconstruction.
//!
//! Construction turns the front end's pre-SSA names (negative variable
//! numbers) into unique SSA names: iterated-dominance-frontier phi
//! placement followed by a renaming walk of the dominator tree.
//!
//! Reconstruction repairs SSA form after a pass has inserted new
//! definitions for an existing variable: given the new defs and the uses
//! that may now refer to any of them, it rewrites each use to the nearest
//! dominating definition, materializing fresh phis in the iterated
//! dominance frontier as needed.

use crate::defuse::DefUsePoint;
use crate::dominator_tree::DominatorTree;
use crate::entity::SecondaryMap;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, InstructionData, Operand, Value};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Construct SSA form: place phis for every pre-SSA variable, then rename.
///
/// Afterwards every use is dominated by its def, every phi argument's
/// source block matches the recorded predecessor, and no pre-SSA name
/// occurs in the instruction stream.
pub fn construct_ssa(func: &mut Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
    place_phis(func, cfg, domtree);
    rename_vars(func, cfg, domtree);

    #[cfg(debug_assertions)]
    for inst in func.layout.insts().collect::<Vec<_>>() {
        let instr = &func.insts[inst];
        for res in &instr.ress {
            debug_assert!(func.vars[res.value].is_ssa(), "pre-SSA def survived");
        }
        for arg in &instr.args {
            if let Some(v) = arg.operand.value() {
                debug_assert!(func.vars[v].is_ssa(), "pre-SSA use survived");
            }
        }
    }
}

/// Place a phi for variable `v` at the entry of every block in the
/// iterated dominance frontier of the blocks assigning `v`.
fn place_phis(func: &mut Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
    // Collect, per pre-SSA variable, the blocks that assign it, plus the
    // first assigning block in stream order.
    let mut def_blocks: FxHashMap<Value, Vec<Block>> = FxHashMap::default();
    let mut first_def: FxHashMap<Value, Block> = FxHashMap::default();
    for inst in func.layout.insts().collect::<Vec<_>>() {
        let block = match func.layout.inst_block(inst) {
            Some(b) => b,
            None => continue,
        };
        for res in func.insts[inst].ress.clone() {
            let v = res.value;
            if func.vars[v].is_ssa() {
                continue;
            }
            let blocks = def_blocks.entry(v).or_default();
            if !blocks.contains(&block) {
                blocks.push(block);
            }
            first_def.entry(v).or_insert(block);
        }
    }

    // Iteration stamps instead of per-variable clearing.
    let mut has_already: SecondaryMap<Block, u32> = SecondaryMap::new();
    let mut has_been_added: SecondaryMap<Block, u32> = SecondaryMap::new();
    let mut iter_count = 0u32;

    let mut vars: Vec<Value> = def_blocks.keys().copied().collect();
    vars.sort_unstable();

    for v in vars {
        iter_count += 1;
        let old_number = func.vars[v].number;

        let mut work: Vec<Block> = Vec::new();
        for &b in &def_blocks[&v] {
            has_been_added[b] = iter_count;
            work.push(b);
        }

        // The variable is dead above its first definition; the frontier of
        // the first assigning block needs no phi.
        if let Some(&first) = first_def.get(&v) {
            for &df in domtree.frontier(first) {
                has_already[df] = iter_count;
            }
        }

        while let Some(b) = work.pop() {
            for &df in domtree.frontier(b).to_vec().iter() {
                if has_already[df] >= iter_count {
                    continue;
                }
                let phi = func.make_phi(v, old_number, cfg.num_preds(df));
                let begin = func.layout.block(df).begin;
                func.insert_inst_after(phi, begin);

                has_already[df] = iter_count;
                if has_been_added[df] < iter_count {
                    has_been_added[df] = iter_count;
                    work.push(df);
                }
            }
        }
    }
}

/// Rename every pre-SSA variable along a pre-order walk of the dominator
/// tree, one name stack per variable number.
fn rename_vars(func: &mut Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
    let entry = match func.entry.expand() {
        Some(e) => e,
        None => return,
    };
    let mut names: FxHashMap<i32, Vec<Value>> = FxHashMap::default();
    rename_block(func, cfg, domtree, entry, &mut names);
}

fn rename_block(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    block: Block,
    names: &mut FxHashMap<i32, Vec<Value>>,
) {
    let insts: Vec<Inst> = func.layout.block_insts(block).skip(1).collect();

    for &inst in &insts {
        // Rewrite argument occurrences, except in phis: their slots are
        // filled from the predecessors.
        if !func.insts[inst].is_phi() {
            for i in 0..func.insts[inst].args.len() {
                let op = func.insts[inst].args[i].operand;
                if let Some(v) = op.value() {
                    if !func.vars[v].is_ssa() {
                        let number = func.vars[v].number;
                        let top = names
                            .get(&number)
                            .and_then(|s| s.last())
                            .copied()
                            .expect("use without dominating definition; program is malformed");
                        func.insts[inst].args[i].operand = Operand::Value(top);
                    }
                }
            }
        }

        // Push a fresh SSA name for each pre-SSA result (phis included).
        for i in 0..func.insts[inst].ress.len() {
            let old = func.insts[inst].ress[i].value;
            if !func.vars[old].is_ssa() {
                let fresh = func.clone_new_ssa(old);
                let old_number = func.insts[inst].ress[i].old_number;
                names.entry(old_number).or_default().push(fresh);
                func.insts[inst].ress[i].value = fresh;
            }
        }
    }

    // Fill the matching phi argument slot of every successor.
    for &succ in cfg.succs(block) {
        let j = cfg.pred_index(succ, block);
        let phis: Vec<Inst> = func.layout.block_phis(succ).collect();
        for phi in phis {
            let old_number = func.insts[phi].ress[0].old_number;
            let top = names.get(&old_number).and_then(|s| s.last()).copied();
            let operand = match top {
                Some(v) => Operand::Value(v),
                // No definition reaches this edge; a well-typed unknown
                // keeps the program strictly in SSA form.
                None => Operand::Undef(func.vars[func.insts[phi].ress[0].value].ty),
            };
            func.insts[phi].args[j].operand = operand;
            match &mut func.insts[phi].data {
                InstructionData::Phi { sources } => sources[j] = block.into(),
                _ => unreachable!(),
            }
        }
    }

    for &child in domtree.children(block) {
        rename_block(func, cfg, domtree, child, names);
    }

    // Leaving the block: pop what was pushed here.
    for &inst in &insts {
        for i in 0..func.insts[inst].ress.len() {
            let old_number = func.insts[inst].ress[i].old_number;
            if old_number < 0 {
                names
                    .get_mut(&old_number)
                    .expect("nothing to pop")
                    .pop()
                    .expect("nothing to pop");
            }
        }
    }
}

/// The record handed to SSA reconstruction: a set of definitions of "the
/// same" variable and the uses that may now refer to any of them.
#[derive(Default)]
pub struct VarDefUse {
    /// Definition sites, including the original one where applicable.
    /// Reconstruction appends the phis it materializes.
    pub defs: Vec<(Value, DefUsePoint)>,
    /// Use sites to be rewritten.
    pub uses: Vec<(Value, DefUsePoint)>,
}

impl VarDefUse {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Repair SSA form for the variables recorded in `vdu`.
pub fn reconstruct_ssa(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    vdu: &mut VarDefUse,
) {
    let def_blocks: FxHashSet<Block> = vdu.defs.iter().map(|(_, p)| p.block).collect();
    let idf = domtree.iterated_dom_frontier(def_blocks.iter().copied());

    let mut def_set: FxHashSet<Value> = vdu.defs.iter().map(|(v, _)| *v).collect();

    let entry = func.entry.expand().expect("no entry block");
    for u in 0..vdu.uses.len() {
        let (_, point) = vdu.uses[u];
        let nargs = func.insts[point.inst].args.len();
        for i in 0..nargs {
            let arg = func.insts[point.inst].args[i].operand;
            let v = match arg.value() {
                Some(v) => v,
                None => continue,
            };
            if !def_set.contains(&v) {
                continue;
            }
            let found = find_def(
                func,
                cfg,
                domtree,
                entry,
                i,
                point.inst,
                point.block,
                vdu,
                &idf,
                &mut def_set,
            );
            func.insts[point.inst].args[i].operand = Operand::Value(found);
        }
    }
}

/// Find the definition reaching argument slot `slot` of `inst`, creating
/// phis in the iterated dominance frontier on the way.
#[allow(clippy::too_many_arguments)]
fn find_def(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    entry: Block,
    slot: usize,
    inst: Inst,
    block: Block,
    vdu: &mut VarDefUse,
    idf: &FxHashSet<Block>,
    def_set: &mut FxHashSet<Value>,
) -> Value {
    let mut block = block;
    let mut cursor: Inst;

    if func.insts[inst].is_phi() {
        // A phi use takes effect at the end of the argument's source block.
        block = func.insts[inst]
            .phi_source(slot)
            .expect("phi argument without source block");
        cursor = func.layout.last_inst_of(block);
    } else {
        cursor = inst;
    }

    loop {
        // Scan backwards through the block for one of the definitions.
        let begin = func.layout.block(block).begin;
        let mut i = cursor;
        while i != begin {
            for res in &func.insts[i].ress {
                if def_set.contains(&res.value) {
                    return res.value;
                }
            }
            i = func.layout.prev_inst(i).expect("walked past stream start");
        }

        if idf.contains(&block) {
            // Materialize a phi whose arguments are resolved lazily through
            // each predecessor; recursion terminates because each new phi
            // sits strictly higher in the dominator tree than its uses.
            debug_assert!(
                cfg.num_preds(block) > 1,
                "iterated dominance frontier block must be a join"
            );
            let template = vdu.defs[0].0;
            let fresh = func.clone_new_ssa(template);
            let old_number = func.vars[fresh].number;
            let preds: SmallVec<[Block; 4]> = cfg.preds(block).iter().copied().collect();
            let phi = func.make_phi(fresh, old_number, preds.len());
            match &mut func.insts[phi].data {
                InstructionData::Phi { sources } => {
                    for (j, &p) in preds.iter().enumerate() {
                        sources[j] = p.into();
                    }
                }
                _ => unreachable!(),
            }
            let begin = func.layout.block(block).begin;
            func.insert_inst_after(phi, begin);

            vdu.defs.push((fresh, DefUsePoint { inst: phi, block }));
            def_set.insert(fresh);

            for j in 0..preds.len() {
                let arg = find_def(
                    func, cfg, domtree, entry, j, phi, block, vdu, idf, def_set,
                );
                func.insts[phi].args[j].operand = Operand::Value(arg);
            }
            return fresh;
        }

        assert!(block != entry, "no reaching definition; unreachable code?");
        block = domtree.idom(block).expect("idom chain ended early");
        cursor = func.layout.last_inst_of(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_build::build_cfg;
    use crate::ir::{Opcode, Type};

    /// Diamond setting `x` differently in each arm and reading it at the
    /// join: SSA construction must merge through exactly one two-source phi.
    #[test]
    fn diamond_gets_one_phi() {
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
        let mut dt = DominatorTree::new();
        dt.compute(&func, &cfg);
        construct_ssa(&mut func, &cfg, &dt);

        let entry = func.entry.expand().unwrap();
        let arms = cfg.succs(entry).to_vec();
        let join = *cfg.succs(arms[0]).first().unwrap();

        let phis: Vec<Inst> = func.layout.block_phis(join).collect();
        assert_eq!(phis.len(), 1);
        let phi = &func.insts[phis[0]];
        assert_eq!(phi.args.len(), 2);

        // Source blocks are a permutation of the predecessors.
        let mut sources: Vec<Block> = (0..2).map(|i| phi.phi_source(i).unwrap()).collect();
        sources.sort_unstable();
        let mut preds: Vec<Block> = cfg.preds(join).to_vec();
        preds.sort_unstable();
        assert_eq!(sources, preds);

        // The use at the join was rewritten to the phi result.
        let nop = func
            .layout
            .block_ordinary(join)
            .find(|&i| matches!(func.insts[i].data, InstructionData::Nop))
            .unwrap();
        assert_eq!(
            func.insts[nop].args[0].operand,
            Operand::Value(phi.phi_result())
        );
    }

    /// Every use must be dominated by its definition after construction.
    #[test]
    fn uses_dominated_by_defs() {
        let mut func = Function::with_name("g", &[8, 16]);
        let c = func.new_reg(Type::Bool);
        let x = func.new_reg(Type::Int32);

        // A little loop: x updated in the body, read after the loop.
        func.emit_label();
        let head_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let body_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let exit_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());

        let zero = func.new_const(Type::Int32, 0);
        func.emit_assign(Opcode::Mov, x, zero, None);
        let t = func.new_const(Type::Bool, 1);
        func.emit_assign(Opcode::Mov, c, t, None);
        func.layout.push_back(head_l);
        func.emit_branch(c, body_l, exit_l);
        func.layout.push_back(body_l);
        let one = func.new_const(Type::Int32, 1);
        func.emit_assign(Opcode::Add, x, x, Some(Operand::Constant(one)));
        func.emit_goto(head_l);
        func.layout.push_back(exit_l);
        func.emit_nop(x);
        let end_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        func.layout.push_back(end_l);

        let mut cfg = ControlFlowGraph::new();
        build_cfg(&mut func, &mut cfg);
        let mut dt = DominatorTree::new();
        dt.compute(&func, &cfg);
        construct_ssa(&mut func, &cfg, &dt);

        let mut defuse = crate::defuse::DefUse::new();
        defuse.compute(&func, &dt);

        for v in func.vars.keys().collect::<Vec<_>>() {
            let def = match defuse.def_point(v) {
                Some(d) => d,
                None => continue,
            };
            for u in defuse.uses(v) {
                if func.insts[u.inst].is_phi() {
                    continue;
                }
                assert!(
                    dt.inst_dominates(&func, def.inst, u.inst),
                    "use of {} not dominated by its def",
                    v
                );
            }
        }
    }
}
