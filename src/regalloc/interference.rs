//! Interference queries without an interference graph.
//!
//! Two SSA variables interfere if one is live at the definition of the
//! other. On SSA form this can be decided from dominance and liveness
//! alone, so the coalescer asks these questions on demand instead of
//! materializing a graph.

use crate::defuse::DefUse;
use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, RegClass, Value};
use crate::liveness::Liveness;
use rustc_hash::FxHashSet;

/// Do `x` and `y` interfere?
pub fn interference_check(
    func: &Function,
    domtree: &DominatorTree,
    liveness: &Liveness,
    defuse: &DefUse,
    x: Value,
    y: Value,
) -> bool {
    debug_assert!(x != y, "variables must be distinct");
    let dx = defuse.def_point(x).expect("x has no definition");
    let dy = defuse.def_point(y).expect("y has no definition");

    // Order the pair so `top` dominates `bottom`; non-ordered defs cannot
    // interfere on SSA form.
    let (top, bottom, db) = if domtree.inst_dominates(func, dx.inst, dy.inst) {
        (x, y, dy)
    } else if domtree.inst_dominates(func, dy.inst, dx.inst) {
        (y, x, dx)
    } else {
        return false;
    };

    if liveness.block_live_out(db.block).contains(&top) {
        return true;
    }

    // `top` is live at `bottom`'s def iff some use of `top` is dominated by
    // that def. A phi use takes effect at the end of its recorded source
    // block, not at the phi instruction in the join.
    for ut in defuse.uses(top) {
        let use_inst = if func.insts[ut.inst].is_phi() {
            func.layout.last_inst_of(ut.block)
        } else {
            ut.inst
        };
        if domtree.inst_dominates(func, db.inst, use_inst) {
            return true;
        }
    }
    false
}

/// Does `v` match the (class, spilled) filter of the current coalescing
/// round?
fn matches(func: &Function, v: Value, class: RegClass, spilled: bool) -> bool {
    let data = &func.vars[v];
    data.is_reg_of_class(class) && data.is_spilled() == spilled
}

/// The set of variables that are live simultaneously with `v`, restricted
/// to registers of `class` with the given spill state. `v` itself is never
/// in the result; constrained operands of instructions in the overlap
/// region are included.
pub fn int_neighbors(
    func: &Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    liveness: &Liveness,
    defuse: &DefUse,
    v: Value,
    class: RegClass,
    spilled: bool,
) -> FxHashSet<Value> {
    let mut result = FxHashSet::default();
    let mut walked = FxHashSet::default();
    for u in defuse.uses(v) {
        find_int(
            func, cfg, domtree, liveness, defuse, v, u.block, class, spilled, &mut result,
            &mut walked,
        );
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn find_int(
    func: &Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    liveness: &Liveness,
    defuse: &DefUse,
    v: Value,
    block: Block,
    class: RegClass,
    spilled: bool,
    result: &mut FxHashSet<Value>,
    walked: &mut FxHashSet<Block>,
) {
    walked.insert(block);

    let last = func.layout.last_inst_of(block);
    let mut live: FxHashSet<Value> = liveness
        .inst_live_out(last)
        .iter()
        .copied()
        .filter(|&u| matches(func, u, class, spilled))
        .collect();

    if live.contains(&v) {
        result.extend(live.iter().copied().filter(|&u| u != v));
    }

    // Scan the ordinary region backwards maintaining the live set; stop at
    // the block head, at `v`'s own definition, or at the phi region.
    let def_inst = defuse.def_point(v).map(|p| p.inst);
    let begin = func.layout.block(block).begin;
    let mut cursor = Some(last);
    while let Some(inst) = cursor {
        if inst == begin || Some(inst) == def_inst || func.insts[inst].is_phi() {
            break;
        }
        let instr = &func.insts[inst];
        for res in &instr.ress {
            live.remove(&res.value);
        }
        for arg in &instr.args {
            if let Some(u) = arg.operand.value() {
                if matches(func, u, class, spilled) {
                    live.insert(u);
                }
            }
        }

        if live.contains(&v) {
            result.extend(live.iter().copied().filter(|&u| u != v));
            if instr.is_constrained() {
                for res in &instr.ress {
                    if res.constraint.is_some() && matches(func, res.value, class, spilled) {
                        result.insert(res.value);
                    }
                }
                for arg in &instr.args {
                    if let (Some(u), true) = (arg.operand.value(), arg.constraint.is_some()) {
                        if u != v && matches(func, u, class, spilled) {
                            result.insert(u);
                        }
                    }
                }
            }
        }
        cursor = func.layout.prev_inst(inst);
    }

    // Continue into predecessors where `v` is still live, i.e. those whose
    // end is dominated by `v`'s definition.
    let def = match defuse.def_point(v) {
        Some(d) => d,
        None => return,
    };
    for &pred in cfg.preds(block) {
        if walked.contains(&pred) {
            continue;
        }
        let pred_last = func.layout.last_inst_of(pred);
        if domtree.inst_dominates(func, def.inst, pred_last) {
            find_int(
                func, cfg, domtree, liveness, defuse, v, pred, class, spilled, result, walked,
            );
        }
    }
}
