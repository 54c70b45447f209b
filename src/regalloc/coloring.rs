//! SSA-aware register coloring.
//!
//! On SSA form with the chordal interference structure the greedy scheme is
//! exact: walk the dominator tree in pre-order, seed the occupied set from
//! the block's live-in colors, free a color at the last use of its holder
//! and hand the lowest free color to each result, preferring a color that
//! was freed at the very same instruction so copies tend to disappear.
//!
//! Blocks led by a constrained instruction take a separate path that
//! honours the per-operand register constraints first and fits everything
//! else around them.
//!
//! Spill slots are colored by the same walk over a dense integer domain,
//! registering every slot in the function's stack layout.

use crate::dominator_tree::DominatorTree;
use crate::ir::{Block, Color, Function, Inst, InstructionData, RegClass, RegUnit, Value, VarKind};
use crate::liveness::Liveness;
use crate::regalloc::register_set::RegisterSet;
use log::debug;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// Color every register variable of `class` from `reservoir`.
pub fn color_registers(
    func: &mut Function,
    domtree: &DominatorTree,
    liveness: &Liveness,
    class: RegClass,
    reservoir: RegisterSet,
) {
    let entry = func.entry.expand().expect("no entry block");
    for block in domtree.pre_order(entry) {
        color_block(func, liveness, class, reservoir, block);
    }
}

fn participates(func: &Function, v: Value, class: RegClass) -> bool {
    func.vars[v].colorable_reg(class)
}

fn assigned(func: &Function, v: Value) -> RegUnit {
    match func.vars[v].color {
        Color::Reg(ru) => ru,
        c => panic!("{} has no register color: {:?}", v, c),
    }
}

fn set_color(func: &mut Function, v: Value, ru: RegUnit) {
    func.vars[v].color = Color::Reg(ru);
    func.used_colors.insert(ru);
}

fn color_block(
    func: &mut Function,
    liveness: &Liveness,
    class: RegClass,
    reservoir: RegisterSet,
    block: Block,
) {
    // Colors occupied at the current program point.
    let mut colors = RegisterSet::empty();
    let start: Option<Inst>;

    if func.block_has_constrained_head(block) {
        let head = func.layout.block(block).first_ordinary.expand().unwrap();
        debug_assert!(
            !liveness
                .block_live_in(block)
                .iter()
                .any(|&v| participates(func, v, class)),
            "block live-in of class must be empty at a constrained head; \
             live-range splitting must cut every crossing range"
        );

        let mut already_colored: FxHashSet<Value> = FxHashSet::default();
        color_constrained_inst(func, liveness, class, reservoir, head, &mut already_colored);

        // Colors the phi region above must not reuse.
        let mut occupied = RegisterSet::empty();
        let args: SmallVec<[Value; 4]> = func.insts[head]
            .args
            .iter()
            .filter_map(|a| a.operand.value())
            .filter(|&v| participates(func, v, class))
            .collect();
        for v in args {
            let ru = assigned(func, v);
            occupied.insert(ru);
            if liveness.lives_through(head, v) {
                colors.insert(ru);
            }
        }
        let ress: SmallVec<[Value; 4]> = func.insts[head]
            .ress
            .iter()
            .map(|r| r.value)
            .filter(|&v| participates(func, v, class))
            .collect();
        for v in ress {
            let ru = assigned(func, v);
            occupied.insert(ru);
            if liveness.inst_live_out(head).contains(&v) {
                colors.insert(ru);
            }
        }

        // Phi results that were not operands of the constrained head get
        // fresh colors around the occupied set.
        let phis: Vec<Inst> = func.layout.block_phis(block).collect();
        for phi in phis {
            let res = func.insts[phi].phi_result();
            if !participates(func, res, class) || already_colored.contains(&res) {
                continue;
            }
            let free = reservoir.difference(occupied);
            let ru = free.first().expect("phi region ran out of colors");
            set_color(func, res, ru);
            if liveness.inst_live_out(phi).contains(&res) {
                occupied.insert(ru);
                if liveness.inst_live_out(head).contains(&res) {
                    colors.insert(ru);
                }
            }
        }

        start = func.layout.next_inst(head);
    } else {
        // Everything live into the block is already colored.
        let live_in: SmallVec<[Value; 8]> = liveness
            .block_live_in(block)
            .iter()
            .copied()
            .filter(|&v| participates(func, v, class))
            .collect();
        for v in live_in {
            colors.insert(assigned(func, v));
        }
        start = func.layout.next_inst(func.layout.block(block).begin);
    }

    // Walk the remaining instructions in order.
    let end = func.layout.block(block).end.expand();
    let mut cursor = start;
    while let Some(inst) = cursor {
        if Some(inst) == end {
            break;
        }
        cursor = func.layout.next_inst(inst);

        // Free the colors of dying arguments; remember them for reuse.
        let mut freed_here: SmallVec<[RegUnit; 2]> = SmallVec::new();
        let args: SmallVec<[Value; 4]> = func.insts[inst]
            .args
            .iter()
            .filter_map(|a| a.operand.value())
            .filter(|&v| participates(func, v, class))
            .collect();
        for v in args {
            if liveness.is_last_use(inst, v) {
                let ru = assigned(func, v);
                // A doubled argument like `a = b + b` frees its color once.
                if colors.contains(ru) {
                    freed_here.push(ru);
                    colors.remove(ru);
                }
            }
        }

        let ress: SmallVec<[Value; 2]> = func.insts[inst]
            .ress
            .iter()
            .map(|r| r.value)
            .filter(|&v| participates(func, v, class))
            .collect();
        for v in ress {
            let ru = if !freed_here.is_empty() {
                freed_here.remove(0)
            } else {
                reservoir
                    .difference(colors)
                    .first()
                    .expect("out of registers; the spiller must bound pressure")
            };
            colors.insert(ru);
            set_color(func, v, ru);
            debug!("{} gets register unit {}", v, ru);

            // Pointless definitions release their color immediately.
            if !liveness.inst_live_out(inst).contains(&v) {
                colors.remove(ru);
            }
        }
    }
}

/// Color a constrained instruction: constraints first, then dying args,
/// unconstrained results and live-through args around them.
fn color_constrained_inst(
    func: &mut Function,
    liveness: &Liveness,
    class: RegClass,
    reservoir: RegisterSet,
    inst: Inst,
    already_colored: &mut FxHashSet<Value>,
) {
    let mut live_through: Vec<Value> = Vec::new();
    let mut dying: Vec<Value> = Vec::new();
    let args: SmallVec<[(Value, Option<RegUnit>); 4]> = func.insts[inst]
        .args
        .iter()
        .filter_map(|a| a.operand.value().map(|v| (v, a.constraint)))
        .filter(|&(v, _)| participates(func, v, class))
        .collect();
    for &(v, _) in &args {
        already_colored.insert(v);
        let bucket = if liveness.lives_through(inst, v) {
            &mut live_through
        } else {
            &mut dying
        };
        if !bucket.contains(&v) {
            bucket.push(v);
        }
    }

    let mut unconstrained_defs: Vec<Value> = func.insts[inst]
        .ress
        .iter()
        .map(|r| r.value)
        .filter(|&v| participates(func, v, class))
        .collect();

    let mut colors_d = RegisterSet::empty();
    let mut colors_a = RegisterSet::empty();
    let mut free_colors = reservoir;

    // Constrained arguments.
    for &(v, constraint) in &args {
        let ru = match constraint {
            Some(ru) => ru,
            None => continue,
        };
        colors_a.insert(ru);
        set_color(func, v, ru);
        if live_through.contains(&v) {
            debug_assert!(free_colors.contains(ru), "constraint outside the reservoir");
            free_colors.remove(ru);
        }
        dying.retain(|&d| d != v);
        live_through.retain(|&l| l != v);
    }

    // Constrained results.
    let ress: SmallVec<[(Value, Option<RegUnit>); 4]> = func.insts[inst]
        .ress
        .iter()
        .map(|r| (r.value, r.constraint))
        .filter(|&(v, _)| participates(func, v, class))
        .collect();
    for &(v, constraint) in &ress {
        let ru = match constraint {
            Some(ru) => ru,
            None => continue,
        };
        colors_d.insert(ru);
        unconstrained_defs.retain(|&d| d != v);
        set_color(func, v, ru);
    }

    // Dying arguments may share a result color, since the value is gone
    // when the result materializes.
    for v in dying {
        let from_results = colors_d.difference(colors_a);
        let ru = match from_results.first() {
            Some(ru) => ru,
            None => free_colors
                .difference(colors_a)
                .first()
                .expect("no register left for dying argument"),
        };
        colors_a.insert(ru);
        set_color(func, v, ru);
    }

    // Unconstrained results prefer a freed argument color.
    for v in unconstrained_defs {
        let from_args = colors_a.difference(colors_d);
        let ru = match from_args.first() {
            Some(ru) => ru,
            None => free_colors
                .difference(colors_d)
                .first()
                .expect("no register left for result"),
        };
        colors_d.insert(ru);
        set_color(func, v, ru);
    }

    // Live-through arguments must avoid both in-use sets.
    for v in live_through {
        let mut avoid = colors_d;
        for ru in colors_a.iter() {
            avoid.insert(ru);
        }
        let ru = free_colors
            .difference(avoid)
            .first()
            .expect("no register left for live-through argument");
        free_colors.remove(ru);
        set_color(func, v, ru);
    }
}

/// Color every spilled variable with a dense slot index, registering each
/// slot in `place` of the stack layout.
pub fn color_spill_slots(
    func: &mut Function,
    domtree: &DominatorTree,
    liveness: &Liveness,
    place: usize,
) {
    let entry = func.entry.expand().expect("no entry block");
    for block in domtree.pre_order(entry) {
        color_slot_block(func, liveness, place, block);
    }
}

fn is_spilled(func: &Function, v: Value) -> bool {
    func.vars[v].is_spilled()
}

fn color_slot_block(func: &mut Function, liveness: &Liveness, place: usize, block: Block) {
    let mut slots: BTreeSet<u32> = BTreeSet::new();
    let live_in: SmallVec<[Value; 8]> = liveness
        .block_live_in(block)
        .iter()
        .copied()
        .filter(|&v| is_spilled(func, v))
        .collect();
    for v in live_in {
        slots.insert(func.vars[v].color.unwrap_slot());
    }

    let insts: Vec<Inst> = func.layout.block_insts(block).skip(1).collect();
    for inst in insts {
        let args: SmallVec<[Value; 4]> = func.insts[inst]
            .args
            .iter()
            .filter_map(|a| a.operand.value())
            .filter(|&v| is_spilled(func, v))
            .collect();
        for v in args {
            if liveness.is_last_use(inst, v) {
                // A doubled argument frees its slot once.
                slots.remove(&func.vars[v].color.unwrap_slot());
            }
        }

        let ress: SmallVec<[Value; 2]> = func.insts[inst]
            .ress
            .iter()
            .map(|r| r.value)
            .filter(|&v| is_spilled(func, v))
            .collect();
        for v in ress {
            // Lowest free slot index.
            let mut slot = 0u32;
            for &s in &slots {
                if s != slot {
                    break;
                }
                slot += 1;
            }
            slots.insert(slot);
            func.vars[v].color = Color::Slot(slot);
            func.stack_layout.insert_color(place, slot);
            debug!("{} gets spill slot {}", v, slot);

            if !liveness.inst_live_out(inst).contains(&v) {
                slots.remove(&slot);
            }
        }
    }
}

/// Bind every memory variable to a concrete stack slot: stores forward the
/// base variable's slot, fresh definitions append to the layout.
pub fn color_stack_vars(func: &mut Function, domtree: &DominatorTree) {
    let entry = func.entry.expand().expect("no entry block");
    for block in domtree.pre_order(entry) {
        let phis: Vec<Inst> = func.layout.block_phis(block).collect();
        for phi in phis {
            let res = func.insts[phi].phi_result();
            if !matches!(func.vars[res].kind, VarKind::Mem { .. }) {
                continue;
            }
            // All arguments of a memory phi share one slot.
            let arg = func.insts[phi].args[0]
                .operand
                .value()
                .expect("memory phi with non-variable argument");
            let color = func.vars[arg].color;
            debug_assert!(
                func.insts[phi]
                    .args
                    .iter()
                    .all(|a| a.operand.value().map_or(true, |v| func.vars[v].color == color)),
                "memory phi arguments with distinct slots"
            );
            func.vars[res].color = color;
        }

        let insts: Vec<Inst> = func.layout.block_ordinary(block).collect();
        for inst in insts {
            let ress: SmallVec<[Value; 2]> = func.insts[inst]
                .ress
                .iter()
                .map(|r| r.value)
                .filter(|&v| matches!(func.vars[v].kind, VarKind::Mem { .. }))
                .collect();
            for v in ress {
                if matches!(func.insts[inst].data, InstructionData::Store { .. }) {
                    let base = func.insts[inst].args[1]
                        .operand
                        .value()
                        .expect("store through a non-variable");
                    func.vars[v].color = func.vars[base].color;
                } else {
                    let size = match func.vars[v].kind {
                        VarKind::Mem { size } => size,
                        _ => unreachable!(),
                    };
                    let color = func.stack_layout.append_mem_var(v, size);
                    func.vars[v].color = Color::Slot(color);
                }
            }
        }
    }
}
