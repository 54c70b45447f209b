//! CFG construction: discover basic blocks in the label-delimited
//! instruction stream, wire the edges, and break critical edges.
//!
//! After this pass there are no critical edges, every block except the
//! entry has at least one predecessor, and every block's predecessor count
//! is exactly the number of arguments a phi placed in it must have.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, InstructionData};
use smallvec::SmallVec;

/// Discover blocks, compute edges and split critical edges.
pub fn build_cfg(func: &mut Function, cfg: &mut ControlFlowGraph) {
    discover_blocks(func);
    cfg.compute(func);
    eliminate_critical_edges(func, cfg);
}

/// Walk the stream and open a block at every label.
fn discover_blocks(func: &mut Function) {
    let insts: Vec<Inst> = func.layout.insts().collect();
    assert!(
        insts.first().is_some_and(|&i| func.insts[i].is_label()),
        "first instruction of a function must be a label"
    );
    assert!(
        insts.last().is_some_and(|&i| func.insts[i].is_label()),
        "last instruction of a function must be a label"
    );

    let mut begin: Option<Inst> = None;
    let mut blocks: Vec<Block> = Vec::new();
    for &inst in &insts {
        if func.insts[inst].is_label() {
            if let Some(b) = begin {
                blocks.push(func.layout.make_block(b, Some(inst)));
            }
            begin = Some(inst);
        } else if func.insts[inst].is_jump() {
            debug_assert!(
                func.layout
                    .next_inst(inst)
                    .is_some_and(|n| func.insts[n].is_label()),
                "a jump must be followed by a label"
            );
        }
    }
    // The final label opens the exit block, which runs to the end of the
    // stream and holds no ordinary instructions.
    blocks.push(func.layout.make_block(begin.unwrap(), None));

    // Tag every instruction with its block.
    for &block in &blocks {
        let range: Vec<Inst> = func.layout.block_insts(block).collect();
        for inst in range {
            func.layout.set_inst_block(inst, block);
        }
        func.refresh_block_bounds(block);
    }

    func.entry = blocks.first().copied().into();
    func.exit = blocks.last().copied().into();
}

/// Split every edge from a block with more than one successor to a block
/// with more than one predecessor by interposing an empty block.
fn eliminate_critical_edges(func: &mut Function, cfg: &mut ControlFlowGraph) {
    let blocks: Vec<Block> = func.layout.blocks().collect();
    for block in blocks {
        if cfg.num_preds(block) <= 1 {
            continue;
        }
        let preds: SmallVec<[Block; 4]> = cfg.preds(block).iter().copied().collect();
        for pred in preds {
            let pred_last = func.layout.last_inst_of(pred);
            let is_multi_target = func.insts[pred_last].is_jump()
                && func.insts[pred_last].jump_targets().len() > 1;
            if !is_multi_target {
                continue;
            }
            split_edge(func, cfg, pred, block);
        }
    }
}

/// Interpose an empty block on the edge `pred -> block`.
///
/// The interposed block takes over `block`'s current label, so `pred`'s
/// jump needs no retargeting; `block` gets a fresh leading label and every
/// other predecessor is redirected to it, inserting an explicit goto where
/// the predecessor used to fall through.
fn split_edge(func: &mut Function, cfg: &mut ControlFlowGraph, pred: Block, block: Block) {
    let old_label = func.layout.block(block).begin;
    let new_label = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
    func.layout.insert_after(new_label, old_label);

    let mid = func.layout.make_block(old_label, Some(new_label));
    func.layout.block_mut(block).begin = new_label;
    func.layout.set_inst_block(old_label, mid);
    func.layout.set_inst_block(new_label, block);
    func.refresh_block_bounds(mid);
    func.refresh_block_bounds(block);

    cfg.unlink(pred, block);
    cfg.link(pred, mid);
    cfg.link(mid, block);

    // Every remaining predecessor must now reach the fresh label: retarget
    // its jump, or materialize a goto where it used to fall through (a
    // fallthrough would otherwise run into the interposed block).
    let others: SmallVec<[Block; 4]> = cfg
        .preds(block)
        .iter()
        .copied()
        .filter(|&q| q != mid)
        .collect();
    for q in others {
        let q_last = func.layout.last_inst_of(q);
        if func.insts[q_last].is_jump() {
            func.insts[q_last].retarget_jump(old_label, new_label);
        } else {
            let goto = func.create_inst(
                InstructionData::Goto { target: new_label },
                SmallVec::new(),
                SmallVec::new(),
            );
            func.insert_inst_after(goto, q_last);
        }
    }
}

/// Split `block` in two immediately before `at`: the top block keeps the
/// old label, phi region and prelude; `block` keeps `at` and everything
/// after it under a fresh label. Returns the top block.
///
/// Dominance data is stale after this and must be recomputed by the caller.
pub fn split_block(func: &mut Function, cfg: &mut ControlFlowGraph, block: Block, at: Inst) -> Block {
    let old_begin = func.layout.block(block).begin;
    // There must be something for the top block to take over: a prelude,
    // a phi region, or several incoming edges to consolidate onto one.
    debug_assert!(
        func.layout.prev_inst(at) != Some(old_begin)
            || func.block_has_phis(block)
            || cfg.num_preds(block) > 1,
        "nothing to split off"
    );

    let new_label = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
    func.layout.insert_before(new_label, at);

    let top = func.layout.make_block(old_begin, Some(new_label));
    func.layout.block_mut(block).begin = new_label;
    func.layout.set_inst_block(new_label, block);
    let moved: Vec<Inst> = func.layout.block_insts(top).collect();
    for inst in moved {
        func.layout.set_inst_block(inst, top);
    }
    func.refresh_block_bounds(top);
    func.refresh_block_bounds(block);

    // Predecessor jumps still target the old label, which now opens `top`,
    // so only the edge lists need rewiring.
    let preds: SmallVec<[Block; 4]> = cfg.preds(block).iter().copied().collect();
    for p in preds {
        cfg.unlink(p, block);
        cfg.link(p, top);
    }
    cfg.link(top, block);

    if func.entry.expand() == Some(block) {
        func.entry = top.into();
    }
    top
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Opcode, Type};

    /// Diamond: branch from entry, each arm assigns and jumps to the join.
    #[test]
    fn discovers_blocks_and_edges() {
        let mut func = Function::with_name("f", &[8, 16]);
        let c = func.new_reg(Type::Bool);
        let x = func.new_reg(Type::Int32);

        func.emit_label();
        let then_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let else_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let join_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let end_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());

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

        assert_eq!(func.layout.num_blocks(), 5);
        let entry_block = func.entry.expand().unwrap();
        assert_eq!(cfg.num_succs(entry_block), 2);
        let join_block = func.layout.inst_block(join_l).unwrap();
        assert_eq!(cfg.num_preds(join_block), 2);
    }

    /// A branch edge into a block that a second block also reaches is
    /// critical; afterwards no edge runs from a multi-successor block to a
    /// multi-predecessor block.
    #[test]
    fn no_critical_edges_remain() {
        let mut func = Function::with_name("g", &[8, 16]);
        let c = func.new_reg(Type::Bool);

        func.emit_label();
        let skip_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let join_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        let end_l = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());

        // entry branches to skip or straight to join; skip falls through
        // into join. The edge entry -> join leaves a two-successor block
        // and enters a two-predecessor block: critical.
        func.emit_branch(c, skip_l, join_l);
        func.layout.push_back(skip_l);
        func.emit_nop(c);
        func.layout.push_back(join_l);
        func.emit_nop(c);
        func.layout.push_back(end_l);

        let mut cfg = ControlFlowGraph::new();
        build_cfg(&mut func, &mut cfg);

        for block in func.layout.blocks() {
            if cfg.num_succs(block) > 1 {
                for &succ in cfg.succs(block) {
                    assert!(
                        cfg.num_preds(succ) <= 1,
                        "critical edge {} -> {} survived",
                        block,
                        succ
                    );
                }
            }
        }
        // Every jump is still followed by a label.
        let insts: Vec<Inst> = func.layout.insts().collect();
        for &i in &insts {
            if func.insts[i].is_jump() {
                let next = func.layout.next_inst(i).unwrap();
                assert!(func.insts[next].is_label());
            }
        }
    }
}
