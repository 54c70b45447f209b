//! A control flow graph represented as per-block predecessor and successor
//! lists.
//!
//! The lists are ordered: phi argument slots are indexed by the position of
//! their source block in the successor's predecessor list at phi-placement
//! time, so the order is part of the contract. Passes that rewire edges use
//! `link`/`unlink` and keep the lists consistent by hand, the same way CFG
//! surgery is written in the rest of the crate.

use crate::entity::SecondaryMap;
use crate::ir::{Block, Function};
use smallvec::SmallVec;

#[derive(Clone, Default)]
struct CfgNode {
    predecessors: SmallVec<[Block; 4]>,
    successors: SmallVec<[Block; 2]>,
}

/// The control flow graph of a function.
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CfgNode>,
    valid: bool,
}

impl ControlFlowGraph {
    /// Allocate a new blank control flow graph.
    pub fn new() -> Self {
        Self {
            data: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Clear all data structures in this control flow graph.
    pub fn clear(&mut self) {
        self.data.clear();
        self.valid = false;
    }

    /// Compute the control flow graph of `func` from its jump instructions
    /// and fallthroughs. Blocks must already have been discovered.
    pub fn compute(&mut self, func: &Function) {
        self.clear();
        let blocks: Vec<Block> = func.layout.blocks().collect();
        for block in blocks {
            self.compute_block(func, block);
        }
        self.valid = true;
    }

    fn compute_block(&mut self, func: &Function, block: Block) {
        let last = func.layout.last_inst_of(block);
        let instr = &func.insts[last];
        if instr.is_jump() {
            for target in instr.jump_targets() {
                let dest = func
                    .layout
                    .inst_block(target)
                    .expect("jump target label not attached to a block");
                self.link(block, dest);
            }
        } else if let Some(end) = func.layout.block(block).end.expand() {
            // No terminator: control falls through into the next block.
            let dest = func
                .layout
                .inst_block(end)
                .expect("end label not attached to a block");
            self.link(block, dest);
        }
    }

    /// Add the edge `from -> to`.
    pub fn link(&mut self, from: Block, to: Block) {
        self.data[from].successors.push(to);
        self.data[to].predecessors.push(from);
    }

    /// Remove one occurrence of the edge `from -> to`.
    pub fn unlink(&mut self, from: Block, to: Block) {
        let succs = &mut self.data[from].successors;
        let pos = succs
            .iter()
            .position(|&b| b == to)
            .expect("edge to unlink not present");
        succs.remove(pos);
        let preds = &mut self.data[to].predecessors;
        let pos = preds
            .iter()
            .position(|&b| b == from)
            .expect("edge to unlink not present");
        preds.remove(pos);
    }

    /// The predecessors of `block`, in edge-creation order.
    pub fn preds(&self, block: Block) -> &[Block] {
        &self.data[block].predecessors
    }

    /// The successors of `block`.
    pub fn succs(&self, block: Block) -> &[Block] {
        &self.data[block].successors
    }

    /// Number of predecessors of `block`.
    pub fn num_preds(&self, block: Block) -> usize {
        self.data[block].predecessors.len()
    }

    /// Number of successors of `block`.
    pub fn num_succs(&self, block: Block) -> usize {
        self.data[block].successors.len()
    }

    /// The position of `pred` in `block`'s predecessor list.
    pub fn pred_index(&self, block: Block, pred: Block) -> usize {
        self.data[block]
            .predecessors
            .iter()
            .position(|&b| b == pred)
            .expect("pred_index: not a predecessor")
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}
