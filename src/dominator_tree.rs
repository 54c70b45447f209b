//! A dominator tree represented as mappings of blocks to their immediate
//! dominator, plus the derived child lists, dominance frontiers and
//! constant-time dominance queries.

use crate::entity::packed_option::PackedOption;
use crate::entity::SecondaryMap;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst};
use rustc_hash::FxHashSet;

/// Special numbers used during `compute_postorder`.
const SEEN: u32 = 1;
const DONE: u32 = 2;

#[derive(Clone, Default)]
struct PreNode {
    /// Sequence number in a pre-order traversal of the dominator tree.
    /// Unreachable blocks have number 0, the entry block 1.
    pre_number: u32,
    /// Maximum `pre_number` in the subtree rooted at this node.
    pre_max: u32,
}

/// The dominator tree for a single function.
pub struct DominatorTree {
    /// CFG post-order of all reachable blocks; the entry block is last.
    postorder: Vec<Block>,
    /// Post-order number + 3; 0 means unreachable. The offset leaves room
    /// for the SEEN/DONE markers used while the DFS is in flight.
    po_number: SecondaryMap<Block, u32>,
    /// Immediate dominator; the entry block points at itself.
    idom: SecondaryMap<Block, PackedOption<Block>>,
    children: SecondaryMap<Block, Vec<Block>>,
    frontier: SecondaryMap<Block, Vec<Block>>,
    pre: SecondaryMap<Block, PreNode>,
    stack: Vec<Block>,
    valid: bool,
}

impl DominatorTree {
    /// Allocate a blank dominator tree. Use `compute` to fill it in.
    pub fn new() -> Self {
        Self {
            postorder: Vec::new(),
            po_number: SecondaryMap::new(),
            idom: SecondaryMap::new(),
            children: SecondaryMap::new(),
            frontier: SecondaryMap::new(),
            pre: SecondaryMap::new(),
            stack: Vec::new(),
            valid: false,
        }
    }

    /// Is the tree in a computed state?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Is `block` reachable from the entry block?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.po_number[block] != 0
    }

    /// The CFG post-order used to compute the tree. Stale after CFG edits.
    pub fn postorder(&self) -> &[Block] {
        debug_assert!(self.valid);
        &self.postorder
    }

    /// A dominator-tree pre-order (every block before its children).
    pub fn pre_order(&self, entry: Block) -> Vec<Block> {
        let mut order = Vec::with_capacity(self.postorder.len());
        let mut stack = vec![entry];
        while let Some(b) = stack.pop() {
            order.push(b);
            // Push in reverse so children come out in recorded order.
            for &c in self.children[b].iter().rev() {
                stack.push(c);
            }
        }
        order
    }

    /// The immediate dominator of `block`, `None` for the entry block and
    /// unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        match self.idom[block].expand() {
            Some(d) if d != block => Some(d),
            _ => None,
        }
    }

    /// The dominator-tree children of `block`.
    pub fn children(&self, block: Block) -> &[Block] {
        &self.children[block]
    }

    /// The dominance frontier of `block`.
    pub fn frontier(&self, block: Block) -> &[Block] {
        &self.frontier[block]
    }

    /// Returns `true` if `a` dominates `b` at block granularity, in
    /// constant time. A block dominates itself.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        let na = &self.pre[a];
        let nb = &self.pre[b];
        na.pre_number != 0 && na.pre_number <= nb.pre_number && na.pre_max >= nb.pre_max
    }

    /// Returns `true` if instruction `a` dominates instruction `b`.
    ///
    /// Within one block this is layout order; across blocks it is block
    /// dominance. An instruction dominates itself.
    pub fn inst_dominates(&self, func: &Function, a: Inst, b: Inst) -> bool {
        if a == b {
            return true;
        }
        let ba = func.layout.inst_block(a).expect("a not in layout");
        let bb = func.layout.inst_block(b).expect("b not in layout");
        if ba != bb {
            return self.dominates(ba, bb);
        }
        // Same block: does a precede b?
        let begin = func.layout.block(ba).begin;
        let mut cur = func.layout.prev_inst(b);
        while let Some(i) = cur {
            if i == a {
                return true;
            }
            if i == begin {
                break;
            }
            cur = func.layout.prev_inst(i);
        }
        false
    }

    /// Compute the iterated dominance frontier of a set of blocks.
    pub fn iterated_dom_frontier(
        &self,
        blocks: impl IntoIterator<Item = Block>,
    ) -> FxHashSet<Block> {
        let mut work: Vec<Block> = blocks.into_iter().collect();
        let mut result = FxHashSet::default();
        while let Some(b) = work.pop() {
            for &df in self.frontier[b].iter() {
                if result.insert(df) {
                    work.push(df);
                }
            }
        }
        result
    }

    /// Reset and compute the post-order, immediate dominators, dominator
    /// tree, pre-order intervals and dominance frontiers.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        debug_assert!(cfg.is_valid());
        self.clear();
        let entry = match func.entry.expand() {
            Some(e) => e,
            None => return,
        };
        self.compute_postorder(cfg, entry);
        self.compute_idoms(cfg, entry);
        self.compute_children(entry);
        self.compute_pre_intervals(entry);
        self.compute_frontiers(cfg);
        self.valid = true;
    }

    /// Clear the data structures, leaving the tree invalid.
    pub fn clear(&mut self) {
        self.postorder.clear();
        self.po_number.clear();
        self.idom.clear();
        self.children.clear();
        self.frontier.clear();
        self.pre.clear();
        debug_assert!(self.stack.is_empty());
        self.valid = false;
    }

    /// Depth-first traversal collecting a post-order of the reachable
    /// blocks. `po_number` holds SEEN/DONE while the walk is in flight and
    /// the final numbering afterwards.
    fn compute_postorder(&mut self, cfg: &ControlFlowGraph, entry: Block) {
        self.stack.push(entry);
        self.po_number[entry] = SEEN;

        while let Some(block) = self.stack.pop() {
            match self.po_number[block] {
                SEEN => {
                    // First pop: revisit after the successors are done.
                    self.po_number[block] = DONE;
                    self.stack.push(block);
                    for &succ in cfg.succs(block) {
                        if self.po_number[succ] == 0 {
                            self.po_number[succ] = SEEN;
                            self.stack.push(succ);
                        }
                    }
                }
                DONE => self.postorder.push(block),
                _ => unreachable!("block visited twice"),
            }
        }

        for (i, &block) in self.postorder.iter().enumerate() {
            self.po_number[block] = i as u32 + 3;
        }
    }

    /// Cooper/Harvey/Kennedy iterative immediate-dominator computation over
    /// the post-order.
    fn compute_idoms(&mut self, cfg: &ControlFlowGraph, entry: Block) {
        self.idom[entry] = entry.into();

        let mut changed = true;
        while changed {
            changed = false;
            // Reverse post-order, skipping the entry block itself.
            for i in (0..self.postorder.len().saturating_sub(1)).rev() {
                let block = self.postorder[i];
                let mut new_idom: Option<Block> = None;
                for &pred in cfg.preds(block) {
                    if self.idom[pred].is_none() {
                        continue; // not processed yet, or unreachable
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(other) => self.intersect(pred, other),
                    });
                }
                let new_idom = new_idom.expect("reachable block without processed predecessor");
                if self.idom[block].expand() != Some(new_idom) {
                    self.idom[block] = new_idom.into();
                    changed = true;
                }
            }
        }
    }

    fn intersect(&self, mut a: Block, mut b: Block) -> Block {
        while a != b {
            while self.po_number[a] < self.po_number[b] {
                a = self.idom[a].expand().expect("idom chain broken");
            }
            while self.po_number[b] < self.po_number[a] {
                b = self.idom[b].expand().expect("idom chain broken");
            }
        }
        a
    }

    fn compute_children(&mut self, entry: Block) {
        for &block in &self.postorder {
            if block != entry {
                let idom = self.idom[block].expand().unwrap();
                self.children[idom].push(block);
            }
        }
    }

    /// Assign pre-order numbers and subtree maxima over the dominator tree;
    /// these make `dominates` a pair of comparisons.
    fn compute_pre_intervals(&mut self, entry: Block) {
        let mut n = 0;
        self.stack.push(entry);
        while let Some(block) = self.stack.pop() {
            n += 1;
            self.pre[block].pre_number = n;
            self.pre[block].pre_max = n;
            for &c in self.children[block].iter().rev() {
                self.stack.push(c);
            }
        }
        // The post-order is topological w.r.t. dominance: children first.
        for i in 0..self.postorder.len() {
            let block = self.postorder[i];
            if let Some(idom) = self.idom(block) {
                let m = self.pre[block].pre_max.max(self.pre[idom].pre_max);
                self.pre[idom].pre_max = m;
            }
        }
    }

    /// Dominance frontiers per Cooper et al.: for every join block, walk
    /// each predecessor's idom chain up to the join's idom.
    fn compute_frontiers(&mut self, cfg: &ControlFlowGraph) {
        for i in 0..self.postorder.len() {
            let block = self.postorder[i];
            if cfg.num_preds(block) < 2 {
                continue;
            }
            let idom = match self.idom(block) {
                Some(d) => d,
                None => continue,
            };
            for &pred in cfg.preds(block) {
                if !self.is_reachable(pred) {
                    continue;
                }
                let mut runner = pred;
                while runner != idom {
                    if !self.frontier[runner].contains(&block) {
                        self.frontier[runner].push(block);
                    }
                    runner = match self.idom(runner) {
                        Some(d) => d,
                        None => break,
                    };
                }
            }
        }
    }
}

impl Default for DominatorTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_build::build_cfg;
    use crate::ir::{Function, InstructionData, Opcode, Type};
    use smallvec::SmallVec;

    /// entry -> {then, else} -> join, then a tail block.
    fn diamond() -> (Function, ControlFlowGraph) {
        let mut func = Function::with_name("d", &[8, 16]);
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
        (func, cfg)
    }

    #[test]
    fn diamond_idoms() {
        let (func, cfg) = diamond();
        let mut dt = DominatorTree::new();
        dt.compute(&func, &cfg);

        let entry = func.entry.expand().unwrap();
        assert_eq!(dt.idom(entry), None);
        for block in func.layout.blocks() {
            assert!(dt.is_reachable(block));
            assert!(dt.dominates(entry, block));
            if block != entry {
                assert!(!dt.dominates(block, entry));
            }
        }

        // The join block's idom is the entry, not either arm.
        let branch_succs = cfg.succs(entry).to_vec();
        let join = *cfg.succs(branch_succs[0]).first().unwrap();
        assert_eq!(dt.idom(join), Some(entry));
        assert!(!dt.dominates(branch_succs[0], join));
    }

    #[test]
    fn diamond_frontiers() {
        let (func, cfg) = diamond();
        let mut dt = DominatorTree::new();
        dt.compute(&func, &cfg);

        let entry = func.entry.expand().unwrap();
        let arms = cfg.succs(entry).to_vec();
        let join = *cfg.succs(arms[0]).first().unwrap();
        assert_eq!(dt.frontier(arms[0]), &[join]);
        assert_eq!(dt.frontier(arms[1]), &[join]);
        assert!(dt.frontier(entry).is_empty());

        let idf = dt.iterated_dom_frontier(arms.iter().copied());
        assert!(idf.contains(&join));
        assert_eq!(idf.len(), 1);
    }

    #[test]
    fn inst_order_within_block() {
        let (func, cfg) = diamond();
        let mut dt = DominatorTree::new();
        dt.compute(&func, &cfg);

        let entry = func.entry.expand().unwrap();
        let insts: Vec<_> = func.layout.block_insts(entry).collect();
        let label = insts[0];
        let branch = *insts.last().unwrap();
        assert!(dt.inst_dominates(&func, label, branch));
        assert!(!dt.inst_dominates(&func, branch, label));
        assert!(dt.inst_dominates(&func, branch, branch));
    }

    #[test]
    fn spanning_tree_property() {
        let (func, cfg) = diamond();
        let mut dt = DominatorTree::new();
        dt.compute(&func, &cfg);

        // Dom-tree child lists form a spanning tree rooted at the entry.
        let entry = func.entry.expand().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![entry];
        while let Some(b) = stack.pop() {
            assert!(seen.insert(b), "block {} visited twice", b);
            stack.extend(dt.children(b).iter().copied());
        }
        assert_eq!(seen.len(), func.layout.num_blocks());
    }
}
