//! Instruction layout: an intrusive doubly-linked list of instructions and
//! the block ranges defined over it.
//!
//! Many passes splice instructions into the middle of the stream, so the
//! layout provides O(1) insertion before/after a given instruction and a
//! stable-iterator contract: inserting or erasing invalidates only the
//! erased instruction itself. Links are `PackedOption<Inst>` handles in a
//! `SecondaryMap`, never pointers.
//!
//! A basic block covers the half-open instruction range `[begin, end)`:
//! `begin` is the block's leading `Label` and `end` is the label of the
//! next block, or the end of the stream for the last block. Within a block,
//! `first_phi` and `first_ordinary` partition the range into the leading
//! label, the phi region, and the ordinary region.

use crate::entity::packed_option::PackedOption;
use crate::entity::{PrimaryMap, SecondaryMap};
use crate::ir::entities::{Block, Inst};

#[derive(Clone, Debug, Default)]
struct InstNode {
    prev: PackedOption<Inst>,
    next: PackedOption<Inst>,
    block: PackedOption<Block>,
}

/// Data defining one basic block's span over the instruction list.
#[derive(Clone, Debug)]
pub struct BlockData {
    /// The leading label.
    pub begin: Inst,
    /// The label of the next block; `None` for the last block.
    pub end: PackedOption<Inst>,
    /// First phi instruction, if the block has any.
    pub first_phi: PackedOption<Inst>,
    /// First instruction that is neither the label nor a phi, if any.
    pub first_ordinary: PackedOption<Inst>,
}

/// The instruction list and block table of a function.
#[derive(Clone, Default)]
pub struct Layout {
    nodes: SecondaryMap<Inst, InstNode>,
    first: PackedOption<Inst>,
    last: PackedOption<Inst>,
    blocks: PrimaryMap<Block, BlockData>,
}

impl Layout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// First instruction in the stream.
    pub fn first_inst(&self) -> Option<Inst> {
        self.first.expand()
    }

    /// Last instruction in the stream.
    pub fn last_inst(&self) -> Option<Inst> {
        self.last.expand()
    }

    /// The instruction after `inst`, if any.
    pub fn next_inst(&self, inst: Inst) -> Option<Inst> {
        self.nodes[inst].next.expand()
    }

    /// The instruction before `inst`, if any.
    pub fn prev_inst(&self, inst: Inst) -> Option<Inst> {
        self.nodes[inst].prev.expand()
    }

    /// Append `inst` at the end of the stream.
    pub fn push_back(&mut self, inst: Inst) {
        let old_last = self.last;
        self.nodes[inst] = InstNode {
            prev: old_last,
            next: None.into(),
            block: self.nodes[inst].block,
        };
        match old_last.expand() {
            Some(l) => self.nodes[l].next = inst.into(),
            None => self.first = inst.into(),
        }
        self.last = inst.into();
    }

    /// Insert `inst` immediately after `pos`.
    pub fn insert_after(&mut self, inst: Inst, pos: Inst) {
        let next = self.nodes[pos].next;
        self.nodes[inst].prev = pos.into();
        self.nodes[inst].next = next;
        self.nodes[pos].next = inst.into();
        match next.expand() {
            Some(n) => self.nodes[n].prev = inst.into(),
            None => self.last = inst.into(),
        }
    }

    /// Insert `inst` immediately before `pos`.
    pub fn insert_before(&mut self, inst: Inst, pos: Inst) {
        let prev = self.nodes[pos].prev;
        self.nodes[inst].next = pos.into();
        self.nodes[inst].prev = prev;
        self.nodes[pos].prev = inst.into();
        match prev.expand() {
            Some(p) => self.nodes[p].next = inst.into(),
            None => self.first = inst.into(),
        }
    }

    /// Remove `inst` from the stream. Only iterators to `inst` itself are
    /// invalidated.
    pub fn remove(&mut self, inst: Inst) {
        let InstNode { prev, next, .. } = self.nodes[inst];
        match prev.expand() {
            Some(p) => self.nodes[p].next = next,
            None => self.first = next,
        }
        match next.expand() {
            Some(n) => self.nodes[n].prev = prev,
            None => self.last = prev,
        }
        self.nodes[inst] = InstNode::default();
    }

    /// The block containing `inst`, if block discovery has run.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.nodes[inst].block.expand()
    }

    /// Tag `inst` as belonging to `block`.
    pub fn set_inst_block(&mut self, inst: Inst, block: Block) {
        self.nodes[inst].block = block.into();
    }

    /// Create a new block spanning from the label `begin`.
    pub fn make_block(&mut self, begin: Inst, end: Option<Inst>) -> Block {
        self.blocks.push(BlockData {
            begin,
            end: end.into(),
            first_phi: None.into(),
            first_ordinary: None.into(),
        })
    }

    /// Read-only block data.
    pub fn block(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }

    /// Mutable block data.
    pub fn block_mut(&mut self, block: Block) -> &mut BlockData {
        &mut self.blocks[block]
    }

    /// Number of blocks created so far.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Iterator over all blocks in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> {
        self.blocks.keys()
    }

    /// The last instruction inside `block`, i.e. the instruction before the
    /// next block's label.
    pub fn last_inst_of(&self, block: Block) -> Inst {
        let data = &self.blocks[block];
        match data.end.expand() {
            Some(end) => self
                .prev_inst(end)
                .expect("block end label cannot start the stream"),
            None => self.last_inst().expect("layout is empty"),
        }
    }

    /// Iterator over the instructions of the whole stream.
    pub fn insts(&self) -> InstIter<'_> {
        InstIter {
            layout: self,
            cur: self.first.expand(),
            until: None,
        }
    }

    /// Iterator over `[begin, end)` of a block, including the leading label.
    pub fn block_insts(&self, block: Block) -> InstIter<'_> {
        let data = &self.blocks[block];
        InstIter {
            layout: self,
            cur: Some(data.begin),
            until: data.end.expand(),
        }
    }

    /// Iterator over the phi region of a block.
    pub fn block_phis(&self, block: Block) -> InstIter<'_> {
        let data = &self.blocks[block];
        InstIter {
            layout: self,
            cur: data.first_phi.expand(),
            until: data.first_ordinary.expand().or(data.end.expand()),
        }
    }

    /// Iterator over the ordinary region of a block.
    pub fn block_ordinary(&self, block: Block) -> InstIter<'_> {
        let data = &self.blocks[block];
        InstIter {
            layout: self,
            cur: data.first_ordinary.expand(),
            until: data.end.expand(),
        }
    }
}

/// Iterator over a contiguous instruction range.
pub struct InstIter<'a> {
    layout: &'a Layout,
    cur: Option<Inst>,
    until: Option<Inst>,
}

impl Iterator for InstIter<'_> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        let cur = self.cur?;
        if Some(cur) == self.until {
            return None;
        }
        self.cur = self.layout.next_inst(cur);
        Some(cur)
    }
}
