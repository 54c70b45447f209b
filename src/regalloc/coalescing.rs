//! Coalescing by chunk-based recoloring.
//!
//! Affinity edges connect values that would like the same color: phi
//! arguments with their result, and copy sources with their destination.
//! Edges crossing a dominance frontier are weighted higher, since the move
//! they would eliminate sits on a merge edge. Affine values are grouped
//! into interference-free chunks with a disjoint-sets structure; each chunk
//! then tries every color in the reservoir, recursively pushing
//! conflicting neighbors onto other colors and rolling the whole attempt
//! back when a neighbor cannot move. The color that recolors the costliest
//! sub-chunk wins, and the leftover nodes form a new chunk.

use crate::defuse::DefUse;
use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Color, Function, InstructionData, Opcode, RegClass, RegUnit, Value};
use crate::liveness::Liveness;
use crate::regalloc::interference::{int_neighbors, interference_check};
use crate::regalloc::register_set::RegisterSet;
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BinaryHeap;

/// A disjoint-sets structure with union by rank and path halving.
struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

struct AffinityEdge {
    from: Value,
    to: Value,
    costs: i64,
}

#[derive(Clone, Default)]
struct Node {
    costs: i64,
    fixed: bool,
    old_color: Color,
}

/// The coalescer for one register class.
pub struct Coalescing<'a> {
    func: &'a mut Function,
    cfg: &'a ControlFlowGraph,
    domtree: &'a DominatorTree,
    liveness: &'a Liveness,
    defuse: &'a DefUse,
    class: RegClass,
    reservoir: RegisterSet,

    nodes: FxHashMap<Value, Node>,
    edges: Vec<AffinityEdge>,
    regs: Vec<Value>,
    chunks: Vec<Vec<Value>>,
}

impl<'a> Coalescing<'a> {
    /// Create a coalescer over `reservoir` for `class`.
    pub fn new(
        func: &'a mut Function,
        cfg: &'a ControlFlowGraph,
        domtree: &'a DominatorTree,
        liveness: &'a Liveness,
        defuse: &'a DefUse,
        class: RegClass,
        reservoir: RegisterSet,
    ) -> Self {
        Self {
            func,
            cfg,
            domtree,
            liveness,
            defuse,
            class,
            reservoir,
            nodes: FxHashMap::default(),
            edges: Vec::new(),
            regs: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Run the pass.
    pub fn run(mut self) {
        for v in self.func.vars.keys().collect::<Vec<_>>() {
            if self.participates(v) {
                self.nodes.insert(v, Node::default());
            }
        }

        self.build_affinity_edges();
        self.build_chunks();

        let mut queue: BinaryHeap<(i64, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (self.chunk_costs(c), i))
            .collect();

        while let Some((_, idx)) = queue.pop() {
            let mut chunk = std::mem::take(&mut self.chunks[idx]);
            if chunk.len() < 2 {
                continue;
            }
            chunk.sort_by_key(|&v| (std::cmp::Reverse(self.nodes[&v].costs), v));
            if let Some(rest) = self.recolor_chunk(&chunk) {
                let costs = self.chunk_costs(&rest);
                self.chunks.push(rest);
                queue.push((costs, self.chunks.len() - 1));
            }
        }
    }

    fn participates(&self, v: Value) -> bool {
        self.func.vars[v].colorable_reg(self.class) && self.func.vars[v].color != Color::None
    }

    fn neighbors(&self, v: Value) -> Vec<Value> {
        let mut n: Vec<Value> = int_neighbors(
            self.func,
            self.cfg,
            self.domtree,
            self.liveness,
            self.defuse,
            v,
            self.class,
            false,
        )
        .into_iter()
        .collect();
        n.sort_unstable();
        n
    }

    /// Affinity edges come from phi argument/result relations and from
    /// plain copies; crossing a dominance frontier weighs heavier.
    fn build_affinity_edges(&mut self) {
        // Gather first, then account: the cost bumps want mutable access.
        enum Raw {
            Phi {
                to: Value,
                pairs: Vec<(Value, bool)>,
            },
            Copy {
                from: Value,
                to: Value,
            },
        }
        let mut raw: Vec<Raw> = Vec::new();
        for inst in self.func.layout.insts() {
            let instr = &self.func.insts[inst];
            match &instr.data {
                InstructionData::Phi { sources } => {
                    let to = instr.phi_result();
                    if !self.nodes.contains_key(&to) {
                        continue;
                    }
                    let to_def_block = self
                        .defuse
                        .def_point(to)
                        .expect("phi result without def")
                        .block;
                    let pairs: Vec<(Value, bool)> = instr
                        .args
                        .iter()
                        .enumerate()
                        .filter_map(|(i, a)| {
                            let from = a.operand.value()?;
                            let src = sources[i].expand()?;
                            Some((from, self.domtree.frontier(src).contains(&to_def_block)))
                        })
                        .collect();
                    raw.push(Raw::Phi { to, pairs });
                }
                InstructionData::Assign { op: Opcode::Mov } => {
                    let to = match instr.ress.first() {
                        Some(r) => r.value,
                        None => continue,
                    };
                    if let Some(from) = instr.args[0].operand.value() {
                        raw.push(Raw::Copy { from, to });
                    }
                }
                _ => {}
            }
        }

        for r in raw {
            match r {
                Raw::Phi { to, pairs } => {
                    self.nodes.get_mut(&to).unwrap().costs += 1;
                    for (from, crosses_frontier) in pairs {
                        if !self.nodes.contains_key(&from) {
                            continue;
                        }
                        if crosses_frontier {
                            self.nodes.get_mut(&from).unwrap().costs += 100;
                            self.nodes.get_mut(&to).unwrap().costs += 10;
                        } else {
                            self.nodes.get_mut(&from).unwrap().costs += 1;
                        }
                        self.edges.push(AffinityEdge { from, to, costs: 0 });
                        self.note_reg(from);
                        self.note_reg(to);
                    }
                }
                Raw::Copy { from, to } => {
                    if !self.nodes.contains_key(&to) || !self.nodes.contains_key(&from) {
                        continue;
                    }
                    self.nodes.get_mut(&from).unwrap().costs += 1;
                    self.nodes.get_mut(&to).unwrap().costs += 1;
                    self.edges.push(AffinityEdge { from, to, costs: 0 });
                    self.note_reg(from);
                    self.note_reg(to);
                }
            }
        }

        for e in &mut self.edges {
            e.costs = self.nodes[&e.from].costs + self.nodes[&e.to].costs;
        }
        self.edges
            .sort_by_key(|e| (std::cmp::Reverse(e.costs), e.from, e.to));
    }

    fn note_reg(&mut self, v: Value) {
        if !self.regs.contains(&v) {
            self.regs.push(v);
        }
    }

    /// Union affine values into chunks, refusing a union that would put two
    /// interfering values in one chunk: every member pair across the two
    /// chunks is checked with the pairwise dominance-based query.
    fn build_chunks(&mut self) {
        let ids: FxHashMap<Value, usize> =
            self.regs.iter().enumerate().map(|(i, &v)| (v, i)).collect();
        let mut sets = DisjointSets::new(self.regs.len());
        // Member lists per chunk root, merged as chunks merge.
        let mut members: FxHashMap<usize, Vec<Value>> = self
            .regs
            .iter()
            .enumerate()
            .map(|(i, &v)| (i, vec![v]))
            .collect();

        for k in 0..self.edges.len() {
            let (from, to) = (self.edges[k].from, self.edges[k].to);
            let from_set = sets.find(ids[&from]);
            let to_set = sets.find(ids[&to]);
            if from_set == to_set {
                continue;
            }

            // Any interference between the two chunks vetoes the union.
            let interferes = members[&from_set].iter().any(|&a| {
                members[&to_set].iter().any(|&b| {
                    interference_check(
                        self.func,
                        self.domtree,
                        self.liveness,
                        self.defuse,
                        a,
                        b,
                    )
                })
            });
            if interferes {
                continue;
            }

            sets.union(from_set, to_set);
            let root = sets.find(from_set);
            let mut merged = members.remove(&from_set).unwrap();
            let mut other = members.remove(&to_set).unwrap();
            merged.append(&mut other);
            members.insert(root, merged);
        }

        let mut chunk_of_set: FxHashMap<usize, usize> = FxHashMap::default();
        for (i, &v) in self.regs.clone().iter().enumerate() {
            let set = sets.find(i);
            let idx = *chunk_of_set.entry(set).or_insert_with(|| {
                self.chunks.push(Vec::new());
                self.chunks.len() - 1
            });
            self.chunks[idx].push(v);
        }
    }

    fn chunk_costs(&self, chunk: &[Value]) -> i64 {
        chunk.iter().map(|v| self.nodes[v].costs).sum()
    }

    /// Try every reservoir color on the chunk; commit the best and return
    /// the leftover as a new chunk, if any.
    fn recolor_chunk(&mut self, chunk: &[Value]) -> Option<Vec<Value>> {
        let mut best_costs = 0i64;
        let mut best_color: Option<RegUnit> = None;
        let mut best_sub: Vec<Value> = Vec::new();

        for color in self.reservoir.iter() {
            for &v in chunk {
                self.nodes.get_mut(&v).unwrap().fixed = false;
            }
            for &v in chunk {
                self.recolor(v, color, false);
                self.nodes.get_mut(&v).unwrap().fixed = true;
            }
            let sub: Vec<Value> = chunk
                .iter()
                .copied()
                .filter(|&v| self.func.vars[v].color == Color::Reg(color))
                .collect();
            let costs = self.chunk_costs(&sub);
            if costs > best_costs {
                best_costs = costs;
                best_color = Some(color);
                best_sub = sub;
            }
        }

        let best_color = best_color?;
        debug!(
            "chunk of {} nodes commits to unit {} ({} nodes)",
            chunk.len(),
            best_color,
            best_sub.len()
        );
        for &v in chunk {
            self.nodes.get_mut(&v).unwrap().fixed = false;
        }
        let sub_set: FxHashSet<Value> = best_sub.iter().copied().collect();
        for &v in &best_sub {
            self.recolor(v, best_color, true);
            self.nodes.get_mut(&v).unwrap().fixed = true;
        }

        if best_sub.len() != chunk.len() {
            Some(chunk.iter().copied().filter(|v| !sub_set.contains(v)).collect())
        } else {
            None
        }
    }

    /// Try to move `v` to `color`, pushing conflicting neighbors aside and
    /// rolling back the whole cluster if any cannot move.
    fn recolor(&mut self, v: Value, color: RegUnit, finalize: bool) {
        if self.nodes[&v].fixed || !self.is_color_admissible(v, color) {
            return;
        }

        let mut changed: Vec<Value> = Vec::new();
        self.set_color(v, color, &mut changed, finalize);

        for n in self.neighbors(v) {
            if !self.nodes.contains_key(&n) {
                continue;
            }
            if self.func.vars[n].color == Color::Reg(color)
                && !self.avoid_color(n, color, &mut changed, finalize)
            {
                // Could not displace the neighbor: undo the cluster.
                for &c in &changed {
                    let old = self.nodes[&c].old_color;
                    self.func.vars[c].color = old;
                }
            }
        }

        for c in changed {
            self.nodes.get_mut(&c).unwrap().fixed = false;
        }
    }

    fn set_color(&mut self, v: Value, color: RegUnit, changed: &mut Vec<Value>, finalize: bool) {
        let node = self.nodes.get_mut(&v).unwrap();
        node.fixed = true;
        node.old_color = self.func.vars[v].color;
        self.func.vars[v].color = Color::Reg(color);
        changed.push(v);
        if finalize {
            self.func.used_colors.insert(color);
        }
    }

    /// Move `v` off `color` onto the admissible alternative least used by
    /// its neighbors, recursing into any neighbor this displaces.
    fn avoid_color(
        &mut self,
        v: Value,
        color: RegUnit,
        changed: &mut Vec<Value>,
        finalize: bool,
    ) -> bool {
        if self.func.vars[v].color != Color::Reg(color) {
            return true;
        }
        if self.nodes[&v].fixed {
            return false;
        }

        let admissible: Vec<RegUnit> = self
            .reservoir
            .iter()
            .filter(|&c| c != color && self.is_color_admissible(v, c))
            .collect();
        if admissible.is_empty() {
            return false;
        }

        let neighbors = self.neighbors(v);
        let mut new_color = admissible[0];
        let mut min_used = usize::MAX;
        for &candidate in &admissible {
            let used = neighbors
                .iter()
                .filter(|&&n| self.func.vars[n].color == Color::Reg(candidate))
                .count();
            if used < min_used {
                min_used = used;
                new_color = candidate;
            }
        }

        self.set_color(v, new_color, changed, finalize);

        for n in neighbors {
            if !self.nodes.contains_key(&n) {
                continue;
            }
            if self.func.vars[n].color == Color::Reg(new_color)
                && !self.avoid_color(n, new_color, changed, finalize)
            {
                return false;
            }
        }
        true
    }

    /// A color is admissible unless some constrained occurrence of `v`
    /// demands a different register.
    fn is_color_admissible(&self, v: Value, color: RegUnit) -> bool {
        if let Some(def) = self.defuse.def_point(v) {
            for res in &self.func.insts[def.inst].ress {
                if res.value == v {
                    if let Some(ru) = res.constraint {
                        if ru != color {
                            return false;
                        }
                    }
                }
            }
        }
        for u in self.defuse.uses(v) {
            for arg in &self.func.insts[u.inst].args {
                if arg.operand.value() == Some(v) {
                    if let Some(ru) = arg.constraint {
                        if ru != color {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }
}
