//! Belady-style spilling.
//!
//! One spiller instance runs per register class, parametrized by the number
//! of allocatable registers `k` in that class. A local pass walks every
//! block in dominator-tree pre-order keeping the `k` variables whose next
//! use is nearest in registers, inserting `Spill`s for the furthest-used
//! variable under pressure and `Reload`s in front of uses. A global
//! combine pass then patches block boundaries: phi results that did not
//! stay in registers become *phi-spills*, and registers expected on entry
//! that a predecessor does not deliver get edge reloads.
//!
//! Every inserted spill and reload is a new definition; SSA form is
//! repaired at the end through `ssa::reconstruct_ssa`. The dominating-spill
//! invariant — every reload is dominated by a spill of the same memory
//! variable — is maintained by `insert_spill_if_necessary`.

use crate::defuse::{DefUse, DefUsePoint};
use crate::dominator_tree::DominatorTree;
use crate::entity::SecondaryMap;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Arg, Block, Function, Inst, InstructionData, RegClass, Value};
use crate::liveness::Liveness;
use crate::ssa::{self, VarDefUse};
use log::debug;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::collections::BTreeMap;

const INFINITY: i64 = i64::MAX;

/// The spiller for one register class.
pub struct Spiller<'a> {
    func: &'a mut Function,
    cfg: &'a ControlFlowGraph,
    domtree: &'a DominatorTree,
    liveness: &'a Liveness,
    defuse: &'a DefUse,
    num_regs: usize,
    class: RegClass,

    /// Variable -> its current memory counterpart. Phi-spilled variables
    /// map to themselves.
    spill_map: BTreeMap<Value, Value>,
    /// Per spilled variable: the memory defs created for it and their uses.
    spills: BTreeMap<Value, VarDefUse>,
    /// Per reloaded variable: the reload defs plus the original def/uses.
    reloads: BTreeMap<Value, VarDefUse>,

    /// Variables expected in registers on entry of each block.
    in_regs: SecondaryMap<Block, FxHashSet<Value>>,
    /// Residual register set at the end of each block.
    out_regs: SecondaryMap<Block, FxHashSet<Value>>,

    /// Reloads for variables that were discarded on block entry but are in
    /// the passed set; inserted after the combine pass.
    later_reloads: Vec<(Value, Inst, Block)>,
    /// Phi argument slots to be replaced by their spilled counterparts.
    substitutes: Vec<(Inst, usize)>,
    /// Phi-spilled phis: (result, phi, block).
    phi_spills: Vec<(Value, Inst, Block)>,
}

impl<'a> Spiller<'a> {
    /// Create a spiller for `class` with `num_regs` allocatable registers.
    pub fn new(
        func: &'a mut Function,
        cfg: &'a ControlFlowGraph,
        domtree: &'a DominatorTree,
        liveness: &'a Liveness,
        defuse: &'a DefUse,
        num_regs: usize,
        class: RegClass,
    ) -> Self {
        Self {
            func,
            cfg,
            domtree,
            liveness,
            defuse,
            num_regs,
            class,
            spill_map: BTreeMap::new(),
            spills: BTreeMap::new(),
            reloads: BTreeMap::new(),
            in_regs: SecondaryMap::new(),
            out_regs: SecondaryMap::new(),
            later_reloads: Vec::new(),
            substitutes: Vec::new(),
            phi_spills: Vec::new(),
        }
    }

    /// Run the whole pass: local spilling, global combine, deferred
    /// reloads, phi-spill substitution and SSA repair.
    pub fn run(mut self) {
        let entry = self.func.entry.expand().expect("no entry block");
        let order = self.domtree.pre_order(entry);

        for &block in &order {
            self.spill_block(block);
        }
        for &block in &order {
            self.combine_block(block);
        }

        // Deferred reloads of variables discarded on block entry. A reload
        // the combine pass has already placed at the same instruction is
        // not inserted twice.
        let mut seen: FxHashSet<(Value, Inst)> = FxHashSet::default();
        let later = std::mem::take(&mut self.later_reloads);
        for (var, pos, block) in later {
            if !seen.insert((var, pos)) {
                continue;
            }
            self.insert_spill_if_necessary(var, block);
            self.insert_reload(block, var, pos);
        }

        // Substitute phi-spill arguments with their memory counterparts.
        let substitutes = std::mem::take(&mut self.substitutes);
        for (phi, idx) in substitutes {
            let old = self.func.insts[phi].args[idx]
                .operand
                .value()
                .expect("phi-spill argument must be a variable");
            let mem = *self
                .spill_map
                .get(&old)
                .expect("phi-spill argument was never spilled");
            self.func.insts[phi].args[idx].operand = mem.into();
        }

        // Register the (substituted) arguments of every phi-spill as uses
        // of the corresponding spill record, each in its source block.
        let phi_spills = std::mem::take(&mut self.phi_spills);
        for (original, phi, _block) in phi_spills {
            let nargs = self.func.insts[phi].args.len();
            let mut args: SmallVec<[(Value, Block); 4]> = SmallVec::new();
            for i in 0..nargs {
                if let Some(v) = self.func.insts[phi].args[i].operand.value() {
                    let src = self.func.insts[phi]
                        .phi_source(i)
                        .expect("phi argument without source block");
                    args.push((v, src));
                }
            }
            let vdu = self.spills.get_mut(&original).expect("missing spill record");
            for (arg, src) in args {
                vdu.uses.push((arg, DefUsePoint { inst: phi, block: src }));
            }
        }

        // Every spill reads its variable, so the spill sites are uses the
        // reload repair must know about.
        let spill_uses: Vec<(Value, Vec<DefUsePoint>)> = self
            .spills
            .iter()
            .map(|(&var, vdu)| (var, vdu.defs.iter().map(|&(_, p)| p).collect()))
            .collect();
        for (var, points) in spill_uses {
            if let Some(vdu) = self.reloads.get_mut(&var) {
                for p in points {
                    vdu.uses.push((var, p));
                }
            }
        }

        // Rewire and repair SSA form.
        let mut spills = std::mem::take(&mut self.spills);
        for vdu in spills.values_mut() {
            ssa::reconstruct_ssa(self.func, self.cfg, self.domtree, vdu);
        }
        let mut reloads = std::mem::take(&mut self.reloads);
        for vdu in reloads.values_mut() {
            ssa::reconstruct_ssa(self.func, self.cfg, self.domtree, vdu);
        }
    }

    /// Does `v` take part in this round: a colorable register variable of
    /// the spiller's class? Variables excluded from allocation (fused
    /// comparison results) never touch a register.
    fn participates(&self, v: Value) -> bool {
        self.func.vars[v].colorable_reg(self.class)
    }

    /*
     * Distance calculation (Belady).
     */

    /// Distance from (the instruction after) `inst` to the next use of `v`.
    fn distance(&self, block: Block, v: Value, inst: Inst) -> i64 {
        let instr = &self.func.insts[inst];
        if instr.is_jump() {
            let mut min = INFINITY;
            for target in instr.jump_targets() {
                let tb = self
                    .func
                    .layout
                    .inst_block(target)
                    .expect("jump target without block");
                let mut walked = FxHashSet::default();
                walked.insert(tb);
                min = min.min(self.distance_here(v, target, walked));
            }
            return min;
        }
        let next = match self.func.layout.next_inst(inst) {
            Some(n) => n,
            None => return INFINITY,
        };
        let mut walked = FxHashSet::default();
        walked.insert(block);
        self.distance_here(v, next, walked)
    }

    /// Walk forward from `inst` counting instructions until `v` is used.
    /// Labels and phis are free; jumps fork the walk with a copy of the
    /// visited set per target.
    fn distance_here(&self, v: Value, start: Inst, mut walked: FxHashSet<Block>) -> i64 {
        let mut dist = 0i64;
        let mut inst = start;
        loop {
            let instr = &self.func.insts[inst];
            if instr.uses_value(v) {
                return dist;
            }
            if !self.liveness.inst_live_in(inst).contains(&v) {
                return INFINITY;
            }
            if instr.is_jump() {
                let mut min = INFINITY;
                for target in instr.jump_targets() {
                    let tb = self
                        .func
                        .layout
                        .inst_block(target)
                        .expect("jump target without block");
                    if walked.contains(&tb) {
                        continue;
                    }
                    let mut w = walked.clone();
                    w.insert(tb);
                    min = min.min(self.distance_here(v, target, w));
                }
                return if min == INFINITY {
                    INFINITY
                } else {
                    min.saturating_add(dist + 1)
                };
            }
            if !(instr.is_label() || instr.is_phi()) {
                dist += 1;
            }
            let next = match self.func.layout.next_inst(inst) {
                Some(n) => n,
                None => return INFINITY,
            };
            if self.func.insts[next].is_label() {
                let nb = self
                    .func
                    .layout
                    .inst_block(next)
                    .expect("label without block");
                if walked.contains(&nb) {
                    return INFINITY;
                }
                walked.insert(nb);
            }
            inst = next;
        }
    }

    /*
     * Local pass.
     */

    fn spill_block(&mut self, block: Block) {
        // The passed set: class-matching variables live into the block plus
        // the results of its phis.
        let mut passed: Vec<Value> = self
            .liveness
            .block_live_in(block)
            .iter()
            .copied()
            .filter(|&v| self.participates(v))
            .collect();
        for phi in self.func.layout.block_phis(block).collect::<Vec<_>>() {
            let res = self.func.insts[phi].phi_result();
            if self.participates(res) && !passed.contains(&res) {
                passed.push(res);
            }
        }
        passed.sort_unstable();
        let passed_set: FxHashSet<Value> = passed.iter().copied().collect();

        // Seed the distance bag; phi arguments are consumed before the
        // ordinary region, so distances start just before `first_ordinary`.
        let seed_pos = match self.func.layout.block(block).first_ordinary.expand() {
            Some(fo) => self
                .func
                .layout
                .prev_inst(fo)
                .expect("first ordinary cannot start the stream"),
            None => self.func.layout.last_inst_of(block),
        };
        let mut bag: Vec<(Value, i64)> = passed
            .iter()
            .map(|&v| (v, self.distance(block, v, seed_pos)))
            .collect();

        // Keep only the k nearest.
        while bag.len() > self.num_regs {
            let idx = farthest(&bag);
            bag.remove(idx);
        }

        let mut in_vars: FxHashSet<Value> = bag.iter().map(|&(v, _)| v).collect();
        let mut in_b: FxHashSet<Value> = FxHashSet::default();

        let ordinary: Vec<Inst> = self.func.layout.block_ordinary(block).collect();
        for inst in ordinary {
            // Spills and reloads for this instruction go right before it.
            let pos = self
                .func
                .layout
                .prev_inst(inst)
                .expect("ordinary instruction at stream start");

            // Make sure all arguments are in registers, counting reloads.
            let mut num_reloads = 0usize;
            let args: SmallVec<[Value; 4]> = self.func.insts[inst]
                .args
                .iter()
                .filter_map(|a| a.operand.value())
                .filter(|&v| self.participates(v))
                .collect();
            for var in args {
                if bag.iter().any(|&(v, _)| v == var) {
                    // Used before discarded: it stays a register entry.
                    if in_vars.remove(&var) {
                        in_b.insert(var);
                    }
                    continue;
                }
                if !in_b.contains(&var) && passed_set.contains(&var) {
                    // Discarded on entry; reload later so the dominating
                    // spill can be placed once combine has run.
                    self.later_reloads.push((var, pos, block));
                } else {
                    self.insert_reload(block, var, pos);
                }
                let d = self.distance(block, var, inst);
                bag.push((var, d));
                num_reloads += 1;
            }

            // Room for the results: spill the furthest-used variables.
            let num_lhs = self.func.insts[inst]
                .ress
                .iter()
                .filter(|r| self.participates(r.value))
                .count();
            assert!(
                num_lhs <= self.num_regs,
                "more results than registers in class"
            );
            let num_remove =
                (num_lhs + num_reloads + bag.len()).saturating_sub(self.num_regs);
            for _ in 0..num_remove.min(bag.len()) {
                let idx = farthest(&bag);
                let (to_spill, _) = bag.remove(idx);
                if in_vars.remove(&to_spill) {
                    // Never used since entry: pretend it was discarded.
                    continue;
                }
                if self.liveness.inst_live_out(inst).contains(&to_spill) {
                    self.insert_spill(block, to_spill, pos);
                }
            }

            // Age the distances; re-measure any that reached their use.
            for entry in bag.iter_mut() {
                if entry.1 != INFINITY {
                    entry.1 -= 1;
                }
            }
            let stale: SmallVec<[usize; 4]> = bag
                .iter()
                .enumerate()
                .filter(|(_, &(_, d))| d < 0)
                .map(|(i, _)| i)
                .collect();
            for i in stale {
                let v = bag[i].0;
                bag[i].1 = self.distance(block, v, inst);
            }

            // Results now occupy registers, unless the definition is dead.
            let ress: SmallVec<[Value; 2]> = self.func.insts[inst]
                .ress
                .iter()
                .map(|r| r.value)
                .filter(|&v| self.participates(v))
                .collect();
            for var in ress {
                if self.liveness.inst_live_out(inst).contains(&var) {
                    let d = self.distance(block, var, inst);
                    bag.push((var, d));
                }
            }
        }

        in_b.extend(in_vars);
        self.in_regs[block] = in_b;
        self.out_regs[block] = bag.into_iter().map(|(v, _)| v).collect();
    }

    /*
     * Global combine.
     */

    fn combine_block(&mut self, block: Block) {
        let mut in_b = self.in_regs[block].clone();

        // Phi results either stay in registers across the boundary or turn
        // into phi-spills living in a slot of their own.
        let phis: Vec<Inst> = self.func.layout.block_phis(block).collect();
        for phi in phis {
            let phi_res = self.func.insts[phi].phi_result();
            if !self.participates(phi_res) {
                continue;
            }
            let phi_spill = !in_b.remove(&phi_res);

            let nargs = self.func.insts[phi].args.len();
            for i in 0..nargs {
                let src = self.func.insts[phi]
                    .phi_source(i)
                    .expect("phi argument without source block");
                let arg = match self.func.insts[phi].args[i].operand.value() {
                    Some(v) => v,
                    None => continue, // undef argument: nothing to carry over
                };
                debug_assert!(
                    !self.func.vars[arg].is_spilled(),
                    "phi argument already in memory"
                );
                let arg_in_out = self.out_regs[src].contains(&arg);

                if phi_spill && arg_in_out {
                    self.out_regs[src].remove(&arg);
                    let pos = self.back_spill_pos(src);
                    self.insert_spill(src, arg, pos);
                    self.substitutes.push((phi, i));
                } else if phi_spill && !arg_in_out {
                    self.substitutes.push((phi, i));
                } else if !phi_spill && !arg_in_out {
                    self.insert_spill_if_necessary(arg, src);
                    let pos = self.back_reload_pos(src);
                    self.insert_reload(src, arg, pos);
                }
            }

            if phi_spill {
                debug!("phi-spilling {} in {}", phi_res, block);
                match &mut self.func.vars[phi_res].kind {
                    crate::ir::VarKind::Reg { is_spilled } => *is_spilled = true,
                    _ => panic!("phi-spill of a non-register"),
                }
                let mut vdu = VarDefUse::new();
                vdu.defs.push((phi_res, DefUsePoint { inst: phi, block }));
                self.spills.insert(phi_res, vdu);
                // Phi-spills map to themselves.
                self.spill_map.insert(phi_res, phi_res);
                self.phi_spills.push((phi_res, phi, block));
            }
        }

        // Registers expected on entry that a predecessor does not deliver
        // are reloaded on the edge.
        let preds: SmallVec<[Block; 4]> = self.cfg.preds(block).iter().copied().collect();
        for pred in preds {
            let (append_block, append_pos) = if self.cfg.num_preds(block) == 1 {
                (block, self.reload_pos(block))
            } else {
                debug_assert!(
                    self.cfg.num_succs(pred) == 1,
                    "critical edge survived into the spiller"
                );
                (pred, self.back_reload_pos(pred))
            };

            let mut missing: Vec<Value> = in_b
                .iter()
                .copied()
                .filter(|v| !self.out_regs[pred].contains(v))
                .collect();
            missing.sort_unstable();

            for var in missing {
                self.insert_spill_if_necessary(var, pred);
                self.insert_reload(append_block, var, append_pos);
            }
        }
    }

    /*
     * Spill and reload insertion.
     */

    /// Insert `mem = spill var` after `pos` and record the new definition.
    fn insert_spill(&mut self, block: Block, var: Value, pos: Inst) -> Value {
        debug_assert!(self.participates(var), "wrong variable class");
        let ty = self.func.vars[var].ty;
        let mem = self.func.new_spilled_ssa_reg(ty);
        let res = self.func.make_res(mem);
        let spill = self.func.create_inst(
            InstructionData::Spill,
            [res].into_iter().collect(),
            [Arg::new(var)].into_iter().collect(),
        );
        self.func.insert_inst_after(spill, pos);
        debug!("spill {} -> {} in {}", var, mem, block);

        let point = DefUsePoint { inst: spill, block };
        if self.spill_map.insert(var, mem).is_none() {
            let mut vdu = VarDefUse::new();
            vdu.defs.push((mem, point));
            self.spills.insert(var, vdu);
        } else {
            self.spills
                .get_mut(&var)
                .expect("spill record out of sync")
                .defs
                .push((mem, point));
        }
        mem
    }

    /// Insert `var' = reload mem` after `pos` and record the definition.
    fn insert_reload(&mut self, block: Block, var: Value, pos: Inst) {
        debug_assert!(self.participates(var), "wrong variable class");
        let mem = *self
            .spill_map
            .get(&var)
            .expect("reload of a variable that was never spilled");
        debug_assert!(self.func.vars[mem].is_spilled(), "must be a memory variable");

        let new_var = self.func.clone_new_ssa(var);
        let res = self.func.make_res(new_var);
        let reload = self.func.create_inst(
            InstructionData::Reload,
            [res].into_iter().collect(),
            [Arg::new(mem)].into_iter().collect(),
        );
        self.func.insert_inst_after(reload, pos);
        debug!("reload {} <- {} in {}", new_var, mem, block);

        let point = DefUsePoint {
            inst: reload,
            block,
        };
        self.spills
            .get_mut(&var)
            .expect("spill record out of sync")
            .uses
            .push((mem, point));

        match self.reloads.get_mut(&var) {
            None => {
                let mut vdu = VarDefUse::new();
                vdu.defs.push((new_var, point));
                let orig_def = self
                    .defuse
                    .def_point(var)
                    .expect("reloaded variable without definition");
                vdu.defs.push((var, orig_def));
                vdu.uses
                    .extend(self.defuse.uses(var).iter().map(|&p| (var, p)));
                self.reloads.insert(var, vdu);
            }
            Some(vdu) => vdu.defs.push((new_var, point)),
        }
    }

    /// Walk the dominator chain upward from `block`; if no dominating block
    /// spills `var`, insert a spill right after its definition.
    fn insert_spill_if_necessary(&mut self, var: Value, block: Block) {
        if self.spill_map.contains_key(&var) {
            let entry = self.func.entry.expand().unwrap();
            let mut b = block;
            while b != entry && !self.has_spill_of(var, b) {
                b = self.domtree.idom(b).expect("idom chain ended early");
            }
            if b != entry || self.has_spill_of(var, entry) {
                return;
            }
        }

        let def = self
            .defuse
            .def_point(var)
            .expect("variable without definition");
        let pos = if self.func.insts[def.inst].is_phi() {
            // After the phi region.
            match self.func.layout.block(def.block).first_ordinary.expand() {
                Some(fo) => self.func.layout.prev_inst(fo).unwrap(),
                None => self.func.layout.last_inst_of(def.block),
            }
        } else {
            def.inst
        };
        self.insert_spill(def.block, var, pos);
    }

    /// Is `var` spilled inside `block`, either by an ordinary spill or as a
    /// phi-spill?
    fn has_spill_of(&self, var: Value, block: Block) -> bool {
        for phi in self.func.layout.block_phis(block) {
            if self.func.insts[phi].phi_result() == var {
                return true;
            }
        }
        for inst in self.func.layout.block_ordinary(block) {
            if matches!(self.func.insts[inst].data, InstructionData::Spill)
                && self.func.insts[inst].args[0].operand.value() == Some(var)
            {
                return true;
            }
        }
        false
    }

    /*
     * Insertion points.
     */

    /// The last instruction of `block` that is not a jump.
    fn last_non_jump(&self, block: Block) -> Inst {
        let last = self.func.layout.last_inst_of(block);
        if self.func.insts[last].is_jump() {
            self.func.layout.prev_inst(last).expect("jump at stream start")
        } else {
            last
        }
    }

    /// Position for an edge reload at the end of `block`: after everything
    /// but the jump.
    fn back_reload_pos(&self, block: Block) -> Inst {
        self.last_non_jump(block)
    }

    /// Position for an edge spill at the end of `block`: before the edge
    /// reloads already placed there.
    fn back_spill_pos(&self, block: Block) -> Inst {
        let begin = self.func.layout.block(block).begin;
        let mut pos = self.last_non_jump(block);
        while pos != begin && matches!(self.func.insts[pos].data, InstructionData::Reload) {
            pos = self.func.layout.prev_inst(pos).unwrap();
        }
        pos
    }

    /// Position for an entry reload at the top of `block`: after the spills
    /// already leading the ordinary region.
    fn reload_pos(&self, block: Block) -> Inst {
        debug_assert!(!self.func.block_has_phis(block), "phis at reload position");
        let mut cursor = self.func.layout.block(block).first_ordinary.expand();
        while let Some(i) = cursor {
            if !matches!(self.func.insts[i].data, InstructionData::Spill) {
                return self.func.layout.prev_inst(i).unwrap();
            }
            cursor = self.func.layout.next_inst(i);
        }
        self.func.layout.last_inst_of(block)
    }
}

/// Index of the entry with the greatest distance (ties broken toward the
/// higher-numbered variable, for determinism).
fn farthest(bag: &[(Value, i64)]) -> usize {
    debug_assert!(!bag.is_empty());
    let mut best = 0;
    for (i, &(v, d)) in bag.iter().enumerate().skip(1) {
        let (bv, bd) = bag[best];
        if d > bd || (d == bd && v > bv) {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_build::build_cfg;
    use crate::ir::{Opcode, Operand, Type};
    use crate::ssa::construct_ssa;

    /// Four values defined up front and summed later, with two registers:
    /// the spiller must park the excess, and every reload must be dominated
    /// by a spill of the same memory variable.
    #[test]
    fn reloads_dominated_by_spills() {
        let mut func = Function::with_name("p", &[8, 16]);
        let vars: Vec<Value> = (0..4).map(|_| func.new_reg(Type::Int32)).collect();
        let sum = func.new_reg(Type::Int32);

        func.emit_label();
        for (i, &v) in vars.iter().enumerate() {
            let c = func.new_const(Type::Int32, i as u64 + 1);
            func.emit_assign(Opcode::Mov, v, c, None);
        }
        func.emit_assign(Opcode::Add, sum, vars[0], Some(Operand::Value(vars[1])));
        func.emit_assign(Opcode::Add, sum, sum, Some(Operand::Value(vars[2])));
        func.emit_assign(Opcode::Add, sum, sum, Some(Operand::Value(vars[3])));
        func.emit_nop(sum);
        let end = func.create_inst(InstructionData::Label, SmallVec::new(), SmallVec::new());
        func.layout.push_back(end);

        let mut cfg = ControlFlowGraph::new();
        build_cfg(&mut func, &mut cfg);
        let mut domtree = DominatorTree::new();
        domtree.compute(&func, &cfg);
        construct_ssa(&mut func, &cfg, &domtree);

        let mut defuse = DefUse::new();
        defuse.compute(&func, &domtree);
        let mut liveness = Liveness::new();
        liveness.compute(&func, &cfg, &defuse);

        Spiller::new(
            &mut func, &cfg, &domtree, &liveness, &defuse, 2, RegClass::Gpr,
        )
        .run();

        defuse.compute(&func, &domtree);
        liveness.compute(&func, &cfg, &defuse);

        let insts: Vec<Inst> = func.layout.insts().collect();
        let spills = insts
            .iter()
            .filter(|&&i| matches!(func.insts[i].data, InstructionData::Spill))
            .count();
        let reloads: Vec<Inst> = insts
            .iter()
            .copied()
            .filter(|&i| matches!(func.insts[i].data, InstructionData::Reload))
            .collect();
        assert!(spills >= 2, "expected spills under pressure, got {}", spills);
        assert!(!reloads.is_empty(), "expected reloads under pressure");

        for reload in reloads {
            let mem = func.insts[reload].args[0]
                .operand
                .value()
                .expect("reload of a non-variable");
            assert!(func.vars[mem].is_spilled());
            let def = defuse.def_point(mem).expect("memory var without a spill");
            assert!(
                domtree.inst_dominates(&func, def.inst, reload),
                "reload not dominated by its spill"
            );
        }

        // The point of the exercise: register residency stays within k.
        for &inst in &insts {
            if func.insts[inst].is_label() {
                continue;
            }
            let resident = liveness
                .inst_live_in(inst)
                .iter()
                .filter(|&&v| func.vars[v].colorable_reg(RegClass::Gpr))
                .count();
            assert!(
                resident <= 2,
                "more than k values live in registers at {}",
                inst
            );
        }
    }
}
