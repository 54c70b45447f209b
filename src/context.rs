//! The per-function compilation context.
//!
//! A `Context` bundles one function with the analyses the passes share:
//! control flow graph, dominator tree, def-use chains and liveness. The
//! pass pipelines mutate the function and re-derive whatever they made
//! stale; the context provides the recomputation choreography so each
//! driver states *what* it needs fresh rather than how to get it.

use crate::cfg_build;
use crate::constant_pool::ConstantPool;
use crate::defuse::DefUse;
use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Function, Type};
use crate::isa::TargetIsa;
use crate::liveness::Liveness;
use crate::result::CodegenResult;
use crate::ssa;

/// Diagnostic callback invoked when the vectorizer meets a type it cannot
/// widen; the core only forwards these to the front end.
pub type SimdDiagnostic = Box<dyn FnMut(Type, &str)>;

/// Persistent data structures for compiling one function.
pub struct Context {
    /// The function under compilation.
    pub func: Function,
    /// Control flow graph.
    pub cfg: ControlFlowGraph,
    /// Dominator tree, post-order and frontiers.
    pub domtree: DominatorTree,
    /// Def-use chains.
    pub defuse: DefUse,
    /// Live sets.
    pub liveness: Liveness,

    simd_diag: Option<SimdDiagnostic>,
}

impl Context {
    /// Wrap `func` in a fresh context.
    pub fn for_function(func: Function) -> Self {
        Self {
            func,
            cfg: ControlFlowGraph::new(),
            domtree: DominatorTree::new(),
            defuse: DefUse::new(),
            liveness: Liveness::new(),
            simd_diag: None,
        }
    }

    /// Install the un-vectorizable-type diagnostic sink.
    pub fn set_simd_diagnostic(&mut self, diag: SimdDiagnostic) {
        self.simd_diag = Some(diag);
    }

    /// Forward a vectorizer diagnostic to the front end, if a sink is set.
    pub fn report_unvectorizable(&mut self, ty: Type, what: &str) {
        if let Some(diag) = &mut self.simd_diag {
            diag(ty, what);
        }
    }

    /// Discover blocks, split critical edges and compute dominance.
    pub fn build_cfg(&mut self) {
        cfg_build::build_cfg(&mut self.func, &mut self.cfg);
        self.domtree.compute(&self.func, &self.cfg);
    }

    /// Construct SSA form. `build_cfg` must have run.
    pub fn construct_ssa(&mut self) {
        debug_assert!(self.domtree.is_valid());
        ssa::construct_ssa(&mut self.func, &self.cfg, &self.domtree);
    }

    /// Recompute post-order, dominator tree and frontiers after CFG edits.
    pub fn recompute_domtree(&mut self) {
        self.domtree.compute(&self.func, &self.cfg);
    }

    /// Recompute def-use chains and liveness from the current instruction
    /// stream.
    pub fn recompute_analyses(&mut self) {
        self.defuse.compute(&self.func, &self.domtree);
        self.liveness.compute(&self.func, &self.cfg, &self.defuse);
    }

    /// Run the whole back end for this function: register allocation, then
    /// assembly emission into `out`.
    pub fn compile(
        &mut self,
        isa: &dyn TargetIsa,
        pool: &mut ConstantPool,
        out: &mut String,
        seq: u32,
    ) -> CodegenResult<()> {
        isa.regalloc(self)?;
        isa.codegen(self, pool, out, seq)
    }
}
