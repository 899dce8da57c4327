//! Program-to-program rewrite passes run by [`crate::pipeline::HeterPipeline`].

mod append_send;
mod assemble_trainer;
mod dead_vars;
mod delete_optimizer;
mod extra_optimizes;
mod fake_init;
mod heter_split;
mod init_from_server;
mod sparse_lookup;

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{FleetStrategy, PassConfig};
use crate::dataflow::BlockVarDetail;
use crate::error::Result;
use crate::ir::{OpRole, Operator, Program, OP_NAMESCOPE};
use crate::partition::PartitionPlan;

pub use append_send::AppendSendOpsPass;
pub use assemble_trainer::AssembleTrainerPass;
pub use dead_vars::sweep_unreferenced_vars;
pub use delete_optimizer::DeleteOptimizerPass;
pub use extra_optimizes::DeleteExtraOptimizesPass;
pub use fake_init::FakeInitTablesPass;
pub use heter_split::HeterSplitPass;
pub use init_from_server::InitFromServerPass;
pub use sparse_lookup::{FusedLookup, SparseLookupFusionPass};

/// Name scope marking gradient-clipping operators.
pub const CLIP_NAMESCOPE: &str = "@CLIP";

/// Statistics returned by a [`ProgramPass`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the program.
    pub changed: bool,
    pub inserted_ops: usize,
    pub erased_ops: usize,
    pub erased_vars: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            inserted_ops: self.inserted_ops + other.inserted_ops,
            erased_ops: self.erased_ops + other.erased_ops,
            erased_vars: self.erased_vars + other.erased_vars,
        }
    }

    pub(crate) fn from_counts(inserted_ops: usize, erased_ops: usize, erased_vars: usize) -> Self {
        PassResult {
            changed: inserted_ops + erased_ops + erased_vars > 0,
            inserted_ops,
            erased_ops,
            erased_vars,
        }
    }
}

/// State shared by the passes of one pipeline run.
pub struct PassContext<'a> {
    config: &'a PassConfig,
    strategy: &'a mut dyn FleetStrategy,
    /// Fused sparse lookups keyed by parameter.
    pub pull_sparse: BTreeMap<String, FusedLookup>,
    pub plan: Option<PartitionPlan>,
    pub block_var_detail: Vec<BlockVarDetail>,
    /// Worker program produced by the split; `None` until then or when unpartitioned.
    pub heter_program: Option<Program>,
}

impl<'a> PassContext<'a> {
    pub fn new(config: &'a PassConfig, strategy: &'a mut dyn FleetStrategy) -> Self {
        Self {
            config,
            strategy,
            pull_sparse: BTreeMap::new(),
            plan: None,
            block_var_detail: Vec::new(),
            heter_program: None,
        }
    }

    pub fn config(&self) -> &PassConfig {
        self.config
    }

    pub fn strategy(&self) -> &dyn FleetStrategy {
        &*self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut dyn FleetStrategy {
        &mut *self.strategy
    }
}

/// A whole-program rewrite.
pub trait ProgramPass {
    fn name(&self) -> &'static str;
    fn run(&self, program: &mut Program, cx: &mut PassContext<'_>) -> Result<PassResult>;
}

/// Optimize-role operators, excluding gradient clipping.
pub(crate) fn is_optimize_op(op: &Operator) -> bool {
    op.role() == Some(OpRole::OPTIMIZE) && !is_clip_op(op)
}

pub(crate) fn is_clip_op(op: &Operator) -> bool {
    op.attr(OP_NAMESCOPE)
        .and_then(|scope| scope.as_str())
        .is_some_and(|scope| scope.contains(CLIP_NAMESCOPE))
}

pub(crate) fn is_lr_sched_op(op: &Operator) -> bool {
    let lr = OpRole::LR_SCHED;
    matches!(op.role(), Some(role) if role == lr || role == lr.union(OpRole::OPTIMIZE))
}

/// Inputs of `ops` that are not named in their `op_role_var`: optimizer state.
pub(crate) fn optimizer_state_vars<'a>(
    ops: impl IntoIterator<Item = &'a Operator>,
) -> BTreeSet<String> {
    let mut inputs = BTreeSet::new();
    let mut role_vars = BTreeSet::new();
    for op in ops {
        inputs.extend(op.input_arg_names().map(str::to_string));
        role_vars.extend(op.role_vars().iter().cloned());
    }
    inputs.retain(|name| !role_vars.contains(name));
    inputs
}

/// Removes `names` from the global block when no operator still references them.
/// Returns the number of variables removed.
pub(crate) fn remove_unreferenced(
    program: &mut Program,
    names: impl IntoIterator<Item = String>,
) -> Result<usize> {
    let mut removed = 0;
    for name in names {
        if !program.has_var(&name) {
            continue;
        }
        if program.is_var_referenced(&name) {
            tracing::debug!(var = %name, "keeping referenced variable");
            continue;
        }
        program.remove_var(0, &name)?;
        removed += 1;
    }
    Ok(removed)
}
