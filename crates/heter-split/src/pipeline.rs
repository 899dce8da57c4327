use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info, trace};

use crate::config::{FleetStrategy, PassConfig};
use crate::dataflow::BlockVarDetail;
use crate::error::Result;
use crate::ir::Program;
use crate::partition::PartitionPlan;
use crate::passes::{
    AppendSendOpsPass, AssembleTrainerPass, DeleteExtraOptimizesPass, DeleteOptimizerPass,
    FakeInitTablesPass, FusedLookup, HeterSplitPass, InitFromServerPass, PassContext,
    PassResult, ProgramPass, SparseLookupFusionPass,
};

/// Program a step rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Main,
    Startup,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Main => f.write_str("main"),
            Target::Startup => f.write_str("startup"),
        }
    }
}

pub struct Step {
    pub target: Target,
    pub pass: Box<dyn ProgramPass>,
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn main(&mut self, pass: impl ProgramPass + 'static) {
        self.steps.push(Step {
            target: Target::Main,
            pass: Box::new(pass),
        });
    }

    pub fn startup(&mut self, pass: impl ProgramPass + 'static) {
        self.steps.push(Step {
            target: Target::Startup,
            pass: Box::new(pass),
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Programs handed to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct TrainerPrograms {
    pub main: Program,
    pub startup: Program,
}

/// Statistics of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub pass: &'static str,
    pub target: Target,
    pub result: PassResult,
}

/// Metadata collected while rewriting.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub pull_sparse: BTreeMap<String, FusedLookup>,
    /// Device partition of the trainer; also the heterogeneous-op map.
    pub plan: Option<PartitionPlan>,
    pub block_var_detail: Vec<BlockVarDetail>,
    pub passes: Vec<PassStats>,
    pub stats: PassResult,
}

/// Pipeline output.
#[derive(Debug, Clone)]
pub struct HeterPrograms {
    pub trainer: Program,
    pub startup: Program,
    /// Worker program; `None` when no operator left the default device.
    pub heter: Option<Program>,
    pub report: PipelineReport,
}

/// Fixed sequence of passes splitting a trainer into trainer and worker programs.
pub struct HeterPipeline {
    config: PassConfig,
    steps: Vec<Step>,
}

impl HeterPipeline {
    pub fn new(config: PassConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = PipelineBuilder::new();
        builder.main(DeleteOptimizerPass);
        builder.main(SparseLookupFusionPass);
        builder.main(AppendSendOpsPass);
        if config.init_from_server {
            builder.startup(InitFromServerPass);
        }
        builder.startup(FakeInitTablesPass);
        builder.main(HeterSplitPass);
        builder.main(AssembleTrainerPass);
        builder.startup(DeleteExtraOptimizesPass);
        Ok(Self {
            config,
            steps: builder.finish(),
        })
    }

    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    pub fn steps(&self) -> impl Iterator<Item = (Target, &'static str)> + '_ {
        self.steps.iter().map(|step| (step.target, step.pass.name()))
    }

    pub fn run(
        &self,
        programs: TrainerPrograms,
        strategy: &mut dyn FleetStrategy,
    ) -> Result<HeterPrograms> {
        let TrainerPrograms {
            mut main,
            mut startup,
        } = programs;
        let mut cx = PassContext::new(&self.config, strategy);
        let mut report = PipelineReport::default();

        for step in &self.steps {
            let program = match step.target {
                Target::Main => &mut main,
                Target::Startup => &mut startup,
            };
            let result = step.pass.run(program, &mut cx)?;
            debug!(
                pass = step.pass.name(),
                target = %step.target,
                changed = result.changed,
                inserted = result.inserted_ops,
                erased_ops = result.erased_ops,
                erased_vars = result.erased_vars,
                "pass finished"
            );
            trace!(pass = step.pass.name(), "{program}");
            report.stats = report.stats.merge(result);
            report.passes.push(PassStats {
                pass: step.pass.name(),
                target: step.target,
                result,
            });
        }

        report.pull_sparse = std::mem::take(&mut cx.pull_sparse);
        report.plan = cx.plan.take();
        report.block_var_detail = std::mem::take(&mut cx.block_var_detail);
        let heter = cx.heter_program.take();
        info!(
            trainer_ops = main.global_block().ops.len(),
            startup_ops = startup.global_block().ops.len(),
            heter_blocks = heter.as_ref().map_or(0, |p| p.num_blocks().saturating_sub(1)),
            "heterogeneous split finished"
        );
        Ok(HeterPrograms {
            trainer: main,
            startup,
            heter,
            report,
        })
    }
}
