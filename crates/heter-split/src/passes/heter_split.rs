use crate::dataflow::find_block_joints;
use crate::error::Result;
use crate::ir::Program;
use crate::lowering::lower_heter_program;
use crate::partition::Partitioner;
use crate::passes::{PassContext, PassResult, ProgramPass};

/// Partitions the trainer by device, classifies segment boundaries and lowers
/// the configured heterogeneous device into a worker program.
///
/// The trainer itself is left untouched; the plan, the boundary details and
/// the worker program are stored in the [`PassContext`].
#[derive(Default)]
pub struct HeterSplitPass;

impl HeterSplitPass {
    const NAME: &'static str = "heter_split";
}

impl ProgramPass for HeterSplitPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let plan = Partitioner::new(cx.config).run(program)?;
        let details = find_block_joints(program, cx.strategy.origin_main_program(), &plan)?;

        let heter = if plan.is_partitioned() {
            let device = &cx.config.heter_device;
            Some(lower_heter_program(
                program,
                &mut *cx.strategy,
                &plan,
                &details,
                device,
            )?)
        } else {
            None
        };

        let changed = heter.is_some();
        cx.plan = Some(plan);
        cx.block_var_detail = details;
        cx.heter_program = heter;
        Ok(PassResult {
            changed,
            ..PassResult::default()
        })
    }
}
