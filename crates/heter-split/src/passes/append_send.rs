use tracing::debug;

use crate::error::Result;
use crate::ir::{OpDesc, OpRole, Program, Variable, OP_ROLE};
use crate::lowering::STEP_COUNTER;
use crate::passes::{PassContext, PassResult, ProgramPass};

const CONTROL_VAR_PREFIX: &str = "__control_var@";

/// Appends one `send` per merged gradient of the trainer send context, plus a
/// `send_barrier` in barrier-synchronized modes.
#[derive(Default)]
pub struct AppendSendOpsPass;

impl AppendSendOpsPass {
    const NAME: &'static str = "append_send_ops";
}

impl ProgramPass for AppendSendOpsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let strategy = cx.strategy();
        let mode = strategy.distributed_mode();
        let endpoints = strategy.ps_endpoints().to_vec();
        let trainer_id = strategy.role_id();
        let contexts = strategy.trainer_send_context();

        let mut inserted = 0;
        let mut dummies = Vec::new();
        for context in &contexts {
            let inputs: Vec<String> = if context.merged_name == STEP_COUNTER {
                Vec::new()
            } else {
                context.origin_varnames.clone()
            };
            let mut outputs = Vec::new();
            if mode.is_barrier_synced() {
                let dummy = next_control_var(program);
                program.create_var(Variable::control(dummy.as_str()));
                outputs.push(dummy.clone());
                dummies.push(dummy);
            }
            program.append_op(
                0,
                OpDesc::new("send")
                    .input("X", inputs)
                    .output("Out", outputs)
                    .attr("send_varnames", vec![context.merged_name.as_str()])
                    .attr("merge_add", true)
                    .attr("use_send_handler", false)
                    .attr("endpoints", endpoints.clone())
                    .attr(OP_ROLE, OpRole::RPC),
            )?;
            inserted += 1;
        }

        if mode.is_barrier_synced() {
            program.append_op(
                0,
                OpDesc::new("send_barrier")
                    .input("X", dummies)
                    .output("Out", Vec::<String>::new())
                    .attr("endpoints", endpoints)
                    .attr("trainer_id", trainer_id)
                    .attr("half_async", true)
                    .attr(OP_ROLE, OpRole::RPC),
            )?;
            inserted += 1;
        }
        debug!(sends = contexts.len(), ?mode, "appended trainer sends");
        Ok(PassResult::from_counts(inserted, 0, 0))
    }
}

/// First `__control_var@N` not yet declared in the global block.
pub(crate) fn next_control_var(program: &Program) -> String {
    let mut n = 0usize;
    loop {
        let name = format!("{CONTROL_VAR_PREFIX}{n}");
        if !program.has_var(&name) {
            return name;
        }
        n += 1;
    }
}
