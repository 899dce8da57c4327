use crate::config::RecvKind;
use crate::error::Result;
use crate::ir::{OpDesc, OpRole, Program, Variable, OP_ROLE};
use crate::passes::append_send::next_control_var;
use crate::passes::{PassContext, PassResult, ProgramPass};

/// Makes the startup program pull dense parameters from the servers.
#[derive(Default)]
pub struct InitFromServerPass;

impl InitFromServerPass {
    const NAME: &'static str = "init_from_server";
}

impl ProgramPass for InitFromServerPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let strategy = cx.strategy();
        let trainer_id = strategy.role_id();
        let recv_varnames: Vec<String> = strategy
            .communicator_recv_context(RecvKind::Dense)
            .into_iter()
            .flat_map(|context| context.origin_varnames)
            .collect();

        let barrier_out = next_control_var(program);
        program.create_var(Variable::control(barrier_out.as_str()));

        program.append_op(
            0,
            OpDesc::new("recv")
                .input("X", Vec::<String>::new())
                .output("Out", Vec::<String>::new())
                .attr("recv_varnames", recv_varnames)
                .attr("trainer_id", trainer_id)
                .attr(OP_ROLE, OpRole::RPC),
        )?;
        program.append_op(
            0,
            OpDesc::new("fetch_barrier")
                .output("Out", [barrier_out])
                .attr("endpoints", strategy.ps_endpoints().to_vec())
                .attr("trainer_id", trainer_id)
                .attr(OP_ROLE, OpRole::RPC),
        )?;
        Ok(PassResult::from_counts(2, 0, 0))
    }
}
