use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info};

use crate::config::FleetStrategy;
use crate::dataflow::{base_name, is_placeholder, BlockVarDetail};
use crate::error::Result;
use crate::ir::{Device, IrError, OpDesc, OpId, OpRole, Program, Variable, OP_ROLE};
use crate::lowering::adapters::{
    input_reshape_name, insert_concat, insert_reshape, insert_slices, output_reshape_name,
    CommInfo,
};
use crate::partition::PartitionPlan;
use crate::passes::sweep_unreferenced_vars;

/// Counts of the trainer-side rewrite.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrainerAssembly {
    pub replaced_segments: usize,
    pub inserted_ops: usize,
    pub erased_ops: usize,
    pub erased_vars: usize,
}

/// Replaces every heterogeneous segment of `program` with a remote call, drops
/// the sends that moved to the worker, sweeps variables left unreferenced and
/// puts every operator back on `default_device`.
pub fn assemble_trainer_program(
    program: &mut Program,
    strategy: &mut dyn FleetStrategy,
    plan: &PartitionPlan,
    details: &[BlockVarDetail],
    default_device: &Device,
) -> Result<TrainerAssembly> {
    let mut totals = TrainerAssembly::default();
    let no_detail = BlockVarDetail::default();
    let owned: HashSet<OpId> = plan
        .heter
        .values()
        .flat_map(|by_index| by_index.values())
        .flatten()
        .copied()
        .collect();
    for device in plan.heter_devices() {
        for segment in plan.segments_on(device) {
            let (index, ops) = (segment.index, &segment.ops);
            let detail = details.get(index).unwrap_or(&no_detail);
            let (inserted, erased) = replace_segment(program, strategy, index, ops, detail)?;
            let removed_sends = remove_trainer_sends(program, strategy, detail, &owned)?;
            totals.replaced_segments += 1;
            totals.inserted_ops += inserted;
            totals.erased_ops += erased + removed_sends;
        }
    }
    totals.erased_vars = sweep_unreferenced_vars(program)?.len();
    program.force_device(0, default_device)?;
    info!(
        segments = totals.replaced_segments,
        inserted = totals.inserted_ops,
        erased = totals.erased_ops,
        swept = totals.erased_vars,
        "assembled trainer program"
    );
    Ok(totals)
}

/// Swaps the operators of segment `index` for its remote-call wiring, inserted
/// where the segment's first operator was. Returns `(inserted, erased)` counts.
pub fn replace_segment(
    program: &mut Program,
    strategy: &dyn FleetStrategy,
    index: usize,
    ops: &[OpId],
    detail: &BlockVarDetail,
) -> Result<(usize, usize)> {
    let Some(&first) = ops.first() else {
        return Ok((0, 0));
    };
    let mut rw = program.rewriter(0)?;
    let mut pos = rw.position(first).ok_or(IrError::UnknownOperator(first))?;
    let erased = rw.erase_all(ops.iter().copied())?.len();
    let comm = CommInfo::compute(&rw, index, &detail.entrance, &detail.exit)?;
    let start = pos;

    let mut parts = Vec::with_capacity(comm.entrance.slots.len());
    for slot in &comm.entrance.slots {
        let target = output_reshape_name(&slot.name);
        insert_reshape(&mut rw, pos, &slot.name, &target, &[-1, slot.width])?;
        parts.push(target);
        pos += 1;
    }
    let joint_input = comm.joint_input();
    insert_concat(
        &mut rw,
        pos,
        &parts,
        &joint_input,
        comm.entrance.width(),
        comm.entrance.dtype(),
    )?;
    pos += 1;

    let joint_output = comm.joint_output();
    rw.create_var(Variable::new(
        joint_output.as_str(),
        vec![-1, comm.exit.width()],
        comm.exit.dtype(),
    ));
    let call = OpDesc::new("send_and_recv")
        .input("X", [joint_input.as_str()])
        .output("Out", [joint_output.as_str()])
        .attr("send_var_name", joint_input.as_str())
        .attr("recv_var_name", joint_output.as_str())
        .attr("endpoint", strategy.heter_worker_endpoint())
        .attr("trainer_id", strategy.role_id())
        .attr(OP_ROLE, OpRole::RPC);
    rw.insert_at(pos, call)?;
    pos += 1;

    pos += insert_slices(&mut rw, pos, &joint_output, &comm.exit, input_reshape_name)?.len();
    for slot in &comm.exit.slots {
        insert_reshape(&mut rw, pos, &input_reshape_name(&slot.name), &slot.name, &slot.shape)?;
        pos += 1;
    }

    debug!(
        segment = index,
        erased,
        inserted = pos - start,
        send = %joint_input,
        recv = %joint_output,
        "replaced segment with remote call"
    );
    Ok((pos - start, erased))
}

/// Removes every `send` of a variable whose base name is a persistable of the
/// segment and asks the strategy to forget those gradient pairs.
///
/// Sends in `owned` belong to a heterogeneous segment: their pairs are still
/// forgotten, but the operator is left for that segment's replacement.
pub fn remove_trainer_sends(
    program: &mut Program,
    strategy: &mut dyn FleetStrategy,
    detail: &BlockVarDetail,
    owned: &HashSet<OpId>,
) -> Result<usize> {
    let mut doomed = BTreeSet::new();
    let mut grads = BTreeSet::new();
    for op in &program.global_block().ops {
        if op.op_type != "send" {
            continue;
        }
        for name in op.input_arg_names().filter(|name| !is_placeholder(name)) {
            if detail.persistables.contains(base_name(name)) {
                grads.insert(name.to_string());
                if !owned.contains(&op.id) {
                    doomed.insert(op.id);
                }
            }
        }
    }
    let erased = program.rewriter(0)?.erase_all(doomed)?.len();
    for grad in &grads {
        strategy.remove_var_pair_by_grad(grad);
    }
    if erased > 0 {
        debug!(sends = erased, grads = grads.len(), "removed trainer sends");
    }
    Ok(erased)
}
