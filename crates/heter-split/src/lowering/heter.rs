use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::config::FleetStrategy;
use crate::dataflow::BlockVarDetail;
use crate::error::{Result, RewriteError};
use crate::ir::{
    AttrValue, BlockRewriter, Device, IrError, OpDesc, OpId, OpRole, Operator, Program, Variable,
    OP_ROLE,
};
use crate::lowering::adapters::{
    input_reshape_name, insert_concat, insert_reshape, insert_slices, output_reshape_name,
    CommInfo,
};
use crate::lowering::{clone_op_vars, send_ops_by_input};
use crate::partition::PartitionPlan;

/// Queue name of the per-step counter sent to the parameter servers.
pub const STEP_COUNTER: &str = "@PS_STEP_COUNTER@";

const RPC_THREAD_NUM: i64 = 12;

/// Builds the worker program serving every segment `plan` placed on `device`.
///
/// Each segment becomes one block of the result, wrapped in slice/reshape
/// adapters on entry and reshape/concat adapters on exit. Block 0 carries the
/// `listen_and_serv` descriptor routing joint inputs to their blocks.
pub fn lower_heter_program(
    trainer: &Program,
    strategy: &mut dyn FleetStrategy,
    plan: &PartitionPlan,
    details: &[BlockVarDetail],
    device: &Device,
) -> Result<Program> {
    let segments = plan
        .heter
        .get(device)
        .filter(|by_index| !by_index.is_empty())
        .ok_or_else(|| RewriteError::MissingHeterDevice(device.to_string()))?;

    let by_id: HashMap<OpId, &Operator> = trainer
        .global_block()
        .ops
        .iter()
        .map(|op| (op.id, op))
        .collect();
    let sends = send_ops_by_input(trainer);
    let owned: HashSet<OpId> = segments.values().flatten().copied().collect();

    let mut heter = Program::derived_from(trainer);
    let mut grad_to_block_id = Vec::new();
    let mut optimize_blocks = Vec::new();
    let mut sent_grads = BTreeSet::new();
    let no_detail = BlockVarDetail::default();

    for (&index, op_ids) in segments {
        let detail = details.get(index).unwrap_or(&no_detail);
        let block = heter.create_block(0)?;

        for id in op_ids {
            let op = by_id.get(id).ok_or(IrError::UnknownOperator(*id))?;
            clone_op_vars(&mut heter, trainer, op);
            let mut copy = Operator::clone(op);
            if copy.is_grad_op() {
                copy.set_attr(OP_ROLE, OpRole::BACKWARD);
            }
            heter.append_foreign_op(block, &copy)?;
        }
        for name in detail
            .entrance
            .iter()
            .chain(detail.exit.iter())
            .chain(detail.persistables.iter())
        {
            if let Some(var) = trainer.var(name) {
                heter.clone_variable(var);
            }
        }

        let joint_input = {
            let mut rw = heter.rewriter(block)?;
            let comm = CommInfo::compute(&rw, index, &detail.entrance, &detail.exit)?;
            let joint_input = comm.joint_input();
            wrap_block(&mut rw, &comm)?;
            joint_input
        };
        heter.force_device(block, device)?;

        // Sends already inside a segment travel with its operators.
        let mut copied = owned.clone();
        for grad in detail.persistable_grads() {
            let Some(send_id) = sends.get(grad) else {
                continue;
            };
            sent_grads.insert(grad.to_string());
            if !copied.insert(*send_id) {
                continue;
            }
            let send = by_id
                .get(send_id)
                .ok_or(IrError::UnknownOperator(*send_id))?;
            clone_op_vars(&mut heter, trainer, send);
            heter.append_op(block, send.to_desc())?;
        }

        debug!(segment = index, block, device = %device, "lowered heterogeneous segment");
        grad_to_block_id.push(format!("{joint_input}:{block}"));
        optimize_blocks.push(block);
    }

    if let Some(&last) = optimize_blocks.last() {
        heter.append_op(
            last,
            OpDesc::new("send")
                .input("X", Vec::<String>::new())
                .output("Out", Vec::<String>::new())
                .attr("send_varnames", vec![STEP_COUNTER])
                .attr("merge_add", true)
                .attr("use_send_handler", false)
                .attr("endpoints", strategy.ps_endpoints().to_vec())
                .attr(OP_ROLE, OpRole::RPC),
        )?;
    }

    heter.append_op(
        0,
        OpDesc::new("listen_and_serv")
            .input("X", Vec::<String>::new())
            .attr("grad_to_block_id", grad_to_block_id)
            .attr("sparse_grad_to_param", Vec::<String>::new())
            .attr("lr_decay_block_id", -1i64)
            .attr("dense_optimize_blocks", AttrValue::Blocks(Vec::new()))
            .attr("sparse_optimize_blocks", AttrValue::Blocks(Vec::new()))
            .attr("optimize_blocks", AttrValue::Blocks(optimize_blocks.clone()))
            .attr("endpoint", strategy.heter_worker_endpoint())
            .attr("Fanin", strategy.trainers())
            .attr("pserver_id", strategy.role_id())
            .attr("distributed_mode", strategy.distributed_mode().code())
            .attr("rpc_get_thread_num", RPC_THREAD_NUM)
            .attr("rpc_send_thread_num", RPC_THREAD_NUM)
            .attr("rpc_prefetch_thread_num", RPC_THREAD_NUM),
    )?;

    let unsent: Vec<String> = strategy
        .merged_grad_names()
        .into_iter()
        .filter(|grad| !sent_grads.contains(grad))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    for grad in &unsent {
        strategy.remove_var_pair_by_grad(grad);
    }

    info!(
        device = %device,
        blocks = optimize_blocks.len(),
        sent_grads = sent_grads.len(),
        dropped_pairs = unsent.len(),
        "built heterogeneous worker program"
    );
    Ok(heter)
}

/// Receiving adapters at the head of the block, sending adapters at its tail.
fn wrap_block(rw: &mut BlockRewriter<'_>, comm: &CommInfo) -> Result<()> {
    let joint_input = comm.joint_input();
    rw.create_var(Variable::new(
        joint_input.as_str(),
        vec![-1, comm.entrance.width()],
        comm.entrance.dtype(),
    ));
    let slices = insert_slices(rw, 0, &joint_input, &comm.entrance, input_reshape_name)?;
    let mut pos = slices.len();
    for slot in &comm.entrance.slots {
        insert_reshape(rw, pos, &input_reshape_name(&slot.name), &slot.name, &slot.shape)?;
        pos += 1;
    }

    let mut parts = Vec::with_capacity(comm.exit.slots.len());
    for slot in &comm.exit.slots {
        let target = output_reshape_name(&slot.name);
        let end = rw.len();
        insert_reshape(rw, end, &slot.name, &target, &[-1, slot.width])?;
        parts.push(target);
    }
    let end = rw.len();
    insert_concat(
        rw,
        end,
        &parts,
        &comm.joint_output(),
        comm.exit.width(),
        comm.exit.dtype(),
    )?;
    Ok(())
}
