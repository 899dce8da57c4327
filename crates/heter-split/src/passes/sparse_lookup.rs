use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Result, RewriteError};
use crate::ir::{AttrValue, BlockRewriter, OpDesc, OpId, Program};
use crate::passes::{PassContext, PassResult, ProgramPass};

const LOOKUP_OP: &str = "lookup_table";
const FUSED_OP: &str = "distributed_lookup_table";

/// One fused pull of a remotely prefetched embedding table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedLookup {
    pub op: OpId,
    pub ids: Vec<String>,
    pub outputs: Vec<String>,
    pub tables: Vec<String>,
}

/// Replaces every group of remote-prefetch `lookup_table` ops sharing a
/// parameter with one `distributed_lookup_table`.
#[derive(Default)]
pub struct SparseLookupFusionPass;

impl SparseLookupFusionPass {
    const NAME: &'static str = "sparse_lookup_fusion";
}

struct LookupGroup {
    ops: Vec<OpId>,
    ids: Vec<String>,
    outputs: Vec<String>,
    padding_idx: i64,
    is_distributed: bool,
}

impl ProgramPass for SparseLookupFusionPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let groups = collect_groups(program);
        if groups.is_empty() {
            return Ok(PassResult::default());
        }

        let mut result = PassResult::default();
        let mut rw = program.rewriter(0)?;
        for (param, group) in groups {
            let erased = rw.erase_all(group.ops.iter().copied())?.len();
            let insert_at = last_producer(&rw, &group.ids).map_or(0, |pos| pos + 1);
            let first_consumer = first_consumer(&rw, &group.outputs).unwrap_or(rw.len());
            if insert_at > first_consumer {
                return Err(RewriteError::DegenerateLookupRange {
                    param,
                    insert_at,
                    first_consumer,
                });
            }

            let strategy = cx.strategy();
            let shards = strategy.var_distributed(&param, true);
            let tables: Vec<String> = shards.iter().map(|s| s.table.clone()).collect();
            let endpoints: Vec<String> = shards.iter().map(|s| s.endpoint.clone()).collect();
            let sections: Vec<i64> = shards.iter().map(|s| s.rows()).collect();

            let desc = OpDesc::new(FUSED_OP)
                .input("Ids", group.ids.iter().cloned())
                .input("W", [param.as_str()])
                .output("Outputs", group.outputs.iter().cloned())
                .attr("table_names", tables.clone())
                .attr("endpoints", endpoints)
                .attr("sections", sections)
                .attr("is_distributed", group.is_distributed)
                .attr("pserver_num", strategy.ps_endpoints().len() as i64)
                .attr("padding_idx", group.padding_idx)
                .attr("trainer_id", strategy.role_id());
            let op = rw.insert_at(insert_at, desc)?;
            debug!(param = %param, lookups = erased, at = insert_at, "fused sparse lookups");

            result = result.merge(PassResult::from_counts(1, erased, 0));
            cx.pull_sparse.insert(
                param,
                FusedLookup {
                    op,
                    ids: group.ids,
                    outputs: group.outputs,
                    tables,
                },
            );
        }
        Ok(result)
    }
}

fn collect_groups(program: &Program) -> BTreeMap<String, LookupGroup> {
    let mut groups: BTreeMap<String, LookupGroup> = BTreeMap::new();
    for op in &program.global_block().ops {
        let remote = op
            .attr("remote_prefetch")
            .and_then(AttrValue::as_bool)
            .unwrap_or(false);
        if op.op_type != LOOKUP_OP || !remote {
            continue;
        }
        let Some(param) = op.input("W").first() else {
            continue;
        };
        let group = groups.entry(param.clone()).or_insert_with(|| LookupGroup {
            ops: Vec::new(),
            ids: Vec::new(),
            outputs: Vec::new(),
            padding_idx: op
                .attr("padding_idx")
                .and_then(AttrValue::as_int)
                .unwrap_or(-1),
            is_distributed: op
                .attr("is_distributed")
                .and_then(AttrValue::as_bool)
                .unwrap_or(false),
        });
        group.ops.push(op.id);
        group.ids.extend(op.input("Ids").first().cloned());
        group.outputs.extend(op.output("Out").first().cloned());
    }
    groups
}

fn last_producer(rw: &BlockRewriter<'_>, vars: &[String]) -> Option<usize> {
    vars.iter()
        .flat_map(|var| rw.writers_of(var).iter())
        .filter_map(|op| rw.position(*op))
        .max()
}

fn first_consumer(rw: &BlockRewriter<'_>, vars: &[String]) -> Option<usize> {
    vars.iter()
        .flat_map(|var| rw.readers_of(var).iter())
        .filter_map(|op| rw.position(*op))
        .min()
}
