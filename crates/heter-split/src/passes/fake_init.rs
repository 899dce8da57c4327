use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{Result, RewriteError};
use crate::ir::{AttrValue, IrError, OpDesc, Program};
use crate::passes::{PassContext, PassResult, ProgramPass};

/// Swaps the initializer of every sparse or distributed table in the startup
/// program for a `fake_init`; table contents live on the servers.
#[derive(Default)]
pub struct FakeInitTablesPass;

impl FakeInitTablesPass {
    const NAME: &'static str = "fake_init_tables";
}

/// `W` of every `lookup_table` in `origin` marked sparse or distributed.
pub(crate) fn sparse_table_names(origin: &Program) -> BTreeSet<String> {
    let flag = |value: Option<&AttrValue>| value.and_then(AttrValue::as_bool).unwrap_or(false);
    origin
        .global_block()
        .ops
        .iter()
        .filter(|op| op.op_type == "lookup_table")
        .filter(|op| flag(op.attr("is_sparse")) || flag(op.attr("is_distributed")))
        .filter_map(|op| op.input("W").first().cloned())
        .collect()
}

impl ProgramPass for FakeInitTablesPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let tables = sparse_table_names(cx.strategy().origin_main_program());
        let mut result = PassResult::default();
        for table in tables {
            let initializers: Vec<_> = program
                .global_block()
                .ops
                .iter()
                .filter(|op| op.writes(&table))
                .collect();
            if initializers.len() != 1 {
                return Err(RewriteError::TableInitializerCount {
                    count: initializers.len(),
                    table,
                });
            }
            let init = initializers[0];
            let id = init.id;
            let shape = init
                .attr("shape")
                .cloned()
                .unwrap_or(AttrValue::Ints(Vec::new()));

            program.append_op(
                0,
                OpDesc::new("fake_init")
                    .output("Out", [table.as_str()])
                    .attr("shape", shape),
            )?;
            let pos = program
                .global_block()
                .position_of(id)
                .ok_or(IrError::UnknownOperator(id))?;
            program.remove_op(0, pos)?;
            debug!(table = %table, "replaced table initializer with fake_init");
            result = result.merge(PassResult::from_counts(1, 1, 0));
        }
        Ok(result)
    }
}
