use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::ir::Program;

/// Deletes every unreferenced variable of block 0 and returns their names.
pub fn sweep_unreferenced_vars(program: &mut Program) -> Result<Vec<String>> {
    let live: HashSet<String> = program
        .blocks()
        .iter()
        .flat_map(|block| block.ops.iter())
        .flat_map(|op| op.input_arg_names().chain(op.output_arg_names()))
        .map(str::to_string)
        .collect();

    let dead: Vec<String> = program
        .global_block()
        .vars
        .keys()
        .filter(|name| !live.contains(*name))
        .cloned()
        .collect();
    for name in &dead {
        program.remove_var(0, name)?;
    }
    if !dead.is_empty() {
        debug!(count = dead.len(), "swept unreferenced variables");
    }
    Ok(dead)
}
