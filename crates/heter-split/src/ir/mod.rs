//! In-memory program model: blocks, operators, variables and the editors over them.

mod index;
mod program;
mod rewriter;
mod text;

use thiserror::Error;

pub use index::BlockIndex;
pub use program::{
    AttrMap, AttrValue, Block, DType, Device, OpDesc, OpId, OpRole, Operator, Program, SlotMap,
    VarKind, Variable, EMPTY_VAR_NAME, GRAD_SUFFIX, OP_DEVICE, OP_NAMESCOPE, OP_ROLE,
    OP_ROLE_VAR,
};
pub use rewriter::BlockRewriter;

/// Errors surfaced by graph-model mutations and lookups.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("block {0} does not exist")]
    UnknownBlock(usize),
    #[error("operator {0} is not part of the block")]
    UnknownOperator(OpId),
    #[error("operator {0} is already present in the block")]
    DuplicateOp(OpId),
    #[error("variable `{0}` is not declared")]
    UnknownVariable(String),
    #[error("position {index} is out of range for block {block} with {len} operators")]
    PositionOutOfRange {
        block: usize,
        index: usize,
        len: usize,
    },
    #[error("variable `{var}` is still referenced by {op_type} {op}")]
    DanglingReference {
        var: String,
        op: OpId,
        op_type: String,
    },
}
