use crate::ir::index::BlockIndex;
use crate::ir::program::{AttrValue, Block, OpDesc, OpId, Operator, Program, Variable};
use crate::ir::IrError;

/// Mutable editor over one block with stable operator ids.
///
/// Positions are tracked by an index that is shifted on every insertion and
/// erasure, so callers hold [`OpId`]s across edits instead of raw positions.
pub struct BlockRewriter<'a> {
    program: &'a mut Program,
    block: usize,
    index: BlockIndex,
}

impl<'a> BlockRewriter<'a> {
    pub fn new(program: &'a mut Program, block: usize) -> Result<Self, IrError> {
        let index = BlockIndex::build(program.block(block)?)?;
        Ok(Self {
            program,
            block,
            index,
        })
    }

    pub fn program(&self) -> &Program {
        &*self.program
    }

    pub fn block(&self) -> &Block {
        &self.program.blocks[self.block]
    }

    pub fn block_idx(&self) -> usize {
        self.block
    }

    pub fn len(&self) -> usize {
        self.block().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block().ops.is_empty()
    }

    pub fn position(&self, op: OpId) -> Option<usize> {
        self.index.position(op)
    }

    pub fn op(&self, op: OpId) -> Option<&Operator> {
        let pos = self.index.position(op)?;
        self.block().ops.get(pos)
    }

    pub fn readers_of(&self, var: &str) -> &[OpId] {
        self.index.readers_of(var)
    }

    pub fn writers_of(&self, var: &str) -> &[OpId] {
        self.index.writers_of(var)
    }

    pub fn ops_in_order(&self) -> Vec<OpId> {
        self.index.ordered_op_ids()
    }

    /// Sets an attribute in place; attributes never affect the index.
    pub fn set_attr(
        &mut self,
        op: OpId,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> Result<(), IrError> {
        let pos = self.index.position(op).ok_or(IrError::UnknownOperator(op))?;
        self.program.blocks[self.block].ops[pos].set_attr(name, value);
        Ok(())
    }

    /// Inserts a new operator at `pos`, returning its id.
    pub fn insert_at(&mut self, pos: usize, desc: OpDesc) -> Result<OpId, IrError> {
        let len = self.len();
        if pos > len {
            return Err(IrError::PositionOutOfRange {
                block: self.block,
                index: pos,
                len,
            });
        }
        let id = self.program.allocate_op_id();
        let op = Operator::from_desc(id, desc);
        self.index.insert_op(&op, pos)?;
        self.program.blocks[self.block].ops.insert(pos, op);
        Ok(id)
    }

    /// Inserts a new operator right before `at`.
    pub fn insert_before(&mut self, at: OpId, desc: OpDesc) -> Result<OpId, IrError> {
        let pos = self.index.position(at).ok_or(IrError::UnknownOperator(at))?;
        self.insert_at(pos, desc)
    }

    pub fn append(&mut self, desc: OpDesc) -> Result<OpId, IrError> {
        let len = self.len();
        self.insert_at(len, desc)
    }

    /// Erases the operator identified by `op` and returns it.
    pub fn erase(&mut self, op: OpId) -> Result<Operator, IrError> {
        let pos = self.index.position(op).ok_or(IrError::UnknownOperator(op))?;
        let removed = self.program.blocks[self.block].ops.remove(pos);
        self.index.remove_op(&removed);
        Ok(removed)
    }

    /// Erases a set of operators, highest position first, returning them in program order.
    pub fn erase_all(
        &mut self,
        ops: impl IntoIterator<Item = OpId>,
    ) -> Result<Vec<Operator>, IrError> {
        let mut targets = Vec::new();
        for op in ops {
            let pos = self.index.position(op).ok_or(IrError::UnknownOperator(op))?;
            targets.push((pos, op));
        }
        targets.sort_unstable();
        targets.dedup();
        let mut removed = Vec::with_capacity(targets.len());
        for (_, op) in targets.into_iter().rev() {
            removed.push(self.erase(op)?);
        }
        removed.reverse();
        Ok(removed)
    }

    pub fn var(&self, name: &str) -> Option<&Variable> {
        self.program.var(name)
    }

    pub fn require_var(&self, name: &str) -> Result<&Variable, IrError> {
        self.program.require_var(name)
    }

    /// Declares a variable in the global block unless it already exists.
    pub fn create_var(&mut self, var: Variable) -> &Variable {
        self.program.create_var(var)
    }

    /// Verifies that the maintained index still matches the block contents.
    pub fn verify(&self) -> bool {
        let Ok(fresh) = BlockIndex::build(self.block()) else {
            return false;
        };
        fresh.len() == self.index.len()
            && self
                .block()
                .ops
                .iter()
                .enumerate()
                .all(|(pos, op)| self.index.position(op.id) == Some(pos))
            && fresh.ordered_op_ids() == self.index.ordered_op_ids()
    }
}
