use std::collections::HashMap;

use smallvec::SmallVec;

use crate::ir::program::{Block, OpId, Operator};
use crate::ir::IrError;

/// Structural indices for a single block: operator positions and variable users.
#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    pos_of: HashMap<OpId, usize>,
    readers: HashMap<String, SmallVec<[OpId; 4]>>,
    writers: HashMap<String, SmallVec<[OpId; 4]>>,
}

impl BlockIndex {
    /// Builds indices for the provided block, rejecting duplicate operator ids.
    pub fn build(block: &Block) -> Result<Self, IrError> {
        let mut index = BlockIndex::default();
        for (pos, op) in block.ops.iter().enumerate() {
            if index.pos_of.insert(op.id, pos).is_some() {
                return Err(IrError::DuplicateOp(op.id));
            }
            index.add_users(op);
        }
        Ok(index)
    }

    pub fn position(&self, op: OpId) -> Option<usize> {
        self.pos_of.get(&op).copied()
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.pos_of.contains_key(&op)
    }

    pub fn len(&self) -> usize {
        self.pos_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos_of.is_empty()
    }

    /// Operators reading `var`, in no particular order.
    pub fn readers_of(&self, var: &str) -> &[OpId] {
        self.readers
            .get(var)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn writers_of(&self, var: &str) -> &[OpId] {
        self.writers
            .get(var)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn ordered_op_ids(&self) -> Vec<OpId> {
        let mut entries: Vec<_> = self.pos_of.iter().map(|(op, pos)| (*op, *pos)).collect();
        entries.sort_by_key(|&(_, pos)| pos);
        entries.into_iter().map(|(op, _)| op).collect()
    }

    pub(crate) fn insert_op(&mut self, op: &Operator, pos: usize) -> Result<(), IrError> {
        if self.pos_of.contains_key(&op.id) {
            return Err(IrError::DuplicateOp(op.id));
        }
        self.shift_positions_from(pos, 1);
        self.pos_of.insert(op.id, pos);
        self.add_users(op);
        Ok(())
    }

    pub(crate) fn remove_op(&mut self, op: &Operator) {
        if let Some(pos) = self.pos_of.remove(&op.id) {
            self.shift_positions_from(pos + 1, -1);
        }
        for name in op.input_arg_names() {
            remove_user(&mut self.readers, name, op.id);
        }
        for name in op.output_arg_names() {
            remove_user(&mut self.writers, name, op.id);
        }
    }

    fn add_users(&mut self, op: &Operator) {
        for name in op.input_arg_names() {
            let list = self.readers.entry(name.to_string()).or_default();
            if !list.contains(&op.id) {
                list.push(op.id);
            }
        }
        for name in op.output_arg_names() {
            let list = self.writers.entry(name.to_string()).or_default();
            if !list.contains(&op.id) {
                list.push(op.id);
            }
        }
    }

    fn shift_positions_from(&mut self, start: usize, delta: isize) {
        if delta == 0 {
            return;
        }
        for (_, pos) in self.pos_of.iter_mut() {
            if *pos >= start {
                if delta.is_positive() {
                    *pos += delta.unsigned_abs();
                } else {
                    *pos -= delta.unsigned_abs();
                }
            }
        }
    }
}

fn remove_user(map: &mut HashMap<String, SmallVec<[OpId; 4]>>, name: &str, op: OpId) {
    if let Some(list) = map.get_mut(name) {
        list.retain(|id| *id != op);
        if list.is_empty() {
            map.remove(name);
        }
    }
}
