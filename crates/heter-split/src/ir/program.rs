use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::rewriter::BlockRewriter;
use crate::ir::IrError;

/// Attribute naming the role bitmask of an operator.
pub const OP_ROLE: &str = "op_role";
/// Attribute listing `(param, grad)` names an operator is responsible for.
pub const OP_ROLE_VAR: &str = "op_role_var";
/// Attribute naming the device an operator is placed on.
pub const OP_DEVICE: &str = "op_device";
/// Attribute carrying the name scope an operator was created in.
pub const OP_NAMESCOPE: &str = "op_namescope";

/// Marker used by operators for an intentionally unbound slot.
pub const EMPTY_VAR_NAME: &str = "@EMPTY@";
/// Suffix appended to a variable name to form its gradient.
pub const GRAD_SUFFIX: &str = "@GRAD";

/// Stable identifier assigned to an operator when it enters a program.
///
/// Ids survive insertions, deletions and program clones; positions do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OpId(pub u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role bitmask stored in the `op_role` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpRole(pub i64);

impl OpRole {
    pub const FORWARD: OpRole = OpRole(0x0000);
    pub const BACKWARD: OpRole = OpRole(0x0001);
    pub const OPTIMIZE: OpRole = OpRole(0x0002);
    pub const RPC: OpRole = OpRole(0x0004);
    pub const DIST: OpRole = OpRole(0x0008);
    pub const LR_SCHED: OpRole = OpRole(0x0010);
    pub const LOSS: OpRole = OpRole(0x0100);

    pub fn union(self, other: OpRole) -> OpRole {
        OpRole(self.0 | other.0)
    }
}

impl From<OpRole> for AttrValue {
    fn from(role: OpRole) -> Self {
        AttrValue::Int(role.0)
    }
}

/// Compute device tag (`cpu`, `gpu`, `xpu`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Device(String);

impl Device {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Device {
    fn from(tag: &str) -> Self {
        Device::new(tag)
    }
}

/// Element types a variable may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    I32,
    I64,
    F16,
    F32,
    F64,
    /// Untyped control-dependency variable.
    Raw,
}

impl DType {
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Raw => "raw",
        }
    }
}

/// Lifetime class of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    /// Lives for a single execution.
    #[default]
    Temporary,
    /// Outlives executions (optimizer state, counters, tables).
    Persistable,
    /// Trainable parameter; always persistable.
    Parameter,
}

/// Named, typed variable declared in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    /// Dimension sizes; `-1` marks the dynamic batch dimension.
    pub shape: Vec<i64>,
    pub dtype: DType,
    #[serde(default)]
    pub kind: VarKind,
}

impl Variable {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<i64>>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
            dtype,
            kind: VarKind::Temporary,
        }
    }

    /// Control-dependency placeholder with no shape.
    pub fn control(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), DType::Raw)
    }

    pub fn persistable(mut self) -> Self {
        self.kind = VarKind::Persistable;
        self
    }

    pub fn parameter(mut self) -> Self {
        self.kind = VarKind::Parameter;
        self
    }

    pub fn is_persistable(&self) -> bool {
        matches!(self.kind, VarKind::Persistable | VarKind::Parameter)
    }
}

/// Operator attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Strs(Vec<String>),
    Block(usize),
    Blocks(Vec<usize>),
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            AttrValue::Ints(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_strs(&self) -> Option<&[String]> {
        match self {
            AttrValue::Strs(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_blocks(&self) -> Option<&[usize]> {
        match self {
            AttrValue::Blocks(values) => Some(values),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(values: Vec<i64>) -> Self {
        AttrValue::Ints(values)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(values: Vec<String>) -> Self {
        AttrValue::Strs(values)
    }
}

impl From<Vec<&str>> for AttrValue {
    fn from(values: Vec<&str>) -> Self {
        AttrValue::Strs(values.into_iter().map(str::to_string).collect())
    }
}

pub type SlotMap = BTreeMap<String, Vec<String>>;
pub type AttrMap = BTreeMap<String, AttrValue>;

/// Operator description without an identity, used to create new operators.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpDesc {
    pub op_type: String,
    pub inputs: SlotMap,
    pub outputs: SlotMap,
    pub attrs: AttrMap,
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    pub fn input<I, S>(mut self, slot: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs
            .insert(slot.to_string(), names.into_iter().map(Into::into).collect());
        self
    }

    pub fn output<I, S>(mut self, slot: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs
            .insert(slot.to_string(), names.into_iter().map(Into::into).collect());
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }
}

/// Operator placed in a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub id: OpId,
    pub op_type: String,
    pub inputs: SlotMap,
    pub outputs: SlotMap,
    pub attrs: AttrMap,
}

impl Operator {
    pub fn from_desc(id: OpId, desc: OpDesc) -> Self {
        Self {
            id,
            op_type: desc.op_type,
            inputs: desc.inputs,
            outputs: desc.outputs,
            attrs: desc.attrs,
        }
    }

    pub fn to_desc(&self) -> OpDesc {
        OpDesc {
            op_type: self.op_type.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            attrs: self.attrs.clone(),
        }
    }

    /// Returns the variables bound to the input slot, or an empty slice.
    pub fn input(&self, slot: &str) -> &[String] {
        self.inputs.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn output(&self, slot: &str) -> &[String] {
        self.outputs.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterates every input argument name across all slots.
    pub fn input_arg_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().flatten().map(String::as_str)
    }

    pub fn output_arg_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.values().flatten().map(String::as_str)
    }

    pub fn references(&self, var: &str) -> bool {
        self.input_arg_names()
            .chain(self.output_arg_names())
            .any(|name| name == var)
    }

    pub fn writes(&self, var: &str) -> bool {
        self.output_arg_names().any(|name| name == var)
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.attrs.insert(name.to_string(), value.into());
    }

    pub fn role(&self) -> Option<OpRole> {
        self.attr(OP_ROLE).and_then(AttrValue::as_int).map(OpRole)
    }

    /// Device tag, `None` when unset or empty.
    pub fn device(&self) -> Option<&str> {
        self.attr(OP_DEVICE)
            .and_then(AttrValue::as_str)
            .filter(|tag| !tag.is_empty())
    }

    pub fn role_vars(&self) -> &[String] {
        self.attr(OP_ROLE_VAR)
            .and_then(AttrValue::as_strs)
            .unwrap_or(&[])
    }

    pub fn is_grad_op(&self) -> bool {
        self.op_type.contains("_grad")
    }
}

/// Ordered operator list plus the variables declared in a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub idx: usize,
    pub parent: Option<usize>,
    pub ops: Vec<Operator>,
    pub vars: BTreeMap<String, Variable>,
}

impl Block {
    fn new(idx: usize, parent: Option<usize>) -> Self {
        Self {
            idx,
            parent,
            ops: Vec::new(),
            vars: BTreeMap::new(),
        }
    }

    pub fn var(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn position_of(&self, id: OpId) -> Option<usize> {
        self.ops.iter().position(|op| op.id == id)
    }

    pub fn op(&self, id: OpId) -> Option<&Operator> {
        self.ops.iter().find(|op| op.id == id)
    }
}

/// A program: block 0 is the global scope and owns every variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub(crate) blocks: Vec<Block>,
    pub(crate) next_op_id: u32,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::new(0, None)],
            next_op_id: 0,
        }
    }

    /// Creates an empty program whose fresh ids never collide with `source`'s.
    pub fn derived_from(source: &Program) -> Self {
        Self {
            blocks: vec![Block::new(0, None)],
            next_op_id: source.next_op_id,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn global_block(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn global_block_mut(&mut self) -> &mut Block {
        &mut self.blocks[0]
    }

    pub fn block(&self, idx: usize) -> Result<&Block, IrError> {
        self.blocks.get(idx).ok_or(IrError::UnknownBlock(idx))
    }

    pub fn block_mut(&mut self, idx: usize) -> Result<&mut Block, IrError> {
        self.blocks.get_mut(idx).ok_or(IrError::UnknownBlock(idx))
    }

    /// Appends a new block nested under `parent` and returns its index.
    pub fn create_block(&mut self, parent: usize) -> Result<usize, IrError> {
        self.block(parent)?;
        let idx = self.blocks.len();
        self.blocks.push(Block::new(idx, Some(parent)));
        Ok(idx)
    }

    pub(crate) fn allocate_op_id(&mut self) -> OpId {
        let id = OpId(self.next_op_id);
        self.next_op_id += 1;
        id
    }

    /// Inserts an operator at `index`, shifting later operators by one.
    pub fn insert_op(&mut self, block: usize, index: usize, desc: OpDesc) -> Result<OpId, IrError> {
        let len = self.block(block)?.ops.len();
        if index > len {
            return Err(IrError::PositionOutOfRange { block, index, len });
        }
        let id = self.allocate_op_id();
        self.blocks[block]
            .ops
            .insert(index, Operator::from_desc(id, desc));
        Ok(id)
    }

    pub fn append_op(&mut self, block: usize, desc: OpDesc) -> Result<OpId, IrError> {
        let len = self.block(block)?.ops.len();
        self.insert_op(block, len, desc)
    }

    /// Appends a copy of an operator taken from another program, keeping its id.
    pub fn append_foreign_op(&mut self, block: usize, op: &Operator) -> Result<OpId, IrError> {
        let target = self.block(block)?;
        if target.op(op.id).is_some() {
            return Err(IrError::DuplicateOp(op.id));
        }
        self.next_op_id = self.next_op_id.max(op.id.0 + 1);
        self.blocks[block].ops.push(op.clone());
        Ok(op.id)
    }

    pub fn remove_op(&mut self, block: usize, index: usize) -> Result<Operator, IrError> {
        let len = self.block(block)?.ops.len();
        if index >= len {
            return Err(IrError::PositionOutOfRange { block, index, len });
        }
        Ok(self.blocks[block].ops.remove(index))
    }

    /// Removes every operator whose id is in `ids`, highest position first.
    pub fn remove_ops_by_id(&mut self, block: usize, ids: &HashSet<OpId>) -> Result<usize, IrError> {
        let positions: Vec<usize> = self
            .block(block)?
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| ids.contains(&op.id))
            .map(|(pos, _)| pos)
            .collect();
        for pos in positions.iter().rev() {
            self.blocks[block].ops.remove(*pos);
        }
        Ok(positions.len())
    }

    /// Looks up a variable in the global block.
    pub fn var(&self, name: &str) -> Option<&Variable> {
        self.global_block().var(name)
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.global_block().has_var(name)
    }

    pub fn require_var(&self, name: &str) -> Result<&Variable, IrError> {
        self.var(name)
            .ok_or_else(|| IrError::UnknownVariable(name.to_string()))
    }

    /// Declares `var` in the global block unless a variable of that name exists.
    pub fn create_var(&mut self, var: Variable) -> &Variable {
        self.blocks[0].vars.entry(var.name.clone()).or_insert(var)
    }

    /// Copies `var` into the global block; a no-op when the name is taken.
    pub fn clone_variable(&mut self, var: &Variable) -> bool {
        if self.has_var(&var.name) {
            return false;
        }
        self.blocks[0].vars.insert(var.name.clone(), var.clone());
        true
    }

    /// Returns `true` when any operator of any block reads or writes `name`.
    pub fn is_var_referenced(&self, name: &str) -> bool {
        self.blocks
            .iter()
            .flat_map(|block| block.ops.iter())
            .any(|op| op.references(name))
    }

    /// Removes a variable; operators referencing it must be removed first.
    pub fn remove_var(&mut self, block: usize, name: &str) -> Result<Variable, IrError> {
        if let Some(op) = self
            .blocks
            .iter()
            .flat_map(|b| b.ops.iter())
            .find(|op| op.references(name))
        {
            return Err(IrError::DanglingReference {
                var: name.to_string(),
                op: op.id,
                op_type: op.op_type.clone(),
            });
        }
        self.block_mut(block)?
            .vars
            .remove(name)
            .ok_or_else(|| IrError::UnknownVariable(name.to_string()))
    }

    /// Overwrites the device attribute of every operator in `block`.
    pub fn force_device(&mut self, block: usize, device: &Device) -> Result<(), IrError> {
        for op in &mut self.block_mut(block)?.ops {
            op.set_attr(OP_DEVICE, device.as_str());
        }
        Ok(())
    }

    /// Opens a multi-step editor over `block`.
    pub fn rewriter(&mut self, block: usize) -> Result<BlockRewriter<'_>, IrError> {
        BlockRewriter::new(self, block)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
