use std::collections::BTreeSet;

use crate::error::{JointSide, Result, RewriteError};
use crate::ir::{BlockRewriter, DType, OpDesc, OpId, Variable};

pub const HETER_SUFFIX: &str = "@Heter";

/// Name of the joint tensor flowing from segment `from` into segment `to`.
pub fn joint_var_name(from: usize, to: usize) -> String {
    format!("joint_{from}_{to}{HETER_SUFFIX}")
}

/// Joint tensor read by segment `index`.
pub fn joint_input_name(index: usize) -> String {
    format!("joint_{}_{}{HETER_SUFFIX}", index as i64 - 1, index)
}

/// Joint tensor written by segment `index`.
pub fn joint_output_name(index: usize) -> String {
    joint_var_name(index, index + 1)
}

pub fn input_reshape_name(var: &str) -> String {
    format!("{var}.input_reshape{HETER_SUFFIX}")
}

pub fn output_reshape_name(var: &str) -> String {
    format!("{var}.output_reshape{HETER_SUFFIX}")
}

pub fn xshape_name(var: &str) -> String {
    format!("{var}.xshape{HETER_SUFFIX}")
}

/// Column width of `var` once flattened to `[-1, width]`.
///
/// Requires rank >= 2, a dynamic leading dimension and static trailing ones.
pub fn flattened_width(var: &Variable) -> Result<i64> {
    let not_transportable = || RewriteError::NotTransportable {
        name: var.name.clone(),
        shape: var.shape.clone(),
    };
    match var.shape.split_first() {
        Some((&-1, rest)) if !rest.is_empty() && rest.iter().all(|&d| d > 0) => {
            Ok(rest.iter().product())
        }
        _ => Err(not_transportable()),
    }
}

/// One variable packed into a joint tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JointSlot {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: DType,
    pub width: i64,
    /// First column of the slot inside the joint tensor.
    pub offset: i64,
}

impl JointSlot {
    pub fn end(&self) -> i64 {
        self.offset + self.width
    }
}

/// Column layout of a joint tensor, slots sorted by variable name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JointLayout {
    pub slots: Vec<JointSlot>,
}

impl JointLayout {
    pub fn width(&self) -> i64 {
        self.slots.last().map(JointSlot::end).unwrap_or(0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.name.as_str())
    }

    /// Element type of the joint tensor, taken from the first slot.
    pub fn dtype(&self) -> DType {
        self.slots.first().map(|slot| slot.dtype).unwrap_or(DType::F32)
    }

    fn compute(
        rewriter: &BlockRewriter<'_>,
        segment: usize,
        side: JointSide,
        names: &BTreeSet<String>,
    ) -> Result<Self> {
        if names.is_empty() {
            return Err(RewriteError::EmptyJoint { segment, side });
        }
        let mut slots = Vec::with_capacity(names.len());
        let mut offset = 0;
        for name in names {
            let var = rewriter.require_var(name)?;
            let width = flattened_width(var)?;
            slots.push(JointSlot {
                name: name.clone(),
                shape: var.shape.clone(),
                dtype: var.dtype,
                width,
                offset,
            });
            offset += width;
        }
        Ok(Self { slots })
    }
}

/// Wiring of one heterogeneous segment: what it receives and what it returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommInfo {
    pub segment: usize,
    pub entrance: JointLayout,
    pub exit: JointLayout,
}

impl CommInfo {
    /// Lays out the joint tensors of `segment`, resolving shapes through `rewriter`.
    pub fn compute(
        rewriter: &BlockRewriter<'_>,
        segment: usize,
        entrance: &BTreeSet<String>,
        exit: &BTreeSet<String>,
    ) -> Result<Self> {
        Ok(Self {
            segment,
            entrance: JointLayout::compute(rewriter, segment, JointSide::Entrance, entrance)?,
            exit: JointLayout::compute(rewriter, segment, JointSide::Exit, exit)?,
        })
    }

    pub fn joint_input(&self) -> String {
        joint_input_name(self.segment)
    }

    pub fn joint_output(&self) -> String {
        joint_output_name(self.segment)
    }
}

/// Inserts `reshape2(x) -> out` at `pos`. An existing `out` keeps its declared shape.
pub fn insert_reshape(
    rewriter: &mut BlockRewriter<'_>,
    pos: usize,
    x: &str,
    out: &str,
    shape: &[i64],
) -> Result<OpId> {
    let input = rewriter.require_var(x)?.clone();
    let out_shape = match rewriter.var(out) {
        Some(existing) => existing.shape.clone(),
        None => shape.to_vec(),
    };
    rewriter.create_var(Variable::new(out, out_shape.clone(), input.dtype));

    let xshape = xshape_name(x);
    let mut xshape_dims = vec![0];
    xshape_dims.extend_from_slice(&input.shape);
    rewriter.create_var(Variable::new(xshape.as_str(), xshape_dims, input.dtype));

    let desc = OpDesc::new("reshape2")
        .input("X", [x])
        .output("Out", [out])
        .output("XShape", [xshape])
        .attr("shape", out_shape);
    Ok(rewriter.insert_at(pos, desc)?)
}

/// Inserts `concat(parts) -> joint` along the last axis at `pos`.
pub fn insert_concat(
    rewriter: &mut BlockRewriter<'_>,
    pos: usize,
    parts: &[String],
    joint: &str,
    width: i64,
    dtype: DType,
) -> Result<OpId> {
    rewriter.create_var(Variable::new(joint, vec![-1, width], dtype));
    let desc = OpDesc::new("concat")
        .input("X", parts.iter().cloned())
        .output("Out", [joint])
        .attr("axis", -1i64)
        .attr("use_stack", false);
    Ok(rewriter.insert_at(pos, desc)?)
}

/// Inserts one column `slice` per slot of `layout`, reading `joint` and
/// writing `target(slot)`. Returns the inserted ids in layout order.
pub fn insert_slices(
    rewriter: &mut BlockRewriter<'_>,
    pos: usize,
    joint: &str,
    layout: &JointLayout,
    target: impl Fn(&str) -> String,
) -> Result<Vec<OpId>> {
    let mut ids = Vec::with_capacity(layout.slots.len());
    for (i, slot) in layout.slots.iter().enumerate() {
        let out = target(&slot.name);
        if rewriter.var(&out).is_none() {
            rewriter.create_var(Variable::new(out.as_str(), vec![-1, slot.width], slot.dtype));
        }
        let desc = OpDesc::new("slice")
            .input("Input", [joint])
            .output("Out", [out])
            .attr("axes", vec![1i64])
            .attr("starts", vec![slot.offset])
            .attr("ends", vec![slot.end()]);
        ids.push(rewriter.insert_at(pos + i, desc)?);
    }
    Ok(ids)
}
