#![allow(dead_code)]

use std::collections::HashMap;

use heter_split::ir::{
    AttrValue, DType, OpDesc, OpId, OpRole, Operator, Program, Variable, OP_DEVICE, OP_ROLE,
};
use heter_split::{DistributedMode, StaticFleetStrategy};

/// Declares `[-1, 4]` f32 temporaries.
pub fn declare(program: &mut Program, names: &[&str]) {
    for name in names {
        program.create_var(Variable::new(*name, vec![-1, 4], DType::F32));
    }
}

pub fn declare_shaped(program: &mut Program, name: &str, shape: &[i64]) {
    program.create_var(Variable::new(name, shape.to_vec(), DType::F32));
}

pub fn declare_param(program: &mut Program, name: &str, shape: &[i64]) {
    program.create_var(Variable::new(name, shape.to_vec(), DType::F32).parameter());
}

/// `op_type(X = inputs) -> (Out = outputs)`, placed on `device` when given.
pub fn op(op_type: &str, inputs: &[&str], outputs: &[&str], device: Option<&str>) -> OpDesc {
    let mut desc = OpDesc::new(op_type)
        .input("X", inputs.iter().copied())
        .output("Out", outputs.iter().copied())
        .attr(OP_ROLE, OpRole::FORWARD);
    if let Some(device) = device {
        desc = desc.attr(OP_DEVICE, device);
    }
    desc
}

pub fn append(program: &mut Program, desc: OpDesc) -> OpId {
    program.append_op(0, desc).expect("append to global block")
}

/// `[matmul, matmul, conv(gpu), conv(gpu), relu(gpu), add]`.
pub fn six_op_program() -> (Program, Vec<OpId>) {
    let mut program = Program::new();
    declare(&mut program, &["x", "h0", "h1", "c0", "c1", "r", "y"]);
    let ids = vec![
        append(&mut program, op("matmul", &["x"], &["h0"], None)),
        append(&mut program, op("matmul", &["h0"], &["h1"], Some("cpu"))),
        append(&mut program, op("conv", &["h1"], &["c0"], Some("gpu"))),
        append(&mut program, op("conv", &["c0"], &["c1"], Some("gpu"))),
        append(&mut program, op("relu", &["c1"], &["r"], Some("gpu"))),
        append(&mut program, op("add", &["r", "h1"], &["y"], None)),
    ];
    (program, ids)
}

pub fn strategy(origin: Program) -> StaticFleetStrategy {
    StaticFleetStrategy::new(
        0,
        vec!["127.0.0.1:6000".to_string(), "127.0.0.1:6001".to_string()],
        2,
        DistributedMode::Async,
        "127.0.0.1:7000",
    )
    .with_origin_program(origin)
}

pub fn op_types(program: &Program, block: usize) -> Vec<String> {
    program.blocks()[block]
        .ops
        .iter()
        .map(|op| op.op_type.clone())
        .collect()
}

pub fn find_op<'a>(program: &'a Program, block: usize, op_type: &str) -> &'a Operator {
    program.blocks()[block]
        .ops
        .iter()
        .find(|op| op.op_type == op_type)
        .unwrap_or_else(|| panic!("no {op_type} in block {block}"))
}

pub fn strs(value: Option<&AttrValue>) -> Vec<String> {
    value
        .and_then(AttrValue::as_strs)
        .map(<[String]>::to_vec)
        .unwrap_or_default()
}

/// Dense row-major host tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Tensor of `shape` whose elements are `fill + index / 1000`.
    pub fn filled(shape: &[usize], fill: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: (0..len).map(|i| fill + i as f32 / 1000.0).collect(),
        }
    }

    fn rows(&self) -> usize {
        self.shape[0]
    }

    fn cols(&self) -> usize {
        self.shape[1..].iter().product()
    }
}

/// Evaluates the `reshape2`, `concat` and `slice` operators of `ops` in order
/// against `env`. Other operators are skipped.
pub fn eval_adapters(ops: &[Operator], env: &mut HashMap<String, Tensor>) {
    for op in ops {
        match op.op_type.as_str() {
            "reshape2" => {
                let x = env[&op.input("X")[0]].clone();
                let target = op.attr("shape").and_then(AttrValue::as_ints).expect("shape");
                let known: usize = target.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
                let shape = target
                    .iter()
                    .map(|&d| if d < 0 { x.data.len() / known } else { d as usize })
                    .collect();
                env.insert(
                    op.output("Out")[0].clone(),
                    Tensor {
                        shape,
                        data: x.data,
                    },
                );
            }
            "concat" => {
                let parts: Vec<Tensor> = op.input("X").iter().map(|n| env[n].clone()).collect();
                let rows = parts[0].rows();
                let width: usize = parts.iter().map(Tensor::cols).sum();
                let mut data = Vec::with_capacity(rows * width);
                for row in 0..rows {
                    for part in &parts {
                        let cols = part.cols();
                        data.extend_from_slice(&part.data[row * cols..(row + 1) * cols]);
                    }
                }
                env.insert(
                    op.output("Out")[0].clone(),
                    Tensor {
                        shape: vec![rows, width],
                        data,
                    },
                );
            }
            "slice" => {
                let x = env[&op.input("Input")[0]].clone();
                let ints = |name: &str| op.attr(name).and_then(AttrValue::as_ints).expect(name)[0];
                assert_eq!(ints("axes"), 1);
                let (start, end) = (ints("starts") as usize, ints("ends") as usize);
                let cols = x.cols();
                let mut data = Vec::new();
                for row in 0..x.rows() {
                    data.extend_from_slice(&x.data[row * cols + start..row * cols + end]);
                }
                env.insert(
                    op.output("Out")[0].clone(),
                    Tensor {
                        shape: vec![x.rows(), end - start],
                        data,
                    },
                );
            }
            _ => {}
        }
    }
}
