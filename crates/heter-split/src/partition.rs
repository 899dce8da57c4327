//! Device partitioning of the global block.
//!
//! One linear scan groups consecutive operators by target device. Placement is
//! recorded in [`PartitionPlan::placement`]; operator attributes are left as is.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::config::PassConfig;
use crate::error::Result;
use crate::ir::{Device, OpId, Operator, Program};

/// Communication primitives that follow the device of an open heterogeneous run.
pub const COMMUNICATE_OPS: [&str; 4] = ["send", "recv", "fetch_barrier", "send_barrier"];

/// Maximal contiguous run of operators placed on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub device: Device,
    pub ops: Vec<OpId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// All segments in program order.
    pub segments: Vec<Segment>,
    /// Heterogeneous segments: device, then segment index, then operators.
    pub heter: BTreeMap<Device, BTreeMap<usize, Vec<OpId>>>,
    /// Indices of segments on the default device.
    pub default_segments: Vec<usize>,
    pub placement: HashMap<OpId, Device>,
    pub default_device: Device,
}

impl PartitionPlan {
    fn new(default_device: Device) -> Self {
        Self {
            segments: Vec::new(),
            heter: BTreeMap::new(),
            default_segments: Vec::new(),
            placement: HashMap::new(),
            default_device,
        }
    }

    /// `false` when no operator left the default device.
    pub fn is_partitioned(&self) -> bool {
        !self.heter.is_empty()
    }

    pub fn segment_devices(&self) -> Vec<Device> {
        self.segments.iter().map(|s| s.device.clone()).collect()
    }

    pub fn device_of(&self, op: OpId) -> Option<&Device> {
        self.placement.get(&op)
    }

    pub fn heter_devices(&self) -> impl Iterator<Item = &Device> {
        self.heter.keys()
    }

    /// Segments placed on `device`, ascending by index.
    pub fn segments_on<'a>(&'a self, device: &'a Device) -> impl Iterator<Item = &'a Segment> {
        self.segments.iter().filter(move |s| &s.device == device)
    }

    pub fn num_heter_ops(&self) -> usize {
        self.heter
            .values()
            .flat_map(|by_index| by_index.values())
            .map(Vec::len)
            .sum()
    }

    /// Operators in program order, recovered by concatenating the segments.
    pub fn flatten(&self) -> Vec<OpId> {
        self.segments
            .iter()
            .flat_map(|s| s.ops.iter().copied())
            .collect()
    }

    fn push(&mut self, device: Device, ops: Vec<OpId>) {
        let index = self.segments.len();
        for op in &ops {
            self.placement.insert(*op, device.clone());
        }
        if device == self.default_device {
            self.default_segments.push(index);
        } else {
            self.heter
                .entry(device.clone())
                .or_default()
                .insert(index, ops.clone());
        }
        debug!(segment = index, device = %device, ops = ops.len(), "segment closed");
        self.segments.push(Segment { index, device, ops });
    }
}

pub struct Partitioner<'a> {
    config: &'a PassConfig,
}

struct ScanState {
    current_device: Device,
    is_heter: bool,
    default_run: Vec<OpId>,
    heter_run: Vec<OpId>,
}

impl<'a> Partitioner<'a> {
    pub fn new(config: &'a PassConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, program: &Program) -> Result<PartitionPlan> {
        self.config.validate()?;
        let default_device = self.config.default_device.clone();
        let mut plan = PartitionPlan::new(default_device.clone());
        let mut state = ScanState {
            current_device: default_device.clone(),
            is_heter: false,
            default_run: Vec::new(),
            heter_run: Vec::new(),
        };

        for op in &program.global_block().ops {
            match self.target_device(op, &state)? {
                Some(device) => {
                    if state.is_heter && device != state.current_device {
                        let ops = std::mem::take(&mut state.heter_run);
                        plan.push(state.current_device.clone(), ops);
                    }
                    if !state.is_heter {
                        if state.default_run.len() > 1 {
                            let ops = std::mem::take(&mut state.default_run);
                            plan.push(default_device.clone(), ops);
                        } else {
                            // A lone default op joins the heterogeneous run that follows it.
                            state.heter_run.append(&mut state.default_run);
                        }
                    }
                    state.is_heter = true;
                    state.current_device = device;
                    state.heter_run.push(op.id);
                }
                None => {
                    if state.is_heter {
                        let ops = std::mem::take(&mut state.heter_run);
                        plan.push(state.current_device.clone(), ops);
                        state.is_heter = false;
                        state.current_device = default_device.clone();
                    }
                    state.default_run.push(op.id);
                }
            }
        }
        if !state.default_run.is_empty() {
            plan.push(default_device.clone(), state.default_run);
        }
        if !state.heter_run.is_empty() {
            plan.push(state.current_device, state.heter_run);
        }

        let num_ops = program.global_block().ops.len();
        if !plan.is_partitioned() {
            warn!(
                ops = num_ops,
                "no heterogeneous operator found, program stays on `{}`", default_device
            );
        }
        info!(
            ops = num_ops,
            heter_ops = plan.num_heter_ops(),
            heter_segments = plan.heter.values().map(BTreeMap::len).sum::<usize>(),
            segments = plan.segments.len(),
            "partitioned global block"
        );
        Ok(plan)
    }

    /// `Some(device)` for heterogeneous operators, `None` for default ones.
    fn target_device(&self, op: &Operator, state: &ScanState) -> Result<Option<Device>> {
        let tag = op.device();
        if let Some(tag) = tag {
            if self.config.is_heter_device(tag) {
                return Ok(Some(Device::new(tag)));
            }
        }
        if state.is_heter && COMMUNICATE_OPS.contains(&op.op_type.as_str()) {
            return Ok(Some(state.current_device.clone()));
        }
        match tag {
            None => Ok(None),
            Some(tag) if tag == self.config.default_device.as_str() => Ok(None),
            Some(tag) => Err(self.config.unsupported(tag)),
        }
    }
}
