//! Pass configuration and the role/strategy provider consumed by the pipeline.
//!
//! The strategy is owned by the surrounding fleet runtime; this crate only reads
//! endpoints, contexts and table layouts from it and reports gradients whose
//! merge bookkeeping is no longer needed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RewriteError};
use crate::ir::{Device, Program};

/// Pipeline knobs. Missing fields fall back to [`PassConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    /// Every device tag operators may carry.
    pub devices: Vec<Device>,
    /// Device the trainer program runs on.
    pub default_device: Device,
    /// Device whose segments are lowered into the heterogeneous worker program.
    pub heter_device: Device,
    /// Append `recv`/`fetch_barrier` to the startup program.
    pub init_from_server: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            devices: vec![Device::new("cpu"), Device::new("gpu"), Device::new("xpu")],
            default_device: Device::new("cpu"),
            heter_device: Device::new("gpu"),
            init_from_server: true,
        }
    }
}

impl PassConfig {
    pub fn validate(&self) -> Result<()> {
        for device in [&self.default_device, &self.heter_device] {
            if !self.devices.contains(device) {
                return Err(self.unsupported(device.as_str()));
            }
        }
        if self.heter_device == self.default_device {
            return Err(self.unsupported(self.heter_device.as_str()));
        }
        Ok(())
    }

    pub fn is_heter_device(&self, tag: &str) -> bool {
        tag != self.default_device.as_str() && self.devices.iter().any(|d| d.as_str() == tag)
    }

    pub(crate) fn unsupported(&self, tag: &str) -> RewriteError {
        RewriteError::UnsupportedDevice {
            device: tag.to_string(),
            supported: self.devices.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Parameter-server training mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedMode {
    Sync,
    Async,
    HalfAsync,
    Geo,
}

impl DistributedMode {
    /// Integer encoding expected by the runtime attribute schema.
    pub fn code(self) -> i64 {
        match self {
            DistributedMode::Sync => 0,
            DistributedMode::Async => 1,
            DistributedMode::HalfAsync => 2,
            DistributedMode::Geo => 3,
        }
    }

    /// Whether sends are followed by a barrier.
    pub fn is_barrier_synced(self) -> bool {
        matches!(self, DistributedMode::Sync | DistributedMode::HalfAsync)
    }
}

/// Which variables a communicator receive context covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecvKind {
    Dense,
    Sparse,
    Distributed,
    All,
}

/// A merged communication variable and the origin variables it aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommContext {
    pub merged_name: String,
    pub origin_varnames: Vec<String>,
}

impl CommContext {
    pub fn new<I, S>(merged_name: impl Into<String>, origin_varnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            merged_name: merged_name.into(),
            origin_varnames: origin_varnames.into_iter().map(Into::into).collect(),
        }
    }
}

/// One shard of a distributed variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarShard {
    pub table: String,
    pub endpoint: String,
    pub begin: i64,
    pub end: i64,
}

impl VarShard {
    pub fn rows(&self) -> i64 {
        self.end - self.begin
    }
}

/// A `(param, grad)` pair tracked for gradient merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedVarPair {
    pub param: String,
    pub grad: String,
}

/// Read-mostly view of the distributed role and its compile-time strategy.
pub trait FleetStrategy {
    fn role_id(&self) -> i64;
    fn ps_endpoints(&self) -> &[String];
    fn trainers(&self) -> i64;
    fn distributed_mode(&self) -> DistributedMode;
    fn heter_worker_endpoint(&self) -> &str;
    /// The program as authored, before any pass ran.
    fn origin_main_program(&self) -> &Program;
    fn trainer_send_context(&self) -> Vec<CommContext>;
    fn communicator_recv_context(&self, kind: RecvKind) -> Vec<CommContext>;
    /// Shards of `var_name` in configuration order.
    fn var_distributed(&self, var_name: &str, is_sparse: bool) -> Vec<VarShard>;
    /// Merged gradient names currently tracked for merging.
    fn merged_grad_names(&self) -> Vec<String>;
    fn remove_var_pair_by_grad(&mut self, grad_var_name: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RecvEntry {
    kind: RecvKind,
    #[serde(flatten)]
    context: CommContext,
}

/// In-memory [`FleetStrategy`], deserializable from JSON apart from the origin program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFleetStrategy {
    pub role_id: i64,
    pub ps_endpoints: Vec<String>,
    pub trainers: i64,
    pub mode: DistributedMode,
    pub heter_worker_endpoint: String,
    #[serde(default)]
    pub send_context: Vec<CommContext>,
    #[serde(default)]
    recv_context: Vec<RecvEntry>,
    #[serde(default)]
    pub sparse_tables: BTreeMap<String, Vec<VarShard>>,
    #[serde(default)]
    pub dense_vars: BTreeMap<String, Vec<VarShard>>,
    #[serde(default)]
    pub merged_pairs: Vec<MergedVarPair>,
    #[serde(skip)]
    origin: Program,
}

impl StaticFleetStrategy {
    pub fn new(
        role_id: i64,
        ps_endpoints: Vec<String>,
        trainers: i64,
        mode: DistributedMode,
        heter_worker_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            role_id,
            ps_endpoints,
            trainers,
            mode,
            heter_worker_endpoint: heter_worker_endpoint.into(),
            send_context: Vec::new(),
            recv_context: Vec::new(),
            sparse_tables: BTreeMap::new(),
            dense_vars: BTreeMap::new(),
            merged_pairs: Vec::new(),
            origin: Program::new(),
        }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn with_origin_program(mut self, origin: Program) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_send_context(mut self, context: CommContext) -> Self {
        self.send_context.push(context);
        self
    }

    pub fn with_recv_context(mut self, kind: RecvKind, context: CommContext) -> Self {
        self.recv_context.push(RecvEntry { kind, context });
        self
    }

    pub fn with_sparse_table(mut self, param: impl Into<String>, shards: Vec<VarShard>) -> Self {
        self.sparse_tables.insert(param.into(), shards);
        self
    }

    pub fn with_merged_pair(mut self, param: impl Into<String>, grad: impl Into<String>) -> Self {
        self.merged_pairs.push(MergedVarPair {
            param: param.into(),
            grad: grad.into(),
        });
        self
    }
}

impl FleetStrategy for StaticFleetStrategy {
    fn role_id(&self) -> i64 {
        self.role_id
    }

    fn ps_endpoints(&self) -> &[String] {
        &self.ps_endpoints
    }

    fn trainers(&self) -> i64 {
        self.trainers
    }

    fn distributed_mode(&self) -> DistributedMode {
        self.mode
    }

    fn heter_worker_endpoint(&self) -> &str {
        &self.heter_worker_endpoint
    }

    fn origin_main_program(&self) -> &Program {
        &self.origin
    }

    fn trainer_send_context(&self) -> Vec<CommContext> {
        self.send_context.clone()
    }

    fn communicator_recv_context(&self, kind: RecvKind) -> Vec<CommContext> {
        self.recv_context
            .iter()
            .filter(|entry| kind == RecvKind::All || entry.kind == kind)
            .map(|entry| entry.context.clone())
            .collect()
    }

    fn var_distributed(&self, var_name: &str, is_sparse: bool) -> Vec<VarShard> {
        let table = if is_sparse {
            &self.sparse_tables
        } else {
            &self.dense_vars
        };
        table.get(var_name).cloned().unwrap_or_default()
    }

    fn merged_grad_names(&self) -> Vec<String> {
        self.merged_pairs.iter().map(|pair| pair.grad.clone()).collect()
    }

    fn remove_var_pair_by_grad(&mut self, grad_var_name: &str) {
        self.merged_pairs.retain(|pair| pair.grad != grad_var_name);
    }
}
