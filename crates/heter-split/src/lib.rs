//! Splits a single-device training program into a trainer program and a
//! heterogeneous worker program joined by remote-call operators.
//!
//! The entry point is [`pipeline::HeterPipeline`]; the lower layers are public so
//! individual stages can be driven and inspected on their own.

pub mod config;
pub mod dataflow;
pub mod error;
pub mod ir;
pub mod lowering;
pub mod partition;
pub mod passes;
pub mod pipeline;

pub use config::{
    CommContext, DistributedMode, FleetStrategy, MergedVarPair, PassConfig, RecvKind,
    StaticFleetStrategy, VarShard,
};
pub use dataflow::BlockVarDetail;
pub use error::{ErrorKind, JointSide, Result, RewriteError};
pub use partition::{PartitionPlan, Partitioner, Segment};
pub use pipeline::{HeterPipeline, HeterPrograms, PipelineReport, TrainerPrograms};
