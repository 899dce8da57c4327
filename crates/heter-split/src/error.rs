use std::fmt;

use thiserror::Error;

use crate::ir::IrError;

/// Coarse classification of a rewrite failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input program or fleet configuration cannot be split.
    Configuration,
    /// An internal or upstream invariant was broken.
    Invariant,
}

/// Side of a heterogeneous segment a joint tensor is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointSide {
    Entrance,
    Exit,
}

impl fmt::Display for JointSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JointSide::Entrance => f.write_str("entrance"),
            JointSide::Exit => f.write_str("exit"),
        }
    }
}

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error("unsupported device `{device}`, expected one of {supported:?}")]
    UnsupportedDevice {
        device: String,
        supported: Vec<String>,
    },
    #[error(
        "inconsistent fleet configuration: no slot for the distributed lookup of `{param}` \
         (ids ready at {insert_at}, outputs first read at {first_consumer})"
    )]
    DegenerateLookupRange {
        param: String,
        insert_at: usize,
        first_consumer: usize,
    },
    #[error(
        "variable `{name}` with shape {shape:?} cannot cross a device boundary: \
         rank >= 2 with a dynamic leading dimension is required"
    )]
    NotTransportable { name: String, shape: Vec<i64> },
    #[error("segment {segment} reads `{var}` but no earlier segment or declaration provides it")]
    UnresolvedBoundaryVar { segment: usize, var: String },
    #[error("heterogeneous segment {segment} has no {side} variables to join")]
    EmptyJoint { segment: usize, side: JointSide },
    #[error("heterogeneous device `{0}` owns no segment of the program")]
    MissingHeterDevice(String),
    #[error("sparse table `{table}` must have exactly one initializer, found {count}")]
    TableInitializerCount { table: String, count: usize },
}

impl RewriteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RewriteError::Ir(_) | RewriteError::TableInitializerCount { .. } => {
                ErrorKind::Invariant
            }
            RewriteError::UnsupportedDevice { .. }
            | RewriteError::DegenerateLookupRange { .. }
            | RewriteError::NotTransportable { .. }
            | RewriteError::UnresolvedBoundaryVar { .. }
            | RewriteError::EmptyJoint { .. }
            | RewriteError::MissingHeterDevice(_) => ErrorKind::Configuration,
        }
    }
}

pub type Result<T, E = RewriteError> = std::result::Result<T, E>;
