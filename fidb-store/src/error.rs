//! Errors raised synchronously by the view layer.
//!
//! These are caller mistakes (wrong shape, logged-out write, id conflict) and
//! always propagate straight back to the call site. Asynchronous replication
//! failures never show up here.

use std::fmt;
use thiserror::Error;

/// Structural operation rejected on a read-only view level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeOp {
    Set,
    Delete,
    Define,
}

impl fmt::Display for ShapeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeOp::Set => write!(f, "set"),
            ShapeOp::Delete => write!(f, "delete"),
            ShapeOp::Define => write!(f, "define"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ViewError {
    /// Mutation attempted with no signed-in identity.
    #[error("cannot {action} data without logged in user: {dataset}/{id}")]
    LoggedOut {
        action: &'static str,
        dataset: String,
        id: String,
    },

    /// Row written with something other than a record of primitives.
    #[error("invalid value for {dataset}/{id}: {reason}")]
    InvalidValue {
        dataset: String,
        id: String,
        reason: String,
    },

    /// Explicit `id` column conflicts with the row key.
    #[error("id mismatch in {dataset}: key is {expected:?} but value has id {found:?}")]
    IdMismatch {
        dataset: String,
        expected: String,
        found: String,
    },

    /// A stored column holds an object or array.
    #[error("non-primitive value at {dataset}/{id}.{column}: {kind} {value}")]
    NonPrimitiveValue {
        dataset: String,
        id: String,
        column: String,
        kind: &'static str,
        value: String,
    },

    #[error("cannot {op} on {target}")]
    ReadOnlyShape { op: ShapeOp, target: String },
}

impl ViewError {
    pub(crate) fn logged_out_save(dataset: &str, id: &str) -> Self {
        ViewError::LoggedOut {
            action: "save",
            dataset: dataset.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn logged_out_delete(dataset: &str, id: &str) -> Self {
        ViewError::LoggedOut {
            action: "delete",
            dataset: dataset.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn read_only(op: ShapeOp, target: impl Into<String>) -> Self {
        ViewError::ReadOnlyShape {
            op,
            target: target.into(),
        }
    }
}
