//! Errors raised while declaring or synthesizing a stack.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("invalid id {0:?}: ids must start with a letter and contain only letters and digits")]
    InvalidId(String),

    #[error("invalid stack name {0:?}")]
    InvalidStackName(String),

    #[error("duplicate id {0:?}")]
    DuplicateId(String),

    #[error("duplicate output {0:?}")]
    DuplicateOutput(String),

    #[error("duplicate stack {0:?}")]
    DuplicateStack(String),

    #[error("invalid environment variable name {0:?}")]
    InvalidEnvironmentKey(String),

    #[error("environment variable {0:?} is reserved by the function runtime")]
    ReservedEnvironmentKey(String),

    #[error("partition key name must not be empty")]
    EmptyPartitionKey,

    #[error("{from} references {to}, which isn't declared")]
    DanglingReference { from: String, to: String },

    #[error("{id} is not a {expected}")]
    WrongKind { id: String, expected: &'static str },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}
