//! Defines the resources a stack can declare, with the properties the
//! orchestrator needs to provision them.

use crate::asset::Asset;
use crate::token::Token;
use serde::Deserialize;
use std::collections::BTreeMap;

/// What happens to a resource when its stack is torn down, or when an
/// update replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    /// Delete the resource along with the stack.
    Destroy,

    /// Orphan the resource.
    #[default]
    Retain,
}

impl RemovalPolicy {
    /// The orchestrator's name for this policy.
    pub fn as_str(self) -> &'static str {
        match self {
            RemovalPolicy::Destroy => "Delete",
            RemovalPolicy::Retain => "Retain",
        }
    }
}

/// An object storage bucket. Its name is generated at provisioning
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bucket {
    pub removal_policy: RemovalPolicy,
}

/// The language runtime a function runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Runtime {
    #[serde(rename = "nodejs18.x")]
    #[default]
    Nodejs18,
    #[serde(rename = "nodejs20.x")]
    Nodejs20,
    #[serde(rename = "python3.12")]
    Python312,
    #[serde(rename = "provided.al2")]
    ProvidedAl2,
    #[serde(rename = "provided.al2023")]
    ProvidedAl2023,
}

impl Runtime {
    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::Nodejs18 => "nodejs18.x",
            Runtime::Nodejs20 => "nodejs20.x",
            Runtime::Python312 => "python3.12",
            Runtime::ProvidedAl2 => "provided.al2",
            Runtime::ProvidedAl2023 => "provided.al2023",
        }
    }
}

/// A compute function, invoked by events and deployed from a code
/// bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub runtime: Runtime,

    /// The code bundle.
    pub code: Asset,

    /// The entry point within the bundle, e.g. `hello.handler`.
    pub handler: String,

    /// Variables passed to the function's runtime environment. Values
    /// may be deferred.
    pub environment: BTreeMap<String, Token>,
}

impl Function {
    pub fn new(runtime: Runtime, code: Asset, handler: impl Into<String>) -> Self {
        Function {
            runtime,
            code,
            handler: handler.into(),
            environment: BTreeMap::new(),
        }
    }
}

/// Scalar types usable for table keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Number,
    Binary,
}

impl AttributeType {
    pub fn as_str(self) -> &'static str {
        match self {
            AttributeType::String => "S",
            AttributeType::Number => "N",
            AttributeType::Binary => "B",
        }
    }
}

/// A named, typed key attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeType,
}

impl Attribute {
    pub fn string(name: impl Into<String>) -> Self {
        Attribute {
            name: name.into(),
            kind: AttributeType::String,
        }
    }
}

/// How table capacity is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Billing {
    Provisioned { read: u32, write: u32 },
    PayPerRequest,
}

impl Default for Billing {
    fn default() -> Self {
        Billing::Provisioned { read: 5, write: 5 }
    }
}

/// A key-value table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub partition_key: Attribute,
    pub billing: Billing,
    pub removal_policy: RemovalPolicy,
}

impl Table {
    pub fn new(partition_key: Attribute) -> Self {
        Table {
            partition_key,
            billing: Billing::default(),
            removal_policy: RemovalPolicy::default(),
        }
    }

    pub fn with_removal_policy(mut self, removal_policy: RemovalPolicy) -> Self {
        self.removal_policy = removal_policy;
        self
    }
}
