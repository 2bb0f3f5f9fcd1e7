//! Defines the resource graph of a stack: resource nodes, plus the
//! typed edges between them (event bindings, permission grants and
//! environment bindings), plus the stack outputs.
//!
//! Nodes can only be referenced through the [`Handle`] returned when
//! they're declared, so every edge points at a node that already
//! exists in the graph.

use crate::asset::Asset;
use crate::error::GraphError;
use crate::resource::{Bucket, Function, Table};
use crate::token::{LogicalId, Token};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;

/// Construct ids and output names.
static CONSTRUCT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*$").unwrap());

/// Stack names accepted by the orchestrator.
static STACK_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").unwrap());

/// Function environment variable names.
static ENVIRONMENT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]+$").unwrap());

/// Variables the function runtime sets itself.
const RESERVED_ENVIRONMENT_KEYS: &[&str] = &[
    "_HANDLER",
    "_X_AMZN_TRACE_ID",
    "AWS_ACCESS_KEY",
    "AWS_ACCESS_KEY_ID",
    "AWS_DEFAULT_REGION",
    "AWS_EXECUTION_ENV",
    "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
    "AWS_LAMBDA_FUNCTION_NAME",
    "AWS_LAMBDA_FUNCTION_VERSION",
    "AWS_LAMBDA_INITIALIZATION_TYPE",
    "AWS_LAMBDA_LOG_GROUP_NAME",
    "AWS_LAMBDA_LOG_STREAM_NAME",
    "AWS_LAMBDA_RUNTIME_API",
    "AWS_REGION",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "LAMBDA_RUNTIME_DIR",
    "LAMBDA_TASK_ROOT",
];

/// A declared resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Bucket(Bucket),
    Function(Function),
    Table(Table),
}

/// A node together with its names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// The id given at declaration, unique within the stack.
    pub construct_id: String,

    /// The id of the node's main resource in the template.
    pub logical_id: LogicalId,

    pub node: Node,
}

/// Resource types that can be declared as nodes.
pub trait NodeKind {
    /// Name used in errors.
    const NAME: &'static str;

    fn matches(node: &Node) -> bool;
}

impl NodeKind for Bucket {
    const NAME: &'static str = "bucket";

    fn matches(node: &Node) -> bool {
        matches!(node, Node::Bucket(_))
    }
}

impl NodeKind for Function {
    const NAME: &'static str = "function";

    fn matches(node: &Node) -> bool {
        matches!(node, Node::Function(_))
    }
}

impl NodeKind for Table {
    const NAME: &'static str = "table";

    fn matches(node: &Node) -> bool {
        matches!(node, Node::Table(_))
    }
}

/// A typed reference to a node declared in a [`Stack`]. The handle
/// remembers its stack, since logical ids only depend on the construct
/// id and can repeat across stacks.
pub struct Handle<T> {
    stack: String,
    id: LogicalId,
    kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(stack: String, id: LogicalId) -> Self {
        Handle {
            stack,
            id,
            kind: PhantomData,
        }
    }

    pub fn id(&self) -> &LogicalId {
        &self.id
    }

    /// The id of the stack the node was declared in.
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// The resource's ARN, resolved at deploy time.
    pub fn arn(&self) -> Token {
        Token::GetAtt(self.id.clone(), "Arn".to_string())
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle::new(self.stack.clone(), self.id.clone())
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle")
            .field(&self.stack)
            .field(&self.id)
            .finish()
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.stack == other.stack && self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl Handle<Bucket> {
    /// The bucket's generated name, resolved at deploy time.
    pub fn bucket_name(&self) -> Token {
        Token::Ref(self.id.clone())
    }
}

impl Handle<Table> {
    /// The table's generated name, resolved at deploy time.
    pub fn table_name(&self) -> Token {
        Token::Ref(self.id.clone())
    }
}

/// Storage events a function can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    ObjectCreated,
    ObjectRemoved,
}

impl EventKind {
    /// The notification event name, covering every sub-kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ObjectCreated => "s3:ObjectCreated:*",
            EventKind::ObjectRemoved => "s3:ObjectRemoved:*",
        }
    }
}

/// Classes of table access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    Read,
    Write,
}

impl Action {
    /// The table API actions this class covers.
    pub fn table_actions(self) -> &'static [&'static str] {
        match self {
            Action::Read => &[
                "dynamodb:BatchGetItem",
                "dynamodb:ConditionCheckItem",
                "dynamodb:GetItem",
                "dynamodb:GetRecords",
                "dynamodb:GetShardIterator",
                "dynamodb:Query",
                "dynamodb:Scan",
            ],
            Action::Write => &[
                "dynamodb:BatchWriteItem",
                "dynamodb:DeleteItem",
                "dynamodb:PutItem",
                "dynamodb:UpdateItem",
            ],
        }
    }
}

/// Storage events of one kind, delivered from a bucket to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBinding {
    pub source: Handle<Bucket>,
    pub event: EventKind,
    pub destination: Handle<Function>,
}

/// Authorization for a function to act on a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    pub actor: Handle<Function>,
    pub target: Handle<Table>,
    pub actions: BTreeSet<Action>,
}

/// A named value surfaced once the stack is provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub name: String,
    pub value: Token,
}

/// A named, atomically deployed group of resources.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    id: String,
    description: Option<String>,
    tags: BTreeMap<String, String>,
    nodes: Vec<NodeEntry>,
    event_bindings: Vec<EventBinding>,
    grants: Vec<PermissionGrant>,
    outputs: Vec<Output>,
}

impl Stack {
    /// Create an empty stack. The id doubles as the deployed stack
    /// name.
    pub fn new(id: &str) -> Result<Self, GraphError> {
        if !STACK_NAME.is_match(id) {
            return Err(GraphError::InvalidStackName(id.to_string()));
        }
        Ok(Stack {
            id: id.to_string(),
            ..Default::default()
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn set_tags(&mut self, tags: BTreeMap<String, String>) {
        self.tags = tags;
    }

    fn add_node<T>(&mut self, construct_id: &str, node: Node) -> Result<Handle<T>, GraphError> {
        if !CONSTRUCT_ID.is_match(construct_id) {
            return Err(GraphError::InvalidId(construct_id.to_string()));
        }
        if self.nodes.iter().any(|n| n.construct_id == construct_id) {
            return Err(GraphError::DuplicateId(construct_id.to_string()));
        }
        let logical_id = LogicalId::from_path(&[construct_id, "Resource"]);
        self.nodes.push(NodeEntry {
            construct_id: construct_id.to_string(),
            logical_id: logical_id.clone(),
            node,
        });
        Ok(Handle::new(self.id.clone(), logical_id))
    }

    pub fn add_bucket(&mut self, id: &str, bucket: Bucket) -> Result<Handle<Bucket>, GraphError> {
        self.add_node(id, Node::Bucket(bucket))
    }

    pub fn add_function(
        &mut self,
        id: &str,
        function: Function,
    ) -> Result<Handle<Function>, GraphError> {
        for key in function.environment.keys() {
            check_environment_key(key)?;
        }
        self.add_node(id, Node::Function(function))
    }

    pub fn add_table(&mut self, id: &str, table: Table) -> Result<Handle<Table>, GraphError> {
        if table.partition_key.name.trim().is_empty() {
            return Err(GraphError::EmptyPartitionKey);
        }
        self.add_node(id, Node::Table(table))
    }

    /// Look a node up by its logical id.
    pub fn node(&self, id: &LogicalId) -> Option<&NodeEntry> {
        self.nodes.iter().find(|entry| &entry.logical_id == id)
    }

    /// Resolve a handle to its node, checking that it was declared in
    /// this stack and has the handle's kind.
    fn entry<T: NodeKind>(&self, handle: &Handle<T>) -> Result<&NodeEntry, GraphError> {
        let entry = self
            .node(handle.id())
            .filter(|_| handle.stack() == self.id)
            .ok_or_else(|| GraphError::DanglingReference {
                from: self.id.clone(),
                to: format!("{}/{}", handle.stack(), handle.id()),
            })?;
        if !T::matches(&entry.node) {
            return Err(GraphError::WrongKind {
                id: handle.id().to_string(),
                expected: T::NAME,
            });
        }
        Ok(entry)
    }

    fn function_mut(&mut self, handle: &Handle<Function>) -> Result<&mut Function, GraphError> {
        self.entry(handle)?;
        match self
            .nodes
            .iter_mut()
            .find(|entry| &entry.logical_id == handle.id())
            .map(|entry| &mut entry.node)
        {
            Some(Node::Function(function)) => Ok(function),
            _ => Err(GraphError::WrongKind {
                id: handle.id().to_string(),
                expected: Function::NAME,
            }),
        }
    }

    /// Invoke `destination` whenever `source` emits an `event`.
    pub fn add_event_notification(
        &mut self,
        source: &Handle<Bucket>,
        event: EventKind,
        destination: &Handle<Function>,
    ) -> Result<(), GraphError> {
        self.entry(source)?;
        self.entry(destination)?;
        let binding = EventBinding {
            source: source.clone(),
            event,
            destination: destination.clone(),
        };
        if !self.event_bindings.contains(&binding) {
            self.event_bindings.push(binding);
        }
        Ok(())
    }

    /// Allow `actor` to perform `actions` on `target`. Repeated grants
    /// between the same pair are merged.
    pub fn grant(
        &mut self,
        actor: &Handle<Function>,
        target: &Handle<Table>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Result<(), GraphError> {
        self.entry(actor)?;
        self.entry(target)?;
        let actions: BTreeSet<Action> = actions.into_iter().collect();
        if let Some(existing) = self
            .grants
            .iter_mut()
            .find(|grant| &grant.actor == actor && &grant.target == target)
        {
            existing.actions.extend(actions);
        } else {
            self.grants.push(PermissionGrant {
                actor: actor.clone(),
                target: target.clone(),
                actions,
            });
        }
        Ok(())
    }

    pub fn grant_read_write_data(
        &mut self,
        actor: &Handle<Function>,
        target: &Handle<Table>,
    ) -> Result<(), GraphError> {
        self.grant(actor, target, [Action::Read, Action::Write])
    }

    /// Pass `value` to the function's runtime environment as `key`.
    /// Every node `value` references must be declared in this stack.
    pub fn add_environment(
        &mut self,
        function: &Handle<Function>,
        key: &str,
        value: Token,
    ) -> Result<(), GraphError> {
        check_environment_key(key)?;
        for reference in value.references() {
            if !self.nodes.iter().any(|n| n.logical_id.as_str() == reference) {
                return Err(GraphError::DanglingReference {
                    from: function.id().to_string(),
                    to: reference,
                });
            }
        }
        self.function_mut(function)?
            .environment
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn add_output(&mut self, name: &str, value: Token) -> Result<(), GraphError> {
        if !CONSTRUCT_ID.is_match(name) {
            return Err(GraphError::InvalidId(name.to_string()));
        }
        if self.outputs.iter().any(|output| output.name == name) {
            return Err(GraphError::DuplicateOutput(name.to_string()));
        }
        self.outputs.push(Output {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    pub fn nodes(&self) -> &[NodeEntry] {
        &self.nodes
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&NodeEntry, &Bucket)> {
        self.nodes.iter().filter_map(|entry| match &entry.node {
            Node::Bucket(bucket) => Some((entry, bucket)),
            _ => None,
        })
    }

    pub fn functions(&self) -> impl Iterator<Item = (&NodeEntry, &Function)> {
        self.nodes.iter().filter_map(|entry| match &entry.node {
            Node::Function(function) => Some((entry, function)),
            _ => None,
        })
    }

    pub fn tables(&self) -> impl Iterator<Item = (&NodeEntry, &Table)> {
        self.nodes.iter().filter_map(|entry| match &entry.node {
            Node::Table(table) => Some((entry, table)),
            _ => None,
        })
    }

    pub fn event_bindings(&self) -> &[EventBinding] {
        &self.event_bindings
    }

    pub fn grants(&self) -> &[PermissionGrant] {
        &self.grants
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Code bundles referenced by the stack's functions.
    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.functions().map(|(_, function)| &function.code)
    }
}

fn check_environment_key(key: &str) -> Result<(), GraphError> {
    if !ENVIRONMENT_KEY.is_match(key) {
        return Err(GraphError::InvalidEnvironmentKey(key.to_string()));
    }
    if RESERVED_ENVIRONMENT_KEYS.contains(&key) {
        return Err(GraphError::ReservedEnvironmentKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Attribute, RemovalPolicy, Runtime};
    use std::path::PathBuf;

    fn asset() -> Asset {
        Asset {
            source: PathBuf::from("lambda"),
            hash: "0".repeat(40),
        }
    }

    fn function() -> Function {
        Function::new(Runtime::Nodejs18, asset(), "hello.handler")
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut stack = Stack::new("Test").unwrap();
        stack.add_bucket("Bucket", Bucket::default()).unwrap();
        assert_eq!(
            stack.add_bucket("Bucket", Bucket::default()),
            Err(GraphError::DuplicateId("Bucket".into()))
        );
        assert_eq!(
            stack.add_table("Bucket", Table::new(Attribute::string("name"))),
            Err(GraphError::DuplicateId("Bucket".into()))
        );
    }

    #[test]
    fn ids_must_be_alphanumeric() {
        let mut stack = Stack::new("Test").unwrap();
        assert_eq!(
            stack.add_bucket("my-bucket", Bucket::default()),
            Err(GraphError::InvalidId("my-bucket".into()))
        );
        assert!(matches!(
            Stack::new("1stack"),
            Err(GraphError::InvalidStackName(_))
        ));
    }

    #[test]
    fn empty_partition_key_is_rejected() {
        let mut stack = Stack::new("Test").unwrap();
        assert_eq!(
            stack.add_table("Table", Table::new(Attribute::string(" "))),
            Err(GraphError::EmptyPartitionKey)
        );
    }

    #[test]
    fn environment_keys_are_checked() {
        let mut stack = Stack::new("Test").unwrap();
        let hello = stack.add_function("Hello", function()).unwrap();
        assert_eq!(
            stack.add_environment(&hello, "AWS_REGION", "eu-west-1".into()),
            Err(GraphError::ReservedEnvironmentKey("AWS_REGION".into()))
        );
        assert_eq!(
            stack.add_environment(&hello, "1NAME", "x".into()),
            Err(GraphError::InvalidEnvironmentKey("1NAME".into()))
        );
        stack
            .add_environment(&hello, "MODE", "test".into())
            .unwrap();
    }

    #[test]
    fn handles_from_other_stacks_dangle() {
        let mut other = Stack::new("Other").unwrap();
        let table = other
            .add_table("Elsewhere", Table::new(Attribute::string("name")))
            .unwrap();
        let mut stack = Stack::new("Test").unwrap();
        let hello = stack.add_function("Hello", function()).unwrap();
        assert!(matches!(
            stack.grant_read_write_data(&hello, &table),
            Err(GraphError::DanglingReference { .. })
        ));
        assert!(matches!(
            stack.add_environment(&hello, "TABLE_NAME", table.table_name()),
            Err(GraphError::DanglingReference { .. })
        ));
    }

    #[test]
    fn handles_with_colliding_ids_from_other_stacks_dangle() {
        let mut other = Stack::new("Other").unwrap();
        let foreign_table = other
            .add_table("Hello", Table::new(Attribute::string("name")))
            .unwrap();
        let foreign_bucket = other.add_bucket("Uploads", Bucket::default()).unwrap();
        let mut stack = Stack::new("Test").unwrap();
        let hello = stack.add_function("Hello", function()).unwrap();
        stack.add_bucket("Uploads", Bucket::default()).unwrap();
        assert_eq!(foreign_table.id(), hello.id());

        assert!(matches!(
            stack.grant_read_write_data(&hello, &foreign_table),
            Err(GraphError::DanglingReference { .. })
        ));
        assert!(matches!(
            stack.add_event_notification(&foreign_bucket, EventKind::ObjectCreated, &hello),
            Err(GraphError::DanglingReference { .. })
        ));
        assert!(stack.grants().is_empty());
        assert!(stack.event_bindings().is_empty());
    }

    #[test]
    fn handles_of_the_wrong_kind_are_rejected() {
        let mut twin = Stack::new("Test").unwrap();
        let table = twin
            .add_table("Hello", Table::new(Attribute::string("name")))
            .unwrap();
        let mut stack = Stack::new("Test").unwrap();
        let hello = stack.add_function("Hello", function()).unwrap();
        assert_eq!(
            stack.grant_read_write_data(&hello, &table),
            Err(GraphError::WrongKind {
                id: table.id().to_string(),
                expected: "table",
            })
        );
    }

    #[test]
    fn repeated_grants_are_merged() {
        let mut stack = Stack::new("Test").unwrap();
        let hello = stack.add_function("Hello", function()).unwrap();
        let table = stack
            .add_table(
                "Table",
                Table::new(Attribute::string("name")).with_removal_policy(RemovalPolicy::Destroy),
            )
            .unwrap();
        stack.grant(&hello, &table, [Action::Read]).unwrap();
        stack.grant(&hello, &table, [Action::Write]).unwrap();
        assert_eq!(stack.grants().len(), 1);
        assert_eq!(
            stack.grants()[0].actions,
            BTreeSet::from([Action::Read, Action::Write])
        );
    }

    #[test]
    fn repeated_event_bindings_are_kept_once() {
        let mut stack = Stack::new("Test").unwrap();
        let bucket = stack.add_bucket("Bucket", Bucket::default()).unwrap();
        let hello = stack.add_function("Hello", function()).unwrap();
        for _ in 0..2 {
            stack
                .add_event_notification(&bucket, EventKind::ObjectCreated, &hello)
                .unwrap();
        }
        assert_eq!(stack.event_bindings().len(), 1);
    }

    #[test]
    fn duplicate_outputs_are_rejected() {
        let mut stack = Stack::new("Test").unwrap();
        let bucket = stack.add_bucket("Bucket", Bucket::default()).unwrap();
        stack.add_output("BucketName", bucket.bucket_name()).unwrap();
        assert_eq!(
            stack.add_output("BucketName", bucket.bucket_name()),
            Err(GraphError::DuplicateOutput("BucketName".into()))
        );
    }
}
