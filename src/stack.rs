//! The stack definition: an upload bucket whose new objects trigger a
//! function, and a table the function records them in.

use crate::asset::Asset;
use crate::assembly::Assembly;
use crate::graph::{EventKind, Stack};
use crate::resource::{Attribute, Bucket, Function, RemovalPolicy, Runtime, Table};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, instrument};

/// Name of the variable through which the function learns the table
/// name.
pub const TABLE_NAME_VAR: &str = "TABLE_NAME";

/// Configuration for [`declare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackProps {
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,

    /// Directory holding the function's code.
    pub asset_path: PathBuf,

    pub handler: String,
    pub runtime: Runtime,
}

impl Default for StackProps {
    fn default() -> Self {
        StackProps {
            description: None,
            tags: BTreeMap::new(),
            asset_path: PathBuf::from("lambda"),
            handler: String::from("hello.handler"),
            runtime: Runtime::default(),
        }
    }
}

/// Declare the stack `id` into `scope`, registering the `BucketName`
/// and `TableName` outputs.
#[instrument(skip(scope, props), fields(asset = ?props.asset_path))]
pub fn declare(scope: &mut Assembly, id: &str, props: StackProps) -> Result<()> {
    let mut stack = Stack::new(id)?;
    stack.set_description(props.description);
    stack.set_tags(props.tags);

    let bucket = stack.add_bucket(
        "Bucket",
        Bucket {
            removal_policy: RemovalPolicy::Destroy,
        },
    )?;

    let code = Asset::from_dir(&props.asset_path)
        .with_context(|| format!("Failed to load the code for stack {:?}", id))?;
    let hello = stack.add_function(
        "HelloLambda",
        Function::new(props.runtime, code, props.handler),
    )?;

    stack.add_event_notification(&bucket, EventKind::ObjectCreated, &hello)?;

    let table = stack.add_table(
        "Table",
        Table::new(Attribute::string("name")).with_removal_policy(RemovalPolicy::Destroy),
    )?;

    stack.grant_read_write_data(&hello, &table)?;
    stack.add_environment(&hello, TABLE_NAME_VAR, table.table_name())?;

    stack.add_output("BucketName", bucket.bucket_name())?;
    stack.add_output("TableName", table.table_name())?;

    info!(resources = stack.nodes().len(), "Declared stack");
    scope.add_stack(stack)?;
    Ok(())
}
