//! Translates a stack's resource graph into a template. Nodes become
//! their main resource plus whatever supporting resources the
//! orchestrator needs (execution roles, policies, invoke
//! permissions), and edges become properties and dependencies.

use crate::error::GraphError;
use crate::graph::{NodeEntry, Stack};
use crate::resource::{Billing, Bucket, Function, RemovalPolicy, Table};
use crate::template::{Parameter, Template, TemplateOutput, TemplateResource};
use crate::token::{LogicalId, Token};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// The template parameter naming the bucket that code bundles are
/// staged to.
pub const ASSET_BUCKET_PARAMETER: &str = "AssetBucket";

const POLICY_VERSION: &str = "2012-10-17";

/// Managed policy that lets a function write its logs.
const BASIC_EXECUTION_POLICY: &str =
    "arn:${AWS::Partition}:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";

/// Always granted alongside data access.
const DESCRIBE_TABLE: &str = "dynamodb:DescribeTable";

/// Logical id of a function's execution role.
pub fn role_id(function: &NodeEntry) -> LogicalId {
    LogicalId::from_path(&[function.construct_id.as_str(), "ServiceRole", "Resource"])
}

/// Logical id of the inline policy attached to a function's role.
pub fn policy_id(function: &NodeEntry) -> LogicalId {
    LogicalId::from_path(&[
        function.construct_id.as_str(),
        "ServiceRole",
        "DefaultPolicy",
        "Resource",
    ])
}

/// Logical id of the permission allowing a bucket to invoke a
/// function. The permission only checks `SourceAccount`, so it is
/// wider than the event binding: any bucket in the account may invoke.
pub fn permission_id(bucket: &NodeEntry, function: &NodeEntry) -> LogicalId {
    let name = format!("AllowBucketNotificationsTo{}", function.construct_id);
    LogicalId::from_path(&[bucket.construct_id.as_str(), name.as_str()])
}

fn apply_removal_policy(resource: &mut TemplateResource, policy: RemovalPolicy) {
    resource.deletion_policy = Some(policy.as_str());
    resource.update_replace_policy = Some(policy.as_str());
}

fn lookup<'a>(stack: &'a Stack, id: &LogicalId) -> Result<&'a NodeEntry, GraphError> {
    stack.node(id).ok_or_else(|| GraphError::DanglingReference {
        from: stack.id().to_string(),
        to: id.to_string(),
    })
}

fn synth_bucket(
    stack: &Stack,
    entry: &NodeEntry,
    bucket: &Bucket,
    template: &mut Template,
) -> Result<(), GraphError> {
    let mut configurations = Vec::new();
    let mut depends_on = BTreeSet::new();
    for binding in stack
        .event_bindings()
        .iter()
        .filter(|binding| binding.source.id() == &entry.logical_id)
    {
        let function = lookup(stack, binding.destination.id())?;
        let permission = permission_id(entry, function);
        // The permission can't point back at the bucket's ARN without
        // a cycle, so it's scoped to the account instead.
        template.resources.insert(
            permission.to_string(),
            TemplateResource::new(
                "AWS::Lambda::Permission",
                json!({
                    "Action": "lambda:InvokeFunction",
                    "FunctionName": binding.destination.arn(),
                    "Principal": "s3.amazonaws.com",
                    "SourceAccount": Token::Param("AWS::AccountId".to_string()),
                }),
            ),
        );
        depends_on.insert(permission.to_string());
        configurations.push(json!({
            "Event": binding.event.as_str(),
            "Function": binding.destination.arn(),
        }));
    }

    let properties = if configurations.is_empty() {
        json!({})
    } else {
        json!({
            "NotificationConfiguration": {
                "LambdaConfigurations": configurations,
            },
        })
    };
    let mut resource = TemplateResource::new("AWS::S3::Bucket", properties);
    resource.depends_on = depends_on;
    apply_removal_policy(&mut resource, bucket.removal_policy);
    template
        .resources
        .insert(entry.logical_id.to_string(), resource);
    Ok(())
}

fn synth_function(
    stack: &Stack,
    entry: &NodeEntry,
    function: &Function,
    template: &mut Template,
) -> Result<(), GraphError> {
    let role = role_id(entry);
    template.resources.insert(
        role.to_string(),
        TemplateResource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Statement": [{
                        "Action": "sts:AssumeRole",
                        "Effect": "Allow",
                        "Principal": {"Service": "lambda.amazonaws.com"},
                    }],
                    "Version": POLICY_VERSION,
                },
                "ManagedPolicyArns": [Token::Sub(BASIC_EXECUTION_POLICY.to_string())],
            }),
        ),
    );

    let mut depends_on = BTreeSet::from([role.to_string()]);
    let statements: Vec<Value> = stack
        .grants()
        .iter()
        .filter(|grant| grant.actor.id() == &entry.logical_id)
        .map(|grant| {
            let mut actions: BTreeSet<&str> = grant
                .actions
                .iter()
                .flat_map(|action| action.table_actions().iter().copied())
                .collect();
            actions.insert(DESCRIBE_TABLE);
            json!({
                "Action": actions,
                "Effect": "Allow",
                "Resource": [grant.target.arn()],
            })
        })
        .collect();
    if !statements.is_empty() {
        let policy = policy_id(entry);
        template.resources.insert(
            policy.to_string(),
            TemplateResource::new(
                "AWS::IAM::Policy",
                json!({
                    "PolicyDocument": {
                        "Statement": statements,
                        "Version": POLICY_VERSION,
                    },
                    "PolicyName": policy,
                    "Roles": [Token::Ref(role.clone())],
                }),
            ),
        );
        depends_on.insert(policy.to_string());
    }

    let mut properties = Map::new();
    properties.insert(
        "Code".to_string(),
        json!({
            "S3Bucket": Token::Param(ASSET_BUCKET_PARAMETER.to_string()),
            "S3Key": function.code.object_key(),
        }),
    );
    properties.insert("Handler".to_string(), json!(function.handler));
    properties.insert("Role".to_string(), json!(Token::GetAtt(role, "Arn".to_string())));
    properties.insert("Runtime".to_string(), json!(function.runtime.as_str()));
    if !function.environment.is_empty() {
        properties.insert(
            "Environment".to_string(),
            json!({"Variables": function.environment}),
        );
    }
    let mut resource = TemplateResource::new("AWS::Lambda::Function", Value::Object(properties));
    resource.depends_on = depends_on;
    template
        .resources
        .insert(entry.logical_id.to_string(), resource);
    Ok(())
}

fn synth_table(entry: &NodeEntry, table: &Table, template: &mut Template) {
    let key = &table.partition_key;
    let mut properties = json!({
        "AttributeDefinitions": [{
            "AttributeName": key.name,
            "AttributeType": key.kind.as_str(),
        }],
        "KeySchema": [{
            "AttributeName": key.name,
            "KeyType": "HASH",
        }],
    });
    match table.billing {
        Billing::Provisioned { read, write } => {
            properties["ProvisionedThroughput"] = json!({
                "ReadCapacityUnits": read,
                "WriteCapacityUnits": write,
            });
        }
        Billing::PayPerRequest => {
            properties["BillingMode"] = json!("PAY_PER_REQUEST");
        }
    }
    let mut resource = TemplateResource::new("AWS::DynamoDB::Table", properties);
    apply_removal_policy(&mut resource, table.removal_policy);
    template
        .resources
        .insert(entry.logical_id.to_string(), resource);
}

/// Produce the template for a stack, and check that the orchestrator
/// will be able to order its resources.
#[instrument(skip(stack), fields(stack = stack.id()))]
pub fn synthesize(stack: &Stack) -> Result<Template, GraphError> {
    let mut template = Template::new(stack.description().map(String::from));

    if stack.functions().next().is_some() {
        template.parameters.insert(
            ASSET_BUCKET_PARAMETER.to_string(),
            Parameter {
                kind: "String",
                description: Some("Bucket holding the packaged code bundles".to_string()),
            },
        );
    }
    for (entry, bucket) in stack.buckets() {
        synth_bucket(stack, entry, bucket, &mut template)?;
    }
    for (entry, function) in stack.functions() {
        synth_function(stack, entry, function, &mut template)?;
    }
    for (entry, table) in stack.tables() {
        synth_table(entry, table, &mut template);
    }
    for output in stack.outputs() {
        template.outputs.insert(
            output.name.clone(),
            TemplateOutput {
                value: output.value.clone(),
                description: None,
            },
        );
    }

    template.check_dependencies()?;
    debug!(resources = template.resources.len(), "Synthesized template");
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::graph::EventKind;
    use crate::resource::{Attribute, Runtime};
    use std::path::PathBuf;

    fn asset() -> Asset {
        Asset {
            source: PathBuf::from("lambda"),
            hash: "ab".repeat(20),
        }
    }

    #[test]
    fn lone_bucket_has_no_notifications() {
        let mut stack = Stack::new("Test").unwrap();
        let bucket = stack.add_bucket("Bucket", Bucket::default()).unwrap();
        let template = synthesize(&stack).unwrap();
        let resource = &template.resources[bucket.id().as_str()];
        assert!(resource.properties.is_empty());
        assert_eq!(resource.deletion_policy, Some("Retain"));
        assert!(template.parameters.is_empty());
    }

    #[test]
    fn function_without_grants_has_no_policy() {
        let mut stack = Stack::new("Test").unwrap();
        let hello = stack
            .add_function(
                "Hello",
                Function::new(Runtime::ProvidedAl2023, asset(), "bootstrap"),
            )
            .unwrap();
        let template = synthesize(&stack).unwrap();
        assert_eq!(template.resources_of_type("AWS::IAM::Policy").count(), 0);
        let function = &template.resources[hello.id().as_str()];
        assert_eq!(function.properties["Runtime"], json!("provided.al2023"));
        assert_eq!(
            function.properties["Code"]["S3Key"],
            json!(format!("{}.zip", "ab".repeat(20)))
        );
        assert_eq!(
            function.properties["Code"]["S3Bucket"],
            json!({"Ref": ASSET_BUCKET_PARAMETER})
        );
        assert!(function.properties.get("Environment").is_none());
    }

    #[test]
    fn pay_per_request_tables_skip_throughput() {
        let mut stack = Stack::new("Test").unwrap();
        let mut table = Table::new(Attribute::string("pk"));
        table.billing = Billing::PayPerRequest;
        let handle = stack.add_table("Table", table).unwrap();
        let template = synthesize(&stack).unwrap();
        let resource = &template.resources[handle.id().as_str()];
        assert_eq!(resource.properties["BillingMode"], json!("PAY_PER_REQUEST"));
        assert!(resource.properties.get("ProvisionedThroughput").is_none());
    }

    #[test]
    fn removal_events_are_bound_too() {
        let mut stack = Stack::new("Test").unwrap();
        let bucket = stack.add_bucket("Bucket", Bucket::default()).unwrap();
        let hello = stack
            .add_function("Hello", Function::new(Runtime::Nodejs20, asset(), "h.handler"))
            .unwrap();
        stack
            .add_event_notification(&bucket, EventKind::ObjectCreated, &hello)
            .unwrap();
        stack
            .add_event_notification(&bucket, EventKind::ObjectRemoved, &hello)
            .unwrap();
        let template = synthesize(&stack).unwrap();
        let configurations = &template.resources[bucket.id().as_str()].properties
            ["NotificationConfiguration"]["LambdaConfigurations"];
        assert_eq!(configurations.as_array().unwrap().len(), 2);
        assert_eq!(configurations[1]["Event"], json!("s3:ObjectRemoved:*"));
        // One permission per bucket/function pair.
        assert_eq!(template.resources_of_type("AWS::Lambda::Permission").count(), 1);
    }

    #[test]
    fn invoke_permission_is_scoped_to_the_account() {
        let mut stack = Stack::new("Test").unwrap();
        let bucket = stack
            .add_bucket(
                "Bucket",
                Bucket {
                    removal_policy: RemovalPolicy::Destroy,
                },
            )
            .unwrap();
        let hello = stack
            .add_function("Hello", Function::new(Runtime::Nodejs20, asset(), "h.handler"))
            .unwrap();
        stack
            .add_event_notification(&bucket, EventKind::ObjectCreated, &hello)
            .unwrap();
        let template = synthesize(&stack).unwrap();
        let (_, permission) = template
            .resources_of_type("AWS::Lambda::Permission")
            .next()
            .unwrap();
        assert_eq!(
            permission.properties["SourceAccount"],
            json!({"Ref": "AWS::AccountId"})
        );
        assert!(permission.properties.get("SourceArn").is_none());
        let resource = &template.resources[bucket.id().as_str()];
        assert_eq!(resource.deletion_policy, Some("Delete"));
        assert_eq!(resource.update_replace_policy, Some("Delete"));
    }
}
