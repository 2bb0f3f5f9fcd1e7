//! Hands synthesized stacks to the orchestrator: stages code bundles,
//! creates or updates the stack, and waits for the orchestrator to
//! settle.

use crate::client;
use crate::graph::Stack;
use crate::synth::{synthesize, ASSET_BUCKET_PARAMETER};
use anyhow::{bail, Context, Result};
use aws_sdk_cloudformation::error::ProvideErrorMetadata;
use aws_sdk_cloudformation::types::{Capability, Parameter, Tag};
use aws_sdk_cloudformation::Client;
use core::time::Duration;
use std::collections::BTreeMap;
use tempfile::NamedTempFile;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

/// The minimum time to wait between status checks, in milliseconds.
const BASE_LAPSE_TIME: u64 = 2000;

/// The base of the exponential backoff sequence.
const BACKOFF_BASE: u64 = 2;

/// The maximum amount of milliseconds to sleep between status checks.
const MAX_SLEEP: u64 = 30000;

/// The maximum amount of milliseconds to wait for a stack to settle.
const MAX_WAIT: u64 = 3_600_000;

/// Waits between successive status checks, backing off while the
/// orchestrator is still busy.
#[derive(Debug, Default)]
struct Poller {
    backoff: u32,
    waited: Duration,
}

impl Poller {
    /// The delay before the next check.
    fn delay(&self) -> Duration {
        Duration::from_millis(std::cmp::min(
            BASE_LAPSE_TIME.saturating_mul(BACKOFF_BASE.saturating_pow(self.backoff)),
            MAX_SLEEP,
        ))
    }

    /// Whether the total time spent waiting is past the deadline.
    fn exhausted(&self) -> bool {
        self.waited >= Duration::from_millis(MAX_WAIT)
    }

    fn advance(&mut self) -> Duration {
        let delay = self.delay();
        self.waited = self.waited.saturating_add(delay);
        self.backoff = self.backoff.saturating_add(1);
        delay
    }

    async fn wait(&mut self) -> Result<()> {
        if self.exhausted() {
            bail!("Gave up after waiting {:?}", self.waited);
        }
        sleep(self.advance()).await;
        Ok(())
    }
}

/// Whether the orchestrator is still working on the stack.
/// `REVIEW_IN_PROGRESS` is left alone until someone executes a change
/// set, so it never settles on its own.
fn in_progress(status: &str) -> bool {
    status.ends_with("_IN_PROGRESS") && status != "REVIEW_IN_PROGRESS"
}

/// What to do with a stack in a settled status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Create,
    /// The stack can't be updated, so it's deleted and created again.
    Replace,
    Update,
}

impl Plan {
    fn for_status(status: Option<&str>) -> Self {
        match status {
            None | Some("DELETE_COMPLETE") => Plan::Create,
            Some("ROLLBACK_COMPLETE" | "REVIEW_IN_PROGRESS") => Plan::Replace,
            Some(_) => Plan::Update,
        }
    }
}

/// Current status of a deployed stack, or `None` if there's no such
/// stack.
async fn describe(cfn: &Client, name: &str) -> Result<Option<aws_sdk_cloudformation::types::Stack>> {
    match cfn.describe_stacks().stack_name(name).send().await {
        Ok(response) => Ok(response.stacks().unwrap_or_default().first().cloned()),
        Err(e) => {
            let e = e.into_service_error();
            if e.message().map_or(false, |m| m.contains("does not exist")) {
                Ok(None)
            } else {
                Err(anyhow::Error::new(e)
                    .context(format!("Failed to describe stack {:?}", name)))
            }
        }
    }
}

fn status_of(stack: &aws_sdk_cloudformation::types::Stack) -> String {
    stack
        .stack_status()
        .map(|status| status.as_str().to_string())
        .unwrap_or_default()
}

/// Poll until the stack reaches a terminal status. Returns `None` if
/// the stack no longer exists.
#[instrument(skip(cfn))]
async fn settle(cfn: &Client, name: &str) -> Result<Option<String>> {
    let mut poller = Poller::default();
    loop {
        let Some(stack) = describe(cfn, name).await? else {
            return Ok(None);
        };
        let status = status_of(&stack);
        if !in_progress(&status) {
            return Ok(Some(status));
        }
        info!(status = %status, "Waiting for stack");
        poller
            .wait()
            .await
            .with_context(|| format!("Stack {:?} is stuck in status {}", name, status))?;
    }
}

/// Package and upload every code bundle the stack references, unless
/// the bucket already holds it.
#[instrument(skip(s3, stack), fields(stack = stack.id()))]
pub async fn publish_assets(s3: &aws_sdk_s3::Client, bucket: &str, stack: &Stack) -> Result<()> {
    for asset in stack.assets() {
        let key = asset.object_key();
        if client::object_exists(s3, bucket, &key).await? {
            info!(key = %key, "Asset already staged");
            continue;
        }
        let archive = NamedTempFile::new().context("Failed to create a staging file")?;
        asset.package(archive.path())?;
        client::upload(s3, bucket, archive.path(), &key).await?;
        info!(key = %key, source = ?asset.source, "Staged asset");
    }
    Ok(())
}

/// Create the stack, or update it if it already exists. Returns the
/// stack outputs once the orchestrator is done.
#[instrument(skip(cfn, stack), fields(stack = stack.id()))]
pub async fn deploy(
    cfn: &Client,
    stack: &Stack,
    asset_bucket: &str,
) -> Result<BTreeMap<String, String>> {
    let name = stack.id();
    let body = synthesize(stack)
        .with_context(|| format!("Failed to synthesize stack {:?}", name))?
        .to_json_pretty()?;
    let parameters = vec![Parameter::builder()
        .parameter_key(ASSET_BUCKET_PARAMETER)
        .parameter_value(asset_bucket)
        .build()];
    let tags: Vec<Tag> = stack
        .tags()
        .iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect();

    let mut status = describe(cfn, name).await?.as_ref().map(status_of);
    if status.as_deref().map_or(false, in_progress) {
        status = settle(cfn, name).await?;
    }
    let plan = Plan::for_status(status.as_deref());
    if plan == Plan::Replace {
        warn!(status = ?status, "Stack can't be updated; deleting it first");
        destroy(cfn, name).await?;
    }

    let expected = if plan == Plan::Update {
        info!("Updating stack");
        let result = cfn
            .update_stack()
            .stack_name(name)
            .template_body(&body)
            .capabilities(Capability::CapabilityIam)
            .set_parameters(Some(parameters))
            .set_tags(Some(tags))
            .send()
            .await;
        if let Err(e) = result {
            let e = e.into_service_error();
            if e.message()
                .map_or(false, |m| m.contains("No updates are to be performed"))
            {
                info!("Stack is up to date");
                return outputs(cfn, name).await;
            }
            return Err(anyhow::Error::new(e).context(format!("Failed to update stack {:?}", name)));
        }
        "UPDATE_COMPLETE"
    } else {
        info!("Creating stack");
        cfn.create_stack()
            .stack_name(name)
            .template_body(&body)
            .capabilities(Capability::CapabilityIam)
            .set_parameters(Some(parameters))
            .set_tags(Some(tags))
            .send()
            .await
            .with_context(|| format!("Failed to create stack {:?}", name))?;
        "CREATE_COMPLETE"
    };

    match settle(cfn, name).await? {
        Some(status) if status == expected => outputs(cfn, name).await,
        Some(status) => bail!("Stack {:?} ended in status {}", name, status),
        None => bail!("Stack {:?} disappeared while deploying", name),
    }
}

/// The outputs of a deployed stack.
async fn outputs(cfn: &Client, name: &str) -> Result<BTreeMap<String, String>> {
    let stack = describe(cfn, name)
        .await?
        .with_context(|| format!("Stack {:?} does not exist", name))?;
    Ok(stack
        .outputs()
        .unwrap_or_default()
        .iter()
        .filter_map(|output| {
            Some((
                output.output_key()?.to_string(),
                output.output_value()?.to_string(),
            ))
        })
        .collect())
}

/// Tear the stack down. Resources with a `Destroy` removal policy are
/// deleted along with it.
#[instrument(skip(cfn))]
pub async fn destroy(cfn: &Client, name: &str) -> Result<()> {
    if describe(cfn, name).await?.is_none() {
        info!("Stack does not exist; nothing to destroy");
        return Ok(());
    }
    cfn.delete_stack()
        .stack_name(name)
        .send()
        .await
        .with_context(|| format!("Failed to delete stack {:?}", name))?;
    match settle(cfn, name).await? {
        None => Ok(()),
        Some(status) if status == "DELETE_COMPLETE" => Ok(()),
        Some(status) => bail!("Stack {:?} ended in status {}", name, status),
    }
}
