//! Defines the global AWS clients: S3 for staging code bundles, and
//! CloudFormation for handing templates to the orchestrator.

use anyhow::{anyhow, Context, Result};
use aws_config::{from_env, SdkConfig};
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use once_cell::sync::OnceCell;
use std::env;
use std::path::Path;

/// Checks whether an object already exists, so that unchanged code
/// bundles aren't uploaded again.
pub async fn object_exists(client: &aws_sdk_s3::Client, bucket: &str, key: &str) -> Result<bool> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            let e = e.into_service_error();
            if e.is_not_found() {
                Ok(false)
            } else {
                Err(anyhow::Error::new(e).context(format!(
                    "Failed to check for object {:?} in bucket {:?}",
                    key, bucket
                )))
            }
        }
    }
}

/// Uploads a single object to storage.
pub async fn upload(client: &aws_sdk_s3::Client, bucket: &str, path: &Path, key: &str) -> Result<()> {
    let body = ByteStream::from_path(path).await.with_context(|| {
        format!(
            "Failed to load contents of local file {:?} for upload",
            path
        )
    })?;
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await
        .with_context(|| {
            format!(
                "Failed to upload local file {:?} to remote object {:?} in bucket {:?}",
                path, key, bucket
            )
        })?;
    Ok(())
}

/// Global clients.
struct Clients {
    s3: aws_sdk_s3::Client,
    cloudformation: aws_sdk_cloudformation::Client,
}

static CURRENT: OnceCell<Clients> = OnceCell::new();

/// Load the shared SDK configuration. `AWS_ENDPOINT_URL` overrides
/// the service endpoints, e.g. to target a local emulator.
async fn load_config() -> SdkConfig {
    let endpoint_url_var = env::var("AWS_ENDPOINT_URL");
    if let Ok(endpoint_url) = endpoint_url_var {
        from_env()
            .endpoint_url(
                if endpoint_url.starts_with("http://") || endpoint_url.starts_with("https://") {
                    endpoint_url
                } else {
                    format!("https://{}", endpoint_url)
                },
            )
            .region(Region::new("us-east-1")) // should be OK since the endpoint was overridden
            .load()
            .await
    } else {
        from_env().load().await
    }
}

/// Initialize the global clients.
pub async fn init() -> Result<()> {
    let config = load_config().await;
    let clients = Clients {
        s3: aws_sdk_s3::Client::new(&config),
        cloudformation: aws_sdk_cloudformation::Client::new(&config),
    };
    CURRENT
        .set(clients)
        .map_err(|_| anyhow!("client::CURRENT was already initialized"))
}

fn current() -> &'static Clients {
    CURRENT.get().expect("client is not initialized")
}

/// Get the current S3 client instance, or panic if it hasn't been
/// initialized.
pub fn s3() -> &'static aws_sdk_s3::Client {
    &current().s3
}

/// Get the current CloudFormation client instance, or panic if it
/// hasn't been initialized.
pub fn cloudformation() -> &'static aws_sdk_cloudformation::Client {
    &current().cloudformation
}
