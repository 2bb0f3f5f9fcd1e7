use anyhow::{Context, Result};
use bucket_table_stack::{app, client, deploy};

/// Stage the code bundles of the configured stack, deploy it, and
/// print its outputs.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    app::init()?;
    client::init().await?;

    let asset_bucket = app::current()
        .settings
        .asset_bucket
        .as_deref()
        .context("ASSET_BUCKET is required")?;
    let assembly = app::current().assembly()?;
    for stack in assembly.stacks() {
        deploy::publish_assets(client::s3(), asset_bucket, stack)
            .await
            .with_context(|| format!("Failed to stage assets for stack {:?}", stack.id()))?;
        let outputs = deploy::deploy(client::cloudformation(), stack, asset_bucket)
            .await
            .with_context(|| format!("Failed to deploy stack {:?}", stack.id()))?;
        for (key, value) in outputs {
            println!("{}.{} = {}", stack.id(), key, value);
        }
    }
    Ok(())
}
