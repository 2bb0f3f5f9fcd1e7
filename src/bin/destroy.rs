use anyhow::{Context, Result};
use bucket_table_stack::{app, client, deploy};

/// Tear down the configured stack.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    app::init()?;
    client::init().await?;

    let name = &app::current().settings.stack_name;
    deploy::destroy(client::cloudformation(), name)
        .await
        .with_context(|| format!("Failed to destroy stack {:?}", name))
}
