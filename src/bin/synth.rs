use anyhow::{Context, Result};
use bucket_table_stack::app;
use tracing::info;

/// Declare the configured stack and write its template and asset
/// manifest to the output directory.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    app::init()?;

    let assembly = app::current().assembly()?;
    let outdir = &app::current().settings.output_dir;
    let manifest = assembly
        .write(outdir)
        .with_context(|| format!("Failed to write the assembly to {:?}", outdir))?;
    for (stack, artifact) in &manifest.artifacts {
        info!(
            stack = %stack,
            template = %outdir.join(&artifact.template_file).display(),
            "Synthesized"
        );
    }
    Ok(())
}
