//! Defines the cloud assembly: the scope stacks are declared into, and
//! the directory of synthesized templates and asset manifests it's
//! written out as.

use crate::asset::Packaging;
use crate::error::GraphError;
use crate::graph::Stack;
use crate::synth::{synthesize, ASSET_BUCKET_PARAMETER};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{create_dir_all, write};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Version of the manifests this crate writes.
pub const MANIFEST_VERSION: &str = "1.0.0";

/// One staged code bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetEntry {
    pub path: PathBuf,
    pub packaging: Packaging,
    pub bucket_parameter: String,
    pub object_key: String,
}

/// The assets a stack needs staged before deploying, keyed by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub version: String,
    pub files: BTreeMap<String, AssetEntry>,
}

impl AssetManifest {
    pub fn for_stack(stack: &Stack) -> Self {
        AssetManifest {
            version: MANIFEST_VERSION.to_string(),
            files: stack
                .assets()
                .map(|asset| {
                    (
                        asset.hash.clone(),
                        AssetEntry {
                            path: asset.source.clone(),
                            packaging: asset.packaging(),
                            bucket_parameter: ASSET_BUCKET_PARAMETER.to_string(),
                            object_key: asset.object_key(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub template_file: String,
    pub assets_file: String,
}

/// Index of everything in the assembly directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub artifacts: BTreeMap<String, Artifact>,
}

/// A set of stacks, synthesized and deployed together.
#[derive(Debug, Default)]
pub struct Assembly {
    stacks: Vec<Stack>,
}

impl Assembly {
    pub fn new() -> Self {
        Assembly::default()
    }

    /// Register a fully declared stack.
    pub fn add_stack(&mut self, stack: Stack) -> Result<(), GraphError> {
        if self.stack(stack.id()).is_some() {
            return Err(GraphError::DuplicateStack(stack.id().to_string()));
        }
        self.stacks.push(stack);
        Ok(())
    }

    pub fn stack(&self, id: &str) -> Option<&Stack> {
        self.stacks.iter().find(|stack| stack.id() == id)
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Synthesize every stack into `outdir`. Returns the manifest that
    /// was written.
    #[instrument(skip(self))]
    pub fn write(&self, outdir: &Path) -> Result<Manifest> {
        create_dir_all(outdir)
            .with_context(|| format!("Failed to create assembly directory {:?}", outdir))?;
        let mut manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            artifacts: BTreeMap::new(),
        };
        for stack in &self.stacks {
            let template = synthesize(stack)
                .with_context(|| format!("Failed to synthesize stack {:?}", stack.id()))?;
            let template_file = format!("{}.template.json", stack.id());
            let assets_file = format!("{}.assets.json", stack.id());
            write_json(&outdir.join(&template_file), &template)?;
            write_json(&outdir.join(&assets_file), &AssetManifest::for_stack(stack))?;
            info!(stack = stack.id(), resources = template.resources.len(), "Wrote template");
            manifest.artifacts.insert(
                stack.id().to_string(),
                Artifact {
                    kind: "aws:cloudformation:stack".to_string(),
                    template_file,
                    assets_file,
                },
            );
        }
        write_json(&outdir.join("manifest.json"), &manifest)?;
        Ok(manifest)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {:?}", path))?;
    write(path, contents).with_context(|| format!("Failed to write {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::resource::{Bucket, Function, Runtime};
    use serde_json::Value;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn stacks_are_unique_by_id() {
        let mut assembly = Assembly::new();
        assembly.add_stack(Stack::new("One").unwrap()).unwrap();
        assert_eq!(
            assembly.add_stack(Stack::new("One").unwrap()),
            Err(GraphError::DuplicateStack("One".into()))
        );
        assert_eq!(assembly.stacks().len(), 1);
    }

    #[test]
    fn write_produces_template_assets_and_manifest() {
        let out = tempdir().unwrap();
        let mut stack = Stack::new("One").unwrap();
        stack.add_bucket("Bucket", Bucket::default()).unwrap();
        let code = Asset {
            source: PathBuf::from("lambda"),
            hash: "cd".repeat(20),
        };
        stack
            .add_function("Hello", Function::new(Runtime::Nodejs18, code, "hello.handler"))
            .unwrap();
        let mut assembly = Assembly::new();
        assembly.add_stack(stack).unwrap();

        let manifest = assembly.write(out.path()).unwrap();
        assert_eq!(manifest.artifacts["One"].template_file, "One.template.json");

        let template: Value =
            serde_json::from_str(&fs::read_to_string(out.path().join("One.template.json")).unwrap())
                .unwrap();
        assert!(template["Resources"].as_object().unwrap().len() >= 3);

        let assets: AssetManifest =
            serde_json::from_str(&fs::read_to_string(out.path().join("One.assets.json")).unwrap())
                .unwrap();
        let entry = &assets.files[&"cd".repeat(20)];
        assert_eq!(entry.object_key, format!("{}.zip", "cd".repeat(20)));
        assert_eq!(entry.packaging, Packaging::Zip);

        let written: Manifest =
            serde_json::from_str(&fs::read_to_string(out.path().join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(written, manifest);
    }
}
