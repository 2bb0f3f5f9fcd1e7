//! Defines configuration as read from the environment.

use crate::resource::Runtime;
use serde::Deserialize;
use std::path::PathBuf;

/// Default `stack_name` value.
fn default_stack_name() -> String {
    String::from("CdkTestStack")
}

/// Default `asset_path` value.
fn default_asset_path() -> PathBuf {
    PathBuf::from("lambda")
}

/// Default `handler` value.
fn default_handler() -> String {
    String::from("hello.handler")
}

/// Default `output_dir` value.
fn default_output_dir() -> PathBuf {
    PathBuf::from("cdk.out")
}

/// The stack is declared, synthesized and deployed according to these
/// settings. The configuration must be given as environment
/// variables.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// The name of the stack, both in the assembly and once deployed.
    #[serde(default = "default_stack_name")]
    pub stack_name: String,

    /// A description attached to the synthesized template.
    #[serde(default)]
    pub stack_description: Option<String>,

    /// Tags applied to the deployed stack, given as a comma separated
    /// list of `key=value` pairs.
    #[serde(default)]
    pub stack_tags: Vec<String>,

    /// The directory holding the function's code.
    #[serde(default = "default_asset_path")]
    pub asset_path: PathBuf,

    /// The function's entry point within its code.
    #[serde(default = "default_handler")]
    pub handler: String,

    /// The function's runtime, e.g. `nodejs18.x`.
    #[serde(default)]
    pub runtime: Runtime,

    /// Where synthesized templates and manifests are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// The bucket code bundles are staged to before deploying. Only
    /// required for deployments.
    #[serde(default)]
    pub asset_bucket: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Settings {
        envy::from_iter(
            vars.iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply_to_an_empty_environment() {
        let settings = settings(&[]);
        assert_eq!(settings.stack_name, "CdkTestStack");
        assert_eq!(settings.asset_path, PathBuf::from("lambda"));
        assert_eq!(settings.handler, "hello.handler");
        assert_eq!(settings.runtime, Runtime::Nodejs18);
        assert_eq!(settings.output_dir, PathBuf::from("cdk.out"));
        assert!(settings.stack_tags.is_empty());
        assert!(settings.asset_bucket.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let settings = settings(&[
            ("STACK_NAME", "Uploads"),
            ("RUNTIME", "provided.al2023"),
            ("HANDLER", "bootstrap"),
            ("STACK_TAGS", "team=data,env=dev"),
            ("ASSET_BUCKET", "staging"),
        ]);
        assert_eq!(settings.stack_name, "Uploads");
        assert_eq!(settings.runtime, Runtime::ProvidedAl2023);
        assert_eq!(settings.handler, "bootstrap");
        assert_eq!(settings.stack_tags, vec!["team=data", "env=dev"]);
        assert_eq!(settings.asset_bucket.as_deref(), Some("staging"));
    }

    #[test]
    fn unknown_runtimes_are_rejected() {
        let result: Result<Settings, _> =
            envy::from_iter(vec![("RUNTIME".to_string(), "cobol".to_string())]);
        assert!(result.is_err());
    }
}
