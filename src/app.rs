//! Defines the read-only application state and hub for utility
//! functions.

use crate::assembly::Assembly;
use crate::conf::Settings;
use crate::stack::{declare, StackProps};
use anyhow::{anyhow, bail, Result};
use envy::from_env;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use tracing::instrument;

/// An App is an initialized application state, derived from
/// settings.
#[derive(Debug)]
pub struct App {
    /// The original settings.
    pub settings: Settings,

    /// The stack configuration derived from the settings.
    pub props: StackProps,
}

/// Parse `key=value` pairs into tags.
fn parse_tags(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("stack tag {:?} is not of the form key=value", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("stack tag {:?} has an empty key", pair);
        }
        tags.insert(key.to_string(), value.trim().to_string());
    }
    Ok(tags)
}

impl App {
    /// Initialize an App instance given a settings struct. Consumes
    /// the settings struct.
    pub fn new(settings: Settings) -> Result<Self> {
        let props = StackProps {
            description: settings.stack_description.clone(),
            tags: parse_tags(&settings.stack_tags)?,
            asset_path: settings.asset_path.clone(),
            handler: settings.handler.clone(),
            runtime: settings.runtime,
        };
        Ok(App { settings, props })
    }

    /// Declare the configured stack into a fresh assembly.
    #[instrument(skip(self), fields(stack = %self.settings.stack_name))]
    pub fn assembly(&self) -> Result<Assembly> {
        let mut assembly = Assembly::new();
        declare(
            &mut assembly,
            &self.settings.stack_name,
            self.props.clone(),
        )?;
        Ok(assembly)
    }
}

/// Global App instance.
static CURRENT: OnceCell<App> = OnceCell::new();

/// Initialize the global App instance.
pub fn init() -> Result<()> {
    let settings = from_env()?;
    let app = App::new(settings)?;
    CURRENT
        .set(app)
        .map_err(|_| anyhow!("app::CURRENT was already initialized"))
}

/// Get the current App instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static App {
    CURRENT.get().expect("app is not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn settings(vars: Vec<(&str, String)>) -> Settings {
        envy::from_iter(vars.into_iter().map(|(key, value)| (key.to_string(), value))).unwrap()
    }

    #[test]
    fn tags_are_parsed() {
        let tags = parse_tags(&["team=data".into(), " env = dev ".into()]).unwrap();
        assert_eq!(tags["team"], "data");
        assert_eq!(tags["env"], "dev");
        assert!(parse_tags(&["nope".into()]).is_err());
        assert!(parse_tags(&["=x".into()]).is_err());
    }

    #[test]
    fn app_declares_the_configured_stack() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("hello.js"), "exports.handler = async () => {};").unwrap();
        let app = App::new(settings(vec![
            ("STACK_NAME", "Uploads".to_string()),
            ("ASSET_PATH", dir.path().display().to_string()),
            ("STACK_TAGS", "team=data".to_string()),
        ]))
        .unwrap();
        let assembly = app.assembly().unwrap();
        let stack = assembly.stack("Uploads").unwrap();
        assert_eq!(stack.tags()["team"], "data");
        assert_eq!(stack.outputs().len(), 2);
    }
}
