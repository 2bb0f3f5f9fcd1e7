//! Defines the template document handed to the orchestrator, and the
//! checks run on its dependency graph before it's handed over.

use crate::error::GraphError;
use crate::token::Token;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const FORMAT_VERSION: &str = "2010-09-09";

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: &'static str,

    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Parameters", skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,

    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, TemplateResource>,

    #[serde(rename = "Outputs", skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, TemplateOutput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub kind: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateResource {
    #[serde(rename = "Type")]
    pub kind: &'static str,

    #[serde(skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,

    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<&'static str>,
}

impl TemplateResource {
    pub fn new(kind: &'static str, properties: Value) -> Self {
        TemplateResource {
            kind,
            properties: match properties {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            depends_on: BTreeSet::new(),
            deletion_policy: None,
            update_replace_policy: None,
        }
    }

    /// Every name this resource needs resolved before it can be
    /// created: explicit dependencies, plus references made from its
    /// properties.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut names = self.depends_on.clone();
        for value in self.properties.values() {
            collect_references(value, &mut names);
        }
        names
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateOutput {
    pub value: Token,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Walk a property value and collect the names referenced through
/// `Ref`, `Fn::GetAtt` and `Fn::Sub`.
fn collect_references(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let (1, Some(Value::String(name))) = (map.len(), map.get("Ref")) {
                if !name.starts_with("AWS::") {
                    names.insert(name.clone());
                }
                return;
            }
            if let (1, Some(Value::Array(path))) = (map.len(), map.get("Fn::GetAtt")) {
                if let Some(Value::String(name)) = path.first() {
                    names.insert(name.clone());
                }
                return;
            }
            if let (1, Some(Value::String(template))) = (map.len(), map.get("Fn::Sub")) {
                names.extend(Token::Sub(template.clone()).references());
                return;
            }
            for nested in map.values() {
                collect_references(nested, names);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, names);
            }
        }
        _ => {}
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl Template {
    pub fn new(description: Option<String>) -> Self {
        Template {
            format_version: FORMAT_VERSION,
            description,
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Resources of the given type, in logical id order.
    pub fn resources_of_type<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a TemplateResource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, resource)| resource.kind == kind)
    }

    /// Check that every reference resolves to a resource or parameter,
    /// and that resources can be created in some order.
    pub fn check_dependencies(&self) -> Result<(), GraphError> {
        let mut edges: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for (id, resource) in &self.resources {
            let dependencies = resource.dependencies();
            for name in &dependencies {
                if !self.resources.contains_key(name) && !self.parameters.contains_key(name) {
                    return Err(GraphError::DanglingReference {
                        from: id.clone(),
                        to: name.clone(),
                    });
                }
            }
            edges.insert(id.as_str(), dependencies);
        }
        for (name, output) in &self.outputs {
            for reference in output.value.references() {
                if !self.resources.contains_key(&reference)
                    && !self.parameters.contains_key(&reference)
                {
                    return Err(GraphError::DanglingReference {
                        from: name.clone(),
                        to: reference,
                    });
                }
            }
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut path: Vec<&str> = Vec::new();
        for id in edges.keys() {
            visit(*id, &edges, &mut marks, &mut path)?;
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Depth-first search reporting the first cycle found.
fn visit<'a>(
    id: &'a str,
    edges: &'a BTreeMap<&'a str, BTreeSet<String>>,
    marks: &mut BTreeMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<(), GraphError> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|step| *step == id).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Err(GraphError::Cycle(cycle));
        }
        None => {}
    }
    marks.insert(id, Mark::Visiting);
    path.push(id);
    if let Some(dependencies) = edges.get(id) {
        for dependency in dependencies {
            // Parameters have no outgoing edges.
            if let Some((next, _)) = edges.get_key_value(dependency.as_str()) {
                visit(*next, edges, marks, path)?;
            }
        }
    }
    path.pop();
    marks.insert(id, Mark::Done);
    Ok(())
}
