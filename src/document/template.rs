//! Template rendering and loop expansion for raw mail nodes.
//!
//! A raw mail node is a YAML mapping whose string fields may contain
//! `{{ … }}` template expressions. Rendering recurses uniformly through
//! scalars, sequences and mappings; non-string leaves pass through
//! unchanged. A `loop` field multiplies the node into one descriptor per
//! element of the loop source, binding each element as `item`.

use handlebars::{no_escape, Handlebars};
use serde_json::{Map, Value as Json};
use serde_yaml::{Mapping, Value as Yaml};

use crate::core::error::{AppError, Result};

/// Renders template strings against a variable scope and expands `loop`
/// directives. Pure transformation; no side effects.
pub struct TemplateExpander {
    registry: Handlebars<'static>,
    globals: Map<String, Json>,
}

impl TemplateExpander {
    /// Create an expander over the document's global `vars` mapping.
    pub fn new(vars: Option<&Mapping>) -> Self {
        let mut registry = Handlebars::new();
        // Raw substitution: mail bodies are not HTML documents.
        registry.register_escape_fn(no_escape);

        let globals = vars.map(mapping_to_scope).unwrap_or_default();

        Self { registry, globals }
    }

    /// Render a single template string, optionally binding a loop `item`.
    pub fn render_str(&self, template: &str, item: Option<&Json>) -> Result<String> {
        let mut scope = self.globals.clone();
        if let Some(item) = item {
            scope.insert("item".to_string(), item.clone());
        }

        Ok(self.registry.render_template(template, &scope)?)
    }

    /// Render a YAML value tree: strings through the template engine,
    /// sequences and mappings element-wise, everything else verbatim.
    pub fn render_value(&self, value: &Yaml, item: Option<&Json>) -> Result<Yaml> {
        match value {
            Yaml::String(s) => Ok(Yaml::String(self.render_str(s, item)?)),
            Yaml::Sequence(seq) => {
                let mut copy = Vec::with_capacity(seq.len());
                for element in seq {
                    copy.push(self.render_value(element, item)?);
                }
                Ok(Yaml::Sequence(copy))
            }
            Yaml::Mapping(map) => {
                let mut copy = Mapping::new();
                for (key, val) in map {
                    copy.insert(key.clone(), self.render_value(val, item)?);
                }
                Ok(Yaml::Mapping(copy))
            }
            other => Ok(other.clone()),
        }
    }

    /// Expand one raw mail node into its rendered descriptors.
    ///
    /// Without a `loop` field this renders the node once. With one, the
    /// loop source is resolved to a list of N elements and the node is
    /// rendered N times, each with the element bound as `item`.
    pub fn expand(&self, mut node: Mapping) -> Result<Vec<Mapping>> {
        let loop_source = node.remove("loop");

        let items = match loop_source {
            None | Some(Yaml::Null) => {
                let rendered = self.render_value(&Yaml::Mapping(node), None)?;
                return Ok(vec![expect_mapping(rendered)]);
            }
            Some(source) => self.loop_items(source)?,
        };

        let mut expanded = Vec::with_capacity(items.len());
        for item in &items {
            let rendered = self.render_value(&Yaml::Mapping(node.clone()), Some(item))?;
            expanded.push(expect_mapping(rendered));
        }

        Ok(expanded)
    }

    /// Resolve a `loop` source into its elements.
    ///
    /// A string source is rendered first and then parsed as a structured
    /// list; anything that does not end up as a sequence is a
    /// configuration error for the owning node.
    fn loop_items(&self, source: Yaml) -> Result<Vec<Json>> {
        let resolved = match source {
            Yaml::String(text) => {
                let rendered = self.render_str(&text, None)?;
                serde_yaml::from_str::<Yaml>(&rendered).map_err(|err| {
                    AppError::Config(format!("Failed to parse loop source as a list: {}", err))
                })?
            }
            other => self.render_value(&other, None)?,
        };

        match resolved {
            Yaml::Sequence(elements) => Ok(elements.into_iter().map(yaml_to_json).collect()),
            other => Err(AppError::Config(format!(
                "Loop source must be a list, got: {}",
                type_name(&other)
            ))),
        }
    }
}

fn expect_mapping(value: Yaml) -> Mapping {
    match value {
        Yaml::Mapping(map) => map,
        // render_value preserves the value shape, a mapping stays a mapping
        _ => Mapping::new(),
    }
}

fn type_name(value: &Yaml) -> &'static str {
    match value {
        Yaml::Null => "null",
        Yaml::Bool(_) => "bool",
        Yaml::Number(_) => "number",
        Yaml::String(_) => "string",
        Yaml::Sequence(_) => "list",
        Yaml::Mapping(_) => "mapping",
        Yaml::Tagged(_) => "tagged value",
    }
}

/// Convert a YAML variable mapping into a template scope object.
/// Non-string keys are not addressable in templates and are dropped.
fn mapping_to_scope(map: &Mapping) -> Map<String, Json> {
    let mut scope = Map::new();
    for (key, value) in map {
        if let Some(name) = key.as_str() {
            scope.insert(name.to_string(), yaml_to_json(value.clone()));
        }
    }
    scope
}

pub(crate) fn yaml_to_json(value: Yaml) -> Json {
    match value {
        Yaml::Null => Json::Null,
        Yaml::Bool(b) => Json::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Json::from(i)
            } else if let Some(u) = n.as_u64() {
                Json::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Json::Number)
                    .unwrap_or(Json::Null)
            }
        }
        Yaml::String(s) => Json::String(s),
        Yaml::Sequence(seq) => Json::Array(seq.into_iter().map(yaml_to_json).collect()),
        Yaml::Mapping(map) => {
            let mut object = Map::new();
            for (key, val) in map {
                if let Some(name) = key.as_str() {
                    object.insert(name.to_string(), yaml_to_json(val));
                }
            }
            Json::Object(object)
        }
        Yaml::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}
