//! Config document loading: YAML parsing, defaults merging, template
//! expansion and descriptor validation.
//!
//! One document per input path, holding an optional `vars` scope, an
//! optional `defaults` mapping merged into every mail node lacking the
//! key, and the ordered `mails` list. Loading is all-or-nothing per
//! file: a single bad node fails the file, sibling files continue at the
//! orchestration layer.

pub mod descriptor;
pub mod template;
pub mod validate;

use std::path::Path;

use serde_yaml::{Mapping, Value as Yaml};
use tracing::info;

use crate::core::error::{AppError, Result};
pub use descriptor::{DkimParams, MailDescriptor, SmimeParams, StringOrList};
pub use template::TemplateExpander;

const TOP_LEVEL_FIELDS: &[&str] = &["vars", "defaults", "mails"];

/// One parsed, expanded and validated config document.
pub struct Document {
    /// Expanded descriptors in document order.
    pub mails: Vec<MailDescriptor>,
    expander: TemplateExpander,
}

impl Document {
    /// Load a document from a config file.
    pub fn load_path(path: &Path) -> Result<Document> {
        info!(path = %path.display(), "Parsing config file.");
        let text = std::fs::read_to_string(path)?;
        Self::load_str(&text)
    }

    /// Load a document from YAML text.
    pub fn load_str(text: &str) -> Result<Document> {
        let root: Yaml = serde_yaml::from_str(text)?;
        let root = match root {
            Yaml::Null => Mapping::new(),
            Yaml::Mapping(map) => map,
            _ => {
                return Err(AppError::Config(
                    "Config document must be a mapping".to_string(),
                ))
            }
        };

        for key in root.keys() {
            let known = key
                .as_str()
                .map(|name| TOP_LEVEL_FIELDS.contains(&name))
                .unwrap_or(false);
            if !known {
                return Err(AppError::Config(format!(
                    "Unknown top-level field: {:?}",
                    key.as_str().unwrap_or("<non-string>")
                )));
            }
        }

        let vars = match root.get("vars") {
            None | Some(Yaml::Null) => None,
            Some(Yaml::Mapping(map)) => Some(map),
            Some(_) => return Err(AppError::Config("'vars' must be a mapping".to_string())),
        };
        let defaults = match root.get("defaults") {
            None | Some(Yaml::Null) => None,
            Some(Yaml::Mapping(map)) => Some(map),
            Some(_) => {
                return Err(AppError::Config("'defaults' must be a mapping".to_string()))
            }
        };
        let nodes = match root.get("mails") {
            None | Some(Yaml::Null) => &[] as &[Yaml],
            Some(Yaml::Sequence(seq)) => seq.as_slice(),
            Some(_) => return Err(AppError::Config("'mails' must be a list".to_string())),
        };

        let expander = TemplateExpander::new(vars);

        let mut mails = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            let node = node.as_mapping().cloned().ok_or_else(|| {
                AppError::Config(format!("Mail #{} is not a mapping", index + 1))
            })?;
            let node = merge_defaults(node, defaults);

            for expanded in expander.expand(node)? {
                let mail: MailDescriptor = serde_yaml::from_value(Yaml::Mapping(expanded))
                    .map_err(|err| {
                        AppError::Validation(format!("Mail #{}: {}", index + 1, err))
                    })?;

                validate::check(&mail).map_err(|err| match err {
                    AppError::Validation(msg) => AppError::Validation(format!(
                        "{} [mail={}]",
                        msg,
                        mail.display_name()
                    )),
                    other => other,
                })?;

                mails.push(mail);
            }
        }

        Ok(Document { mails, expander })
    }

    /// The template expander carrying this document's variable scope,
    /// used for the nested pass over raw-message (`eml`) templates.
    pub fn expander(&self) -> &TemplateExpander {
        &self.expander
    }
}

/// Explicit single merge pass: default fields land on every mail node
/// that does not already carry the key.
fn merge_defaults(mut node: Mapping, defaults: Option<&Mapping>) -> Mapping {
    if let Some(defaults) = defaults {
        for (key, value) in defaults {
            if !node.contains_key(key) {
                node.insert(key.clone(), value.clone());
            }
        }
    }
    node
}
