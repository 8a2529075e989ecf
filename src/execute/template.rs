//! Method templates
//!
//! ```toml
//! parameters = ["first", "second"]
//! use_shell = false
//! command = ["python3", "-c", "open('a.txt','w').write('{first}')"]
//! ```

use crate::error::{RemakeError, RemakeResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A parameterized external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodTemplate {
    /// Declared parameter names
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Command line with `{name}` placeholders
    pub command: Vec<String>,

    /// Run the joined command line through the configured shell
    #[serde(default, deserialize_with = "flag")]
    pub use_shell: bool,
}

/// A TOML boolean, or the strings `"true"` / `"false"` older templates use
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(D::Error::custom(format!(
                "use_shell must be true or false, got {:?}",
                text
            ))),
        },
    }
}

impl MethodTemplate {
    /// Parse a template document, naming `path` in errors
    pub fn parse(path: &str, bytes: &[u8]) -> RemakeResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| RemakeError::specification(path, "method template is not UTF-8"))?;
        let template: Self =
            toml::from_str(text).map_err(|e| RemakeError::specification(path, e.to_string()))?;
        if template.command.is_empty() {
            return Err(RemakeError::specification(path, "empty command"));
        }
        Ok(template)
    }

    /// Supplied parameters must be exactly the declared ones
    pub fn check_parameters(
        &self,
        path: &str,
        supplied: &BTreeMap<String, String>,
    ) -> RemakeResult<()> {
        let declared: BTreeSet<&str> = self.parameters.iter().map(String::as_str).collect();
        let given: BTreeSet<&str> = supplied.keys().map(String::as_str).collect();

        let missing: Vec<&str> = declared.difference(&given).copied().collect();
        if !missing.is_empty() {
            return Err(RemakeError::specification(
                path,
                format!("missing parameters: {}", missing.join(", ")),
            ));
        }
        let unknown: Vec<&str> = given.difference(&declared).copied().collect();
        if !unknown.is_empty() {
            return Err(RemakeError::specification(
                path,
                format!("undeclared parameters: {}", unknown.join(", ")),
            ));
        }
        Ok(())
    }

    /// Command line with every placeholder replaced
    pub fn render(
        &self,
        path: &str,
        parameters: &BTreeMap<String, String>,
    ) -> RemakeResult<Vec<String>> {
        self.command
            .iter()
            .map(|arg| substitute(arg, parameters).map_err(|e| RemakeError::specification(path, e)))
            .collect()
    }
}

/// Replace `{name}` placeholders; `{{` and `}}` stand for literal braces
pub(crate) fn substitute(
    template: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(format!("unterminated placeholder in {:?}", template)),
                    }
                }
                let value = parameters
                    .get(name.trim())
                    .ok_or_else(|| format!("unknown placeholder {{{}}}", name))?;
                out.push_str(value);
            }
            '}' => return Err(format!("unmatched '}}' in {:?}", template)),
            other => out.push(other),
        }
    }
    Ok(out)
}
