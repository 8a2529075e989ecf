//! Computation addresses
//!
//! A key that can be recomputed carries a URL under the reserved `remake:`
//! scheme. The query holds the full identity of the computation:
//!
//! ```text
//! remake:///?root_version=<commit>&specification=<name>&this=<path>
//! ```
//!
//! Older registrations embed the recipe inline instead:
//!
//! ```text
//! remake:///?dependencies=<d>&method=<m>&output=<path>&<name>=<value>&...
//! ```
//!
//! Values are percent-encoded. Decoding is strict: a wrong field count, an
//! unexpected field name or a missing `=` is a protocol error, never a miss.
//! Fields naming files must be relative paths that stay below the tree they
//! are resolved against.

use crate::error::{RemakeError, RemakeResult};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

/// Reserved URL scheme
pub const URL_SCHEME: &str = "remake";

/// Prefix used when asking the store for candidate URLs
pub const URL_PREFIX: &str = "remake:";

/// Everything except unreserved characters and `/` is escaped
const VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

const SPECIFICATION_FIELDS: [&str; 3] = ["root_version", "specification", "this"];
const INLINE_FIELDS: [&str; 3] = ["dependencies", "method", "output"];

/// Whether a URL (or its annex `URL--` key form) belongs to this remote
pub fn is_claimed(url: &str) -> bool {
    url.starts_with(&format!("URL--{}", URL_PREFIX)) || url.starts_with(URL_PREFIX)
}

/// Address of one output of a registered specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationAddress {
    /// Commit of the dataset the recipe was registered against
    pub root_version: String,
    /// File name inside the specification directory
    pub specification: String,
    /// Worktree-relative path of the output this address names
    pub this: String,
}

impl ComputationAddress {
    pub fn new(
        root_version: impl Into<String>,
        specification: impl Into<String>,
        this: impl Into<String>,
    ) -> Self {
        Self {
            root_version: root_version.into(),
            specification: specification.into(),
            this: this.into(),
        }
    }

    /// Render as a `remake:` URL
    pub fn encode(&self) -> String {
        format!(
            "{}///?root_version={}&specification={}&this={}",
            URL_PREFIX,
            encode_value(&self.root_version),
            encode_value(&self.specification),
            encode_value(&self.this),
        )
    }
}

impl fmt::Display for ComputationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Address with the recipe embedded in the URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAddress {
    pub dependencies: String,
    /// Method template name
    pub method: String,
    /// Output file produced by the method
    pub output: String,
    pub parameters: BTreeMap<String, String>,
}

impl InlineAddress {
    /// Render as a `remake:` URL
    pub fn encode(&self) -> String {
        let mut url = format!(
            "{}///?dependencies={}&method={}&output={}",
            URL_PREFIX,
            encode_value(&self.dependencies),
            encode_value(&self.method),
            encode_value(&self.output),
        );
        for (name, value) in &self.parameters {
            url.push('&');
            url.push_str(&encode_value(name));
            url.push('=');
            url.push_str(&encode_value(value));
        }
        url
    }
}

/// A decoded `remake:` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Specification(ComputationAddress),
    Inline(InlineAddress),
}

impl Address {
    /// Decode a `remake:` URL
    pub fn parse(url: &str) -> RemakeResult<Self> {
        let query = query_of(url)?;
        if query.starts_with("dependencies=") {
            parse_inline(query).map(Self::Inline)
        } else {
            parse_specification(query).map(Self::Specification)
        }
    }
}

/// Percent-encode a single value
pub fn encode_value(value: &str) -> String {
    utf8_percent_encode(value, VALUE_ENCODE_SET).to_string()
}

fn decode_value(value: &str) -> RemakeResult<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|v| v.into_owned())
        .map_err(|e| RemakeError::protocol(format!("invalid percent-encoding in {:?}: {}", value, e)))
}

fn query_of(url: &str) -> RemakeResult<&str> {
    if !url.starts_with(URL_PREFIX) {
        return Err(RemakeError::protocol(format!(
            "not a {} address: {:?}",
            URL_SCHEME, url
        )));
    }
    url.split_once('?')
        .map(|(_, query)| query)
        .ok_or_else(|| RemakeError::protocol(format!("address has no query: {:?}", url)))
}

/// Split `name=value`, checking the name and decoding the value
fn assigned_value(assignment: &str, expected: &str) -> RemakeResult<String> {
    let (name, value) = assignment.split_once('=').ok_or_else(|| {
        RemakeError::protocol(format!("missing '=' in assignment {:?}", assignment))
    })?;
    if name != expected {
        return Err(RemakeError::protocol(format!(
            "expected field {:?}, found {:?}",
            expected, name
        )));
    }
    decode_value(value)
}

/// Normalize a tree-relative path, rejecting absolute paths and `..`
fn contained_path(field: &str, value: String) -> RemakeResult<String> {
    let mut parts = Vec::new();
    for component in Path::new(&value).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy()),
            Component::CurDir => {}
            _ => {
                return Err(RemakeError::protocol(format!(
                    "{} must stay inside the dataset, got {:?}",
                    field, value
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(RemakeError::protocol(format!("{} names no file: {:?}", field, value)));
    }
    Ok(parts.join("/"))
}

fn parse_specification(query: &str) -> RemakeResult<ComputationAddress> {
    let parts: Vec<&str> = query.splitn(SPECIFICATION_FIELDS.len() + 1, '&').collect();
    if parts.len() != SPECIFICATION_FIELDS.len() {
        return Err(RemakeError::protocol(format!(
            "expected {} fields, got {}",
            SPECIFICATION_FIELDS.len(),
            if parts.len() > SPECIFICATION_FIELDS.len() {
                format!("more than {}", SPECIFICATION_FIELDS.len())
            } else {
                parts.len().to_string()
            }
        )));
    }

    Ok(ComputationAddress {
        root_version: assigned_value(parts[0], SPECIFICATION_FIELDS[0])?,
        specification: contained_path(
            SPECIFICATION_FIELDS[1],
            assigned_value(parts[1], SPECIFICATION_FIELDS[1])?,
        )?,
        this: contained_path(
            SPECIFICATION_FIELDS[2],
            assigned_value(parts[2], SPECIFICATION_FIELDS[2])?,
        )?,
    })
}

fn parse_inline(query: &str) -> RemakeResult<InlineAddress> {
    let parts: Vec<&str> = query.splitn(INLINE_FIELDS.len() + 1, '&').collect();
    if parts.len() < INLINE_FIELDS.len() {
        return Err(RemakeError::protocol(format!(
            "expected at least {} fields, got {}",
            INLINE_FIELDS.len(),
            parts.len()
        )));
    }

    let mut parameters = BTreeMap::new();
    if let Some(rest) = parts.get(INLINE_FIELDS.len()) {
        for assignment in rest.split('&').filter(|a| !a.is_empty()) {
            let (name, value) = assignment.split_once('=').ok_or_else(|| {
                RemakeError::protocol(format!("missing '=' in parameter {:?}", assignment))
            })?;
            parameters.insert(decode_value(name)?, decode_value(value)?);
        }
    }

    Ok(InlineAddress {
        dependencies: assigned_value(parts[0], INLINE_FIELDS[0])?,
        method: contained_path(INLINE_FIELDS[1], assigned_value(parts[1], INLINE_FIELDS[1])?)?,
        output: contained_path(INLINE_FIELDS[2], assigned_value(parts[2], INLINE_FIELDS[2])?)?,
        parameters,
    })
}
