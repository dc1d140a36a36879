// src/macros.rs - Macro definitions and $(NAME) expansion for action commands
use crate::error::{AlarmError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

/// `$(NAME)` or `${NAME}`
static REFERENCE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\$\((\w+)\)|\$\{(\w+)\}").ok());

/// Named values substituted into `cmd:` actions
///
/// Parsed from `NAME=value, OTHER="quoted, with comma"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macros {
    values: HashMap<String, String>,
}

impl Macros {
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = HashMap::new();
        for definition in split_definitions(text)? {
            let definition = definition.trim();
            if definition.is_empty() {
                continue;
            }
            let (name, value) = definition.split_once('=').ok_or_else(|| {
                AlarmError::Config(format!("Macro '{}' lacks '='", definition))
            })?;
            let name = name.trim();
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(AlarmError::Config(format!("Invalid macro name '{}'", name)));
            }
            values.insert(name.to_string(), unquote(value.trim()));
        }
        Ok(Self { values })
    }

    /// Parse, falling back to no macros on malformed input
    pub fn parse_or_default(text: &str) -> Self {
        Self::parse(text).unwrap_or_else(|e| {
            warn!("Ignoring macros '{}': {}", text, e);
            Self::default()
        })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace `$(NAME)` and `${NAME}`, unknown references stay as they are
    pub fn expand(&self, text: &str) -> String {
        if self.values.is_empty() || !text.contains('$') {
            return text.to_string();
        }
        let Some(pattern) = REFERENCE.as_ref() else {
            return text.to_string();
        };
        pattern
            .replace_all(text, |caps: &regex::Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.values.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

/// Split at commas outside double quotes
fn split_definitions(text: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(AlarmError::Config(format!("Unterminated quote in '{}'", text)));
    }
    parts.push(current);
    Ok(parts)
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}
