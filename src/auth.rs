// src/auth.rs - File based, regex driven authorization
//!
//! The authorization file uses properties syntax. Each entry names a
//! permission and lists user name patterns:
//!
//! ```text
//! # Everybody may acknowledge
//! alarm_ack = .*
//! alarm_config = ops_.*, admin
//! FULL = root
//! ```
//!
//! Patterns must match the whole user name. `FULL` grants every permission.

use crate::error::{AlarmError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ALARM_ACK: &str = "alarm_ack";
pub const ALARM_CONFIG: &str = "alarm_config";
pub const FULL: &str = "FULL";

/// `$(NAME)` in the rules file path
static PROPERTY_REFERENCE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\$\(([^)]+)\)").ok());

/// Parsed permission rules
#[derive(Debug, Clone, Default)]
pub struct AuthorizationRules {
    rules: Vec<(String, Vec<Regex>)>,
}

impl AuthorizationRules {
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for (permission, value) in parse_properties(text) {
            let patterns = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| Regex::new(&format!("^(?:{})$", p)))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rules.push((permission, patterns));
        }
        Ok(Self { rules })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn authorizations_for(&self, user: &str) -> Authorizations {
        let permissions = self
            .rules
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|p| p.is_match(user)))
            .map(|(permission, _)| permission.clone())
            .collect();
        Authorizations { permissions }
    }

    pub fn permissions(&self) -> Vec<&str> {
        self.rules.iter().map(|(p, _)| p.as_str()).collect()
    }
}

/// Permissions held by one user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorizations {
    permissions: HashSet<String>,
}

impl Authorizations {
    /// No permission at all
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn has(&self, permission: &str) -> bool {
        self.permissions.contains(FULL) || self.permissions.contains(permission)
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

/// Authorization of a configured user, backed by a rules file
///
/// Construction never fails: a missing or malformed file is logged and
/// results in a user without permissions.
pub struct FileBasedAuthorization {
    path: Option<PathBuf>,
    user: String,
    rules: RwLock<AuthorizationRules>,
    authorizations: RwLock<Authorizations>,
}

impl FileBasedAuthorization {
    /// `path` may reference environment variables as `$(NAME)`
    pub fn new(path: &str, user: impl Into<String>) -> Self {
        Self::with_lookup(path, user, |name| std::env::var(name).ok())
    }

    pub fn with_lookup<F>(path: &str, user: impl Into<String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let user = user.into();
        let path = match resolve_path(path, lookup) {
            Ok(resolved) => Some(PathBuf::from(resolved)),
            Err(e) => {
                warn!("Authorization disabled for {}: {}", user, e);
                None
            }
        };
        let auth = Self {
            path,
            user,
            rules: RwLock::new(AuthorizationRules::default()),
            authorizations: RwLock::new(Authorizations::deny_all()),
        };
        auth.reload();
        auth
    }

    /// Read the rules file again
    pub fn reload(&self) {
        let Some(path) = &self.path else {
            return;
        };
        match AuthorizationRules::load(path) {
            Ok(rules) => {
                let authorizations = rules.authorizations_for(&self.user);
                info!(
                    "Loaded authorization from {}: {} holds {} permission(s)",
                    path.display(),
                    self.user,
                    authorizations.len()
                );
                *self.authorizations.write() = authorizations;
                *self.rules.write() = rules;
            }
            Err(e) => {
                warn!(
                    "Cannot read authorization file {}: {}, denying all",
                    path.display(),
                    e
                );
                *self.authorizations.write() = Authorizations::deny_all();
                *self.rules.write() = AuthorizationRules::default();
            }
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Does the configured user hold `permission`?
    pub fn has_authorization(&self, permission: &str) -> bool {
        self.authorizations.read().has(permission)
    }

    /// Does another user, e.g. the sender of a command, hold `permission`?
    pub fn has_authorization_for(&self, user: &str, permission: &str) -> bool {
        self.rules.read().authorizations_for(user).has(permission)
    }
}

/// Replace `$(NAME)` with the looked-up value
///
/// Fails if a referenced name is undefined.
pub fn resolve_path<F>(path: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(pattern) = PROPERTY_REFERENCE.as_ref() else {
        return Err(AlarmError::Config("Property reference pattern unavailable".to_string()));
    };
    let mut resolved = String::with_capacity(path.len());
    let mut last = 0;
    for caps in pattern.captures_iter(path) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup(name.as_str()).ok_or_else(|| {
            AlarmError::Config(format!("Undefined property '{}' in '{}'", name.as_str(), path))
        })?;
        resolved.push_str(&path[last..whole.start()]);
        resolved.push_str(&value);
        last = whole.end();
    }
    resolved.push_str(&path[last..]);
    Ok(resolved)
}

/// Name of the user running this process
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Key/value pairs of a properties file
fn parse_properties(text: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut logical = String::new();
    for line in text.lines() {
        let line = line.trim_start();
        if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!'))
        {
            continue;
        }
        let trailing = line.len() - line.trim_end_matches('\\').len();
        if trailing % 2 == 1 {
            logical.push_str(&line[..line.len() - 1]);
            continue;
        }
        logical.push_str(line);
        let entry = std::mem::take(&mut logical);
        if let Some(pos) = entry.find(['=', ':']) {
            let key = entry[..pos].trim();
            if !key.is_empty() {
                entries.push((key.to_string(), entry[pos + 1..].trim().to_string()));
            }
        }
    }
    entries
}
