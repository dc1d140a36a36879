// src/actions/command.rs - cmd: actions
use super::executor::ActionHandler;
use crate::error::{AlarmError, Result};
use crate::macros::Macros;
use crate::tree::{ItemSnapshot, TitleDetailDelay};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

pub const CMD_PREFIX: &str = "cmd:";

/// Runs `cmd:program args` in the configured command directory
///
/// Macros are expanded first. A lone `*` argument is replaced by
/// `<pv name> <severity>` for every alarming PV of the item.
pub struct CommandHandler {
    directory: PathBuf,
    timeout: Duration,
    macros: Macros,
}

impl CommandHandler {
    pub fn new(directory: impl Into<PathBuf>, timeout: Duration, macros: Macros) -> Self {
        Self {
            directory: directory.into(),
            timeout,
            macros,
        }
    }

    /// Program and arguments for an action of `item`
    pub fn command_line(&self, item: &ItemSnapshot, action: &TitleDetailDelay) -> Vec<String> {
        let command = action.detail.strip_prefix(CMD_PREFIX).unwrap_or_default();
        let expanded = self.macros.expand(command.trim());
        let mut args = Vec::new();
        for arg in expanded.split_whitespace() {
            if arg == "*" {
                for pv in &item.alarming_pvs {
                    args.push(pv.name.clone());
                    args.push(pv.state.severity.to_string());
                }
            } else {
                args.push(arg.to_string());
            }
        }
        args
    }
}

#[async_trait]
impl ActionHandler for CommandHandler {
    fn name(&self) -> &str {
        "command"
    }

    fn matches(&self, action: &TitleDetailDelay) -> bool {
        action.detail.starts_with(CMD_PREFIX)
    }

    async fn handle(&self, item: &ItemSnapshot, action: &TitleDetailDelay) -> Result<()> {
        let args = self.command_line(item, action);
        let Some((program, rest)) = args.split_first() else {
            return Err(AlarmError::Action(format!("Empty command for {}", item.path)));
        };
        if !self.directory.is_dir() {
            return Err(AlarmError::Action(format!(
                "Command directory {} does not exist",
                self.directory.display()
            )));
        }

        info!("Running '{}' for {}", args.join(" "), item.path);
        let output = Command::new(program)
            .args(rest)
            .current_dir(&self.directory)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| {
                AlarmError::Action(format!("'{}' timed out after {:?}", program, self.timeout))
            })??;

        if !output.status.success() {
            warn!(
                "'{}' for {} exited with {}: {}",
                args.join(" "),
                item.path,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
