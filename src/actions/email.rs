// src/actions/email.rs - mailto: actions
use super::executor::ActionHandler;
use crate::error::Result;
use crate::tree::{ItemSnapshot, TitleDetailDelay};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info};

pub const MAILTO_PREFIX: &str = "mailto:";

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub from: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    25
}

/// Sends `mailto:a@x,b@y` actions to every listed address
pub struct EmailHandler {
    sender: Arc<dyn EmailSender>,
}

impl EmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl ActionHandler for EmailHandler {
    fn name(&self) -> &str {
        "email"
    }

    fn matches(&self, action: &TitleDetailDelay) -> bool {
        action.detail.starts_with(MAILTO_PREFIX)
    }

    async fn handle(&self, item: &ItemSnapshot, action: &TitleDetailDelay) -> Result<()> {
        let subject = format_subject(item);
        let body = format_body(item);
        for to in recipients(&action.detail) {
            match self.sender.send_email(to, &subject, &body).await {
                Ok(()) => info!("Sent '{}' to {}", subject, to),
                Err(e) => error!("Failed to email {} about {}: {}", to, item.path, e),
            }
        }
        Ok(())
    }
}

fn recipients(detail: &str) -> impl Iterator<Item = &str> + '_ {
    detail
        .strip_prefix(MAILTO_PREFIX)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|to| !to.is_empty())
}

pub fn format_subject(item: &ItemSnapshot) -> String {
    let what = if item.description.is_empty() {
        &item.path
    } else {
        &item.description
    };
    format!("{} alarm: {}", item.severity, what)
}

/// Plain text body with the state of the item and of every alarming PV
pub fn format_body(item: &ItemSnapshot) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "Path: {}", item.path);
    if let Some(state) = &item.state {
        let _ = writeln!(body, "PV: {}", item.name);
        let _ = writeln!(body, "Description: {}", item.description);
        let _ = writeln!(body, "Alarm Time: {}", state.time.to_rfc3339());
        let _ = writeln!(body, "Severity: {}", state.severity);
        let _ = writeln!(body, "Status: {}", state.message);
        let _ = writeln!(body, "Value: {}", state.value);
        let _ = writeln!(body, "Current Severity: {}", state.current_severity);
        let _ = writeln!(body, "Current Status: {}", state.current_message);
        return body;
    }
    let _ = writeln!(body, "Severity: {}", item.severity);
    let _ = writeln!(body, "\nActive alarms:");
    for pv in &item.alarming_pvs {
        let _ = writeln!(
            body,
            "\n{}\n  Description: {}\n  Alarm Time: {}\n  Severity: {}\n  Status: {}\n  Value: {}",
            pv.path,
            pv.description,
            pv.state.time.to_rfc3339(),
            pv.state.severity,
            pv.state.message,
            pv.state.value
        );
    }
    body
}

/// [`EmailSender`] on top of an SMTP relay
#[cfg(feature = "email")]
pub struct SmtpEmailSender {
    config: SmtpConfig,
}

#[cfg(feature = "email")]
impl SmtpEmailSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn send_blocking(config: &SmtpConfig, to: &str, subject: &str, body: &str) -> Result<()> {
        use crate::error::AlarmError;
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{Message, SmtpTransport, Transport};

        let email = Message::builder()
            .from(config.from.parse().map_err(|e| {
                AlarmError::Config(format!("Invalid from email: {}", e))
            })?)
            .to(to
                .parse()
                .map_err(|e| AlarmError::Action(format!("Invalid to email '{}': {}", to, e)))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| AlarmError::Action(format!("Failed to build email: {}", e)))?;

        let mailer = match (&config.username, &config.password) {
            (Some(username), Some(password)) => SmtpTransport::relay(&config.host)
                .map_err(|e| AlarmError::Config(format!("Invalid SMTP host: {}", e)))?
                .port(config.port)
                .credentials(Credentials::new(username.clone(), password.clone()))
                .build(),
            _ => SmtpTransport::builder_dangerous(&config.host)
                .port(config.port)
                .build(),
        };

        mailer
            .send(&email)
            .map_err(|e| AlarmError::Action(format!("Failed to send email: {}", e)))?;
        Ok(())
    }
}

#[cfg(feature = "email")]
#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let config = self.config.clone();
        let (to, subject, body) = (to.to_string(), subject.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &to, &subject, &body))
            .await
            .map_err(|e| crate::error::AlarmError::Action(format!("Email task failed: {}", e)))?
    }
}
