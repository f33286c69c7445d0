//! LCD display commands, relayed to the device through the gateway API.

use crate::config::DisplayConfig;
use crate::error::CommandError;
use log::{info, warn};
use serde::Serialize;

pub const DEFAULT_COLOR: &str = "WHITE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayCommand {
    pub text: String,
    pub color: String,
    pub alarm: bool,
}

impl DisplayCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: DEFAULT_COLOR.to_string(),
            alarm: false,
        }
    }

    /// Colour names are case-insensitive; blank keeps the default.
    pub fn color(mut self, color: &str) -> Self {
        let color = color.trim();
        if !color.is_empty() {
            self.color = color.to_uppercase();
        }
        self
    }

    pub fn alarm(mut self, alarm: bool) -> Self {
        self.alarm = alarm;
        self
    }
}

/// Fire-and-forget command submission: one POST, no retry, no queue.
pub struct DisplayCommandDispatcher {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl DisplayCommandDispatcher {
    pub fn new(config: &DisplayConfig) -> Result<Self, CommandError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            url: config.command_url(),
            token: config.token.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send(&self, text: &str, color: Option<&str>, alarm: bool) -> Result<(), CommandError> {
        let command = DisplayCommand::new(text)
            .color(color.unwrap_or(DEFAULT_COLOR))
            .alarm(alarm);
        self.send_command(&command).await
    }

    pub async fn send_command(&self, command: &DisplayCommand) -> Result<(), CommandError> {
        let mut request = self.client.post(&self.url).json(command);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Display command rejected: {}", status);
            return Err(CommandError::Rejected {
                status: status.as_u16(),
            });
        }

        info!("Display command sent: {:?} ({}, alarm={})", command.text, command.color, command.alarm);
        Ok(())
    }
}
