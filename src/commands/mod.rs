pub mod doctor;
pub mod engagement;
pub mod manifest;
pub mod members;
pub mod profile;
pub mod read;
pub mod reset;
pub mod send;
pub mod sync;

use crate::error::SyncError;
use crate::platform::PlatformClient;
use crate::platform::discord::{DiscordClient, DiscordConfig};
use crate::sync::config::load_config;
use crate::sync::engine::{CancelFlag, SyncEngine};
use crate::sync::model::Platform;
use crate::sync::paths::resolve_paths;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    /// Machine-readable payload for `--json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Verbatim output printed after the details in text mode.
    #[serde(skip)]
    pub text: Option<String>,
    #[serde(skip)]
    pub exit_code: i32,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            data: None,
            text: None,
            exit_code: 0,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        if self.exit_code == 0 {
            self.exit_code = 1;
        }
        self.issues.push(text.into());
    }

    pub fn merge(&mut self, mut other: CommandReport) {
        self.ok &= other.ok;
        if self.exit_code == 0 {
            self.exit_code = other.exit_code;
        }
        self.details.append(&mut other.details);
        self.issues.append(&mut other.issues);
    }

    pub fn with_data<T: Serialize>(&mut self, data: &T) -> Result<()> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(())
    }
}

/// The bundled client for `platform`. Telegram needs an MTProto session
/// which this binary does not ship.
pub fn client_for(platform: Platform) -> Result<Arc<dyn PlatformClient>> {
    match platform {
        Platform::Discord => {
            let client = DiscordClient::new(DiscordConfig::from_env()?)?;
            Ok(Arc::new(client))
        }
        Platform::Telegram => Err(SyncError::Unsupported(
            "no Telegram client is bundled; embed commsync with your own PlatformClient".into(),
        )
        .into()),
    }
}

pub fn open_engine(platform: Platform, cancel: CancelFlag) -> Result<SyncEngine> {
    let client = client_for(platform)?;
    let paths = resolve_paths()?;
    let config = load_config()?;
    Ok(SyncEngine::new(client, paths, config).with_cancel(cancel))
}
