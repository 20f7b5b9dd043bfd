use crate::sync::model::{ConversationKey, Platform};
use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

pub const ARCHIVE_FILE: &str = "messages.md";
pub const CURSOR_FILE: &str = "sync_state.json";
pub const LOCK_FILE: &str = ".sync.lock";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const MEMBERS_DIR: &str = "members";

#[derive(Debug, Clone)]
pub struct ArchivePaths {
    pub home: PathBuf,
    pub data_root: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<ArchivePaths> {
    let home = match env::var("COMMSYNC_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join(".commsync"),
    };
    let data_root = env_or_default_path("COMMSYNC_DATA_DIR", home.join("data"));
    let logs_dir = env_or_default_path("COMMSYNC_LOGS_DIR", home.join("logs"));

    Ok(ArchivePaths {
        home,
        data_root,
        logs_dir,
    })
}

impl ArchivePaths {
    /// Layout rooted at a single directory; used by tests and embedders.
    pub fn rooted(root: &Path) -> Self {
        Self {
            home: root.to_path_buf(),
            data_root: root.join("data"),
            logs_dir: root.join("logs"),
        }
    }

    pub fn platform_dir(&self, platform: Platform) -> PathBuf {
        self.data_root.join(platform.as_str())
    }

    pub fn conversation_dir(&self, platform: Platform, key: &ConversationKey) -> PathBuf {
        self.platform_dir(platform).join(key.as_str())
    }

    pub fn archive_file(&self, platform: Platform, key: &ConversationKey) -> PathBuf {
        self.conversation_dir(platform, key).join(ARCHIVE_FILE)
    }

    pub fn cursor_file(&self, platform: Platform, key: &ConversationKey) -> PathBuf {
        self.conversation_dir(platform, key).join(CURSOR_FILE)
    }

    pub fn lock_file(&self, platform: Platform, key: &ConversationKey) -> PathBuf {
        self.conversation_dir(platform, key).join(LOCK_FILE)
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.data_root.join(MANIFEST_FILE)
    }

    pub fn members_dir(&self, platform: Platform, server_id: &str) -> PathBuf {
        self.platform_dir(platform).join(MEMBERS_DIR).join(server_id)
    }

    pub fn profiles_dir(&self, platform: Platform) -> PathBuf {
        self.data_root.join("profiles").join(platform.as_str())
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir.join("audit.log")
    }
}
