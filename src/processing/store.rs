use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::ui::warn;

pub const PERSISTED_SCHEMA_VERSION: u32 = 2;

/// On-disk record of one user's session. Times are epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSession {
    pub schema_version: u32,
    pub user_id: String,
    pub processing_active: bool,
    pub processing_start_time: Option<i64>,
    pub processing_end_time: Option<i64>,
    pub processing_accumulated: f64,
    pub processing_completed: bool,
    pub processing_cooldown_end_time: Option<i64>,
    pub processing_pending_credit: f64,
    pub processing_completion_saved: bool,
    pub processing_last_synced_at: Option<i64>,
    pub processing_synced_reward: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[cfg(test)]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// One file per user. The id is hex encoded so distinct ids never share a
    /// file and no id can escape `dir`.
    pub fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir
            .join(format!("session-{}.json", hex::encode(user_id.as_bytes())))
    }

    /// Reads the record for `user_id`. A missing, unreadable, unknown-version or
    /// foreign-owned file is treated as no session at all.
    pub fn load(&self, user_id: &str) -> Option<PersistedSession> {
        let path = self.path_for(user_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn(
                    "STORE",
                    format!("failed reading {} ({err})", path.display()),
                );
                return None;
            }
        };

        let record = match serde_json::from_str::<PersistedSession>(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn(
                    "STORE",
                    format!("invalid session record {} ({err})", path.display()),
                );
                return None;
            }
        };

        if record.schema_version != PERSISTED_SCHEMA_VERSION {
            warn(
                "STORE",
                format!(
                    "ignoring session record {} | schema={} expected={}",
                    path.display(),
                    record.schema_version,
                    PERSISTED_SCHEMA_VERSION
                ),
            );
            return None;
        }

        if record.user_id != user_id {
            warn(
                "STORE",
                format!(
                    "ignoring session record {} | owner={} requested={user_id}",
                    path.display(),
                    record.user_id
                ),
            );
            return None;
        }

        Some(record)
    }

    /// Writes the whole record through a temp file so a crash never leaves a
    /// half-written session behind.
    pub fn save(&self, user_id: &str, record: &PersistedSession) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let payload =
            serde_json::to_string_pretty(record).context("failed to encode session record")?;
        fs::write(&tmp, payload).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn clear(&self, user_id: &str) -> Result<()> {
        let path = self.path_for(user_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}
