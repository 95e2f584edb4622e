//! Session records
//!
//! One JSON file per session in the sessions directory. The record is
//! written before a start or stop returns success, and atomically (tmp +
//! rename) so a crash never leaves a torn file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Codec;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A time-bounded, named recording of one or more cameras
///
/// `files` maps camera id to the recording segments written for it, in
/// order; a stall restart opens a second segment adjacent to the first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub cameras: Vec<String>,
    pub files: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub annotations: Vec<String>,
}

impl Session {
    pub fn new(cameras: Vec<String>) -> Self {
        Self {
            session_id: generate_session_id(),
            created_at: Utc::now(),
            status: SessionStatus::Active,
            cameras,
            files: BTreeMap::new(),
            annotations: Vec::new(),
        }
    }

    pub fn add_file(&mut self, camera_id: &str, path: &Path) {
        self.files
            .entry(camera_id.to_string())
            .or_default()
            .push(path.display().to_string());
    }

    pub fn annotate(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !self.annotations.contains(&note) {
            self.annotations.push(note);
        }
    }

    fn file_path(dir: &Path, session_id: &str) -> PathBuf {
        dir.join(format!("{}.json", session_id))
    }

    /// Write the record atomically into the sessions directory
    pub fn persist(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let target = Self::file_path(dir, &self.session_id);
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn load(dir: &Path, session_id: &str) -> Result<Self> {
        let path = Self::file_path(dir, session_id);
        if !path.exists() {
            return Err(AppError::NotFound(format!("session {}", session_id)));
        }
        let raw = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// All persisted sessions, newest first
    pub fn load_all(dir: &Path) -> Result<Vec<Self>> {
        let mut sessions = Vec::new();
        if !dir.exists() {
            return Ok(sessions);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map_err(AppError::from).and_then(|raw| {
                serde_json::from_slice::<Session>(&raw).map_err(AppError::from)
            }) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(file = %path.display(), "Skipping unreadable session record: {}", e)
                }
            }
        }
        sessions.sort_by(|a, b| b.session_id.cmp(&a.session_id));
        Ok(sessions)
    }
}

/// Sortable session id: local timestamp plus a short random suffix
pub fn generate_session_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), suffix)
}

/// Recording file name for a camera segment started now
pub fn recording_file_name(codec: Codec) -> String {
    format!(
        "recording_{}.{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        codec.recording_extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        let id = generate_session_id();
        // ^\d{8}_\d{6}_[a-z0-9]{6}$
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[1].len(), 6);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn test_persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(vec!["cam0".into()]);
        session.add_file("cam0", Path::new("/data/recordings/cam0/recording_x.mp4"));
        session.annotate("disk_low");
        session.status = SessionStatus::Completed;
        session.persist(dir.path()).unwrap();

        let loaded = Session::load(dir.path(), &session.session_id).unwrap();
        assert_eq!(loaded.session_id, session.session_id);
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(
            loaded.files["cam0"],
            vec!["/data/recordings/cam0/recording_x.mp4".to_string()]
        );
        assert_eq!(loaded.annotations, vec!["disk_low".to_string()]);
    }

    #[test]
    fn test_load_all_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Session::new(vec![]);
        a.session_id = "20250101_100000_aaaaaa".into();
        let mut b = Session::new(vec![]);
        b.session_id = "20250102_100000_bbbbbb".into();
        a.persist(dir.path()).unwrap();
        b.persist(dir.path()).unwrap();

        let all = Session::load_all(dir.path()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, "20250102_100000_bbbbbb");
    }

    #[test]
    fn test_missing_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Session::load(dir.path(), "20250101_000000_zzzzzz"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_annotate_deduplicates() {
        let mut s = Session::new(vec![]);
        s.annotate("disk_low");
        s.annotate("disk_low");
        assert_eq!(s.annotations.len(), 1);
    }
}
