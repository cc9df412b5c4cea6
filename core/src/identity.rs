/// Current-viewer identity
use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Source of the signed-in user's stable id. `None` is a valid, non-exceptional state.
pub trait Identity: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// In-process identity holder that can be signed in and out
#[derive(Debug, Default)]
pub struct SessionIdentity {
    user_id: RwLock<Option<String>>,
}

impl SessionIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        let mut guard = self.user_id.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(user_id.into());
    }

    pub fn sign_out(&self) {
        let mut guard = self.user_id.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

impl Identity for SessionIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFileV1 {
    version: u8,
    user_id: String,
}

fn session_path(data_dir: &Path) -> PathBuf {
    data_dir.join("session.json")
}

/// Load the last signed-in user from `<data_dir>/session.json`, if any.
pub fn load_session(data_dir: &Path) -> Result<Option<String>> {
    let path = session_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).map_err(MessagingError::Io)?;
    let parsed: SessionFileV1 = serde_json::from_str(&raw).map_err(MessagingError::Serialization)?;
    if parsed.version != 1 {
        return Err(MessagingError::Config(format!(
            "Unsupported session file version: {}",
            parsed.version
        )));
    }
    Ok(Some(parsed.user_id))
}

/// Remember `user_id` as the signed-in user for later runs.
pub fn save_session(data_dir: &Path, user_id: &str) -> Result<()> {
    fs::create_dir_all(data_dir).map_err(MessagingError::Io)?;
    let file = SessionFileV1 {
        version: 1,
        user_id: user_id.to_string(),
    };
    let json = serde_json::to_string_pretty(&file).map_err(MessagingError::Serialization)?;
    fs::write(session_path(data_dir), json).map_err(MessagingError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_in_and_out() {
        let identity = SessionIdentity::anonymous();
        assert_eq!(identity.current_user_id(), None);

        identity.sign_in("alice");
        assert_eq!(identity.current_user_id().as_deref(), Some("alice"));

        identity.sign_out();
        assert_eq!(identity.current_user_id(), None);
    }

    #[test]
    fn test_empty_id_counts_as_anonymous() {
        let identity = SessionIdentity::signed_in("");
        assert_eq!(identity.current_user_id(), None);
    }

    #[test]
    fn test_session_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_session(dir.path()).unwrap(), None);

        save_session(dir.path(), "bob").unwrap();
        assert_eq!(load_session(dir.path()).unwrap().as_deref(), Some("bob"));
    }
}
