/// Per-session profile cache: user id → profile, filled lazily from the backend.
///
/// No eviction. A cache lives as long as the session that owns it, and the
/// population is bounded by the participants of that session's conversations.
use crate::backend::Backend;
use crate::error::{MessagingError, Result};
use crate::models::Profile;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ProfileCache {
    backend: Arc<dyn Backend>,
    entries: Arc<RwLock<HashMap<String, Profile>>>,
}

impl ProfileCache {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Cache-only lookup
    pub fn get(&self, id: &str) -> Option<Profile> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_all(&self, profiles: Vec<Profile>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for p in profiles {
            entries.insert(p.id.clone(), p);
        }
    }

    /// Return the cached profile, fetching it on a miss. `None` if the lookup fails
    /// or the user has no profile.
    pub async fn ensure(&self, id: &str) -> Option<Profile> {
        if let Some(p) = self.get(id) {
            return Some(p);
        }
        match self.backend.fetch_profiles(&[id.to_string()]).await {
            Ok(found) => {
                self.insert_all(found);
                self.get(id)
            }
            Err(e) => {
                warn!("Profile lookup for {} failed: {}", id, e);
                None
            }
        }
    }

    /// `ensure`, degrading to a placeholder so callers never block on a missing profile
    pub async fn profile_or_placeholder(&self, id: &str) -> Profile {
        match self.ensure(id).await {
            Some(p) => p,
            None => Profile::unknown(id),
        }
    }

    /// Fetch every uncached id in one backend call
    pub async fn ensure_many<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let missing: Vec<String> = ids
            .into_iter()
            .filter_map(|id| {
                let id = id.as_ref();
                if id.is_empty() || self.contains(id) || !seen.insert(id.to_string()) {
                    None
                } else {
                    Some(id.to_string())
                }
            })
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        debug!("Fetching {} uncached profiles", missing.len());
        let found = self
            .backend
            .fetch_profiles(&missing)
            .await
            .map_err(MessagingError::backend)?;
        self.insert_all(found);
        Ok(())
    }
}
