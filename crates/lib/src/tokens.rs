//! Device token store: per-agent credentials issued by gateways after pairing.
//!
//! Once a gateway hands back a device token in its connect ack, that token
//! supersedes the configured shared secret for every later connect to that
//! agent, until a stale-token rejection removes it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile(HashMap<String, String>);

/// In-memory agent-id -> device-token map, persisted to a JSON file.
pub struct DeviceTokenStore {
    path: PathBuf,
    tokens: RwLock<HashMap<String, String>>,
}

impl DeviceTokenStore {
    /// Load the store from path; missing or invalid file starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let tokens = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str::<TokenFile>(&s)
                .map(|f| f.0)
                .unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        if !tokens.is_empty() {
            log::info!("loaded {} stored device token(s)", tokens.len());
        }
        Self {
            path,
            tokens: RwLock::new(tokens),
        }
    }

    async fn save(&self) -> std::io::Result<()> {
        let tokens = self.tokens.read().await;
        let json = serde_json::to_string_pretty(&TokenFile(tokens.clone()))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        drop(tokens);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        restrict_to_owner(&self.path).await
    }

    /// Stored device token for an agent, if any.
    pub async fn get(&self, agent_id: &str) -> Option<String> {
        self.tokens.read().await.get(agent_id).cloned()
    }

    /// Store a freshly issued device token and persist to disk.
    pub async fn put(&self, agent_id: &str, token: &str) {
        self.tokens
            .write()
            .await
            .insert(agent_id.to_string(), token.to_string());
        if let Err(e) = self.save().await {
            log::warn!("could not save device tokens: {}", e);
        }
        log::info!("stored device token for \"{}\"", agent_id);
    }

    /// Remove a stale token. Returns true when a token was present.
    pub async fn remove(&self, agent_id: &str) -> bool {
        let removed = self.tokens.write().await.remove(agent_id).is_some();
        if removed {
            if let Err(e) = self.save().await {
                log::warn!("could not save device tokens: {}", e);
            }
        }
        removed
    }
}

#[cfg(unix)]
async fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("roust-tokens-{}", uuid::Uuid::new_v4()))
            .join("device-tokens.json")
    }

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let path = temp_path();
        let store = DeviceTokenStore::load(&path).await;
        assert_eq!(store.get("dev").await, None);

        store.put("dev", "tok-1").await;
        assert_eq!(store.get("dev").await, Some("tok-1".to_string()));

        // A second store instance sees the persisted token.
        let reloaded = DeviceTokenStore::load(&path).await;
        assert_eq!(reloaded.get("dev").await, Some("tok-1".to_string()));

        assert!(store.remove("dev").await);
        assert!(!store.remove("dev").await);
        assert_eq!(store.get("dev").await, None);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
