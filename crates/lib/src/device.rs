//! Device identity for agent gateway handshakes: keypair load/generate,
//! canonical auth payload, and signing.
//!
//! The device id is the hex SHA-256 of the raw Ed25519 public key. The signed
//! payload is pipe-joined and tagged `v1` (no nonce) or `v2` (server challenge
//! nonce appended); signatures and the wire public key are URL-safe unpadded
//! base64.

use anyhow::Result;
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

const IDENTITY_VERSION: u32 = 1;

/// Persisted device identity. Stored at e.g. ~/.roust/identity/device.json, owner-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub version: u32,
    /// Hex SHA-256 of the raw public key bytes.
    pub device_id: String,
    /// Raw Ed25519 public key, standard base64.
    pub public_key: String,
    /// Raw Ed25519 private key, standard base64.
    pub private_key: String,
    pub created_at_ms: i64,
}

/// Build the canonical payload string the gateway verifies the device signature
/// against. Order: version tag, deviceId, client id, client mode, role, scopes
/// (comma-joined), signedAt ms, bearer token ("" when none), then the challenge
/// nonce when present (which switches the tag from v1 to v2).
pub fn build_auth_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at_ms: u64,
    token: &str,
    nonce: Option<&str>,
) -> String {
    let version = if nonce.is_some() { "v2" } else { "v1" };
    let mut parts = vec![
        version.to_string(),
        device_id.to_string(),
        client_id.to_string(),
        client_mode.to_string(),
        role.to_string(),
        scopes.join(","),
        signed_at_ms.to_string(),
        token.to_string(),
    ];
    if let Some(n) = nonce {
        parts.push(n.to_string());
    }
    parts.join("|")
}

impl DeviceIdentity {
    /// Generate a new keypair and derive the device id from the public key.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {}", e))?;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&bytes);
        let verifying_key = signing_key.verifying_key();
        let device_id = fingerprint(verifying_key.as_bytes());
        Ok(Self {
            version: IDENTITY_VERSION,
            device_id,
            public_key: base64::engine::general_purpose::STANDARD.encode(verifying_key.as_bytes()),
            private_key: base64::engine::general_purpose::STANDARD.encode(signing_key.as_bytes()),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Load from JSON file. Returns None if the file is missing, malformed,
    /// or from an unknown identity version.
    pub fn load(path: &Path) -> Option<Self> {
        let s = std::fs::read_to_string(path).ok()?;
        let id: Self = serde_json::from_str(&s).ok()?;
        if id.version != IDENTITY_VERSION
            || id.device_id.is_empty()
            || id.public_key.is_empty()
            || id.private_key.is_empty()
        {
            return None;
        }
        Some(id)
    }

    /// Save to JSON file with owner-only permissions. Creates parent dirs if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let s = serde_json::to_string_pretty(self)?;
        std::fs::write(path, s)?;
        restrict_to_owner(path)?;
        Ok(())
    }

    /// Load a persisted identity or generate and persist a fresh one.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if let Some(id) = Self::load(path) {
            log::info!("device identity loaded: {}...", &id.device_id[..12.min(id.device_id.len())]);
            return Ok(id);
        }
        let id = Self::generate()?;
        if let Err(e) = id.save(path) {
            log::warn!("could not persist device identity: {}", e);
        }
        log::info!("device identity created: {}...", &id.device_id[..12]);
        Ok(id)
    }

    /// Raw public key bytes.
    pub fn public_key_raw(&self) -> Result<[u8; 32]> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.public_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("decode public key: {}", e))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid public key length"))
    }

    /// Public key for the connect device block: URL-safe unpadded base64 of the raw bytes.
    pub fn public_key_wire(&self) -> Result<String> {
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.public_key_raw()?))
    }

    /// Sign a canonical payload. Returns the signature as URL-safe unpadded base64.
    pub fn sign(&self, payload: &str) -> Result<String> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(self.private_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("decode private key: {}", e))?;
        let key_arr: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid private key length"))?;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&key_arr);
        let sig = signing_key.sign(payload.as_bytes());
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig.to_bytes()))
    }
}

/// Hex SHA-256 of raw public key bytes.
fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
