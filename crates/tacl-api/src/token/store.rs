//! Persisted session (token pairs) and config (api keys) stores.
//!
//! Two separate YAML files under the per-OS config directory: `session` holds short-lived
//! access/refresh pairs keyed by (environment, tenant, token kind); `config` holds long-lived api
//! keys keyed by (environment, tenant). Both use atomic writes (temp file + rename) and, on Unix,
//! user-only permissions.

use crate::environment::Environment;
use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One access/refresh pair as persisted on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: Option<String>,
}

/// `{env: {pnum: {kind: access, kind_refresh: refresh?, ...}}}`.
type SessionFile = HashMap<String, HashMap<String, HashMap<String, String>>>;

/// `{env: {pnum: api_key}}`.
type ConfigFile = HashMap<String, HashMap<String, String>>;

/// Token-store reads/writes for the `session` file.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> Result<PathBuf, SessionError> {
        let base = dirs::config_dir().ok_or(SessionError::NoConfigDir)?;
        Ok(base.join("tacl").join("session"))
    }

    fn read_file(&self) -> Result<SessionFile, SessionError> {
        if !self.path.exists() {
            return Ok(SessionFile::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| SessionError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(SessionFile::new());
        }
        serde_yaml::from_str(&content).map_err(SessionError::Parse)
    }

    fn write_file(&self, data: &SessionFile) -> Result<(), SessionError> {
        write_yaml_atomic(&self.path, data)
    }

    /// No pair exists, or `now >= exp(access)`.
    pub fn is_expired(&self, env: Environment, tenant: &str, kind: &str, now: i64) -> bool {
        match self.get(env, tenant, kind) {
            Ok(Some(pair)) => match super::claims::decode_claims(&pair.access) {
                Ok(claims) => super::claims::is_expired(&claims, now),
                Err(_) => true,
            },
            _ => true,
        }
    }

    /// `exp(access) ∈ (now, now+minutes]`. A missing pair is not "expires soon" (it's already
    /// unusable, which callers distinguish via `is_expired`).
    pub fn expires_soon(&self, env: Environment, tenant: &str, kind: &str, now: i64, minutes: i64) -> bool {
        match self.get(env, tenant, kind) {
            Ok(Some(pair)) => match super::claims::decode_claims(&pair.access) {
                Ok(claims) => super::claims::expires_soon(&claims, now, minutes),
                Err(_) => false,
            },
            _ => false,
        }
    }

    pub fn get(
        &self,
        env: Environment,
        tenant: &str,
        kind: &str,
    ) -> Result<Option<TokenPair>, SessionError> {
        let data = self.read_file()?;
        let Some(by_tenant) = data.get(env.as_str()) else {
            return Ok(None);
        };
        let Some(fields) = by_tenant.get(tenant) else {
            return Ok(None);
        };
        let Some(access) = fields.get(kind) else {
            return Ok(None);
        };
        let refresh = fields.get(&format!("{kind}_refresh")).cloned();
        Ok(Some(TokenPair {
            access: access.clone(),
            refresh,
        }))
    }

    /// Replace the pair for (env, tenant, kind), creating the parent directory (user-only
    /// permissions on Unix) if needed, and writing atomically.
    pub fn update(
        &self,
        env: Environment,
        tenant: &str,
        kind: &str,
        access: &str,
        refresh: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut data = self.read_file()?;
        let fields = data
            .entry(env.as_str().to_string())
            .or_default()
            .entry(tenant.to_string())
            .or_default();
        fields.insert(kind.to_string(), access.to_string());
        let refresh_key = format!("{kind}_refresh");
        match refresh {
            Some(r) => {
                fields.insert(refresh_key, r.to_string());
            }
            None => {
                fields.remove(&refresh_key);
            }
        }
        self.write_file(&data)
    }

    /// Reset to an empty mapping for all environments.
    pub fn clear(&self) -> Result<(), SessionError> {
        self.write_file(&SessionFile::new())
    }
}

/// Api-key config store reads/writes for the `config` file.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> Result<PathBuf, SessionError> {
        let base = dirs::config_dir().ok_or(SessionError::NoConfigDir)?;
        Ok(base.join("tacl").join("config"))
    }

    fn read_file(&self) -> Result<ConfigFile, SessionError> {
        if !self.path.exists() {
            return Ok(ConfigFile::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| SessionError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(ConfigFile::new());
        }
        serde_yaml::from_str(&content).map_err(SessionError::Parse)
    }

    pub fn get(&self, env: Environment, tenant: &str) -> Result<Option<String>, SessionError> {
        let data = self.read_file()?;
        Ok(data
            .get(env.as_str())
            .and_then(|by_tenant| by_tenant.get(tenant))
            .cloned())
    }

    pub fn set(&self, env: Environment, tenant: &str, api_key: &str) -> Result<(), SessionError> {
        let mut data = self.read_file()?;
        data.entry(env.as_str().to_string())
            .or_default()
            .insert(tenant.to_string(), api_key.to_string());
        write_yaml_atomic(&self.path, &data)
    }
}

/// Serialize `data` to `path` via a temp file in the same directory followed by a rename, so a
/// reader never observes a partially-written file. User-only permissions on Unix.
fn write_yaml_atomic<T: Serialize>(path: &Path, data: &T) -> Result<(), SessionError> {
    let parent = path.parent().ok_or(SessionError::NoConfigDir)?;
    std::fs::create_dir_all(parent).map_err(|source| SessionError::Write {
        path: parent.display().to_string(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
    }

    let yaml = serde_yaml::to_string(data).map_err(SessionError::Parse)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, yaml).map_err(|source| SessionError::Write {
        path: tmp_path.display().to_string(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600));
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SessionError::Write {
        path: path.display().to_string(),
        source,
    })
}
