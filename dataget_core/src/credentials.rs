use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::archive::BlobArchive;
use crate::contracts::{PipelineError, PipelineResult};

/// Bearer tokens harvested from the console are good for 15 days; we refresh
/// 3 days ahead of expiry.
pub const TOKEN_VALID_DAYS: i64 = 15;
pub const TOKEN_REFRESH_BEFORE_DAYS: i64 = 3;

/// # NDOC
/// component: `credentials`
/// purpose: One credential record per provider.
/// invariants:
///   - `valid_days > refresh_threshold_days > 0`.
///   - A stale credential is refreshed before any extraction uses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: String,
    pub token_material: String,
    pub created_at: DateTime<Utc>,
    pub valid_days: i64,
    pub refresh_threshold_days: i64,
}

impl Credential {
    pub fn new(provider: impl Into<String>, token_material: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            token_material: token_material.into(),
            created_at: Utc::now(),
            valid_days: TOKEN_VALID_DAYS,
            refresh_threshold_days: TOKEN_REFRESH_BEFORE_DAYS,
        }
    }

    /// Stale when `now - created_at >= valid_days - refresh_threshold_days`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age_days = (now - self.created_at).num_days();
        age_days >= self.valid_days - self.refresh_threshold_days
    }
}

/// On-disk shape of `{provider}_token.json`.
#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    token: String,
    updated: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_used: Option<String>,
}

/// How a provider's credential is re-acquired without a human.
///
/// Implementations return `AuthInteractiveRequired` when only an interactive
/// login can produce new material.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, provider: &str) -> PipelineResult<Credential>;
}

/// # NDOC
/// component: `credentials`
/// purpose: Persist and refresh per-provider credentials with proactive
///          pre-expiry refresh and a blob disaster-recovery mirror.
/// invariants:
///   - Writes serialize per provider (one refresh at a time).
///   - `save` is an atomic replace of the token file.
pub struct CredentialStore {
    dir: PathBuf,
    archive: Option<BlobArchive>,
    refreshers: HashMap<String, Arc<dyn CredentialRefresher>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            archive: None,
            refreshers: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Mirror every save into the blob archive; providers whose re-acquisition
    /// needs a human get a recoverable copy.
    pub fn with_archive(mut self, archive: BlobArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn register_refresher(&mut self, provider: &str, refresher: Arc<dyn CredentialRefresher>) {
        self.refreshers.insert(provider.to_string(), refresher);
    }

    /// Returns a usable credential, refreshing first when stale.
    ///
    /// Fails with `AuthInteractiveRequired` when no non-interactive path can
    /// produce fresh material; callers must fail the extraction and alarm.
    pub async fn get(&self, provider: &str) -> PipelineResult<Credential> {
        let lock = self.provider_lock(provider).await;
        let _guard = lock.lock().await;

        let current = self.load(provider)?;
        match current {
            Some(credential) if !credential.is_stale(Utc::now()) => Ok(credential),
            current => {
                if let Some(existing) = &current {
                    log::info!(
                        "credential for {} is stale (created {}), refreshing",
                        provider,
                        existing.created_at
                    );
                }
                self.refresh_locked(provider).await
            }
        }
    }

    /// Forces a refresh regardless of staleness (one-shot retry after
    /// `AuthExpired`).
    pub async fn force_refresh(&self, provider: &str) -> PipelineResult<Credential> {
        let lock = self.provider_lock(provider).await;
        let _guard = lock.lock().await;
        self.refresh_locked(provider).await
    }

    async fn refresh_locked(&self, provider: &str) -> PipelineResult<Credential> {
        let refresher = self.refreshers.get(provider).cloned().ok_or_else(|| {
            PipelineError::auth_interactive(format!(
                "no refresher registered for provider '{provider}'; interactive login required"
            ))
        })?;
        let credential = refresher.refresh(provider).await?;
        self.save(provider, &credential.token_material)?;
        Ok(credential)
    }

    /// Atomic replace of the provider's token file, mirrored to the archive.
    pub fn save(&self, provider: &str, token_material: &str) -> PipelineResult<()> {
        fs::create_dir_all(&self.dir)?;
        let file = TokenFile {
            token: token_material.to_string(),
            updated: Utc::now().to_rfc3339(),
            last_used: None,
        };
        let body = serde_json::to_string_pretty(&file)?;
        let path = self.token_path(provider);
        let tmp = path.with_extension("json.tmp");
        {
            let mut handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            handle.lock_exclusive()?;
            handle.write_all(body.as_bytes())?;
            handle.sync_all()?;
            fs2::FileExt::unlock(&handle)?;
        }
        fs::rename(&tmp, &path)?;
        log::info!("saved credential for {}", provider);

        if let Some(archive) = &self.archive {
            let mirror = BlobArchive::credential_mirror_path(
                provider,
                &format!("{provider}_token.json"),
            );
            if let Err(err) = archive.put_json(&mirror, &serde_json::to_value(&file)?) {
                log::warn!("credential mirror for {} failed: {}", provider, err);
            }
        }
        Ok(())
    }

    /// Observability-only timestamp update.
    pub fn mark_used(&self, provider: &str) -> PipelineResult<()> {
        let path = self.token_path(provider);
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path)?;
        let mut file: TokenFile = serde_json::from_str(&raw)?;
        file.last_used = Some(Utc::now().to_rfc3339());
        fs::write(&path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    fn load(&self, provider: &str) -> PipelineResult<Option<Credential>> {
        let path = self.token_path(provider);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let file: TokenFile = serde_json::from_str(&raw).map_err(|err| {
            PipelineError::invalid(format!("token file for {provider} is malformed: {err}"))
        })?;
        let created_at = DateTime::parse_from_rfc3339(&file.updated)
            .map_err(|err| {
                PipelineError::invalid(format!(
                    "token file for {provider} has a bad 'updated' timestamp: {err}"
                ))
            })?
            .with_timezone(&Utc);
        Ok(Some(Credential {
            provider: provider.to_string(),
            token_material: file.token,
            created_at,
            valid_days: TOKEN_VALID_DAYS,
            refresh_threshold_days: TOKEN_REFRESH_BEFORE_DAYS,
        }))
    }

    /// Persists a cookie jar as `{provider}_cookies.json`, mirrored like tokens.
    pub fn save_cookies(&self, provider: &str, cookies: &Value) -> PipelineResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.cookie_path(provider);
        fs::write(&path, serde_json::to_string_pretty(cookies)?)?;
        if let Some(archive) = &self.archive {
            let mirror = BlobArchive::credential_mirror_path(
                provider,
                &format!("{provider}_cookies.json"),
            );
            if let Err(err) = archive.put_json(&mirror, cookies) {
                log::warn!("cookie mirror for {} failed: {}", provider, err);
            }
        }
        Ok(())
    }

    /// Loads the local cookie jar, falling back to the archive mirror.
    pub fn load_cookies(&self, provider: &str) -> PipelineResult<Option<Value>> {
        let path = self.cookie_path(provider);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            return Ok(Some(serde_json::from_str(&raw)?));
        }
        if let Some(archive) = &self.archive {
            let mirror = BlobArchive::credential_mirror_path(
                provider,
                &format!("{provider}_cookies.json"),
            );
            return archive.get_json(&mirror);
        }
        Ok(None)
    }

    fn token_path(&self, provider: &str) -> PathBuf {
        self.dir.join(format!("{provider}_token.json"))
    }

    fn cookie_path(&self, provider: &str) -> PathBuf {
        self.dir.join(format!("{provider}_cookies.json"))
    }

    async fn provider_lock(&self, provider: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
