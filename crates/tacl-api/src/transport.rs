//! Directory transporter: enumerates source and target, computes upload/download/sync/
//! delete work lists, drives the per-file uploader/downloader, and interacts with the request
//! cache. Polymorphic over the four capability sets via [`DirectoryKind`] rather than a class
//! hierarchy.

use crate::cache::{CacheRow, RequestCache};
use crate::crypto::ServerPublicKey;
use crate::download::{DownloadRequest, Downloader};
use crate::environment::Environment;
use crate::error::TaclError;
use crate::retry;
use crate::runtime_config::RuntimeConfig;
use crate::token::auth::AuthClient;
use crate::token::policy::{self};
use crate::token::store::SessionStore;
use crate::upload::{UploadRequest, Uploader};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Which of the four capability sets a transporter instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    UploadOnly,
    DownloadOnly,
    UploadSync,
    DownloadSync,
}

impl DirectoryKind {
    pub fn is_upload(&self) -> bool {
        matches!(self, DirectoryKind::UploadOnly | DirectoryKind::UploadSync)
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, DirectoryKind::UploadSync | DirectoryKind::DownloadSync)
    }

    /// Token kind this variant authenticates with.
    pub fn token_kind(&self) -> &'static str {
        if self.is_upload() { "import" } else { "export" }
    }
}

/// Whether a remote entry's integrity reference is its content etag or its mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    Etag,
    Mtime,
}

/// Everything the transporter needs that stays fixed across one `sync()` call, modulo the mutable token/pool state which lives in [`TransferContext`].
pub struct DirectorySyncRequest<'a> {
    pub kind: DirectoryKind,
    pub env: Environment,
    pub tenant: &'a str,
    pub service: &'a str,
    pub group: &'a str,
    pub local_root: &'a Path,
    pub target_dir: Option<&'a Path>,
    pub remote_path_prefix: Option<&'a str>,
    pub ignore_prefixes: &'a [String],
    pub ignore_suffixes: &'a [String],
    pub sync_mtime: bool,
    pub keep_missing: bool,
    pub keep_updated: bool,
    pub integrity_kind: IntegrityKind,
    pub server_key: Option<&'a ServerPublicKey>,
}

/// Bundles the credential-refresh machinery a transporter calls before each file, so refreshes
/// observed mid-directory are persisted the same way a single-file caller would.
pub struct RefreshHandle {
    pub auth: AuthClient,
    pub session: SessionStore,
    pub before: Duration,
    pub after: Duration,
}

/// The mutable state threaded through every operation of one transporter instance: access/refresh tokens, the refresh target, and the HTTP connection pool, all updated
/// in place on refresh/retry rather than reassigned on some owning object.
pub struct TransferContext {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub refresh_target: i64,
    pub http: reqwest::Client,
    pub refresh: Option<RefreshHandle>,
}

impl TransferContext {
    pub fn new(http: reqwest::Client, access_token: String, refresh_token: Option<String>, refresh_target: i64) -> Self {
        Self {
            access_token,
            refresh_token,
            refresh_target,
            http,
            refresh: None,
        }
    }

    /// Call the refresh policy for this transfer's token kind and adopt whatever it returns.
    /// A no-op when no [`RefreshHandle`] is configured (e.g. an orchestrator that already
    /// resolved a fresh token and does not want the core refreshing behind its back).
    async fn maybe_refresh(&mut self, env: Environment, tenant: &str, kind: &str, now: i64) {
        let Some(handle) = &self.refresh else { return };
        let outcome = policy::maybe_refresh(
            &handle.auth,
            &handle.session,
            env,
            tenant,
            kind,
            Some(&self.access_token),
            self.refresh_token.as_deref(),
            self.refresh_target,
            now,
            handle.before,
            handle.after,
            false,
        )
        .await;
        if let Some(access) = outcome.access {
            self.access_token = access;
        }
        self.refresh_token = outcome.refresh;
    }
}

/// Outcome of one `sync()` call, for the caller to log/report.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub transferred: usize,
    pub deleted: usize,
    pub skipped: Vec<String>,
}

/// `relative_name` (a directory's path relative to the sync root) starts with any ignore-prefix.
fn is_ignored_dir(relative_name: &str, ignore_prefixes: &[String]) -> bool {
    ignore_prefixes.iter().any(|p| relative_name.starts_with(p.as_str()))
}

/// `file_name` (just the basename) ends with any ignore-suffix.
fn is_ignored_file(file_name: &str, ignore_suffixes: &[String]) -> bool {
    ignore_suffixes.iter().any(|s| file_name.ends_with(s.as_str()))
}

/// Walk `root` recursively, skipping ignored subtrees/files, recording local mtime as
/// the integrity reference when `sync_mtime` is set.
pub async fn enumerate_local(
    root: &Path,
    ignore_prefixes: &[String],
    ignore_suffixes: &[String],
    sync_mtime: bool,
) -> Result<Vec<CacheRow>, TaclError> {
    let mut results = Vec::new();
    let mut queue: VecDeque<(PathBuf, String)> = VecDeque::new();
    queue.push_back((root.to_path_buf(), String::new()));

    while let Some((dir, rel_prefix)) = queue.pop_front() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if rel_prefix.is_empty() {
                name.clone()
            } else {
                format!("{rel_prefix}/{name}")
            };

            if file_type.is_dir() {
                if is_ignored_dir(&relative, ignore_prefixes) {
                    continue;
                }
                queue.push_back((entry.path(), relative));
                continue;
            }

            if is_ignored_file(&name, ignore_suffixes) {
                continue;
            }
            let integrity_reference = if sync_mtime {
                let metadata = entry.metadata().await?;
                let mtime = metadata.modified()?;
                let secs = mtime
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                Some(secs.to_string())
            } else {
                None
            };
            results.push(CacheRow {
                resource_path: relative,
                integrity_reference,
            });
        }
    }
    Ok(results)
}

/// One page of a remote directory listing.
#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    entries: Vec<ListingEntry>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    name: String,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    mtime: Option<f64>,
}

/// Which base path a remote listing is enumerated under: export listings for downloads,
/// import (stream) listings scoped to a group for uploads.
pub enum ListingMode<'a> {
    Export,
    Import { group: &'a str },
}

fn listing_url(
    env: Environment,
    tenant: &str,
    service: &str,
    mode: &ListingMode<'_>,
    base_path: Option<&str>,
    rel_dir: &str,
    config: &RuntimeConfig,
) -> String {
    let mut segments = Vec::new();
    match mode {
        ListingMode::Export => segments.push("export".to_string()),
        ListingMode::Import { group } => {
            segments.push("stream".to_string());
            segments.push(group.to_string());
        }
    }
    if let Some(prefix) = base_path {
        if !prefix.is_empty() {
            segments.push(prefix.to_string());
        }
    }
    if !rel_dir.is_empty() {
        segments.push(rel_dir.to_string());
    }
    format!(
        "{}/{}/{}/{}",
        config.api_base(env),
        tenant,
        service,
        segments.join("/")
    )
}

/// Paginate a remote directory listing, following `next_page` tokens per subdirectory
/// and queuing subdirectories BFS-style as they're encountered.
#[allow(clippy::too_many_arguments)]
pub async fn enumerate_remote(
    http: &mut reqwest::Client,
    env: Environment,
    tenant: &str,
    service: &str,
    mode: &ListingMode<'_>,
    base_path: Option<&str>,
    access_token: &str,
    integrity_kind: IntegrityKind,
    ignore_prefixes: &[String],
    ignore_suffixes: &[String],
    config: &RuntimeConfig,
) -> Result<Vec<CacheRow>, TaclError> {
    let mut results = Vec::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(String::new());

    while let Some(rel_dir) = queue.pop_front() {
        if !rel_dir.is_empty() && is_ignored_dir(&rel_dir, ignore_prefixes) {
            continue;
        }
        let mut page_token: Option<String> = None;
        loop {
            let url = listing_url(env, tenant, service, mode, base_path, &rel_dir, config);
            let page_size = config.list_page_size.to_string();
            let token = page_token.clone();
            let outcome = retry::execute(
                http,
                |client| {
                    let mut req = client
                        .get(&url)
                        .bearer_auth(access_token)
                        .query(&[("per_page", page_size.as_str())]);
                    if let Some(t) = &token {
                        req = req.query(&[("page", t.as_str())]);
                    }
                    req
                },
                config,
            )
            .await?;
            if !outcome.response.status().is_success() {
                return Err(retry::into_error(outcome.response).await);
            }
            let page: ListingPage = outcome.response.json().await?;

            for entry in page.entries {
                let relative = if rel_dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{rel_dir}/{}", entry.name)
                };
                if entry.is_dir {
                    queue.push_back(relative);
                    continue;
                }
                if is_ignored_file(&entry.name, ignore_suffixes) {
                    continue;
                }
                let integrity_reference = match integrity_kind {
                    IntegrityKind::Etag => entry.etag,
                    IntegrityKind::Mtime => entry.mtime.map(|m| m.to_string()),
                };
                results.push(CacheRow {
                    resource_path: relative,
                    integrity_reference,
                });
            }

            match page.next_page {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
    }
    Ok(results)
}

/// Compute the (transfers, deletes) pair given `source` (authoritative) and `target`.
///
/// A `source` row with no `integrity_reference` (the caller didn't ask for change tracking)
/// is left alone whenever it already exists in `target`, regardless of what reference the
/// target side carries - without a signal on our end there's nothing to compare against, so
/// an existing resource is assumed unchanged rather than re-sent on every run.
pub fn compute_sync_lists(
    source: &[CacheRow],
    target: &[CacheRow],
    keep_missing: bool,
    keep_updated: bool,
) -> (Vec<CacheRow>, Vec<String>) {
    let target_by_name: HashMap<&str, Option<&str>> = target
        .iter()
        .map(|r| (r.resource_path.as_str(), r.integrity_reference.as_deref()))
        .collect();

    let deletes = if keep_missing {
        Vec::new()
    } else {
        let source_names: HashSet<&str> = source.iter().map(|r| r.resource_path.as_str()).collect();
        target
            .iter()
            .filter(|r| !source_names.contains(r.resource_path.as_str()))
            .map(|r| r.resource_path.clone())
            .collect()
    };

    let transfers = source
        .iter()
        .filter(|s| match target_by_name.get(s.resource_path.as_str()) {
            None => true,
            Some(target_ref) => {
                if keep_updated {
                    is_numerically_newer(s.integrity_reference.as_deref(), *target_ref)
                } else {
                    match s.integrity_reference.as_deref() {
                        // No integrity signal from the authoritative side (sync_mtime off):
                        // a resource already present on the other end is left alone rather
                        // than re-sent on every run.
                        None => false,
                        Some(source_ref) => Some(source_ref) != *target_ref,
                    }
                }
            }
        })
        .cloned()
        .collect();

    (transfers, deletes)
}

/// `source[r] > target[r]` when both parse as numbers (mtimes); otherwise `false` - this
/// predicate is only meaningful when the caller selected mtime-based integrity references.
fn is_numerically_newer(source_ref: Option<&str>, target_ref: Option<&str>) -> bool {
    match (source_ref, target_ref) {
        (Some(s), Some(t)) => match (s.parse::<f64>(), t.parse::<f64>()) {
            (Ok(sv), Ok(tv)) => sv > tv,
            _ => false,
        },
        _ => false,
    }
}

/// Resource path a directory-mode upload sends: `<group>[/<remote_path>]/<relative>`.
fn directory_upload_resource(group: &str, remote_path_prefix: Option<&str>, relative: &str) -> String {
    match remote_path_prefix {
        Some(prefix) if !prefix.is_empty() => format!("{group}/{prefix}/{relative}"),
        _ => format!("{group}/{relative}"),
    }
}

async fn local_mtime_seconds(path: &Path) -> std::io::Result<f64> {
    let metadata = tokio::fs::metadata(path).await?;
    let mtime = metadata.modified()?;
    Ok(mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64())
}

async fn find_resources_to_handle(
    req: &DirectorySyncRequest<'_>,
    ctx: &mut TransferContext,
    config: &RuntimeConfig,
) -> Result<(Vec<CacheRow>, Vec<String>), TaclError> {
    match req.kind {
        DirectoryKind::UploadOnly => {
            let files = enumerate_local(req.local_root, req.ignore_prefixes, req.ignore_suffixes, req.sync_mtime).await?;
            Ok((files, Vec::new()))
        }
        DirectoryKind::DownloadOnly => {
            let remote = enumerate_remote(
                &mut ctx.http,
                req.env,
                req.tenant,
                req.service,
                &ListingMode::Export,
                req.remote_path_prefix,
                &ctx.access_token,
                req.integrity_kind,
                req.ignore_prefixes,
                req.ignore_suffixes,
                config,
            )
            .await?;
            Ok((remote, Vec::new()))
        }
        DirectoryKind::UploadSync => {
            let source = enumerate_local(req.local_root, req.ignore_prefixes, req.ignore_suffixes, req.sync_mtime).await?;
            let target = enumerate_remote(
                &mut ctx.http,
                req.env,
                req.tenant,
                req.service,
                &ListingMode::Import { group: req.group },
                req.remote_path_prefix,
                &ctx.access_token,
                req.integrity_kind,
                req.ignore_prefixes,
                req.ignore_suffixes,
                config,
            )
            .await?;
            Ok(compute_sync_lists(&source, &target, req.keep_missing, req.keep_updated))
        }
        DirectoryKind::DownloadSync => {
            let source = enumerate_remote(
                &mut ctx.http,
                req.env,
                req.tenant,
                req.service,
                &ListingMode::Export,
                req.remote_path_prefix,
                &ctx.access_token,
                req.integrity_kind,
                req.ignore_prefixes,
                req.ignore_suffixes,
                config,
            )
            .await?;
            let local_target_root = req.target_dir.unwrap_or(req.local_root);
            let target = enumerate_local(local_target_root, req.ignore_prefixes, req.ignore_suffixes, req.sync_mtime).await?;
            Ok(compute_sync_lists(&source, &target, req.keep_missing, req.keep_updated))
        }
    }
}

async fn transfer_one(
    req: &DirectorySyncRequest<'_>,
    ctx: &mut TransferContext,
    row: &CacheRow,
    config: &RuntimeConfig,
    uploader: &mut Uploader,
    downloader: &mut Downloader,
    now: i64,
) -> Result<(), TaclError> {
    ctx.maybe_refresh(req.env, req.tenant, req.kind.token_kind(), now).await;

    if req.kind.is_upload() {
        let local_path = req.local_root.join(&row.resource_path);
        let resource = directory_upload_resource(req.group, req.remote_path_prefix, &row.resource_path);
        let mtime = if req.sync_mtime {
            local_mtime_seconds(&local_path).await.ok()
        } else {
            None
        };
        let upload_req = UploadRequest {
            env: req.env,
            tenant: req.tenant,
            service: req.service,
            resource: &resource,
            group: req.group,
            local_path: &local_path,
            access_token: &ctx.access_token,
            mtime,
            server_key: req.server_key,
            force_resumable: false,
            resumable_id: None,
        };
        uploader.upload(&upload_req, config).await?;
        ctx.http = uploader.client();
    } else {
        let local_path = match req.target_dir {
            Some(dir) => dir.join(&row.resource_path),
            None => req.local_root.join(&row.resource_path),
        };
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let previous_etag = match req.integrity_kind {
            IntegrityKind::Etag => row.integrity_reference.as_deref(),
            IntegrityKind::Mtime => None,
        };
        let download_req = DownloadRequest {
            env: req.env,
            tenant: req.tenant,
            service: req.service,
            resource: &row.resource_path,
            local_path: &local_path,
            access_token: &ctx.access_token,
            previous_etag,
            sync_mtime: req.sync_mtime,
            server_key: req.server_key,
        };
        downloader.download(&download_req, config).await?;
        ctx.http = downloader.client();
    }
    Ok(())
}

async fn delete_one(
    req: &DirectorySyncRequest<'_>,
    ctx: &mut TransferContext,
    resource_path: &str,
    config: &RuntimeConfig,
) -> Result<(), TaclError> {
    match req.kind {
        DirectoryKind::UploadSync => {
            let url = format!(
                "{}/{}/{}/stream/{}/{}",
                config.api_base(req.env),
                req.tenant,
                req.service,
                req.group,
                resource_path
            );
            let token = ctx.access_token.clone();
            let outcome = retry::execute(&mut ctx.http, |client| client.delete(&url).bearer_auth(&token), config).await?;
            if !outcome.response.status().is_success() {
                return Err(retry::into_error(outcome.response).await);
            }
            Ok(())
        }
        DirectoryKind::DownloadSync => {
            let local_path = match req.target_dir {
                Some(dir) => dir.join(resource_path),
                None => req.local_root.join(resource_path),
            };
            match tokio::fs::metadata(&local_path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&local_path).await?,
                Ok(_) => tokio::fs::remove_file(&local_path).await?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Run one full directory transfer. `now` is the caller-supplied unix-seconds clock
/// (so refresh-window tests can drive it deterministically instead of calling `SystemTime::now`
/// from inside the engine).
pub async fn sync(
    req: &DirectorySyncRequest<'_>,
    ctx: &mut TransferContext,
    config: &RuntimeConfig,
    mut transfer_cache: Option<&mut RequestCache>,
    mut delete_cache: Option<&mut RequestCache>,
    now: i64,
) -> Result<SyncReport, TaclError> {
    let mut uploader = Uploader::new(ctx.http.clone());
    let mut downloader = Downloader::new(ctx.http.clone());
    let cache_key = req.local_root;

    let cached_work = match (transfer_cache.as_deref_mut(), delete_cache.as_deref_mut()) {
        (Some(tc), Some(dc)) => {
            let pending_transfer = if tc.has_pending(cache_key)? {
                tc.read(cache_key)?
            } else {
                Vec::new()
            };
            let pending_delete = if dc.has_pending(cache_key)? {
                dc.read(cache_key)?
                    .into_iter()
                    .map(|r| r.resource_path)
                    .collect()
            } else {
                Vec::new()
            };
            if pending_transfer.is_empty() && pending_delete.is_empty() {
                None
            } else {
                Some((pending_transfer, pending_delete))
            }
        }
        _ => None,
    };

    let (transfers, deletes) = match cached_work {
        Some(pair) => pair,
        None => {
            let (transfers, deletes) = find_resources_to_handle(req, ctx, config).await?;
            if let Some(tc) = transfer_cache.as_deref_mut() {
                tc.create(cache_key)?;
                tc.add_many(cache_key, &transfers)?;
            }
            if let Some(dc) = delete_cache.as_deref_mut() {
                dc.create(cache_key)?;
                let rows: Vec<CacheRow> = deletes
                    .iter()
                    .map(|d| CacheRow {
                        resource_path: d.clone(),
                        integrity_reference: None,
                    })
                    .collect();
                dc.add_many(cache_key, &rows)?;
            }
            (transfers, deletes)
        }
    };

    let mut report = SyncReport::default();
    for row in &transfers {
        match transfer_one(req, ctx, row, config, &mut uploader, &mut downloader, now).await {
            Ok(()) => {
                report.transferred += 1;
                if let Some(tc) = transfer_cache.as_deref_mut() {
                    tc.remove(cache_key, &row.resource_path)?;
                }
            }
            Err(err) if err.is_skippable_in_directory_transfer() => {
                tracing::warn!(target: "sync", resource = %row.resource_path, %err, "skipping resource");
                report.skipped.push(row.resource_path.clone());
                if let Some(tc) = transfer_cache.as_deref_mut() {
                    tc.remove(cache_key, &row.resource_path)?;
                }
            }
            Err(err) => return Err(err),
        }
    }
    if let Some(tc) = transfer_cache.as_deref_mut() {
        tc.destroy(cache_key)?;
    }

    for resource in &deletes {
        delete_one(req, ctx, resource, config).await?;
        report.deleted += 1;
        if let Some(dc) = delete_cache.as_deref_mut() {
            dc.remove(cache_key, resource)?;
        }
    }
    if let Some(dc) = delete_cache.as_deref_mut() {
        dc.destroy(cache_key)?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn row(path: &str, reference: Option<&str>) -> CacheRow {
        CacheRow {
            resource_path: path.to_string(),
            integrity_reference: reference.map(str::to_string),
        }
    }

    // --- sync set algebra ---

    #[test]
    fn strict_mode_deletes_target_only_names_and_transfers_pair_differences() {
        let source = vec![row("a", None), row("b", None)];
        let target = vec![row("a", None), row("b", None), row("c", None)];
        let (transfers, deletes) = compute_sync_lists(&source, &target, false, false);
        assert!(transfers.is_empty());
        assert_eq!(deletes, vec!["c".to_string()]);
    }

    #[test]
    fn keep_missing_never_deletes() {
        let source = vec![row("a", None)];
        let target = vec![row("a", None), row("stale", None)];
        let (_, deletes) = compute_sync_lists(&source, &target, true, false);
        assert!(deletes.is_empty());
    }

    #[test]
    fn strict_mode_transfers_changed_integrity_references() {
        let source = vec![row("a", Some("etag-new"))];
        let target = vec![row("a", Some("etag-old"))];
        let (transfers, _) = compute_sync_lists(&source, &target, false, false);
        assert_eq!(transfers, vec![row("a", Some("etag-new"))]);
    }

    #[test]
    fn strict_mode_leaves_unchanged_files_alone_when_source_carries_no_integrity_signal() {
        // sync_mtime off on the local side: source rows carry no integrity_reference at all,
        // even though the remote side's etag is populated. A resource present on both ends
        // should not be re-sent just because the target happens to have a reference we have
        // nothing to compare it against.
        let source = vec![row("a", None), row("b", None)];
        let target = vec![row("a", Some("etag-a")), row("b", Some("etag-b")), row("c", Some("etag-c"))];
        let (transfers, deletes) = compute_sync_lists(&source, &target, false, false);
        assert!(transfers.is_empty());
        assert_eq!(deletes, vec!["c".to_string()]);
    }

    #[test]
    fn keep_updated_only_transfers_missing_or_numerically_newer() {
        let source = vec![
            row("new", Some("200")),
            row("older", Some("50")),
            row("missing", Some("10")),
        ];
        let target = vec![row("new", Some("100")), row("older", Some("100"))];
        let (transfers, _) = compute_sync_lists(&source, &target, false, true);
        let names: HashSet<&str> = transfers.iter().map(|r| r.resource_path.as_str()).collect();
        assert_eq!(names, HashSet::from(["new", "missing"]));
    }

    #[test]
    fn both_flags_true_is_append_only_and_update_preserving() {
        let source = vec![row("a", Some("200")), row("b", Some("50"))];
        let target = vec![row("a", Some("100")), row("b", Some("100")), row("stale", None)];
        let (transfers, deletes) = compute_sync_lists(&source, &target, true, true);
        assert!(deletes.is_empty());
        assert_eq!(transfers, vec![row("a", Some("200"))]);
    }

    // --- local enumeration ---

    #[tokio::test]
    async fn local_enumeration_skips_ignored_subtrees_and_suffixes() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("keep")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join(".cache")).await.unwrap();
        tokio::fs::write(dir.path().join("keep/a.txt"), b"a").await.unwrap();
        tokio::fs::write(dir.path().join(".cache/ignored.txt"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("b.tmp"), b"b").await.unwrap();
        tokio::fs::write(dir.path().join("c.txt"), b"c").await.unwrap();

        let ignore_prefixes = vec![".cache".to_string()];
        let ignore_suffixes = vec![".tmp".to_string()];
        let mut results = enumerate_local(dir.path(), &ignore_prefixes, &ignore_suffixes, false)
            .await
            .unwrap();
        results.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        let names: Vec<&str> = results.iter().map(|r| r.resource_path.as_str()).collect();
        assert_eq!(names, vec!["c.txt", "keep/a.txt"]);
    }

    #[tokio::test]
    async fn local_enumeration_records_mtime_only_when_requested() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"a").await.unwrap();

        let without_mtime = enumerate_local(dir.path(), &[], &[], false).await.unwrap();
        assert!(without_mtime[0].integrity_reference.is_none());

        let with_mtime = enumerate_local(dir.path(), &[], &[], true).await.unwrap();
        assert!(with_mtime[0].integrity_reference.is_some());
        assert!(with_mtime[0].integrity_reference.as_deref().unwrap().parse::<f64>().is_ok());
    }

    // --- remote enumeration ---

    #[tokio::test]
    async fn remote_enumeration_follows_pagination_and_recurses_into_subdirs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v1/p11/files/export/?$"))
            .and(query_param("per_page", "100"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "entries": [
                        {"name": "a.txt", "is_dir": false, "etag": "e1"},
                        {"name": "sub", "is_dir": true}
                    ],
                    "next_page": "tok2"
                })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v1/p11/files/export/?$"))
            .and(query_param("page", "tok2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": [{"name": "b.txt", "is_dir": false, "etag": "e2"}],
                "next_page": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v1/p11/files/export/sub$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": [{"name": "c.txt", "is_dir": false, "etag": "e3"}],
                "next_page": null
            })))
            .mount(&server)
            .await;

        let mut client = reqwest::Client::new();
        let config = RuntimeConfig::default().with_base_url_override(server.uri());
        let ignore: Vec<String> = Vec::new();
        let mut results = enumerate_remote(
            &mut client,
            Environment::Dev,
            "p11",
            "files",
            &ListingMode::Export,
            None,
            "tok",
            IntegrityKind::Etag,
            &ignore,
            &ignore,
            &config,
        )
        .await
        .unwrap();
        results.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        let names: Vec<&str> = results.iter().map(|r| r.resource_path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    // --- cache lifecycle through a directory sync ---

    /// S5 from the wire-level scenarios: local `{a,b}`, remote `{a,b,c}`, defaults. Expect zero
    /// uploads and exactly one delete of the remote-only file.
    #[tokio::test]
    async fn upload_sync_deletes_remote_only_files_and_transfers_nothing_else() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v1/p11/files/stream/p11-member-group$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": [
                    {"name": "a", "is_dir": false, "etag": "e1"},
                    {"name": "b", "is_dir": false, "etag": "e2"},
                    {"name": "c", "is_dir": false, "etag": "e3"}
                ],
                "next_page": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/v1/p11/files/stream/p11-member-group/c$"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a"), b"hi").await.unwrap();
        tokio::fs::write(dir.path().join("b"), b"hi").await.unwrap();

        let req = DirectorySyncRequest {
            kind: DirectoryKind::UploadSync,
            env: Environment::Dev,
            tenant: "p11",
            service: "files",
            group: "p11-member-group",
            local_root: dir.path(),
            target_dir: None,
            remote_path_prefix: None,
            ignore_prefixes: &[],
            ignore_suffixes: &[],
            sync_mtime: false,
            keep_missing: false,
            keep_updated: false,
            integrity_kind: IntegrityKind::Etag,
            server_key: None,
        };
        let config = RuntimeConfig::default().with_base_url_override(server.uri());
        let mut ctx = TransferContext::new(reqwest::Client::new(), "tok".to_string(), None, 0);
        let report = sync(&req, &mut ctx, &config, None, None, 0).await.unwrap();

        assert_eq!(report.transferred, 0);
        assert_eq!(report.deleted, 1);
    }

    #[tokio::test]
    async fn sync_cache_invariant_table_gone_after_clean_completion() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();
        let cache_path = dir.path().join("cache.db");
        let mut transfer_cache = RequestCache::open(&cache_path).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/v1/p11/files/stream/.*$"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let req = DirectorySyncRequest {
            kind: DirectoryKind::UploadOnly,
            env: Environment::Dev,
            tenant: "p11",
            service: "files",
            group: "p11-member-group",
            local_root: dir.path(),
            target_dir: None,
            remote_path_prefix: None,
            ignore_prefixes: &[],
            ignore_suffixes: &[],
            sync_mtime: false,
            keep_missing: false,
            keep_updated: false,
            integrity_kind: IntegrityKind::Etag,
            server_key: None,
        };
        let config = RuntimeConfig::default().with_base_url_override(server.uri());
        let mut ctx = TransferContext::new(reqwest::Client::new(), "tok".to_string(), None, 0);
        let report = sync(&req, &mut ctx, &config, Some(&mut transfer_cache), None, 0)
            .await
            .unwrap();

        assert_eq!(report.transferred, 1);
        assert!(!transfer_cache.has_pending(dir.path()).unwrap());
    }
}
