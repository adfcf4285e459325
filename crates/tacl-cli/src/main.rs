//! Thin orchestrator binary: resolves identity, loads already-issued tokens from the
//! session store, and calls straight into `tacl_api`. Nothing here prompts interactively beyond
//! reading flags/environment - the core itself never prompts.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tacl_api::cache::{CacheKind, RequestCache};
use tacl_api::crypto::{self, ServerPublicKey};
use tacl_api::download::{DownloadRequest, Downloader};
use tacl_api::environment::Environment;
use tacl_api::logging::{self, LogConfig};
use tacl_api::runtime_config::RuntimeConfig;
use tacl_api::token::auth::{AuthClient, TwoFactorMethod};
use tacl_api::token::store::{ConfigStore, SessionStore};
use tacl_api::transport::{self, DirectoryKind, DirectorySyncRequest, IntegrityKind, TransferContext};
use tacl_api::upload::{UploadRequest, Uploader};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EnvArg {
    Prod,
    Alt,
    Test,
    EcProd,
    EcTest,
    Dev,
}

impl From<EnvArg> for Environment {
    fn from(value: EnvArg) -> Self {
        match value {
            EnvArg::Prod => Environment::Prod,
            EnvArg::Alt => Environment::Alt,
            EnvArg::Test => Environment::Test,
            EnvArg::EcProd => Environment::EcProd,
            EnvArg::EcTest => Environment::EcTest,
            EnvArg::Dev => Environment::Dev,
        }
    }
}

#[derive(Parser)]
#[command(name = "tacl", about = "Resumable file transfer client for a tenant-scoped remote service")]
struct Cli {
    /// Tenant identifier (pnum), e.g. "p11".
    tenant: String,

    #[arg(long, value_enum, default_value = "prod")]
    env: EnvArg,

    /// Remote service name this tenant exposes (export/import namespace).
    #[arg(long, default_value = "export")]
    service: String,

    /// Token kind to read from the session store ("import" for uploads, "export" for downloads
    /// is the usual pairing, but any caller-chosen kind is accepted).
    #[arg(long)]
    token_kind: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a single local file.
    Upload {
        local_path: PathBuf,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        remote_path: Option<String>,
        #[arg(long)]
        encrypt: bool,
        #[arg(long)]
        sync_mtime: bool,
        #[arg(long)]
        force_resumable: bool,
    },
    /// Upload a local directory tree, one-directional (no deletes).
    UploadSync {
        local_root: PathBuf,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        remote_path: Option<String>,
        #[arg(long, value_delimiter = ',')]
        ignore_prefix: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        ignore_suffix: Vec<String>,
        #[arg(long)]
        sync_mtime: bool,
        #[arg(long)]
        keep_missing: bool,
        #[arg(long)]
        keep_updated: bool,
        #[arg(long)]
        by_mtime: bool,
        #[arg(long)]
        no_cache: bool,
    },
    /// Download a single remote file.
    Download {
        resource: String,
        local_path: PathBuf,
        #[arg(long)]
        sync_mtime: bool,
        #[arg(long)]
        encrypt: bool,
    },
    /// Mirror a remote directory tree into a local one.
    DownloadSync {
        local_root: PathBuf,
        #[arg(long)]
        target_dir: Option<PathBuf>,
        #[arg(long)]
        remote_path: Option<String>,
        #[arg(long, value_delimiter = ',')]
        ignore_prefix: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        ignore_suffix: Vec<String>,
        #[arg(long)]
        sync_mtime: bool,
        #[arg(long)]
        keep_missing: bool,
        #[arg(long)]
        keep_updated: bool,
        #[arg(long)]
        by_mtime: bool,
        #[arg(long)]
        no_cache: bool,
    },
    /// Show a server-side resumable upload for a basename, if any.
    ResumeList { basename: String },
    /// Abandon a server-side resumable upload (deletes the partial on the server).
    ResumeDelete { basename: String, id: String },
    /// Delete a remote resource.
    Delete {
        resource: String,
        #[arg(long)]
        group: Option<String>,
    },
    /// List a remote directory (non-recursive, one page).
    List {
        #[arg(default_value = "")]
        path: String,
    },
    /// Print the four request-cache files' table overview for this tenant.
    CacheShow,
    /// Drop every pending cache table for this tenant (all four logical caches).
    CacheClear,
    /// Print the persisted session pair for (env, tenant, token_kind).
    SessionShow,
    /// Clear the entire persisted session file.
    SessionClear,
    /// Exchange credentials for a token pair and persist it to the session store.
    Register {
        #[command(subcommand)]
        method: RegisterMethod,
    },
}

#[derive(Subcommand)]
enum RegisterMethod {
    /// Long-lived API key, `Authorization: Bearer <api_key>`.
    Basic {
        api_key: String,
        #[arg(long, default_value = "import")]
        kind: String,
    },
    /// Username/password/one-time-password challenge.
    TwoFactor {
        user_name: String,
        password: String,
        otp: String,
        #[arg(long, value_enum, default_value = "tsd")]
        via: TwoFactorVia,
        #[arg(long, default_value = "import")]
        kind: String,
    },
    /// Link id (+ optional secret challenge) issued out-of-band.
    Instance {
        link_id: String,
        #[arg(long)]
        secret_challenge: Option<String>,
        #[arg(long, default_value = "import")]
        kind: String,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TwoFactorVia {
    Tsd,
    Iam,
}

impl From<TwoFactorVia> for TwoFactorMethod {
    fn from(value: TwoFactorVia) -> Self {
        match value {
            TwoFactorVia::Tsd => TwoFactorMethod::Tsd,
            TwoFactorVia::Iam => TwoFactorMethod::Iam,
        }
    }
}

fn progress_bar(total: u64, label: &str) -> ProgressBar {
    let bar = ProgressBar::new(total.max(1));
    // A division-by-zero in bar arithmetic is swallowed rather than surfaced - `indicatif`
    // already treats a zero-length template computation as a no-op, so no extra guard is needed
    // beyond clamping `total` above.
    if let Ok(style) = ProgressStyle::with_template(
        "{prefix} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    ) {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.set_prefix(label.to_string());
    bar
}

fn session_store() -> Result<SessionStore> {
    let path = SessionStore::default_path().context("resolving session store path")?;
    Ok(SessionStore::new(path))
}

fn config_store() -> Result<ConfigStore> {
    let path = ConfigStore::default_path().context("resolving config store path")?;
    Ok(ConfigStore::new(path))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The refresh window is centered on the access token's own `exp` claim; a token this
/// client can't parse is treated as due for refresh right now.
fn refresh_target_for(access: &str) -> i64 {
    tacl_api::token::claims::decode_claims(access)
        .map(|claims| claims.exp)
        .unwrap_or_else(now_unix)
}

/// Resolve the access token to use for this invocation: an existing session pair, refreshed if
/// it is inside its window. Bails with a clear message if no session exists - `register` is how
/// a caller obtains one.
async fn resolve_access(
    env: Environment,
    tenant: &str,
    kind: &str,
    config: &RuntimeConfig,
) -> Result<(String, Option<String>)> {
    let session = session_store()?;
    let pair = session
        .get(env, tenant, kind)?
        .context("no session for this (environment, tenant, kind); run `tacl <tenant> register ...` first")?;

    let auth = AuthClient::new(reqwest::Client::new());
    let now = now_unix();
    let refresh_target = refresh_target_for(&pair.access);
    let outcome = tacl_api::token::policy::maybe_refresh(
        &auth,
        &session,
        env,
        tenant,
        kind,
        Some(&pair.access),
        pair.refresh.as_deref(),
        refresh_target,
        now,
        config.refresh_before,
        config.refresh_after,
        false,
    )
    .await;
    let access = outcome.access.unwrap_or(pair.access);
    Ok((access, outcome.refresh))
}

/// Best-effort reachability check run before any API call. Skipped entirely when an
/// `https_proxy`/`HTTPS_PROXY` is configured, since a proxy can reach hosts a direct TCP
/// connect from here cannot. `dev` is never probed - it's a local port, not a real deployment.
async fn check_api_connectivity(env: Environment) -> Result<()> {
    if env == Environment::Dev {
        return Ok(());
    }
    if std::env::var_os("https_proxy").is_some() || std::env::var_os("HTTPS_PROXY").is_some() {
        tracing::debug!(target: "tacl", "skipping connectivity probe, proxy is set");
        return Ok(());
    }
    let host = env.host();
    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:443")
    };
    match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        tokio::net::TcpStream::connect(&addr),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        _ => anyhow::bail!(
            "the API environment hosted at {host} is not accessible from your current network connection"
        ),
    }
}

async fn maybe_server_key(
    http: &mut reqwest::Client,
    env: Environment,
    tenant: &str,
    access: &str,
    config: &RuntimeConfig,
    encrypt: bool,
) -> Result<Option<ServerPublicKey>> {
    if !encrypt {
        return Ok(None);
    }
    let key = crypto::fetch_server_key(http, env, tenant, access, config)
        .await
        .context("fetching server public key for encryption")?;
    Ok(Some(key))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = logging::init_logging(LogConfig::default())?;
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let env: Environment = cli.env.into();
    let tenant = cli.tenant.clone();
    check_api_connectivity(env).await?;
    let config = RuntimeConfig::load_from_path(
        &RuntimeConfig::default_path().unwrap_or_else(|| PathBuf::from("tacl-runtime.json")),
    )
    .unwrap_or_default();

    match cli.command {
        Command::Upload {
            local_path,
            group,
            remote_path,
            encrypt,
            sync_mtime,
            force_resumable,
        } => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "import".to_string());
            let (access, _) = resolve_access(env, &tenant, &kind, &config).await?;
            let mut http = reqwest::Client::new();
            let server_key = maybe_server_key(&mut http, env, &tenant, &access, &config, encrypt).await?;
            let group = group.unwrap_or_else(|| format!("{tenant}-member-group"));
            let basename = local_path
                .file_name()
                .and_then(|n| n.to_str())
                .context("local path has no file name")?;
            let resource = match &remote_path {
                Some(prefix) => format!("{group}/{prefix}/{basename}"),
                None => format!("{group}/{basename}"),
            };
            let mtime = if sync_mtime {
                Some(
                    tokio::fs::metadata(&local_path)
                        .await?
                        .modified()?
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs_f64(),
                )
            } else {
                None
            };

            let size = tokio::fs::metadata(&local_path).await?.len();
            let bar = progress_bar(size, "upload");
            let req = UploadRequest {
                env,
                tenant: &tenant,
                service: &cli.service,
                resource: &resource,
                group: &group,
                local_path: &local_path,
                access_token: &access,
                mtime,
                server_key: server_key.as_ref(),
                force_resumable,
                resumable_id: None,
            };
            let mut uploader = Uploader::new(http);
            let outcome = uploader.upload(&req, &config).await?;
            bar.finish_with_message("done");
            if let Some(id) = outcome.resumable_id {
                println!("resumable id: {id}");
            }
            Ok(())
        }

        Command::UploadSync {
            local_root,
            group,
            remote_path,
            ignore_prefix,
            ignore_suffix,
            sync_mtime,
            keep_missing,
            keep_updated,
            by_mtime,
            no_cache,
        } => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "import".to_string());
            let (access, refresh) = resolve_access(env, &tenant, &kind, &config).await?;
            let group = group.unwrap_or_else(|| format!("{tenant}-member-group"));
            let integrity_kind = if by_mtime { IntegrityKind::Mtime } else { IntegrityKind::Etag };

            let refresh_target = refresh_target_for(&access);
            let mut ctx = TransferContext::new(reqwest::Client::new(), access, refresh, refresh_target);
            let req = DirectorySyncRequest {
                kind: DirectoryKind::UploadSync,
                env,
                tenant: &tenant,
                service: &cli.service,
                group: &group,
                local_root: &local_root,
                target_dir: None,
                remote_path_prefix: remote_path.as_deref(),
                ignore_prefixes: &ignore_prefix,
                ignore_suffixes: &ignore_suffix,
                sync_mtime,
                keep_missing,
                keep_updated,
                integrity_kind,
                server_key: None,
            };

            let mut transfer_cache = cache_handle(env, &tenant, CacheKind::UploadQueue, no_cache)?;
            let mut delete_cache = cache_handle(env, &tenant, CacheKind::UploadDeleteQueue, no_cache)?;
            let report = transport::sync(
                &req,
                &mut ctx,
                &config,
                transfer_cache.as_mut(),
                delete_cache.as_mut(),
                now_unix(),
            )
            .await?;
            print_report(&report);
            Ok(())
        }

        Command::Download {
            resource,
            local_path,
            sync_mtime,
            encrypt,
        } => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "export".to_string());
            let (access, _) = resolve_access(env, &tenant, &kind, &config).await?;
            let mut http = reqwest::Client::new();
            let server_key = maybe_server_key(&mut http, env, &tenant, &access, &config, encrypt).await?;

            let bar = progress_bar(0, "download");
            let req = DownloadRequest {
                env,
                tenant: &tenant,
                service: &cli.service,
                resource: &resource,
                local_path: &local_path,
                access_token: &access,
                previous_etag: None,
                sync_mtime,
                server_key: server_key.as_ref(),
            };
            let mut downloader = Downloader::new(http);
            let outcome = downloader.download(&req, &config).await?;
            bar.finish_with_message("done");
            if outcome.is_directory {
                println!("{resource} is a directory; use download-sync instead");
            }
            Ok(())
        }

        Command::DownloadSync {
            local_root,
            target_dir,
            remote_path,
            ignore_prefix,
            ignore_suffix,
            sync_mtime,
            keep_missing,
            keep_updated,
            by_mtime,
            no_cache,
        } => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "export".to_string());
            let (access, refresh) = resolve_access(env, &tenant, &kind, &config).await?;
            let integrity_kind = if by_mtime { IntegrityKind::Mtime } else { IntegrityKind::Etag };

            let refresh_target = refresh_target_for(&access);
            let mut ctx = TransferContext::new(reqwest::Client::new(), access, refresh, refresh_target);
            let req = DirectorySyncRequest {
                kind: DirectoryKind::DownloadSync,
                env,
                tenant: &tenant,
                service: &cli.service,
                group: "",
                local_root: &local_root,
                target_dir: target_dir.as_deref(),
                remote_path_prefix: remote_path.as_deref(),
                ignore_prefixes: &ignore_prefix,
                ignore_suffixes: &ignore_suffix,
                sync_mtime,
                keep_missing,
                keep_updated,
                integrity_kind,
                server_key: None,
            };

            let mut transfer_cache = cache_handle(env, &tenant, CacheKind::DownloadQueue, no_cache)?;
            let mut delete_cache = cache_handle(env, &tenant, CacheKind::DownloadDeleteQueue, no_cache)?;
            let report = transport::sync(
                &req,
                &mut ctx,
                &config,
                transfer_cache.as_mut(),
                delete_cache.as_mut(),
                now_unix(),
            )
            .await?;
            print_report(&report);
            Ok(())
        }

        Command::ResumeList { basename } => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "import".to_string());
            let (access, _) = resolve_access(env, &tenant, &kind, &config).await?;
            let mut uploader = Uploader::new(reqwest::Client::new());
            let found = uploader
                .find_resumable(env, &tenant, &cli.service, &basename, None, None, &config)
                .await?;
            match found {
                Some(record) => println!("{record:#?}"),
                None => println!("nothing to resume for {basename}"),
            }
            let _ = access;
            Ok(())
        }

        Command::ResumeDelete { basename, id } => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "import".to_string());
            let (access, _) = resolve_access(env, &tenant, &kind, &config).await?;
            let url = format!(
                "{}/{}/{}/resumables/{}?id={}",
                config.api_base(env),
                tenant,
                cli.service,
                basename,
                id
            );
            let mut client = reqwest::Client::new();
            let outcome = tacl_api::retry::execute(
                &mut client,
                |c| c.delete(&url).bearer_auth(&access),
                &config,
            )
            .await?;
            if !outcome.response.status().is_success() {
                return Err(tacl_api::retry::into_error(outcome.response).await.into());
            }
            println!("resumable {id} deleted");
            Ok(())
        }

        Command::Delete { resource, group } => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "import".to_string());
            let (access, _) = resolve_access(env, &tenant, &kind, &config).await?;
            let group = group.unwrap_or_else(|| format!("{tenant}-member-group"));
            let url = format!(
                "{}/{}/{}/stream/{}/{}",
                config.api_base(env),
                tenant,
                cli.service,
                group,
                resource
            );
            let mut client = reqwest::Client::new();
            let outcome = tacl_api::retry::execute(
                &mut client,
                |c| c.delete(&url).bearer_auth(&access),
                &config,
            )
            .await?;
            if !outcome.response.status().is_success() {
                return Err(tacl_api::retry::into_error(outcome.response).await.into());
            }
            println!("{resource} deleted");
            Ok(())
        }

        Command::List { path } => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "export".to_string());
            let (access, _) = resolve_access(env, &tenant, &kind, &config).await?;
            let url = format!(
                "{}/{}/{}/export{}{}",
                config.api_base(env),
                tenant,
                cli.service,
                if path.is_empty() { "" } else { "/" },
                path
            );
            let mut client = reqwest::Client::new();
            let page_size = config.list_page_size.to_string();
            let outcome = tacl_api::retry::execute(
                &mut client,
                |c| c.get(&url).bearer_auth(&access).query(&[("per_page", page_size.as_str())]),
                &config,
            )
            .await?;
            if !outcome.response.status().is_success() {
                return Err(tacl_api::retry::into_error(outcome.response).await.into());
            }
            let body: serde_json::Value = outcome.response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }

        Command::CacheShow => {
            for kind in [
                CacheKind::UploadQueue,
                CacheKind::DownloadQueue,
                CacheKind::UploadDeleteQueue,
                CacheKind::DownloadDeleteQueue,
            ] {
                let Some(path) = RequestCache::default_path(env, &tenant, kind) else {
                    continue;
                };
                if !path.exists() {
                    println!("{}: no file yet", kind.filename());
                    continue;
                }
                let mut cache = RequestCache::open(&path)?;
                let overview = cache.overview()?;
                println!("{}:", kind.filename());
                for entry in overview {
                    println!(
                        "  {} (created {} .. {})",
                        entry.table,
                        entry.min_created_at.as_deref().unwrap_or("?"),
                        entry.max_created_at.as_deref().unwrap_or("?")
                    );
                }
            }
            Ok(())
        }

        Command::CacheClear => {
            for kind in [
                CacheKind::UploadQueue,
                CacheKind::DownloadQueue,
                CacheKind::UploadDeleteQueue,
                CacheKind::DownloadDeleteQueue,
            ] {
                let Some(path) = RequestCache::default_path(env, &tenant, kind) else {
                    continue;
                };
                if !path.exists() {
                    continue;
                }
                let mut cache = RequestCache::open(&path)?;
                cache.destroy_all()?;
            }
            println!("all pending cache tables cleared");
            Ok(())
        }

        Command::SessionShow => {
            let kind = cli.token_kind.clone().unwrap_or_else(|| "import".to_string());
            let session = session_store()?;
            match session.get(env, &tenant, &kind)? {
                Some(pair) => {
                    println!("access:  {}", pair.access);
                    println!("refresh: {}", pair.refresh.as_deref().unwrap_or("(none)"));
                    println!("expired: {}", session.is_expired(env, &tenant, &kind, now_unix()));
                }
                None => println!("no session for ({env}, {tenant}, {kind})"),
            }
            Ok(())
        }

        Command::SessionClear => {
            session_store()?.clear()?;
            println!("session store cleared");
            Ok(())
        }

        Command::Register { method } => {
            let auth = AuthClient::new(reqwest::Client::new());
            let session = session_store()?;
            let (kind, pair) = match method {
                RegisterMethod::Basic { api_key, kind } => {
                    config_store()?.set(env, &tenant, &api_key)?;
                    let pair = auth.basic_auth(env, &tenant, &kind, &api_key).await?;
                    (kind, pair)
                }
                RegisterMethod::TwoFactor {
                    user_name,
                    password,
                    otp,
                    via,
                    kind,
                } => {
                    let pair = auth
                        .two_factor_auth(env, &tenant, &kind, via.into(), &user_name, &password, &otp)
                        .await?
                        .context("credentials rejected")?;
                    (kind, pair)
                }
                RegisterMethod::Instance {
                    link_id,
                    secret_challenge,
                    kind,
                } => {
                    let pair = auth
                        .instance_auth(env, &tenant, &kind, &link_id, secret_challenge.as_deref())
                        .await?;
                    (kind, pair)
                }
            };
            session.update(env, &tenant, &kind, &pair.access, pair.refresh.as_deref())?;
            println!("session stored for ({env}, {tenant}, {kind})");
            Ok(())
        }
    }
}

fn cache_handle(
    env: Environment,
    tenant: &str,
    kind: CacheKind,
    disabled: bool,
) -> Result<Option<RequestCache>> {
    if disabled {
        return Ok(None);
    }
    let path = RequestCache::default_path(env, tenant, kind)
        .context("resolving request cache path")?;
    Ok(Some(RequestCache::open(&path)?))
}

fn print_report(report: &tacl_api::transport::SyncReport) {
    println!(
        "transferred {} deleted {} skipped {}",
        report.transferred,
        report.deleted,
        report.skipped.len()
    );
    for name in &report.skipped {
        println!("  skipped: {name}");
    }
}
