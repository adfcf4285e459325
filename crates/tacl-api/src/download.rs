//! Single-file downloader: `HEAD` to learn size/etag/content-type, then a ranged `GET`
//! that resumes a local partial when its etag still matches.

use crate::crypto::{EncryptionContext, ServerPublicKey};
use crate::environment::Environment;
use crate::error::TaclError;
use crate::retry::{self};
use crate::runtime_config::RuntimeConfig;
use filetime::{set_file_mtime, FileTime};
use futures::StreamExt;
use salsa20::cipher::StreamCipher;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub struct DownloadRequest<'a> {
    pub env: Environment,
    pub tenant: &'a str,
    pub service: &'a str,
    pub resource: &'a str,
    pub local_path: &'a Path,
    pub access_token: &'a str,
    pub previous_etag: Option<&'a str>,
    pub sync_mtime: bool,
    pub server_key: Option<&'a ServerPublicKey>,
}

#[derive(Debug, Default)]
pub struct DownloadOutcome {
    pub etag: Option<String>,
    pub is_directory: bool,
}

fn export_url(env: Environment, tenant: &str, service: &str, resource: &str, config: &RuntimeConfig) -> String {
    format!("{}/{}/{}/export/{}", config.api_base(env), tenant, service, resource)
}

pub struct Downloader {
    http: reqwest::Client,
}

impl Downloader {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// The client this downloader is currently using, possibly rebuilt by the retry wrapper
    /// since construction (see [`crate::upload::Uploader::client`]).
    pub fn client(&self) -> reqwest::Client {
        self.http.clone()
    }

    pub async fn download(
        &mut self,
        req: &DownloadRequest<'_>,
        config: &RuntimeConfig,
    ) -> Result<DownloadOutcome, TaclError> {
        let url = export_url(req.env, req.tenant, req.service, req.resource, config);

        let head = retry::execute(
            &mut self.http,
            |client| client.head(&url).bearer_auth(req.access_token),
            config,
        )
        .await?;
        if !head.response.status().is_success() {
            return Err(retry::into_error(head.response).await);
        }

        let content_type = header_str(&head.response, "content-type");
        if content_type.as_deref() == Some("directory") {
            return Ok(DownloadOutcome {
                etag: None,
                is_directory: true,
            });
        }
        let etag = header_str(&head.response, "etag");
        let remote_mtime = header_str(&head.response, "modified-time")
            .and_then(|s| s.parse::<f64>().ok());
        let content_length = header_str(&head.response, "content-length")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let resuming = req.previous_etag.is_some()
            && req.previous_etag == etag.as_deref()
            && tokio::fs::metadata(req.local_path).await.is_ok();

        let start_offset = if resuming {
            tokio::fs::metadata(req.local_path).await?.len()
        } else {
            0
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(req.local_path)
            .await?;

        let mut cipher = req
            .server_key
            .map(|_| EncryptionContext::generate())
            .map(|ctx| (ctx.clone(), ctx.cipher()));

        let range_header = format!("bytes={start_offset}-");
        let nonce_headers = cipher.as_ref().map(|(ctx, _)| ctx.clone());
        let outcome = retry::execute(
            &mut self.http,
            |client| {
                let mut builder = client
                    .get(&url)
                    .bearer_auth(req.access_token)
                    .header("Range", &range_header);
                if let (Some(server_key), Some(ctx)) = (req.server_key, &nonce_headers) {
                    if let Ok(headers) = ctx.seal_headers(server_key, content_length) {
                        builder = builder
                            .header(crate::crypto::HEADER_NONCE, &headers.nonce)
                            .header(crate::crypto::HEADER_KEY, &headers.key)
                            .header(crate::crypto::HEADER_CHUNKSIZE, headers.chunk_size.to_string());
                    }
                }
                builder
            },
            config,
        )
        .await?;

        if !outcome.response.status().is_success() {
            return Err(retry::into_error(outcome.response).await);
        }

        let mut stream = outcome.response.bytes_stream();
        while let Some(next) = stream.next().await {
            let mut bytes = next.map_err(TaclError::Http)?.to_vec();
            if let Some((_, cipher)) = cipher.as_mut() {
                cipher.apply_keystream(&mut bytes);
            }
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        drop(file);

        if req.sync_mtime {
            if let Some(mtime) = remote_mtime {
                set_file_mtime(req.local_path, FileTime::from_unix_time(mtime as i64, 0))
                    .map_err(|err| TaclError::Other(format!("failed to set mtime: {err}")))?;
            }
        }

        Ok(DownloadOutcome {
            etag,
            is_directory: false,
        })
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
