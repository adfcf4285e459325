//! Single-file uploader: streaming PUT for small files, chunked PATCH protocol with
//! resume for large ones.

use crate::chunk::{ResumableChunkReader, StreamingEncryption, streaming_body, verify_resume};
use crate::crypto::{self, EncryptionContext, ServerPublicKey};
use crate::environment::Environment;
use crate::error::TaclError;
use crate::retry::{self};
use crate::runtime_config::RuntimeConfig;
use serde::Deserialize;
use std::path::Path;

/// Everything a single upload needs that does not change between files in a directory transfer.
pub struct UploadRequest<'a> {
    pub env: Environment,
    pub tenant: &'a str,
    pub service: &'a str,
    pub resource: &'a str,
    pub group: &'a str,
    pub local_path: &'a Path,
    pub access_token: &'a str,
    pub mtime: Option<f64>,
    pub server_key: Option<&'a ServerPublicKey>,
    pub force_resumable: bool,
    pub resumable_id: Option<&'a str>,
}

/// What the caller should know after the upload completes, to thread into the next one.
#[derive(Debug, Default)]
pub struct UploadOutcome {
    pub resumable_id: Option<String>,
}

fn stream_url(env: Environment, tenant: &str, service: &str, resource: &str, config: &RuntimeConfig) -> String {
    format!("{}/{}/{}/stream/{}", config.api_base(env), tenant, service, resource)
}

fn resumables_url(env: Environment, tenant: &str, service: &str, basename: &str, config: &RuntimeConfig) -> String {
    format!(
        "{}/{}/{}/resumables/{}",
        config.api_base(env),
        tenant,
        service,
        basename
    )
}

/// Raw resumable-discovery response. An "empty shell" (no `id`) means nothing to resume.
#[derive(Debug, Deserialize)]
struct ResumableResponseRaw {
    id: Option<String>,
    chunk_size: Option<u64>,
    max_chunk: Option<u32>,
    previous_offset: Option<u64>,
    next_offset: Option<u64>,
    md5sum: Option<String>,
}

/// Server-side record of a partially uploaded file.
#[derive(Debug, Clone)]
pub struct ResumableRecord {
    pub id: String,
    pub chunk_size: u64,
    pub max_chunk: u32,
    pub previous_offset: u64,
    pub next_offset: u64,
    pub md5sum: String,
}

impl ResumableRecord {
    fn from_raw(raw: ResumableResponseRaw) -> Option<Self> {
        Some(Self {
            id: raw.id?,
            chunk_size: raw.chunk_size?,
            max_chunk: raw.max_chunk?,
            previous_offset: raw.previous_offset?,
            next_offset: raw.next_offset?,
            md5sum: raw.md5sum?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChunkAck {
    id: String,
    max_chunk: u32,
}

pub struct Uploader {
    http: reqwest::Client,
}

impl Uploader {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// The client this uploader is currently using, possibly rebuilt by the retry wrapper since
    /// construction. Callers driving a sequence of uploads (the directory transporter) read this
    /// back after each file so a pool rebuilt mid-directory isn't silently dropped.
    pub fn client(&self) -> reqwest::Client {
        self.http.clone()
    }

    /// Find an existing resumable for `basename`, keyed either by a known `resumable_id` or by
    /// `dir_key`. Returns `None` when the server reports nothing to resume.
    pub async fn find_resumable(
        &mut self,
        env: Environment,
        tenant: &str,
        service: &str,
        basename: &str,
        resumable_id: Option<&str>,
        dir_key: Option<&str>,
        config: &RuntimeConfig,
    ) -> Result<Option<ResumableRecord>, TaclError> {
        let url = resumables_url(env, tenant, service, basename, config);
        let outcome = retry::execute(
            &mut self.http,
            |client| {
                let mut req = client.get(&url);
                if let Some(id) = resumable_id {
                    req = req.query(&[("id", id)]);
                } else if let Some(key) = dir_key {
                    req = req.query(&[("key", key)]);
                }
                req
            },
            config,
        )
        .await?;

        if !outcome.response.status().is_success() {
            return Err(retry::into_error(outcome.response).await);
        }
        let raw: ResumableResponseRaw = outcome.response.json().await?;
        Ok(ResumableRecord::from_raw(raw))
    }

    /// Upload one file, choosing the streaming or resumable path by size and `force_resumable`.
    pub async fn upload(
        &mut self,
        req: &UploadRequest<'_>,
        config: &RuntimeConfig,
    ) -> Result<UploadOutcome, TaclError> {
        let metadata = tokio::fs::metadata(req.local_path).await.map_err(|_| {
            TaclError::LocalFileMissing(req.local_path.display().to_string())
        })?;
        let size = metadata.len();

        if size <= config.resumable_threshold_bytes && !req.force_resumable {
            self.upload_streaming(req, size, config).await
        } else {
            self.upload_resumable(req, config).await
        }
    }

    async fn upload_streaming(
        &mut self,
        req: &UploadRequest<'_>,
        size: u64,
        config: &RuntimeConfig,
    ) -> Result<UploadOutcome, TaclError> {
        let url = format!(
            "{}?group={}",
            stream_url(req.env, req.tenant, req.service, req.resource, config),
            req.group
        );

        // One key/nonce pair is generated for the whole file; its sealed headers are
        // re-derived and its keystream restarted on every attempt, since a retried PUT re-reads
        // the body from byte zero and the cipher must restart in lockstep.
        let ctx = req.server_key.map(|_| EncryptionContext::generate());
        if let (Some(ctx), Some(server_key)) = (ctx.as_ref(), req.server_key) {
            // Fail fast if sealing is broken, rather than silently falling back to an
            // unencrypted body inside the retry closure below.
            StreamingEncryption::from_context(ctx, server_key, size)?;
        }
        let body_path = req.local_path.to_path_buf();

        let outcome = retry::execute(
            &mut self.http,
            |client| {
                let encryption = match (ctx.as_ref(), req.server_key) {
                    (Some(ctx), Some(server_key)) => {
                        StreamingEncryption::from_context(ctx, server_key, size).ok()
                    }
                    _ => None,
                };
                let headers = encryption.as_ref().map(|e| e.headers.clone());
                let body = reqwest::Body::wrap_stream(streaming_body(body_path.clone(), 0, encryption));
                let mut builder = client
                    .put(&url)
                    .bearer_auth(req.access_token)
                    .body(body);
                if let Some(mtime) = req.mtime {
                    builder = builder.header("Modified-Time", mtime.to_string());
                }
                if let Some(h) = &headers {
                    builder = builder
                        .header("Content-Type", crypto::CONTENT_TYPE_ENCRYPTED)
                        .header(crypto::HEADER_NONCE, &h.nonce)
                        .header(crypto::HEADER_KEY, &h.key)
                        .header(crypto::HEADER_CHUNKSIZE, h.chunk_size.to_string());
                }
                builder
            },
            config,
        )
        .await?;

        if !outcome.response.status().is_success() {
            return Err(retry::into_error(outcome.response).await);
        }
        Ok(UploadOutcome::default())
    }

    async fn upload_resumable(
        &mut self,
        req: &UploadRequest<'_>,
        config: &RuntimeConfig,
    ) -> Result<UploadOutcome, TaclError> {
        let basename = req.resource.rsplit('/').next().unwrap_or(req.resource);
        let existing = self
            .find_resumable(
                req.env,
                req.tenant,
                req.service,
                basename,
                req.resumable_id,
                None,
                config,
            )
            .await?;

        let (start_offset, first_index, mut resumable_id) = match &existing {
            Some(record) => {
                verify_resume(
                    req.local_path,
                    record.previous_offset,
                    record.next_offset,
                    &record.md5sum,
                )
                .await?;
                (
                    record.next_offset,
                    record.max_chunk as usize + 1,
                    Some(record.id.clone()),
                )
            }
            None => (0, 1, req.resumable_id.map(str::to_string)),
        };

        let mut reader = ResumableChunkReader::open(
            req.local_path,
            config.chunk_size_bytes,
            start_offset,
            first_index,
            req.server_key.cloned(),
        )
        .await?;

        while let Some(chunk) = reader.next_chunk().await? {
            let url = stream_url(req.env, req.tenant, req.service, req.resource, config);
            let query: Vec<(&str, String)> = {
                let mut q = vec![("chunk", chunk.index.to_string())];
                if let Some(id) = &resumable_id {
                    q.push(("id", id.clone()));
                }
                q
            };
            let headers = chunk.headers.clone();
            let data = chunk.data.clone();

            let outcome = retry::execute(
                &mut self.http,
                |client| {
                    let mut builder = client
                        .patch(&url)
                        .query(&query)
                        .bearer_auth(req.access_token)
                        .body(data.clone());
                    if let Some(h) = &headers {
                        builder = builder
                            .header("Content-Type", crypto::CONTENT_TYPE_ENCRYPTED)
                            .header(crypto::HEADER_NONCE, &h.nonce)
                            .header(crypto::HEADER_KEY, &h.key)
                            .header(crypto::HEADER_CHUNKSIZE, h.chunk_size.to_string());
                    }
                    builder
                },
                config,
            )
            .await?;

            if !outcome.response.status().is_success() {
                return Err(retry::into_error(outcome.response).await);
            }
            let ack: ChunkAck = outcome.response.json().await?;
            if resumable_id.is_none() {
                tracing::info!(target: "upload", id = %ack.id, "resumable upload started");
            }
            resumable_id = Some(ack.id);
            // The server is authoritative: next index always derives from its acknowledged
            // max_chunk, never from a client-local counter.
            reader.set_next_index(ack.max_chunk as usize + 1);
        }

        let id = resumable_id
            .clone()
            .ok_or(TaclError::MissingResumableId)?;
        self.finalize(req, &id, config).await?;

        Ok(UploadOutcome {
            resumable_id: Some(id),
        })
    }

    async fn finalize(
        &mut self,
        req: &UploadRequest<'_>,
        resumable_id: &str,
        config: &RuntimeConfig,
    ) -> Result<(), TaclError> {
        let url = stream_url(req.env, req.tenant, req.service, req.resource, config);
        let query = [
            ("chunk", "end".to_string()),
            ("id", resumable_id.to_string()),
            ("group", req.group.to_string()),
        ];

        let outcome = retry::execute(
            &mut self.http,
            |client| {
                let mut builder = client.patch(&url).query(&query).bearer_auth(req.access_token);
                if let Some(mtime) = req.mtime {
                    builder = builder.header("Modified-Time", mtime.to_string());
                }
                builder
            },
            config,
        )
        .await?;

        if !outcome.response.status().is_success() {
            return Err(retry::into_error(outcome.response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn base_config(server: &MockServer) -> RuntimeConfig {
        RuntimeConfig::default().with_base_url_override(server.uri())
    }

    /// S1: a small file under the resumable threshold goes out as one `PUT` carrying the
    /// whole body, with no resumable ever created.
    #[tokio::test]
    async fn small_file_is_sent_as_a_single_put_with_the_whole_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/p11/export/stream/hello.txt"))
            .and(query_param("group", "p11-member-group"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hi\n").unwrap();
        let config = base_config(&server);

        let mut uploader = Uploader::new(reqwest::Client::new());
        let req = UploadRequest {
            env: Environment::Dev,
            tenant: "p11",
            service: "export",
            resource: "hello.txt",
            group: "p11-member-group",
            local_path: file.path(),
            access_token: "tok",
            mtime: None,
            server_key: None,
            force_resumable: false,
            resumable_id: None,
        };
        let outcome = uploader.upload(&req, &config).await.unwrap();
        assert!(outcome.resumable_id.is_none());
    }

    #[tokio::test]
    async fn resumable_discovery_returns_none_for_an_empty_shell() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/p11/export/resumables/hello.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let config = base_config(&server);
        let mut uploader = Uploader::new(reqwest::Client::new());
        let found = uploader
            .find_resumable(Environment::Dev, "p11", "export", "hello.bin", None, None, &config)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn resumable_discovery_returns_the_full_record_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/p11/export/resumables/hello.bin"))
            .and(query_param("id", "u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u1",
                "chunk_size": 50,
                "max_chunk": 1,
                "previous_offset": 0,
                "next_offset": 50,
                "md5sum": "deadbeef"
            })))
            .mount(&server)
            .await;

        let config = base_config(&server);
        let mut uploader = Uploader::new(reqwest::Client::new());
        let found = uploader
            .find_resumable(Environment::Dev, "p11", "export", "hello.bin", Some("u1"), None, &config)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "u1");
        assert_eq!(found.max_chunk, 1);
        assert_eq!(found.next_offset, 50);
    }

    /// S2: a fresh resumable upload sends chunks in order - the first `PATCH` omits `id`, every
    /// subsequent one carries the `id` the server assigned on the first response - then finalizes
    /// with `chunk=end`.
    #[tokio::test]
    async fn resumable_upload_sends_ordered_chunks_then_finalizes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/p11/export/resumables/big.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/p11/export/stream/big.bin"))
            .and(query_param("chunk", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "u1", "max_chunk": 1})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/p11/export/stream/big.bin"))
            .and(query_param("chunk", "2"))
            .and(query_param("id", "u1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "u1", "max_chunk": 2})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/p11/export/stream/big.bin"))
            .and(query_param("chunk", "end"))
            .and(query_param("id", "u1"))
            .and(query_param("group", "p11-member-group"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; 15]).unwrap();
        let mut config = base_config(&server);
        config.chunk_size_bytes = 10;

        let mut uploader = Uploader::new(reqwest::Client::new());
        let req = UploadRequest {
            env: Environment::Dev,
            tenant: "p11",
            service: "export",
            resource: "big.bin",
            group: "p11-member-group",
            local_path: file.path(),
            access_token: "tok",
            mtime: None,
            server_key: None,
            force_resumable: true,
            resumable_id: None,
        };
        let outcome = uploader.upload(&req, &config).await.unwrap();
        assert_eq!(outcome.resumable_id.as_deref(), Some("u1"));
    }

    /// S3: resuming picks up the next chunk index from the server's `max_chunk + 1`, never a
    /// client-local counter, and only sends the remaining chunks plus the finalize.
    #[tokio::test]
    async fn resume_after_crash_sends_only_remaining_chunks() {
        let server = MockServer::start().await;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; 15]).unwrap();
        // The mocked resumable's md5sum must match the real digest of the first 10 bytes,
        // computed the same way `verify_resume` does, not a literal placeholder.
        let expected_md5 = {
            use md5::{Digest, Md5};
            let mut hasher = Md5::new();
            hasher.update(vec![7u8; 10]);
            format!("{:x}", hasher.finalize())
        };
        Mock::given(method("GET"))
            .and(path("/v1/p11/export/resumables/big.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u1",
                "chunk_size": 10,
                "max_chunk": 1,
                "previous_offset": 0,
                "next_offset": 10,
                "md5sum": expected_md5
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/p11/export/stream/big.bin"))
            .and(query_param("chunk", "2"))
            .and(query_param("id", "u1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "u1", "max_chunk": 2})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1/p11/export/stream/big.bin"))
            .and(query_param("chunk", "end"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = base_config(&server);
        let mut uploader = Uploader::new(reqwest::Client::new());
        let req = UploadRequest {
            env: Environment::Dev,
            tenant: "p11",
            service: "export",
            resource: "big.bin",
            group: "p11-member-group",
            local_path: file.path(),
            access_token: "tok",
            mtime: None,
            server_key: None,
            force_resumable: true,
            resumable_id: None,
        };
        let outcome = uploader.upload(&req, &config).await.unwrap();
        assert_eq!(outcome.resumable_id.as_deref(), Some("u1"));
    }

    /// Property 4: an MD5 mismatch between the server's recorded chunk and the local file's
    /// bytes at the same offsets is fatal - no chunk is sent.
    #[tokio::test]
    async fn resume_with_mismatched_md5_is_fatal_and_sends_no_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/p11/export/resumables/big.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u1",
                "chunk_size": 10,
                "max_chunk": 1,
                "previous_offset": 0,
                "next_offset": 10,
                "md5sum": "deadbeefdeadbeefdeadbeefdeadbeef"
            })))
            .mount(&server)
            .await;
        // No PATCH mock mounted at all: any chunk request would be a 404 from wiremock and
        // fail the test outright, proving none was sent.

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; 15]).unwrap();
        let config = base_config(&server);

        let mut uploader = Uploader::new(reqwest::Client::new());
        let req = UploadRequest {
            env: Environment::Dev,
            tenant: "p11",
            service: "export",
            resource: "big.bin",
            group: "p11-member-group",
            local_path: file.path(),
            access_token: "tok",
            mtime: None,
            server_key: None,
            force_resumable: true,
            resumable_id: None,
        };
        let err = uploader.upload(&req, &config).await.unwrap_err();
        assert!(matches!(err, TaclError::ResumeIntegrityMismatch { .. }));
    }

    #[test]
    fn resumable_record_requires_every_field() {
        let raw = ResumableResponseRaw {
            id: Some("u1".into()),
            chunk_size: Some(1024),
            max_chunk: Some(1),
            previous_offset: Some(0),
            next_offset: None,
            md5sum: Some("abc".into()),
        };
        assert!(ResumableRecord::from_raw(raw).is_none());
    }
}
