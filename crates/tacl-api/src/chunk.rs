//! Lazy, resumable, optionally verifying, optionally encrypting byte-stream producer over a
//! local file.
//!
//! Two shapes share the same underlying file-reading primitive:
//! - [`ResumableChunkReader`] yields one discrete, fully-buffered chunk at a time (the unit the
//!   resumable PATCH protocol sends per request), each with its own fresh encryption headers.
//! - [`streaming_body`] turns the whole remaining file into a single `futures::Stream` of byte
//!   buffers for the one-shot streaming PUT, encrypting with one continuing cipher across buffer
//!   boundaries (encryption context generated once per file, not once per buffer).

use crate::crypto::{EncryptionContext, EncryptionHeaders, ServerPublicKey};
use crate::error::TaclError;
use bytes::Bytes;
use futures::Stream;
use md5::{Digest, Md5};
use salsa20::XSalsa20;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Default internal read buffer for the streaming (non-chunked) path.
const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// Read `[previous_offset, next_offset)` from `path` and compare its MD5 against `server_md5`.
/// Fails fast - this is the "cannot resume" case; the caller must delete the server-side
/// resumable and restart rather than attempt to salvage the upload.
pub async fn verify_resume(
    path: &Path,
    previous_offset: u64,
    next_offset: u64,
    server_md5: &str,
) -> Result<(), TaclError> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(previous_offset)).await?;

    let mut remaining = next_offset.saturating_sub(previous_offset);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = (remaining as usize).min(buf.len());
        let read = file.read(&mut buf[..to_read]).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
    }
    let actual = format!("{:x}", hasher.finalize());

    if actual != server_md5 {
        return Err(TaclError::ResumeIntegrityMismatch {
            expected: server_md5.to_string(),
            actual,
        });
    }
    Ok(())
}

/// One fully-read chunk, optionally encrypted, with the headers to attach if so.
pub struct Chunk {
    pub index: usize,
    pub data: Vec<u8>,
    pub headers: Option<EncryptionHeaders>,
}

/// Yields discrete chunks of up to `chunk_size` bytes starting at `start_offset`, one at a time.
/// Each chunk that is encrypted gets its own freshly generated key/nonce pair.
pub struct ResumableChunkReader {
    file: File,
    chunk_size: u64,
    next_index: usize,
    server_key: Option<ServerPublicKey>,
}

impl ResumableChunkReader {
    pub async fn open(
        path: &Path,
        chunk_size: u64,
        start_offset: u64,
        first_index: usize,
        server_key: Option<ServerPublicKey>,
    ) -> Result<Self, TaclError> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(start_offset)).await?;
        Ok(Self {
            file,
            chunk_size,
            next_index: first_index,
            server_key,
        })
    }

    /// Override the index the next emitted chunk will carry. The resumable upload protocol
    /// derives this from the server's acknowledged `max_chunk` after every PATCH, never from a
    /// local counter.
    pub fn set_next_index(&mut self, index: usize) {
        self.next_index = index;
    }

    /// Read the next chunk, or `None` at EOF. Single-pass: once `None` is returned, this reader
    /// is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TaclError> {
        let mut buf = vec![0u8; self.chunk_size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let read = self.file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let headers = match &self.server_key {
            Some(server_key) => {
                let ctx = EncryptionContext::generate();
                ctx.encrypt_in_place(&mut buf);
                Some(ctx.seal_headers(server_key, filled as u64)?)
            }
            None => None,
        };

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Chunk {
            index,
            data: buf,
            headers,
        }))
    }
}

/// Encryption state shared across every buffer of a [`streaming_body`] call: one key/nonce pair,
/// one continuing XSalsa20 keystream.
pub struct StreamingEncryption {
    pub headers: EncryptionHeaders,
    cipher: XSalsa20,
}

impl StreamingEncryption {
    /// Generate one key/nonce pair for the whole file and seal it once.
    pub fn new(server_key: &ServerPublicKey, file_size: u64) -> Result<Self, TaclError> {
        let ctx = EncryptionContext::generate();
        Self::from_context(&ctx, server_key, file_size)
    }

    /// Rebuild the cipher (and re-seal the headers) from an already-generated context. Used when
    /// a streaming PUT is retried: the body has to be re-read and re-encrypted from the start, so
    /// the keystream must restart too, but the key/nonce stay fixed for the whole file.
    pub fn from_context(
        ctx: &EncryptionContext,
        server_key: &ServerPublicKey,
        file_size: u64,
    ) -> Result<Self, TaclError> {
        let headers = ctx.seal_headers(server_key, file_size)?;
        let cipher = ctx.cipher();
        Ok(Self { headers, cipher })
    }

    fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

/// Build a `futures::Stream` over the remainder of `path` starting at `start_offset`, suitable
/// for handing to `reqwest::Body::wrap_stream` as the streaming PUT body. When `encryption` is
/// `Some`, every buffer is encrypted with the same continuing keystream.
pub fn streaming_body(
    path: impl AsRef<Path> + Send + 'static,
    start_offset: u64,
    encryption: Option<StreamingEncryption>,
) -> impl Stream<Item = std::io::Result<Bytes>> {
    futures::stream::try_unfold(
        StreamState::Pending {
            path,
            start_offset,
            encryption,
        },
        move |state| async move {
            let (mut file, mut encryption) = match state {
                StreamState::Pending {
                    path,
                    start_offset,
                    encryption,
                } => {
                    let mut file = File::open(path.as_ref()).await?;
                    file.seek(SeekFrom::Start(start_offset)).await?;
                    (file, encryption)
                }
                StreamState::Open { file, encryption } => (file, encryption),
            };

            let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
            let mut filled = 0usize;
            // A single read() can return short of a full buffer without being EOF; loop
            // until we have a full buffer or hit EOF.
            loop {
                let read = file.read(&mut buf[filled..]).await?;
                if read == 0 {
                    break;
                }
                filled += read;
                if filled == buf.len() {
                    break;
                }
            }
            if filled == 0 {
                return Ok(None);
            }
            buf.truncate(filled);
            if let Some(enc) = encryption.as_mut() {
                enc.apply(&mut buf);
            }

            Ok(Some((Bytes::from(buf), StreamState::Open { file, encryption })))
        },
    )
}

enum StreamState<P> {
    Pending {
        path: P,
        start_offset: u64,
        encryption: Option<StreamingEncryption>,
    },
    Open {
        file: File,
        encryption: Option<StreamingEncryption>,
    },
}
