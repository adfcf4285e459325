//! Core transfer engine for a tenant-scoped remote file service: resumable chunked
//! uploads, ranged resumable downloads, directory sync with an SQLite-backed work cache, the
//! token access/refresh lifecycle, and the retry/reconnect wrapper every remote call goes
//! through.
//!
//! Argument parsing, interactive credential prompting, YAML-backed user config display, and the
//! one-shot registration flows are external collaborators that live in `tacl-cli` and call into
//! the operations here with already-resolved identifiers, paths, and tokens. Nothing in this
//! crate prompts a user.

pub mod cache;
pub mod chunk;
pub mod crypto;
pub mod download;
pub mod environment;
pub mod error;
pub mod logging;
pub mod retry;
pub mod runtime_config;
pub mod token;
pub mod transport;
pub mod upload;

pub use environment::Environment;
pub use error::{TaclError, TaclResult};
pub use runtime_config::RuntimeConfig;
