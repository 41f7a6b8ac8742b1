#![forbid(unsafe_code)]

//! HTTP/WebDAV/S3 operation engine backing a random-access remote
//! filesystem plugin: a fixed worker pool drains a bounded Handler Queue of
//! typed [`operation::OperationCore`]s, following redirects and probing
//! `OPTIONS` capability as needed, while [`file::File`] and
//! [`filesystem::Filesystem`] expose the host-facing Open/Read/Write/Stat
//! surface on top of it.

/// The shared process runtime: HTTP client, queues, worker pool.
pub use crate::runtime::{Runtime, RuntimeConfig};
/// The per-open-file state machine.
pub use crate::file::File;
/// The per-endpoint non-file operation handle.
pub use crate::filesystem::Filesystem;
/// Request/connection callout traits and the no-op header callout.
pub use crate::callout::{CalloutOutcome, ConnectionCallout, HeaderCallout, HeaderPair, NoopHeaderCallout};
/// S3 SigV4 request signer, usable as a `HeaderCallout`.
pub use crate::signature::S3Signer;
/// S3 credentials for the signer.
pub use crate::credentials::{AccessKeyId, AccessKeySecret, Credentials};
/// Closed error-kind enum and the error type every fallible call returns.
pub use crate::error::{Error, ErrorKind};
/// Public result/option types exchanged with the host.
pub use crate::types::{
    ChecksumAlgorithm, ChecksumResult, DirEntry, OpenFlags, PgReadInfo, StatInfo, VectorReadInfo,
    VectorReadPart,
};

mod callout;
mod constants;
mod credentials;
mod error;
mod file;
mod filesystem;
mod header;
mod multipart;
mod operation;
mod queue;
mod runtime;
mod signature;
mod types;
mod verbcache;
mod worker;
