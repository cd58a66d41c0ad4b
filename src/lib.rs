//! # cryptgate
//!
//! A controlled-access download service for a federated archive of
//! Crypt4GH-encrypted files.
//!
//! ## Overview
//!
//! Callers authenticate with OAuth2/JWT bearer tokens carrying GA4GH
//! Passport visas. The service validates tokens against the OIDC provider,
//! evaluates each visa against a pinned federation of trusted issuers, maps
//! the surviving `ControlledAccessGrants` to datasets known to the metadata
//! store, and streams file bytes out of the archive — decrypted on the fly
//! or as raw Crypt4GH, full or windowed by decrypted coordinates.
//!
//! ## Architecture
//!
//! - [`config`] - configuration flags and environment overrides
//! - [`error`] - error taxonomy mapped to HTTP statuses
//! - [`auth`] - token verification, passport/visa evaluation, middleware
//! - [`session`] - TTL-bounded session cache shortcutting re-validation
//! - [`crypt4gh`] - header sealing and the streaming readers
//! - [`db`] - metadata store (Postgres, plus an in-memory twin)
//! - [`storage`] - archive backends (POSIX, S3 behind the `s3` feature)
//! - [`handlers`] - HTTP surface: metadata, downloads, S3 compatibility
//!
//! Files live in the archive as header-less Crypt4GH bodies; the matching
//! header is persisted in the metadata store and prepended at read time.
//! Nothing is ever decrypted into stable storage.

pub mod auth;
pub mod config;
pub mod crypt4gh;
pub mod db;
pub mod error;
pub mod handlers;
pub mod session;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
