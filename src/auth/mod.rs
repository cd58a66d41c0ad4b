//! Authentication: bearer tokens, GA4GH passports and the session shortcut.
//!
//! The middleware in [`middleware`] runs in front of every protected
//! handler. A session cookie that hits the cache skips straight through;
//! otherwise the access token is verified ([`token`]) against the OIDC
//! provider's keyset ([`jwks`]), the passport is fetched ([`oidc`]) and each
//! visa evaluated ([`visa`]) against the pinned issuer table ([`trust`]).

pub mod jwks;
pub mod middleware;
pub mod oidc;
pub mod token;
pub mod trust;
pub mod visa;

pub use jwks::KeysetCache;
pub use middleware::{auth_middleware, Datasets};
pub use oidc::OidcDetails;
pub use trust::TrustList;
