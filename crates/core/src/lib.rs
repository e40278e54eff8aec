#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared vocabulary for `cardforge` (client identity, sessions, artifact
//! naming, auth tokens, quota limits).

/// Login credentials and base64 token handling.
pub mod auth;
/// Per-session quota limits and remaining counts.
pub mod limits;
/// Client identity, session identifiers and artifact naming.
pub mod session;
/// Request payload validation shared by the intake API.
pub mod validate;

pub use auth::{AuthError, Authenticator, TokenPayload};
pub use limits::{QuotaKind, QuotaLimits, Remaining};
pub use session::{ArtifactKind, ClientId, SessionId};
