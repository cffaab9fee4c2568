//! Request-time protocol logic for the authorization endpoint and its
//! upstream federation sub-protocols.

pub mod authorize;
pub mod callback;
pub mod codec;
pub mod csrf_cookie;
pub mod downstream_session;
pub mod oauth_error;
pub mod provider_engine;
pub mod security_values;
pub mod state_param;
pub mod upstream;

/// Header carrying the plaintext username for direct-credential logins.
pub const AUTHORIZE_USERNAME_HEADER_NAME: &str = "fedgate-username";
/// Header carrying the plaintext password for direct-credential logins.
pub const AUTHORIZE_PASSWORD_HEADER_NAME: &str = "fedgate-password";

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";
pub const SCOPE_REQUEST_AUDIENCE: &str = "fedgate:request-audience";

pub const ID_TOKEN_SUBJECT_CLAIM: &str = "sub";
pub const ID_TOKEN_ISSUER_CLAIM: &str = "iss";
