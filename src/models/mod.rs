//! Data model: the persisted OAuth request/session rows and the sealed-token
//! view of a session that handlers work with.

mod oauth;

pub use oauth::{MobileFlow, OAuthRequest, OAuthSession, TokenResponse};
