//! HTTP handlers: the Web/Mobile Flow Orchestrator's login/callback/logout/
//! refresh state machine plus the client-metadata/JWKS discovery endpoints.

pub mod oauth;
