//! Backend endpoint paths and persistence keys
//!
//! Paths are relative to the configured API base URL.

/// Email/password login
pub const LOGIN_PATH: &str = "/auth/login";

/// Account registration
pub const REGISTER_PATH: &str = "/auth/register";

/// Token refresh, body `{ "refreshToken": "..." }`
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Key under which the serialized credential record is persisted
pub const SESSION_KEY: &str = "session";
