//! Player identity for a connection.
//!
//! Authentication is an external collaborator: it hands the coordinator a
//! stable `player_id` and a display name. [`AnonymousAuth`] accepts the
//! connection URL parameters as-is, sanitized, and marks the player as a
//! guest.

use serde::Deserialize;
use thiserror::Error;

/// Longest display name kept, in characters.
pub const MAX_USERNAME_CHARS: usize = 32;

/// Longest accepted `player_id`.
pub const MAX_PLAYER_ID_LEN: usize = 64;

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable identifier, unique within a game
    pub player_id: String,
    /// Display name; informational only
    pub username: String,
    /// Authenticated account id, if any
    pub user_id: Option<String>,
    /// Anonymous player
    pub is_guest: bool,
}

impl Identity {
    /// Guest identity with sanitized fields.
    ///
    /// `fallback_id` is used when `player_id` is missing or unusable.
    pub fn guest(player_id: Option<&str>, username: Option<&str>, fallback_id: &str) -> Self {
        let player_id = player_id
            .and_then(sanitize_player_id)
            .unwrap_or_else(|| fallback_id.to_string());
        let username = sanitize_username(username.unwrap_or_default(), &player_id);
        Self { player_id, username, user_id: None, is_guest: true }
    }
}

/// Connection URL parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectParams {
    /// Stable player id
    #[serde(default)]
    pub player_id: Option<String>,
    /// Display name
    #[serde(default)]
    pub username: Option<String>,
}

/// Authentication failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credentials rejected
    #[error("authentication rejected: {0}")]
    Rejected(String),
}

/// Resolves a connection to an [`Identity`].
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticate a connection.
    ///
    /// `fallback_id` is a freshly generated id for connections that did not
    /// present one.
    fn authenticate(&self, params: &ConnectParams, fallback_id: &str)
    -> Result<Identity, AuthError>;
}

/// Accepts every connection as a guest.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuth;

impl Authenticator for AnonymousAuth {
    fn authenticate(
        &self,
        params: &ConnectParams,
        fallback_id: &str,
    ) -> Result<Identity, AuthError> {
        Ok(Identity::guest(params.player_id.as_deref(), params.username.as_deref(), fallback_id))
    }
}

/// Strip control characters, trim, truncate to [`MAX_USERNAME_CHARS`].
///
/// An empty result becomes `Guest` plus the first six characters of the
/// player id.
pub fn sanitize_username(raw: &str, player_id: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let trimmed: String = cleaned.trim().chars().take(MAX_USERNAME_CHARS).collect();
    let trimmed = trimmed.trim_end();

    if trimmed.is_empty() {
        let suffix: String = player_id.chars().take(6).collect();
        return format!("Guest{suffix}");
    }
    trimmed.to_string()
}

/// Accept ids made of ASCII alphanumerics, `-` and `_`.
pub fn sanitize_player_id(raw: &str) -> Option<String> {
    let id = raw.trim();
    let valid = !id.is_empty()
        && id.len() <= MAX_PLAYER_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| id.to_string())
}

/// 32 lowercase hex characters.
pub fn generate_player_id(random: u128) -> String {
    format!("{random:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_is_cleaned_and_truncated() {
        assert_eq!(sanitize_username("  Ruth\u{0007}  ", "abc"), "Ruth");
        let long = "x".repeat(50);
        assert_eq!(sanitize_username(&long, "abc").chars().count(), MAX_USERNAME_CHARS);
    }

    #[test]
    fn empty_username_falls_back_to_guest() {
        assert_eq!(sanitize_username(" \t ", "0123456789"), "Guest012345");
        assert_eq!(sanitize_username("", "ab"), "Guestab");
    }

    #[test]
    fn player_id_validation() {
        assert_eq!(sanitize_player_id(" p-1_x "), Some("p-1_x".to_string()));
        assert_eq!(sanitize_player_id("has space"), None);
        assert_eq!(sanitize_player_id(&"a".repeat(65)), None);
        assert_eq!(sanitize_player_id(""), None);
    }

    #[test]
    fn missing_player_id_uses_fallback() {
        let fallback = generate_player_id(0xdead_beef);
        assert_eq!(fallback.len(), 32);

        let identity = AnonymousAuth
            .authenticate(&ConnectParams { player_id: None, username: None }, &fallback)
            .unwrap();
        assert_eq!(identity.player_id, fallback);
        assert_eq!(identity.username, "Guest000000");
        assert!(identity.is_guest);
    }
}
