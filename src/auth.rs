// src/auth.rs
//
// Token handshake gating ingestion connections. The first framed message on
// a new connection must carry `{"type":"auth","token":"<t>"}`; the reply is
// `{"success":true}` or `{"success":false,"error":"..."}` and any failure
// closes the connection.

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::info;

/// Deadline for the handshake, shorter than the steady-state read deadline.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Cap on the first frame. Anything longer is rejected before token
/// extraction to keep a hostile client from buffering through the lax parser.
pub const MAX_AUTH_FRAME: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    Required,
    #[error("invalid auth message format")]
    Malformed,
    #[error("auth token mismatch")]
    Mismatch,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub token: String,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { enabled: false, token: String::new() }
    }
}

/// Generate a 256-bit random token, hex-encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct Authenticator {
    config: AuthConfig,
}

impl Authenticator {
    /// When auth is enabled without a configured token, one is generated and
    /// logged exactly once so the operator can hand it to clients.
    pub fn new(mut config: AuthConfig) -> Self {
        if config.enabled && config.token.is_empty() {
            config.token = generate_token();
            info!(token = %config.token, "generated auth token");
        }
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn token(&self) -> &str {
        &self.config.token
    }

    /// Constant-time comparison against the configured token.
    pub fn validate_token(&self, provided: &str) -> Result<(), AuthError> {
        if !self.config.enabled {
            return Ok(());
        }
        if provided.is_empty() {
            return Err(AuthError::Required);
        }
        let ok: bool = self
            .config
            .token
            .as_bytes()
            .ct_eq(provided.as_bytes())
            .into();
        if ok {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }

    /// Full first-frame check: size/NUL policing, token extraction, compare.
    pub fn check_first_frame(&self, frame: &[u8]) -> Result<(), AuthError> {
        let token = extract_token(frame)?;
        self.validate_token(&token)
    }
}

/// Lax extraction of the `token` value from the auth frame. A tolerant
/// string scan rather than a full JSON parse; still rejects oversized frames
/// and embedded NULs outright.
pub fn extract_token(frame: &[u8]) -> Result<String, AuthError> {
    if frame.len() > MAX_AUTH_FRAME {
        return Err(AuthError::Malformed);
    }
    if frame.contains(&0) {
        return Err(AuthError::Malformed);
    }
    let text = std::str::from_utf8(frame).map_err(|_| AuthError::Malformed)?;

    const NEEDLE: &str = "\"token\":\"";
    let start = match text.find(NEEDLE) {
        Some(i) => i + NEEDLE.len(),
        None => return Err(AuthError::Malformed),
    };
    let rest = &text[start..];
    let end = match rest.find('"') {
        Some(i) => i,
        None => return Err(AuthError::Malformed),
    };
    if end == 0 {
        return Err(AuthError::Required);
    }
    Ok(rest[..end].to_string())
}

/// Response body for a handshake outcome.
pub fn auth_response(result: &Result<(), AuthError>) -> Vec<u8> {
    match result {
        Ok(()) => b"{\"success\":true}".to_vec(),
        Err(e) => format!("{{\"success\":false,\"error\":\"{}\"}}", e).into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(token: &str) -> Authenticator {
        Authenticator::new(AuthConfig { enabled: true, token: token.to_string() })
    }

    #[test]
    fn extract_token_happy_path() {
        let frame = br#"{"type":"auth","token":"s3cret"}"#;
        assert_eq!(extract_token(frame).unwrap(), "s3cret");
    }

    #[test]
    fn extract_token_rejects_garbage() {
        assert_eq!(extract_token(b"not json at all"), Err(AuthError::Malformed));
        assert_eq!(extract_token(b"{\"token\":\"unterminated"), Err(AuthError::Malformed));
        assert_eq!(
            extract_token(br#"{"type":"auth","token":""}"#),
            Err(AuthError::Required)
        );
    }

    #[test]
    fn extract_token_rejects_nul_and_oversize() {
        let with_nul = b"{\"token\":\"a\x00b\"}".to_vec();
        assert_eq!(extract_token(&with_nul), Err(AuthError::Malformed));

        let huge = vec![b'a'; MAX_AUTH_FRAME + 1];
        assert_eq!(extract_token(&huge), Err(AuthError::Malformed));
    }

    #[test]
    fn validate_token_matches_and_mismatches() {
        let a = auth("s3cret");
        assert!(a.validate_token("s3cret").is_ok());
        assert_eq!(a.validate_token("wrong"), Err(AuthError::Mismatch));
        // Same length, shared prefix: still a mismatch.
        assert_eq!(a.validate_token("s3creX"), Err(AuthError::Mismatch));
        assert_eq!(a.validate_token(""), Err(AuthError::Required));
    }

    #[test]
    fn disabled_auth_allows_anything() {
        let a = Authenticator::new(AuthConfig::disabled());
        assert!(a.validate_token("whatever").is_ok());
        assert!(a.validate_token("").is_ok());
    }

    #[test]
    fn token_generated_when_enabled_without_one() {
        let a = Authenticator::new(AuthConfig { enabled: true, token: String::new() });
        assert_eq!(a.token().len(), 64);
        assert!(a.token().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn response_bodies() {
        assert_eq!(auth_response(&Ok(())), b"{\"success\":true}");
        let body = auth_response(&Err(AuthError::Mismatch));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("\"success\":false"));
        assert!(text.contains("mismatch"));
    }
}
