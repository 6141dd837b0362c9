use base64::Engine;
use serde::Deserialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is not a three-part JWT")]
    Malformed,
    #[error("token payload is not valid base64url: {0}")]
    Encoding(String),
    #[error("token payload is missing a valid `playthrough_uuid` claim: {0}")]
    Claims(String),
}

#[derive(Deserialize)]
struct Claims {
    playthrough_uuid: Uuid,
}

/// A bearer token issued for one playthrough, with the session uuid it encodes.
///
/// The signature is not verified here; the backend does that on every request.
#[derive(Clone)]
pub struct SessionToken {
    raw: String,
    session_uuid: Uuid,
}

impl SessionToken {
    pub fn parse(raw: impl Into<String>) -> Result<Self, TokenError> {
        let raw = raw.into();
        let mut segments = raw.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed);
        };

        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| TokenError::Encoding(e.to_string()))?;
        let claims: Claims =
            serde_json::from_slice(&decoded).map_err(|e| TokenError::Claims(e.to_string()))?;

        Ok(Self {
            raw,
            session_uuid: claims.playthrough_uuid,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn session_uuid(&self) -> Uuid {
        self.session_uuid
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("raw", &"[REDACTED]")
            .field("session_uuid", &self.session_uuid)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn encode_for_tests(claims: &serde_json::Value) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    format!(
        "{}.{}.signature",
        engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
        engine.encode(claims.to_string())
    )
}
