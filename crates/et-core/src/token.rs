//! Enrollment token parsing
//!
//! Enrollment tokens are JWTs minted by the controller. The service only
//! needs to check their shape and pull out the claims; signature
//! verification happens in the engine during enrollment.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::time::current_time_secs;

/// Claims carried by an enrollment token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentClaims {
    /// Enrollment method (ott, ottca, ca)
    #[serde(rename = "em")]
    pub method: String,
    /// Controller URL
    #[serde(rename = "iss")]
    pub issuer: String,
    /// Token id
    #[serde(rename = "jti", default)]
    pub token_id: String,
    /// Identity id at the controller
    #[serde(rename = "sub", default)]
    pub subject: String,
    /// Expiry, seconds since the UNIX epoch
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// A parsed, not yet redeemed, enrollment token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentToken {
    raw: String,
    claims: EnrollmentClaims,
}

impl EnrollmentToken {
    /// Parse and validate a token against the current time
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        Self::parse_at(raw, current_time_secs())
    }

    /// Parse and validate a token against the given time (seconds since epoch)
    pub fn parse_at(raw: &str, now_secs: u64) -> Result<Self, TokenError> {
        let raw = raw.trim();
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(TokenError::Segments(segments.len()));
        }

        let header = decode_segment(segments[0])?;
        serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&header)
            .map_err(|e| TokenError::Claims(e.to_string()))?;

        let claims = decode_segment(segments[1])?;
        let claims: EnrollmentClaims =
            serde_json::from_slice(&claims).map_err(|e| TokenError::Claims(e.to_string()))?;

        if claims.method.trim().is_empty() {
            return Err(TokenError::MissingClaim("em"));
        }
        if claims.issuer.trim().is_empty() {
            return Err(TokenError::MissingClaim("iss"));
        }
        if let Some(exp) = claims.expires_at {
            if exp <= now_secs {
                return Err(TokenError::Expired(exp));
            }
        }

        decode_segment(segments[2])?;

        Ok(Self {
            raw: raw.to_string(),
            claims,
        })
    }

    /// Token exactly as supplied
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Decoded claims
    pub fn claims(&self) -> &EnrollmentClaims {
        &self.claims
    }

    /// Controller URL the token was issued by
    pub fn controller(&self) -> &str {
        &self.claims.issuer
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| TokenError::Encoding(e.to_string()))
}
