//! Unverified inspection of the JSON claim envelope carried by every token.
//!
//! The client never verifies the signature - that is the server's job - it only needs to read
//! `exp` and a handful of other claims to drive the refresh policy and to route requests.

use crate::error::SessionError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use std::collections::HashSet;

/// The claims this client actually reads out of a token. Unknown claims are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub exp: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub proj: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub groups: HashSet<String>,
    /// Present only on refresh tokens; decrements on each successful refresh.
    #[serde(default)]
    pub counter: Option<i64>,
    /// Restriction prefix for instance-issued tokens.
    #[serde(default)]
    pub path: Option<String>,
    /// Client id, used when renewing.
    #[serde(default)]
    pub aud: Option<String>,
}

/// Split `header.claims.signature`, base64url-decode the middle segment, and parse its JSON.
pub fn decode_claims(token: &str) -> Result<Claims, SessionError> {
    let mut segments = token.split('.');
    let _header = segments
        .next()
        .ok_or_else(|| SessionError::MalformedToken("missing header segment".into()))?;
    let payload = segments
        .next()
        .ok_or_else(|| SessionError::MalformedToken("missing claims segment".into()))?;
    if segments.next().is_none() {
        return Err(SessionError::MalformedToken(
            "missing signature segment".into(),
        ));
    }

    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|err| SessionError::MalformedToken(format!("invalid base64url: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| SessionError::MalformedToken(format!("invalid claims json: {err}")))
}

/// `now >= exp(access)`. No pair at all is handled by the caller, not here.
pub fn is_expired(claims: &Claims, now: i64) -> bool {
    now >= claims.exp
}

/// `exp(access) ∈ (now, now+minutes*60]`.
pub fn expires_soon(claims: &Claims, now: i64, minutes: i64) -> bool {
    let window_end = now + minutes * 60;
    claims.exp > now && claims.exp <= window_end
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn make_token(exp: i64, extra: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let body = format!("{{\"exp\":{exp}{extra}}}");
        let payload = URL_SAFE_NO_PAD.encode(body.as_bytes());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn decodes_exp_and_optional_fields() {
        let token = make_token(1_700_000_000, ",\"name\":\"import\",\"proj\":\"p11\"");
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.exp, 1_700_000_000);
        assert_eq!(claims.name.as_deref(), Some("import"));
        assert_eq!(claims.proj.as_deref(), Some("p11"));
        assert_eq!(claims.counter, None);
    }

    #[test]
    fn rejects_a_token_missing_segments() {
        let err = decode_claims("onlyonepart").unwrap_err();
        assert!(matches!(err, SessionError::MalformedToken(_)));
    }

    #[test]
    fn expired_iff_now_at_or_past_exp() {
        let claims = Claims {
            exp: 1000,
            name: None,
            proj: None,
            user: None,
            groups: HashSet::new(),
            counter: None,
            path: None,
            aud: None,
        };
        assert!(!is_expired(&claims, 999));
        assert!(is_expired(&claims, 1000));
        assert!(is_expired(&claims, 1001));
    }

    #[test]
    fn expires_soon_is_a_half_open_window() {
        let claims = Claims {
            exp: 1000,
            name: None,
            proj: None,
            user: None,
            groups: HashSet::new(),
            counter: None,
            path: None,
            aud: None,
        };
        // now + 10*60 = 1000 -> exactly at the boundary, inclusive
        assert!(expires_soon(&claims, 1000 - 600, 10));
        // now itself must be strictly before exp
        assert!(!expires_soon(&claims, 1000, 10));
        // too far out
        assert!(!expires_soon(&claims, 0, 10));
    }
}
