//! Response classification for the dispatcher
//!
//! A 401 is only recoverable when the body names the expired-token code;
//! every other 401 means the credential can't be renewed. Bodies are JSON
//! with an application-defined `code` field:
//!
//! ```json
//! {"error": true, "code": "token.expired", "message": "Token expired."}
//! ```

/// Error code the upstream uses for an expired but renewable access token.
pub const TOKEN_EXPIRED_CODE: &str = "token.expired";

/// What the dispatcher should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx, return to the caller
    Success,
    /// 401 with the expired code, renew and retry once
    Expired,
    /// 401 with any other code (or none), invalidate the session
    Unrecoverable,
    /// Any other status, hand back untouched
    Unrelated,
}

/// Extract the `code` field from a JSON error body.
pub fn error_code(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("code")?.as_str().map(str::to_owned)
}

/// Classify a response by status and body.
pub fn classify(status: u16, body: &[u8], expired_code: &str) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        401 => match error_code(body) {
            Some(code) if code == expired_code => ResponseClass::Expired,
            _ => ResponseClass::Unrecoverable,
        },
        _ => ResponseClass::Unrelated,
    }
}
