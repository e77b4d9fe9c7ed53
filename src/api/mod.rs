//! HTTP endpoints.

pub mod authz;
pub mod error;
pub mod introspect;
pub mod sign;
pub mod token;

use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;

/// Decode Basic client credentials, where the id is a cell URL and the
/// secret a token string. The id itself contains colons, the secret never
/// does, so the split happens at the last colon.
pub(crate) fn decode_basic_client(value: &str) -> Option<(String, String)> {
    let decoded = BASE64_STD.decode(value).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (id, secret) = text.rsplit_once(':')?;
    if id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((id.to_string(), secret.to_string()))
}
