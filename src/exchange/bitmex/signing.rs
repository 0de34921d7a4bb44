use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// BitMEX request signature: hex-encoded
/// `HMAC_SHA256(secret, verb + path + expires + body)`, where `path`
/// includes the query string and `expires` is a unix timestamp.
pub fn sign(secret: &str, verb: &str, path: &str, expires: i64, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(verb.as_bytes());
    mac.update(path.as_bytes());
    mac.update(expires.to_string().as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
