//! Inbound webhook signature verification.
//!
//! The teacher's `webhook.rs` signs outbound payloads with
//! `X-Shipper-Signature: sha256=<hex hmac>`; the control-plane's `/trigger`
//! endpoint is on the receiving end of a git-forge webhook instead, so this
//! module inverts that idiom: compute the same HMAC-SHA256 over the raw
//! request body and compare it against the caller-supplied header using a
//! constant-time comparison.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "X-Holdfast-Signature";

/// Verify `header_value` (expected form `sha256=<hex>`) against an
/// HMAC-SHA256 of `body` keyed by `secret`. Returns `false` for any
/// malformed header rather than erroring, since an attacker-controlled
/// header should never produce anything but a rejection.
pub fn verify(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    verify_hmac_sha256_hex(secret, body, hex_sig)
}

fn verify_hmac_sha256_hex(secret: &str, body: &[u8], hex_sig: &str) -> bool {
    let Ok(expected_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected_bytes).is_ok()
}

fn verify_hmac_sha1_hex(secret: &str, body: &[u8], hex_sig: &str) -> bool {
    let Ok(expected_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected_bytes).is_ok()
}

/// Verify an inbound webhook against the scheme each forge actually uses:
///
/// - `github`: `X-Hub-Signature-256: sha256=<hex>` (same as [`verify`]).
/// - `gitlab`: `X-Gitlab-Token: <token>`, a plain constant-time string
///   compare, not an HMAC — GitLab sends the configured secret verbatim.
/// - `bitbucket`: `X-Hub-Signature: sha1=<hex>` (HMAC-SHA1), falling back to
///   a bare hex digest with no prefix for older configurations.
/// - `generic`/`gitea`: a bare-hex HMAC-SHA256 digest with no `sha256=`
///   prefix, which is what Gitea's `X-Gitea-Signature` header carries.
pub fn verify_for_forge(forge: &str, secret: &str, body: &[u8], header_value: &str) -> bool {
    match forge {
        "github" => verify(secret, body, header_value),
        "gitlab" => {
            let a = secret.as_bytes();
            let b = header_value.as_bytes();
            a.len() == b.len() && bool::from(a.ct_eq(b))
        }
        "bitbucket" => {
            let hex_sig = header_value.strip_prefix("sha1=").unwrap_or(header_value);
            verify_hmac_sha1_hex(secret, body, hex_sig)
        }
        // generic, gitea, and anything else fall back to a bare-hex digest.
        _ => verify_hmac_sha256_hex(secret, body, header_value),
    }
}
