/*
 * Meeting Companion Server - Ingest Token Signing
 * Copyright (c) 2024 Meeting Companion Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Mint a signed ingest token bound to a session id.
pub fn mint_ingest_token(secret: &str, session_id: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(session_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a token presented on the audio channel. Comparison is
/// constant-time via the MAC verifier.
pub fn verify_ingest_token(secret: &str, session_id: &str, token: &str) -> bool {
    let Ok(raw) = hex::decode(token.trim()) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(session_id.as_bytes());
    mac.verify_slice(&raw).is_ok()
}
