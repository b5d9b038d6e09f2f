//! Authorization `state` values

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

/// Prefix of every generated state
pub const STATE_PREFIX: &str = "ip-sdk-";

const STATE_LENGTH: usize = 16;

/// Generate a fresh `state` value
///
/// `ip-sdk-` followed by 16 URL-safe characters taken from 16 random bytes.
pub fn generate_state() -> String {
    let mut random = [0u8; STATE_LENGTH];
    rand::thread_rng().fill_bytes(&mut random);

    let mut encoded = URL_SAFE_NO_PAD.encode(random);
    encoded.truncate(STATE_LENGTH);
    format!("{}{}", STATE_PREFIX, encoded)
}
