use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

use crate::BRANCH_MAGIC_COOKIE;

/// Random alphanumeric token of the requested length.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generates a fresh local tag for From/To headers.
pub fn generate_tag() -> SmolStr {
    SmolStr::new(random_token(8))
}

/// Generates a Call-ID scoped to the given host.
pub fn generate_call_id(host: &str) -> SmolStr {
    SmolStr::new(format!("{}@{}", random_token(10), host))
}

/// Generates an RFC 3261 magic-cookie branch identifier.
pub fn generate_branch() -> SmolStr {
    SmolStr::new(format!("{}{}", BRANCH_MAGIC_COOKIE, random_token(16)))
}

/// Generates the 16-hex-character client nonce used in digest responses.
pub fn generate_cnonce() -> SmolStr {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(16);
    for _ in 0..16 {
        out.push(HEX[rng.gen_range(0..16usize)] as char);
    }
    SmolStr::new(out)
}
