use rand::rngs::StdRng;
use rand::SeedableRng;

pub fn truncate_for_log(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max).collect();
        format!("{}…", truncated)
    }
}

/// Short content fingerprint used in logs and cache keys.
pub fn content_hash(text: &str) -> [u8; 32] {
    *blake3::hash(text.as_bytes()).as_bytes()
}

/// Deterministic RNG derived from the given seed parts. Identical parts always
/// yield the same sequence, which keeps "random" macros and group rolls
/// reproducible for a given chat state.
pub fn seeded_rng(parts: &[&str]) -> StdRng {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    StdRng::from_seed(*hasher.finalize().as_bytes())
}
