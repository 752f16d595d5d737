//! Human-readable session ids ("swift-cove").

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "clear", "crisp", "dawn", "deft", "eager", "fair", "fast", "gentle",
    "glad", "grand", "keen", "kind", "lucid", "mellow", "neat", "nimble", "plain", "proud",
    "quick", "quiet", "rapid", "sharp", "silent", "sleek", "solid", "steady", "swift", "tidy",
    "vivid", "warm", "wild", "young",
];

const NOUNS: &[&str] = &[
    "atlas", "bay", "brook", "canyon", "cedar", "cliff", "cloud", "comet", "cove", "creek",
    "delta", "dune", "ember", "fern", "field", "fjord", "glade", "grove", "harbor", "heron",
    "lagoon", "meadow", "mesa", "orbit", "otter", "pine", "prairie", "reef", "ridge", "river",
    "shore", "summit", "tide", "valley", "willow",
];

/// Random slugs tried before falling back to a timestamp id.
const MAX_ATTEMPTS: usize = 12;

/// Pick an `adjective-noun` slug that `is_taken` rejects.
///
/// After [`MAX_ATTEMPTS`] collisions, falls back to a timestamp-derived id.
pub fn create_session_slug(is_taken: impl Fn(&str) -> bool) -> String {
    let mut rng = rand::thread_rng();
    for _ in 0..MAX_ATTEMPTS {
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("cove");
        let slug = format!("{adjective}-{noun}");
        if !is_taken(&slug) {
            return slug;
        }
    }

    loop {
        let suffix: u16 = rng.gen();
        let slug = format!("proc-{}-{:04x}", Utc::now().timestamp_millis(), suffix);
        if !is_taken(&slug) {
            return slug;
        }
    }
}
