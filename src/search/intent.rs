use sha2::{Digest, Sha256};

/// What a query is trying to do. Forced intents bypass heat gating; noise
/// never reaches external catalogs when a local substring match exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Noise,
    Follow,
    Track,
    Bookmark,
    /// Plain catalog exploration.
    Keyword,
}

impl Intent {
    pub const fn is_forced(self) -> bool {
        matches!(self, Intent::Follow | Intent::Track | Intent::Bookmark)
    }
}

/// Classify a normalized query. Verb prefixes mark user commitment
/// ("follow solo leveling"); queries too short or without a single letter
/// are noise.
pub fn detect(normalized: &str) -> Intent {
    for (prefix, intent) in [
        ("follow ", Intent::Follow),
        ("track ", Intent::Track),
        ("bookmark ", Intent::Bookmark),
    ] {
        if normalized.starts_with(prefix) && normalized.len() > prefix.len() {
            return intent;
        }
    }
    if normalized.chars().filter(|c| c.is_alphanumeric()).count() < 3
        || !normalized.chars().any(|c| c.is_alphabetic())
    {
        return Intent::Noise;
    }
    Intent::Keyword
}

/// Strip the forced-intent verb so the catalog sees only the title.
pub fn strip_intent_verb(normalized: &str) -> &str {
    for prefix in ["follow ", "track ", "bookmark "] {
        if let Some(rest) = normalized.strip_prefix(prefix) {
            if !rest.is_empty() {
                return rest;
            }
        }
    }
    normalized
}

/// Lowercase, trim, collapse runs of whitespace.
pub fn normalize_query(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Short stable digest used in job ids, heat keys and cooldown keys.
pub fn query_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

/// Digest over the query plus its filter shape; the cache and pending
/// keys must distinguish the same words under different filters.
pub fn fingerprint(normalized: &str, filters_repr: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", normalized, filters_repr).as_bytes());
    hex::encode(&digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_whitespace() {
        assert_eq!(normalize_query("  Solo   LEVELING "), "solo leveling");
    }

    #[test]
    fn verbs_force_intent() {
        assert_eq!(detect("follow solo leveling"), Intent::Follow);
        assert_eq!(detect("track berserk"), Intent::Track);
        assert_eq!(detect("bookmark dandadan"), Intent::Bookmark);
        assert!(detect("follow solo leveling").is_forced());
        assert_eq!(strip_intent_verb("follow solo leveling"), "solo leveling");
    }

    #[test]
    fn bare_verb_is_not_forced() {
        assert_eq!(detect("follow "), Intent::Noise);
        assert_eq!(strip_intent_verb("follow "), "follow ");
    }

    #[test]
    fn short_or_symbolic_queries_are_noise() {
        assert_eq!(detect("ab"), Intent::Noise);
        assert_eq!(detect("!!!"), Intent::Noise);
        assert_eq!(detect("123456"), Intent::Noise);
        assert_eq!(detect("obscurename"), Intent::Keyword);
    }

    #[test]
    fn hashes_are_stable_and_filter_sensitive() {
        assert_eq!(query_hash("solo leveling"), query_hash("solo leveling"));
        assert_ne!(query_hash("solo leveling"), query_hash("berserk"));
        assert_ne!(
            fingerprint("solo leveling", "{}"),
            fingerprint("solo leveling", "{\"series_type\":\"manhwa\"}")
        );
    }
}
