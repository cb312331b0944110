//! Value normalization and field extraction.
//!
//! Normalization is the deterministic transformation applied to every value
//! on **both** the write path and the query path, so comparisons always
//! meet in the same key space:
//!
//! - null → `"__NULL__"`, booleans → `"__TRUE__"` / `"__FALSE__"`
//! - numbers and ISO-8601 strings that look like Unix timestamps (by
//!   value, never by field name) are converted to milliseconds and bucketed
//!   to 60-second resolution
//! - strings and arrays longer than 100 characters are replaced with a
//!   short deterministic hash so chunk keys stay filesystem-safe
//!
//! Field extraction walks an entity's metadata and produces the (field,
//! key) pairs the index stores, plus the synthetic `__words__` field of
//! hashed word tokens.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bloom::fnv1a_32;
use crate::model::Metadata;

pub const NULL_KEY: &str = "__NULL__";
pub const TRUE_KEY: &str = "__TRUE__";
pub const FALSE_KEY: &str = "__FALSE__";

/// Synthetic field of hashed word tokens over all string content.
pub const WORDS_FIELD: &str = "__words__";

/// Stable indexed name for the top-level `type` key.
pub const TYPE_FIELD: &str = "noun";

/// Presence field indexed for every entity; backs `ne`, `missing`, and
/// `not` without a separate roster structure.
pub const ALL_FIELD: &str = "__all__";
pub const PRESENT_KEY: &str = "__PRESENT__";

/// Metadata keys that never become index fields.
const DENY_LIST: &[&str] = &["vector", "embedding", "connections", "level", "id"];

/// Arrays longer than this are treated as bulk data (embeddings) and skipped.
const MAX_ARRAY_LEN: usize = 10;

/// Values longer than this are replaced by a deterministic hash.
const MAX_INLINE_LEN: usize = 100;

/// Word token limits.
const MIN_WORD_LEN: usize = 2;
const MAX_WORD_LEN: usize = 50;
const MAX_WORDS_PER_ENTITY: usize = 5000;

/// Unix seconds for 2000-01-01T00:00:00Z and 2100-01-01T00:00:00Z. A bare
/// number inside [min, max) in seconds - or the same window in
/// milliseconds - is taken to be a timestamp.
const TS_SEC_MIN: f64 = 946_684_800.0;
const TS_SEC_MAX: f64 = 4_102_444_800.0;
const TS_MS_MIN: f64 = TS_SEC_MIN * 1000.0;
const TS_MS_MAX: f64 = TS_SEC_MAX * 1000.0;

/// Timestamps are bucketed to this resolution (milliseconds) before
/// indexing.
pub const BUCKET_MS: i64 = 60_000;

static ISO_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").expect("static regex")
});

/// A normalized chunk key: either a number or a string, totally ordered
/// within a field (numbers before strings, numbers by total order, strings
/// lexicographically).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexKey {
    Num(f64),
    Str(String),
}

impl IndexKey {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            IndexKey::Num(n) => Some(*n),
            IndexKey::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            IndexKey::Num(_) => None,
            IndexKey::Str(s) => Some(s),
        }
    }

    pub fn is_null_key(&self) -> bool {
        matches!(self, IndexKey::Str(s) if s == NULL_KEY)
    }

    /// Canonical byte form used for Bloom filters and value counts.
    pub fn storage_key(&self) -> String {
        match self {
            IndexKey::Num(n) => {
                // Integral floats print without the trailing ".0" so the
                // same timestamp always produces the same key bytes.
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            IndexKey::Str(s) => s.clone(),
        }
    }

    /// Approximate heap footprint, for cache accounting.
    pub fn size_bytes(&self) -> usize {
        match self {
            IndexKey::Num(_) => 8,
            IndexKey::Str(s) => s.len(),
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Num(a), IndexKey::Num(b)) => a.total_cmp(b),
            (IndexKey::Str(a), IndexKey::Str(b)) => a.cmp(b),
            (IndexKey::Num(_), IndexKey::Str(_)) => Ordering::Less,
            (IndexKey::Str(_), IndexKey::Num(_)) => Ordering::Greater,
        }
    }
}

impl std::hash::Hash for IndexKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            IndexKey::Num(n) => {
                state.write_u8(0);
                state.write_u64(n.to_bits());
            }
            IndexKey::Str(s) => {
                state.write_u8(1);
                s.hash(state);
            }
        }
    }
}

/// A normalized value plus whether temporal bucketing fired. Range queries
/// need both: bucketed bounds admit whole boundary buckets, which are then
/// refined against exact metadata values using the pre-bucket milliseconds
/// kept in `exact_ms`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub key: IndexKey,
    pub bucketed: bool,
    /// Pre-bucket milliseconds when `bucketed` is true.
    pub exact_ms: Option<f64>,
}

impl Normalized {
    fn plain(key: IndexKey) -> Self {
        Self {
            key,
            bucketed: false,
            exact_ms: None,
        }
    }

    fn bucketed(ms: f64) -> Self {
        Self {
            key: IndexKey::Num(bucket_timestamp_ms(ms)),
            bucketed: true,
            exact_ms: Some(ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions {
    /// Round numerics to two decimals. Set by the index for fields whose
    /// statistics flag them as high-cardinality; detection is value-driven,
    /// never name-driven.
    pub round_high_cardinality: bool,
}

/// Convert a millisecond timestamp to its 60-second bucket.
pub fn bucket_timestamp_ms(ms: f64) -> f64 {
    ((ms / BUCKET_MS as f64).floor() as i64 * BUCKET_MS) as f64
}

/// Value-based temporal detection: milliseconds if the number sits in the
/// 2000–2100 window in either seconds or milliseconds.
fn detect_timestamp_ms(n: f64) -> Option<f64> {
    if (TS_SEC_MIN..TS_SEC_MAX).contains(&n) {
        Some(n * 1000.0)
    } else if (TS_MS_MIN..TS_MS_MAX).contains(&n) {
        Some(n)
    } else {
        None
    }
}

fn parse_iso_timestamp_ms(s: &str) -> Option<f64> {
    if !ISO_PREFIX.is_match(s) {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis() as f64);
    }
    // Bare "YYYY-MM-DDTHH:MM:SS" without offset: treat as UTC.
    chrono::NaiveDateTime::parse_from_str(&s[..19], "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis() as f64)
}

/// Exact milliseconds of a metadata value that looks temporal, without
/// bucketing. Range refinement and temporal sorting both compare in this
/// space.
pub fn exact_timestamp_ms(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().and_then(detect_timestamp_ms),
        Value::String(s) => parse_iso_timestamp_ms(s),
        _ => None,
    }
}

/// Deterministic short hash for oversized values: `__HASH_<base36>`.
pub fn hash_long_value(s: &str) -> String {
    let digest = blake3::hash(s.as_bytes());
    let mut n = u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"));
    let mut out = Vec::new();
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    loop {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    format!("__HASH_{}", String::from_utf8(out).expect("ascii"))
}

/// Normalize one primitive value into its index key. Returns `None` for
/// values that cannot be indexed (objects, long arrays, non-finite
/// numbers).
pub fn normalize_value(value: &Value, opts: NormalizeOptions) -> Option<Normalized> {
    match value {
        Value::Null => Some(Normalized::plain(IndexKey::Str(NULL_KEY.to_string()))),
        Value::Bool(true) => Some(Normalized::plain(IndexKey::Str(TRUE_KEY.to_string()))),
        Value::Bool(false) => Some(Normalized::plain(IndexKey::Str(FALSE_KEY.to_string()))),
        Value::Number(num) => {
            let n = num.as_f64()?;
            if !n.is_finite() {
                return None;
            }
            if let Some(ms) = detect_timestamp_ms(n) {
                return Some(Normalized::bucketed(ms));
            }
            let n = if opts.round_high_cardinality {
                (n * 100.0).round() / 100.0
            } else {
                n
            };
            Some(Normalized::plain(IndexKey::Num(n)))
        }
        Value::String(s) => {
            if let Some(ms) = parse_iso_timestamp_ms(s) {
                return Some(Normalized::bucketed(ms));
            }
            if s.len() > MAX_INLINE_LEN {
                return Some(Normalized::plain(IndexKey::Str(hash_long_value(s))));
            }
            Some(Normalized::plain(IndexKey::Str(s.clone())))
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// One extracted (field, key) pair.
pub type FieldPair = (String, IndexKey);

/// Extract indexable (field, key) pairs from an entity's metadata.
///
/// Walk order and rules:
/// 1. deny-listed keys are skipped
/// 2. a top-level `metadata` sub-object is flattened to top-level keys
/// 3. arrays longer than 10 elements are rejected (bulk data)
/// 4. small arrays of primitives emit one pair per element
/// 5. the top-level `type` key indexes under the stable name `noun`
/// 6. all string content additionally feeds the `__words__` token field
pub fn extract_fields(metadata: &Metadata, opts: NormalizeOptions) -> Vec<FieldPair> {
    let mut pairs = Vec::new();
    let mut words = WordAccumulator::new();

    for (raw_key, value) in metadata {
        if raw_key == "metadata" {
            if let Value::Object(inner) = value {
                for (inner_key, inner_value) in inner {
                    extract_one(inner_key, inner_value, opts, &mut pairs, &mut words);
                }
                continue;
            }
        }
        extract_one(raw_key, value, opts, &mut pairs, &mut words);
    }

    for token in words.finish() {
        pairs.push((WORDS_FIELD.to_string(), IndexKey::Num(f64::from(token))));
    }
    pairs
}

fn extract_one(
    key: &str,
    value: &Value,
    opts: NormalizeOptions,
    pairs: &mut Vec<FieldPair>,
    words: &mut WordAccumulator,
) {
    if DENY_LIST.contains(&key) {
        return;
    }
    let field = if key == "type" { TYPE_FIELD } else { key };

    match value {
        Value::Array(items) => {
            if items.len() > MAX_ARRAY_LEN {
                tracing::trace!(field, len = items.len(), "skipping oversized array");
                return;
            }
            for item in items {
                if item.is_array() || item.is_object() {
                    continue;
                }
                if let Some(s) = item.as_str() {
                    words.feed(s);
                }
                if let Some(normalized) = normalize_value(item, opts) {
                    pairs.push((field.to_string(), normalized.key));
                }
            }
        }
        Value::Object(_) => {
            // Nested objects other than the `metadata` wrapper are not
            // indexed.
        }
        other => {
            if let Some(s) = other.as_str() {
                words.feed(s);
            }
            if let Some(normalized) = normalize_value(other, opts) {
                pairs.push((field.to_string(), normalized.key));
            }
        }
    }
}

/// Per-entity word token collector: lowercase, punctuation → space, length
/// 2–50, deduplicated, FNV-1a-hashed to i32, capped at 5000 per entity.
struct WordAccumulator {
    tokens: std::collections::BTreeSet<i32>,
}

impl WordAccumulator {
    fn new() -> Self {
        Self {
            tokens: std::collections::BTreeSet::new(),
        }
    }

    fn feed(&mut self, text: &str) {
        if self.tokens.len() >= MAX_WORDS_PER_ENTITY {
            return;
        }
        let lowered = text.to_lowercase();
        let cleaned: String = lowered
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        for word in cleaned.split_whitespace() {
            if word.len() < MIN_WORD_LEN || word.len() > MAX_WORD_LEN {
                continue;
            }
            self.tokens.insert(fnv1a_32(word.as_bytes()) as i32);
            if self.tokens.len() >= MAX_WORDS_PER_ENTITY {
                return;
            }
        }
    }

    fn finish(self) -> impl Iterator<Item = i32> {
        self.tokens.into_iter()
    }
}

/// Hash a query-side word the same way the write side does.
pub fn word_token(word: &str) -> i32 {
    fnv1a_32(word.to_lowercase().as_bytes()) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn norm(v: Value) -> Normalized {
        normalize_value(&v, NormalizeOptions::default()).unwrap()
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(norm(json!(null)).key, IndexKey::Str(NULL_KEY.into()));
        assert_eq!(norm(json!(true)).key, IndexKey::Str(TRUE_KEY.into()));
        assert_eq!(norm(json!(false)).key, IndexKey::Str(FALSE_KEY.into()));
    }

    #[test]
    fn test_plain_number_passes_through() {
        let n = norm(json!(0.73));
        assert_eq!(n.key, IndexKey::Num(0.73));
        assert!(!n.bucketed);
    }

    #[test]
    fn test_seconds_timestamp_detected_and_bucketed() {
        // 2023-11-14T22:13:20Z
        let n = norm(json!(1_700_000_000));
        assert!(n.bucketed);
        // 1_700_000_000_000 ms floors to the 60 s bucket below it
        assert_eq!(n.key, IndexKey::Num(1_699_999_980_000.0));
    }

    #[test]
    fn test_millis_timestamp_detected_and_bucketed() {
        let n = norm(json!(1_700_000_045_123i64));
        assert!(n.bucketed);
        assert_eq!(n.key, IndexKey::Num(1_700_000_040_000.0));
    }

    #[test]
    fn test_iso_string_bucketed_like_millis() {
        let from_str = norm(json!("2023-11-14T22:13:20Z"));
        let from_num = norm(json!(1_700_000_000));
        assert_eq!(from_str.key, from_num.key);
    }

    #[test]
    fn test_same_minute_same_key_different_minute_different_key() {
        let a = norm(json!(1_700_000_000_000i64));
        let b = norm(json!(1_700_000_030_000i64));
        let c = norm(json!(1_700_000_070_000i64));
        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
    }

    #[test]
    fn test_long_string_hashed_deterministically() {
        let long = "x".repeat(150);
        let a = norm(json!(long.clone()));
        let b = norm(json!(long));
        assert_eq!(a.key, b.key);
        let s = a.key.as_str().unwrap().to_string();
        assert!(s.starts_with("__HASH_"));
        assert!(s.len() < 30);
    }

    #[test]
    fn test_normalization_idempotent() {
        let values = vec![
            json!(null),
            json!(true),
            json!(0.73),
            json!(1_700_000_000),
            json!("hello world"),
            json!("x".repeat(200)),
            json!("2024-05-01T00:00:00Z"),
        ];
        for v in values {
            let once = norm(v.clone());
            // Re-normalize the normalized form
            let again_value = match &once.key {
                IndexKey::Num(n) => json!(n),
                IndexKey::Str(s) => json!(s),
            };
            let twice = normalize_value(&again_value, NormalizeOptions::default()).unwrap();
            assert_eq!(once.key, twice.key, "not idempotent for {v:?}");
        }
    }

    #[test]
    fn test_rounding_only_when_requested() {
        let opts = NormalizeOptions {
            round_high_cardinality: true,
        };
        let n = normalize_value(&json!(0.736_159), opts).unwrap();
        assert_eq!(n.key, IndexKey::Num(0.74));
    }

    #[test]
    fn test_key_ordering_numbers_before_strings() {
        let mut keys = vec![
            IndexKey::Str("b".into()),
            IndexKey::Num(2.0),
            IndexKey::Str("a".into()),
            IndexKey::Num(-1.0),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                IndexKey::Num(-1.0),
                IndexKey::Num(2.0),
                IndexKey::Str("a".into()),
                IndexKey::Str("b".into()),
            ]
        );
    }

    #[test]
    fn test_extract_skips_deny_list_and_long_arrays() {
        let metadata: Metadata = serde_json::from_value(json!({
            "vector": vec![0.1f64; 384],
            "embedding": [0.1, 0.2],
            "id": "abc",
            "score": 0.5,
            "tags": ["alpha", "beta"],
            "big": (0..11).collect::<Vec<i32>>(),
        }))
        .unwrap();
        let pairs = extract_fields(&metadata, NormalizeOptions::default());
        assert!(pairs.iter().all(|(f, _)| f != "vector" && f != "embedding" && f != "id"));
        assert!(pairs.iter().all(|(f, _)| f != "big"));
        let tag_count = pairs.iter().filter(|(f, _)| f == "tags").count();
        assert_eq!(tag_count, 2, "multi-value array indexes per element");
    }

    #[test]
    fn test_extract_flattens_metadata_wrapper_and_maps_type() {
        let metadata: Metadata = serde_json::from_value(json!({
            "type": "Concept",
            "metadata": { "score": 0.73 },
        }))
        .unwrap();
        let pairs = extract_fields(&metadata, NormalizeOptions::default());
        assert!(pairs.contains(&("noun".to_string(), IndexKey::Str("Concept".into()))));
        assert!(pairs.contains(&("score".to_string(), IndexKey::Num(0.73))));
    }

    #[test]
    fn test_words_field_produced_and_deduped() {
        let metadata: Metadata = serde_json::from_value(json!({
            "title": "Hello, hello WORLD!",
        }))
        .unwrap();
        let pairs = extract_fields(&metadata, NormalizeOptions::default());
        let words: Vec<&IndexKey> = pairs
            .iter()
            .filter(|(f, _)| f == WORDS_FIELD)
            .map(|(_, k)| k)
            .collect();
        // "hello" and "world" after lowercase + dedupe
        assert_eq!(words.len(), 2);
        assert!(words.contains(&&IndexKey::Num(f64::from(word_token("hello")))));
    }

    #[test]
    fn test_single_char_words_dropped() {
        let metadata: Metadata =
            serde_json::from_value(json!({ "note": "a bb c" })).unwrap();
        let pairs = extract_fields(&metadata, NormalizeOptions::default());
        let words = pairs.iter().filter(|(f, _)| f == WORDS_FIELD).count();
        assert_eq!(words, 1);
    }
}
