//! Backend key prefixing.
//!
//! Every backend instance owns one [`KeyPrefix`]. Logical keys supplied by
//! callers are joined with it before any call to the store, and keys read
//! back from the store are stripped of it, so callers never see prefixed
//! keys.

/// Characters with special meaning in a Redis `MATCH` glob.
const GLOB_SPECIAL: [char; 5] = ['*', '?', '[', ']', '\\'];

/// The namespace a backend instance writes under, e.g. `svc:`.
///
/// An empty prefix is valid and makes [`KeyPrefix::apply`] the identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPrefix {
    prefix: String,
}

impl KeyPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }

    /// Join the prefix and a logical key into the key stored on the wire.
    pub fn apply(&self, key: &str) -> String {
        let mut full = String::with_capacity(self.prefix.len() + key.len());
        full.push_str(&self.prefix);
        full.push_str(key);
        full
    }

    /// Prefix a batch of logical keys.
    pub fn apply_all(&self, keys: &[String]) -> Vec<String> {
        if self.prefix.is_empty() {
            return keys.to_vec();
        }
        keys.iter().map(|key| self.apply(key)).collect()
    }

    /// Recover the logical key from a stored key.
    ///
    /// Returns `None` when the stored key does not belong to this prefix.
    pub fn strip<'a>(&self, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(self.prefix.as_str())
    }

    /// `MATCH` pattern selecting every stored key that starts with this
    /// prefix followed by `pattern`, taken literally.
    pub fn scan_pattern(&self, pattern: &str) -> String {
        let mut out = escape_glob(&self.prefix);
        out.push_str(&escape_glob(pattern));
        out.push('*');
        out
    }
}

/// Escape glob metacharacters so `s` matches only itself.
pub fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if GLOB_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
