//! The loosely-typed option set callers hand to the supervisor.
//!
//! Keys are compared case-insensitively everywhere. A value of `None` means
//! "flag without argument".

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Control keys are consumed by the supervisor and never forwarded as flags.
pub const CONTROL_KEYS: &[&str] = &["key", "binarypath", "logfile", "onlycommand"];

/// Returns true if `key` is one of the [`CONTROL_KEYS`].
pub fn is_control_key(key: &str) -> bool {
    let key = key.trim();
    CONTROL_KEYS.iter().any(|c| c.eq_ignore_ascii_case(key))
}

/// Returns true unless the value is the literal string `false` (any case).
pub fn is_truthy(value: Option<&str>) -> bool {
    !value.is_some_and(|v| v.trim().eq_ignore_ascii_case("false"))
}

/// String-keyed tunnel options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelOptions {
    entries: BTreeMap<String, Option<String>>,
}

impl TunnelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set `key` to `value`, replacing any entry whose key differs only in case.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert_raw(key.into(), Some(value.into()));
    }

    /// Set `key` with no value.
    pub fn insert_flag(&mut self, key: impl Into<String>) {
        self.insert_raw(key.into(), None);
    }

    fn insert_raw(&mut self, key: String, value: Option<String>) {
        let key = key.trim().to_string();
        self.entries.retain(|k, _| !k.eq_ignore_ascii_case(&key));
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        let key = key.trim();
        self.entries.retain(|k, _| !k.eq_ignore_ascii_case(key));
    }

    fn entry(&self, key: &str) -> Option<&Option<String>> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    /// Trimmed value of `key`, if present and non-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entry(key)
            .and_then(Option::as_deref)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// The access key authenticating the tunnel.
    pub fn access_key(&self) -> Option<&str> {
        self.get("key")
    }

    /// Caller-supplied binary path overriding provisioning.
    pub fn binary_path(&self) -> Option<PathBuf> {
        self.get("binarypath").map(PathBuf::from)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.get("logfile").map(PathBuf::from)
    }

    /// True when the caller only wants the command vector built.
    pub fn only_command(&self) -> bool {
        self.entry("onlyCommand")
            .is_some_and(|value| is_truthy(value.as_deref()))
    }

    /// Options that become flags, i.e. everything except control keys.
    pub fn forwarded(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .filter(|(k, _)| !is_control_key(k))
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TunnelOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (k, v) in iter {
            options.insert(k, v);
        }
        options
    }
}
