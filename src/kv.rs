//! Key-value backend seam shared by the route and credential stores

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Result of an atomic rename-with-value-change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Old key removed, new key holds the value
    Replaced,
    /// New key was already occupied; nothing changed
    TargetExists,
    /// Old key was absent; nothing changed
    SourceMissing,
}

/// Redis type of a stored key, as reported by `TYPE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Missing,
    String,
    Hash,
    Other(String),
}

impl KeyKind {
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "none" => KeyKind::Missing,
            "string" => KeyKind::String,
            "hash" => KeyKind::Hash,
            other => KeyKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Missing => f.write_str("none"),
            KeyKind::String => f.write_str("string"),
            KeyKind::Hash => f.write_str("hash"),
            KeyKind::Other(name) => f.write_str(name),
        }
    }
}

/// The subset of Redis semantics the stores rely on
///
/// Every method is a single round trip and atomic on its own; there are no
/// cross-call transactions.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// SETNX; returns whether the value was written
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys matching a Redis glob
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Values for many keys at once; `None` for absent keys and non-string keys, like MGET
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn key_kind(&self, key: &str) -> Result<KeyKind>;

    /// HGETALL; empty for a missing key
    async fn hash_entries(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// Move `old_key` to `new_key` with `value`, refusing to clobber `new_key`
    ///
    /// When both keys are equal this is a value overwrite of an existing key.
    async fn replace(&self, old_key: &str, new_key: &str, value: &str) -> Result<ReplaceOutcome>;

    /// Rename unless the destination exists; returns whether it moved
    async fn rename_nx(&self, old_key: &str, new_key: &str) -> Result<bool>;
}

pub type SharedKvBackend = Arc<dyn KvBackend>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    String(String),
    Hash(BTreeMap<String, String>),
}

fn wrong_type() -> Error {
    Error::Store(redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    )))
}

/// In-process backend for tests and local experiments
///
/// The single mutex stands in for Redis' single-threaded command execution.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// HSET, for seeding hash-shaped data written by older managers
    pub fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()))
        {
            Entry::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Entry::String(_) => Err(wrong_type()),
        }
    }

    /// Copy of the string keys, for asserting store state in tests
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .iter()
            .filter_map(|(k, v)| match v {
                Entry::String(s) => Some((k.clone(), s.clone())),
                Entry::Hash(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entries.lock().get(key) {
            Some(Entry::String(s)) => Ok(Some(s.clone())),
            Some(Entry::Hash(_)) => Err(wrong_type()),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::String(value.to_string()));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::String(value.to_string()));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let entries = self.entries.lock();
        Ok(keys
            .iter()
            .map(|k| match entries.get(k) {
                Some(Entry::String(s)) => Some(s.clone()),
                _ => None,
            })
            .collect())
    }

    async fn key_kind(&self, key: &str) -> Result<KeyKind> {
        Ok(match self.entries.lock().get(key) {
            Some(Entry::String(_)) => KeyKind::String,
            Some(Entry::Hash(_)) => KeyKind::Hash,
            None => KeyKind::Missing,
        })
    }

    async fn hash_entries(&self, key: &str) -> Result<Vec<(String, String)>> {
        match self.entries.lock().get(key) {
            Some(Entry::Hash(fields)) => Ok(fields
                .iter()
                .map(|(f, v)| (f.clone(), v.clone()))
                .collect()),
            Some(Entry::String(_)) => Err(wrong_type()),
            None => Ok(Vec::new()),
        }
    }

    async fn replace(&self, old_key: &str, new_key: &str, value: &str) -> Result<ReplaceOutcome> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(old_key) {
            return Ok(ReplaceOutcome::SourceMissing);
        }
        if old_key != new_key && entries.contains_key(new_key) {
            return Ok(ReplaceOutcome::TargetExists);
        }
        entries.remove(old_key);
        entries.insert(new_key.to_string(), Entry::String(value.to_string()));
        Ok(ReplaceOutcome::Replaced)
    }

    async fn rename_nx(&self, old_key: &str, new_key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.contains_key(new_key) {
            return Ok(false);
        }
        match entries.remove(old_key) {
            Some(value) => {
                entries.insert(new_key.to_string(), value);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Redis-style glob supporting `*`, `?` and backslash escapes
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    backtrack = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() && p[pi + 1] == t[ti] => {
                    pi += 2;
                    ti += 1;
                    continue;
                }
                c if c != '\\' && c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }
        match backtrack {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                backtrack = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}
