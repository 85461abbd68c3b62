//! Route CRUD over the key-value backend
//!
//! This layer enforces only what the store itself can guarantee: exact
//! lookups, upserts, and the atomic rename used by updates. Uniqueness on
//! insert is checked by the caller (see `reconcile`).

use crate::error::{Error, Lookup, Result};
use crate::keyspace::{KeySpace, Namespace, SourceIdentity, Target, DEFAULT_PATH};
use crate::kv::{KeyKind, ReplaceOutcome, SharedKvBackend};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct RouteStore {
    kv: SharedKvBackend,
    keys: KeySpace,
}

impl RouteStore {
    pub fn new(kv: SharedKvBackend, keys: KeySpace) -> Self {
        Self { kv, keys }
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keys
    }

    pub async fn lookup(&self, source: &SourceIdentity) -> Result<Lookup<Target>> {
        let key = self.keys.encode_route_key(source);
        match self.kv.get(&key).await? {
            Some(value) => {
                let target = Target::decode(&value).inspect_err(|e| {
                    error!(key, error = %e, "Stored route target is corrupt");
                })?;
                Ok(Lookup::Found(target))
            }
            None => Ok(Lookup::NotFound),
        }
    }

    /// All routes whose `host:path` matches the glob; empty means every route
    pub async fn lookup_all(&self, pattern: &str) -> Result<Vec<(SourceIdentity, Target)>> {
        let glob = self.keys.match_pattern(Namespace::Routes, pattern);
        let keys = self.kv.keys(&glob).await?;
        let values = self.kv.get_many(&keys).await?;

        let mut routes = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            // MGET yields nil both for keys deleted since SCAN and for non-string keys
            let Some(value) = value else {
                match self.kv.key_kind(key).await? {
                    KeyKind::Missing => continue,
                    kind => {
                        error!(key, %kind, "Route key does not hold a string");
                        return Err(Error::Decode(format!(
                            "route key {:?} holds a {} value; run `routectl routes migrate`",
                            key, kind
                        )));
                    }
                }
            };

            let decoded = self
                .keys
                .decode_route_key(key)
                .and_then(|source| Target::decode(&value).map(|target| (source, target)));
            match decoded {
                Ok(route) => routes.push(route),
                Err(e) => {
                    error!(key, error = %e, "Stored route is corrupt");
                    return Err(e);
                }
            }
        }

        debug!(pattern, count = routes.len(), "Listed routes");
        Ok(routes)
    }

    /// Unconditional upsert; last write wins
    pub async fn insert(&self, source: &SourceIdentity, target: &Target) -> Result<()> {
        let key = self.keys.encode_route_key(source);
        self.kv.set(&key, &target.encode()).await?;
        debug!(key, target = %target, "Route written");
        Ok(())
    }

    /// Atomically move `old` to `new` with `target` as its value
    pub async fn update(
        &self,
        old: &SourceIdentity,
        new: &SourceIdentity,
        target: &Target,
    ) -> Result<()> {
        let old_key = self.keys.encode_route_key(old);
        let new_key = self.keys.encode_route_key(new);

        match self.kv.replace(&old_key, &new_key, &target.encode()).await? {
            ReplaceOutcome::Replaced => {
                debug!(old_key, new_key, target = %target, "Route replaced");
                Ok(())
            }
            ReplaceOutcome::TargetExists => Err(Error::SourceExists(new.to_string())),
            ReplaceOutcome::SourceMissing => Err(Error::RouteNotFound(old.to_string())),
        }
    }

    /// Remove a route; returns whether it existed
    pub async fn delete(&self, source: &SourceIdentity) -> Result<bool> {
        let key = self.keys.encode_route_key(source);
        let existed = self.kv.delete(&key).await?;
        debug!(key, existed, "Route deleted");
        Ok(existed)
    }

    /// Rewrite path-less `routes:{host}` keys into canonical per-path keys
    ///
    /// Keys whose host is not lowercase are renamed to the lowercase form.
    /// A string value moves to `routes:{host}:/`. A hash (one field per path)
    /// is expanded field by field with SETNX and deleted once every field is
    /// in place; an existing key with a different value is never overwritten
    /// and keeps the hash around for the operator. Not atomic across fields,
    /// but rerunning after an interruption finishes the job. Returns the
    /// number of routes written.
    pub async fn migrate_legacy_keys(&self) -> Result<usize> {
        let glob = self.keys.match_pattern(Namespace::Routes, "");
        let mut migrated = 0;

        for key in self.kv.keys(&glob).await? {
            if let Some(source) = self.keys.denormalized_route_source(&key) {
                let canonical = self.keys.encode_route_key(&source);
                if self.kv.rename_nx(&key, &canonical).await? {
                    info!(from = %key, to = %canonical, "Lowercased route key host");
                    migrated += 1;
                } else {
                    warn!(key, canonical, "Mixed-case route key left in place; canonical key already exists");
                }
                continue;
            }

            let Some(host) = self.keys.legacy_route_host(&key) else {
                continue;
            };

            match self.kv.key_kind(&key).await? {
                KeyKind::Missing => continue,
                KeyKind::String => {
                    let canonical = self
                        .keys
                        .encode_route_key(&SourceIdentity::new(&host, Some(DEFAULT_PATH)));
                    if self.kv.rename_nx(&key, &canonical).await? {
                        info!(from = %key, to = %canonical, "Migrated legacy route key");
                        migrated += 1;
                    } else {
                        warn!(key, canonical, "Legacy route key left in place; canonical key already exists");
                    }
                }
                KeyKind::Hash => migrated += self.migrate_legacy_hash(&key, &host).await?,
                KeyKind::Other(kind) => {
                    warn!(key, %kind, "Legacy route key has an unexpected type; left in place");
                }
            }
        }

        Ok(migrated)
    }

    async fn migrate_legacy_hash(&self, key: &str, host: &str) -> Result<usize> {
        let mut written = 0;
        let mut conflicts = 0;

        for (path, value) in self.kv.hash_entries(key).await? {
            let canonical = self
                .keys
                .encode_route_key(&SourceIdentity::new(host, Some(&path)));

            if self.kv.set_nx(&canonical, &value).await? {
                debug!(from = %key, path = %path, to = %canonical, "Migrated legacy route entry");
                written += 1;
            } else if self.kv.get(&canonical).await?.as_deref() != Some(value.as_str()) {
                warn!(key, path = %path, canonical, "Legacy route entry conflicts with an existing route");
                conflicts += 1;
            }
        }

        if conflicts == 0 {
            self.kv.delete(key).await?;
            info!(key, routes = written, "Migrated legacy route hash");
        } else {
            warn!(key, conflicts, "Legacy route hash left in place");
        }
        Ok(written)
    }
}
