//! Cache middleware: the read/write/skip protocol.
//!
//! Wraps the runner chain around a [`Store`]. Before a rule runs, its key
//! is computed and the store consulted; on a hit the outputs are restored
//! (or confirmed already present) and the rule short-circuits with
//! `Cached`. After a successful run, each output is uploaded under the key
//! together with a JSON sidecar of the full key record for offline
//! auditability.
//!
//! A `head` miss is a normal control signal; every other store failure is
//! fatal to the rule.

use std::{collections::BTreeMap, sync::Arc};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument};

use crate::{
    key::{self, CacheKey},
    resource::Resource,
    rule::Rule,
    runner::{Code, Middleware, Outcome, RunOpts, Runner},
    store::{META_HASH, META_USER, Store},
};

/// How the cache participates in a run.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum CacheMode {
    /// Read before running, write after.
    #[default]
    ReadWrite,
    /// Never read; write after successful runs.
    WriteOnly,
    /// The cache is out of the loop entirely.
    Disabled,
}

/// Middleware wiring a [`Store`] into the runner chain.
pub struct CacheMiddleware {
    store: Arc<dyn Store>,
    mode: CacheMode,
    user: String,
}

impl CacheMiddleware {
    pub fn new(store: Arc<dyn Store>, mode: CacheMode, user: impl Into<String>) -> Self {
        Self {
            store,
            mode,
            user: user.into(),
        }
    }
}

impl Middleware for CacheMiddleware {
    fn wrap(&self, next: Arc<dyn Runner>) -> Arc<dyn Runner> {
        Arc::new(CachedRunner {
            next,
            store: self.store.clone(),
            mode: self.mode,
            user: self.user.clone(),
        })
    }
}

struct CachedRunner {
    next: Arc<dyn Runner>,
    store: Arc<dyn Store>,
    mode: CacheMode,
    user: String,
}

impl Runner for CachedRunner {
    fn run(&self, rule: &Arc<Rule>, opts: RunOpts) -> Outcome {
        if self.mode == CacheMode::Disabled {
            return self.next.run(rule, opts);
        }

        let outputs = match rule.outputs() {
            Ok(outputs) => outputs,
            Err(err) => return Outcome::failed(Code::Error, err),
        };
        let cacheable = outputs.first().is_some_and(|output| output.cacheable());
        if !cacheable {
            return self.next.run(rule, opts);
        }

        let cache_key = match key::compute(rule) {
            Ok(key) => key,
            Err(err) => return Outcome::failed(Code::Error, err),
        };

        if self.mode != CacheMode::WriteOnly {
            match self.restore(rule, &cache_key, &outputs) {
                Ok(true) => return Outcome::cached(),
                Ok(false) => {}
                Err(err) => return Outcome::failed(Code::Error, err),
            }
        }

        let outcome = self.next.run(rule, opts);
        if outcome.code == Code::Ok {
            if let Err(err) = self.upload(rule, &cache_key, &outputs) {
                return Outcome::failed(Code::Error, err);
            }
        }
        outcome
    }
}

impl CachedRunner {
    /// Restore every output from the cache. `Ok(false)` means at least one
    /// output is absent from the store and the rule must run.
    #[instrument(skip_all, fields(node = %rule.node_id(), key = %cache_key.hex()))]
    fn restore(
        &self,
        rule: &Arc<Rule>,
        cache_key: &CacheKey,
        outputs: &[Arc<dyn Resource>],
    ) -> Result<bool> {
        for (index, output) in outputs.iter().enumerate() {
            let key = output_key(cache_key.hex(), index);
            let info = match self.store.head(&key)? {
                Some(info) => info,
                None => {
                    debug!(%key, "cache miss");
                    return Ok(false);
                }
            };

            let stored_hash = info.metadata.get(META_HASH);
            let up_to_date = output.exists()
                && stored_hash.is_some_and(|stored| {
                    output
                        .hash()
                        .map(|local| local.as_str() == stored.as_str())
                        .unwrap_or(false)
                });
            if up_to_date {
                debug!(%key, "local output already matches cache");
                continue;
            }
            self.store
                .get(&key, output.path())
                .with_context(|| format!("restore output of {}", rule.node_id()))?;
            debug!(%key, output = %output.path(), "restored output");
        }
        Ok(true)
    }

    /// Upload every output plus the key record sidecar.
    #[instrument(skip_all, fields(node = %rule.node_id(), key = %cache_key.hex()))]
    fn upload(
        &self,
        rule: &Arc<Rule>,
        cache_key: &CacheKey,
        outputs: &[Arc<dyn Resource>],
    ) -> Result<()> {
        for (index, output) in outputs.iter().enumerate() {
            let key = output_key(cache_key.hex(), index);
            let hash = output
                .hash()
                .with_context(|| format!("hash output of {}", rule.node_id()))?;
            let metadata = BTreeMap::from([
                (META_HASH.to_string(), hash.into_string()),
                (META_USER.to_string(), self.user.clone()),
            ]);
            self.store
                .put(&key, output.path(), metadata)
                .with_context(|| format!("store output of {}", rule.node_id()))?;
            debug!(%key, output = %output.path(), "stored output");
        }

        let sidecar = format!("{}.json", cache_key.hex());
        self.store
            .put_bytes(&sidecar, &cache_key.record_json()?, BTreeMap::new())
            .with_context(|| format!("store key record of {}", rule.node_id()))?;
        Ok(())
    }
}

/// The first output lives at the key itself; later outputs at `key-i`.
fn output_key(hex: &str, index: usize) -> String {
    if index == 0 {
        hex.to_string()
    } else {
        format!("{hex}-{index}")
    }
}
