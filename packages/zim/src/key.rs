//! Cache key computation.
//!
//! The key record is the only object serialized into the fingerprint. Its
//! field order is fixed by the struct declaration, every list derived from
//! an unordered collection is sorted before serialization, and all paths
//! are repo-relative, so the resulting hex is stable across runs and
//! machines as long as the underlying bytes are.
//!
//! Anything that can change what a rule produces goes in: input contents,
//! the effective environment, captured toolchain output, the command list,
//! the container image, and the keys of every direct dependency.

use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use serde::Serialize;
use tracing::{instrument, trace};

use crate::{
    hash::Sha1Digest,
    path::RelativeTo,
    rule::Rule,
};

/// Schema version of the key record. Changing the record's shape must
/// change this string, which invalidates every existing cache entry.
pub const KEY_SCHEMA_VERSION: &str = "0.0.4";

/// One named hash within the key record.
#[derive(Clone, Debug, Serialize)]
pub struct KeyEntry {
    pub name: String,
    pub hash: String,
}

/// The canonical key record for a rule. Field order is load-bearing.
#[derive(Clone, Debug, Serialize)]
pub struct CacheKey {
    project: String,
    component: String,
    rule: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    image: String,
    output_count: usize,
    inputs: Vec<KeyEntry>,
    deps: Vec<KeyEntry>,
    env: Vec<KeyEntry>,
    toolchain: Vec<KeyEntry>,
    version: String,
    commands: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    native: bool,
    #[serde(skip)]
    hex: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl CacheKey {
    /// The lowercase hex fingerprint.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The record rendered as JSON, for the cache sidecar.
    pub fn record_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("encode key record")
    }

    fn seal(mut self) -> Result<Self> {
        let encoded = serde_json::to_vec(&self).context("encode key record")?;
        self.hex = Sha1Digest::from_buffer(&encoded).into_string();
        Ok(self)
    }
}

/// Compute the cache key for a rule, memoizing the result on the rule.
///
/// Dependency keys are computed recursively; the memoization makes the
/// recursion cheap and safe to enter from multiple worker threads.
#[instrument(name = "key::compute", skip_all, fields(node = %rule.node_id()))]
pub fn compute(rule: &Arc<Rule>) -> Result<Arc<CacheKey>> {
    if let Some(key) = rule.cached_key() {
        return Ok(key);
    }

    let component = rule.component();
    let project = component.project();

    let mut inputs = Vec::new();
    for input in rule.inputs().context("resolve inputs")? {
        let name = input
            .path()
            .relative_to(project.root())?
            .as_str_lossy()
            .into_owned();
        let hash = input.hash()?.into_string();
        inputs.push(KeyEntry { name, hash });
    }

    let mut deps = Vec::new();
    for dep in rule.dependencies().context("resolve dependencies")? {
        let key = compute(&dep)?;
        deps.push(KeyEntry {
            name: dep.node_id(),
            hash: key.hex().to_string(),
        });
    }

    let env = rule
        .base_environment()
        .into_iter()
        .map(|(name, value)| KeyEntry {
            name,
            hash: Sha1Digest::from_text(&value).into_string(),
        })
        .collect();

    let toolchain = component
        .toolchain()
        .context("capture toolchain")?
        .into_iter()
        .map(|(name, stdout)| KeyEntry { name, hash: stdout })
        .collect();

    let mut commands = Vec::new();
    for command in rule.commands() {
        if command.kind == "run" {
            // Bare shell commands enter the key verbatim, for
            // compatibility with fingerprints from before kinded commands
            // existed.
            commands.push(command.argument.clone());
        } else {
            let encoded = serde_json::to_vec(command).context("encode command")?;
            commands.push(Sha1Digest::from_buffer(&encoded).into_string());
        }
    }

    let key = CacheKey {
        project: project.name().to_string(),
        component: component.name().to_string(),
        rule: rule.parameterized().to_string(),
        image: component.image().to_string(),
        output_count: rule.output_paths()?.len(),
        inputs,
        deps,
        env,
        toolchain,
        version: KEY_SCHEMA_VERSION.to_string(),
        commands,
        native: rule.native,
        hex: String::new(),
    }
    .seal()?;

    trace!(hex = %key.hex(), "computed cache key");
    let key = Arc::new(key);
    rule.store_key(key.clone());
    Ok(key)
}
