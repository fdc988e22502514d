//! Components: the units declared by manifests.
//!
//! A component owns rules and exports. The raw manifest definition is kept
//! after loading because rules are instantiated lazily: a parameterized
//! rule is a fresh instance per binding set, created the first time some
//! dependency (or the user) names it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, Weak},
};

use color_eyre::{Result, eyre::bail, eyre::eyre};
use tracing::trace;

use crate::{
    manifest::{ComponentDef, ToolchainItemDef},
    path::{AbsDirPath, RelDirPath},
    project::Project,
    resource::Resource,
    rule::Rule,
};

pub struct Component {
    project: Weak<Project>,
    name: String,
    app: String,
    kind: String,
    image: String,
    dir: AbsDirPath,
    rel_path: RelDirPath,
    environment: BTreeMap<String, String>,
    toolchain_items: Vec<ToolchainItemDef>,
    /// Raw merged definition, for deferred rule construction.
    def: ComponentDef,
    rules: Mutex<HashMap<String, Arc<Rule>>>,
    exports: BTreeMap<String, Arc<Export>>,
}

impl Component {
    pub(crate) fn new(
        project: Weak<Project>,
        def: ComponentDef,
        dir: AbsDirPath,
        rel_path: RelDirPath,
    ) -> Self {
        let exports = def
            .exports
            .iter()
            .map(|(name, export)| {
                let export = Export {
                    project: project.clone(),
                    component: def.name.clone(),
                    name: name.clone(),
                    dir: dir.clone(),
                    provider: export.provider.clone(),
                    resources: export.resources.clone(),
                    ignore: export.ignore.clone(),
                    memo: Mutex::new(None),
                };
                (name.clone(), Arc::new(export))
            })
            .collect();
        Self {
            project,
            name: def.name.clone(),
            app: def.app.clone(),
            kind: def.kind.clone(),
            image: def.docker.image.clone(),
            dir,
            rel_path,
            environment: def.environment.clone(),
            toolchain_items: def.toolchain.items.clone(),
            def,
            rules: Mutex::new(HashMap::new()),
            exports,
        }
    }

    pub fn project(&self) -> Arc<Project> {
        self.project.upgrade().expect("project outlives components")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The docker image commands run in, when the project uses containers.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Absolute directory holding the component's manifest.
    pub fn dir(&self) -> &AbsDirPath {
        &self.dir
    }

    /// The component directory relative to the project root.
    pub fn rel_path(&self) -> &RelDirPath {
        &self.rel_path
    }

    /// Whether the component declares the named rule.
    pub fn has_rule(&self, name: &str) -> bool {
        self.def.rules.contains_key(name)
    }

    /// Names of the rules the component declares, in order.
    pub fn rule_names(&self) -> Vec<String> {
        self.def.rules.keys().cloned().collect()
    }

    /// The named export, if declared.
    pub fn export(&self, name: &str) -> Option<Arc<Export>> {
        self.exports.get(name).cloned()
    }

    /// The component's effective environment: project environment with the
    /// component's own entries layered on top.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.project().environment().clone();
        env.extend(self.environment.clone());
        env
    }

    /// Get (or instantiate) the named rule with no parameter bindings.
    pub fn rule(self: &Arc<Self>, name: &str) -> Result<Arc<Rule>> {
        self.rule_with_params(name, BTreeMap::new())
    }

    /// Get (or instantiate) the named rule with the given bindings. Each
    /// distinct binding set is a distinct rule instance with its own node
    /// id and cache key.
    pub fn rule_with_params(
        self: &Arc<Self>,
        name: &str,
        parameters: BTreeMap<String, String>,
    ) -> Result<Arc<Rule>> {
        let qualified = Rule::parameterized_name(name, &parameters);
        let mut rules = self.rules.lock().expect("lock rules");
        if let Some(rule) = rules.get(&qualified) {
            return Ok(rule.clone());
        }
        let def = self
            .def
            .rules
            .get(name)
            .ok_or_else(|| eyre!("component {:?} has no rule {:?}", self.name, name))?;
        let rule = Rule::new(self, name, def, parameters)?;
        trace!(node = %rule.node_id(), "instantiated rule");
        rules.insert(qualified, rule.clone());
        Ok(rule)
    }

    /// Run every toolchain command and return `name -> captured stdout`,
    /// trimmed of trailing whitespace. Results are cached at project scope
    /// so a toolchain command runs at most once per `(image, command)`.
    pub fn toolchain(&self) -> Result<BTreeMap<String, String>> {
        let project = self.project();
        let mut out = BTreeMap::new();
        for item in &self.toolchain_items {
            let stdout =
                project.toolchain_output(&self.image, &item.command, &self.dir, &self.environment())?;
            out.insert(item.name.clone(), stdout);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// A named, memoized set of resources a component offers to others.
pub struct Export {
    project: Weak<Project>,
    component: String,
    name: String,
    dir: AbsDirPath,
    provider: String,
    resources: Vec<String>,
    ignore: Vec<String>,
    /// Memoized resolution; errors are memoized too, so a failed
    /// resolution returns the same error on every subsequent call.
    memo: Mutex<Option<Result<Vec<Arc<dyn Resource>>, String>>>,
}

impl Export {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Resolve the export's patterns into resources, once.
    pub fn resolve(&self) -> Result<Vec<Arc<dyn Resource>>> {
        let mut memo = self.memo.lock().expect("lock export memo");
        if let Some(result) = memo.as_ref() {
            return match result {
                Ok(resources) => Ok(resources.clone()),
                Err(message) => Err(eyre!("{message}")),
            };
        }

        let result = self.resolve_uncached();
        let memoized = match &result {
            Ok(resources) => Ok(resources.clone()),
            Err(err) => Err(format!(
                "resolve export {}.{}: {err:#}",
                self.component, self.name,
            )),
        };
        *memo = Some(memoized);
        result
    }

    fn resolve_uncached(&self) -> Result<Vec<Arc<dyn Resource>>> {
        let project = match self.project.upgrade() {
            Some(project) => project,
            None => bail!("project was dropped"),
        };
        let provider = project.provider(&self.provider)?;
        provider.match_resources(&self.dir, &self.resources, &self.ignore)
    }
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export")
            .field("component", &self.component)
            .field("name", &self.name)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}
