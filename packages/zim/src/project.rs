//! The project aggregate root.
//!
//! A project is created once at program start from the manifests under its
//! root. It owns the component registry, the toolchain cache, the provider
//! registry, and the executor handle. Components hold weak back-edges, so
//! the project must be kept alive by the caller for as long as any rule is
//! in use.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use color_eyre::{Result, eyre::Context, eyre::bail, eyre::eyre};
use itertools::Itertools;
use tracing::{debug, instrument};

use crate::{
    component::Component,
    exec::{BashExecutor, CancelToken, ExecOpts, Executor},
    manifest,
    path::{AbsDirPath, RelativeTo, TryJoinWith},
    resource::{self, Provider},
    rule::Rule,
};

/// Options for [`Project::load`].
pub struct ProjectOptions {
    /// Executor for rule commands. Defaults to the host bash executor.
    pub executor: Option<Arc<dyn Executor>>,
    pub cancel: CancelToken,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            executor: None,
            cancel: CancelToken::new(),
        }
    }
}

pub struct Project {
    name: String,
    root: AbsDirPath,
    artifacts_dir: AbsDirPath,
    environment: BTreeMap<String, String>,
    components: Vec<Arc<Component>>,
    index: HashMap<String, usize>,
    /// Captured toolchain stdout keyed by `command`, or `image command`
    /// when containerized. One lock covers both the read-miss and the
    /// executor call that fills it.
    toolchain: Mutex<BTreeMap<String, String>>,
    providers: Mutex<HashMap<String, Arc<dyn Provider>>>,
    executor: Arc<dyn Executor>,
    cancel: CancelToken,
}

impl Project {
    /// Load the project rooted at `root`: read the project manifest,
    /// discover and merge component manifests, and validate names.
    #[instrument(name = "Project::load", skip(options))]
    pub fn load(root: &AbsDirPath, options: ProjectOptions) -> Result<Arc<Self>> {
        let root = root.canonicalize()?;
        let def = manifest::load_project(&root)?;
        let loaded = manifest::load_components(&root, &def)?;
        debug!(components = loaded.len(), "loaded project manifests");

        let mut prepared = Vec::with_capacity(loaded.len());
        for component in loaded {
            let rel = component.dir.relative_to(&root).with_context(|| {
                format!("component {:?} lies outside the project", component.def.name)
            })?;
            prepared.push((component, rel));
        }

        let artifacts_dir = root.try_join_dir("artifacts")?;
        crate::fs::create_dir_all(&artifacts_dir)?;
        let executor = options
            .executor
            .unwrap_or_else(|| Arc::new(BashExecutor));

        let project = Arc::new_cyclic(|weak| {
            let components = prepared
                .into_iter()
                .map(|(loaded, rel)| {
                    Arc::new(Component::new(weak.clone(), loaded.def, loaded.dir, rel))
                })
                .collect_vec();
            let index = components
                .iter()
                .enumerate()
                .map(|(i, c)| (c.name().to_string(), i))
                .collect();
            Self {
                name: def.name,
                root,
                artifacts_dir,
                environment: def.environment,
                components,
                index,
                toolchain: Mutex::new(BTreeMap::new()),
                providers: Mutex::new(HashMap::new()),
                executor,
                cancel: options.cancel,
            }
        });
        Ok(project)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &AbsDirPath {
        &self.root
    }

    pub fn artifacts_dir(&self) -> &AbsDirPath {
        &self.artifacts_dir
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn components(&self) -> &[Arc<Component>] {
        &self.components
    }

    pub fn component(&self, name: &str) -> Option<Arc<Component>> {
        self.index.get(name).map(|i| self.components[*i].clone())
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The provider registered under `name`, created on first use.
    pub fn provider(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let mut providers = self.providers.lock().expect("lock providers");
        if let Some(provider) = providers.get(name) {
            return Ok(provider.clone());
        }
        let provider = resource::create(name)?;
        providers.insert(name.to_string(), provider.clone());
        Ok(provider)
    }

    /// Captured stdout of a toolchain command, trimmed of trailing
    /// whitespace. The command runs at most once per `(image, command)`
    /// pair for the life of the project, even across components.
    pub fn toolchain_output(
        &self,
        image: &str,
        command: &str,
        working_dir: &AbsDirPath,
        env: &BTreeMap<String, String>,
    ) -> Result<String> {
        let containerized = !image.is_empty() && self.executor.uses_container();
        let key = if containerized {
            format!("{image} {command}")
        } else {
            command.to_string()
        };

        let mut cache = self.toolchain.lock().expect("lock toolchain cache");
        if let Some(stdout) = cache.get(&key) {
            return Ok(stdout.clone());
        }

        let opts = ExecOpts {
            name: format!("toolchain.{}", cache.len()),
            command: command.to_string(),
            working_dir: working_dir.clone(),
            env: env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            image: if containerized { image.to_string() } else { String::new() },
            output: None,
            capture: true,
            cancel: self.cancel.clone(),
        };
        let status = if containerized {
            self.executor.execute(opts)
        } else {
            BashExecutor.execute(opts)
        }
        .with_context(|| format!("run toolchain command {command:?}"))?;
        if !status.success() {
            bail!("toolchain command {command:?} failed with {:?}", status.code);
        }

        let stdout = status.stdout.trim_end().to_string();
        debug!(%command, %stdout, "captured toolchain output");
        cache.insert(key, stdout.clone());
        Ok(stdout)
    }

    /// Resolve target names into rules. A bare `rule` selects that rule
    /// from every component declaring it; `component.rule` selects one.
    pub fn resolve_targets(&self, names: &[String]) -> Result<Vec<Arc<Rule>>> {
        let mut targets: Vec<Arc<Rule>> = Vec::new();
        for name in names {
            match name.split_once('.') {
                Some((component, rule)) => {
                    let component = self
                        .component(component)
                        .ok_or_else(|| eyre!("component not found: {component}"))?;
                    targets.push(component.rule(rule)?);
                }
                None => {
                    let mut found = false;
                    for component in &self.components {
                        if component.has_rule(name) {
                            targets.push(component.rule(name)?);
                            found = true;
                        }
                    }
                    if !found {
                        bail!("rule not found in any component: {name}");
                    }
                }
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        targets.retain(|rule| seen.insert(rule.node_id()));
        Ok(targets)
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("components", &self.components.len())
            .finish_non_exhaustive()
    }
}
