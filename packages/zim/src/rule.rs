//! Rules: named build steps within a component.
//!
//! A rule's inputs, ignores, and outputs are `${VAR}`-substituted once at
//! construction from the rule's base environment. Dependencies are
//! resolved lazily and memoized; resolution failures (missing rule,
//! self-dependency, invalid recursion) surface through the scheduler as
//! errors on the requesting rule.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
};

use color_eyre::{Result, eyre::Context, eyre::bail, eyre::eyre};
use itertools::Itertools;
use serde::Serialize;

use crate::{
    component::{Component, Export},
    exec::Executor,
    key::CacheKey,
    manifest::{CommandArgDef, CommandDef, ConditionDef, RequireDef, RuleDef},
    path::{AbsFilePath, TryJoinWith},
    project::Project,
    resource::{Provider, Resource},
};

/// A declared edge from one rule to another rule or to an export.
#[derive(Clone, Debug)]
pub struct Dependency {
    /// Target component; the owning rule's component when blank.
    pub component: String,
    pub rule: String,
    pub export: String,
    pub recurse: u32,
    pub parameters: BTreeMap<String, String>,
}

/// One command of a rule, normalized from its manifest form.
#[derive(Clone, Debug, Serialize)]
pub struct Command {
    pub kind: String,
    pub argument: String,
    pub attributes: BTreeMap<String, String>,
}

impl Command {
    fn from_def(def: &CommandDef) -> Result<Self> {
        match def {
            CommandDef::Shell(argument) => Ok(Self {
                kind: "run".to_string(),
                argument: argument.clone(),
                attributes: BTreeMap::new(),
            }),
            CommandDef::Kinded(map) => {
                let (kind, arg) = match map.iter().exactly_one() {
                    Ok(entry) => entry,
                    Err(_) => bail!("command must name exactly one kind: {map:?}"),
                };
                let mut command = Self {
                    kind: kind.clone(),
                    argument: String::new(),
                    attributes: BTreeMap::new(),
                };
                match arg {
                    CommandArgDef::Argument(argument) => command.argument = argument.clone(),
                    CommandArgDef::Attributes(attributes) => {
                        command.attributes = attributes.clone();
                    }
                }
                Ok(command)
            }
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Attribute value, falling back to a default when unset or empty.
    pub fn attr_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.attr(name) {
            Some(value) if !value.is_empty() => value,
            _ => default,
        }
    }
}

pub struct Rule {
    component: Weak<Component>,
    name: String,
    parameterized: String,
    parameters: BTreeMap<String, String>,
    /// Outputs go into the component directory instead of the artifacts
    /// directory.
    pub local: bool,
    /// Force host execution even when the project uses containers.
    pub native: bool,
    inputs: Vec<String>,
    ignores: Vec<String>,
    outputs: Vec<String>,
    requires: Vec<Dependency>,
    commands: Vec<Command>,
    when: Option<ConditionDef>,
    unless: Option<ConditionDef>,
    in_provider: Arc<dyn Provider>,
    out_provider: Arc<dyn Provider>,
    resolved: Mutex<Option<Vec<Arc<Rule>>>>,
    key: Mutex<Option<Arc<CacheKey>>>,
}

impl Rule {
    /// The fully qualified rule name for a binding set: the bare name when
    /// there are no bindings, else `name[k=v,...]` with keys sorted.
    pub fn parameterized_name(name: &str, parameters: &BTreeMap<String, String>) -> String {
        if parameters.is_empty() {
            name.to_string()
        } else {
            let bindings = parameters
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .join(",");
            format!("{name}[{bindings}]")
        }
    }

    pub(crate) fn new(
        component: &Arc<Component>,
        name: &str,
        def: &RuleDef,
        parameters: BTreeMap<String, String>,
    ) -> Result<Arc<Self>> {
        let parameterized = Self::parameterized_name(name, &parameters);
        let node_id = format!("{}.{}", component.name(), parameterized);

        // Declared parameters are defaults; explicit bindings override them.
        let mut bindings = def.parameters.clone();
        bindings.extend(parameters);

        let mut env = component.environment();
        env.insert("COMPONENT".to_string(), component.name().to_string());
        env.insert("NAME".to_string(), component.name().to_string());
        env.insert("KIND".to_string(), component.kind().to_string());
        env.insert("RULE".to_string(), name.to_string());
        env.insert("NODE_ID".to_string(), node_id.clone());
        for (key, value) in &bindings {
            env.insert(key.clone(), value.clone());
        }

        let substitute_all =
            |patterns: &[String]| patterns.iter().map(|p| substitute(p, &env)).collect_vec();

        let mut commands = Vec::new();
        if !def.command.is_empty() {
            commands.push(Command {
                kind: "run".to_string(),
                argument: def.command.clone(),
                attributes: BTreeMap::new(),
            });
        }
        for command in &def.commands {
            commands.push(
                Command::from_def(command)
                    .with_context(|| format!("rule {node_id}"))?,
            );
        }

        let mut requires = Vec::new();
        for require in &def.requires {
            requires.push(Dependency::from_def(require, &node_id)?);
        }

        Ok(Arc::new(Self {
            component: Arc::downgrade(component),
            name: name.to_string(),
            parameterized,
            parameters: bindings,
            local: def.local,
            native: def.native,
            inputs: substitute_all(&def.inputs),
            ignores: substitute_all(&def.ignore),
            outputs: substitute_all(&def.outputs),
            requires,
            commands,
            when: def.when.clone(),
            unless: def.unless.clone(),
            in_provider: crate::resource::create(&def.providers.inputs)?,
            out_provider: crate::resource::create(&def.providers.outputs)?,
            resolved: Mutex::new(None),
            key: Mutex::new(None),
        }))
    }

    pub fn component(&self) -> Arc<Component> {
        self.component.upgrade().expect("component outlives rules")
    }

    pub fn project(&self) -> Arc<Project> {
        self.component().project()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameterized rule name, e.g. `build[arch=arm64]`.
    pub fn parameterized(&self) -> &str {
        &self.parameterized
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// The unique handle of the rule in the build graph.
    pub fn node_id(&self) -> String {
        format!("{}.{}", self.component().name(), self.parameterized)
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn when(&self) -> Option<&ConditionDef> {
        self.when.as_ref()
    }

    pub fn unless(&self) -> Option<&ConditionDef> {
        self.unless.as_ref()
    }

    pub fn input_provider(&self) -> &Arc<dyn Provider> {
        &self.in_provider
    }

    /// Direct dependency rules, in declaration order. Resolved on first
    /// call and memoized; resolution errors are returned each call.
    pub fn dependencies(self: &Arc<Self>) -> Result<Vec<Arc<Rule>>> {
        {
            let resolved = self.resolved.lock().expect("lock resolved deps");
            if let Some(deps) = resolved.as_ref() {
                return Ok(deps.clone());
            }
        }

        let component = self.component();
        let project = component.project();
        let mut deps = Vec::new();
        for require in self.requires.iter().filter(|r| !r.rule.is_empty()) {
            let target = if require.component.is_empty() {
                component.name()
            } else {
                require.component.as_str()
            };
            let target = project.component(target).ok_or_else(|| {
                eyre!(
                    "component {target:?} not found (required by {})",
                    self.node_id(),
                )
            })?;
            let dep = target
                .rule_with_params(&require.rule, require.parameters.clone())
                .with_context(|| format!("resolve requirement of {}", self.node_id()))?;
            if dep.node_id() == self.node_id() {
                bail!("rule {} depends on itself", self.node_id());
            }
            deps.push(dep);
        }

        let mut resolved = self.resolved.lock().expect("lock resolved deps");
        *resolved = Some(deps.clone());
        Ok(deps)
    }

    /// Exports imported by this rule, in declaration order.
    pub fn imports(&self) -> Result<Vec<Arc<Export>>> {
        let component = self.component();
        let project = component.project();
        let mut imports = Vec::new();
        for require in self.requires.iter().filter(|r| !r.export.is_empty()) {
            let target = if require.component.is_empty() {
                component.name()
            } else {
                require.component.as_str()
            };
            let target = project.component(target).ok_or_else(|| {
                eyre!(
                    "component {target:?} not found (required by {})",
                    self.node_id(),
                )
            })?;
            let export = target.export(&require.export).ok_or_else(|| {
                eyre!(
                    "component {:?} has no export {:?} (required by {})",
                    target.name(),
                    require.export,
                    self.node_id(),
                )
            })?;
            imports.push(export);
        }
        Ok(imports)
    }

    /// Resolved input resources: the rule's own patterns expanded with
    /// ignores removed, followed by imported export resources.
    pub fn inputs(&self) -> Result<Vec<Arc<dyn Resource>>> {
        let component = self.component();
        let mut inputs =
            self.in_provider
                .match_resources(component.dir(), &self.inputs, &self.ignores)?;
        for export in self.imports()? {
            inputs.extend(export.resolve()?);
        }
        Ok(inputs)
    }

    /// Absolute paths of the declared outputs: under the artifacts
    /// directory, or the component directory for `local` rules.
    pub fn output_paths(&self) -> Result<Vec<AbsFilePath>> {
        let component = self.component();
        let project = component.project();
        let base = if self.local {
            component.dir().clone()
        } else {
            project.artifacts_dir().clone()
        };
        self.outputs
            .iter()
            .map(|output| base.try_join_file(output))
            .collect()
    }

    /// Declared outputs as resources.
    pub fn outputs(&self) -> Result<Vec<Arc<dyn Resource>>> {
        Ok(self
            .output_paths()?
            .into_iter()
            .map(|path| self.out_provider.new_resource(path))
            .collect())
    }

    /// The base environment: component environment plus the standard rule
    /// variables and parameter bindings. This is the environment that
    /// participates in the cache key.
    pub fn base_environment(&self) -> BTreeMap<String, String> {
        let component = self.component();
        let mut env = component.environment();
        env.insert("COMPONENT".to_string(), component.name().to_string());
        env.insert("NAME".to_string(), component.name().to_string());
        env.insert("KIND".to_string(), component.kind().to_string());
        env.insert("RULE".to_string(), self.name.clone());
        env.insert("NODE_ID".to_string(), self.node_id());
        for (key, value) in &self.parameters {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// The executable environment: the base environment plus input,
    /// output, dependency, and artifact variables, with artifact paths as
    /// seen from inside the executor.
    pub fn exec_environment(
        self: &Arc<Self>,
        executor: &dyn Executor,
    ) -> Result<BTreeMap<String, String>> {
        let component = self.component();
        let project = component.project();
        let mut env = self.base_environment();

        let inputs = self
            .inputs()?
            .iter()
            .map(|r| {
                r.path()
                    .relative_from(component.dir())
                    .as_str_lossy()
                    .into_owned()
            })
            .collect_vec();
        if let Some(first) = inputs.first() {
            env.insert("INPUT".to_string(), first.clone());
        }

        let outputs = self
            .output_paths()?
            .iter()
            .map(|p| p.relative_from(component.dir()).as_str_lossy().into_owned())
            .collect_vec();
        if let Some(first) = outputs.first() {
            env.insert("OUTPUT".to_string(), first.clone());
        }
        env.insert("OUTPUTS".to_string(), outputs.join(" "));

        let mut dep_outputs = Vec::new();
        for dep in self.dependencies()? {
            for path in dep.output_paths()? {
                dep_outputs.push(path.relative_from(component.dir()).as_str_lossy().into_owned());
            }
        }
        if let Some(first) = dep_outputs.first() {
            env.insert("DEP".to_string(), first.clone());
        }
        env.insert("DEPS".to_string(), dep_outputs.join(" "));

        env.insert(
            "ARTIFACTS_DIR".to_string(),
            executor.executor_path(project.artifacts_dir().as_std_path()),
        );
        if let Some(first) = self.output_paths()?.first() {
            env.insert(
                "ARTIFACT".to_string(),
                executor.executor_path(first.as_std_path()),
            );
        }
        Ok(env)
    }

    /// Cached cache key, if one has been computed for this rule.
    pub(crate) fn cached_key(&self) -> Option<Arc<CacheKey>> {
        self.key.lock().expect("lock key").clone()
    }

    pub(crate) fn store_key(&self, key: Arc<CacheKey>) {
        *self.key.lock().expect("lock key") = Some(key);
    }
}

impl Dependency {
    fn from_def(def: &RequireDef, node_id: &str) -> Result<Self> {
        if def.rule.is_empty() == def.export.is_empty() {
            bail!(
                "requirement of {node_id} must name exactly one of rule or export: {def:?}",
            );
        }
        if def.recurse > 1 {
            bail!(
                "requirement of {node_id} has invalid recurse value {}",
                def.recurse,
            );
        }
        Ok(Self {
            component: def.component.clone(),
            rule: def.rule.clone(),
            export: def.export.clone(),
            recurse: def.recurse,
            parameters: def.parameters.clone(),
        })
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("node_id", &self.node_id())
            .field("local", &self.local)
            .field("native", &self.native)
            .finish_non_exhaustive()
    }
}

/// One-pass `${VAR}` substitution from the environment. Unknown variables
/// are left in place; there are no nesting semantics.
pub fn substitute(text: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
