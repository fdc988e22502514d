//! Manifest definitions, discovery, and kind-template merging.
//!
//! A component is declared by a `component.yaml` (or `zim.yaml`) file; the
//! project itself may carry `.zim/project.yaml`. Definitions are plain
//! serde structs, kept around after project construction so rules can be
//! instantiated lazily (parameterized rules are built per binding set).
//!
//! Template merging is template-first, component-second: scalars override
//! when the later value is non-zero, string lists replace entirely when
//! non-empty, maps union with right bias, and rules merge per key with the
//! same field rules.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context, eyre::ContextCompat, eyre::bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::{
    fs, glob,
    path::{AbsDirPath, AbsFilePath, TryJoinWith},
};

/// Project manifest, `<root>/.zim/project.yaml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDef {
    pub name: String,
    /// Glob patterns selecting component directories. When empty, the
    /// loader walks the tree for component manifests instead.
    pub components: Vec<String>,
    pub providers: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
}

/// Component manifest, `component.yaml` or `zim.yaml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentDef {
    pub name: String,
    pub app: String,
    pub kind: String,
    /// Whole-component opt-out.
    pub ignore: bool,
    pub docker: DockerDef,
    pub ecs: EcsDef,
    pub toolchain: ToolchainDef,
    pub rules: BTreeMap<String, RuleDef>,
    pub exports: BTreeMap<String, ExportDef>,
    pub environment: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerDef {
    pub image: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EcsDef {
    pub task: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub memory: u64,
    pub cpu: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainDef {
    pub items: Vec<ToolchainItemDef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainItemDef {
    pub name: String,
    pub command: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDef {
    pub description: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub ignore: Vec<String>,
    /// Outputs land in the component directory instead of the artifacts
    /// directory.
    pub local: bool,
    /// Force host execution even when the project uses containers.
    pub native: bool,
    pub requires: Vec<RequireDef>,
    pub command: String,
    pub commands: Vec<CommandDef>,
    pub providers: RuleProvidersDef,
    pub parameters: BTreeMap<String, String>,
    pub when: Option<ConditionDef>,
    pub unless: Option<ConditionDef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleProvidersDef {
    pub inputs: String,
    pub outputs: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequireDef {
    pub component: String,
    pub rule: String,
    pub export: String,
    pub recurse: u32,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDef {
    pub provider: String,
    pub resources: Vec<String>,
    pub ignore: Vec<String>,
}

/// A condition guarding rule execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionDef {
    pub resource_exists: String,
    pub script_succeeds: Option<ScriptConditionDef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConditionDef {
    pub run: String,
    pub with_output: String,
    pub suppress_error: bool,
}

/// One command within a rule. In YAML this is either a bare string, which
/// runs in the shell, or a single-key map naming the command kind:
///
/// ```yaml
/// commands:
///   - go build
///   - mkdir: dist
///   - zip:
///       input: dist
///       output: dist.zip
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandDef {
    Shell(String),
    Kinded(BTreeMap<String, CommandArgDef>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArgDef {
    Argument(String),
    Attributes(BTreeMap<String, String>),
}

/// File names recognized as component manifests.
const COMPONENT_MANIFESTS: &[&str] = &["component.yaml", "zim.yaml"];

/// A discovered and template-merged component definition, paired with the
/// directory that declared it.
#[derive(Clone, Debug)]
pub struct LoadedComponent {
    pub dir: AbsDirPath,
    pub def: ComponentDef,
}

/// Load the project manifest if one exists.
pub fn load_project(root: &AbsDirPath) -> Result<ProjectDef> {
    let path = root.try_join_file(".zim/project.yaml")?;
    if !fs::is_file(&path) {
        return Ok(ProjectDef::default());
    }
    let raw = fs::read_to_string(&path)?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse {path}"))
}

/// Load kind templates from `<root>/.zim/templates/*.yaml`, keyed by the
/// template's `kind` (falling back to the file stem).
pub fn load_templates(root: &AbsDirPath) -> Result<BTreeMap<String, ComponentDef>> {
    let dir = root.try_join_dir(".zim/templates")?;
    let mut templates = BTreeMap::new();
    if !fs::is_dir(&dir) {
        return Ok(templates);
    }
    for path in glob::match_pattern(&dir, "*.yaml")? {
        let raw = fs::read_to_string(&path)?;
        let def: ComponentDef =
            serde_yaml::from_str(&raw).with_context(|| format!("parse template {path}"))?;
        let kind = if def.kind.is_empty() {
            path.as_std_path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            def.kind.clone()
        };
        trace!(%kind, %path, "loaded template");
        templates.insert(kind, def);
    }
    Ok(templates)
}

/// Discover, parse, and template-merge every component under `root`.
///
/// When the project manifest lists component patterns, only directories
/// matched by those patterns are considered; otherwise the tree is walked
/// for manifest files, skipping `.zim`, the artifacts directory, and
/// hidden directories.
pub fn load_components(root: &AbsDirPath, project: &ProjectDef) -> Result<Vec<LoadedComponent>> {
    let templates = load_templates(root)?;
    let mut manifests: Vec<AbsFilePath> = Vec::new();

    if project.components.is_empty() {
        for entry in WalkDir::new(root.as_std_path())
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !(e.file_type().is_dir()
                    && (name == "artifacts" || (name.starts_with('.') && e.depth() > 0)))
            })
        {
            let entry = entry?;
            if entry.file_type().is_file()
                && COMPONENT_MANIFESTS
                    .iter()
                    .any(|m| entry.file_name().to_string_lossy() == *m)
            {
                manifests.push(AbsFilePath::try_from(entry.path())?);
            }
        }
    } else {
        for pattern in &project.components {
            for manifest_name in COMPONENT_MANIFESTS {
                let pattern = format!("{}/{}", pattern.trim_end_matches('/'), manifest_name);
                manifests.extend(glob::match_pattern(root, &pattern)?);
            }
        }
        manifests.sort();
        manifests.dedup();
    }

    let mut loaded = Vec::new();
    let mut seen = BTreeMap::new();
    for manifest in manifests {
        let raw = fs::read_to_string(&manifest)?;
        let def: ComponentDef =
            serde_yaml::from_str(&raw).with_context(|| format!("parse {manifest}"))?;
        if def.ignore {
            debug!(%manifest, "component is ignored");
            continue;
        }
        if def.name.is_empty() {
            bail!("component manifest has no name: {manifest}");
        }

        let def = match templates.get(&def.kind) {
            Some(template) => merge_component(template, def),
            None if def.kind.is_empty() => def,
            None => bail!("unknown component kind {:?} in {manifest}", def.kind),
        };

        let dir = manifest
            .parent()
            .with_context(|| format!("manifest {manifest} has no parent directory"))?;
        if let Some(previous) = seen.insert(def.name.clone(), dir.clone()) {
            bail!(
                "duplicate component name {:?} declared in {previous} and {dir}",
                def.name,
            );
        }
        loaded.push(LoadedComponent { dir, def });
    }
    Ok(loaded)
}

/// Merge a component definition over its kind template.
pub fn merge_component(template: &ComponentDef, component: ComponentDef) -> ComponentDef {
    let mut out = template.clone();
    merge_string(&mut out.name, component.name);
    merge_string(&mut out.app, component.app);
    merge_string(&mut out.kind, component.kind);
    merge_string(&mut out.docker.image, component.docker.image);
    merge_string(&mut out.ecs.task, component.ecs.task);
    merge_string(&mut out.ecs.kind, component.ecs.kind);
    if component.ecs.memory != 0 {
        out.ecs.memory = component.ecs.memory;
    }
    if component.ecs.cpu != 0 {
        out.ecs.cpu = component.ecs.cpu;
    }
    if !component.toolchain.items.is_empty() {
        out.toolchain = component.toolchain;
    }
    out.environment.extend(component.environment);
    for (name, export) in component.exports {
        out.exports.insert(name, export);
    }
    for (name, rule) in component.rules {
        match out.rules.remove(&name) {
            Some(base) => out.rules.insert(name, merge_rule(base, rule)),
            None => out.rules.insert(name, rule),
        };
    }
    out
}

fn merge_rule(base: RuleDef, over: RuleDef) -> RuleDef {
    let mut out = base;
    merge_string(&mut out.description, over.description);
    merge_string(&mut out.command, over.command);
    merge_string(&mut out.providers.inputs, over.providers.inputs);
    merge_string(&mut out.providers.outputs, over.providers.outputs);
    if !over.inputs.is_empty() {
        out.inputs = over.inputs;
    }
    if !over.outputs.is_empty() {
        out.outputs = over.outputs;
    }
    if !over.ignore.is_empty() {
        out.ignore = over.ignore;
    }
    if over.local {
        out.local = true;
    }
    if over.native {
        out.native = true;
    }
    if !over.requires.is_empty() {
        out.requires = over.requires;
    }
    if !over.commands.is_empty() {
        out.commands = over.commands;
    }
    out.parameters.extend(over.parameters);
    if over.when.is_some() {
        out.when = over.when;
    }
    if over.unless.is_some() {
        out.unless = over.unless;
    }
    out
}

fn merge_string(base: &mut String, over: String) {
    if !over.is_empty() {
        *base = over;
    }
}
