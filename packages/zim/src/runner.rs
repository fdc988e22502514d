//! Rule runners and the middleware chain.
//!
//! The scheduler invokes one [`Runner`]; that runner is the composition of
//! middleware layers around [`StandardRunner`]. Each layer may transform
//! the options, short-circuit (returning `Cached` or `Skipped`), or pass
//! through. Layers are applied in reverse, so
//! `Chain::new([a, b, c]).then(base)` behaves as `a(b(c(base)))`.

use std::{
    collections::BTreeMap,
    io::Write,
    sync::{Arc, Mutex},
    time::Instant,
};

use color_eyre::{Report, Result, eyre::bail, eyre::eyre};
use colored::Colorize;
use tracing::{debug, warn};

use crate::{
    exec::{BashExecutor, CancelToken, ExecOpts, ExecStatus, Executor, OutputSink, sink},
    manifest::ConditionDef,
    rule::{Command, Rule},
};

/// The observable end state of one rule execution.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub enum Code {
    /// A condition turned the rule off.
    Skipped,
    /// The rule's outputs came from the cache.
    Cached,
    /// The rule ran and produced its outputs.
    Ok,
    /// The rule failed before or around execution.
    Error,
    /// A command failed inside the executor.
    ExecError,
    /// The commands succeeded but a declared output is absent.
    MissingOutput,
}

impl Code {
    pub fn is_failure(self) -> bool {
        matches!(self, Code::Error | Code::ExecError | Code::MissingOutput)
    }
}

/// A [`Code`] paired with the error that produced it, if any.
#[derive(Debug)]
pub struct Outcome {
    pub code: Code,
    pub error: Option<Report>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self { code: Code::Ok, error: None }
    }

    pub fn cached() -> Self {
        Self { code: Code::Cached, error: None }
    }

    pub fn skipped() -> Self {
        Self { code: Code::Skipped, error: None }
    }

    pub fn failed(code: Code, error: Report) -> Self {
        Self { code, error: Some(error) }
    }

    pub fn is_failure(&self) -> bool {
        self.code.is_failure()
    }
}

/// Per-invocation options threaded through the chain.
#[derive(Clone)]
pub struct RunOpts {
    /// Combined stdout/stderr sink for rule commands.
    pub output: OutputSink,
    /// Emit resolved rule state before running.
    pub debug: bool,
    pub cancel: CancelToken,
}

impl RunOpts {
    pub fn new() -> Self {
        Self {
            output: sink(std::io::stderr()),
            debug: false,
            cancel: CancelToken::new(),
        }
    }
}

impl Default for RunOpts {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one rule to completion.
pub trait Runner: Send + Sync {
    fn run(&self, rule: &Arc<Rule>, opts: RunOpts) -> Outcome;
}

/// A layer wrapping a runner.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn Runner>) -> Arc<dyn Runner>;
}

/// An ordered list of middleware applied around a base runner.
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    /// Wrap `base` with every middleware, first entry outermost.
    pub fn then(self, base: Arc<dyn Runner>) -> Arc<dyn Runner> {
        self.middlewares
            .into_iter()
            .rev()
            .fold(base, |next, middleware| middleware.wrap(next))
    }
}

/// The base runner: conditions, executor selection, environment assembly,
/// per-command dispatch, and output verification.
pub struct StandardRunner;

impl Runner for StandardRunner {
    fn run(&self, rule: &Arc<Rule>, opts: RunOpts) -> Outcome {
        if let Some(when) = rule.when() {
            match evaluate_condition(rule, when) {
                Ok(true) => {}
                Ok(false) => return Outcome::skipped(),
                Err(err) => return Outcome::failed(Code::Error, err),
            }
        }
        if let Some(unless) = rule.unless() {
            match evaluate_condition(rule, unless) {
                Ok(false) => {}
                Ok(true) => return Outcome::skipped(),
                Err(err) => return Outcome::failed(Code::Error, err),
            }
        }

        let component = rule.component();
        let executor: Arc<dyn Executor> = if rule.native || component.image().is_empty() {
            Arc::new(BashExecutor)
        } else {
            component.project().executor()
        };

        let env = match rule.exec_environment(executor.as_ref()) {
            Ok(env) => env_pairs(&env),
            Err(err) => return Outcome::failed(Code::Error, err),
        };

        for (index, command) in rule.commands().iter().enumerate() {
            let name = format!("{}.{}", rule.node_id(), index);
            let outcome = dispatch(rule, command, &name, &env, executor.as_ref(), &opts);
            if outcome.is_failure() {
                return outcome;
            }
        }

        verify_outputs(rule)
    }
}

fn env_pairs(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Run one command, composing a shell line for the file-management kinds.
/// Only `run` commands use the selected executor; everything else is host
/// file manipulation.
fn dispatch(
    rule: &Arc<Rule>,
    command: &Command,
    name: &str,
    env: &[String],
    executor: &dyn Executor,
    opts: &RunOpts,
) -> Outcome {
    let component = rule.component();
    let compose = match command.kind.as_str() {
        "run" => {
            let exec_opts = ExecOpts {
                name: name.to_string(),
                command: command.argument.clone(),
                working_dir: component.dir().clone(),
                env: env.to_vec(),
                image: component.image().to_string(),
                output: Some(opts.output.clone()),
                capture: false,
                cancel: opts.cancel.clone(),
            };
            return status_outcome(name, executor.execute(exec_opts));
        }
        "zip" => {
            let output = match command.attr("output") {
                Some(output) if !output.is_empty() => output,
                _ => return missing_attr(name, "zip", "output"),
            };
            let options = command.attr_or("options", "-qrFS");
            let input = command.attr_or("input", ".");
            match command.attr("cd") {
                Some(cd) if !cd.is_empty() => {
                    format!("cd {cd} && zip {options} {output} {input}")
                }
                _ => format!("zip {options} {output} {input}"),
            }
        }
        "archive" => {
            let (Some(input), Some(output)) = (command.attr("input"), command.attr("output"))
            else {
                return missing_attr(name, "archive", "input and output");
            };
            let options = command.attr_or("options", "-czf");
            format!("tar {options} {output} {input}")
        }
        "mkdir" => format!("mkdir -p {}", command.argument),
        "cleandir" => {
            let dir = &command.argument;
            if dir == "/" {
                return Outcome::failed(Code::Error, eyre!("refusing to clean {dir:?} in {name}"));
            }
            format!("rm -rf {dir} && mkdir -p {dir}")
        }
        "remove" => format!("rm -rf {}", command.argument),
        "move" => {
            let (Some(src), Some(dst)) = (command.attr("src"), command.attr("dst")) else {
                return missing_attr(name, "move", "src and dst");
            };
            format!("mv {src} {dst}")
        }
        "copy" => {
            let (Some(src), Some(dst)) = (command.attr("src"), command.attr("dst")) else {
                return missing_attr(name, "copy", "src and dst");
            };
            format!("cp -R {src} {dst}")
        }
        other => {
            return Outcome::failed(Code::Error, eyre!("unknown command kind {other:?} in {name}"));
        }
    };

    let exec_opts = ExecOpts {
        name: name.to_string(),
        command: compose,
        working_dir: component.dir().clone(),
        env: env.to_vec(),
        image: String::new(),
        output: Some(opts.output.clone()),
        capture: false,
        cancel: opts.cancel.clone(),
    };
    status_outcome(name, BashExecutor.execute(exec_opts))
}

fn missing_attr(name: &str, kind: &str, attr: &str) -> Outcome {
    Outcome::failed(Code::Error, eyre!("{kind} command in {name} requires {attr}"))
}

fn status_outcome(name: &str, status: Result<ExecStatus>) -> Outcome {
    match status {
        Ok(status) if status.success() => Outcome::ok(),
        Ok(status) if status.cancelled => {
            Outcome::failed(Code::ExecError, eyre!("{name}: context canceled"))
        }
        Ok(status) => match status.code {
            Some(code) => {
                Outcome::failed(Code::ExecError, eyre!("{name} failed with exit code {code}"))
            }
            None => Outcome::failed(Code::ExecError, eyre!("{name}: signal: killed")),
        },
        Err(err) => Outcome::failed(Code::Error, err),
    }
}

fn verify_outputs(rule: &Arc<Rule>) -> Outcome {
    let outputs = match rule.outputs() {
        Ok(outputs) => outputs,
        Err(err) => return Outcome::failed(Code::Error, err),
    };
    let missing: Vec<String> = outputs
        .iter()
        .filter(|output| !output.exists())
        .map(|output| output.path().as_str_lossy().into_owned())
        .collect();
    if missing.is_empty() {
        Outcome::ok()
    } else {
        Outcome::failed(
            Code::MissingOutput,
            eyre!("{} missing outputs: {}", rule.node_id(), missing.join(", ")),
        )
    }
}

/// Evaluate a `when`/`unless` condition.
fn evaluate_condition(rule: &Arc<Rule>, condition: &ConditionDef) -> Result<bool> {
    let component = rule.component();
    if !condition.resource_exists.is_empty() {
        let matched = rule.input_provider().match_resources(
            component.dir(),
            std::slice::from_ref(&condition.resource_exists),
            &[],
        )?;
        return Ok(!matched.is_empty());
    }

    if let Some(script) = &condition.script_succeeds {
        let status = BashExecutor.execute(ExecOpts {
            name: format!("{}.condition", rule.node_id()),
            command: script.run.clone(),
            working_dir: component.dir().clone(),
            env: env_pairs(&rule.base_environment()),
            image: String::new(),
            output: None,
            capture: true,
            cancel: CancelToken::new(),
        })?;
        if !status.success() {
            if script.suppress_error {
                return Ok(false);
            }
            bail!(
                "condition script for {} failed with {:?}",
                rule.node_id(),
                status.code,
            );
        }
        if !script.with_output.is_empty() {
            return Ok(status.stdout.trim() == script.with_output);
        }
        return Ok(true);
    }

    Ok(true)
}

/// Emits the colored per-rule status line with elapsed time.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn wrap(&self, next: Arc<dyn Runner>) -> Arc<dyn Runner> {
        Arc::new(LoggerRunner { next })
    }
}

struct LoggerRunner {
    next: Arc<dyn Runner>,
}

impl Runner for LoggerRunner {
    fn run(&self, rule: &Arc<Rule>, opts: RunOpts) -> Outcome {
        let started = Instant::now();
        let outcome = self.next.run(rule, opts);
        let elapsed = started.elapsed().as_secs_f64();

        let message = outcome
            .error
            .as_ref()
            .map(|err| format!("{err:#}"))
            .unwrap_or_default();
        let tag = match outcome.code {
            Code::Ok => "[OK]".green(),
            Code::Cached => "[CACHED]".cyan(),
            Code::Skipped => "[SKIPPED]".yellow(),
            _ if message.contains("signal: killed") || message.contains("context canceled") => {
                "[KILLED]".red()
            }
            _ => "[FAILED]".red(),
        };
        if message.is_empty() {
            eprintln!("{tag} {} ({elapsed:.2}s)", rule.node_id());
        } else {
            eprintln!("{tag} {} ({elapsed:.2}s): {message}", rule.node_id());
        }
        outcome
    }
}

/// Buffers rule output and flushes it only on failure, keeping parallel
/// output readable.
pub struct BufferedOutputMiddleware;

impl Middleware for BufferedOutputMiddleware {
    fn wrap(&self, next: Arc<dyn Runner>) -> Arc<dyn Runner> {
        Arc::new(BufferedOutputRunner { next })
    }
}

struct BufferedOutputRunner {
    next: Arc<dyn Runner>,
}

/// Write adapter over a shared byte buffer.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("lock buffer").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Runner for BufferedOutputRunner {
    fn run(&self, rule: &Arc<Rule>, opts: RunOpts) -> Outcome {
        let buffer = SharedBuffer::default();
        let buffered = RunOpts {
            output: sink(buffer.clone()),
            ..opts.clone()
        };
        let outcome = self.next.run(rule, buffered);
        if outcome.is_failure() {
            let held = buffer.0.lock().expect("lock buffer");
            if !held.is_empty() {
                let mut original = opts.output.lock().expect("lock output sink");
                if let Err(err) = original.write_all(&held) {
                    warn!(?err, "failed to flush buffered output");
                }
            }
        }
        outcome
    }
}

/// Logs resolved rule state before delegating, when `--debug` is set.
pub struct DebugMiddleware;

impl Middleware for DebugMiddleware {
    fn wrap(&self, next: Arc<dyn Runner>) -> Arc<dyn Runner> {
        Arc::new(DebugRunner { next })
    }
}

struct DebugRunner {
    next: Arc<dyn Runner>,
}

impl Runner for DebugRunner {
    fn run(&self, rule: &Arc<Rule>, opts: RunOpts) -> Outcome {
        if opts.debug {
            let inputs = rule
                .inputs()
                .map(|inputs| {
                    inputs
                        .iter()
                        .map(|r| r.path().as_str_lossy().into_owned())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let outputs = rule
                .output_paths()
                .map(|paths| {
                    paths
                        .iter()
                        .map(|p| p.as_str_lossy().into_owned())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            debug!(
                node = %rule.node_id(),
                ?inputs,
                ?outputs,
                env = ?rule.base_environment(),
                "resolved rule",
            );
        }
        self.next.run(rule, opts)
    }
}
