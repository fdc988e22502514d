//! Command executors.
//!
//! The runner hands every command to an [`Executor`]: either the host bash
//! shell or a `docker run` wrapper. The executor owns process lifecycle,
//! output plumbing, and cancellation; callers only see an [`ExecStatus`].
//!
//! Container runtimes do not reap containers when the parent process dies,
//! so the docker executor kills in-flight containers by name on
//! cancellation.

use std::{
    io::{Read, Write},
    path::Path,
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, trace, warn};

use crate::path::AbsDirPath;

/// Cooperative cancellation flag shared by the scheduler and executors.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for wiring up signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

/// Where command output goes. Shared so middleware can swap the sink for a
/// buffer without the executor knowing.
pub type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Build a sink over any writer.
pub fn sink(writer: impl Write + Send + 'static) -> OutputSink {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// One command execution request.
pub struct ExecOpts {
    /// Stable name for the execution, used to name containers.
    pub name: String,
    /// The shell command to run.
    pub command: String,
    pub working_dir: AbsDirPath,
    /// Environment as `KEY=value` pairs, overlaid on the process env.
    pub env: Vec<String>,
    /// Container image; ignored by the host executor.
    pub image: String,
    /// Combined stdout/stderr sink. `None` discards output.
    pub output: Option<OutputSink>,
    /// Capture stdout into the returned status instead of the sink.
    pub capture: bool,
    pub cancel: CancelToken,
}

/// The observed end state of a command.
#[derive(Clone, Debug, Default)]
pub struct ExecStatus {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Captured stdout, when requested.
    pub stdout: String,
    /// The command was torn down because the token was cancelled.
    pub cancelled: bool,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.cancelled
    }
}

/// A backend able to run commands.
pub trait Executor: Send + Sync {
    /// Run the command to completion.
    ///
    /// Errors are reserved for failures to run at all (spawn, I/O); a
    /// command that ran and exited non-zero is a non-error [`ExecStatus`].
    fn execute(&self, opts: ExecOpts) -> Result<ExecStatus>;

    /// Whether commands run inside a container.
    fn uses_container(&self) -> bool;

    /// Translate a host-absolute path to the path the executed command
    /// sees. Identity for the host shell.
    fn executor_path(&self, path: &Path) -> String;
}

/// Runs commands under `bash -c` on the host.
#[derive(Clone, Debug, Default)]
pub struct BashExecutor;

impl Executor for BashExecutor {
    fn execute(&self, opts: ExecOpts) -> Result<ExecStatus> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&opts.command)
            .current_dir(opts.working_dir.as_std_path());
        for pair in &opts.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }
        debug!(name = %opts.name, command = %opts.command, "execute on host");
        run_child(cmd, opts, None)
    }

    fn uses_container(&self) -> bool {
        false
    }

    fn executor_path(&self, path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }
}

/// Runs commands inside `docker run`, mounting the project root.
#[derive(Clone, Debug)]
pub struct DockerExecutor {
    root: AbsDirPath,
    mount: String,
}

impl DockerExecutor {
    pub const DEFAULT_MOUNT: &'static str = "/build";

    pub fn new(root: AbsDirPath) -> Self {
        Self {
            root,
            mount: Self::DEFAULT_MOUNT.to_string(),
        }
    }
}

impl Executor for DockerExecutor {
    fn execute(&self, opts: ExecOpts) -> Result<ExecStatus> {
        if opts.image.is_empty() {
            color_eyre::eyre::bail!("docker executor requires an image for {}", opts.name);
        }
        let container = opts.name.replace(['/', ':'], "-");
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&container)
            .arg("-v")
            .arg(format!("{}:{}", self.root, self.mount))
            .arg("-w")
            .arg(self.executor_path(opts.working_dir.as_std_path()));
        for pair in &opts.env {
            cmd.arg("-e").arg(pair);
        }
        cmd.arg(&opts.image).arg("bash").arg("-c").arg(&opts.command);
        debug!(name = %opts.name, image = %opts.image, command = %opts.command, "execute in container");
        run_child(cmd, opts, Some(container))
    }

    fn uses_container(&self) -> bool {
        true
    }

    fn executor_path(&self, path: &Path) -> String {
        match path.strip_prefix(self.root.as_std_path()) {
            Ok(rel) if rel.as_os_str().is_empty() => self.mount.clone(),
            Ok(rel) => format!("{}/{}", self.mount, rel.to_string_lossy()),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }
}

/// Spawn the child, stream its output, and poll for exit or cancellation.
fn run_child(mut cmd: Command, opts: ExecOpts, container: Option<String>) -> Result<ExecStatus> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn command for {}", opts.name))?;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");
    let out_handle = std::thread::spawn(move || read_all(stdout));
    let err_handle = std::thread::spawn(move || read_all(stderr));

    let mut cancelled = false;
    let status = loop {
        if opts.cancel.is_cancelled() && !cancelled {
            cancelled = true;
            kill(&mut child, container.as_deref());
        }
        match child.try_wait().context("wait for command")? {
            Some(status) => break status,
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    };

    let stdout = out_handle.join().expect("join stdout reader");
    let stderr = err_handle.join().expect("join stderr reader");
    trace!(name = %opts.name, code = ?status.code(), "command finished");

    let captured = if opts.capture {
        String::from_utf8_lossy(&stdout).into_owned()
    } else {
        String::new()
    };
    if let Some(sink) = &opts.output {
        let mut sink = sink.lock().expect("lock output sink");
        if !opts.capture {
            sink.write_all(&stdout).context("write command stdout")?;
        }
        sink.write_all(&stderr).context("write command stderr")?;
    }

    Ok(ExecStatus {
        code: status.code(),
        stdout: captured,
        cancelled,
    })
}

fn read_all(mut from: impl Read) -> Vec<u8> {
    let mut buffer = Vec::new();
    // A read error just truncates what we saw; the exit status is what
    // decides success.
    let _ = from.read_to_end(&mut buffer);
    buffer
}

fn kill(child: &mut Child, container: Option<&str>) {
    if let Err(err) = child.kill() {
        warn!(?err, "failed to kill command");
    }
    if let Some(name) = container {
        // The docker CLI client dying does not stop the container, so tear
        // it down by name.
        let result = Command::new("docker")
            .arg("kill")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(err) = result {
            warn!(?err, container = %name, "failed to kill container");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn opts(command: &str, capture: bool) -> ExecOpts {
        ExecOpts {
            name: "test.0".to_string(),
            command: command.to_string(),
            working_dir: AbsDirPath::current().unwrap(),
            env: Vec::new(),
            image: String::new(),
            output: None,
            capture,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn bash_executor_reports_exit_codes() {
        let exec = BashExecutor;
        assert!(exec.execute(opts("true", false)).unwrap().success());
        let failed = exec.execute(opts("exit 3", false)).unwrap();
        assert_eq!(failed.code, Some(3));
        assert!(!failed.success());
    }

    #[test]
    fn bash_executor_captures_stdout() {
        let exec = BashExecutor;
        let status = exec.execute(opts("echo EXAMPLE", true)).unwrap();
        assert_eq!(status.stdout, "EXAMPLE\n");
    }

    #[test]
    fn bash_executor_overlays_env() {
        let exec = BashExecutor;
        let mut o = opts("echo $WIDGET", true);
        o.env = vec!["WIDGET=42".to_string()];
        assert_eq!(exec.execute(o).unwrap().stdout, "42\n");
    }

    #[test]
    fn docker_paths_are_translated_under_the_mount() {
        let exec = DockerExecutor::new(AbsDirPath::try_from("/repo").unwrap());
        assert_eq!(exec.executor_path(Path::new("/repo/widget")), "/build/widget");
        assert_eq!(exec.executor_path(Path::new("/repo")), "/build");
        assert_eq!(exec.executor_path(Path::new("/elsewhere")), "/elsewhere");
    }

    #[test]
    fn cancellation_tears_down_the_command() {
        let exec = BashExecutor;
        let mut o = opts("sleep 30", false);
        let cancel = o.cancel.clone();
        cancel.cancel();
        let status = exec.execute(o).unwrap();
        assert!(status.cancelled);
        assert!(!status.success());
    }
}
