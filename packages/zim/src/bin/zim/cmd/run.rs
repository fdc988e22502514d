use std::{path::PathBuf, sync::Arc};

use clap::{Parser, ValueEnum};
use color_eyre::{Result, eyre::Context, eyre::bail};
use zim::{
    cache::{CacheMiddleware, CacheMode},
    exec::{CancelToken, sink},
    path::TryJoinWith,
    runner::{
        BufferedOutputMiddleware, Chain, DebugMiddleware, LoggerMiddleware, RunOpts,
        StandardRunner,
    },
    sched::Scheduler,
    store::FsStore,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CacheModeFlag {
    ReadWrite,
    WriteOnly,
    Disabled,
}

impl From<CacheModeFlag> for CacheMode {
    fn from(flag: CacheModeFlag) -> Self {
        match flag {
            CacheModeFlag::ReadWrite => CacheMode::ReadWrite,
            CacheModeFlag::WriteOnly => CacheMode::WriteOnly,
            CacheModeFlag::Disabled => CacheMode::Disabled,
        }
    }
}

#[derive(Clone, Debug, Parser)]
pub struct Opts {
    /// Rules to run, as `rule` or `component.rule`
    #[arg(required = true)]
    rules: Vec<String>,

    /// Project root; defaults to the current directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Worker count
    #[arg(short, long, default_value_t = num_cpus::get())]
    jobs: usize,

    /// How the cache participates in the run
    #[arg(long, value_enum, default_value_t = CacheModeFlag::ReadWrite)]
    cache_mode: CacheModeFlag,

    /// Cache directory; defaults to `<root>/.zim/cache`
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Run every rule on the host, ignoring docker images
    #[arg(long)]
    no_docker: bool,

    /// Log resolved rule state before running
    #[arg(long)]
    debug: bool,
}

pub fn exec(opts: Opts) -> Result<()> {
    let cancel = CancelToken::new();
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag())
        .context("register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, cancel.flag())
        .context("register SIGTERM handler")?;

    let project = super::load_project(&opts.root, opts.no_docker, cancel.clone())?;
    let targets = project.resolve_targets(&opts.rules)?;
    if targets.is_empty() {
        bail!("no rules selected");
    }

    let cache_dir = match &opts.cache_dir {
        Some(dir) => zim::path::AbsDirPath::try_from(dir.clone())
            .or_else(|_| zim::path::AbsDirPath::current()?.try_join_dir(dir.to_string_lossy()))?,
        None => project.root().try_join_dir(".zim/cache")?,
    };
    let store = Arc::new(FsStore::open(&cache_dir)?);
    let user = std::env::var("USER").unwrap_or_default();

    let runner = Chain::new(vec![
        Arc::new(DebugMiddleware),
        Arc::new(BufferedOutputMiddleware),
        Arc::new(LoggerMiddleware),
        Arc::new(CacheMiddleware::new(store, opts.cache_mode.into(), user)),
    ])
    .then(Arc::new(StandardRunner));

    let run_opts = RunOpts {
        output: sink(std::io::stderr()),
        debug: opts.debug,
        cancel,
    };
    let summary = Scheduler::new(runner, opts.jobs).run(&targets, &run_opts)?;
    if !summary.is_success() {
        for error in &summary.errors {
            eprintln!("{error:#}");
        }
        bail!("{} of {} rules failed", summary.errors.len(), targets.len());
    }
    Ok(())
}
