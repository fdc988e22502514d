use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use zim::{exec::CancelToken, key};

#[derive(Clone, Debug, Parser)]
pub struct Opts {
    /// Rules to fingerprint, as `rule` or `component.rule`
    #[arg(required = true)]
    rules: Vec<String>,

    /// Project root; defaults to the current directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Run toolchain commands on the host, ignoring docker images
    #[arg(long)]
    no_docker: bool,
}

pub fn exec(opts: Opts) -> Result<()> {
    let project = super::load_project(&opts.root, opts.no_docker, CancelToken::new())?;
    let targets = project.resolve_targets(&opts.rules)?;
    for rule in targets {
        let key = key::compute(&rule)?;
        println!("{} {}", rule.node_id(), key.hex());
    }
    Ok(())
}
