use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use zim::exec::CancelToken;

#[derive(Clone, Debug, Parser)]
pub struct Opts {
    /// Project root; defaults to the current directory
    #[arg(long)]
    root: Option<PathBuf>,
}

pub fn exec(opts: Opts) -> Result<()> {
    let project = super::load_project(&opts.root, true, CancelToken::new())?;
    for component in project.components() {
        println!("{}", component.name());
        for rule in component.rule_names() {
            println!("  {}.{rule}", component.name());
        }
    }
    Ok(())
}
