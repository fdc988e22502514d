pub mod key;
pub mod ls;
pub mod run;

use std::sync::Arc;

use color_eyre::Result;
use zim::{
    exec::{CancelToken, DockerExecutor, Executor},
    path::AbsDirPath,
    project::{Project, ProjectOptions},
};

/// Load the project rooted at the current directory (or `--root`).
pub fn load_project(
    root: &Option<std::path::PathBuf>,
    no_docker: bool,
    cancel: CancelToken,
) -> Result<Arc<Project>> {
    let root = match root {
        Some(root) => AbsDirPath::try_from(root.canonicalize()?)?,
        None => AbsDirPath::current()?,
    };
    let executor: Option<Arc<dyn Executor>> = if no_docker {
        None
    } else {
        Some(Arc::new(DockerExecutor::new(root.clone())))
    };
    Project::load(
        &root,
        ProjectOptions {
            executor,
            cancel,
        },
    )
}
