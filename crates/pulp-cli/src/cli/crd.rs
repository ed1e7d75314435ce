use std::path::PathBuf;

use clap::Parser;
use pulp_common::info;
use pulp_controller::crd::crds_yaml;

use crate::error::PulpCliResult;

#[derive(Parser, Debug, Clone)]
pub struct CrdArgs {
    /// Write to a file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn run(args: CrdArgs) -> PulpCliResult<()> {
    let yaml = crds_yaml()?;
    match args.output {
        Some(path) => {
            tokio::fs::write(&path, yaml).await?;
            info!(path = %path.display(), "wrote custom resource definitions");
        }
        None => print!("{}", yaml),
    }
    Ok(())
}
