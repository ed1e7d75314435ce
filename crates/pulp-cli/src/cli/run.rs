use clap::Parser;

use crate::error::PulpCliResult;

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Watch a single namespace instead of the configured one.
    #[arg(short, long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,
}

pub async fn run(args: RunArgs) -> PulpCliResult<()> {
    pulp_controller::run(args.namespace).await?;
    Ok(())
}
