use std::path::PathBuf;

use clap::Parser;
use info::InfoArgs;
use pulp_common::{metadata::LevelFilter, util::tracing::setup_tracing};

use crate::{error::PulpCliResult, init::init_config};

mod crd;
mod info;
mod run;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    #[clap(short('l'), long, value_name("LEVEL"), default_value("info"))]
    pub log_level: LevelFilter,

    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Parser, Clone)]
pub enum Command {
    #[command(about = "Show build information")]
    Info(InfoArgs),
    #[command(about = "Run the Pulp, PulpBackup and PulpRestore controllers")]
    Run(run::RunArgs),
    #[command(about = "Print the custom resource definitions")]
    Crd(crd::CrdArgs),
}

pub async fn exec() -> PulpCliResult {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    setup_tracing(Some(cli.log_level)).await;
    init_config(&cli)?;

    match cli.cmd {
        Command::Info(args) => info::run(args).await?,
        Command::Run(args) => run::run(args).await?,
        Command::Crd(args) => crd::run(args).await?,
    }
    Ok(())
}
