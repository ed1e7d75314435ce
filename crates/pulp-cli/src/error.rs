use pulp_common::error::PulpError;
use pulp_controller::ControllerError;
use thiserror::Error;

pub type PulpCliResult<T = (), E = PulpCliError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum PulpCliError {
    #[error("Unable to initialize config: {0}")]
    InitConfig(String),
    #[error("Unable to run command: {0}")]
    Command(#[from] clap::error::Error),
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<PulpCliError> for PulpError {
    fn from(error: PulpCliError) -> Self {
        PulpError::Cli(error.to_string())
    }
}

impl From<PulpError> for PulpCliError {
    fn from(error: PulpError) -> Self {
        match error {
            PulpError::Config(e) => PulpCliError::InitConfig(e.to_string()),
            PulpError::ConfigNotInitialized => PulpCliError::InitConfig(error.to_string()),
            e => PulpCliError::Runtime(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for PulpCliError {
    fn from(error: anyhow::Error) -> Self {
        PulpCliError::Runtime(error.to_string())
    }
}
