use kube::core::gvk::ParseGroupVersionError;

pub type PulpResult<T = (), E = PulpError> = Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum PulpError {
    #[error("CLI error: {0}")]
    Cli(String),
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Parsing error: {0}")]
    Parsing(#[from] ParseGroupVersionError),
    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("Config not initialized")]
    ConfigNotInitialized,
    /// Any error originating from the `kube-rs` crate
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
    #[error("Invalid Json: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Invalid Kubernetes Yaml: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
}

impl From<Box<dyn std::error::Error>> for PulpError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        PulpError::Runtime(anyhow::anyhow!("{:#?}", err))
    }
}
