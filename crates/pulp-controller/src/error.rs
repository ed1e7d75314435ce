use kube::core::gvk::ParseGroupVersionError;
use pulp_common::error::PulpError;

pub type ControllerResult<T = (), E = ControllerError> = Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] anyhow::Error),

    #[error("Parsing error: {0}")]
    Parsing(#[from] ParseGroupVersionError),

    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Timed out after {secs}s waiting for {what}")]
    WaitTimeout { what: String, secs: u64 },

    /// Spec validation failed; `reason` is the condition reason token.
    #[error("{reason}: {message}")]
    Precheck { reason: String, message: String },

    #[error("Secret {0} not found")]
    MissingSecret(String),

    #[error("could not find \"{key}\" key in {secret} secret")]
    MissingSecretKey { secret: String, key: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict updating {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Names the program only, never its arguments.
    #[error("{program} failed in pod {pod}: {message}")]
    Exec {
        pod: String,
        program: String,
        message: String,
    },

    #[error("Invalid signing key: {0}")]
    Signing(String),

    #[error("Key generation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Common error: {0}")]
    Common(#[from] PulpError),

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

impl ControllerError {
    pub fn precheck(reason: impl Into<String>, message: impl Into<String>) -> Self {
        ControllerError::Precheck {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::NotFound { .. } => true,
            ControllerError::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            ControllerError::Conflict { .. } => true,
            ControllerError::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }
}

impl From<ControllerError> for PulpError {
    fn from(error: ControllerError) -> Self {
        match error {
            ControllerError::Common(e) => e,
            ControllerError::Kube { source } => PulpError::Kube { source },
            other => PulpError::Runtime(anyhow::anyhow!(other.to_string())),
        }
    }
}
