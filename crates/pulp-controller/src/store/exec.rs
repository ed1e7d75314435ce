use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::AttachParams, Api, Client};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{ControllerError, ControllerResult};

/// Runs commands inside running containers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Run `command`, feeding it `stdin` when given, and return its trimmed
    /// stdout followed by stderr. A non-zero exit is an error.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<String>,
        command: Vec<String>,
        stdin: Option<String>,
    ) -> ControllerResult<String>;
}

pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubeExecutor {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<String>,
        command: Vec<String>,
        stdin: Option<String>,
    ) -> ControllerResult<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = AttachParams::default()
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }
        let program = command.first().cloned().unwrap_or_default();

        let mut attached = api.exec(pod, command, &params).await?;

        let stdin_writer = attached.stdin();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (fed, stdout, stderr) = tokio::join!(
            write_all(stdin_writer, stdin),
            read_all(stdout_reader),
            read_all(stderr_reader)
        );
        fed.map_err(|e| exec_error(pod, &program, e.to_string()))?;
        let stdout = stdout.map_err(|e| exec_error(pod, &program, e.to_string()))?;
        let stderr = stderr.map_err(|e| exec_error(pod, &program, e.to_string()))?;

        if let Some(status) = attached.take_status() {
            if let Some(status) = status.await {
                if status.status.as_deref() != Some("Success") {
                    let message = status
                        .message
                        .unwrap_or_else(|| stderr.trim().to_string());
                    return Err(exec_error(pod, &program, message));
                }
            }
        }
        attached
            .join()
            .await
            .map_err(|e| exec_error(pod, &program, e.to_string()))?;

        let output = format!("{}\n{}", stdout.trim(), stderr.trim());
        debug!(pod, %program, "exec finished");
        Ok(output.trim().to_string())
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut out).await?;
    }
    Ok(out)
}

async fn write_all<W: AsyncWrite + Unpin>(writer: Option<W>, input: Option<String>) -> std::io::Result<()> {
    if let (Some(mut writer), Some(input)) = (writer, input) {
        writer.write_all(input.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

fn exec_error(pod: &str, program: &str, message: String) -> ControllerError {
    ControllerError::Exec {
        pod: pod.to_string(),
        program: program.to_string(),
        message,
    }
}
