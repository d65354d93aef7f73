// ABOUTME: Docker implementation of the execution engine boundary via bollard
// ABOUTME: Translates container specs, classifies failures, and splits output into lines

use crate::engine::{
    EngineContainer, EngineError, EngineErrorKind, EngineResult, ExecutionEngine, RawLineStream,
};
use crate::types::{ContainerSpec, ContainerState};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    models::HostConfig,
    Docker,
};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// CPU quota period in microseconds; 100_000 means quota is per-core.
const CPU_PERIOD_MICROS: i64 = 100_000;

/// Docker-backed execution engine.
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the local Docker daemon and verify it responds.
    pub async fn new() -> EngineResult<Self> {
        let client = Docker::connect_with_defaults().map_err(classify)?;
        client.ping().await.map_err(|e| {
            error!("Failed to connect to Docker daemon: {}", e);
            classify(e)
        })?;

        info!("Connected to Docker daemon");
        Ok(Self { client })
    }

    /// Wrap an existing client (tests, custom connection settings).
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            memory: Some((spec.limits.memory_mb * 1024 * 1024) as i64),
            cpu_quota: Some((spec.limits.cpu_cores * CPU_PERIOD_MICROS as f64) as i64),
            cpu_period: Some(CPU_PERIOD_MICROS),
            pids_limit: Some(spec.hardening.pids_limit),
            cap_drop: Some(spec.hardening.drop_capabilities.clone()),
            cap_add: if spec.hardening.add_capabilities.is_empty() {
                None
            } else {
                Some(spec.hardening.add_capabilities.clone())
            },
            security_opt: Some(spec.hardening.security_options()),
            init: Some(spec.hardening.use_init),
            privileged: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        }
    }
}

/// Map a bollard failure onto the tagged classification. Status codes are
/// the contract here; the error's Rust type never is.
fn classify(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => {
            let kind = match status_code {
                401 | 403 => EngineErrorKind::PermissionDenied,
                404 => EngineErrorKind::NotFound,
                409 => EngineErrorKind::Conflict,
                429 => EngineErrorKind::RateLimited,
                500..=599 => EngineErrorKind::Unavailable,
                _ => EngineErrorKind::Other,
            };
            EngineError::new(kind, message)
        }
        BollardError::IOError { err } => {
            EngineError::new(EngineErrorKind::Unavailable, err.to_string())
        }
        BollardError::RequestTimeoutError => {
            EngineError::new(EngineErrorKind::Unavailable, "engine request timed out")
        }
        other => EngineError::new(EngineErrorKind::Other, other.to_string()),
    }
}

/// Drain complete lines out of `buffer`, leaving any partial tail in place.
fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line = buffer[..pos].trim_end_matches('\r').to_string();
        buffer.drain(..=pos);
        lines.push(line);
    }
    lines
}

/// Turn a bollard log-output stream into a line stream. Chunk boundaries
/// are not line boundaries; a partial tail is held until its newline (or
/// end of stream) arrives.
fn lines_from_log_output(
    output: impl Stream<Item = Result<LogOutput, BollardError>> + Send + 'static,
    include_stderr: bool,
) -> RawLineStream {
    Box::pin(async_stream::stream! {
        let mut output = Box::pin(output);
        let mut buffer = String::new();
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    buffer.push_str(&String::from_utf8_lossy(&message));
                    for line in drain_lines(&mut buffer) {
                        yield Ok(line);
                    }
                }
                Ok(LogOutput::StdErr { message }) => {
                    if include_stderr {
                        buffer.push_str(&String::from_utf8_lossy(&message));
                        for line in drain_lines(&mut buffer) {
                            yield Ok(line);
                        }
                    } else {
                        debug!("container stderr: {}", String::from_utf8_lossy(&message).trim_end());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    yield Err(classify(e));
                    return;
                }
            }
        }
        let tail = buffer.trim_end().to_string();
        if !tail.is_empty() {
            yield Ok(tail);
        }
    })
}

fn engine_container_from_summary(
    summary: bollard::models::ContainerSummary,
) -> Option<EngineContainer> {
    let id = summary.id?;
    Some(EngineContainer {
        id,
        name: summary
            .names
            .unwrap_or_default()
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        state: ContainerState::parse(summary.state.as_deref().unwrap_or("unknown")),
        labels: summary.labels.unwrap_or_default(),
    })
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.client.ping().await.map(|_| ()).map_err(classify)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        debug!("Creating container {} from image {}", spec.name, spec.image);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(classify)?;

        info!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> EngineResult<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> EngineResult<()> {
        let options = StopContainerOptions { t: timeout_secs };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped is success for our purposes.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            // Already gone is success for our purposes.
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
    ) -> EngineResult<Vec<EngineContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            label_filters
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>(),
        );

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .filter_map(engine_container_from_summary)
            .collect())
    }

    async fn inspect_container(
        &self,
        name_or_id: &str,
    ) -> EngineResult<Option<EngineContainer>> {
        match self.client.inspect_container(name_or_id, None).await {
            Ok(inspect) => {
                let state = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.status.as_ref())
                    .map(|s| ContainerState::parse(&format!("{:?}", s).to_lowercase()))
                    .unwrap_or(ContainerState::Unknown);

                Ok(Some(EngineContainer {
                    id: inspect.id.unwrap_or_else(|| name_or_id.to_string()),
                    name: inspect
                        .name
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    state,
                    labels: inspect
                        .config
                        .and_then(|c| c.labels)
                        .unwrap_or_default(),
                }))
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    async fn exec_streamed(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
        stdin: Option<String>,
    ) -> EngineResult<RawLineStream> {
        debug!("Exec in container {}: {:?}", container_id, command);

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            env: if env.is_empty() { None } else { Some(env) },
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(stdin.is_some()),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(classify)?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(classify)?;

        match start_result {
            StartExecResults::Attached { output, mut input } => {
                if let Some(data) = stdin {
                    tokio::spawn(async move {
                        if let Err(e) = input.write_all(data.as_bytes()).await {
                            warn!("Failed to write exec stdin: {}", e);
                            return;
                        }
                        if let Err(e) = input.shutdown().await {
                            warn!("Failed to close exec stdin: {}", e);
                        }
                    });
                }
                Ok(lines_from_log_output(output, false))
            }
            StartExecResults::Detached => Err(EngineError::new(
                EngineErrorKind::Other,
                "exec was detached unexpectedly",
            )),
        }
    }

    async fn run_exec(&self, container_id: &str, command: Vec<String>) -> EngineResult<i64> {
        let exec_config = CreateExecOptions::<String> {
            cmd: Some(command),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(classify)?;

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(classify)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    if let Err(e) = chunk {
                        return Err(classify(e));
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self.client.inspect_exec(&exec.id).await.map_err(classify)?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn wait_container(&self, container_id: &str) -> EngineResult<i64> {
        let mut wait = Box::pin(
            self.client
                .wait_container(container_id, None::<WaitContainerOptions<String>>),
        );

        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit surfaces as an error variant carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify(e)),
            None => Err(EngineError::new(
                EngineErrorKind::Other,
                "wait stream ended without a status",
            )),
        }
    }

    async fn container_logs(
        &self,
        container_id: &str,
        follow: bool,
    ) -> EngineResult<RawLineStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };

        let logs = self.client.logs(container_id, Some(options));
        Ok(lines_from_log_output(logs, true))
    }
}
