use std::{
    io::IsTerminal,
    process::{ExitStatus, Stdio},
};

use bollard::{
    container::{Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions},
    errors::Error as BollardError,
    image::{CreateImageOptions, ListImagesOptions},
    secret::{DeviceRequest, HostConfig},
    Docker, API_DEFAULT_VERSION,
};
use futures::StreamExt;

use crate::{
    ContainerInstance, ContainerRuntimeClient, ContainerSpec, ImageRegistryClient, LaunchError,
    Result, TaskCommand,
};

/// Seconds bollard waits on a single request
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Implements both engine interfaces on top of the Docker API. The exec path
/// goes through the `docker` CLI so that the task gets a real interactive
/// terminal.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    host: Option<String>,
}

impl DockerEngine {
    /// Connects to `host` (`unix://..`, an absolute socket path, or
    /// `tcp://..`), or to bollard's defaults (which honor `DOCKER_HOST`) if
    /// `None`. No request is made until the first call.
    pub fn connect(host: Option<&str>) -> Result<Self> {
        let host = host.map(normalize_host).transpose()?;
        let docker = match host.as_deref() {
            None => Docker::connect_with_defaults(),
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => {
                Docker::connect_with_http(host, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        }
        .map_err(|err| LaunchError::runtime(format!("could not connect to docker: {err}")))?;
        Ok(Self { docker, host })
    }
}

/// Returns `host` in a form both bollard and the `docker` CLI read the same
/// way. The CLI treats a schemeless address as tcp, so bare socket paths get
/// the `unix://` scheme and `http://` becomes `tcp://`.
fn normalize_host(host: &str) -> Result<String> {
    if host.starts_with("unix://") || host.starts_with("tcp://") {
        Ok(host.to_owned())
    } else if let Some(addr) = host.strip_prefix("http://") {
        Ok(format!("tcp://{addr}"))
    } else if host.starts_with('/') {
        Ok(format!("unix://{host}"))
    } else {
        Err(LaunchError::config(format!(
            "unsupported engine host \"{host}\", expected unix:// or tcp://"
        )))
    }
}

fn engine_unreachable(err: BollardError) -> LaunchError {
    LaunchError::runtime(format!("docker engine request failed: {err}"))
}

/// Registry side failures are `NotFound`, engine side rejections are `Pull`
fn pull_error(err: BollardError, image: &str) -> LaunchError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => LaunchError::not_found(format!("image source unreachable for {image}: {message}")),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => LaunchError::Pull(format!("{image}: [{status_code}] {message}")),
        BollardError::DockerStreamError { error } => LaunchError::Pull(format!("{image}: {error}")),
        other => LaunchError::not_found(format!("image source unreachable for {image}: {other}")),
    }
}

// [docker reference](https://docs.docker.com/reference/api/engine/version/
// v1.47/#tag/Container/operation/ContainerCreate)
fn create_config(spec: &ContainerSpec) -> (CreateContainerOptions<String>, Config<String>) {
    let device_requests = spec.all_gpus.then(|| {
        vec![DeviceRequest {
            count: Some(-1),
            capabilities: Some(vec![vec!["gpu".to_owned()]]),
            ..Default::default()
        }]
    });
    let options = CreateContainerOptions {
        name: spec.name.clone(),
        ..Default::default()
    };
    let config = Config {
        image: Some(spec.image.clone()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(spec.tty),
        host_config: Some(HostConfig {
            binds: Some(spec.binds.clone()),
            device_requests,
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        }),
        ..Default::default()
    };
    (options, config)
}

/// Arguments to the `docker` CLI for running `command` in `container_id`
fn exec_args(
    host: Option<&str>,
    container_id: &str,
    command: &TaskCommand,
    tty: bool,
) -> Vec<String> {
    let mut args = vec![];
    if let Some(host) = host {
        args.push("--host".to_owned());
        args.push(host.to_owned());
    }
    args.push("exec".to_owned());
    args.push("-i".to_owned());
    if tty {
        args.push("-t".to_owned());
    }
    args.push(container_id.to_owned());
    args.extend(command.argv().iter().cloned());
    args
}

fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code)
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal)
        }
    }
    1
}

impl ImageRegistryClient for DockerEngine {
    async fn list_images(&self) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(engine_unreachable)?;
        Ok(images.into_iter().map(|image| image.id).collect())
    }

    async fn inspect_digests(&self, image_id: &str) -> Result<Vec<String>> {
        match self.docker.inspect_image(image_id).await {
            Ok(inspect) => Ok(inspect.repo_digests.unwrap_or_default()),
            // removed between listing and inspection
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                tracing::debug!(image.id = %image_id, "image vanished before inspection");
                Ok(vec![])
            }
            Err(err) => Err(engine_unreachable(err)),
        }
    }

    async fn pull(&self, registry_path: &str, tag: &str) -> Result<()> {
        let image = format!("{registry_path}:{tag}");
        let mut progress = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: registry_path.to_owned(),
                tag: tag.to_owned(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(info) = progress.next().await {
            let info = info.map_err(|err| pull_error(err, &image))?;
            if let Some(status) = info.status {
                tracing::debug!(
                    progress = info.progress.as_deref().unwrap_or_default(),
                    "{status}"
                );
            }
        }
        Ok(())
    }
}

impl ContainerRuntimeClient for DockerEngine {
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerInstance> {
        let (options, config) = create_config(spec);
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|err| LaunchError::runtime(format!("could not create container: {err}")))?;
        for warning in &response.warnings {
            tracing::warn!("docker create: {warning}");
        }
        tracing::debug!(container.id = %response.id, "Starting container");

        if let Err(err) = self
            .docker
            .start_container::<String>(&response.id, None)
            .await
        {
            // created but never ran, so auto removal will not clean it up
            if let Err(rm_err) = self
                .docker
                .remove_container(
                    &response.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!("failed to remove container that did not start: {rm_err}");
            }
            return Err(LaunchError::runtime(format!(
                "could not start container: {err}"
            )))
        }

        Ok(ContainerInstance {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn exec(&self, container: &ContainerInstance, command: &TaskCommand) -> Result<i64> {
        let mut docker_exec = tokio::process::Command::new("docker");
        docker_exec
            .args(exec_args(
                self.host.as_deref(),
                &container.id,
                command,
                std::io::stdin().is_terminal(),
            ))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let status = docker_exec
            .status()
            .await
            .map_err(|err| LaunchError::runtime(format!("could not run `docker exec`: {err}")))?;
        Ok(exit_code(status))
    }

    async fn stop(&self, container: &ContainerInstance, timeout_secs: i64) -> Result<()> {
        match self
            .docker
            .stop_container(&container.id, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone (auto removal)
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                message,
            }) => {
                tracing::debug!("container {container} was already stopped: {message}");
                Ok(())
            }
            Err(err) => Err(LaunchError::runtime(format!(
                "could not stop container {container}: {err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn pull_error_categories() {
        let not_found = pull_error(
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "manifest unknown".to_owned(),
            },
            "r:t",
        );
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let denied = pull_error(
            BollardError::DockerResponseServerError {
                status_code: 500,
                message: "unauthorized".to_owned(),
            },
            "r:t",
        );
        assert_eq!(denied.kind(), ErrorKind::Pull);

        let stream = pull_error(
            BollardError::DockerStreamError {
                error: "denied".to_owned(),
            },
            "r:t",
        );
        assert_eq!(stream.kind(), ErrorKind::Pull);
    }

    fn spec(all_gpus: bool) -> ContainerSpec {
        ContainerSpec {
            name: "gpu_task_0123".to_owned(),
            image: "registry.example/trainer@sha256:ab".to_owned(),
            binds: vec!["/data:/workspace/data:rw".to_owned()],
            all_gpus,
            tty: true,
            auto_remove: true,
        }
    }

    #[test]
    fn unsupported_host() {
        let err = DockerEngine::connect(Some("ssh://box")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = DockerEngine::connect(Some("localhost:2375")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn bare_socket_path_gets_unix_scheme() {
        let engine = DockerEngine::connect(Some("/run/user/1000/docker.sock")).unwrap();
        assert_eq!(
            engine.host.as_deref(),
            Some("unix:///run/user/1000/docker.sock")
        );
        let engine = DockerEngine::connect(Some("unix:///var/run/docker.sock")).unwrap();
        assert_eq!(engine.host.as_deref(), Some("unix:///var/run/docker.sock"));
        let engine = DockerEngine::connect(Some("tcp://10.0.0.2:2375")).unwrap();
        assert_eq!(engine.host.as_deref(), Some("tcp://10.0.0.2:2375"));
        let engine = DockerEngine::connect(Some("http://10.0.0.2:2375")).unwrap();
        assert_eq!(engine.host.as_deref(), Some("tcp://10.0.0.2:2375"));
    }

    #[test]
    fn exec_args_forward_host_and_argv() {
        let engine = DockerEngine::connect(Some("/tmp/docker.sock")).unwrap();
        let command = TaskCommand::new(["detectnet_v2", "train", "-e", "/specs/a b.txt"]).unwrap();
        assert_eq!(
            exec_args(engine.host.as_deref(), "c0ffee", &command, false),
            vec![
                "--host",
                "unix:///tmp/docker.sock",
                "exec",
                "-i",
                "c0ffee",
                "detectnet_v2",
                "train",
                "-e",
                "/specs/a b.txt"
            ]
        );
        assert_eq!(exec_args(None, "c0ffee", &command, true)[..4], [
            "exec", "-i", "-t", "c0ffee"
        ]);
    }

    #[test]
    fn create_config_requests_every_gpu() {
        let (options, config) = create_config(&spec(true));
        assert_eq!(options.name, "gpu_task_0123");
        assert_eq!(
            config.image.as_deref(),
            Some("registry.example/trainer@sha256:ab")
        );
        assert_eq!(config.tty, Some(true));
        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.auto_remove, Some(true));
        assert_eq!(
            host_config.binds,
            Some(vec!["/data:/workspace/data:rw".to_owned()])
        );
        let device_requests = host_config.device_requests.unwrap();
        assert_eq!(device_requests.len(), 1);
        assert_eq!(device_requests[0].count, Some(-1));
        assert_eq!(
            device_requests[0].capabilities,
            Some(vec![vec!["gpu".to_owned()]])
        );
    }

    #[test]
    fn create_config_without_gpus() {
        let (_, config) = create_config(&spec(false));
        assert_eq!(config.host_config.unwrap().device_requests, None);
    }

    #[cfg(unix)]
    #[test]
    fn signal_exit_codes() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // SIGKILL
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }
}
