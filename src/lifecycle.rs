use std::{
    future::Future,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use futures::FutureExt;

use crate::{
    default_mounts_file, fetch_image, format_volumes, image_exists, ContainerInstance,
    ContainerRuntimeClient, ContainerSpec, DockerEngine, ImageReference, ImageRegistryClient,
    LaunchError, MountManifest, Result, TaskCommand, VolumeBindingSet,
};

pub const DEFAULT_NAME_PREFIX: &str = "gpu_task";
pub const DEFAULT_STOP_TIMEOUT_SECS: i64 = 10;

/// Static configuration of a [LifecycleManager]
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// The image every container is created from
    pub image: ImageReference,
    /// Mount manifest location, a leading `~` is expanded
    pub mounts_file: PathBuf,
    /// Containers are named `{name_prefix}_{uuid}`
    pub name_prefix: String,
    /// Seconds the engine waits for the container to exit before killing it
    pub stop_timeout_secs: i64,
    /// Engine endpoint, `None` uses the engine client's defaults
    pub engine_host: Option<String>,
}

impl LaunchConfig {
    pub fn new(image: ImageReference) -> Self {
        Self {
            image,
            mounts_file: default_mounts_file(),
            name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            engine_host: None,
        }
    }

    pub fn with_mounts_file(mut self, mounts_file: impl Into<PathBuf>) -> Self {
        self.mounts_file = mounts_file.into();
        self
    }

    pub fn with_name_prefix(mut self, name_prefix: impl Into<String>) -> Self {
        self.name_prefix = name_prefix.into();
        self
    }

    pub fn with_engine_host(mut self, engine_host: Option<String>) -> Self {
        self.engine_host = engine_host;
        self
    }
}

/// Stages of one task invocation. Once `ContainerStarted` is reached,
/// `ContainerStopped` is always reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    ImageVerified,
    ContainerStarted,
    CommandExecuted,
    ContainerStopped,
}

/// Runs task commands in containers created from one digest-pinned image.
///
/// Everything is sequential: the image is verified (and pulled if needed), the
/// mount manifest is resolved, a container is started with every GPU attached,
/// the command is executed in it, and the container is stopped no matter how
/// execution went.
#[derive(Debug)]
pub struct LifecycleManager<I, C> {
    config: LaunchConfig,
    manifest: MountManifest,
    images: I,
    runtime: C,
    state: Mutex<LifecycleState>,
}

impl LifecycleManager<DockerEngine, DockerEngine> {
    /// Uses one [DockerEngine] connection for both clients
    pub fn docker(config: LaunchConfig) -> Result<Self> {
        let engine = DockerEngine::connect(config.engine_host.as_deref())?;
        Ok(Self::new(config, engine.clone(), engine))
    }
}

impl<I: ImageRegistryClient, C: ContainerRuntimeClient> LifecycleManager<I, C> {
    pub fn new(config: LaunchConfig, images: I, runtime: C) -> Self {
        let manifest = MountManifest::new(&config.mounts_file);
        Self {
            config,
            manifest,
            images,
            runtime,
            state: Mutex::new(LifecycleState::Uninitialized),
        }
    }

    /// The stage the latest invocation reached
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("lifecycle {:?} -> {next:?}", *state);
        *state = next;
    }

    /// Pulls the configured image unless an image with its digest is already
    /// present. The pull is trusted, presence is not checked again afterwards.
    #[tracing::instrument(skip_all, fields(image = %self.config.image))]
    pub async fn ensure_image(&self) -> Result<()> {
        let image = &self.config.image;
        if !image_exists(&self.images, image.digest()).await? {
            fetch_image(&self.images, image).await?;
        }
        self.transition(LifecycleState::ImageVerified);
        Ok(())
    }

    /// Resolves the mount manifest and formats it into volume bindings
    pub async fn resolve_volumes(&self) -> Result<VolumeBindingSet> {
        let mounts = self.manifest.resolve().await?;
        let volumes = format_volumes(&mounts);
        tracing::info!("volumes: {:?}", volumes.to_binds());
        Ok(volumes)
    }

    /// Creates and starts a detached container with a TTY, all GPUs, and
    /// `volumes` attached. The container is removed by the engine when
    /// stopped. The returned instance must be passed to [Self::stop], prefer
    /// [Self::with_container] which guarantees it.
    #[tracing::instrument(skip_all, fields(image = %self.config.image))]
    pub async fn start(&self, volumes: &VolumeBindingSet) -> Result<ContainerInstance> {
        let spec = ContainerSpec {
            name: format!("{}_{}", self.config.name_prefix, uuid::Uuid::new_v4().simple()),
            image: self.config.image.pinned(),
            binds: volumes.to_binds(),
            all_gpus: true,
            tty: true,
            auto_remove: true,
        };
        tracing::debug!("Creating container {}", spec.name);
        let container = self.runtime.run_container(&spec).await?;
        tracing::info!("Started container {container}");
        self.transition(LifecycleState::ContainerStarted);
        Ok(container)
    }

    /// Runs `command` inside `container`, forwarding the standard streams, and
    /// returns its exit code unchanged. A nonzero exit code is not an error.
    #[tracing::instrument(skip_all, fields(container = %container))]
    pub async fn execute(&self, container: &ContainerInstance, command: &TaskCommand) -> Result<i64> {
        tracing::info!("Executing `{command}`");
        let exit_code = self.runtime.exec(container, command).await?;
        tracing::debug!(exit_code, "command finished");
        self.transition(LifecycleState::CommandExecuted);
        Ok(exit_code)
    }

    /// Stops (and thereby removes) the container
    #[tracing::instrument(skip_all, fields(container = %container))]
    pub async fn stop(&self, container: ContainerInstance) -> Result<()> {
        let res = self
            .runtime
            .stop(&container, self.config.stop_timeout_secs)
            .await;
        // even if stopping failed there is nothing further to do with it
        self.transition(LifecycleState::ContainerStopped);
        res?;
        tracing::info!("Stopped container {container}");
        Ok(())
    }

    /// Starts a container, runs `f` with it, and then stops the container on
    /// every path out of `f`, including errors and panics. If both `f` and the
    /// stop fail, the error of `f` is returned.
    pub async fn with_container<F, Fut, T>(&self, volumes: &VolumeBindingSet, f: F) -> Result<T>
    where
        F: FnOnce(ContainerInstance) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let container = self.start(volumes).await?;
        let res = AssertUnwindSafe(f(container.clone())).catch_unwind().await;
        let stopped = self.stop(container).await;
        match res {
            Err(panic) => {
                if let Err(err) = stopped {
                    tracing::error!("{err}");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Ok(t)) => stopped.map(|()| t),
            Ok(Err(err)) => {
                if let Err(stop_err) = stopped {
                    tracing::error!("also failed to stop the container: {stop_err}");
                }
                Err(err)
            }
        }
    }

    /// Runs the whole lifecycle for `command`, aborting with
    /// [LaunchError::Interrupted] on Ctrl-C. The handler is installed before
    /// anything else happens, so a Ctrl-C that arrives while the container is
    /// starting still leads to it being stopped.
    pub async fn run_task(&self, command: &TaskCommand) -> Result<i64> {
        let interrupt = interrupt_signal();
        self.run_task_until(command, async move {
            match interrupt {
                Some(mut interrupt) => interrupt.recv().await,
                // no signal handling available, never interrupt
                None => std::future::pending::<()>().await,
            }
        })
        .await
    }

    /// [Self::run_task] with a custom interrupt. If `interrupt` completes
    /// before the container is started nothing is started. If it completes
    /// while the container starts or the command runs, the command is
    /// abandoned and the container is stopped.
    #[tracing::instrument(skip_all, fields(image = %self.config.image))]
    pub async fn run_task_until<S>(&self, command: &TaskCommand, interrupt: S) -> Result<i64>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        self.transition(LifecycleState::Uninitialized);
        let volumes = tokio::select! {
            biased;
            () = &mut interrupt => {
                tracing::warn!("interrupt received before the container was started");
                return Err(LaunchError::Interrupted)
            }
            volumes = async {
                self.ensure_image().await?;
                self.resolve_volumes().await
            } => volumes?,
        };
        // starting is not raced, a dropped create could leave a container behind
        self.with_container(&volumes, |container| async move {
            tokio::select! {
                biased;
                () = interrupt => {
                    tracing::warn!("interrupt received, stopping container {container}");
                    Err(LaunchError::Interrupted)
                }
                exit_code = self.execute(&container, command) => exit_code,
            }
        })
        .await
    }
}

#[cfg(unix)]
struct InterruptSignal(tokio::signal::unix::Signal);

#[cfg(windows)]
struct InterruptSignal(tokio::signal::windows::CtrlC);

impl InterruptSignal {
    async fn recv(&mut self) {
        // `None` only happens if the driver is gone, treat it as an interrupt
        let _ = self.0.recv().await;
    }
}

/// Installs the Ctrl-C handler right away, deliveries before the first `recv`
/// are kept
fn interrupt_signal() -> Option<InterruptSignal> {
    #[cfg(unix)]
    let res = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map(InterruptSignal);
    #[cfg(windows)]
    let res = tokio::signal::windows::ctrl_c().map(InterruptSignal);
    match res {
        Ok(signal) => Some(signal),
        Err(err) => {
            tracing::warn!("could not install the Ctrl-C handler: {err}");
            None
        }
    }
}
