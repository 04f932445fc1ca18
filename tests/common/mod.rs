#![allow(dead_code)]

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::Notify;

use gpu_task_launcher::{
    ContainerInstance, ContainerRuntimeClient, ContainerSpec, ErrorKind, ImageReference,
    ImageRegistryClient, LaunchConfig, LaunchError, LifecycleManager, Result, TaskCommand,
};

pub const REGISTRY: &str = "registry.example/vision/trainer";
pub const TAG: &str = "v3.1";
pub const DIGEST: &str = "sha256:0043e8f4221be7229919c2d2b9ba7d14a4a3a156642476440147253bb74ab5a5";
pub const OTHER_DIGEST: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";

/// Everything the engine was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListImages,
    Inspect(String),
    Pull { registry_path: String, tag: String },
    RunContainer(ContainerSpec),
    Exec { container_id: String, command: String },
    Stop { container_id: String },
}

#[derive(Debug, Default)]
pub struct MockState {
    pub calls: Vec<Call>,
    /// (image id, repo digests)
    pub images: Vec<(String, Vec<String>)>,
    pub exit_code: i64,
    pub list_fault: Option<ErrorKind>,
    pub pull_fault: Option<ErrorKind>,
    pub run_fault: Option<ErrorKind>,
    pub exec_fault: Option<ErrorKind>,
    pub stop_fault: Option<ErrorKind>,
    pub exec_panics: bool,
    pub exec_hangs: bool,
    /// Notified once a container has been started
    pub started: Arc<Notify>,
    /// Notified once a command has been handed to `exec`
    pub exec_started: Arc<Notify>,
}

/// In-memory engine implementing both client interfaces. Clones share state,
/// so one clone can be handed to the manager and another kept for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

fn injected(kind: ErrorKind, what: &str) -> LaunchError {
    let msg = format!("injected {what} failure");
    match kind {
        ErrorKind::Config => LaunchError::Config(msg),
        ErrorKind::NotFound => LaunchError::NotFound(msg),
        ErrorKind::Pull => LaunchError::Pull(msg),
        ErrorKind::RuntimeUnavailable => LaunchError::RuntimeUnavailable(msg),
        ErrorKind::Interrupted => LaunchError::Interrupted,
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn with_image(self, id: &str, repo_digests: &[&str]) -> Self {
        self.state().images.push((
            id.to_owned(),
            repo_digests.iter().map(|s| (*s).to_owned()).collect(),
        ));
        self
    }

    pub fn with_configured_image(self) -> Self {
        let repo_digest = format!("{REGISTRY}@{DIGEST}");
        self.with_image("sha256:local0", &[repo_digest.as_str()])
    }

    /// Completes once a container has been started
    pub fn started(&self) -> impl std::future::Future<Output = ()> {
        let started = Arc::clone(&self.state().started);
        async move { started.notified().await }
    }

    /// Completes once a command has been handed to `exec`
    pub fn exec_started(&self) -> impl std::future::Future<Output = ()> {
        let exec_started = Arc::clone(&self.state().exec_started);
        async move { exec_started.notified().await }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|call| f(call)).count()
    }

    pub fn pulls(&self) -> usize {
        self.count(|call| matches!(call, Call::Pull { .. }))
    }

    pub fn stops(&self) -> usize {
        self.count(|call| matches!(call, Call::Stop { .. }))
    }

    pub fn run_specs(&self) -> Vec<ContainerSpec> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::RunContainer(spec) => Some(spec.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ImageRegistryClient for MockEngine {
    async fn list_images(&self) -> Result<Vec<String>> {
        let mut state = self.state();
        state.calls.push(Call::ListImages);
        if let Some(kind) = state.list_fault {
            return Err(injected(kind, "list"))
        }
        Ok(state.images.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn inspect_digests(&self, image_id: &str) -> Result<Vec<String>> {
        let mut state = self.state();
        state.calls.push(Call::Inspect(image_id.to_owned()));
        Ok(state
            .images
            .iter()
            .find(|(id, _)| id == image_id)
            .map(|(_, digests)| digests.clone())
            .unwrap_or_default())
    }

    async fn pull(&self, registry_path: &str, tag: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Pull {
            registry_path: registry_path.to_owned(),
            tag: tag.to_owned(),
        });
        match state.pull_fault {
            Some(kind) => Err(injected(kind, "pull")),
            None => Ok(()),
        }
    }
}

impl ContainerRuntimeClient for MockEngine {
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerInstance> {
        let mut state = self.state();
        state.calls.push(Call::RunContainer(spec.clone()));
        if let Some(kind) = state.run_fault {
            return Err(injected(kind, "run"))
        }
        state.started.notify_one();
        Ok(ContainerInstance {
            id: format!("{:064x}", state.calls.len()),
            name: spec.name.clone(),
        })
    }

    async fn exec(&self, container: &ContainerInstance, command: &TaskCommand) -> Result<i64> {
        let (fault, panics, hangs, exit_code) = {
            let mut state = self.state();
            state.calls.push(Call::Exec {
                container_id: container.id.clone(),
                command: command.to_string(),
            });
            state.exec_started.notify_one();
            (
                state.exec_fault,
                state.exec_panics,
                state.exec_hangs,
                state.exit_code,
            )
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        if panics {
            panic!("injected exec panic");
        }
        match fault {
            Some(kind) => Err(injected(kind, "exec")),
            None => Ok(exit_code),
        }
    }

    async fn stop(&self, container: &ContainerInstance, _timeout_secs: i64) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Stop {
            container_id: container.id.clone(),
        });
        match state.stop_fault {
            Some(kind) => Err(injected(kind, "stop")),
            None => Ok(()),
        }
    }
}

pub fn image() -> ImageReference {
    ImageReference::new(REGISTRY, TAG, DIGEST).unwrap()
}

/// A manager whose clients are clones of `engine`, reading the manifest at
/// `mounts_file`
pub fn manager(engine: &MockEngine, mounts_file: &Path) -> LifecycleManager<MockEngine, MockEngine> {
    let config = LaunchConfig::new(image()).with_mounts_file(mounts_file);
    LifecycleManager::new(config, engine.clone(), engine.clone())
}

pub fn command(argv: &[&str]) -> TaskCommand {
    TaskCommand::new(argv.iter().copied()).unwrap()
}
