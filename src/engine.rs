//! The narrow capability interfaces the lifecycle manager drives. The Docker
//! backed implementation of both is [DockerEngine].

mod docker;

use std::{fmt, future::Future};

pub use docker::*;

use crate::{LaunchError, Result};

/// Image side of the engine
pub trait ImageRegistryClient {
    /// Ids of all locally present images
    fn list_images(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// The repo digests (`name@sha256:..`) recorded for the image, empty if
    /// it has none
    fn inspect_digests(&self, image_id: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Pulls `registry_path:tag`, returning after the pull completed
    fn pull(&self, registry_path: &str, tag: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Container side of the engine
pub trait ContainerRuntimeClient {
    /// Creates and starts a detached container
    fn run_container(
        &self,
        spec: &ContainerSpec,
    ) -> impl Future<Output = Result<ContainerInstance>> + Send;

    /// Runs `command` inside the container with the standard streams of this
    /// process, returning the exit code of the command
    fn exec(
        &self,
        container: &ContainerInstance,
        command: &TaskCommand,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Stops the container. Containers are created with auto removal, so this
    /// also deletes it.
    fn stop(
        &self,
        container: &ContainerInstance,
        timeout_secs: i64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// The arguments to the engine's equivalent of `docker run -d`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    /// Image in `name@digest` form
    pub image: String,
    /// `host:container:mode` entries
    pub binds: Vec<String>,
    /// Request every available GPU (capability "gpu", count -1)
    pub all_gpus: bool,
    pub tty: bool,
    pub auto_remove: bool,
}

/// A running container owned by one task invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInstance {
    pub id: String,
    pub name: String,
}

impl fmt::Display for ContainerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short_id = self.id.get(..12).unwrap_or(&self.id);
        write!(f, "{} ({short_id})", self.name)
    }
}

/// The command run inside the container, kept as separate arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCommand {
    argv: Vec<String>,
}

impl TaskCommand {
    /// Returns a `ConfigError` if `argv` is empty or the program is blank
    pub fn new<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Ok(Self { argv }),
            _ => Err(LaunchError::config("the task command is empty")),
        }
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl fmt::Display for TaskCommand {
    /// The arguments joined by spaces
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}
