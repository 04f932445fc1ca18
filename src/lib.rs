//! Runs a task command inside a digest-pinned, GPU-enabled container.
//!
//! A [LifecycleManager] verifies the image by content digest (pulling it when
//! absent), resolves the user's mount manifest into volume bindings, starts a
//! container with every GPU attached, executes the command inside it, and
//! always stops the container afterwards. The engine is reached through the
//! [ImageRegistryClient] and [ContainerRuntimeClient] interfaces, with
//! [DockerEngine] as the Docker API backed implementation.

mod engine;
mod error;
mod image;
mod lifecycle;
mod mounts;
mod tasks;
mod volumes;

pub use engine::*;
pub use error::*;
pub use image::*;
pub use lifecycle::*;
pub use mounts::*;
pub use tasks::*;
pub use volumes::*;
