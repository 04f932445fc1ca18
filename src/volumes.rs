use std::{collections::BTreeMap, fmt};

use crate::MountDeclaration;

/// Access mode of a volume binding. Task containers always get read-write
/// access to their mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "rw",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a host path ends up inside the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub destination: String,
    pub mode: AccessMode,
}

/// Host source path to binding. Sources are unique, iteration is in source
/// path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeBindingSet(BTreeMap<String, VolumeBinding>);

impl VolumeBindingSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, source: &str) -> Option<&VolumeBinding> {
        self.0.get(source)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VolumeBinding)> {
        self.0.iter().map(|(source, binding)| (source.as_str(), binding))
    }

    /// Renders the `HostConfig.Binds` entries, `host:container:mode`
    pub fn to_binds(&self) -> Vec<String> {
        self.iter()
            .map(|(source, binding)| format!("{source}:{}:{}", binding.destination, binding.mode))
            .collect()
    }
}

/// Translates mount declarations into the set of volume bindings attached to
/// the container. If a source path is declared more than once, the last
/// declaration wins.
pub fn format_volumes(mounts: &[MountDeclaration]) -> VolumeBindingSet {
    VolumeBindingSet(
        mounts
            .iter()
            .map(|mount| {
                (mount.source().to_owned(), VolumeBinding {
                    destination: mount.destination().to_owned(),
                    mode: AccessMode::ReadWrite,
                })
            })
            .collect(),
    )
}
