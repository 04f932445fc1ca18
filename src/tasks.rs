use std::{collections::BTreeMap, path::Path};

use crate::{ImageReference, LaunchError, Result};

const STREAMANALYTICS_REGISTRY: &str = "stg.nvcr.io/nvidia/tlt-streamanalytics";
const STREAMANALYTICS_TAG: &str = "v3.0.0ga-dev";
const STREAMANALYTICS_DIGEST: &str =
    "sha256:0043e8f4221be7229919c2d2b9ba7d14a4a3a156642476440147253bb74ab5a5";

/// Maps task names to the image their commands run in. This is handed to the
/// launcher as a plain value, see [TaskRegistry::builtin] for the shipped
/// table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, ImageReference>,
}

impl TaskRegistry {
    /// The tasks supported out of the box
    pub fn builtin() -> Result<Self> {
        let image = ImageReference::new(
            STREAMANALYTICS_REGISTRY,
            STREAMANALYTICS_TAG,
            STREAMANALYTICS_DIGEST,
        )?;
        let tasks = ["detectnet_v2", "faster_rcnn"]
            .into_iter()
            .map(|task| (task.to_owned(), image.clone()))
            .collect();
        Ok(Self { tasks })
    }

    /// Parses a table of the form
    ///
    /// ```json
    /// { "my_task": { "registry": "registry.example/tools", "tag": "v1", "digest": "sha256:..." } }
    /// ```
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let tasks: BTreeMap<String, ImageReference> = serde_json::from_str(contents)
            .map_err(|err| LaunchError::config(format!("invalid task map: {err}")))?;
        for (task, image) in &tasks {
            image
                .validate()
                .map_err(|err| LaunchError::config(format!("task \"{task}\": {err}")))?;
        }
        Ok(Self { tasks })
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
            LaunchError::config(format!("could not read task map {}: {err}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Returns a `ConfigError` listing the supported tasks if `task` is unknown
    pub fn resolve(&self, task: &str) -> Result<&ImageReference> {
        self.tasks.get(task).ok_or_else(|| {
            LaunchError::config(format!(
                "task \"{task}\" is not supported, supported tasks: {:?}",
                self.task_names().collect::<Vec<_>>()
            ))
        })
    }
}
