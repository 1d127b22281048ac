//! Human-authored pipeline descriptions.
//!
//! A description is a YAML document listing the containers (shared by every
//! step) and the steps with their pipes:
//!
//! ```yaml
//! Containers:
//!   - { Name: module.ll, Type: ModuleContainer }
//!   - { Name: input,     Type: Binary }
//! Steps:
//!   - Name: Lift
//!     Pipes:
//!       - { Type: ImportBinary, UsedContainers: [input] }
//!       - { Type: Lift,         UsedContainers: [input, module.ll] }
//!       - { Type: PassPipe,     UsedContainers: [module.ll], Passes: [globaldce] }
//! ```
//!
//! Parsing is permissive; [`Blueprint::resolve`] then checks everything
//! against the registry, so unknown types, passes and container references
//! fail before anything executes.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::registry::Registry;
use crate::step::{PipeSlot, Step};

#[derive(Debug, Deserialize)]
struct RawBlueprint {
    #[serde(rename = "Containers")]
    containers: Vec<RawContainer>,
    #[serde(rename = "Steps")]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawContainer {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Type")]
    ty: String,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Pipes", default)]
    pipes: Vec<RawPipe>,
}

#[derive(Debug, Deserialize)]
struct RawPipe {
    #[serde(rename = "Type")]
    ty: String,
    #[serde(rename = "UsedContainers")]
    used_containers: Vec<String>,
    #[serde(rename = "Passes", default)]
    passes: Vec<String>,
    #[serde(rename = "EnabledWhen", default)]
    enabled_when: Vec<String>,
}

/// A parsed, not yet resolved pipeline description.
pub struct Blueprint {
    raw: RawBlueprint,
}

impl Blueprint {
    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        let raw = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::Description(e.to_string()))?;
        Ok(Self { raw })
    }

    /// Resolves every name against the registry, producing the ordered step
    /// list a [`Runner`](crate::runner::Runner) executes.
    pub fn resolve(&self, registry: &Registry) -> Result<Vec<Step>, PipelineError> {
        let mut schema = BTreeMap::new();
        for container in &self.raw.containers {
            // The type must resolve even if nothing ends up using it.
            registry.make_container(&container.ty)?;

            if schema
                .insert(container.name.clone(), container.ty.clone())
                .is_some()
            {
                return Err(PipelineError::Description(format!(
                    "container `{}` is declared twice",
                    container.name
                )));
            }
        }

        let mut steps = Vec::with_capacity(self.raw.steps.len());
        for raw in &self.raw.steps {
            if steps.iter().any(|s: &Step| s.name() == raw.name) {
                return Err(PipelineError::Description(format!(
                    "step `{}` is declared twice",
                    raw.name
                )));
            }

            let mut slots = Vec::with_capacity(raw.pipes.len());
            for pipe in &raw.pipes {
                let resolved = registry.make_pipe(&pipe.ty, &pipe.passes)?;
                slots.push(
                    PipeSlot::new(resolved, pipe.used_containers.clone())
                        .enabled_when(pipe.enabled_when.clone()),
                );
            }

            steps.push(Step::new(&raw.name, schema.clone(), slots, registry)?);
        }

        Ok(steps)
    }
}
