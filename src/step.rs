//! Steps: ordered groups of pipes sharing one container snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::container::ContainerSet;
use crate::error::PipelineError;
use crate::pipe::Pipe;
use crate::registry::Registry;

/// A pipe as mounted in a step: the pipe itself, the container names bound
/// to its slots (in slot order), and the flags gating it.
pub struct PipeSlot {
    pipe: Arc<dyn Pipe>,
    bound: Vec<String>,
    enabled_when: Vec<String>,
}

impl PipeSlot {
    pub fn new(pipe: Arc<dyn Pipe>, bound: Vec<String>) -> Self {
        Self {
            pipe,
            bound,
            enabled_when: Vec::new(),
        }
    }

    /// Gates the pipe: it runs (and plans) only when every listed flag is
    /// active.
    pub fn enabled_when(mut self, flags: Vec<String>) -> Self {
        self.enabled_when = flags;
        self
    }

    pub fn pipe(&self) -> &Arc<dyn Pipe> {
        &self.pipe
    }

    pub fn bound(&self) -> &[String] {
        &self.bound
    }

    pub fn gating_flags(&self) -> &[String] {
        &self.enabled_when
    }

    pub fn is_enabled(&self, flags: &BTreeSet<String>) -> bool {
        self.enabled_when.iter().all(|f| flags.contains(f))
    }
}

/// A named step: its container schema (name to registered container type)
/// and its pipes, in declared order.
pub struct Step {
    name: String,
    schema: BTreeMap<String, String>,
    slots: Vec<PipeSlot>,
}

impl Step {
    /// Builds a step, checking that every slot binding refers to a schema
    /// container, that binding arity matches the contract, and that every
    /// bound container accepts the kinds the contract mentions.
    pub fn new(
        name: impl Into<String>,
        schema: BTreeMap<String, String>,
        slots: Vec<PipeSlot>,
        registry: &Registry,
    ) -> Result<Self, PipelineError> {
        let name = name.into();

        // Prototypes for kind-acceptance checks.
        let mut prototypes = BTreeMap::new();
        for (container, ty) in &schema {
            prototypes.insert(container.clone(), registry.make_container(ty)?);
        }

        for slot in &slots {
            let contract = slot.pipe().contract();

            if slot.bound().len() != contract.arity() {
                return Err(PipelineError::Description(format!(
                    "pipe `{}` in step `{name}` binds {} containers, its contract has {}",
                    slot.pipe().name(),
                    slot.bound().len(),
                    contract.arity(),
                )));
            }

            let mut seen = BTreeSet::new();
            for bound in slot.bound() {
                if !schema.contains_key(bound) {
                    return Err(PipelineError::UnknownContainer(bound.clone()));
                }
                if !seen.insert(bound) {
                    return Err(PipelineError::Description(format!(
                        "pipe `{}` in step `{name}` binds container `{bound}` twice",
                        slot.pipe().name(),
                    )));
                }
            }

            for (index, kind) in contract.slot_kinds() {
                let container = &slot.bound()[index];
                let prototype = &prototypes[container];
                if !prototype.accepts(kind) {
                    return Err(PipelineError::ContainerTypeMismatch {
                        container: container.clone(),
                        ty: prototype.type_name().to_string(),
                        kind: registry.taxonomy().kind_name(kind).to_string(),
                    });
                }
            }
        }

        Ok(Self {
            name,
            schema,
            slots,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &BTreeMap<String, String> {
        &self.schema
    }

    pub fn slots(&self) -> &[PipeSlot] {
        &self.slots
    }

    /// Fresh, empty containers for one execution of this step.
    pub fn materialize(&self, registry: &Registry) -> Result<ContainerSet, PipelineError> {
        let mut set = ContainerSet::new();
        for (container, ty) in &self.schema {
            set.insert(container.clone(), registry.make_container(ty)?);
        }
        Ok(set)
    }
}
