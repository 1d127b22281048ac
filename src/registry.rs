//! Name-keyed registries for container types, pipe types and passes.
//!
//! Front-ends register their types here before a pipeline description is
//! resolved; the description then refers to everything by string name. The
//! default set covers the built-in container and pipe types.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::container::Container;
use crate::container::binary::BinaryContainer;
use crate::container::module::ModuleContainer;
use crate::container::strings::StringContainer;
use crate::contract::{Contract, ContractRule, InputPattern, PathOp};
use crate::error::PipelineError;
use crate::kind::Taxonomy;
use crate::pipe::{CopyPipe, GlobalDce, ModulePass, PassPipe, Pipe, StripDebug};
use crate::target::Component;

/// Builds a fresh container of a registered type.
pub type ContainerFactory =
    Arc<dyn Fn(&Taxonomy) -> Result<Box<dyn Container>, PipelineError> + Send + Sync>;

/// Builds a pipe of a registered type, given its (possibly empty) inner pass
/// list from the description.
pub type PipeFactory =
    Arc<dyn Fn(&Registry, &[String]) -> Result<Arc<dyn Pipe>, PipelineError> + Send + Sync>;

pub struct Registry {
    taxonomy: Taxonomy,
    containers: BTreeMap<String, ContainerFactory>,
    pipes: BTreeMap<String, PipeFactory>,
    passes: BTreeMap<String, Arc<dyn ModulePass>>,
}

impl Registry {
    pub fn new(taxonomy: Taxonomy) -> Self {
        Self {
            taxonomy,
            containers: BTreeMap::new(),
            pipes: BTreeMap::new(),
            passes: BTreeMap::new(),
        }
    }

    /// The built-in taxonomy and types: `root`/`function` ranks, the
    /// `BinaryKind`/`StringKind`/`ModuleKind`/`SymbolKind` kinds, the three
    /// built-in container types and the `Copy` and `PassPipe` pipes.
    pub fn with_defaults() -> Result<Self, PipelineError> {
        let mut taxonomy = Taxonomy::new();
        let root = taxonomy.register_rank("root", None)?;
        let function = taxonomy.register_rank("function", Some(root))?;

        taxonomy.register_kind("BinaryKind", root, None)?;
        taxonomy.register_kind("StringKind", root, None)?;
        taxonomy.register_kind("ModuleKind", root, None)?;
        taxonomy.register_kind("SymbolKind", function, None)?;

        let mut registry = Self::new(taxonomy);

        registry.register_container(StringContainer::TYPE, |tax| {
            Ok(Box::new(StringContainer::new(tax.kind_named("StringKind")?)))
        });
        registry.register_container(BinaryContainer::TYPE, |tax| {
            Ok(Box::new(BinaryContainer::new(tax.kind_named("BinaryKind")?)))
        });
        registry.register_container(ModuleContainer::TYPE, |tax| {
            Ok(Box::new(ModuleContainer::new(tax.kind_named("ModuleKind")?)))
        });

        registry.register_pipe(CopyPipe::TYPE, |registry, _| {
            let tax = registry.taxonomy();
            let kind = tax.kind_named("StringKind")?;
            let contract = Contract::build(
                2,
                vec![
                    ContractRule::new(
                        Some(InputPattern::new(0, kind, vec![Component::All])),
                        1,
                        kind,
                        PathOp::Identity,
                    )
                    .preserving(),
                ],
                tax,
            )?;
            Ok(Arc::new(CopyPipe::new(kind, contract)))
        });

        registry.register_pipe(PassPipe::TYPE, |registry, passes| {
            let tax = registry.taxonomy();
            let kind = tax.kind_named("ModuleKind")?;
            let contract = Contract::build(
                1,
                vec![
                    ContractRule::new(
                        Some(InputPattern::new(0, kind, vec![Component::All])),
                        0,
                        kind,
                        PathOp::Identity,
                    )
                    .preserving(),
                ],
                tax,
            )?;

            let passes = passes
                .iter()
                .map(|name| registry.pass(name))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Arc::new(PassPipe::new(passes, contract)))
        });

        registry.register_pass(Arc::new(GlobalDce));
        registry.register_pass(Arc::new(StripDebug));

        Ok(registry)
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn taxonomy_mut(&mut self) -> &mut Taxonomy {
        &mut self.taxonomy
    }

    pub fn register_container(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Taxonomy) -> Result<Box<dyn Container>, PipelineError>
        + Send
        + Sync
        + 'static,
    ) {
        self.containers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_pipe(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Registry, &[String]) -> Result<Arc<dyn Pipe>, PipelineError>
        + Send
        + Sync
        + 'static,
    ) {
        self.pipes.insert(name.into(), Arc::new(factory));
    }

    pub fn register_pass(&mut self, pass: Arc<dyn ModulePass>) {
        self.passes.insert(pass.name().to_string(), pass);
    }

    pub fn make_container(&self, ty: &str) -> Result<Box<dyn Container>, PipelineError> {
        let factory = self
            .containers
            .get(ty)
            .ok_or_else(|| PipelineError::UnknownContainer(ty.to_string()))?;
        factory.as_ref()(&self.taxonomy)
    }

    pub fn make_pipe(&self, ty: &str, passes: &[String]) -> Result<Arc<dyn Pipe>, PipelineError> {
        let factory = self
            .pipes
            .get(ty)
            .ok_or_else(|| PipelineError::UnknownPipe(ty.to_string()))?;
        factory.as_ref()(self, passes)
    }

    pub fn pass(&self, name: &str) -> Result<Arc<dyn ModulePass>, PipelineError> {
        self.passes
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownPass(name.to_string()))
    }
}
