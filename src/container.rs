//! Typed artifact stores.
//!
//! A [`Container`] owns the bytes behind a set of concrete targets and knows
//! which kinds it accepts. The runtime only ever talks to containers through
//! this trait: enumerate what is present, remove what was invalidated, merge
//! a previous snapshot in, and (de)serialize the whole store. Pipes downcast
//! through [`Container::as_any_mut`] to reach the concrete type they were
//! written against.
//!
//! A [`ContainerSet`] is one step's view: a name-keyed map of containers,
//! cloned wholesale at step entry so steps never share storage in place.

pub mod binary;
pub mod module;
pub mod strings;

use std::any::Any;
use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::kind::{KindId, Taxonomy};
use crate::target::{Component, Target, TargetSet};

pub trait Container: Send {
    /// The registered type name, e.g. `StringContainer`.
    fn type_name(&self) -> &'static str;

    /// Whether artifacts of this kind may live here.
    fn accepts(&self, kind: KindId) -> bool;

    /// Every concrete target currently present.
    fn enumerate(&self) -> TargetSet;

    fn contains(&self, target: &Target) -> bool;

    /// Discards the listed targets and their bytes. Unknown targets are
    /// ignored.
    fn remove(&mut self, targets: &TargetSet);

    /// Folds another instance of the same container type into this one.
    /// Colliding targets take the incoming value.
    fn merge(&mut self, other: Box<dyn Container>) -> Result<(), PipelineError>;

    fn clone_box(&self) -> Box<dyn Container>;

    /// Serializes the full store. The format is owned by the container type;
    /// the runtime only requires that `load` restores an equal store.
    fn save(&self, tax: &Taxonomy, sink: &mut dyn Write) -> std::io::Result<()>;

    fn load(&mut self, tax: &Taxonomy, source: &mut dyn Read) -> std::io::Result<()>;

    /// Ingests caller-provided bytes (an `-i` binding). Defaults to the
    /// persisted format; container types with a natural external format
    /// (plain text, raw binary) override this.
    fn import(&mut self, tax: &Taxonomy, bytes: &[u8]) -> std::io::Result<()> {
        self.load(tax, &mut std::io::Cursor::new(bytes))
    }

    /// Writes caller-facing bytes (an `-o` binding). Defaults to the
    /// persisted format.
    fn export(&self, tax: &Taxonomy, sink: &mut dyn Write) -> std::io::Result<()> {
        self.save(tax, sink)
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn Container> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The name-addressed containers of one step.
#[derive(Default)]
pub struct ContainerSet {
    inner: BTreeMap<String, Box<dyn Container>>,
}

impl ContainerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, container: Box<dyn Container>) {
        self.inner.insert(name.into(), container);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Container> {
        self.inner.get(name).map(|c| c.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Container>> {
        self.inner.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Container)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Box<dyn Container>)> {
        self.inner.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Borrows the named containers mutably, in the order requested. Every
    /// name must be present and distinct.
    pub fn slice_mut<'a>(
        &'a mut self,
        names: &[String],
    ) -> Result<Vec<&'a mut (dyn Container + 'a)>, PipelineError> {
        let mut picked: BTreeMap<&'a str, &'a mut (dyn Container + 'a)> = BTreeMap::new();
        for (name, boxed) in self.inner.iter_mut() {
            if names.iter().any(|n| n == name) {
                picked.insert(name.as_str(), boxed.as_mut());
            }
        }

        names
            .iter()
            .map(|name| {
                picked
                    .remove(name.as_str())
                    .ok_or_else(|| PipelineError::UnknownContainer(name.clone()))
            })
            .collect()
    }
}

impl Clone for ContainerSet {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Portable target encoding used inside persisted container payloads: kind
/// by name, components as plain strings.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SavedTarget {
    kind: String,
    path: Vec<String>,
}

impl SavedTarget {
    pub(crate) fn encode(target: &Target, tax: &Taxonomy) -> Self {
        Self {
            kind: tax.kind_name(target.kind()).to_string(),
            path: target.path().iter().map(ToString::to_string).collect(),
        }
    }

    pub(crate) fn decode(self, tax: &Taxonomy) -> std::io::Result<Target> {
        let kind = tax
            .kind_named(&self.kind)
            .map_err(std::io::Error::other)?;
        let path = self.path.iter().map(|c| Component::parse(c)).collect();
        Target::new(kind, path, tax).map_err(std::io::Error::other)
    }
}
