//! Shared state crossing step boundaries.
//!
//! The [`Context`] owns the registries and the named [`Global`]s (the program
//! model being the canonical one). Every pipe receives the context by
//! reference at execution; mutation of a global happens *between* pipe runs
//! through [`Context::update_global`], which fingerprints the serialized
//! state and records the global as dirty when it actually changed. The
//! runner drains the dirty list through the invalidator before the next run.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use crate::error::{PipelineError, StorageError};
use crate::registry::Registry;

/// blake3 digest of a global's serialized state, used to tell real mutations
/// from no-op writes. Artifact identity stays name-based; this digest exists
/// only for change detection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fingerprint([u8; 32]);

impl Fingerprint {
    fn of(buffer: &[u8]) -> Self {
        Self(blake3::hash(buffer).into())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(64);
        for &byte in &self.0 {
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0xf) as usize] as char);
        }
        write!(f, "Fingerprint({out})")
    }
}

/// A named, serializable process-wide value.
///
/// Each implementor owns its serialization format; the runtime only requires
/// that `load` restores what `save` wrote.
pub trait Global: Send + Any {
    fn save(&self, sink: &mut dyn Write) -> std::io::Result<()>;
    fn load(&mut self, source: &mut dyn Read) -> std::io::Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct Context {
    registry: Registry,
    globals: BTreeMap<String, Box<dyn Global>>,
    fingerprints: BTreeMap<String, Fingerprint>,
    dirty: BTreeSet<String>,
    flags: BTreeSet<String>,
}

impl Context {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            globals: BTreeMap::new(),
            fingerprints: BTreeMap::new(),
            dirty: BTreeSet::new(),
            flags: BTreeSet::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Registers a global under a unique name, fingerprinting its initial
    /// state.
    pub fn register_global(
        &mut self,
        name: impl Into<String>,
        global: Box<dyn Global>,
    ) -> Result<(), PipelineError> {
        let name = name.into();
        if self.globals.contains_key(&name) {
            return Err(PipelineError::Description(format!(
                "global `{name}` is already registered"
            )));
        }

        let print = fingerprint_of(global.as_ref(), &name)?;
        self.fingerprints.insert(name.clone(), print);
        self.globals.insert(name, global);

        Ok(())
    }

    /// Typed read access.
    pub fn global<T: Global>(&self, name: &str) -> Result<&T, PipelineError> {
        let boxed = self
            .globals
            .get(name)
            .ok_or_else(|| PipelineError::GlobalNotFound(name.to_string()))?;

        boxed
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| PipelineError::GlobalTypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Runs `update` against the named global and records it as dirty when
    /// its serialized state actually changed.
    pub fn update_global<T: Global, R>(
        &mut self,
        name: &str,
        update: impl FnOnce(&mut T) -> R,
    ) -> Result<R, PipelineError> {
        let boxed = self
            .globals
            .get_mut(name)
            .ok_or_else(|| PipelineError::GlobalNotFound(name.to_string()))?;

        let value = boxed
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| PipelineError::GlobalTypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })?;

        let out = update(value);
        let print = fingerprint_of(boxed.as_ref(), name)?;

        if self.fingerprints.get(name) != Some(&print) {
            tracing::debug!(global = name, "global state changed");
            self.fingerprints.insert(name.to_string(), print);
            self.dirty.insert(name.to_string());
        }

        Ok(out)
    }

    /// Globals mutated since the last drain, oldest-name first.
    pub fn take_dirty(&mut self) -> Vec<String> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn global_names(&self) -> impl Iterator<Item = &str> {
        self.globals.keys().map(String::as_str)
    }

    /// Serializes the named global, for persistence.
    pub fn save_global(&self, name: &str, sink: &mut dyn Write) -> Result<(), PipelineError> {
        let boxed = self
            .globals
            .get(name)
            .ok_or_else(|| PipelineError::GlobalNotFound(name.to_string()))?;

        boxed.save(sink).map_err(|e| {
            PipelineError::Storage(StorageError::Serialize(name.into(), e.to_string()))
        })
    }

    /// Restores the named global from persisted bytes. This resets the
    /// change baseline: a reload is not a mutation.
    pub fn load_global(&mut self, name: &str, source: &mut dyn Read) -> Result<(), PipelineError> {
        let boxed = self
            .globals
            .get_mut(name)
            .ok_or_else(|| PipelineError::GlobalNotFound(name.to_string()))?;

        boxed.load(source).map_err(|e| {
            PipelineError::Storage(StorageError::Deserialize(name.into(), e.to_string()))
        })?;

        let print = fingerprint_of(boxed.as_ref(), name)?;
        self.fingerprints.insert(name.to_string(), print);
        self.dirty.remove(name);

        Ok(())
    }

    pub fn set_flag(&mut self, flag: impl Into<String>) {
        self.flags.insert(flag.into());
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }
}

fn fingerprint_of(global: &dyn Global, name: &str) -> Result<Fingerprint, PipelineError> {
    let mut buffer = Vec::new();
    global.save(&mut buffer).map_err(|e| {
        PipelineError::Storage(StorageError::Serialize(name.into(), e.to_string()))
    })?;
    Ok(Fingerprint::of(&buffer))
}
