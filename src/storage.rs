//! The persistent working directory.
//!
//! Layout under the root: one subdirectory per step holding one file per
//! container (the container's own serialized format) plus a JSON manifest
//! recording the container types, and one sibling file per global, named by
//! the global's registered name. Writes go through a temporary file and a
//! rename, so an interrupted run never truncates a previously good artifact.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};

use crate::container::{Container, ContainerSet};
use crate::context::Context;
use crate::error::{PipelineError, StorageError};
use crate::kind::Taxonomy;

const MANIFEST: &str = "manifest.json";

pub struct Storage {
    root: Utf8PathBuf,
}

impl Storage {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| StorageError::Write(root.clone(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn step_dir(&self, step: &str) -> Utf8PathBuf {
        self.root.join(step)
    }

    fn container_path(&self, step: &str, container: &str) -> Utf8PathBuf {
        self.step_dir(step).join(format!("{container}.cbor"))
    }

    pub fn has_container(&self, step: &str, container: &str) -> bool {
        self.container_path(step, container).exists()
    }

    /// Persists every container of a step, manifest included.
    pub fn save_step(
        &self,
        step: &str,
        tax: &Taxonomy,
        containers: &ContainerSet,
    ) -> Result<(), PipelineError> {
        let dir = self.step_dir(step);
        fs::create_dir_all(&dir).map_err(|e| StorageError::Write(dir.clone(), e))?;

        let manifest: BTreeMap<&str, &str> = containers
            .iter()
            .map(|(name, container)| (name, container.type_name()))
            .collect();
        let encoded = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StorageError::Serialize(dir.join(MANIFEST), e.to_string()))?;
        write_atomic(&dir.join(MANIFEST), &encoded)?;

        for (name, container) in containers.iter() {
            self.save_container(step, tax, name, container)?;
        }

        Ok(())
    }

    pub fn save_container(
        &self,
        step: &str,
        tax: &Taxonomy,
        name: &str,
        container: &dyn Container,
    ) -> Result<(), PipelineError> {
        let dir = self.step_dir(step);
        fs::create_dir_all(&dir).map_err(|e| StorageError::Write(dir.clone(), e))?;

        let path = self.container_path(step, name);
        let mut buffer = Vec::new();
        container
            .save(tax, &mut buffer)
            .map_err(|e| StorageError::Serialize(path.clone(), e.to_string()))?;

        write_atomic(&path, &buffer)
    }

    /// Restores whatever this step has on disk into the given (already
    /// materialized) containers. Containers with no file stay empty. A
    /// manifest type mismatch means the directory belongs to a different
    /// pipeline and is a deserialization error.
    pub fn load_step(
        &self,
        step: &str,
        tax: &Taxonomy,
        containers: &mut ContainerSet,
    ) -> Result<(), PipelineError> {
        let dir = self.step_dir(step);
        if !dir.exists() {
            return Ok(());
        }

        let manifest_path = dir.join(MANIFEST);
        let manifest: BTreeMap<String, String> = if manifest_path.exists() {
            let file = File::open(&manifest_path)
                .map_err(|e| StorageError::Read(manifest_path.clone(), e))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| StorageError::Deserialize(manifest_path.clone(), e.to_string()))?
        } else {
            BTreeMap::new()
        };

        for (name, container) in containers.iter_mut() {
            let path = self.container_path(step, name);
            if !path.exists() {
                continue;
            }

            if let Some(ty) = manifest.get(name)
                && ty != container.type_name()
            {
                return Err(StorageError::Deserialize(
                    path,
                    format!(
                        "stored as `{ty}`, the pipeline declares `{}`",
                        container.type_name()
                    ),
                )
                .into());
            }

            let file = File::open(&path).map_err(|e| StorageError::Read(path.clone(), e))?;
            container
                .load(tax, &mut BufReader::new(file))
                .map_err(|e| StorageError::Deserialize(path.clone(), e.to_string()))?;
        }

        Ok(())
    }

    /// Loads a single persisted container into a fresh instance.
    pub fn load_container(
        &self,
        step: &str,
        tax: &Taxonomy,
        name: &str,
        container: &mut dyn Container,
    ) -> Result<(), PipelineError> {
        let path = self.container_path(step, name);
        if !path.exists() {
            return Ok(());
        }

        let file = File::open(&path).map_err(|e| StorageError::Read(path.clone(), e))?;
        container
            .load(tax, &mut BufReader::new(file))
            .map_err(|e| StorageError::Deserialize(path.clone(), e.to_string()))?;

        Ok(())
    }

    pub fn save_globals(&self, ctx: &Context) -> Result<(), PipelineError> {
        for name in ctx.global_names() {
            let mut buffer = Vec::new();
            ctx.save_global(name, &mut buffer)?;
            write_atomic(&self.root.join(name), &buffer)?;
        }
        Ok(())
    }

    /// Restores every registered global that has a file on disk. Reloading
    /// is not a mutation: it does not trigger invalidation.
    pub fn load_globals(&self, ctx: &mut Context) -> Result<(), PipelineError> {
        let names: Vec<String> = ctx.global_names().map(str::to_string).collect();

        for name in names {
            let path = self.root.join(&name);
            if !path.exists() {
                continue;
            }

            let file = File::open(&path).map_err(|e| StorageError::Read(path.clone(), e))?;
            ctx.load_global(&name, &mut BufReader::new(file))?;
        }

        Ok(())
    }
}

fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let tmp = path.with_extension("tmp");

    fs::write(&tmp, bytes).map_err(|e| StorageError::Write(tmp.clone(), e))?;
    fs::rename(&tmp, path).map_err(|e| StorageError::Write(path.to_owned(), e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::strings::StringContainer;
    use crate::registry::Registry;
    use crate::target::{Target, TargetSet};

    fn scratch() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_str().unwrap()).unwrap();
        (dir, storage)
    }

    #[test]
    fn step_round_trip() {
        let registry = Registry::with_defaults().unwrap();
        let tax = registry.taxonomy();
        let kind = tax.kind_named("StringKind").unwrap();

        let (_dir, storage) = scratch();

        let mut containers = ContainerSet::new();
        let mut strings = StringContainer::new(kind);
        strings.insert(Target::parse(kind, "a", tax).unwrap(), "a");
        containers.insert("strings", Box::new(strings));

        storage.save_step("first", tax, &containers).unwrap();

        let mut restored = ContainerSet::new();
        restored.insert("strings", Box::new(StringContainer::new(kind)));
        storage.load_step("first", tax, &mut restored).unwrap();

        let present = restored.get("strings").unwrap().enumerate();
        assert!(present.contains(&Target::parse(kind, "a", tax).unwrap()));
    }

    #[test]
    fn manifest_type_mismatch_is_an_error() {
        let registry = Registry::with_defaults().unwrap();
        let tax = registry.taxonomy();
        let kind = tax.kind_named("StringKind").unwrap();
        let binary = tax.kind_named("BinaryKind").unwrap();

        let (_dir, storage) = scratch();

        let mut containers = ContainerSet::new();
        containers.insert("c", Box::new(StringContainer::new(kind)));
        storage.save_step("first", tax, &containers).unwrap();

        let mut mismatched = ContainerSet::new();
        mismatched.insert(
            "c",
            Box::new(crate::container::binary::BinaryContainer::new(binary)),
        );

        assert!(matches!(
            storage.load_step("first", tax, &mut mismatched),
            Err(PipelineError::Storage(StorageError::Deserialize(..)))
        ));
    }

    #[test]
    fn rewrite_after_removal_sticks() {
        let registry = Registry::with_defaults().unwrap();
        let tax = registry.taxonomy();
        let kind = tax.kind_named("StringKind").unwrap();

        let (_dir, storage) = scratch();

        let mut strings = StringContainer::new(kind);
        strings.insert(Target::parse(kind, "a", tax).unwrap(), "a");
        strings.insert(Target::parse(kind, "b", tax).unwrap(), "b");
        storage.save_container("first", tax, "strings", &strings).unwrap();

        let doomed: TargetSet = [Target::parse(kind, "a", tax).unwrap()]
            .into_iter()
            .collect();
        strings.remove(&doomed);
        storage.save_container("first", tax, "strings", &strings).unwrap();

        let mut restored = StringContainer::new(kind);
        storage
            .load_container("first", tax, "strings", &mut restored)
            .unwrap();

        assert_eq!(restored.enumerate().len(), 1);
    }
}
