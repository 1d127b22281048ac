//! An opaque byte-blob store, holding the raw input binary and other
//! root-rank artifacts addressed as a whole.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use crate::container::{Container, SavedTarget};
use crate::error::PipelineError;
use crate::kind::{KindId, Taxonomy};
use crate::target::{Component, Target, TargetSet};

/// Name given to bytes ingested through an input binding.
const IMPORT_NAME: &str = "binary";

#[derive(Debug, Clone)]
pub struct BinaryContainer {
    primary: KindId,
    kinds: BTreeSet<KindId>,
    entries: BTreeMap<Target, Vec<u8>>,
}

impl BinaryContainer {
    pub const TYPE: &'static str = "Binary";

    pub fn new(primary: KindId) -> Self {
        Self {
            primary,
            kinds: BTreeSet::from([primary]),
            entries: BTreeMap::new(),
        }
    }

    pub fn also_accepting(mut self, kind: KindId) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn insert(&mut self, target: Target, bytes: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(target, bytes)
    }

    pub fn get(&self, target: &Target) -> Option<&[u8]> {
        self.entries.get(target).map(Vec::as_slice)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Target, &[u8])> {
        self.entries.iter().map(|(t, v)| (t, v.as_slice()))
    }
}

impl Container for BinaryContainer {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn accepts(&self, kind: KindId) -> bool {
        self.kinds.contains(&kind)
    }

    fn enumerate(&self) -> TargetSet {
        self.entries.keys().cloned().collect()
    }

    fn contains(&self, target: &Target) -> bool {
        self.entries.contains_key(target)
    }

    fn remove(&mut self, targets: &TargetSet) {
        for target in targets.iter() {
            self.entries.remove(target);
        }
    }

    fn merge(&mut self, other: Box<dyn Container>) -> Result<(), PipelineError> {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => {
                self.entries
                    .extend(other.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(())
            }
            None => Err(PipelineError::MergeMismatch {
                this: Self::TYPE,
                other: other.type_name(),
            }),
        }
    }

    fn clone_box(&self) -> Box<dyn Container> {
        Box::new(self.clone())
    }

    fn save(&self, tax: &Taxonomy, sink: &mut dyn Write) -> std::io::Result<()> {
        let entries: Vec<(SavedTarget, &[u8])> = self
            .entries
            .iter()
            .map(|(t, v)| (SavedTarget::encode(t, tax), v.as_slice()))
            .collect();

        ciborium::into_writer(&entries, sink).map_err(std::io::Error::other)
    }

    fn load(&mut self, tax: &Taxonomy, source: &mut dyn Read) -> std::io::Result<()> {
        let entries: Vec<(SavedTarget, Vec<u8>)> =
            ciborium::from_reader(source).map_err(std::io::Error::other)?;

        self.entries.clear();
        for (saved, bytes) in entries {
            self.entries.insert(saved.decode(tax)?, bytes);
        }

        Ok(())
    }

    fn import(&mut self, tax: &Taxonomy, bytes: &[u8]) -> std::io::Result<()> {
        if tax.depth_of(self.primary) != 1 {
            return Err(std::io::Error::other(
                "blob imports require a root-rank primary kind",
            ));
        }

        let target = Target::raw(self.primary, vec![Component::name(IMPORT_NAME)]);
        self.entries.clear();
        self.entries.insert(target, bytes.to_vec());

        Ok(())
    }

    fn export(&self, _: &Taxonomy, sink: &mut dyn Write) -> std::io::Result<()> {
        for bytes in self.entries.values() {
            sink.write_all(bytes)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy() -> (Taxonomy, KindId) {
        let mut tax = Taxonomy::new();
        let root = tax.register_rank("root", None).unwrap();
        let kind = tax.register_kind("binary-kind", root, None).unwrap();
        (tax, kind)
    }

    #[test]
    fn import_stores_one_blob() {
        let (tax, kind) = taxonomy();
        let mut container = BinaryContainer::new(kind);

        container.import(&tax, &[0x7f, b'E', b'L', b'F']).unwrap();

        assert_eq!(container.enumerate().len(), 1);
        let target = Target::parse(kind, IMPORT_NAME, &tax).unwrap();
        assert_eq!(container.get(&target), Some(&[0x7f, b'E', b'L', b'F'][..]));
    }

    #[test]
    fn save_load_round_trip() {
        let (tax, kind) = taxonomy();
        let mut container = BinaryContainer::new(kind);
        container.import(&tax, b"payload").unwrap();

        let mut buffer = Vec::new();
        container.save(&tax, &mut buffer).unwrap();

        let mut restored = BinaryContainer::new(kind);
        restored.load(&tax, &mut buffer.as_slice()).unwrap();

        assert_eq!(restored.enumerate(), container.enumerate());
    }
}
