//! A line-oriented store for root-rank text artifacts.
//!
//! Each entry is a single named string. The external format (`-i`/`-o`
//! bindings) is plain text: one line per artifact, the line being both the
//! name and the payload. The persisted format is CBOR.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use crate::container::{Container, SavedTarget};
use crate::error::PipelineError;
use crate::kind::{KindId, Taxonomy};
use crate::target::{Component, Target, TargetSet};

#[derive(Debug, Clone)]
pub struct StringContainer {
    primary: KindId,
    kinds: BTreeSet<KindId>,
    entries: BTreeMap<Target, String>,
}

impl StringContainer {
    pub const TYPE: &'static str = "StringContainer";

    /// A store accepting only `primary`, the kind imported lines get.
    pub fn new(primary: KindId) -> Self {
        Self {
            primary,
            kinds: BTreeSet::from([primary]),
            entries: BTreeMap::new(),
        }
    }

    /// Extends the accepted kind set.
    pub fn also_accepting(mut self, kind: KindId) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn insert(&mut self, target: Target, value: impl Into<String>) -> Option<String> {
        self.entries.insert(target, value.into())
    }

    pub fn get(&self, target: &Target) -> Option<&str> {
        self.entries.get(target).map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Target, &str)> {
        self.entries.iter().map(|(t, v)| (t, v.as_str()))
    }
}

impl Container for StringContainer {
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
        let entries: Vec<(SavedTarget, &str)> = self
            .entries
            .iter()
            .map(|(t, v)| (SavedTarget::encode(t, tax), v.as_str()))
            .collect();

        ciborium::into_writer(&entries, sink).map_err(std::io::Error::other)
    }

    fn load(&mut self, tax: &Taxonomy, source: &mut dyn Read) -> std::io::Result<()> {
        let entries: Vec<(SavedTarget, String)> =
            ciborium::from_reader(source).map_err(std::io::Error::other)?;

        self.entries.clear();
        for (saved, value) in entries {
            self.entries.insert(saved.decode(tax)?, value);
        }

        Ok(())
    }

    fn import(&mut self, tax: &Taxonomy, bytes: &[u8]) -> std::io::Result<()> {
        if tax.depth_of(self.primary) != 1 {
            return Err(std::io::Error::other(
                "line imports require a root-rank primary kind",
            ));
        }

        let text = std::str::from_utf8(bytes)
            .map_err(|_| std::io::Error::other("input is not valid UTF-8"))?;

        for line in text.lines().filter(|l| !l.is_empty()) {
            let target = Target::raw(self.primary, vec![Component::name(line)]);
            self.entries.insert(target, line.to_string());
        }

        Ok(())
    }

    fn export(&self, _: &Taxonomy, sink: &mut dyn Write) -> std::io::Result<()> {
        for value in self.entries.values() {
            writeln!(sink, "{value}")?;
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
        let kind = tax.register_kind("string-kind", root, None).unwrap();
        (tax, kind)
    }

    #[test]
    fn import_splits_lines_into_targets() {
        let (tax, kind) = taxonomy();
        let mut container = StringContainer::new(kind);

        container.import(&tax, b"a\nb\nc\n").unwrap();

        let present = container.enumerate();
        assert_eq!(present.len(), 3);
        for name in ["a", "b", "c"] {
            assert!(present.contains(&Target::parse(kind, name, &tax).unwrap()));
        }
    }

    #[test]
    fn save_load_round_trip() {
        let (tax, kind) = taxonomy();
        let mut container = StringContainer::new(kind);
        container.import(&tax, b"x\ny\n").unwrap();

        let mut buffer = Vec::new();
        container.save(&tax, &mut buffer).unwrap();

        let mut restored = StringContainer::new(kind);
        restored.load(&tax, &mut buffer.as_slice()).unwrap();

        assert_eq!(restored.enumerate(), container.enumerate());
        let target = Target::parse(kind, "x", &tax).unwrap();
        assert_eq!(restored.get(&target), Some("x"));
    }

    #[test]
    fn merge_takes_incoming_values() {
        let (tax, kind) = taxonomy();
        let target = Target::parse(kind, "a", &tax).unwrap();

        let mut left = StringContainer::new(kind);
        left.insert(target.clone(), "old");

        let mut right = StringContainer::new(kind);
        right.insert(target.clone(), "new");

        left.merge(Box::new(right)).unwrap();
        assert_eq!(left.get(&target), Some("new"));
    }

    #[test]
    fn remove_discards_entries() {
        let (tax, kind) = taxonomy();
        let mut container = StringContainer::new(kind);
        container.import(&tax, b"a\nb\n").unwrap();

        let doomed: TargetSet = [Target::parse(kind, "a", &tax).unwrap()]
            .into_iter()
            .collect();
        container.remove(&doomed);

        assert_eq!(container.enumerate().len(), 1);
        assert!(!container.contains(&Target::parse(kind, "a", &tax).unwrap()));
    }
}
