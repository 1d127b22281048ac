//! Artifact identity.
//!
//! A [`Target`] names a single artifact: a path of name components plus a
//! [`KindId`]. The path length always equals the depth of the kind's rank,
//! which is enforced at construction.
//!
//! A component may be the wildcard `*`, standing for every name at that
//! position. Wildcarded targets appear in *requests* and in contract
//! patterns; containers only ever hold concrete targets, and [`TargetSet::expand`]
//! resolves a wildcarded request against what a container actually holds.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::kind::{KindId, Taxonomy};

/// One component of a target path: a concrete name or the wildcard `*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// Matches every name at this position.
    All,
    Name(Arc<str>),
}

impl Component {
    pub fn name(name: impl AsRef<str>) -> Self {
        Component::Name(name.as_ref().into())
    }

    /// Parses `*` as the wildcard, anything else as a concrete name.
    pub fn parse(text: &str) -> Self {
        match text {
            "*" => Component::All,
            name => Component::name(name),
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Component::Name(_))
    }

    /// Whether this (possibly concrete) component satisfies `pattern`.
    fn satisfies(&self, pattern: &Component) -> bool {
        match pattern {
            Component::All => true,
            Component::Name(want) => match self {
                Component::Name(name) => name == want,
                Component::All => false,
            },
        }
    }

    /// Combines two patterns into the most specific one, or `None` when they
    /// name different things.
    pub(crate) fn unify(&self, other: &Component) -> Option<Component> {
        match (self, other) {
            (Component::All, c) | (c, Component::All) => Some(c.clone()),
            (Component::Name(a), Component::Name(b)) if a == b => Some(self.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::All => write!(f, "*"),
            Component::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Identity of a single artifact: a name path plus a kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    kind: KindId,
    path: Vec<Component>,
}

impl Target {
    /// Creates a target, checking that the path arity matches the kind's rank.
    pub fn new(
        kind: KindId,
        path: Vec<Component>,
        tax: &Taxonomy,
    ) -> Result<Self, PipelineError> {
        let want = tax.depth_of(kind);
        if path.len() != want {
            let rendered = path
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("/");
            return Err(PipelineError::InvalidTarget(
                format!("{rendered}:{}", tax.kind_name(kind)),
                format!("kind `{}` expects {want} path components", tax.kind_name(kind)),
            ));
        }
        Ok(Self { kind, path })
    }

    /// Parses a `a/b/c` path, `*` components included.
    pub fn parse(kind: KindId, path: &str, tax: &Taxonomy) -> Result<Self, PipelineError> {
        let path = path.split('/').map(Component::parse).collect();
        Self::new(kind, path, tax)
    }

    /// Constructs without the arity check, for paths derived from already
    /// validated patterns.
    pub(crate) fn raw(kind: KindId, path: Vec<Component>) -> Self {
        Self { kind, path }
    }

    pub fn kind(&self) -> KindId {
        self.kind
    }

    pub fn path(&self) -> &[Component] {
        &self.path
    }

    /// A target is concrete iff no component is the wildcard.
    pub fn is_concrete(&self) -> bool {
        self.path.iter().all(Component::is_concrete)
    }

    /// Whether this target satisfies `pattern`: the kind must match by
    /// descent and every concrete pattern component must agree.
    pub fn satisfies(&self, pattern: &Target, tax: &Taxonomy) -> bool {
        tax.matches(self.kind, pattern.kind)
            && self.path.len() == pattern.path.len()
            && self
                .path
                .iter()
                .zip(&pattern.path)
                .all(|(c, p)| c.satisfies(p))
    }

    /// Renders as `path/components:KindName`.
    pub fn display(&self, tax: &Taxonomy) -> String {
        let path = self
            .path
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("/");
        format!("{path}:{}", tax.kind_name(self.kind))
    }
}

/// An ordered set of targets with the usual set algebra.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    inner: BTreeSet<Target>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: Target) -> bool {
        self.inner.insert(target)
    }

    pub fn remove(&mut self, target: &Target) -> bool {
        self.inner.remove(target)
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.inner.contains(target)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.inner.iter()
    }

    pub fn union_with(&mut self, other: &TargetSet) {
        self.inner.extend(other.inner.iter().cloned());
    }

    pub fn union(&self, other: &TargetSet) -> TargetSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn difference(&self, other: &TargetSet) -> TargetSet {
        TargetSet {
            inner: self.inner.difference(&other.inner).cloned().collect(),
        }
    }

    pub fn intersection(&self, other: &TargetSet) -> TargetSet {
        TargetSet {
            inner: self.inner.intersection(&other.inner).cloned().collect(),
        }
    }

    /// Resolves this (possibly wildcarded) request against the concrete
    /// targets in `present`: the result is every present target that
    /// satisfies at least one element of the request.
    pub fn expand(&self, present: &TargetSet, tax: &Taxonomy) -> TargetSet {
        TargetSet {
            inner: present
                .inner
                .iter()
                .filter(|t| self.inner.iter().any(|p| t.satisfies(p, tax)))
                .cloned()
                .collect(),
        }
    }

    /// Whether some element of this set matches `target` as a pattern.
    pub fn covers(&self, target: &Target, tax: &Taxonomy) -> bool {
        self.inner.iter().any(|p| target.satisfies(p, tax))
    }

    pub fn display(&self, tax: &Taxonomy) -> String {
        let items = self
            .inner
            .iter()
            .map(|t| t.display(tax))
            .collect::<Vec<_>>()
            .join(", ");
        format!("[{items}]")
    }
}

impl FromIterator<Target> for TargetSet {
    fn from_iter<I: IntoIterator<Item = Target>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TargetSet {
    type Item = Target;
    type IntoIter = std::collections::btree_set::IntoIter<Target>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy() -> (Taxonomy, KindId, KindId) {
        let mut tax = Taxonomy::new();
        let root = tax.register_rank("root", None).unwrap();

        let base = tax.register_kind("base", root, None).unwrap();
        let sub = tax.register_kind("sub", root, Some(base)).unwrap();

        (tax, base, sub)
    }

    #[test]
    fn arity_is_enforced() {
        let (tax, base, _) = taxonomy();

        assert!(Target::parse(base, "a", &tax).is_ok());
        assert!(Target::parse(base, "a/b", &tax).is_err());
    }

    #[test]
    fn wildcard_expansion_matches_kind_and_presence() {
        let (tax, base, sub) = taxonomy();

        let present: TargetSet = ["a", "b", "c"]
            .iter()
            .map(|n| Target::parse(base, n, &tax).unwrap())
            .chain([Target::parse(sub, "d", &tax).unwrap()])
            .collect();

        // `*:base` matches everything, descendants included.
        let all: TargetSet = [Target::parse(base, "*", &tax).unwrap()].into_iter().collect();
        assert_eq!(all.expand(&present, &tax).len(), 4);

        // `*:sub` matches only the subtyped target.
        let subs: TargetSet = [Target::parse(sub, "*", &tax).unwrap()].into_iter().collect();
        let expanded = subs.expand(&present, &tax);
        assert_eq!(expanded.len(), 1);
        assert!(expanded.contains(&Target::parse(sub, "d", &tax).unwrap()));
    }

    #[test]
    fn concrete_requests_expand_to_themselves() {
        let (tax, base, _) = taxonomy();

        let present: TargetSet = [Target::parse(base, "a", &tax).unwrap()].into_iter().collect();
        let request: TargetSet = [
            Target::parse(base, "a", &tax).unwrap(),
            Target::parse(base, "missing", &tax).unwrap(),
        ]
        .into_iter()
        .collect();

        let expanded = request.expand(&present, &tax);
        assert_eq!(expanded.len(), 1);
        assert!(expanded.contains(&Target::parse(base, "a", &tax).unwrap()));
    }

    #[test]
    fn set_algebra() {
        let (tax, base, _) = taxonomy();
        let t = |n| Target::parse(base, n, &tax).unwrap();

        let ab: TargetSet = [t("a"), t("b")].into_iter().collect();
        let bc: TargetSet = [t("b"), t("c")].into_iter().collect();

        assert_eq!(ab.union(&bc).len(), 3);
        assert_eq!(ab.intersection(&bc).len(), 1);
        assert_eq!(ab.difference(&bc).len(), 1);
        assert!(ab.difference(&bc).contains(&t("a")));
    }

    #[test]
    fn unify_components() {
        let a = Component::name("a");
        let b = Component::name("b");

        assert_eq!(a.unify(&Component::All), Some(a.clone()));
        assert_eq!(Component::All.unify(&b), Some(b.clone()));
        assert_eq!(a.unify(&b), None);
        assert_eq!(
            Component::All.unify(&Component::All),
            Some(Component::All)
        );
    }
}
