//! Ranks and kinds: the granularity hierarchy and the artifact type tags.
//!
//! A [`Rank`] is a level in the granularity hierarchy (`root` < `function` <
//! `basic-block` < ...). A rank's *depth* is the number of name components a
//! target at that rank carries, so a `root` artifact is addressed by a single
//! name and a `function` artifact by `[binary, function]`.
//!
//! A [`Kind`] tags artifacts with a type and binds them to exactly one rank.
//! Kinds form a subtype tree: a pattern over a kind also matches every
//! descendant kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::PipelineError;

/// Identifier of a registered rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RankId(u32);

/// Identifier of a registered kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KindId(u32);

#[derive(Debug)]
struct Rank {
    name: Arc<str>,
    depth: usize,
}

#[derive(Debug)]
struct Kind {
    name: Arc<str>,
    rank: RankId,
    parent: Option<KindId>,
}

/// Append-only registry of ranks and kinds.
///
/// Registration happens once, while the embedding front-end wires up its
/// pipeline; afterwards the taxonomy is only queried. Parent links are
/// validated at registration time, so lookups never encounter cycles.
#[derive(Debug, Default)]
pub struct Taxonomy {
    ranks: Vec<Rank>,
    kinds: Vec<Kind>,
    ranks_by_name: BTreeMap<Arc<str>, RankId>,
    kinds_by_name: BTreeMap<Arc<str>, KindId>,
}

impl Taxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new rank below `parent`, or a new root rank when `parent`
    /// is `None`. Root ranks have depth 1: their targets carry one name.
    pub fn register_rank(
        &mut self,
        name: &str,
        parent: Option<RankId>,
    ) -> Result<RankId, PipelineError> {
        if self.ranks_by_name.contains_key(name) {
            return Err(PipelineError::Description(format!(
                "rank `{name}` is already registered"
            )));
        }

        let depth = match parent {
            Some(parent) => self.rank(parent).depth + 1,
            None => 1,
        };

        let name: Arc<str> = name.into();
        let id = RankId(self.ranks.len() as u32);
        self.ranks.push(Rank {
            name: name.clone(),
            depth,
        });
        self.ranks_by_name.insert(name, id);

        Ok(id)
    }

    /// Registers a new kind at `rank`, optionally as a subtype of `parent`.
    pub fn register_kind(
        &mut self,
        name: &str,
        rank: RankId,
        parent: Option<KindId>,
    ) -> Result<KindId, PipelineError> {
        if self.kinds_by_name.contains_key(name) {
            return Err(PipelineError::Description(format!(
                "kind `{name}` is already registered"
            )));
        }

        let name: Arc<str> = name.into();
        let id = KindId(self.kinds.len() as u32);
        self.kinds.push(Kind {
            name: name.clone(),
            rank,
            parent,
        });
        self.kinds_by_name.insert(name, id);

        Ok(id)
    }

    pub fn rank_named(&self, name: &str) -> Result<RankId, PipelineError> {
        self.ranks_by_name
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownRank(name.to_string()))
    }

    pub fn kind_named(&self, name: &str) -> Result<KindId, PipelineError> {
        self.kinds_by_name
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownKind(name.to_string()))
    }

    pub fn rank_name(&self, id: RankId) -> &str {
        &self.rank(id).name
    }

    pub fn kind_name(&self, id: KindId) -> &str {
        &self.kind(id).name
    }

    pub fn rank_of(&self, kind: KindId) -> RankId {
        self.kind(kind).rank
    }

    /// Number of path components a target of this kind carries.
    pub fn depth_of(&self, kind: KindId) -> usize {
        self.rank(self.kind(kind).rank).depth
    }

    /// All kinds registered at ranks of the given depth.
    pub fn kinds_at_depth(&self, depth: usize) -> Vec<KindId> {
        (0..self.kinds.len() as u32)
            .map(KindId)
            .filter(|&id| self.depth_of(id) == depth)
            .collect()
    }

    /// Whether `kind` matches the pattern kind `pattern`, i.e. `kind` is
    /// `pattern` itself or one of its descendants.
    pub fn matches(&self, kind: KindId, pattern: KindId) -> bool {
        let mut cursor = Some(kind);
        while let Some(id) = cursor {
            if id == pattern {
                return true;
            }
            cursor = self.kind(id).parent;
        }
        false
    }

    fn rank(&self, id: RankId) -> &Rank {
        &self.ranks[id.0 as usize]
    }

    fn kind(&self, id: KindId) -> &Kind {
        &self.kinds[id.0 as usize]
    }
}
