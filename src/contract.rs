//! Declarative rewrite rules between target sets.
//!
//! A [`Contract`] describes, without running anything, how a pipe rewrites
//! the targets of the containers it is mounted on. Rules refer to containers
//! by *slot*: an index into the pipe's ordered container binding, resolved to
//! a concrete container name only when the pipe is mounted in a step.
//!
//! Contracts are applied in two directions:
//!
//! * backward ([`Contract::deduce_precondition`]): given the targets a caller
//!   wants *after* the pipe runs, compute what must be present *before*;
//! * forward ([`Contract::deduce_postcondition`]): given the targets present
//!   before the pipe runs, predict what is present after.
//!
//! Targets no rule touches pass through both directions unchanged: the pipe
//! neither provides nor consumes them.

use crate::error::PipelineError;
use crate::kind::{KindId, Taxonomy};
use crate::target::{Component, Target, TargetSet};

/// How a rule maps an input path to an output path.
#[derive(Debug, Clone)]
pub enum PathOp {
    /// Output path equals the input path.
    Identity,
    /// Output path is built from the input components at these indices, in
    /// this order. Dropping components shifts the artifact to a higher rank.
    Project(Vec<usize>),
    /// Output path is fixed, regardless of the input.
    Constant(Vec<Component>),
}

/// The input half of a rule: which targets of which slot it consumes.
#[derive(Debug, Clone)]
pub struct InputPattern {
    pub slot: usize,
    pub kind: KindId,
    pub path: Vec<Component>,
}

impl InputPattern {
    pub fn new(slot: usize, kind: KindId, path: Vec<Component>) -> Self {
        Self { slot, kind, path }
    }

    fn as_target(&self) -> Target {
        Target::raw(self.kind, self.path.clone())
    }
}

/// A single rewrite rule.
///
/// A rule without a source is a *generator*: it produces its constant output
/// unconditionally, requiring nothing upstream. Generators model pipes that
/// synthesize root artifacts from state outside the container set, such as a
/// global.
#[derive(Debug, Clone)]
pub struct ContractRule {
    source: Option<InputPattern>,
    output_slot: usize,
    output_kind: KindId,
    op: PathOp,
    preserved: bool,
}

impl ContractRule {
    pub fn new(
        source: Option<InputPattern>,
        output_slot: usize,
        output_kind: KindId,
        op: PathOp,
    ) -> Self {
        Self {
            source,
            output_slot,
            output_kind,
            op,
            preserved: false,
        }
    }

    /// Marks the rule as copying: matched inputs stay in their container
    /// after the outputs are produced.
    pub fn preserving(mut self) -> Self {
        self.preserved = true;
        self
    }

    fn validate(&self, arity: usize, tax: &Taxonomy) -> Result<(), PipelineError> {
        let fail = |detail: String| Err(PipelineError::InvalidContract(detail));

        if self.output_slot >= arity {
            return fail(format!(
                "output slot {} out of bounds for a {arity}-container pipe",
                self.output_slot
            ));
        }

        let out_depth = tax.depth_of(self.output_kind);

        let source = match &self.source {
            Some(source) => source,
            None => {
                // Generators can only emit a fixed path.
                return match &self.op {
                    PathOp::Constant(path) if path.len() == out_depth => Ok(()),
                    PathOp::Constant(path) => fail(format!(
                        "constant path has {} components, kind `{}` expects {out_depth}",
                        path.len(),
                        tax.kind_name(self.output_kind)
                    )),
                    _ => fail("a rule without an input must produce a constant".to_string()),
                };
            }
        };

        if source.slot >= arity {
            return fail(format!(
                "input slot {} out of bounds for a {arity}-container pipe",
                source.slot
            ));
        }

        let in_depth = tax.depth_of(source.kind);
        if source.path.len() != in_depth {
            return fail(format!(
                "input pattern has {} components, kind `{}` expects {in_depth}",
                source.path.len(),
                tax.kind_name(source.kind)
            ));
        }

        match &self.op {
            PathOp::Identity if out_depth == in_depth => Ok(()),
            PathOp::Identity => fail(format!(
                "identity between kinds of different depth ({in_depth} vs {out_depth})"
            )),
            PathOp::Project(indices) => {
                if indices.len() != out_depth {
                    return fail(format!(
                        "projection keeps {} components, kind `{}` expects {out_depth}",
                        indices.len(),
                        tax.kind_name(self.output_kind)
                    ));
                }
                match indices.iter().find(|&&i| i >= in_depth) {
                    Some(i) => fail(format!("projection index {i} out of bounds")),
                    None => Ok(()),
                }
            }
            PathOp::Constant(path) => {
                if path.len() != out_depth {
                    return fail(format!(
                        "constant path has {} components, kind `{}` expects {out_depth}",
                        path.len(),
                        tax.kind_name(self.output_kind)
                    ));
                }
                Ok(())
            }
        }
    }

    /// The pattern of paths this rule can produce.
    fn image(&self) -> Vec<Component> {
        match (&self.op, &self.source) {
            (PathOp::Identity, Some(src)) => src.path.clone(),
            (PathOp::Project(indices), Some(src)) => {
                indices.iter().map(|&i| src.path[i].clone()).collect()
            }
            (PathOp::Constant(path), _) => path.clone(),
            // Ruled out by validation.
            (_, None) => Vec::new(),
        }
    }

    /// Applies the path operation to a matched input path.
    fn apply(&self, input: &[Component]) -> Vec<Component> {
        match &self.op {
            PathOp::Identity => input.to_vec(),
            PathOp::Project(indices) => indices.iter().map(|&i| input[i].clone()).collect(),
            PathOp::Constant(path) => path.clone(),
        }
    }

    /// Computes the input path needed to produce `output`, refining the
    /// rule's own pattern with whatever the requested path pins down.
    fn invert(&self, output: &[Component]) -> Option<Vec<Component>> {
        let source = self.source.as_ref()?;
        let mut input = source.path.clone();

        match &self.op {
            PathOp::Identity => {
                for (slot, out) in input.iter_mut().zip(output) {
                    *slot = slot.unify(out)?;
                }
            }
            PathOp::Project(indices) => {
                for (&i, out) in indices.iter().zip(output) {
                    input[i] = input[i].unify(out)?;
                }
            }
            // A constant output says nothing about the input path.
            PathOp::Constant(_) => {}
        }

        Some(input)
    }
}

/// An ordered set of rewrite rules, validated against a fixed slot arity.
#[derive(Debug, Clone)]
pub struct Contract {
    arity: usize,
    rules: Vec<ContractRule>,
}

impl Contract {
    /// Validates every rule against the slot arity and the taxonomy.
    pub fn build(
        arity: usize,
        rules: Vec<ContractRule>,
        tax: &Taxonomy,
    ) -> Result<Self, PipelineError> {
        for rule in &rules {
            rule.validate(arity, tax)?;
        }
        Ok(Self { arity, rules })
    }

    /// A contract with no rules: nothing produced, everything passes through.
    pub fn empty(arity: usize) -> Self {
        Self {
            arity,
            rules: Vec::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Backward application: the targets that must be present per slot before
    /// the pipe runs for `requested` to be present afterwards.
    ///
    /// Requested targets no rule produces are needed as-is (the pipe will not
    /// supply them, so they must already be there). Wildcards propagate:
    /// inverting a projection fills the dropped components back in with `*`.
    pub fn deduce_precondition(&self, requested: &[TargetSet], tax: &Taxonomy) -> Vec<TargetSet> {
        let mut need = vec![TargetSet::new(); self.arity];

        for (slot, set) in requested.iter().enumerate() {
            for target in set.iter() {
                let mut supplied = false;

                for rule in self.rules.iter().filter(|r| r.output_slot == slot) {
                    if !tax.matches(rule.output_kind, target.kind()) {
                        continue;
                    }
                    let image = rule.image();
                    if unify_paths(&image, target.path()).is_none() {
                        continue;
                    }

                    supplied = true;
                    if let Some(source) = &rule.source
                        && let Some(path) = rule.invert(target.path())
                    {
                        need[source.slot].insert(Target::raw(source.kind, path));
                    }
                }

                if !supplied {
                    need[slot].insert(target.clone());
                }
            }
        }

        need
    }

    /// Forward application: the targets present per slot after the pipe runs
    /// against `inputs`. Non-preserving rules consume what they match;
    /// everything else survives alongside the produced targets.
    pub fn deduce_postcondition(&self, inputs: &[TargetSet], tax: &Taxonomy) -> Vec<TargetSet> {
        let mut out: Vec<TargetSet> = inputs.to_vec();

        for rule in &self.rules {
            if let Some(source) = &rule.source
                && !rule.preserved
            {
                let pattern = source.as_target();
                out[source.slot] = out[source.slot]
                    .iter()
                    .filter(|t| !t.satisfies(&pattern, tax))
                    .cloned()
                    .collect();
            }
        }

        for (slot, set) in self.derived(inputs, tax).into_iter().enumerate() {
            out[slot].union_with(&set);
        }

        out
    }

    /// Only the targets the rules *produce* from `inputs`, without the
    /// surviving pass-through targets. This is what invalidation propagates.
    pub fn derived(&self, inputs: &[TargetSet], tax: &Taxonomy) -> Vec<TargetSet> {
        let mut out = vec![TargetSet::new(); self.arity];

        for rule in &self.rules {
            match &rule.source {
                Some(source) => {
                    let pattern = source.as_target();
                    for target in inputs[source.slot].iter() {
                        if target.satisfies(&pattern, tax) {
                            out[rule.output_slot]
                                .insert(Target::raw(rule.output_kind, rule.apply(target.path())));
                        }
                    }
                }
                None => {
                    if let PathOp::Constant(path) = &rule.op {
                        out[rule.output_slot]
                            .insert(Target::raw(rule.output_kind, path.clone()));
                    }
                }
            }
        }

        out
    }

    /// Like [`Contract::derived`], but skipping rules without an input.
    /// A generator's output is not derived from anything in its containers,
    /// so staleness of its neighbors must not spread to it; what a generator
    /// owes to a global is handled by seeding, not by propagation.
    pub(crate) fn stale_outputs(&self, inputs: &[TargetSet], tax: &Taxonomy) -> Vec<TargetSet> {
        let sourced: Vec<ContractRule> = self
            .rules
            .iter()
            .filter(|rule| rule.source.is_some())
            .cloned()
            .collect();

        Contract {
            arity: self.arity,
            rules: sourced,
        }
        .derived(inputs, tax)
    }

    /// Like [`Contract::derived`], restricted to rules whose output lands in
    /// a different slot than their input (or that have no input at all).
    /// These are the productions that can collide with another pipe's work,
    /// as opposed to in-place rewrites of a pipe's own slot.
    pub(crate) fn derived_cross_slot(
        &self,
        inputs: &[TargetSet],
        tax: &Taxonomy,
    ) -> Vec<TargetSet> {
        let crossing: Vec<ContractRule> = self
            .rules
            .iter()
            .filter(|rule| match &rule.source {
                Some(source) => source.slot != rule.output_slot,
                None => true,
            })
            .cloned()
            .collect();

        Contract {
            arity: self.arity,
            rules: crossing,
        }
        .derived(inputs, tax)
    }

    /// The (input slot, output slot) pair of every rule that has an input:
    /// the intra-pipe edges of the derivation graph.
    pub(crate) fn slot_edges(&self) -> Vec<(usize, usize)> {
        self.rules
            .iter()
            .filter_map(|rule| {
                rule.source
                    .as_ref()
                    .map(|source| (source.slot, rule.output_slot))
            })
            .collect()
    }

    /// Every (slot, kind) pair the rules mention, inputs and outputs alike.
    /// Containers bound to a slot must accept the kinds named here.
    pub fn slot_kinds(&self) -> Vec<(usize, KindId)> {
        let mut out = Vec::new();
        for rule in &self.rules {
            if let Some(source) = &rule.source {
                out.push((source.slot, source.kind));
            }
            out.push((rule.output_slot, rule.output_kind));
        }
        out
    }

    /// The (possibly wildcarded) output targets per slot that the rules can
    /// produce at all, independent of any input. Used to seed invalidation
    /// when a global changes.
    pub fn output_patterns(&self) -> Vec<(usize, Target)> {
        self.rules
            .iter()
            .map(|rule| (rule.output_slot, Target::raw(rule.output_kind, rule.image())))
            .collect()
    }
}

fn unify_paths(a: &[Component], b: &[Component]) -> Option<Vec<Component>> {
    if a.len() != b.len() {
        return None;
    }
    a.iter().zip(b).map(|(x, y)| x.unify(y)).collect()
}
