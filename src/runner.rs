//! Planning and execution.
//!
//! The runner owns the ordered step list and, between runs, the containers
//! each step produced last. A run starts from a *goal* (the targets the
//! caller wants materialized), walks the steps backward applying each pipe's
//! contract in reverse to find out what every step must be handed, then
//! walks forward executing pipes against copies of the previous step's
//! containers.
//!
//! Execution is single-threaded and cooperative: pipes run strictly in
//! declared order, and a [`CancelToken`] is checked between pipes, never
//! inside one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use tracing::{Level, debug, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::container::{Container, ContainerSet};
use crate::context::Context;
use crate::error::{PipelineError, StorageError};
use crate::invalidate::{self, InvalidationReport};
use crate::kind::Taxonomy;
use crate::step::{PipeSlot, Step};
use crate::storage::Storage;
use crate::target::TargetSet;

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

/// Cooperative cancellation, checked between pipes.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }
}

/// One requested `(step, container, targets)` triple. Targets may be
/// wildcarded.
#[derive(Debug, Clone)]
pub struct GoalEntry {
    pub step: String,
    pub container: String,
    pub targets: TargetSet,
}

impl GoalEntry {
    pub fn new(step: impl Into<String>, container: impl Into<String>, targets: TargetSet) -> Self {
        Self {
            step: step.into(),
            container: container.into(),
            targets,
        }
    }
}

pub type Goal = Vec<GoalEntry>;

#[derive(Debug, Clone)]
pub struct PipeExecution {
    pub step: String,
    pub pipe: String,
    pub duration: Duration,
}

/// Per-run timing, pipe by pipe, in execution order.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub pipes: Vec<PipeExecution>,
}

/// The outcome of a successful run: for every goal entry, the concrete
/// targets that satisfy it. Container contents stay inspectable through
/// [`Runner::container`].
#[derive(Debug)]
pub struct RunReport {
    pub satisfied: Vec<(GoalEntry, TargetSet)>,
    pub diagnostics: Diagnostics,
}

/// The result of the backward pass: what each step must be handed at entry.
#[derive(Debug)]
pub struct Plan {
    entry: Vec<BTreeMap<String, TargetSet>>,
    last_step: usize,
}

impl Plan {
    /// The per-container requirement at the given step's entry.
    pub fn entry_need(&self, step: usize) -> Option<&BTreeMap<String, TargetSet>> {
        self.entry.get(step)
    }

    /// Index of the furthest step the goal touches; execution stops there.
    pub fn last_step(&self) -> usize {
        self.last_step
    }
}

pub struct Runner {
    pub(crate) steps: Vec<Step>,
    /// Outputs of the last run, step by step. Empty sets before any run.
    pub(crate) state: Vec<ContainerSet>,
    /// Caller-provided bytes fed into a container at step entry.
    inputs: BTreeMap<(String, String), Vec<u8>>,
    pub(crate) storage: Option<Storage>,
    cancel: CancelToken,
}

impl Runner {
    pub fn new(steps: Vec<Step>) -> Result<Self, PipelineError> {
        for (i, step) in steps.iter().enumerate() {
            if steps[..i].iter().any(|s| s.name() == step.name()) {
                return Err(PipelineError::Description(format!(
                    "step `{}` is declared twice",
                    step.name()
                )));
            }
        }

        let state = steps.iter().map(|_| ContainerSet::new()).collect();
        Ok(Self {
            steps,
            state,
            inputs: BTreeMap::new(),
            storage: None,
            cancel: CancelToken::new(),
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_index(&self, name: &str) -> Result<usize, PipelineError> {
        self.steps
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| PipelineError::UnknownStep(name.to_string()))
    }

    /// Attaches a persistent working directory. Step outputs are saved after
    /// each step and reused as seeds on later runs.
    pub fn set_storage(&mut self, storage: Storage) {
        self.storage = Some(storage);
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Binds caller-provided bytes to a container: they are imported into it
    /// when the step starts, overriding anything carried or persisted.
    pub fn bind_input(
        &mut self,
        step: &str,
        container: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PipelineError> {
        let index = self.step_index(step)?;
        if !self.steps[index].schema().contains_key(container) {
            return Err(PipelineError::UnknownContainer(container.to_string()));
        }

        self.inputs
            .insert((step.to_string(), container.to_string()), bytes);
        Ok(())
    }

    /// A container as left by the last run, for inspection.
    pub fn container(&self, step: &str, container: &str) -> Option<&dyn Container> {
        let index = self.steps.iter().position(|s| s.name() == step)?;
        self.state[index].get(container)
    }

    /// Writes a container's external representation, for `-o` bindings.
    pub fn export(
        &self,
        ctx: &Context,
        step: &str,
        container: &str,
        sink: &mut dyn std::io::Write,
    ) -> Result<(), PipelineError> {
        let found = self
            .container(step, container)
            .ok_or_else(|| PipelineError::UnknownContainer(container.to_string()))?;

        found
            .export(ctx.registry().taxonomy(), sink)
            .map_err(|e| {
                StorageError::Serialize(
                    format!("{step}:{container}").into(),
                    e.to_string(),
                )
                .into()
            })
    }

    /// Explicitly invalidates a concrete target set and everything
    /// transitively derived from it.
    pub fn invalidate(
        &mut self,
        ctx: &Context,
        step: &str,
        container: &str,
        targets: &TargetSet,
    ) -> Result<InvalidationReport, PipelineError> {
        invalidate::invalidate_targets(self, ctx, step, container, targets)
    }

    /// Drains the context's dirty globals through the invalidator. Called at
    /// the start of every run; also available for callers that want a clean
    /// state without running.
    pub fn flush_invalidations(
        &mut self,
        ctx: &mut Context,
    ) -> Result<Vec<InvalidationReport>, PipelineError> {
        let mut reports = Vec::new();
        for name in ctx.take_dirty() {
            info!(global = name.as_str(), "invalidating after global mutation");
            reports.push(invalidate::invalidate_global(self, ctx, &name)?);
        }
        Ok(reports)
    }

    /// The backward pass: derives, per step, what must be present at entry
    /// for the goal to be satisfiable, and verifies that every residual need
    /// is covered by an input binding, persisted state or a previous run.
    pub fn plan(&self, ctx: &Context, goal: &Goal) -> Result<Plan, PipelineError> {
        let tax = ctx.registry().taxonomy();

        let mut last_step = 0;
        for entry in goal {
            let index = self.step_index(&entry.step)?;
            if !self.steps[index].schema().contains_key(&entry.container) {
                return Err(PipelineError::UnknownContainer(entry.container.clone()));
            }
            last_step = last_step.max(index);
        }

        let mut entry_needs = vec![BTreeMap::<String, TargetSet>::new(); self.steps.len()];

        // Requirement on the *outputs* of the step being visited.
        let mut demand: BTreeMap<String, TargetSet> = BTreeMap::new();

        for index in (0..=last_step).rev() {
            let step = &self.steps[index];

            for entry in goal.iter().filter(|g| g.step == step.name()) {
                demand
                    .entry(entry.container.clone())
                    .or_default()
                    .union_with(&entry.targets);
            }

            // Rewrite the demand backward through the step's pipes. A gated
            // pipe has an empty contract: the demand passes through it.
            for slot in step.slots().iter().rev() {
                if !slot.is_enabled(ctx.flags()) {
                    continue;
                }

                let requested: Vec<TargetSet> = slot
                    .bound()
                    .iter()
                    .map(|name| demand.get(name).cloned().unwrap_or_default())
                    .collect();
                let precondition = slot
                    .pipe()
                    .contract()
                    .deduce_precondition(&requested, tax);

                for (name, set) in slot.bound().iter().zip(precondition) {
                    demand.insert(name.clone(), set);
                }
            }

            entry_needs[index] = demand.clone();

            // Residual needs either flow to the previous step (same-name
            // container), are covered by a seed at this step, or the goal is
            // unsatisfiable.
            demand = BTreeMap::new();
            for (name, set) in &entry_needs[index] {
                if set.is_empty() || self.is_seeded(index, name) {
                    continue;
                }

                let carried = index > 0 && self.steps[index - 1].schema().contains_key(name);
                if carried {
                    demand.insert(name.clone(), set.clone());
                } else {
                    return Err(PipelineError::UnsatisfiableGoal {
                        step: step.name().to_string(),
                        container: name.clone(),
                        targets: set.display(tax),
                    });
                }
            }
        }

        Ok(Plan {
            entry: entry_needs,
            last_step,
        })
    }

    /// Whether this step's container gets content from outside the pipeline:
    /// an input binding, a persisted file, or a previous run's output.
    fn is_seeded(&self, step: usize, container: &str) -> bool {
        let step_name = self.steps[step].name();

        if self
            .inputs
            .contains_key(&(step_name.to_string(), container.to_string()))
        {
            return true;
        }

        if let Some(storage) = &self.storage
            && storage.has_container(step_name, container)
        {
            return true;
        }

        self.state[step]
            .get(container)
            .is_some_and(|c| !c.enumerate().is_empty())
    }

    /// The forward pass. Plans first (after draining pending global
    /// invalidations), then executes every step up to the goal step.
    pub fn run(&mut self, ctx: &mut Context, goal: &Goal) -> Result<RunReport, PipelineError> {
        self.flush_invalidations(ctx)?;
        let plan = self.plan(ctx, goal)?;

        let total_pipes: u64 = self.steps[..=plan.last_step]
            .iter()
            .map(|s| s.slots().len() as u64)
            .sum();

        let root_span = tracing::span!(Level::INFO, "pipeline_run");
        root_span.pb_set_length(total_pipes);
        root_span.pb_set_style(&PROGRESS_STYLE);
        root_span.pb_set_message("Running pipes...");
        let _enter = root_span.enter();

        let mut diagnostics = Diagnostics::default();

        for index in 0..=plan.last_step {
            let mut containers = self.assemble_entry(ctx, index)?;
            let outcome =
                self.execute_step(ctx, index, &mut containers, &mut diagnostics, &root_span);

            if outcome.is_ok()
                && let Some(storage) = &self.storage
            {
                storage.save_step(
                    self.steps[index].name(),
                    ctx.registry().taxonomy(),
                    &containers,
                )?;
            }

            // On failure or cancellation the step is aborted, but whatever
            // the finished pipes produced stays inspectable.
            self.state[index] = containers;
            outcome?;
        }

        if let Some(storage) = &self.storage {
            storage.save_globals(ctx)?;
        }

        let tax = ctx.registry().taxonomy();
        let mut satisfied = Vec::with_capacity(goal.len());
        for entry in goal {
            let index = self.step_index(&entry.step)?;
            let present = self.state[index]
                .get(&entry.container)
                .map(|c| c.enumerate())
                .unwrap_or_default();
            satisfied.push((entry.clone(), entry.targets.expand(&present, tax)));
        }

        Ok(RunReport {
            satisfied,
            diagnostics,
        })
    }

    /// Builds a step's entry containers: fresh instances, seeded from
    /// storage, then the previous step's outputs, then input bindings.
    /// Later sources win.
    fn assemble_entry(
        &self,
        ctx: &Context,
        index: usize,
    ) -> Result<ContainerSet, PipelineError> {
        let tax = ctx.registry().taxonomy();
        let step = &self.steps[index];
        let mut containers = step.materialize(ctx.registry())?;

        if let Some(storage) = &self.storage {
            storage.load_step(step.name(), tax, &mut containers)?;
        }

        if index > 0 {
            for (name, previous) in self.state[index - 1].iter() {
                if let Some(mine) = containers.get_mut(name) {
                    mine.merge(previous.clone_box())?;
                }
            }
        }

        for ((step_name, container), bytes) in &self.inputs {
            if step_name == step.name()
                && let Some(mine) = containers.get_mut(container)
            {
                mine.import(tax, bytes).map_err(|e| {
                    StorageError::Deserialize(
                        format!("{step_name}:{container}").into(),
                        e.to_string(),
                    )
                })?;
            }
        }

        Ok(containers)
    }

    fn execute_step(
        &self,
        ctx: &Context,
        index: usize,
        containers: &mut ContainerSet,
        diagnostics: &mut Diagnostics,
        progress: &tracing::Span,
    ) -> Result<(), PipelineError> {
        let tax = ctx.registry().taxonomy();
        let step = &self.steps[index];

        let span = tracing::span!(Level::INFO, "step", name = step.name());
        let _enter = span.enter();

        // What earlier pipes of this step produced outside their own slot,
        // to diagnose overlapping producers.
        let mut step_derived: BTreeMap<String, TargetSet> = BTreeMap::new();

        for slot in step.slots() {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            if !slot.is_enabled(ctx.flags()) {
                debug!(pipe = slot.pipe().name(), "gated out, skipping");
                progress.pb_inc(1);
                continue;
            }

            let before: Vec<TargetSet> = slot
                .bound()
                .iter()
                .map(|name| {
                    containers
                        .get(name)
                        .map(|c| c.enumerate())
                        .unwrap_or_default()
                })
                .collect();
            let contract = slot.pipe().contract();
            let predicted = contract.deduce_postcondition(&before, tax);
            let crossing = contract.derived_cross_slot(&before, tax);

            for (name, produced) in slot.bound().iter().zip(&crossing) {
                let collisions = produced
                    .intersection(step_derived.get(name).unwrap_or(&TargetSet::new()));
                if !collisions.is_empty() {
                    warn!(
                        pipe = slot.pipe().name(),
                        container = name.as_str(),
                        targets = %collisions.display(tax),
                        "overwriting targets produced earlier in this step"
                    );
                }
            }

            let started = Instant::now();
            {
                let pipe_span =
                    tracing::span!(Level::INFO, "pipe", name = slot.pipe().name());
                let _enter = pipe_span.enter();

                let mut slice = containers.slice_mut(slot.bound())?;
                slot.pipe()
                    .run(ctx, &mut slice)
                    .map_err(|source| PipelineError::PipeFailed {
                        pipe: slot.pipe().name().to_string(),
                        source,
                    })?;
            }

            diagnostics.pipes.push(PipeExecution {
                step: step.name().to_string(),
                pipe: slot.pipe().name().to_string(),
                duration: started.elapsed(),
            });
            progress.pb_inc(1);

            audit_contract(slot, &predicted, containers, tax)?;

            for (name, produced) in slot.bound().iter().zip(contract.derived(&before, tax)) {
                step_derived.entry(name.clone()).or_default().union_with(&produced);
            }
        }

        Ok(())
    }
}

/// Verifies that a pipe left its containers exactly as its contract
/// predicted. Fatal in debug builds, a warning in release.
fn audit_contract(
    slot: &PipeSlot,
    predicted: &[TargetSet],
    containers: &ContainerSet,
    tax: &Taxonomy,
) -> Result<(), PipelineError> {
    for (name, predicted) in slot.bound().iter().zip(predicted) {
        let after = containers
            .get(name)
            .map(|c| c.enumerate())
            .unwrap_or_default();

        let missing = predicted.difference(&after);
        let unexpected = after.difference(predicted);
        if missing.is_empty() && unexpected.is_empty() {
            continue;
        }

        let detail = format!(
            "container `{name}`: missing {}, unexpected {}",
            missing.display(tax),
            unexpected.display(tax),
        );

        if cfg!(debug_assertions) {
            return Err(PipelineError::PipeContractViolation {
                pipe: slot.pipe().name().to_string(),
                detail,
            });
        }
        warn!(pipe = slot.pipe().name(), detail = detail.as_str(), "contract violation");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Blueprint;
    use crate::container::strings::StringContainer;
    use crate::target::Target;

    const GATED_COPY: &str = "
Containers:
  - { Name: strings-1, Type: StringContainer }
  - { Name: strings-2, Type: StringContainer }
Steps:
  - Name: first
    Pipes:
      - Type: Copy
        UsedContainers: [strings-1, strings-2]
        EnabledWhen: [DoCopy]
";

    fn runner_and_ctx(description: &str) -> (Runner, Context) {
        let ctx = Context::new(crate::registry::Registry::with_defaults().unwrap());
        let steps = Blueprint::from_yaml(description)
            .unwrap()
            .resolve(ctx.registry())
            .unwrap();
        (Runner::new(steps).unwrap(), ctx)
    }

    fn string_goal(ctx: &Context, step: &str, container: &str, path: &str) -> Goal {
        let tax = ctx.registry().taxonomy();
        let kind = tax.kind_named("StringKind").unwrap();
        let targets = [Target::parse(kind, path, tax).unwrap()]
            .into_iter()
            .collect();
        vec![GoalEntry::new(step, container, targets)]
    }

    #[test]
    fn gated_pipe_plans_as_empty_contract() {
        let (mut runner, mut ctx) = runner_and_ctx(GATED_COPY);
        runner
            .bind_input("first", "strings-1", b"a\nb\n".to_vec())
            .unwrap();

        let goal = string_goal(&ctx, "first", "strings-2", "*");

        // Flag absent: nothing produces strings-2.
        match runner.plan(&ctx, &goal) {
            Err(PipelineError::UnsatisfiableGoal { container, .. }) => {
                assert_eq!(container, "strings-2");
            }
            other => panic!("expected UnsatisfiableGoal, got {other:?}"),
        }

        // Flag present: the demand flows back to strings-1, which is bound.
        ctx.set_flag("DoCopy");
        let plan = runner.plan(&ctx, &goal).unwrap();
        let need = &plan.entry_need(0).unwrap()["strings-1"];
        assert!(!need.is_empty());
    }

    #[test]
    fn providing_the_planned_need_makes_the_run_succeed() {
        let (mut runner, mut ctx) = runner_and_ctx(GATED_COPY);
        ctx.set_flag("DoCopy");
        runner
            .bind_input("first", "strings-1", b"a\nb\nc\n".to_vec())
            .unwrap();

        let goal = string_goal(&ctx, "first", "strings-2", "*");
        let report = runner.run(&mut ctx, &goal).unwrap();

        let (_, satisfied) = &report.satisfied[0];
        assert_eq!(satisfied.len(), 3);

        let tax = ctx.registry().taxonomy();
        let kind = tax.kind_named("StringKind").unwrap();
        let strings = runner
            .container("first", "strings-2")
            .unwrap()
            .as_any()
            .downcast_ref::<StringContainer>()
            .unwrap();
        assert_eq!(
            strings.get(&Target::parse(kind, "b", tax).unwrap()),
            Some("b")
        );
    }

    #[test]
    fn unknown_goal_step_is_reported() {
        let (runner, ctx) = runner_and_ctx(GATED_COPY);
        let goal = string_goal(&ctx, "elsewhere", "strings-2", "*");

        assert!(matches!(
            runner.plan(&ctx, &goal),
            Err(PipelineError::UnknownStep(_))
        ));
    }

    #[test]
    fn cancellation_is_checked_between_pipes() {
        let (mut runner, mut ctx) = runner_and_ctx(GATED_COPY);
        ctx.set_flag("DoCopy");
        runner
            .bind_input("first", "strings-1", b"a\n".to_vec())
            .unwrap();

        runner.cancel_token().cancel();

        let goal = string_goal(&ctx, "first", "strings-2", "*");
        assert!(matches!(
            runner.run(&mut ctx, &goal),
            Err(PipelineError::Cancelled)
        ));
    }
}
