//! Transitive invalidation.
//!
//! Two triggers funnel into the same machinery: an explicit request to drop
//! a target set, and a mutated global. Both build a seed map of stale
//! targets per `(step, container)` node, close it forward over the pipes'
//! contracts (pipe order within a step, step order globally), and then
//! remove the stale targets from the live containers and the persisted
//! files.
//!
//! The derivation graph (container nodes, contract edges inside a step,
//! same-name carry edges between consecutive steps) is walked with a DFS
//! first so the ordered sweep only touches nodes that can possibly be
//! affected.

use std::collections::{BTreeMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use tracing::debug;

use crate::context::Context;
use crate::error::PipelineError;
use crate::runner::Runner;
use crate::target::TargetSet;

/// One `(step, container)` whose targets were removed.
#[derive(Debug)]
pub struct InvalidationEntry {
    pub step: String,
    pub container: String,
    pub removed: TargetSet,
}

#[derive(Debug, Default)]
pub struct InvalidationReport {
    pub entries: Vec<InvalidationEntry>,
}

impl InvalidationReport {
    pub fn removed(&self, step: &str, container: &str) -> Option<&TargetSet> {
        self.entries
            .iter()
            .find(|e| e.step == step && e.container == container)
            .map(|e| &e.removed)
    }
}

type NodeKey = (usize, String);

/// Explicit invalidation of a concrete target set.
pub(crate) fn invalidate_targets(
    runner: &mut Runner,
    ctx: &Context,
    step: &str,
    container: &str,
    targets: &TargetSet,
) -> Result<InvalidationReport, PipelineError> {
    let index = runner.step_index(step)?;
    if !runner.steps[index].schema().contains_key(container) {
        return Err(PipelineError::UnknownContainer(container.to_string()));
    }

    let seeds = BTreeMap::from([((index, container.to_string()), targets.clone())]);
    close_and_apply(runner, ctx, seeds)
}

/// Invalidation after a global changed: the seed is every output of every
/// pipe that reads the global, in every step.
pub(crate) fn invalidate_global(
    runner: &mut Runner,
    ctx: &Context,
    global: &str,
) -> Result<InvalidationReport, PipelineError> {
    let mut seeds: BTreeMap<NodeKey, TargetSet> = BTreeMap::new();

    for (index, step) in runner.steps.iter().enumerate() {
        for slot in step.slots() {
            if !slot.is_enabled(ctx.flags()) {
                continue;
            }
            if !slot.pipe().globals_read().iter().any(|g| g == global) {
                continue;
            }

            for (slot_index, pattern) in slot.pipe().contract().output_patterns() {
                let container = slot.bound()[slot_index].clone();
                seeds
                    .entry((index, container))
                    .or_default()
                    .insert(pattern);
            }
        }
    }

    close_and_apply(runner, ctx, seeds)
}

fn close_and_apply(
    runner: &mut Runner,
    ctx: &Context,
    seeds: BTreeMap<NodeKey, TargetSet>,
) -> Result<InvalidationReport, PipelineError> {
    let tax = ctx.registry().taxonomy();

    // Derivation graph over (step, container) nodes.
    let mut graph: DiGraph<NodeKey, ()> = DiGraph::new();
    let mut nodes: BTreeMap<NodeKey, NodeIndex> = BTreeMap::new();

    for (index, step) in runner.steps.iter().enumerate() {
        for container in step.schema().keys() {
            let key = (index, container.clone());
            let node = graph.add_node(key.clone());
            nodes.insert(key, node);
        }
    }

    for (index, step) in runner.steps.iter().enumerate() {
        for slot in step.slots() {
            if !slot.is_enabled(ctx.flags()) {
                continue;
            }
            for (source_slot, output_slot) in slot.pipe().contract().slot_edges() {
                let from = nodes[&(index, slot.bound()[source_slot].clone())];
                let to = nodes[&(index, slot.bound()[output_slot].clone())];
                graph.update_edge(from, to, ());
            }
        }

        if index + 1 < runner.steps.len() {
            for container in step.schema().keys() {
                if let Some(&to) = nodes.get(&(index + 1, container.clone())) {
                    let from = nodes[&(index, container.clone())];
                    graph.update_edge(from, to, ());
                }
            }
        }
    }

    // Restrict the sweep to nodes reachable from the seeds.
    let mut reachable: HashSet<NodeIndex> = HashSet::new();
    let mut dfs = Dfs::empty(&graph);
    for key in seeds.keys() {
        if let Some(&node) = nodes.get(key) {
            dfs.move_to(node);
            while let Some(found) = dfs.next(&graph) {
                reachable.insert(found);
            }
        }
    }

    // Concretize the seeds against what is actually materialized.
    let mut stale: BTreeMap<NodeKey, TargetSet> = BTreeMap::new();
    for (key, patterns) in &seeds {
        let present = present_targets(runner, ctx, key)?;
        let mut concrete = patterns.expand(&present, tax);
        for pattern in patterns.iter().filter(|t| t.is_concrete()) {
            concrete.insert(pattern.clone());
        }
        if !concrete.is_empty() {
            stale.insert(key.clone(), concrete);
        }
    }

    // Ordered forward sweep: pipes in declared order within each step, steps
    // in declared order, carry edges last.
    let first_step = seeds.keys().map(|(index, _)| *index).min().unwrap_or(0);
    for index in first_step..runner.steps.len() {
        let step = &runner.steps[index];

        for slot in step.slots() {
            if !slot.is_enabled(ctx.flags()) {
                continue;
            }

            let reads: Vec<TargetSet> = slot
                .bound()
                .iter()
                .map(|name| {
                    stale
                        .get(&(index, name.clone()))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect();
            if reads.iter().all(TargetSet::is_empty) {
                continue;
            }

            let produced = slot.pipe().contract().stale_outputs(&reads, tax);
            for (name, set) in slot.bound().iter().zip(produced) {
                if set.is_empty() {
                    continue;
                }
                let key = (index, name.clone());
                if nodes.get(&key).is_some_and(|n| reachable.contains(n)) {
                    stale.entry(key).or_default().union_with(&set);
                }
            }
        }

        if index + 1 < runner.steps.len() {
            let carried: Vec<(NodeKey, TargetSet)> = stale
                .iter()
                .filter(|((i, name), _)| {
                    *i == index && runner.steps[index + 1].schema().contains_key(name)
                })
                .map(|((_, name), set)| ((index + 1, name.clone()), set.clone()))
                .collect();

            for (key, set) in carried {
                stale.entry(key).or_default().union_with(&set);
            }
        }
    }

    // Apply: drop from live containers, then rewrite the persisted files.
    let mut report = InvalidationReport::default();
    for ((index, name), set) in stale {
        let step_name = runner.steps[index].name().to_string();

        let removed = if let Some(container) = runner.state[index].get_mut(&name) {
            let removed = set.expand(&container.enumerate(), tax);
            container.remove(&removed);
            removed
        } else {
            set.clone()
        };

        if let Some(storage) = &runner.storage
            && storage.has_container(&step_name, &name)
        {
            let ty = &runner.steps[index].schema()[&name];
            let mut persisted = ctx.registry().make_container(ty)?;
            storage.load_container(&step_name, tax, &name, persisted.as_mut())?;
            persisted.remove(&set.expand(&persisted.enumerate(), tax));
            storage.save_container(&step_name, tax, &name, persisted.as_ref())?;
        }

        if !removed.is_empty() {
            debug!(
                step = step_name.as_str(),
                container = name.as_str(),
                targets = %removed.display(tax),
                "invalidated"
            );
            report.entries.push(InvalidationEntry {
                step: step_name,
                container: name,
                removed,
            });
        }
    }

    Ok(report)
}

/// Everything currently materialized for a node, live state and persisted
/// artifacts combined.
fn present_targets(
    runner: &Runner,
    ctx: &Context,
    key: &NodeKey,
) -> Result<TargetSet, PipelineError> {
    let (index, name) = key;
    let mut present = runner.state[*index]
        .get(name)
        .map(|c| c.enumerate())
        .unwrap_or_default();

    let step_name = runner.steps[*index].name();
    if let Some(storage) = &runner.storage
        && storage.has_container(step_name, name)
    {
        let ty = &runner.steps[*index].schema()[name];
        let mut persisted = ctx.registry().make_container(ty)?;
        storage.load_container(
            step_name,
            ctx.registry().taxonomy(),
            name,
            persisted.as_mut(),
        )?;
        present.union_with(&persisted.enumerate());
    }

    Ok(present)
}
