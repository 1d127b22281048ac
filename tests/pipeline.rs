//! End-to-end pipeline scenarios driven through the public API.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use pipewright::container::strings::StringContainer;
use pipewright::{
    Blueprint, Component, Context, Contract, ContractRule, FnPipe, Global, GoalEntry,
    InputPattern, KindId, PathOp, PipeSlot, PipelineError, Registry, Runner, Step, Storage,
    Target, TargetSet,
};

fn string_targets(ctx: &Context, kind: &str, paths: &[&str]) -> TargetSet {
    let tax = ctx.registry().taxonomy();
    let kind = tax.kind_named(kind).unwrap();
    paths
        .iter()
        .map(|p| Target::parse(kind, p, tax).unwrap())
        .collect()
}

fn present(runner: &Runner, step: &str, container: &str) -> TargetSet {
    runner
        .container(step, container)
        .map(|c| c.enumerate())
        .unwrap_or_default()
}

const COPY_PIPELINE: &str = "
Containers:
  - { Name: strings-1, Type: StringContainer }
  - { Name: strings-2, Type: StringContainer }
Steps:
  - Name: first
    Pipes:
      - { Type: Copy, UsedContainers: [strings-1, strings-2] }
";

/// A copy pipe with an identity contract materializes every input line in
/// the output container.
#[test]
fn copy_pipe_identity_contract() {
    let mut ctx = Context::new(Registry::with_defaults().unwrap());
    let steps = Blueprint::from_yaml(COPY_PIPELINE)
        .unwrap()
        .resolve(ctx.registry())
        .unwrap();
    let mut runner = Runner::new(steps).unwrap();

    runner
        .bind_input("first", "strings-1", b"a\nb\nc\n".to_vec())
        .unwrap();

    let goal = vec![GoalEntry::new(
        "first",
        "strings-2",
        string_targets(&ctx, "StringKind", &["*"]),
    )];
    let report = runner.run(&mut ctx, &goal).unwrap();

    let (_, satisfied) = &report.satisfied[0];
    assert_eq!(*satisfied, string_targets(&ctx, "StringKind", &["a", "b", "c"]));
    assert_eq!(
        present(&runner, "first", "strings-2"),
        string_targets(&ctx, "StringKind", &["a", "b", "c"]),
    );
}

/// A pipe gated by a flag plans as an empty contract when the flag is
/// absent, and behaves normally when it is set.
#[test]
fn flag_gating_controls_planning_and_execution() {
    let gated = COPY_PIPELINE.replace(
        "{ Type: Copy, UsedContainers: [strings-1, strings-2] }",
        "{ Type: Copy, UsedContainers: [strings-1, strings-2], EnabledWhen: [DoCopy] }",
    );

    let mut ctx = Context::new(Registry::with_defaults().unwrap());
    let steps = Blueprint::from_yaml(&gated)
        .unwrap()
        .resolve(ctx.registry())
        .unwrap();
    let mut runner = Runner::new(steps).unwrap();
    runner
        .bind_input("first", "strings-1", b"a\nb\nc\n".to_vec())
        .unwrap();

    let goal = vec![GoalEntry::new(
        "first",
        "strings-2",
        string_targets(&ctx, "StringKind", &["*"]),
    )];

    match runner.run(&mut ctx, &goal) {
        Err(PipelineError::UnsatisfiableGoal { container, .. }) => {
            assert_eq!(container, "strings-2");
        }
        other => panic!("expected UnsatisfiableGoal, got {other:?}"),
    }

    ctx.set_flag("DoCopy");
    let report = runner.run(&mut ctx, &goal).unwrap();
    assert_eq!(report.satisfied[0].1.len(), 3);
}

/// Two steps wired programmatically: step A generates a root artifact out of
/// nothing, step B transforms it. Used by the cross-step propagation and
/// invalidation scenarios.
struct CrossStep {
    runner: Runner,
    ctx: Context,
    k1: KindId,
    k2: KindId,
}

fn cross_step() -> CrossStep {
    let mut registry = Registry::with_defaults().unwrap();
    let root = registry.taxonomy().rank_named("root").unwrap();
    let k1 = registry.taxonomy_mut().register_kind("k1", root, None).unwrap();
    let k2 = registry.taxonomy_mut().register_kind("k2", root, None).unwrap();

    registry.register_container("C1", move |_| Ok(Box::new(StringContainer::new(k1))));
    registry.register_container("C2", move |_| Ok(Box::new(StringContainer::new(k2))));

    let tax = registry.taxonomy();

    let generate = Contract::build(
        1,
        vec![ContractRule::new(
            None,
            0,
            k1,
            PathOp::Constant(vec![Component::name("seed")]),
        )],
        tax,
    )
    .unwrap();
    let generate = Arc::new(FnPipe::new("generate", generate, move |ctx, containers| {
        let tax = ctx.registry().taxonomy();
        let sink = containers[0]
            .as_any_mut()
            .downcast_mut::<StringContainer>()
            .unwrap();
        sink.insert(Target::parse(k1, "seed", tax)?, "seed");
        Ok(())
    }));

    let promote = Contract::build(
        2,
        vec![
            ContractRule::new(
                Some(InputPattern::new(0, k1, vec![Component::All])),
                1,
                k2,
                PathOp::Identity,
            )
            .preserving(),
        ],
        tax,
    )
    .unwrap();
    let promote = Arc::new(FnPipe::new("promote", promote, move |ctx, containers| {
        let tax = ctx.registry().taxonomy();
        let (source, rest) = containers.split_first_mut().unwrap();
        let pairs: Vec<(Vec<Component>, String)> = source
            .as_any()
            .downcast_ref::<StringContainer>()
            .unwrap()
            .entries()
            .map(|(t, v)| (t.path().to_vec(), v.to_string()))
            .collect();

        let sink = rest[0]
            .as_any_mut()
            .downcast_mut::<StringContainer>()
            .unwrap();
        for (path, value) in pairs {
            sink.insert(Target::new(k2, path, tax)?, value);
        }
        Ok(())
    }));

    let schema = BTreeMap::from([
        ("c1".to_string(), "C1".to_string()),
        ("c2".to_string(), "C2".to_string()),
    ]);

    let step_a = Step::new(
        "A",
        schema.clone(),
        vec![PipeSlot::new(generate, vec!["c1".to_string()])],
        &registry,
    )
    .unwrap();
    let step_b = Step::new(
        "B",
        schema,
        vec![PipeSlot::new(
            promote,
            vec!["c1".to_string(), "c2".to_string()],
        )],
        &registry,
    )
    .unwrap();

    CrossStep {
        runner: Runner::new(vec![step_a, step_b]).unwrap(),
        ctx: Context::new(registry),
        k1,
        k2,
    }
}

/// The planner derives B's need from A without any external input: A is
/// self-sufficient.
#[test]
fn cross_step_propagation_needs_no_external_input() {
    let mut fixture = cross_step();
    let tax = fixture.ctx.registry().taxonomy();
    let wanted: TargetSet = [Target::parse(fixture.k2, "seed", tax).unwrap()]
        .into_iter()
        .collect();

    let goal = vec![GoalEntry::new("B", "c2", wanted.clone())];

    let plan = fixture.runner.plan(&fixture.ctx, &goal).unwrap();
    assert_eq!(plan.last_step(), 1);
    assert!(
        plan.entry_need(0)
            .unwrap()
            .values()
            .all(TargetSet::is_empty)
    );

    let report = fixture.runner.run(&mut fixture.ctx, &goal).unwrap();
    assert_eq!(report.satisfied[0].1, wanted);
}

/// Explicitly invalidating A's artifact empties both it and everything
/// derived downstream, leaving unrelated targets alone.
#[test]
fn explicit_invalidation_is_transitive_and_minimal() {
    let mut fixture = cross_step();
    let tax = fixture.ctx.registry().taxonomy();

    let goal = vec![GoalEntry::new(
        "B",
        "c2",
        [Target::parse(fixture.k2, "seed", tax).unwrap()]
            .into_iter()
            .collect::<TargetSet>(),
    )];
    let seed: TargetSet = [Target::parse(fixture.k1, "seed", tax).unwrap()]
        .into_iter()
        .collect();

    fixture.runner.run(&mut fixture.ctx, &goal).unwrap();

    let report = fixture
        .runner
        .invalidate(&fixture.ctx, "A", "c1", &seed)
        .unwrap();

    assert!(present(&fixture.runner, "A", "c1").is_empty());
    assert!(present(&fixture.runner, "B", "c1").is_empty());
    assert!(present(&fixture.runner, "B", "c2").is_empty());
    assert!(report.removed("B", "c2").is_some());

    // A rerun re-derives the invalidated chain.
    let report = fixture.runner.run(&mut fixture.ctx, &goal).unwrap();
    assert_eq!(report.satisfied[0].1.len(), 1);
}

#[derive(Default)]
struct Model {
    entries: Vec<String>,
}

impl Global for Model {
    fn save(&self, sink: &mut dyn Write) -> std::io::Result<()> {
        serde_yaml::to_writer(sink, &self.entries).map_err(std::io::Error::other)
    }

    fn load(&mut self, source: &mut dyn Read) -> std::io::Result<()> {
        self.entries = serde_yaml::from_reader(source).map_err(std::io::Error::other)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// A pipeline whose pipe derives its output from a global: mutating the
/// global invalidates the output, and only the output.
#[test]
fn global_mutation_invalidates_derived_targets() {
    let mut ctx = Context::new(Registry::with_defaults().unwrap());
    ctx.register_global("model.yml", Box::new(Model::default()))
        .unwrap();

    let tax = ctx.registry().taxonomy();
    let kind = tax.kind_named("StringKind").unwrap();

    let derive = Contract::build(
        1,
        vec![ContractRule::new(
            None,
            0,
            kind,
            PathOp::Constant(vec![Component::name("derived")]),
        )],
        tax,
    )
    .unwrap();
    let derive = Arc::new(
        FnPipe::new("derive-from-model", derive, move |ctx, containers| {
            let tax = ctx.registry().taxonomy();
            let model = ctx.global::<Model>("model.yml")?;
            let summary = model.entries.join(",");

            let sink = containers[0]
                .as_any_mut()
                .downcast_mut::<StringContainer>()
                .unwrap();
            sink.insert(Target::parse(kind, "derived", tax)?, summary);
            Ok(())
        })
        .reading_global("model.yml"),
    );

    let seed_other = Contract::build(
        1,
        vec![ContractRule::new(
            None,
            0,
            kind,
            PathOp::Constant(vec![Component::name("independent")]),
        )],
        tax,
    )
    .unwrap();
    let seed_other = Arc::new(FnPipe::new("independent", seed_other, move |ctx, containers| {
        let tax = ctx.registry().taxonomy();
        let sink = containers[0]
            .as_any_mut()
            .downcast_mut::<StringContainer>()
            .unwrap();
        sink.insert(Target::parse(kind, "independent", tax)?, "constant");
        Ok(())
    }));

    let schema = BTreeMap::from([
        ("out".to_string(), "StringContainer".to_string()),
        ("other".to_string(), "StringContainer".to_string()),
    ]);
    let step = Step::new(
        "first",
        schema,
        vec![
            PipeSlot::new(derive, vec!["out".to_string()]),
            PipeSlot::new(seed_other, vec!["other".to_string()]),
        ],
        ctx.registry(),
    )
    .unwrap();

    let mut runner = Runner::new(vec![step]).unwrap();

    let goal = vec![
        GoalEntry::new("first", "out", string_targets(&ctx, "StringKind", &["*"])),
        GoalEntry::new("first", "other", string_targets(&ctx, "StringKind", &["*"])),
    ];
    runner.run(&mut ctx, &goal).unwrap();
    assert_eq!(present(&runner, "first", "out").len(), 1);

    ctx.update_global("model.yml", |m: &mut Model| {
        m.entries.push("main".into());
    })
    .unwrap();

    let reports = runner.flush_invalidations(&mut ctx).unwrap();
    assert_eq!(reports.len(), 1);

    // Completeness: the derived target is gone.
    assert!(present(&runner, "first", "out").is_empty());
    // Minimality: the independent target survives.
    assert_eq!(present(&runner, "first", "other").len(), 1);

    // The next run re-derives from the new model state.
    runner.run(&mut ctx, &goal).unwrap();
    let out = runner
        .container("first", "out")
        .unwrap()
        .as_any()
        .downcast_ref::<StringContainer>()
        .unwrap();
    let tax = ctx.registry().taxonomy();
    let derived = Target::parse(tax.kind_named("StringKind").unwrap(), "derived", tax).unwrap();
    assert_eq!(out.get(&derived), Some("main"));
}

/// A pass list naming an unregistered pass is rejected at load, before
/// anything executes.
#[test]
fn missing_pass_fails_at_pipeline_load() {
    let registry = Registry::with_defaults().unwrap();
    let text = "
Containers:
  - { Name: module.ll, Type: ModuleContainer }
Steps:
  - Name: optimize
    Pipes:
      - { Type: PassPipe, UsedContainers: [module.ll], Passes: [nonexistent-pass] }
";

    let error = Blueprint::from_yaml(text)
        .unwrap()
        .resolve(&registry)
        .map(|_| ())
        .unwrap_err();
    match error {
        PipelineError::UnknownPass(name) => assert_eq!(name, "nonexistent-pass"),
        other => panic!("expected UnknownPass, got {other:?}"),
    }
}

/// A pass-list pipe rewrites module bodies in place without disturbing the
/// target set.
#[test]
fn pass_pipe_runs_registered_passes() {
    use pipewright::container::module::{Module, ModuleContainer};

    let mut ctx = Context::new(Registry::with_defaults().unwrap());
    let tax = ctx.registry().taxonomy();
    let kind = tax.kind_named("ModuleKind").unwrap();

    let lift = Contract::build(
        1,
        vec![ContractRule::new(
            None,
            0,
            kind,
            PathOp::Constant(vec![Component::name("main")]),
        )],
        tax,
    )
    .unwrap();
    let lift = Arc::new(FnPipe::new("lift", lift, |_, containers| {
        let sink = containers[0]
            .as_any_mut()
            .downcast_mut::<ModuleContainer>()
            .unwrap();
        sink.insert(Module {
            name: "main".into(),
            body: "live 1\ndead 2\nlive 3\n".into(),
        });
        Ok(())
    }));

    let passes = ctx
        .registry()
        .make_pipe("PassPipe", &["globaldce".to_string()])
        .unwrap();

    let schema = BTreeMap::from([("module.ll".to_string(), "ModuleContainer".to_string())]);
    let step = Step::new(
        "lift",
        schema,
        vec![
            PipeSlot::new(lift, vec!["module.ll".to_string()]),
            PipeSlot::new(passes, vec!["module.ll".to_string()]),
        ],
        ctx.registry(),
    )
    .unwrap();
    let mut runner = Runner::new(vec![step]).unwrap();

    let goal = vec![GoalEntry::new(
        "lift",
        "module.ll",
        [Target::parse(kind, "main", ctx.registry().taxonomy()).unwrap()]
            .into_iter()
            .collect::<TargetSet>(),
    )];
    let report = runner.run(&mut ctx, &goal).unwrap();
    assert_eq!(report.satisfied[0].1.len(), 1);

    let modules = runner
        .container("lift", "module.ll")
        .unwrap()
        .as_any()
        .downcast_ref::<ModuleContainer>()
        .unwrap();
    assert_eq!(modules.get("main").unwrap().body, "live 1\nlive 3\n");
}

/// Persisted step artifacts seed a fresh runner: the goal is satisfiable
/// with no input bindings at all.
#[test]
fn persisted_artifacts_seed_later_runs() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap().to_string();

    let goal_of = |ctx: &Context| {
        vec![GoalEntry::new(
            "first",
            "strings-2",
            string_targets(ctx, "StringKind", &["*"]),
        )]
    };

    {
        let mut ctx = Context::new(Registry::with_defaults().unwrap());
        let steps = Blueprint::from_yaml(COPY_PIPELINE)
            .unwrap()
            .resolve(ctx.registry())
            .unwrap();
        let mut runner = Runner::new(steps).unwrap();
        runner.set_storage(Storage::open(root.clone()).unwrap());
        runner
            .bind_input("first", "strings-1", b"a\nb\nc\n".to_vec())
            .unwrap();

        let goal = goal_of(&ctx);
        runner.run(&mut ctx, &goal).unwrap();
    }

    // A fresh runner, same working directory, no bindings.
    let mut ctx = Context::new(Registry::with_defaults().unwrap());
    let steps = Blueprint::from_yaml(COPY_PIPELINE)
        .unwrap()
        .resolve(ctx.registry())
        .unwrap();
    let mut runner = Runner::new(steps).unwrap();
    runner.set_storage(Storage::open(root).unwrap());

    let goal = goal_of(&ctx);
    let report = runner.run(&mut ctx, &goal).unwrap();
    assert_eq!(report.satisfied[0].1.len(), 3);
}

/// Explicit invalidation reaches into persisted artifacts too.
#[test]
fn invalidation_rewrites_persisted_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap().to_string();

    let mut ctx = Context::new(Registry::with_defaults().unwrap());
    let steps = Blueprint::from_yaml(COPY_PIPELINE)
        .unwrap()
        .resolve(ctx.registry())
        .unwrap();
    let mut runner = Runner::new(steps).unwrap();
    runner.set_storage(Storage::open(root.clone()).unwrap());
    runner
        .bind_input("first", "strings-1", b"a\nb\n".to_vec())
        .unwrap();

    let goal = vec![GoalEntry::new(
        "first",
        "strings-2",
        string_targets(&ctx, "StringKind", &["*"]),
    )];
    runner.run(&mut ctx, &goal).unwrap();

    runner
        .invalidate(
            &ctx,
            "first",
            "strings-1",
            &string_targets(&ctx, "StringKind", &["a"]),
        )
        .unwrap();

    // Reload the persisted step into a fresh runner: `a` must be gone from
    // both containers, `b` still there.
    let mut ctx2 = Context::new(Registry::with_defaults().unwrap());
    let steps = Blueprint::from_yaml(COPY_PIPELINE)
        .unwrap()
        .resolve(ctx2.registry())
        .unwrap();
    let mut runner2 = Runner::new(steps).unwrap();
    runner2.set_storage(Storage::open(root).unwrap());

    let report = runner2.run(&mut ctx2, &goal).unwrap();
    assert_eq!(
        report.satisfied[0].1,
        string_targets(&ctx2, "StringKind", &["b"]),
    );
}
