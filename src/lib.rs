#![deny(
    unsafe_code,
    // clippy::unwrap_used,
    // clippy::expect_used,
    clippy::panic,
)]

//! A declarative pipeline runtime with fine-grained artifact identity.
//!
//! Artifacts are not whole files but named [`Target`]s inside typed
//! [`Container`]s. Pipes declare, through [`Contract`]s, which targets they
//! consume and produce; the [`Runner`] applies those contracts backward to
//! plan what a goal needs and forward to execute it, and the invalidator
//! uses the same contracts to drop exactly the targets transitively derived
//! from a changed [`Global`] or an explicitly invalidated target set.
//!
//! The intended embedding is a binary-analysis toolchain: lifting,
//! control-flow recovery and the like are opaque pipes registered by the
//! front-end; this crate only schedules, runs and incrementally invalidates
//! them.

pub mod blueprint;
pub mod container;
pub mod context;
pub mod contract;
pub mod error;
pub mod invalidate;
pub mod kind;
pub mod pipe;
pub mod registry;
pub mod runner;
pub mod step;
pub mod storage;
pub mod target;

#[cfg(feature = "cli")]
pub mod cli;

pub use camino;

pub use crate::blueprint::Blueprint;
pub use crate::container::{Container, ContainerSet};
pub use crate::context::{Context, Global};
pub use crate::contract::{Contract, ContractRule, InputPattern, PathOp};
pub use crate::error::{PipelineError, StorageError};
pub use crate::invalidate::InvalidationReport;
pub use crate::kind::{KindId, RankId, Taxonomy};
pub use crate::pipe::{FnPipe, ModulePass, Pipe};
pub use crate::registry::Registry;
pub use crate::runner::{CancelToken, Diagnostics, Goal, GoalEntry, Plan, RunReport, Runner};
pub use crate::step::{PipeSlot, Step};
pub use crate::storage::Storage;
pub use crate::target::{Component, Target, TargetSet};
