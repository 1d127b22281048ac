//! Execution units.
//!
//! A [`Pipe`] is an opaque piece of work bound to a [`Contract`]. The runner
//! trusts the contract for planning and invalidation; execution receives the
//! pipe's slice of the step's containers, in slot order, and mutates it in
//! place. A pipe's own failure is an `anyhow::Error` and surfaces as
//! `PipeFailed` with the pipe's name attached.

use std::sync::Arc;

use crate::container::Container;
use crate::container::module::{Module, ModuleContainer};
use crate::container::strings::StringContainer;
use crate::context::Context;
use crate::contract::Contract;
use crate::kind::KindId;
use crate::target::{Component, Target};

pub trait Pipe: Send + Sync {
    fn name(&self) -> &str;

    fn contract(&self) -> &Contract;

    /// Names of the globals this pipe reads. Mutating any of them
    /// invalidates everything the pipe produced.
    fn globals_read(&self) -> &[String] {
        &[]
    }

    /// Runs against the bound containers, in slot order.
    fn run(&self, ctx: &Context, containers: &mut [&mut dyn Container]) -> anyhow::Result<()>;
}

/// A pipe built from a closure, for programmatic registration.
pub struct FnPipe<F> {
    name: String,
    contract: Contract,
    globals: Vec<String>,
    body: F,
}

impl<F> FnPipe<F>
where
    F: Fn(&Context, &mut [&mut dyn Container]) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, contract: Contract, body: F) -> Self {
        Self {
            name: name.into(),
            contract,
            globals: Vec::new(),
            body,
        }
    }

    pub fn reading_global(mut self, name: impl Into<String>) -> Self {
        self.globals.push(name.into());
        self
    }
}

impl<F> Pipe for FnPipe<F>
where
    F: Fn(&Context, &mut [&mut dyn Container]) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn contract(&self) -> &Contract {
        &self.contract
    }

    fn globals_read(&self) -> &[String] {
        &self.globals
    }

    fn run(&self, ctx: &Context, containers: &mut [&mut dyn Container]) -> anyhow::Result<()> {
        (self.body)(ctx, containers)
    }
}

/// Copies every matching string artifact from its first container into its
/// second, leaving the originals in place.
pub struct CopyPipe {
    kind: KindId,
    contract: Contract,
}

impl CopyPipe {
    pub const TYPE: &'static str = "Copy";

    pub fn new(kind: KindId, contract: Contract) -> Self {
        Self { kind, contract }
    }
}

impl Pipe for CopyPipe {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn contract(&self) -> &Contract {
        &self.contract
    }

    fn run(&self, ctx: &Context, containers: &mut [&mut dyn Container]) -> anyhow::Result<()> {
        let tax = ctx.registry().taxonomy();
        let depth = tax.depth_of(self.kind);
        let pattern = Target::raw(self.kind, vec![Component::All; depth]);

        let (source, rest) = containers
            .split_first_mut()
            .ok_or_else(|| anyhow::anyhow!("copy needs two containers"))?;
        let source = source
            .as_any()
            .downcast_ref::<StringContainer>()
            .ok_or_else(|| anyhow::anyhow!("source is not a StringContainer"))?;
        let sink = rest
            .first_mut()
            .ok_or_else(|| anyhow::anyhow!("copy needs two containers"))?
            .as_any_mut()
            .downcast_mut::<StringContainer>()
            .ok_or_else(|| anyhow::anyhow!("sink is not a StringContainer"))?;

        for (target, value) in source.entries() {
            if target.satisfies(&pattern, tax) {
                sink.insert(target.clone(), value);
            }
        }

        Ok(())
    }
}

/// One inner pass of a [`PassPipe`], rewriting module bodies in place.
pub trait ModulePass: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, module: &mut Module);
}

/// A compound pipe running an ordered list of registered passes over a
/// module container. The pass list comes from the pipeline description and
/// is resolved (and validated) at load time.
pub struct PassPipe {
    passes: Vec<Arc<dyn ModulePass>>,
    contract: Contract,
}

impl PassPipe {
    pub const TYPE: &'static str = "PassPipe";

    pub fn new(passes: Vec<Arc<dyn ModulePass>>, contract: Contract) -> Self {
        Self { passes, contract }
    }
}

impl Pipe for PassPipe {
    fn name(&self) -> &str {
        Self::TYPE
    }

    fn contract(&self) -> &Contract {
        &self.contract
    }

    fn run(&self, _: &Context, containers: &mut [&mut dyn Container]) -> anyhow::Result<()> {
        let modules = containers
            .first_mut()
            .ok_or_else(|| anyhow::anyhow!("pass pipe needs a container"))?
            .as_any_mut()
            .downcast_mut::<ModuleContainer>()
            .ok_or_else(|| anyhow::anyhow!("pass pipe needs a ModuleContainer"))?;

        for pass in &self.passes {
            let span = tracing::debug_span!("pass", name = pass.name());
            let _enter = span.enter();

            for module in modules.modules_mut() {
                pass.run(module);
            }
        }

        Ok(())
    }
}

/// Drops lines marked dead, the stand-in for a global dead-code elimination
/// pass.
pub struct GlobalDce;

impl ModulePass for GlobalDce {
    fn name(&self) -> &'static str {
        "globaldce"
    }

    fn run(&self, module: &mut Module) {
        module.body = module
            .body
            .lines()
            .filter(|line| !line.trim_start().starts_with("dead "))
            .map(|line| format!("{line}\n"))
            .collect();
    }
}

/// Drops debug annotation lines (those starting with `!`).
pub struct StripDebug;

impl ModulePass for StripDebug {
    fn name(&self) -> &'static str {
        "strip-debug"
    }

    fn run(&self, module: &mut Module) {
        module.body = module
            .body
            .lines()
            .filter(|line| !line.trim_start().starts_with('!'))
            .map(|line| format!("{line}\n"))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globaldce_drops_dead_lines() {
        let mut module = Module {
            name: "main".into(),
            body: "live 1\ndead 2\nlive 3\n".into(),
        };

        GlobalDce.run(&mut module);
        assert_eq!(module.body, "live 1\nlive 3\n");
    }

    #[test]
    fn strip_debug_drops_annotations() {
        let mut module = Module {
            name: "main".into(),
            body: "code\n!dbg 1\ncode\n".into(),
        };

        StripDebug.run(&mut module);
        assert_eq!(module.body, "code\ncode\n");
    }
}
