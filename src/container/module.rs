//! A store for textual module artifacts, the unit the pass-list pipes
//! operate on.
//!
//! A [`Module`] is a named body of line-oriented text; passes rewrite bodies
//! in place. Each module is addressed by a single root-rank target.

use std::any::Any;
use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::container::Container;
use crate::error::PipelineError;
use crate::kind::{KindId, Taxonomy};
use crate::target::{Component, Target, TargetSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct ModuleContainer {
    kind: KindId,
    modules: BTreeMap<String, Module>,
}

impl ModuleContainer {
    pub const TYPE: &'static str = "ModuleContainer";

    pub fn new(kind: KindId) -> Self {
        Self {
            kind,
            modules: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, module: Module) -> Option<Module> {
        self.modules.insert(module.name.clone(), module)
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn modules_mut(&mut self) -> impl Iterator<Item = &mut Module> {
        self.modules.values_mut()
    }

    fn target_for(&self, name: &str) -> Target {
        Target::raw(self.kind, vec![Component::name(name)])
    }
}

impl Container for ModuleContainer {
    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn accepts(&self, kind: KindId) -> bool {
        kind == self.kind
    }

    fn enumerate(&self) -> TargetSet {
        self.modules.keys().map(|name| self.target_for(name)).collect()
    }

    fn contains(&self, target: &Target) -> bool {
        match target.path() {
            [Component::Name(name)] => {
                target.kind() == self.kind && self.modules.contains_key(name.as_ref())
            }
            _ => false,
        }
    }

    fn remove(&mut self, targets: &TargetSet) {
        for target in targets.iter() {
            if let [Component::Name(name)] = target.path() {
                self.modules.remove(name.as_ref());
            }
        }
    }

    fn merge(&mut self, other: Box<dyn Container>) -> Result<(), PipelineError> {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => {
                self.modules
                    .extend(other.modules.iter().map(|(k, v)| (k.clone(), v.clone())));
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

    fn save(&self, _: &Taxonomy, sink: &mut dyn Write) -> std::io::Result<()> {
        let modules: Vec<&Module> = self.modules.values().collect();
        ciborium::into_writer(&modules, sink).map_err(std::io::Error::other)
    }

    fn load(&mut self, _: &Taxonomy, source: &mut dyn Read) -> std::io::Result<()> {
        let modules: Vec<Module> =
            ciborium::from_reader(source).map_err(std::io::Error::other)?;

        self.modules = modules
            .into_iter()
            .map(|module| (module.name.clone(), module))
            .collect();

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
