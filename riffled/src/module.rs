//! The module contract and the module-class registry.
//!
//! A module receives a batch on an input gate and may emit batches on its
//! output gates, synchronously, before returning. Modules that source
//! traffic instead expose tasks, which the scheduler invokes through a leaf
//! traffic class.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::batch::PacketBatch;
use crate::error::{ControlError, ControlResult};
use crate::graph::Context;
use crate::metadata::{AccessMode, Attribute, MAX_ATTRS_PER_MODULE};
use crate::port::PortInstance;
use crate::worker::MAX_WORKERS;

/// What one task invocation produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskResult {
    /// True if the task had nothing to do and may be backed off.
    pub block: bool,
    pub packets: u64,
    pub bits: u64,
}

/// Module events delivered outside the datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleEvent {
    PreResume,
}

pub trait Module: Send + Sync {
    /// Handle a batch arriving on an input gate.
    fn process_batch(&self, _ctx: &mut Context<'_>, _batch: &mut PacketBatch) {
        panic!("process_batch called on a module without input gates");
    }

    /// Run one scheduled task invocation.
    fn run_task(&self, _ctx: &mut Context<'_>, _batch: &mut PacketBatch, _arg: u64) -> TaskResult {
        panic!("run_task called on a module without tasks");
    }

    /// One-line description shown by the control plane.
    fn desc(&self) -> String {
        String::new()
    }

    /// Per-instance teardown, before the module leaves the graph.
    fn deinit(&self) {}

    fn on_event(&self, _event: ModuleEvent) -> ControlResult<()> {
        Err(ControlError::NotSupported("event".to_string()))
    }

    /// Run a class-specific command. `get_initial_arg` is handled by the
    /// framework and never reaches the module.
    fn command(&self, cmd: &str, _arg: &Value) -> ControlResult<Value> {
        Err(ControlError::NotSupported(format!("command '{cmd}'")))
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CommandDesc {
    pub name: &'static str,
    pub arg: &'static str,
    pub mt_safe: bool,
}

/// Everything a module's init function declares about the new instance,
/// plus the registries it may resolve names against.
pub struct InitCtx {
    pub(crate) attrs: Vec<Attribute>,
    pub(crate) tasks: Vec<u64>,
    pub(crate) propagate_workers: bool,
    pub(crate) node_constraints: u64,
    pub(crate) min_allowed_workers: usize,
    pub(crate) max_allowed_workers: usize,
    pub(crate) wants_pre_resume: bool,
    /// Live ports, for modules that bind to one.
    pub ports: HashMap<String, Arc<PortInstance>>,
}

impl Default for InitCtx {
    fn default() -> Self {
        InitCtx {
            attrs: Vec::new(),
            tasks: Vec::new(),
            propagate_workers: false,
            // Any NUMA node is acceptable unless the module narrows it.
            node_constraints: u64::MAX,
            min_allowed_workers: 0,
            max_allowed_workers: 1,
            wants_pre_resume: false,
            ports: HashMap::new(),
        }
    }
}

impl InitCtx {
    pub fn port(&self, name: &str) -> ControlResult<Arc<PortInstance>> {
        self.ports
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(format!("port {name}")))
    }

    /// Receive `ModuleEvent::PreResume` before workers resume.
    pub fn subscribe_pre_resume(&mut self) {
        self.wants_pre_resume = true;
    }

    /// Declare a metadata attribute. Returns the attribute index used with
    /// `Context::attr_offset`.
    pub fn add_attr(&mut self, name: &str, size: usize, mode: AccessMode) -> ControlResult<usize> {
        if self.attrs.len() >= MAX_ATTRS_PER_MODULE {
            return Err(ControlError::ResourceExhausted(format!(
                "module already declares {MAX_ATTRS_PER_MODULE} attributes"
            )));
        }
        if self.attrs.iter().any(|a| a.name == name) {
            return Err(ControlError::AlreadyExists(format!("attribute {name}")));
        }
        self.attrs.push(Attribute {
            name: name.to_string(),
            size,
            mode,
        });
        Ok(self.attrs.len() - 1)
    }

    /// Register a schedulable task with an opaque argument (typically a
    /// queue id). A leaf traffic class is created for it as an orphan.
    pub fn register_task(&mut self, arg: u64) -> usize {
        self.tasks.push(arg);
        self.tasks.len() - 1
    }

    /// Record workers downstream of this module's tasks even when another
    /// module owns the running task.
    pub fn set_propagate_workers(&mut self, propagate: bool) {
        self.propagate_workers = propagate;
    }

    pub fn set_node_constraints(&mut self, mask: u64) {
        self.node_constraints = mask;
    }

    pub fn set_allowed_workers(&mut self, min: usize, max: usize) {
        self.min_allowed_workers = min;
        self.max_allowed_workers = max.min(MAX_WORKERS);
    }
}

/// A module class: type descriptor plus instance factory.
pub struct ModuleClass {
    pub name: &'static str,
    /// Prefix for generated instance names; empty derives one from `name`.
    pub name_template: &'static str,
    pub help: &'static str,
    pub igates: u16,
    pub ogates: u16,
    pub commands: &'static [CommandDesc],
    pub init: fn(&Value, &mut InitCtx) -> ControlResult<Box<dyn Module>>,
}

impl ModuleClass {
    pub fn find_command(&self, name: &str) -> Option<&'static CommandDesc> {
        self.commands.iter().find(|c| c.name == name)
    }
}

/// Name-keyed class registry.
#[derive(Default)]
pub struct ModuleClassRegistry {
    classes: BTreeMap<&'static str, &'static ModuleClass>,
}

impl ModuleClassRegistry {
    pub fn register(&mut self, class: &'static ModuleClass) {
        self.classes.insert(class.name, class);
    }

    pub fn get(&self, name: &str) -> ControlResult<&'static ModuleClass> {
        self.classes
            .get(name)
            .copied()
            .ok_or_else(|| ControlError::NotFound(format!("module class {name}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static ModuleClass> + '_ {
        self.classes.values().copied()
    }
}

/// Derive the default instance-name prefix: CamelCase class names become
/// snake_case templates.
pub fn default_name_template(class: &ModuleClass) -> String {
    if !class.name_template.is_empty() {
        return class.name_template.to_string();
    }
    let mut out = String::new();
    let mut last_lower = false;
    for ch in class.name.chars() {
        if last_lower && ch.is_uppercase() {
            out.push('_');
        }
        out.push(ch.to_ascii_lowercase());
        last_lower = ch.is_lowercase();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &'static str, template: &'static str) -> ModuleClass {
        ModuleClass {
            name,
            name_template: template,
            help: "",
            igates: 0,
            ogates: 0,
            commands: &[],
            init: |_, _| Err(ControlError::NotSupported("test".to_string())),
        }
    }

    #[test]
    fn name_template_from_camel_case() {
        assert_eq!(default_name_template(&class("PortInc", "")), "port_inc");
        assert_eq!(default_name_template(&class("Source", "")), "source");
        assert_eq!(default_name_template(&class("Queue", "q")), "q");
    }

    #[test]
    fn init_ctx_limits_attrs() {
        let mut ctx = InitCtx::default();
        for i in 0..MAX_ATTRS_PER_MODULE {
            ctx.add_attr(&format!("a{i}"), 1, AccessMode::Write).unwrap();
        }
        assert!(matches!(
            ctx.add_attr("overflow", 1, AccessMode::Write),
            Err(ControlError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn duplicate_attr_names_rejected() {
        let mut ctx = InitCtx::default();
        ctx.add_attr("x", 1, AccessMode::Read).unwrap();
        assert!(matches!(
            ctx.add_attr("x", 1, AccessMode::Read),
            Err(ControlError::AlreadyExists(_))
        ));
    }
}
