//! Global resume hooks.
//!
//! Hooks run after orphan attachment and before any worker is resumed, in
//! (priority, name) order. The metadata-offset recomputation is the one
//! default hook; operators can configure more through the control API.

use serde_json::Value;

use crate::error::{ControlError, ControlResult};
use crate::graph::GraphStore;
use crate::metadata::AttrRegistry;

/// What a resume hook is allowed to touch. All workers are paused while
/// hooks run.
pub struct ResumeCtx<'a> {
    pub graph: &'a mut GraphStore,
    pub attrs: &'a AttrRegistry,
}

pub trait ResumeHook: Send {
    fn name(&self) -> &str;
    fn priority(&self) -> u16;
    fn is_default(&self) -> bool;
    fn run(&self, ctx: &mut ResumeCtx<'_>);
}

/// Recomputes metadata attribute offsets from the current topology.
pub struct MetadataOffsets;

impl MetadataOffsets {
    pub const NAME: &'static str = "metadata_offsets";
}

impl ResumeHook for MetadataOffsets {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> u16 {
        0
    }

    fn is_default(&self) -> bool {
        true
    }

    fn run(&self, ctx: &mut ResumeCtx<'_>) {
        ctx.graph.compute_metadata_offsets();
    }
}

pub struct ResumeHookClass {
    pub name: &'static str,
    pub help: &'static str,
    pub builder: fn(&Value) -> ControlResult<Box<dyn ResumeHook>>,
}

pub fn builtin_resume_hook_classes() -> Vec<ResumeHookClass> {
    vec![ResumeHookClass {
        name: MetadataOffsets::NAME,
        help: "Recompute per-packet metadata offsets before workers resume",
        builder: |_arg| Ok(Box::new(MetadataOffsets)),
    }]
}

#[derive(Default)]
pub struct ResumeHookRegistry {
    hooks: Vec<Box<dyn ResumeHook>>,
}

impl ResumeHookRegistry {
    /// Registry pre-seeded with the default hooks.
    pub fn with_defaults() -> ResumeHookRegistry {
        let mut reg = ResumeHookRegistry::default();
        reg.add(Box::new(MetadataOffsets));
        reg
    }

    pub fn add(&mut self, hook: Box<dyn ResumeHook>) {
        let key = (hook.priority(), hook.name().to_string());
        let pos = self
            .hooks
            .iter()
            .position(|h| (h.priority(), h.name().to_string()) > key)
            .unwrap_or(self.hooks.len());
        self.hooks.insert(pos, hook);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.name() != name);
        before != self.hooks.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.iter().any(|h| h.name() == name)
    }

    /// Drop everything operators added; keep the defaults. Happens when the
    /// last worker is destroyed.
    pub fn clear_non_default(&mut self) {
        self.hooks.retain(|h| h.is_default());
    }

    pub fn run_all(&self, ctx: &mut ResumeCtx<'_>) {
        for hook in &self.hooks {
            hook.run(ctx);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        name: &'static str,
        priority: u16,
    }

    impl ResumeHook for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u16 {
            self.priority
        }
        fn is_default(&self) -> bool {
            false
        }
        fn run(&self, _ctx: &mut ResumeCtx<'_>) {}
    }

    #[test]
    fn ordered_and_default_preserved() {
        let mut reg = ResumeHookRegistry::with_defaults();
        reg.add(Box::new(Probe {
            name: "zz_first",
            priority: 0,
        }));
        reg.add(Box::new(Probe {
            name: "aa_late",
            priority: 9,
        }));
        assert_eq!(
            reg.names(),
            vec!["metadata_offsets", "zz_first", "aa_late"]
        );

        reg.clear_non_default();
        assert_eq!(reg.names(), vec!["metadata_offsets"]);
    }
}
