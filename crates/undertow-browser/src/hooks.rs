//! Ordered asynchronous interceptor chains around pool lifecycle points.
//!
//! Hooks run sequentially in registration order; each receives the stage
//! context by mutable reference and must mutate it in place rather than
//! replace it. The first failing hook aborts the stage.

use futures::future::BoxFuture;
use tracing::debug;
use undertow_types::CoreResult;

/// Future returned by one hook invocation
pub type HookFuture<'a> = BoxFuture<'a, CoreResult<()>>;

/// One interceptor over a stage context `C`
pub type Hook<C> = Box<dyn for<'a> Fn(&'a mut C) -> HookFuture<'a> + Send + Sync>;

/// Box a closure as a [`Hook`]; mostly a type-inference aid.
pub fn hook<C, F>(f: F) -> Hook<C>
where
    F: for<'a> Fn(&'a mut C) -> HookFuture<'a> + Send + Sync + 'static,
{
    Box::new(f)
}

/// An ordered list of hooks for one lifecycle point
pub struct HookChain<C> {
    stage: &'static str,
    hooks: Vec<Hook<C>>,
}

impl<C> HookChain<C> {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            hooks: Vec::new(),
        }
    }

    pub fn push(&mut self, hook: Hook<C>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook in order, aborting on the first failure.
    pub async fn run(&self, context: &mut C) -> CoreResult<()> {
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook(context).await {
                debug!(stage = self.stage, index, error = %e, "hook failed, aborting stage");
                return Err(e);
            }
        }
        Ok(())
    }
}
