//! Script runtime management
//!
//! One QuickJS runtime plus its single context, sized from
//! [`ScriptSettings`].

use crate::error::ScriptError;
use rquickjs::{Context, Ctx, Runtime};
use sluice_services::ScriptSettings;

/// Script execution context
pub struct ScriptRuntime {
    // Declared first so the context is torn down before its runtime.
    context: Context,
    runtime: Runtime,
}

impl ScriptRuntime {
    pub fn new(settings: &ScriptSettings) -> Result<Self, ScriptError> {
        let runtime = Runtime::new()?;
        runtime.set_max_stack_size(settings.max_stack_size);
        if let Some(limit) = settings.memory_limit {
            runtime.set_memory_limit(limit);
        }
        let context = Context::full(&runtime)?;
        tracing::debug!(
            max_stack_size = settings.max_stack_size,
            memory_limit = ?settings.memory_limit,
            "script runtime created"
        );

        Ok(Self { context, runtime })
    }

    /// Run `f` with the interpreter locked.
    ///
    /// The lock is not re-entrant: never call this from inside another `with`.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send,
        R: Send,
    {
        self.context.with(f)
    }

    /// Evaluate `source` for its side effects.
    pub fn execute(&self, source: &str) -> Result<(), ScriptError> {
        self.context.with(|ctx| ctx.eval::<(), _>(source))?;
        Ok(())
    }

    /// Run queued promise jobs until none remain. Returns how many ran.
    pub fn run_pending_jobs(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(_) => {
                    ran += 1;
                    tracing::warn!("script job raised an unhandled exception");
                }
            }
        }
        ran
    }

    pub fn has_pending_jobs(&self) -> bool {
        self.runtime.is_job_pending()
    }
}
