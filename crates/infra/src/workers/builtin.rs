//! Handlers every process registers out of the box.
//!
//! - `default`, `echo`: return the payload unchanged
//! - `sleep`: wait `{"ms": n}` milliseconds, honouring cancellation

use std::time::Duration;

use serde::Deserialize;

use jobforge_core::{DEFAULT_KIND, Payload};

use super::handler::{HandlerRegistry, TaskContext, TaskFailure};

#[derive(Debug, Deserialize)]
struct SleepArgs {
    ms: u64,
}

/// Registry pre-populated with the built-in handlers.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry);
    registry
}

pub fn register_builtins(registry: &mut HandlerRegistry) -> &mut HandlerRegistry {
    registry
        .register_fn(DEFAULT_KIND, echo)
        .register_fn("echo", echo)
        .register_fn("sleep", sleep)
}

async fn echo(ctx: TaskContext) -> Result<Payload, TaskFailure> {
    ctx.checkpoint()?;
    Ok(ctx.payload().clone())
}

async fn sleep(mut ctx: TaskContext) -> Result<Payload, TaskFailure> {
    let args: SleepArgs = ctx
        .payload()
        .decode_json()
        .map_err(|e| TaskFailure::permanent(e.to_string()))?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(args.ms)) => {}
        _ = ctx.cancelled() => return Err(TaskFailure::cancelled()),
    }
    Payload::json(&serde_json::json!({ "slept_ms": args.ms }))
        .map_err(|e| TaskFailure::permanent(e.to_string()))
}
