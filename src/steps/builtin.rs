//! Built-in steps shipped with the worker binary.
//!
//! All live under module id `builtin`. They cover the shapes real steps
//! take: plain transforms, storage and info access, slow or silent steps,
//! misbehaving steps, and an error handler.

use std::time::Duration;

use serde_json::{Value, json};

use super::registry::StepRegistry;
use super::step::step_fn;
use crate::error::ContextError;
use crate::protocol::ErrorPayload;

/// Module id of every built-in step.
pub const BUILTIN_MODULE: &str = "builtin";

/// Default exit code for the `crash` step.
const CRASH_EXIT_CODE: i32 = 70;

fn input_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

/// Register every built-in step into `registry`.
pub fn register_builtin(registry: &mut StepRegistry) {
    registry.register(
        BUILTIN_MODULE,
        "echo",
        step_fn(|call, _ctx, done| async move {
            done.ok(call.input);
        }),
    );

    registry.register(
        BUILTIN_MODULE,
        "fail",
        step_fn(|call, _ctx, done| async move {
            let name = input_str(&call.input, "name").unwrap_or("StepError");
            let message = input_str(&call.input, "message").unwrap_or("step failed");
            done.fail(ErrorPayload::named(name, message));
        }),
    );

    // Never completes.
    registry.register(
        BUILTIN_MODULE,
        "hang",
        step_fn(|_call, _ctx, done| async move {
            let _held = done;
            std::future::pending::<()>().await;
        }),
    );

    registry.register(
        BUILTIN_MODULE,
        "sleep",
        step_fn(|call, _ctx, done| async move {
            let ms = call.input.get("ms").and_then(Value::as_u64).unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            done.ok(call.input);
        }),
    );

    // Completes from a detached task after `run` has returned.
    registry.register(
        BUILTIN_MODULE,
        "deferred",
        step_fn(|call, _ctx, done| async move {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.ok(call.input);
            });
        }),
    );

    // Takes the whole worker process down.
    registry.register(
        BUILTIN_MODULE,
        "crash",
        step_fn(|call, _ctx, _done| async move {
            let code = call
                .input
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(CRASH_EXIT_CODE);
            tracing::warn!(call_id = call.call_id, code, "crash step exiting worker");
            std::process::exit(code);
        }),
    );

    // Writes bytes that are not an envelope (nor UTF-8) straight to the
    // worker's stdout, then completes normally.
    registry.register(
        BUILTIN_MODULE,
        "scribble",
        step_fn(|call, _ctx, done| async move {
            let written = {
                use std::io::Write;
                let mut out = std::io::stdout().lock();
                out.write_all(b"\xff\xfe garbage\n").and_then(|()| out.flush())
            };
            match written {
                Ok(()) => done.ok(call.input),
                Err(e) => done.fail(ErrorPayload::named("StepError", e.to_string())),
            };
        }),
    );

    registry.register(
        BUILTIN_MODULE,
        "twice",
        step_fn(|_call, _ctx, done| async move {
            done.ok(json!("first"));
            done.ok(json!("second"));
        }),
    );

    registry.register(
        BUILTIN_MODULE,
        "app-info",
        step_fn(|_call, ctx, done| async move {
            match ctx.app.get_info().await {
                Ok(info) => done.ok(info),
                Err(e) => done.fail_context(e),
            };
        }),
    );

    registry.register(
        BUILTIN_MODULE,
        "device-info",
        step_fn(|_call, ctx, done| async move {
            match ctx.device.get_info().await {
                Ok(info) => done.ok(info),
                Err(e) => done.fail_context(e),
            };
        }),
    );

    // Per-device counter: read, increment, write back.
    registry.register(
        BUILTIN_MODULE,
        "counter",
        step_fn(|_call, ctx, done| async move {
            let result = async {
                let current = ctx
                    .storage
                    .device
                    .get("count")
                    .await?
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                ctx.storage.device.set("count", json!(current + 1)).await?;
                Ok::<_, ContextError>(json!(current + 1))
            }
            .await;
            match result {
                Ok(count) => done.ok(count),
                Err(e) => done.fail_context(e),
            };
        }),
    );

    registry.register(
        BUILTIN_MODULE,
        "remember-user",
        step_fn(|call, ctx, done| async move {
            match ctx.storage.user.set("last", call.input.clone()).await {
                Ok(()) => done.ok(call.input),
                Err(e) => done.fail_context(e),
            };
        }),
    );

    registry.register(
        BUILTIN_MODULE,
        "read-setting",
        step_fn(|call, ctx, done| async move {
            let key = input_str(&call.input, "key").unwrap_or_default().to_string();
            match ctx.settings.get(&key).await {
                Ok(value) => done.ok(value.unwrap_or(Value::Null)),
                Err(e) => done.fail_context(e),
            };
        }),
    );

    registry.register(
        BUILTIN_MODULE,
        "log",
        step_fn(|call, ctx, done| async move {
            let message = input_str(&call.input, "message").unwrap_or("hello from step");
            ctx.log.info(message);
            done.ok(Value::Null);
        }),
    );

    registry.register_catcher(
        BUILTIN_MODULE,
        "catch",
        step_fn(|call, _ctx, done| async move {
            let caught = call
                .catchable_error
                .map(|e| json!({"name": e.name, "message": e.message}))
                .unwrap_or(Value::Null);
            done.ok(json!({"caught": caught, "input": call.input}));
        }),
    );
}

/// A registry holding only the built-in steps.
pub fn builtin_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_builtin(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::step::StepResolver;

    #[test]
    fn builtin_steps_are_registered() {
        let registry = builtin_registry();
        for path in ["echo", "hang", "crash", "counter", "app-info", "twice", "scribble"] {
            assert!(registry.has(BUILTIN_MODULE, path), "missing {path}");
        }
        assert!(registry.resolve(BUILTIN_MODULE, "catch").unwrap().error_catching);
        assert!(!registry.resolve(BUILTIN_MODULE, "echo").unwrap().error_catching);
    }
}
