//! JavaScript Global Objects
//!
//! Installs the worker-facing globals: `emit`, `on`, `once`, `off`, `close`,
//! `workerId`, `workerSource` and `console`.

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value as JsValue};
use worker_bridge::{SubscriptionId, WorkerId};

use crate::convert::{MAX_SAFE_INTEGER, js_to_json};
use crate::engine::JsScope;
use crate::error::{QuickJsError, QuickJsResult, exception_message};

const PRELUDE: &str = include_str!("prelude.js");

/// Install every global into a fresh context.
pub(crate) fn install(ctx: &Ctx<'_>, scope: &JsScope) -> QuickJsResult<()> {
    let globals = ctx.globals();

    register_console(ctx, scope)?;
    globals.set("workerId", worker_id_number(scope.id())?)?;
    globals.set("workerSource", scope.source())?;
    globals.set("__bridge", bridge_object(ctx, scope)?)?;

    ctx.eval::<JsValue, _>(PRELUDE)
        .map_err(|e| QuickJsError::Exception(exception_message(ctx, e)))?;
    Ok(())
}

/// `workerId` as a JS number. Ids above 2^53 would not round-trip exactly.
fn worker_id_number(id: WorkerId) -> QuickJsResult<f64> {
    let number = id.0 as f64;
    if number > MAX_SAFE_INTEGER {
        return Err(QuickJsError::Conversion(format!(
            "worker id {} exceeds the largest exact JS integer",
            id
        )));
    }
    Ok(number)
}

/// Native side of the prelude. Removed from the global object once the
/// prelude has captured it.
fn bridge_object<'js>(ctx: &Ctx<'js>, scope: &JsScope) -> rquickjs::Result<Object<'js>> {
    let bridge = Object::new(ctx.clone())?;

    let emitter = scope.clone();
    bridge.set(
        "emit",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, args: Rest<JsValue<'js>>| -> rquickjs::Result<()> {
                let mut values = Vec::with_capacity(args.0.len());
                for arg in args.0.iter() {
                    let value = js_to_json(arg)
                        .map_err(|e| Exception::throw_type(&ctx, &format!("emit '{}': {}", name, e)))?;
                    values.push(value);
                }
                emitter.emit_to_main(name, values);
                Ok(())
            },
        )?,
    )?;

    let subscriber = scope.clone();
    bridge.set(
        "subscribe",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, callback: Function<'js>, once: bool, site: String| -> f64 {
                let callback = Persistent::save(&ctx, callback);
                subscriber.subscribe_to_worker(name, callback, once, site).0 as f64
            },
        )?,
    )?;

    let unsubscriber = scope.clone();
    bridge.set(
        "unsubscribe",
        Function::new(ctx.clone(), move |name: String, id: f64| -> bool {
            unsubscriber.unsubscribe(&name, SubscriptionId(id as u64))
        })?,
    )?;

    let closer = scope.clone();
    bridge.set(
        "close",
        Function::new(ctx.clone(), move || {
            closer.request_termination();
        })?,
    )?;

    Ok(bridge)
}

/// Register the console object with log, info, warn, error and debug methods
fn register_console(ctx: &Ctx<'_>, scope: &JsScope) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    let worker = scope.id();

    console.set(
        "log",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::info!(target: "worker.js", "[worker:{}] {}", worker, join(args));
        })?,
    )?;

    console.set(
        "info",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::info!(target: "worker.js", "[worker:{}] {}", worker, join(args));
        })?,
    )?;

    console.set(
        "warn",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::warn!(target: "worker.js", "[worker:{}] {}", worker, join(args));
        })?,
    )?;

    console.set(
        "error",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::error!(target: "worker.js", "[worker:{}] {}", worker, join(args));
        })?,
    )?;

    console.set(
        "debug",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::debug!(target: "worker.js", "[worker:{}] {}", worker, join(args));
        })?,
    )?;

    ctx.globals().set("console", console)?;
    Ok(())
}

fn join(args: Rest<Coerced<String>>) -> String {
    args.0
        .into_iter()
        .map(|arg| arg.0)
        .collect::<Vec<_>>()
        .join(" ")
}
