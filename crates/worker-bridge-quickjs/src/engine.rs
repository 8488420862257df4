//! QuickJS Engine
//!
//! One [`Runtime`] and one full [`Context`] per worker, created on the
//! worker's thread. Script callbacks registered with `on`/`once` are kept in
//! the bridge's worker-side registry as persistent function references.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rquickjs::context::EvalOptions;
use rquickjs::function::Rest;
use rquickjs::{Context, Function, Persistent, Runtime, Value as JsValue};
use serde::{Deserialize, Serialize};
use worker_bridge::{EngineError, EngineFactory, HandlerError, ScriptEngine, Value, WorkerScope};

use crate::convert::json_to_js;
use crate::error::{QuickJsError, QuickJsResult, describe_exception, exception_message};
use crate::globals;

/// A script handler stored outside of any context borrow.
pub type JsCallback = Persistent<Function<'static>>;

/// Worker-side scope of a QuickJS worker.
pub type JsScope = WorkerScope<JsCallback>;

/// Upper bound on jobs run per pump, so a job that keeps scheduling more
/// cannot starve the inbound queue.
const MAX_JOBS_PER_PUMP: usize = 1024;

/// Resource limits applied to every worker runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickJsConfig {
    /// Heap limit in bytes
    pub memory_limit: Option<usize>,
    /// Stack limit in bytes
    pub max_stack_size: Option<usize>,
}

/// Resolves a worker's source identifier to script text.
#[derive(Debug, Clone)]
pub enum ScriptLoader {
    /// The identifier is a path, relative to `base_dir` when one is set.
    Filesystem { base_dir: Option<PathBuf> },
    /// The identifier is a key into an in-memory table.
    Inline(Arc<HashMap<String, String>>),
}

impl Default for ScriptLoader {
    fn default() -> Self {
        Self::Filesystem { base_dir: None }
    }
}

impl ScriptLoader {
    pub fn load(&self, source: &str) -> QuickJsResult<String> {
        match self {
            Self::Filesystem { base_dir } => {
                let path = match base_dir {
                    Some(dir) => dir.join(source),
                    None => Path::new(source).to_path_buf(),
                };
                std::fs::read_to_string(&path).map_err(|e| QuickJsError::ScriptRead {
                    path: path.display().to_string(),
                    source: e,
                })
            }
            Self::Inline(scripts) => scripts
                .get(source)
                .cloned()
                .ok_or_else(|| QuickJsError::UnknownScript(source.to_string())),
        }
    }
}

/// Builds a QuickJS context for each worker.
#[derive(Debug, Clone, Default)]
pub struct QuickJsFactory {
    config: QuickJsConfig,
    loader: ScriptLoader,
}

impl QuickJsFactory {
    /// Factory that reads scripts from the file system.
    pub fn new(config: QuickJsConfig) -> Self {
        Self {
            config,
            loader: ScriptLoader::default(),
        }
    }

    /// Factory that resolves source identifiers against a fixed table.
    pub fn inline<I, K, V>(config: QuickJsConfig, scripts: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let scripts = scripts
            .into_iter()
            .map(|(name, code)| (name.into(), code.into()))
            .collect();
        Self {
            config,
            loader: ScriptLoader::Inline(Arc::new(scripts)),
        }
    }

    /// Resolve relative script paths against `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.loader = ScriptLoader::Filesystem {
            base_dir: Some(dir.into()),
        };
        self
    }

    pub fn config(&self) -> &QuickJsConfig {
        &self.config
    }
}

impl EngineFactory for QuickJsFactory {
    type Engine = QuickJsEngine;

    fn create(&self, scope: JsScope) -> Result<QuickJsEngine, EngineError> {
        QuickJsEngine::new(&self.config, self.loader.clone(), scope)
            .map_err(|e| EngineError::Setup(e.to_string()))
    }
}

/// A worker's QuickJS context.
pub struct QuickJsEngine {
    scope: JsScope,
    loader: ScriptLoader,
    context: Context,
    runtime: Runtime,
}

impl QuickJsEngine {
    fn new(config: &QuickJsConfig, loader: ScriptLoader, scope: JsScope) -> QuickJsResult<Self> {
        let runtime = Runtime::new().map_err(|e| QuickJsError::RuntimeCreation(e.to_string()))?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = config.max_stack_size {
            runtime.set_max_stack_size(size);
        }
        let context =
            Context::full(&runtime).map_err(|e| QuickJsError::RuntimeCreation(e.to_string()))?;

        context.with(|ctx| globals::install(&ctx, &scope))?;
        tracing::debug!("[worker:{}] QuickJS context ready", scope.id());

        Ok(Self {
            scope,
            loader,
            context,
            runtime,
        })
    }
}

impl ScriptEngine for QuickJsEngine {
    type Callback = JsCallback;

    fn load(&mut self, source: &str) -> Result<(), EngineError> {
        let load_error = |message: String| EngineError::Load {
            script: source.to_string(),
            message,
        };

        let code = self.loader.load(source).map_err(|e| load_error(e.to_string()))?;
        self.context
            .with(|ctx| {
                let mut options = EvalOptions::default();
                options.global = true;
                options.strict = false;
                options.backtrace_barrier = true;

                ctx.eval_with_options::<JsValue, _>(code, options)
                    .map(|_| ())
                    .map_err(|e| exception_message(&ctx, e))
            })
            .map_err(load_error)?;

        tracing::debug!("[worker:{}] Evaluated {}", self.scope.id(), source);
        Ok(())
    }

    fn invoke(&mut self, callback: &JsCallback, args: &[Value]) -> Result<(), HandlerError> {
        self.context.with(|ctx| {
            let function = callback
                .clone()
                .restore(&ctx)
                .map_err(|e| HandlerError::Raised(e.to_string()))?;

            let mut js_args = Vec::with_capacity(args.len());
            for arg in args {
                let value = json_to_js(&ctx, arg).map_err(|e| HandlerError::Raised(e.to_string()))?;
                js_args.push(value);
            }

            function
                .call::<_, JsValue>((Rest(js_args),))
                .map(|_| ())
                .map_err(|e| HandlerError::Raised(exception_message(&ctx, e)))
        })
    }

    fn pump(&mut self) -> Result<(), EngineError> {
        for _ in 0..MAX_JOBS_PER_PUMP {
            if !self.runtime.is_job_pending() {
                break;
            }
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    let message = self.context.with(|ctx| describe_exception(ctx.catch()));
                    tracing::warn!("[worker:{}] Pending job failed: {}", self.scope.id(), message);
                }
            }
        }
        Ok(())
    }

    fn shutdown(self) {
        self.runtime.run_gc();
        tracing::debug!("[worker:{}] QuickJS context released", self.scope.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use worker_bridge::{Bridge, BridgeError, FailureKind, LOAD_EVENT, WorkerId};

    type Log = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

    fn bridge(scripts: &[(&str, &str)]) -> Bridge<QuickJsFactory> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let scripts: Vec<(String, String)> = scripts
            .iter()
            .map(|(name, code)| (name.to_string(), code.to_string()))
            .collect();
        Bridge::new(QuickJsFactory::inline(QuickJsConfig::default(), scripts))
    }

    fn listen(bridge: &Bridge<QuickJsFactory>, id: WorkerId, log: &Log, names: &[&str]) {
        for name in names {
            let log = log.clone();
            let tag = name.to_string();
            bridge
                .subscribe_to_main(
                    id,
                    *name,
                    move |_, args| {
                        log.lock().push((tag.clone(), args.to_vec()));
                        Ok(())
                    },
                    false,
                )
                .unwrap();
        }
    }

    /// Drain the main queue until `condition` holds or five seconds pass.
    fn pump_until(bridge: &Bridge<QuickJsFactory>, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            bridge.drain_main_queue().unwrap();
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn names(log: &Log) -> Vec<String> {
        log.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    #[test]
    fn test_script_handler_replies_to_main() {
        let bridge = bridge(&[(
            "greet.js",
            "on('greet', (who) => emit('greeted', 'hello ' + who));",
        )]);
        let id = bridge.create_worker("greet.js").unwrap();
        let log: Log = Default::default();
        listen(&bridge, id, &log, &["greeted"]);

        bridge.emit_to_worker(id, "greet", vec![json!("bob")]).unwrap();
        assert!(pump_until(&bridge, || log.lock().len() == 1));
        assert_eq!(log.lock()[0].1, vec![json!("hello bob")]);
    }

    #[test]
    fn test_load_precedes_top_level_emits() {
        let bridge = bridge(&[("info.js", "emit('info', workerId, workerSource);")]);
        let id = bridge.create_worker("info.js").unwrap();
        let log: Log = Default::default();
        listen(&bridge, id, &log, &[LOAD_EVENT, "info"]);

        assert!(pump_until(&bridge, || log.lock().len() == 2));
        assert_eq!(names(&log), vec!["load", "info"]);
        assert_eq!(log.lock()[1].1, vec![json!(id.0), json!("info.js")]);
    }

    #[test]
    fn test_once_handler_fires_once() {
        let bridge = bridge(&[(
            "once.js",
            "once('ping', () => emit('pong'));\n\
             on('done', () => emit('done'));",
        )]);
        let id = bridge.create_worker("once.js").unwrap();
        let log: Log = Default::default();
        listen(&bridge, id, &log, &["pong", "done"]);

        bridge.emit_to_worker(id, "ping", vec![]).unwrap();
        bridge.emit_to_worker(id, "ping", vec![]).unwrap();
        bridge.emit_to_worker(id, "done", vec![]).unwrap();

        assert!(pump_until(&bridge, || names(&log).contains(&"done".to_string())));
        assert_eq!(names(&log), vec!["pong", "done"]);
    }

    #[test]
    fn test_off_removes_handler() {
        let bridge = bridge(&[(
            "off.js",
            "const hit = () => emit('hit');\n\
             on('x', hit);\n\
             on('stop', () => emit('stopped', off('x', hit)));\n\
             on('done', () => emit('done'));",
        )]);
        let id = bridge.create_worker("off.js").unwrap();
        let log: Log = Default::default();
        listen(&bridge, id, &log, &["hit", "stopped", "done"]);

        bridge.emit_to_worker(id, "x", vec![]).unwrap();
        bridge.emit_to_worker(id, "stop", vec![]).unwrap();
        bridge.emit_to_worker(id, "x", vec![]).unwrap();
        bridge.emit_to_worker(id, "done", vec![]).unwrap();

        assert!(pump_until(&bridge, || names(&log).contains(&"done".to_string())));
        assert_eq!(names(&log), vec!["hit", "stopped", "done"]);
        assert_eq!(log.lock()[1].1, vec![json!(true)]);
    }

    #[test]
    fn test_values_cross_the_bridge() {
        let bridge = bridge(&[("echo.js", "on('echo', (...args) => emit('echo', ...args));")]);
        let id = bridge.create_worker("echo.js").unwrap();
        let log: Log = Default::default();
        listen(&bridge, id, &log, &["echo"]);

        let args = vec![
            json!({ "a": [1, 2.5, "s", null, true] }),
            json!(5_000_000_000i64),
            json!("text"),
        ];
        bridge.emit_to_worker(id, "echo", args.clone()).unwrap();

        assert!(pump_until(&bridge, || log.lock().len() == 1));
        assert_eq!(log.lock()[0].1, args);
    }

    #[test]
    fn test_script_exception_does_not_stop_worker() {
        let bridge = bridge(&[(
            "faulty.js",
            "on('bad', () => { throw new Error('nope'); });\n\
             on('good', () => emit('ok'));",
        )]);
        let id = bridge.create_worker("faulty.js").unwrap();
        let log: Log = Default::default();
        listen(&bridge, id, &log, &["ok"]);

        bridge.emit_to_worker(id, "bad", vec![]).unwrap();
        bridge.emit_to_worker(id, "good", vec![]).unwrap();

        assert!(pump_until(&bridge, || log.lock().len() == 1));
        assert!(bridge.state(id).is_ok());
    }

    #[test]
    fn test_promise_reactions_are_pumped() {
        let bridge = bridge(&[(
            "async.js",
            "Promise.resolve(21).then((n) => emit('later', n * 2));",
        )]);
        let id = bridge.create_worker("async.js").unwrap();
        let log: Log = Default::default();
        listen(&bridge, id, &log, &["later"]);

        assert!(pump_until(&bridge, || log.lock().len() == 1));
        assert_eq!(log.lock()[0].1, vec![json!(42)]);
    }

    #[test]
    fn test_script_can_close_worker() {
        let bridge = bridge(&[("close.js", "on('bye', () => close());")]);
        let id = bridge.create_worker("close.js").unwrap();

        bridge.emit_to_worker(id, "bye", vec![]).unwrap();
        assert!(pump_until(&bridge, || matches!(
            bridge.state(id),
            Err(BridgeError::WorkerNotFound(_))
        )));
    }

    #[test]
    fn test_emit_in_same_tick_as_close_is_delivered() {
        let bridge = bridge(&[(
            "leave.js",
            "on('bye', (n) => { emit('farewell', n); close(); });",
        )]);
        let id = bridge.create_worker("leave.js").unwrap();
        let log: Log = Default::default();
        listen(&bridge, id, &log, &[LOAD_EVENT, "farewell"]);

        bridge.emit_to_worker(id, "bye", vec![json!(2)]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while bridge.state(id).is_ok() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(matches!(bridge.state(id), Err(BridgeError::WorkerNotFound(_))));

        bridge.drain_main_queue().unwrap();
        assert_eq!(names(&log), vec!["load", "farewell"]);
        assert_eq!(log.lock()[1].1, vec![json!(2)]);
    }

    /// QuickJS engine whose scheduled work panics.
    struct PanickingPump(QuickJsEngine);

    impl ScriptEngine for PanickingPump {
        type Callback = JsCallback;

        fn load(&mut self, source: &str) -> Result<(), EngineError> {
            self.0.load(source)
        }

        fn invoke(&mut self, callback: &JsCallback, args: &[Value]) -> Result<(), HandlerError> {
            self.0.invoke(callback, args)
        }

        fn pump(&mut self) -> Result<(), EngineError> {
            panic!("job queue corrupted")
        }
    }

    struct PanickingPumpFactory(QuickJsFactory);

    impl EngineFactory for PanickingPumpFactory {
        type Engine = PanickingPump;

        fn create(&self, scope: JsScope) -> Result<PanickingPump, EngineError> {
            self.0.create(scope).map(PanickingPump)
        }
    }

    #[test]
    fn test_worker_unwinding_with_script_handlers_is_clean() {
        let factory = QuickJsFactory::inline(
            QuickJsConfig::default(),
            vec![(
                "held.js".to_string(),
                "const state = { hits: 0 };
                 on('hit', () => { state.hits += 1; });
                 once('stop', () => close());"
                    .to_string(),
            )],
        );
        let fragile = Bridge::new(PanickingPumpFactory(factory));
        let id = fragile.create_worker("held.js").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while fragile.state(id).is_ok() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(matches!(fragile.state(id), Err(BridgeError::WorkerNotFound(_))));
        assert!(matches!(fragile.join(id), Err(BridgeError::ThreadPanic)));

        // The process is intact and a new runtime starts normally
        let healthy = bridge(&[("ok.js", "emit('ok');")]);
        let other = healthy.create_worker("ok.js").unwrap();
        let log: Log = Default::default();
        listen(&healthy, other, &log, &["ok"]);
        assert!(pump_until(&healthy, || log.lock().len() == 1));
    }

    #[test]
    fn test_load_failure_is_reported() {
        let bridge = bridge(&[("boom.js", "throw new Error('boom');")]);
        let mut failures = bridge.failures();
        let id = bridge.create_worker("boom.js").unwrap();

        let mut failure = None;
        assert!(pump_until(&bridge, || {
            failure = failures.try_recv().ok();
            failure.is_some()
        }));
        let failure = failure.unwrap();
        assert_eq!(failure.worker, id);
        assert_eq!(failure.kind, FailureKind::Load);
        assert!(failure.message.contains("boom"), "{}", failure.message);
    }

    #[test]
    fn test_missing_script_is_a_load_failure() {
        let bridge = bridge(&[]);
        let mut failures = bridge.failures();
        bridge.create_worker("missing.js").unwrap();

        let mut failure = None;
        assert!(pump_until(&bridge, || {
            failure = failures.try_recv().ok();
            failure.is_some()
        }));
        let failure = failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Load);
        assert!(failure.message.contains("missing.js"), "{}", failure.message);
    }

    #[test]
    fn test_filesystem_loader_reports_path() {
        let loader = ScriptLoader::Filesystem {
            base_dir: Some(PathBuf::from("/nonexistent-worker-scripts")),
        };
        let err = loader.load("main.js").unwrap_err();
        assert!(matches!(err, QuickJsError::ScriptRead { .. }));
        assert!(err.to_string().contains("main.js"));
    }
}
