//! QuickJS engine for the worker bridge.
//!
//! Plugs a QuickJS context into [`worker_bridge`] through its engine seam.
//! Worker scripts see a small event API:
//!
//! ```js
//! on("greet", (who) => emit("greeted", "hello " + who));
//! once("stop", () => close());
//! console.log("worker", workerId, "loaded from", workerSource);
//! ```

mod convert;
mod engine;
mod error;
mod globals;

pub use convert::{js_to_json, json_to_js};
pub use engine::{JsCallback, JsScope, QuickJsConfig, QuickJsEngine, QuickJsFactory, ScriptLoader};
pub use error::{QuickJsError, QuickJsResult};
