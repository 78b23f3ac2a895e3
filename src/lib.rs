//! Embeds Lua engines in a host process behind a bounded pool, so that any
//! number of host threads can run scripts, exchange values and register
//! native callbacks while each engine's state stays confined to the one
//! thread that owns it.
//!
//! Every engine runs on its own executor thread, draining a FIFO task queue;
//! callers block on a reply channel while their task executes. Values live
//! inside the engine and are reached only through [`ValueHandle`] proxies,
//! whose accessors marshal onto the owning executor. [`EnginePool::acquire`]
//! hands out engines one checkout at a time with a fresh context each time.
//!
//! ```no_run
//! use luapool::EnginePool;
//!
//! # fn main() -> luapool::Result<()> {
//! let pool = EnginePool::new(2)?;
//! let engine = pool.acquire()?;
//! engine.register_callback("add", |args| {
//!   let (a, b) = (args[0].as_i64().unwrap_or(0), args[1].as_i64().unwrap_or(0));
//!   Ok(serde_json::json!(a + b))
//! })?;
//! let value = engine.execute("return add(2, 3)")?;
//! assert_eq!(value.get::<i64>()?, 5);
//! # Ok(())
//! # }
//! ```

pub mod value;

mod callback;
mod config;
mod context;
mod engine;
mod error;
mod executor;
mod handle;
mod pool;
mod task;

#[cfg(test)]
mod tests;

pub use callback::NativeCallback;
pub use config::Config;
pub use context::LogSink;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use handle::{FromScript, ToScript, ValueHandle, ValueKind};
pub use pool::{EngineGuard, EnginePool};

pub use mlua;
pub use serde_json;
