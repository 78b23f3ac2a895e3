use crate::callback::NativeCallback;
use crate::context::LogSink;
use crate::error::{ErrorKind, Result};
use crate::executor::EngineShared;
use crate::handle::ValueHandle;
use mlua::RegistryKey;
use serde_json::Value as Json;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// One pooled scripting engine. All methods marshal onto the engine's
/// executor thread and block until the task has run; calls from different
/// threads execute in a single FIFO order, never concurrently.
pub struct Engine {
  shared: Arc<EngineShared>,
}

impl Engine {
  pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
    Self { shared }
  }

  pub fn name(&self) -> &str {
    self.shared.name()
  }

  /// Compiles and runs a chunk in the current context, returning a handle to
  /// the value it returned (`Nil` for a chunk without a `return`).
  pub fn execute(&self, code: impl Into<String>) -> Result<ValueHandle> {
    let code = code.into();
    let shared = self.shared.clone();
    let (key, kind) = self.shared.request(move |core| core.execute(&code, "@[script]"))?;
    Ok(ValueHandle::new(shared, key, kind))
  }

  /// Evaluates a single expression, e.g. `"{a = 1, b = {1, 2, 3}}"`.
  pub fn create_value(&self, expression: impl Into<String>) -> Result<ValueHandle> {
    let expression = expression.into();
    let shared = self.shared.clone();
    let (key, kind) = self.shared.request(move |core| core.create_value(&expression))?;
    Ok(ValueHandle::new(shared, key, kind))
  }

  /// Calls a global function of the current context. Arguments must be
  /// handles owned by this engine.
  pub fn call_function(&self, name: &str, args: &[ValueHandle]) -> Result<ValueHandle> {
    for arg in args {
      if !arg.owned_by(&self.shared) {
        return Err(ErrorKind::ForeignHandle.into());
      }
    }
    let keys: Vec<Arc<RegistryKey>> = args.iter().map(|arg| arg.registry_key().clone()).collect();
    let name = name.to_owned();
    let shared = self.shared.clone();
    let (key, kind) = self.shared.request(move |core| core.call_function(&name, &keys))?;
    Ok(ValueHandle::new(shared, key, kind))
  }

  /// Exposes a native function to scripts under the given global name; the
  /// last registration wins on a collision. Registrations do not survive
  /// [`reset`](Self::reset).
  ///
  /// The callback runs on the executor thread while a script is in flight,
  /// so it must not call back into this engine or drop the last clone of one
  /// of its value handles while blocking on the result; there is no second
  /// thread to serve such a request.
  pub fn register_callback<F>(&self, name: &str, callback: F) -> Result<()>
  where
    F: Fn(&[Json]) -> std::result::Result<Json, String> + Send + Sync + 'static,
  {
    let name = name.to_owned();
    let callback: NativeCallback = Arc::new(callback);
    self.shared.request(move |core| core.register_callback(name, callback))
  }

  /// Clears callbacks and builds a fresh execution context. Values created
  /// under the old context remain usable through their handles.
  pub fn reset(&self) -> Result<()> {
    self.shared.request(|core| core.reset())
  }

  /// Replaces the sink receiving script `print` output. The default routes
  /// to `log::info!(target: "luapool::script")`.
  pub fn set_log_sink(&self, sink: impl Fn(&str) + Send + Sync + 'static) -> Result<()> {
    let sink: LogSink = Arc::new(sink);
    self.shared.request(move |core| core.set_log_sink(sink))
  }
}

impl Debug for Engine {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Engine").field("name", &self.name()).finish()
  }
}
