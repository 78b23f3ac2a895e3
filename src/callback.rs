use crate::value;
use log::trace;
use mlua::{Function, Lua, MultiValue, Table};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;

/// A native function exposed to scripts. Arguments arrive as JSON trees and
/// the return value travels back the same way; a `Err(message)` surfaces in
/// the script as a runtime error.
///
/// The `'static` bound means a callback owns everything it captures; state
/// shared with the host goes through `Arc`.
pub type NativeCallback = Arc<dyn Fn(&[Json]) -> Result<Json, String> + Send + Sync>;

/// Per-engine name → native function table. Lives inside the engine core and
/// is only ever touched from the executor thread, so it needs no locking;
/// mutation arrives as tasks like everything else.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
  entries: HashMap<String, NativeCallback>,
}

impl CallbackRegistry {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Last write wins on a name collision.
  pub(crate) fn register(&mut self, name: String, callback: NativeCallback) {
    self.entries.insert(name, callback);
  }

  pub(crate) fn clear(&mut self) {
    self.entries.clear();
  }

  /// Installs every entry as a global function in the given environment.
  pub(crate) fn expose(&self, lua: &Lua, env: &Table) -> mlua::Result<()> {
    for (name, callback) in &self.entries {
      trace!("exposing callback '{name}'");
      let function = create_script_fn(lua, name.clone(), callback.clone())?;
      env.raw_set(name.as_str(), function)?;
    }
    Ok(())
  }
}

fn create_script_fn<'lua>(
  lua: &'lua Lua,
  name: String,
  callback: NativeCallback,
) -> mlua::Result<Function<'lua>> {
  lua.create_function(move |lua, args: MultiValue| {
    let mut json_args = Vec::with_capacity(args.len());
    for value in args {
      json_args.push(value::to_json(&value).map_err(mlua::Error::external)?);
    }
    let result = callback(&json_args)
      .map_err(|message| mlua::Error::external(format!("callback '{name}' failed: {message}")))?;
    value::from_json(lua, &result).map_err(mlua::Error::external)
  })
}
