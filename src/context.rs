use crate::error::Result;
use log::info;
use mlua::{Function, Lua, MultiValue, RegistryKey, Table};
use std::sync::Arc;

/// Receives one line per script `print` call.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) fn default_log_sink() -> LogSink {
  Arc::new(|line| info!(target: "luapool::script", "{line}"))
}

/// One execution context: a fresh environment table that falls back to the
/// engine's globals for reads, while all writes stay local. Rebuilt on every
/// reset, so scripts from a previous checkout leave nothing behind.
pub(crate) struct ScriptContext {
  env: RegistryKey,
  generation: u64,
}

impl ScriptContext {
  pub(crate) fn create(lua: &Lua, sink: LogSink, generation: u64) -> Result<Self> {
    let env = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.raw_set("__index", lua.globals())?;
    env.set_metatable(Some(meta));
    install_print(lua, &env, sink)?;
    let env = lua.create_registry_value(env)?;
    Ok(Self { env, generation })
  }

  pub(crate) fn env<'lua>(&self, lua: &'lua Lua) -> Result<Table<'lua>> {
    Ok(lua.registry_value(&self.env)?)
  }

  pub(crate) fn generation(&self) -> u64 {
    self.generation
  }

  pub(crate) fn dispose(self, lua: &Lua) -> Result<()> {
    lua.remove_registry_value(self.env)?;
    Ok(())
  }
}

/// Replaces `print` in the environment with one that joins its arguments
/// with tabs, like the stock implementation, and hands the line to the sink.
pub(crate) fn install_print(lua: &Lua, env: &Table, sink: LogSink) -> mlua::Result<()> {
  let tostring: Function = lua.globals().raw_get("tostring")?;
  let print = lua.create_function(move |_lua, (tostring, args): (Function, MultiValue)| {
    let mut line = String::new();
    for (i, value) in args.into_iter().enumerate() {
      let piece: mlua::String = tostring.call(value)?;
      if i > 0 {
        line.push('\t');
      }
      line.push_str(&String::from_utf8_lossy(piece.as_bytes()));
    }
    sink(&line);
    Ok(())
  })?;
  env.raw_set("print", print.bind(tostring)?)?;
  Ok(())
}
