use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Number of engines in the pool, one executor thread each.
  pub pool_size: usize,
  /// Prefix for executor thread names; the engine index is appended.
  pub thread_name: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      pool_size: num_cpus::get(),
      thread_name: "luapool-worker".into(),
    }
  }
}
