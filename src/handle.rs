//! Cross-thread proxies to values living inside one engine.
//!
//! A [`ValueHandle`] never dereferences its underlying value directly; every
//! accessor submits a task to the owning executor and blocks on the reply.
//! The raw value stays in the engine's registry, which only the executor
//! thread can reach, so confinement is enforced by construction rather than
//! by convention.

use crate::error::{ErrorKind, Result};
use crate::executor::EngineShared;
use crate::value;
use mlua::{Lua, RegistryKey, Table, Value};
use serde_json::Value as Json;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Closed set of value kinds, cached on the handle when it is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
  Nil,
  Boolean,
  Number,
  String,
  Array,
  Object,
  Function,
  Thread,
  UserData,
}

impl ValueKind {
  pub(crate) fn of(value: &Value) -> Self {
    match value {
      Value::Nil => Self::Nil,
      // the serializer's null sentinel reads as nil
      Value::LightUserData(ud) if ud.0.is_null() => Self::Nil,
      Value::Boolean(_) => Self::Boolean,
      Value::Integer(_) | Value::Number(_) => Self::Number,
      Value::String(_) => Self::String,
      Value::Table(t) => {
        if value::is_sequence(t) {
          Self::Array
        } else {
          Self::Object
        }
      }
      Value::Function(_) => Self::Function,
      Value::Thread(_) => Self::Thread,
      Value::LightUserData(_) | Value::UserData(_) | Value::Error(_) => Self::UserData,
    }
  }

  pub fn is_indexable(self) -> bool {
    matches!(self, Self::Array | Self::Object)
  }
}

impl Display for ValueKind {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let name = match self {
      Self::Nil => "nil",
      Self::Boolean => "boolean",
      Self::Number => "number",
      Self::String => "string",
      Self::Array => "array",
      Self::Object => "object",
      Self::Function => "function",
      Self::Thread => "thread",
      Self::UserData => "userdata",
    };
    f.write_str(name)
  }
}

/// Converts an engine value into a native type on the executor thread.
///
/// Coercions follow the engine's own rules: any value has a truthiness, so
/// `bool` never fails; numbers and numeric strings coerce to integers
/// (truncating) and floats; numbers and booleans stringify. The serializer's
/// null sentinel counts as nil. Everything else is a `TypeCoercion` error.
pub trait FromScript: Sized + Send + 'static {
  fn from_script(lua: &Lua, value: Value) -> Result<Self>;
}

/// Converts a native type into an engine value on the executor thread.
pub trait ToScript: Send + 'static {
  fn to_script<'lua>(self, lua: &'lua Lua) -> Result<Value<'lua>>;
}

fn coerce_integer(value: &Value) -> Option<i64> {
  match value {
    Value::Integer(i) => Some(*i),
    Value::Number(n) => Some(*n as i64),
    Value::String(s) => {
      let s = s.to_str().ok()?.trim();
      (s.parse::<i64>().ok()).or_else(|| s.parse::<f64>().ok().map(|n| n as i64))
    }
    _ => None,
  }
}

fn coerce_number(value: &Value) -> Option<f64> {
  match value {
    Value::Integer(i) => Some(*i as f64),
    Value::Number(n) => Some(*n),
    Value::String(s) => s.to_str().ok()?.trim().parse().ok(),
    _ => None,
  }
}

impl FromScript for bool {
  fn from_script(_lua: &Lua, value: Value) -> Result<Self> {
    let falsy = match value {
      Value::Nil | Value::Boolean(false) => true,
      Value::LightUserData(ud) => ud.0.is_null(),
      _ => false,
    };
    Ok(!falsy)
  }
}

macro_rules! impl_from_script_int {
  ($($ty:ty)*) => {$(
    impl FromScript for $ty {
      fn from_script(_lua: &Lua, value: Value) -> Result<Self> {
        let from = value.type_name();
        (coerce_integer(&value))
          .and_then(|i| <$ty>::try_from(i).ok())
          .ok_or_else(|| ErrorKind::TypeCoercion { from, to: stringify!($ty) }.into())
      }
    }
  )*};
}

impl_from_script_int!(i8 i16 i32 i64 u8 u16 u32 u64 isize usize);

macro_rules! impl_from_script_float {
  ($($ty:ty)*) => {$(
    impl FromScript for $ty {
      fn from_script(_lua: &Lua, value: Value) -> Result<Self> {
        let from = value.type_name();
        (coerce_number(&value))
          .map(|n| n as $ty)
          .ok_or_else(|| ErrorKind::TypeCoercion { from, to: stringify!($ty) }.into())
      }
    }
  )*};
}

impl_from_script_float!(f32 f64);

impl FromScript for String {
  fn from_script(_lua: &Lua, value: Value) -> Result<Self> {
    let from = value.type_name();
    match value {
      Value::String(s) => {
        let s = (s.to_str()).map_err(|_| ErrorKind::TypeCoercion {
          from: "non-UTF-8 string",
          to: "String",
        })?;
        Ok(s.to_owned())
      }
      Value::Integer(i) => Ok(i.to_string()),
      Value::Number(n) => Ok(n.to_string()),
      Value::Boolean(b) => Ok(b.to_string()),
      _ => Err(ErrorKind::TypeCoercion { from, to: "String" }.into()),
    }
  }
}

impl<T: FromScript> FromScript for Vec<T> {
  fn from_script(lua: &Lua, value: Value) -> Result<Self> {
    let from = value.type_name();
    let table = match value {
      Value::Table(table) => table,
      _ => return Err(ErrorKind::TypeCoercion { from, to: "list" }.into()),
    };
    let mut items = Vec::with_capacity(table.raw_len() as usize);
    for item in table.sequence_values::<Value>() {
      items.push(T::from_script(lua, item?)?);
    }
    Ok(items)
  }
}

impl FromScript for Json {
  fn from_script(_lua: &Lua, value: Value) -> Result<Self> {
    value::to_json(&value)
  }
}

impl ToScript for bool {
  fn to_script<'lua>(self, _lua: &'lua Lua) -> Result<Value<'lua>> {
    Ok(Value::Boolean(self))
  }
}

macro_rules! impl_to_script_int {
  ($($ty:ty)*) => {$(
    impl ToScript for $ty {
      fn to_script<'lua>(self, _lua: &'lua Lua) -> Result<Value<'lua>> {
        match i64::try_from(self) {
          Ok(i) => Ok(Value::Integer(i)),
          Err(_) => Ok(Value::Number(self as f64)),
        }
      }
    }
  )*};
}

impl_to_script_int!(i8 i16 i32 i64 u8 u16 u32 u64 isize usize);

macro_rules! impl_to_script_float {
  ($($ty:ty)*) => {$(
    impl ToScript for $ty {
      fn to_script<'lua>(self, _lua: &'lua Lua) -> Result<Value<'lua>> {
        Ok(Value::Number(self as f64))
      }
    }
  )*};
}

impl_to_script_float!(f32 f64);

impl ToScript for String {
  fn to_script<'lua>(self, lua: &'lua Lua) -> Result<Value<'lua>> {
    Ok(Value::String(lua.create_string(&self)?))
  }
}

impl ToScript for &'static str {
  fn to_script<'lua>(self, lua: &'lua Lua) -> Result<Value<'lua>> {
    Ok(Value::String(lua.create_string(self)?))
  }
}

impl ToScript for Json {
  fn to_script<'lua>(self, lua: &'lua Lua) -> Result<Value<'lua>> {
    value::from_json(lua, &self)
  }
}

impl<T: ToScript> ToScript for Vec<T> {
  fn to_script<'lua>(self, lua: &'lua Lua) -> Result<Value<'lua>> {
    let table = lua.create_table_with_capacity(self.len() as i32, 0)?;
    for (i, item) in self.into_iter().enumerate() {
      table.raw_set(i as i64 + 1, item.to_script(lua)?)?;
    }
    Ok(Value::Table(table))
  }
}

/// Reference-counted proxy to a value inside one specific engine.
///
/// Handles are `Send + Sync` and usable from any thread; each operation runs
/// as a task on the owning executor. Dropping the last handle to a value
/// schedules its release on that executor and waits for the acknowledgement.
/// If the executor has already stopped, or the drop happens on the executor
/// thread itself (inside a callback), the cross-thread round trip is skipped
/// and the registry slot is reclaimed with the engine state.
pub struct ValueHandle {
  shared: Arc<EngineShared>,
  key: Option<Arc<RegistryKey>>,
  kind: ValueKind,
}

impl ValueHandle {
  pub(crate) fn new(shared: Arc<EngineShared>, key: RegistryKey, kind: ValueKind) -> Self {
    Self { shared, key: Some(Arc::new(key)), kind }
  }

  /// The value's kind, cached at creation; no round trip.
  pub fn kind(&self) -> ValueKind {
    self.kind
  }

  /// Name of the owning engine.
  pub fn engine_name(&self) -> &str {
    self.shared.name()
  }

  pub(crate) fn registry_key(&self) -> &Arc<RegistryKey> {
    self.key.as_ref().unwrap()
  }

  pub(crate) fn owned_by(&self, shared: &Arc<EngineShared>) -> bool {
    Arc::ptr_eq(&self.shared, shared)
  }

  /// Converts the whole value to `T`.
  pub fn get<T: FromScript>(&self) -> Result<T> {
    let key = self.registry_key().clone();
    self.shared.request(move |core| {
      let value: Value = core.lua().registry_value(&key)?;
      T::from_script(core.lua(), value)
    })
  }

  /// Reads property `key`. Fails with `PropertyAccess` when the value is not
  /// an array or object, or when the property is absent.
  pub fn get_key<T: FromScript>(&self, key: &str) -> Result<T> {
    self.ensure_indexable(key)?;
    let key = key.to_owned();
    let reg = self.registry_key().clone();
    self.shared.request(move |core| {
      let table: Table = core.lua().registry_value(&reg)?;
      let value: Value = table.raw_get(key.as_str())?;
      if let Value::Nil = value {
        return Err(ErrorKind::PropertyAccess { key, reason: "no such property".into() }.into());
      }
      T::from_script(core.lua(), value)
    })
  }

  /// Writes property `key`. Fails with `PropertyAccess` when the value is
  /// not an array or object.
  pub fn set_key(&self, key: &str, value: impl ToScript) -> Result<()> {
    self.ensure_indexable(key)?;
    let key = key.to_owned();
    let reg = self.registry_key().clone();
    self.shared.request(move |core| {
      let table: Table = core.lua().registry_value(&reg)?;
      let value = value.to_script(core.lua())?;
      table.raw_set(key.as_str(), value)?;
      Ok(())
    })
  }

  /// Reads element `index` (1-based, like the engine's own indexing).
  pub fn get_index<T: FromScript>(&self, index: usize) -> Result<T> {
    self.ensure_indexable(&index.to_string())?;
    let reg = self.registry_key().clone();
    self.shared.request(move |core| {
      let table: Table = core.lua().registry_value(&reg)?;
      let value: Value = table.raw_get(index as i64)?;
      if let Value::Nil = value {
        return Err(
          ErrorKind::PropertyAccess {
            key: index.to_string(),
            reason: "no such element".into(),
          }
          .into(),
        );
      }
      T::from_script(core.lua(), value)
    })
  }

  /// Writes element `index` (1-based).
  pub fn set_index(&self, index: usize, value: impl ToScript) -> Result<()> {
    self.ensure_indexable(&index.to_string())?;
    let reg = self.registry_key().clone();
    self.shared.request(move |core| {
      let table: Table = core.lua().registry_value(&reg)?;
      let value = value.to_script(core.lua())?;
      table.raw_set(index as i64, value)?;
      Ok(())
    })
  }

  /// Deep conversion of the whole value graph into a JSON tree. See the
  /// [`value`](crate::value) module for the mapping and its caveats (object
  /// key order is not stable; cycles are not detected).
  pub fn to_json(&self) -> Result<Json> {
    let key = self.registry_key().clone();
    self.shared.request(move |core| {
      let value: Value = core.lua().registry_value(&key)?;
      value::to_json(&value)
    })
  }

  fn ensure_indexable(&self, key: &str) -> Result<()> {
    if self.kind.is_indexable() {
      Ok(())
    } else {
      Err(
        ErrorKind::PropertyAccess {
          key: key.to_owned(),
          reason: format!("target is a {} value, not an array or object", self.kind),
        }
        .into(),
      )
    }
  }
}

impl Clone for ValueHandle {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
      key: self.key.clone(),
      kind: self.kind,
    }
  }
}

impl Debug for ValueHandle {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ValueHandle")
      .field("engine", &self.shared.name())
      .field("kind", &self.kind)
      .finish()
  }
}

impl Drop for ValueHandle {
  fn drop(&mut self) {
    let Some(key) = self.key.take() else { return };
    // A stopped executor reclaims the whole registry with the state, and a
    // drop on the executor thread itself must not wait on its own queue;
    // both cases fall back to dropping the key locally.
    if self.shared.is_stopped() || self.shared.on_executor_thread() {
      return;
    }
    let (tx, rx) = oneshot::channel();
    let submitted = self.shared.submit(Box::new(move |core| {
      drop(key);
      core.expire_registry_values();
      let _ = tx.send(());
    }));
    if submitted.is_ok() {
      // An executor stopping mid-flight drops the task, which still drops
      // the key; the reply channel closing unblocks us either way.
      let _ = rx.blocking_recv();
    }
  }
}
