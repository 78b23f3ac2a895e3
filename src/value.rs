//! Conversion between engine values and JSON trees.
//!
//! The mapping is: boolean ↔ bool, integer ↔ integer number, number ↔ double,
//! string ↔ UTF-8 string, sequence table ↔ array, any other table ↔ object.
//! Nothing else converts; functions, threads and userdata are conversion
//! errors, as are non-finite floats and non-UTF-8 strings.
//!
//! JSON `null` maps to the engine's null sentinel (`lua.null()`), not to nil:
//! setting a table slot to nil deletes it, so a null inside an array or
//! object would otherwise vanish on the way in. Both nil and the sentinel
//! read back as `null`.
//!
//! A table counts as a sequence when its keys are exactly 1..=n for some
//! n >= 1. An empty table therefore reads back as an empty object. Object key
//! order follows the engine's enumeration order and is not stable across
//! runs. Conversion recurses over the value graph and does not detect
//! reference cycles; a cyclic table will recurse without bound.

use crate::error::{ErrorKind, Result};
use mlua::{Lua, LuaSerdeExt, Table, Value};
use serde_json::Value as Json;

pub fn to_json(value: &Value) -> Result<Json> {
  match value {
    Value::Nil => Ok(Json::Null),
    Value::LightUserData(ud) if ud.0.is_null() => Ok(Json::Null),
    Value::Boolean(b) => Ok(Json::Bool(*b)),
    Value::Integer(i) => Ok(Json::from(*i)),
    Value::Number(n) => serde_json::Number::from_f64(*n)
      .map(Json::Number)
      .ok_or_else(|| ErrorKind::TypeCoercion { from: "non-finite number", to: "JSON number" }.into()),
    Value::String(s) => {
      let s = (s.to_str()).map_err(|_| ErrorKind::TypeCoercion {
        from: "non-UTF-8 string",
        to: "JSON string",
      })?;
      Ok(Json::String(s.to_owned()))
    }
    Value::Table(table) => {
      if is_sequence(table) {
        let mut items = Vec::with_capacity(table.raw_len() as usize);
        for item in table.clone().sequence_values::<Value>() {
          items.push(to_json(&item?)?);
        }
        Ok(Json::Array(items))
      } else {
        let mut map = serde_json::Map::new();
        for pair in table.clone().pairs::<Value, Value>() {
          let (key, value) = pair?;
          let key = match &key {
            Value::String(s) => (s.to_str())
              .map_err(|_| ErrorKind::TypeCoercion {
                from: "non-UTF-8 string",
                to: "object key",
              })?
              .to_owned(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            other => {
              return Err(
                ErrorKind::TypeCoercion { from: other.type_name(), to: "object key" }.into(),
              )
            }
          };
          map.insert(key, to_json(&value)?);
        }
        Ok(Json::Object(map))
      }
    }
    other => Err(ErrorKind::TypeCoercion { from: other.type_name(), to: "JSON value" }.into()),
  }
}

pub fn from_json<'lua>(lua: &'lua Lua, json: &Json) -> Result<Value<'lua>> {
  match json {
    Json::Null => Ok(lua.null()),
    Json::Bool(b) => Ok(Value::Boolean(*b)),
    Json::Number(n) => {
      if let Some(i) = n.as_i64() {
        Ok(Value::Integer(i))
      } else {
        let n = (n.as_f64()).ok_or(ErrorKind::TypeCoercion {
          from: "JSON number",
          to: "number",
        })?;
        Ok(Value::Number(n))
      }
    }
    Json::String(s) => Ok(Value::String(lua.create_string(s)?)),
    Json::Array(items) => {
      let table = lua.create_table_with_capacity(items.len() as i32, 0)?;
      for (i, item) in items.iter().enumerate() {
        table.raw_set(i as i64 + 1, from_json(lua, item)?)?;
      }
      Ok(Value::Table(table))
    }
    Json::Object(map) => {
      let table = lua.create_table_with_capacity(0, map.len() as i32)?;
      for (key, value) in map {
        table.raw_set(key.as_str(), from_json(lua, value)?)?;
      }
      Ok(Value::Table(table))
    }
  }
}

/// Whether a table's keys are exactly 1..=n for some n >= 1.
pub(crate) fn is_sequence(table: &Table) -> bool {
  let len = table.raw_len();
  if len == 0 {
    return false;
  }
  let mut count = 0i64;
  for pair in table.clone().pairs::<Value, Value>() {
    match pair {
      Ok((Value::Integer(i), _)) if i >= 1 && i <= len => count += 1,
      _ => return false,
    }
  }
  count == len
}
