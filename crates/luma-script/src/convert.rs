//! Structural conversion between native values and Lua values

use luma_core::Value;
use mlua::Lua;
use std::collections::HashMap;

/// Convert a native value into a Lua value.
///
/// Maps become tables, lists become 1-indexed tables, byte sequences
/// become binary-safe Lua strings.
pub fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Int(i) => mlua::Value::Integer(*i),
        Value::Float(f) => mlua::Value::Number(*f),
        Value::Str(s) => mlua::Value::String(lua.create_string(s)?),
        Value::Bytes(b) => mlua::Value::String(lua.create_string(b)?),
        Value::List(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Map(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), to_lua(lua, v)?)?;
            }
            mlua::Value::Table(table)
        }
    })
}

/// Convert a Lua value into a native value. Total: values with no native
/// shape (functions, userdata, threads) collapse to null.
///
/// A table with positive integer keys is treated as a list sized by its
/// largest index; anything else keeps its string keys.
pub fn from_lua(value: &mlua::Value) -> Value {
    match value {
        mlua::Value::Nil => Value::Null,
        mlua::Value::Boolean(b) => Value::Bool(*b),
        mlua::Value::Integer(i) => Value::Int(*i),
        mlua::Value::Number(n) => Value::Float(*n),
        mlua::Value::String(s) => match s.to_str() {
            Ok(text) => Value::Str(text.to_string()),
            Err(_) => Value::Bytes(s.as_bytes().to_vec()),
        },
        mlua::Value::Table(table) => {
            let mut max_index: i64 = 0;
            let mut entries: Vec<(mlua::Value, Value)> = Vec::new();
            for pair in table.clone().pairs::<mlua::Value, mlua::Value>().flatten() {
                let (key, val) = pair;
                if let mlua::Value::Integer(i) = key {
                    if i > max_index {
                        max_index = i;
                    }
                }
                entries.push((key, from_lua(&val)));
            }

            if max_index > 0 {
                let mut items = vec![Value::Null; max_index as usize];
                for (key, val) in entries {
                    if let mlua::Value::Integer(i) = key {
                        if i >= 1 {
                            items[(i - 1) as usize] = val;
                        }
                    }
                }
                Value::List(items)
            } else {
                let mut map = HashMap::new();
                for (key, val) in entries {
                    if let mlua::Value::String(s) = key {
                        if let Ok(text) = s.to_str() {
                            map.insert(text.to_string(), val);
                        }
                    }
                }
                Value::Map(map)
            }
        }
        _ => Value::Null,
    }
}
