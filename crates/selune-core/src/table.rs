//! Hybrid array+hash table for Lua.

use crate::gc::GcIdx;
use crate::object::ObjRef;
use crate::string::LuaString;
use crate::value::Value;
use indexmap::IndexMap;

/// A key in the hash part of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    String(GcIdx<LuaString>),
    /// Float key, stored as raw bits for hashing.
    Float(u64),
    Boolean(bool),
    LightUserData(usize),
    /// Any other collectable object, keyed by identity.
    Object(ObjRef),
}

impl TableKey {
    /// Normalize a value into a hash key. Nil and NaN are not valid keys;
    /// floats with an integral value become integer keys.
    pub fn from_value(v: Value) -> Option<TableKey> {
        match v {
            Value::Nil => None,
            Value::Int(i) => Some(TableKey::Integer(i)),
            Value::Float(f) => {
                if f.is_nan() {
                    None
                } else if f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
                    Some(TableKey::Integer(f as i64))
                } else {
                    Some(TableKey::Float(f.to_bits()))
                }
            }
            Value::Bool(b) => Some(TableKey::Boolean(b)),
            Value::LightUserData(p) => Some(TableKey::LightUserData(p)),
            Value::String(s) => Some(TableKey::String(s)),
            other => other.as_object().map(TableKey::Object),
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            TableKey::Integer(i) => Value::Int(i),
            TableKey::String(s) => Value::String(s),
            TableKey::Float(bits) => Value::Float(f64::from_bits(bits)),
            TableKey::Boolean(b) => Value::Bool(b),
            TableKey::LightUserData(p) => Value::LightUserData(p),
            // Keys are built from values, so the object is always value-kind.
            TableKey::Object(r) => r.to_value().unwrap_or(Value::Nil),
        }
    }
}

/// A Lua table: hybrid array + hash map.
#[derive(Default)]
pub struct Table {
    /// Array part (1-indexed: array[0] corresponds to key 1).
    array: Vec<Value>,
    /// Hash part for non-sequential keys (insertion-order preserving).
    hash: IndexMap<TableKey, Value>,
    pub metatable: Option<GcIdx<Table>>,
}

impl Table {
    /// Create a new empty table with size hints.
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    /// Raw get by value key.
    pub fn raw_get(&self, key: Value) -> Value {
        match TableKey::from_value(key) {
            Some(TableKey::Integer(i)) => self.raw_geti(i),
            Some(tk) => self.hash.get(&tk).copied().unwrap_or_default(),
            None => Value::Nil,
        }
    }

    /// Raw set by value key.
    pub fn raw_set(&mut self, key: Value, value: Value) -> Result<(), &'static str> {
        match TableKey::from_value(key) {
            None if key.is_nil() => Err("table index is nil"),
            None => Err("table index is NaN"),
            Some(TableKey::Integer(i)) => {
                self.raw_seti(i, value);
                Ok(())
            }
            Some(tk) => {
                if value.is_nil() {
                    self.hash.shift_remove(&tk);
                } else {
                    self.hash.insert(tk, value);
                }
                Ok(())
            }
        }
    }

    /// Fast integer get (1-indexed).
    pub fn raw_geti(&self, key: i64) -> Value {
        if key >= 1 && (key as usize) <= self.array.len() {
            self.array[(key - 1) as usize]
        } else {
            self.hash
                .get(&TableKey::Integer(key))
                .copied()
                .unwrap_or_default()
        }
    }

    /// Fast integer set (1-indexed).
    pub fn raw_seti(&mut self, key: i64, value: Value) {
        if key >= 1 {
            let idx = (key - 1) as usize;
            if idx < self.array.len() {
                self.array[idx] = value;
                return;
            }
            if idx == self.array.len() && !value.is_nil() {
                self.array.push(value);
                self.rehash_from_hash_to_array();
                return;
            }
        }
        if value.is_nil() {
            self.hash.shift_remove(&TableKey::Integer(key));
        } else {
            self.hash.insert(TableKey::Integer(key), value);
        }
    }

    /// Fast string key get.
    pub fn raw_get_str(&self, key: GcIdx<LuaString>) -> Value {
        self.hash
            .get(&TableKey::String(key))
            .copied()
            .unwrap_or_default()
    }

    /// Fast string key set.
    pub fn raw_set_str(&mut self, key: GcIdx<LuaString>, value: Value) {
        if value.is_nil() {
            self.hash.shift_remove(&TableKey::String(key));
        } else {
            self.hash.insert(TableKey::String(key), value);
        }
    }

    /// Get the "length" of a table (boundary for array part).
    /// Returns the largest n such that t[n] is non-nil and t[n+1] is nil.
    pub fn length(&self) -> i64 {
        match self.array.last() {
            None => 0,
            Some(v) if !v.is_nil() => self.array.len() as i64,
            Some(_) => {
                // Binary search for boundary
                let mut lo = 0usize;
                let mut hi = self.array.len();
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    if self.array[mid].is_nil() {
                        hi = mid;
                    } else {
                        lo = mid + 1;
                    }
                }
                lo as i64
            }
        }
    }

    /// Get the next key-value pair after `key` (for iteration).
    /// Returns Ok(Some(k,v)) for next pair, Ok(None) for end of iteration,
    /// Err(()) for invalid key (key not found in table).
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: Value) -> Result<Option<(Value, Value)>, ()> {
        let array_start = match TableKey::from_value(key) {
            None if key.is_nil() => 0,
            None => return Err(()),
            Some(TableKey::Integer(i)) if i >= 1 && (i as usize) <= self.array.len() => i as usize,
            Some(tk) => {
                let pos = self.hash.get_index_of(&tk).ok_or(())?;
                return Ok(self.next_hash_from(pos + 1));
            }
        };
        for j in array_start..self.array.len() {
            if !self.array[j].is_nil() {
                return Ok(Some((Value::Int((j + 1) as i64), self.array[j])));
            }
        }
        Ok(self.next_hash_from(0))
    }

    fn next_hash_from(&self, start: usize) -> Option<(Value, Value)> {
        self.hash
            .get_range(start..)?
            .iter()
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.to_value(), *v))
    }

    /// Move consecutive integer entries from hash into array.
    fn rehash_from_hash_to_array(&mut self) {
        let mut next_idx = self.array.len() as i64 + 1;
        while let Some(v) = self.hash.shift_remove(&TableKey::Integer(next_idx)) {
            self.array.push(v);
            next_idx += 1;
        }
    }

    /// The array part, holes included.
    pub fn array_values(&self) -> &[Value] {
        &self.array
    }

    /// Hash entries in insertion order.
    pub fn hash_entries(&self) -> impl Iterator<Item = (&TableKey, &Value)> {
        self.hash.iter()
    }

    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    pub fn hash_len(&self) -> usize {
        self.hash.len()
    }

    /// Append to the array part as-is, without migrating hash entries.
    /// Used to rebuild a table with an exact layout.
    pub fn push_array_raw(&mut self, value: Value) {
        self.array.push(value);
    }

    /// Insert into the hash part as-is, bypassing array promotion.
    pub fn insert_hash_raw(&mut self, key: TableKey, value: Value) {
        self.hash.insert(key, value);
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}
