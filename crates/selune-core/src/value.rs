/// Tagged Lua value.
///
/// Floats keep their exact bit pattern (NaN payloads included) so a value can
/// be written out and read back without drift. Reference variants carry a
/// typed index into the owning [`GcHeap`](crate::gc::GcHeap).
use crate::gc::GcIdx;
use crate::object::{LuaClosure, NativeClosure, ObjRef, UserData};
use crate::string::LuaString;
use crate::table::Table;
use crate::thread::Thread;
use std::fmt;

/// Type tags in Lua's basic type order (`LUA_TNIL` .. `LUA_TTHREAD`).
pub const TAG_NIL: u8 = 0;
pub const TAG_BOOLEAN: u8 = 1;
pub const TAG_LIGHTUSERDATA: u8 = 2;
pub const TAG_NUMBER: u8 = 3;
pub const TAG_STRING: u8 = 4;
pub const TAG_TABLE: u8 = 5;
pub const TAG_FUNCTION: u8 = 6;
pub const TAG_USERDATA: u8 = 7;
pub const TAG_THREAD: u8 = 8;

#[derive(Clone, Copy, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Raw host pointer. Never dereferenced by the runtime.
    LightUserData(usize),
    String(GcIdx<LuaString>),
    Table(GcIdx<Table>),
    Closure(GcIdx<LuaClosure>),
    Native(GcIdx<NativeClosure>),
    UserData(GcIdx<UserData>),
    Thread(GcIdx<Thread>),
}

impl Value {
    // ---- Type checks ----

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Native(_))
    }

    /// Lua falsy: only nil and false are falsy.
    #[inline]
    pub fn is_falsy(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    // ---- Extractors ----

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(&self) -> Option<GcIdx<LuaString>> {
        match *self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_table(&self) -> Option<GcIdx<Table>> {
        match *self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn as_thread(&self) -> Option<GcIdx<Thread>> {
        match *self {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// The heap object this value refers to, if any.
    #[inline]
    pub fn as_object(&self) -> Option<ObjRef> {
        match *self {
            Value::String(i) => Some(ObjRef::String(i)),
            Value::Table(i) => Some(ObjRef::Table(i)),
            Value::Closure(i) => Some(ObjRef::LuaClosure(i)),
            Value::Native(i) => Some(ObjRef::NativeClosure(i)),
            Value::UserData(i) => Some(ObjRef::UserData(i)),
            Value::Thread(i) => Some(ObjRef::Thread(i)),
            _ => None,
        }
    }

    /// Inverse of [`Value::as_object`]. Protos and upvalues yield `None`.
    #[inline]
    pub fn from_object(obj: ObjRef) -> Option<Value> {
        obj.to_value()
    }

    // ---- Lua semantics ----

    /// Lua basic type tag (0..=8), as used to index per-type metatables.
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Nil => TAG_NIL,
            Value::Bool(_) => TAG_BOOLEAN,
            Value::LightUserData(_) => TAG_LIGHTUSERDATA,
            Value::Int(_) | Value::Float(_) => TAG_NUMBER,
            Value::String(_) => TAG_STRING,
            Value::Table(_) => TAG_TABLE,
            Value::Closure(_) | Value::Native(_) => TAG_FUNCTION,
            Value::UserData(_) => TAG_USERDATA,
            Value::Thread(_) => TAG_THREAD,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Closure(_) | Value::Native(_) => "function",
            Value::LightUserData(_) | Value::UserData(_) => "userdata",
            Value::Thread(_) => "thread",
        }
    }

    /// Exact identity: same variant and same payload bits. Unlike `==`,
    /// NaN is identical to itself and `1` is not identical to `1.0`.
    pub fn identical(&self, other: &Value) -> bool {
        match (*self, *other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            (a, b) => match (a.as_object(), b.as_object()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(fl) => write!(f, "{fl}"),
            Value::LightUserData(p) => write!(f, "lightuserdata({p:#x})"),
            Value::String(i) => write!(f, "string({i:?})"),
            Value::Table(i) => write!(f, "table({i:?})"),
            Value::Closure(i) => write!(f, "closure({i:?})"),
            Value::Native(i) => write!(f, "native({i:?})"),
            Value::UserData(i) => write!(f, "userdata({i:?})"),
            Value::Thread(i) => write!(f, "thread({i:?})"),
        }
    }
}

impl PartialEq for Value {
    /// Raw Lua equality: NaN ~= NaN, and integers compare equal to floats
    /// with the same mathematical value.
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                b.fract() == 0.0 && b >= -(2f64.powi(63)) && b < 2f64.powi(63) && a == b as i64
            }
            _ => self.identical(other),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<GcIdx<LuaString>> for Value {
    fn from(s: GcIdx<LuaString>) -> Self {
        Value::String(s)
    }
}

impl From<GcIdx<Table>> for Value {
    fn from(t: GcIdx<Table>) -> Self {
        Value::Table(t)
    }
}
