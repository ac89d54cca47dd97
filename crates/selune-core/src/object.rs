//! GC object types and the kind tags shared by every heap object.

use crate::gc::{GcHeap, GcIdx};
use crate::proto::Proto;
use crate::string::LuaString;
use crate::table::Table;
use crate::thread::Thread;
use crate::value::Value;
use std::fmt;

/// The dynamic kind of a GC-managed object.
///
/// The discriminant doubles as the in-band type tag written by the
/// persistence layer, so the numbering is part of the snapshot format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ObjectKind {
    String = 0,
    Table = 1,
    LuaClosure = 2,
    NativeClosure = 3,
    UserData = 4,
    Thread = 5,
    Proto = 6,
    UpVal = 7,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 8] = [
        ObjectKind::String,
        ObjectKind::Table,
        ObjectKind::LuaClosure,
        ObjectKind::NativeClosure,
        ObjectKind::UserData,
        ObjectKind::Thread,
        ObjectKind::Proto,
        ObjectKind::UpVal,
    ];

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Convert from a tag byte to the enum.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::String => "string",
            ObjectKind::Table => "table",
            ObjectKind::LuaClosure => "closure",
            ObjectKind::NativeClosure => "native",
            ObjectKind::UserData => "userdata",
            ObjectKind::Thread => "thread",
            ObjectKind::Proto => "proto",
            ObjectKind::UpVal => "upval",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A reference to any heap object, tagged with its kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjRef {
    String(GcIdx<LuaString>),
    Table(GcIdx<Table>),
    LuaClosure(GcIdx<LuaClosure>),
    NativeClosure(GcIdx<NativeClosure>),
    UserData(GcIdx<UserData>),
    Thread(GcIdx<Thread>),
    Proto(GcIdx<Proto>),
    UpVal(GcIdx<UpVal>),
}

impl ObjRef {
    pub fn kind(self) -> ObjectKind {
        match self {
            ObjRef::String(_) => ObjectKind::String,
            ObjRef::Table(_) => ObjectKind::Table,
            ObjRef::LuaClosure(_) => ObjectKind::LuaClosure,
            ObjRef::NativeClosure(_) => ObjectKind::NativeClosure,
            ObjRef::UserData(_) => ObjectKind::UserData,
            ObjRef::Thread(_) => ObjectKind::Thread,
            ObjRef::Proto(_) => ObjectKind::Proto,
            ObjRef::UpVal(_) => ObjectKind::UpVal,
        }
    }

    /// Slot index within the kind's arena.
    pub fn index(self) -> u32 {
        match self {
            ObjRef::String(i) => i.0,
            ObjRef::Table(i) => i.0,
            ObjRef::LuaClosure(i) => i.0,
            ObjRef::NativeClosure(i) => i.0,
            ObjRef::UserData(i) => i.0,
            ObjRef::Thread(i) => i.0,
            ObjRef::Proto(i) => i.0,
            ObjRef::UpVal(i) => i.0,
        }
    }

    /// The first-class value for this object. Protos and upvalues are not
    /// values and return `None`.
    pub fn to_value(self) -> Option<Value> {
        match self {
            ObjRef::String(i) => Some(Value::String(i)),
            ObjRef::Table(i) => Some(Value::Table(i)),
            ObjRef::LuaClosure(i) => Some(Value::Closure(i)),
            ObjRef::NativeClosure(i) => Some(Value::Native(i)),
            ObjRef::UserData(i) => Some(Value::UserData(i)),
            ObjRef::Thread(i) => Some(Value::Thread(i)),
            ObjRef::Proto(_) | ObjRef::UpVal(_) => None,
        }
    }
}

/// A Lua closure (prototype + captured upvalues).
#[derive(Debug)]
pub struct LuaClosure {
    pub proto: GcIdx<Proto>,
    pub upvalues: Vec<GcIdx<UpVal>>,
}

/// Error raised by a native function.
#[derive(Clone, Debug)]
pub enum NativeError {
    /// Error with a message.
    Runtime(String),
    /// error() called with an arbitrary value.
    Value(Value),
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeError::Runtime(msg) => write!(f, "{msg}"),
            NativeError::Value(v) => write!(f, "{v:?}"),
        }
    }
}

impl std::error::Error for NativeError {}

/// Signature of a host function callable from Lua.
pub type NativeFn = fn(&mut NativeContext) -> Result<Vec<Value>, NativeError>;

/// Context passed to native functions.
pub struct NativeContext<'a> {
    pub args: &'a [Value],
    pub upvalues: &'a [Value],
    pub heap: &'a mut GcHeap,
}

/// A native (Rust) function with its own upvalues, callable from Lua.
pub struct NativeClosure {
    pub func: NativeFn,
    pub upvalues: Vec<Value>,
    pub env: Option<GcIdx<Table>>,
}

impl NativeClosure {
    /// Process-local address of the function, used as its identity.
    #[inline]
    pub fn func_addr(&self) -> usize {
        self.func as usize
    }
}

impl fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "native(fn={:#x}, upvalues={})",
            self.func_addr(),
            self.upvalues.len()
        )
    }
}

/// An upvalue: either open (pointing to a thread's stack slot) or closed
/// (holding its own value).
#[derive(Debug)]
pub struct UpVal {
    pub location: UpValLocation,
}

/// Where an upvalue's value lives.
#[derive(Clone, Copy, Debug)]
pub enum UpValLocation {
    /// Still bound to a live stack slot.
    Open { thread: GcIdx<Thread>, slot: usize },
    /// Value has been captured (function returned).
    Closed(Value),
}

impl UpVal {
    pub fn is_open(&self) -> bool {
        matches!(self.location, UpValLocation::Open { .. })
    }
}

/// A full userdata block: raw bytes owned by the runtime plus its metatable
/// and associated user value.
#[derive(Debug)]
pub struct UserData {
    pub data: Vec<u8>,
    pub metatable: Option<GcIdx<Table>>,
    pub user_value: Value,
}
