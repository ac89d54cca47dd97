//! Runtime global state: the root set, globals/registry helpers, upvalue
//! bookkeeping and collection entry point.

use crate::gc::{GcHeap, GcIdx};
use crate::object::{LuaClosure, NativeClosure, NativeContext, NativeError, NativeFn, ObjRef, UpVal, UpValLocation, UserData};
use crate::proto::Proto;
use crate::string::LuaString;
use crate::table::Table;
use crate::thread::Thread;
use crate::value::Value;

/// Number of basic type tags, and so of per-type metatable slots.
pub const NUM_TYPE_TAGS: usize = 9;

/// Tag-method names, in Lua 5.4 `TMS` order.
pub const TM_NAMES: [&str; 25] = [
    "__index", "__newindex", "__gc", "__mode", "__len", "__eq", "__add", "__sub", "__mul",
    "__mod", "__pow", "__div", "__idiv", "__band", "__bor", "__bxor", "__shl", "__shr",
    "__unm", "__bnot", "__lt", "__le", "__concat", "__call", "__close",
];

/// Registry slot holding the main thread.
pub const REGISTRY_MAINTHREAD: i64 = 1;
/// Registry slot holding the globals table.
pub const REGISTRY_GLOBALS: i64 = 2;

/// Collector tuning knobs. These persist; mark state and debt do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcParams {
    pub pause: u32,
    pub step_mul: u32,
}

impl Default for GcParams {
    fn default() -> Self {
        GcParams {
            pause: 200,
            step_mul: 200,
        }
    }
}

/// The objects every other live object is reachable from.
#[derive(Clone, Debug)]
pub struct StateRoots {
    pub registry: GcIdx<Table>,
    pub globals: GcIdx<Table>,
    pub main_thread: GcIdx<Thread>,
    /// Metatables for non-table, non-userdata values, indexed by type tag.
    pub type_metatables: [Option<GcIdx<Table>>; NUM_TYPE_TAGS],
    pub tm_names: Vec<GcIdx<LuaString>>,
    pub gc_params: GcParams,
}

/// An interpreter instance: heap plus roots.
pub struct LuaState {
    pub heap: GcHeap,
    roots: StateRoots,
    /// Host-held values kept alive across collections.
    pinned: Vec<Value>,
}

impl LuaState {
    pub fn new() -> Self {
        let mut heap = GcHeap::new();
        let registry = heap.alloc_table(2, 0);
        let globals = heap.alloc_table(0, 0);
        let main_thread = heap.alloc_thread();
        let tm_names = TM_NAMES.iter().map(|n| heap.strings.intern(n.as_bytes())).collect();

        let reg = heap.get_table_mut(registry);
        reg.raw_seti(REGISTRY_MAINTHREAD, Value::Thread(main_thread));
        reg.raw_seti(REGISTRY_GLOBALS, Value::Table(globals));

        // _G = globals
        let g_name = heap.strings.intern(b"_G");
        heap.get_table_mut(globals).raw_set_str(g_name, Value::Table(globals));

        let roots = StateRoots {
            registry,
            globals,
            main_thread,
            type_metatables: [None; NUM_TYPE_TAGS],
            tm_names,
            gc_params: GcParams::default(),
        };
        Self::from_roots(heap, roots)
    }

    /// Assemble a state from an already-populated heap.
    pub fn from_roots(heap: GcHeap, roots: StateRoots) -> Self {
        LuaState {
            heap,
            roots,
            pinned: Vec::new(),
        }
    }

    pub fn roots(&self) -> &StateRoots {
        &self.roots
    }

    pub fn roots_mut(&mut self) -> &mut StateRoots {
        &mut self.roots
    }

    pub fn globals(&self) -> GcIdx<Table> {
        self.roots.globals
    }

    pub fn registry(&self) -> GcIdx<Table> {
        self.roots.registry
    }

    pub fn main_thread(&self) -> GcIdx<Thread> {
        self.roots.main_thread
    }

    /// Every object the collector treats as a root.
    pub fn root_objects(&self) -> Vec<ObjRef> {
        let r = &self.roots;
        let mut out = vec![
            ObjRef::Table(r.registry),
            ObjRef::Table(r.globals),
            ObjRef::Thread(r.main_thread),
        ];
        out.extend(r.type_metatables.iter().flatten().map(|&t| ObjRef::Table(t)));
        out.extend(r.tm_names.iter().map(|&s| ObjRef::String(s)));
        out.extend(self.pinned.iter().filter_map(Value::as_object));
        out
    }

    // ---- Allocation ----

    pub fn intern(&mut self, s: &str) -> GcIdx<LuaString> {
        self.heap.strings.intern(s.as_bytes())
    }

    pub fn new_string(&mut self, s: &str) -> Value {
        Value::String(self.intern(s))
    }

    pub fn new_table(&mut self) -> GcIdx<Table> {
        self.heap.alloc_table(0, 0)
    }

    pub fn new_native(&mut self, func: NativeFn, upvalues: Vec<Value>) -> GcIdx<NativeClosure> {
        self.heap.alloc_native(func, upvalues)
    }

    pub fn new_proto(&mut self, proto: Proto) -> GcIdx<Proto> {
        self.heap.alloc_proto(proto)
    }

    pub fn new_closure(&mut self, proto: GcIdx<Proto>, upvalues: Vec<GcIdx<UpVal>>) -> GcIdx<LuaClosure> {
        self.heap.alloc_closure(proto, upvalues)
    }

    pub fn new_userdata(&mut self, data: Vec<u8>) -> GcIdx<UserData> {
        self.heap.alloc_userdata(data)
    }

    /// Create a coroutine with `func` in stack slot 0.
    pub fn new_thread(&mut self, func: Value) -> GcIdx<Thread> {
        let th = self.heap.alloc_thread();
        self.heap.get_thread_mut(th).push(func);
        th
    }

    // ---- Table helpers ----

    pub fn set_field(&mut self, table: GcIdx<Table>, name: &str, v: Value) {
        let key = self.intern(name);
        self.heap.get_table_mut(table).raw_set_str(key, v);
    }

    /// Read a string-keyed field without interning the name.
    pub fn get_field(&self, table: GcIdx<Table>, name: &str) -> Value {
        match self.heap.strings.find(name.as_bytes()) {
            Some(key) => self.heap.get_table(table).raw_get_str(key),
            None => Value::Nil,
        }
    }

    pub fn set_global(&mut self, name: &str, v: Value) {
        self.set_field(self.roots.globals, name, v);
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.get_field(self.roots.globals, name)
    }

    // ---- Metatables ----

    /// The metatable governing `v`: its own for tables and userdata,
    /// otherwise the per-type one.
    pub fn metatable_of(&self, v: Value) -> Option<GcIdx<Table>> {
        match v {
            Value::Table(t) => self.heap.tables.get(t)?.metatable,
            Value::UserData(u) => self.heap.userdata.get(u)?.metatable,
            other => self.roots.type_metatables[other.type_tag() as usize],
        }
    }

    pub fn set_type_metatable(&mut self, type_tag: u8, mt: Option<GcIdx<Table>>) {
        if let Some(slot) = self.roots.type_metatables.get_mut(type_tag as usize) {
            *slot = mt;
        }
    }

    // ---- Upvalues ----

    /// Find or create an open upvalue for a slot of `thread`'s stack.
    pub fn find_or_create_open_upval(&mut self, thread: GcIdx<Thread>, slot: usize) -> GcIdx<UpVal> {
        if let Some(&(_, uv)) = self.heap.get_thread(thread).open_upvals.iter().find(|(s, _)| *s == slot) {
            return uv;
        }
        let uv = self.heap.alloc_upval(UpValLocation::Open { thread, slot });
        let open = &mut self.heap.get_thread_mut(thread).open_upvals;
        open.push((slot, uv));
        // Keep sorted by stack index descending
        open.sort_by(|a, b| b.0.cmp(&a.0));
        uv
    }

    /// Close all open upvalues of `thread` at or above `level`.
    pub fn close_upvalues(&mut self, thread: GcIdx<Thread>, level: usize) {
        let th = self.heap.get_thread_mut(thread);
        let (closing, open): (Vec<_>, Vec<_>) = th.open_upvals.drain(..).partition(|&(s, _)| s >= level);
        th.open_upvals = open;
        let values: Vec<_> = closing
            .iter()
            .map(|&(s, uv)| (uv, th.stack.get(s).copied().unwrap_or_default()))
            .collect();
        for (uv, val) in values {
            self.heap.get_upval_mut(uv).location = UpValLocation::Closed(val);
        }
    }

    /// Get an upvalue's current value.
    pub fn get_upval_value(&self, uv: GcIdx<UpVal>) -> Value {
        match self.heap.get_upval(uv).location {
            UpValLocation::Open { thread, slot } => self
                .heap
                .threads
                .get(thread)
                .and_then(|th| th.stack.get(slot).copied())
                .unwrap_or_default(),
            UpValLocation::Closed(v) => v,
        }
    }

    /// Set an upvalue's value.
    pub fn set_upval_value(&mut self, uv: GcIdx<UpVal>, val: Value) {
        match self.heap.get_upval(uv).location {
            UpValLocation::Open { thread, slot } => {
                if let Some(cell) = self.heap.threads.get_mut(thread).and_then(|th| th.stack.get_mut(slot)) {
                    *cell = val;
                }
            }
            UpValLocation::Closed(_) => {
                self.heap.get_upval_mut(uv).location = UpValLocation::Closed(val);
            }
        }
    }

    // ---- Calls ----

    /// Invoke a native closure with `args`.
    pub fn call_native(&mut self, f: GcIdx<NativeClosure>, args: &[Value]) -> Result<Vec<Value>, NativeError> {
        let (func, upvalues) = match self.heap.natives.get(f) {
            Some(nc) => (nc.func, nc.upvalues.clone()),
            None => return Err(NativeError::Runtime("attempt to call a freed native".into())),
        };
        let mut ctx = NativeContext {
            args,
            upvalues: &upvalues,
            heap: &mut self.heap,
        };
        func(&mut ctx)
    }

    // ---- GC ----

    /// Keep `v` alive until a matching [`unpin`](Self::unpin).
    pub fn pin(&mut self, v: Value) {
        if v.as_object().is_some() {
            self.pinned.push(v);
        }
    }

    /// Release one pin on `v`. Returns false if it was not pinned.
    pub fn unpin(&mut self, v: Value) -> bool {
        match self.pinned.iter().position(|p| p.identical(&v)) {
            Some(i) => {
                self.pinned.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn pinned(&self) -> &[Value] {
        &self.pinned
    }

    /// Run a full collection from the root set. Returns objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.root_objects();
        self.heap.collect(roots)
    }
}

impl Default for LuaState {
    fn default() -> Self {
        Self::new()
    }
}
