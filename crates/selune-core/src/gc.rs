//! GC heap with arena-based allocation and typed indices.
//!
//! Every object kind lives in its own [`Arena`]. Cross-kind references are
//! expressed as [`GcIdx`] values or, when the kind is dynamic, as [`ObjRef`].
//! Mark bits live in the slot header and are never observed outside a
//! collection cycle.

use crate::object::{LuaClosure, NativeClosure, NativeFn, ObjRef, UpVal, UpValLocation, UserData};
use crate::proto::Proto;
use crate::string::StringInterner;
use crate::table::{Table, TableKey};
use crate::thread::Thread;
use crate::value::Value;
use std::fmt;
use std::marker::PhantomData;

/// A typed index into an arena in the GcHeap.
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> fmt::Debug for GcIdx<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl<T> GcIdx<T> {
    #[inline]
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Per-object collector bookkeeping. Not part of an object's persistent state.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcHeader {
    pub marked: bool,
}

struct Slot<T> {
    header: GcHeader,
    value: T,
}

/// Slot arena for a single object kind, with a free list for slot reuse.
pub struct Arena<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, value: T) -> GcIdx<T> {
        let slot = Some(Slot {
            header: GcHeader::default(),
            value,
        });
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = slot;
            GcIdx::new(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(slot);
            GcIdx::new(idx)
        }
    }

    #[inline]
    pub fn get(&self, idx: GcIdx<T>) -> Option<&T> {
        self.slots
            .get(idx.0 as usize)
            .and_then(|s| s.as_ref())
            .map(|s| &s.value)
    }

    #[inline]
    pub fn get_mut(&mut self, idx: GcIdx<T>) -> Option<&mut T> {
        self.slots
            .get_mut(idx.0 as usize)
            .and_then(|s| s.as_mut())
            .map(|s| &mut s.value)
    }

    #[inline]
    pub fn contains(&self, idx: GcIdx<T>) -> bool {
        self.get(idx).is_some()
    }

    /// Release a slot, returning the object that lived there.
    pub fn free(&mut self, idx: GcIdx<T>) -> Option<T> {
        let slot = self.slots.get_mut(idx.0 as usize)?.take()?;
        self.free.push(idx.0);
        self.live -= 1;
        Some(slot.value)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate live objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (GcIdx<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (GcIdx::new(i as u32), &s.value)))
    }

    /// Mark a live object. Returns true only the first time it is marked.
    pub(crate) fn mark(&mut self, idx: GcIdx<T>) -> bool {
        match self.slots.get_mut(idx.0 as usize) {
            Some(Some(slot)) if !slot.header.marked => {
                slot.header.marked = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_marked(&self, idx: GcIdx<T>) -> bool {
        matches!(self.slots.get(idx.0 as usize), Some(Some(s)) if s.header.marked)
    }

    pub(crate) fn clear_marks(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.header.marked = false;
        }
    }

    /// Free every unmarked object, returning the freed indices.
    pub(crate) fn sweep(&mut self) -> Vec<GcIdx<T>> {
        let mut freed = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, Some(s) if !s.header.marked) {
                *slot = None;
                self.free.push(i as u32);
                freed.push(GcIdx::new(i as u32));
            }
        }
        self.live -= freed.len();
        freed
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arena-based GC heap.
#[derive(Default)]
pub struct GcHeap {
    pub strings: StringInterner,
    pub tables: Arena<Table>,
    pub closures: Arena<LuaClosure>,
    pub natives: Arena<NativeClosure>,
    pub upvals: Arena<UpVal>,
    pub userdata: Arena<UserData>,
    pub threads: Arena<Thread>,
    pub protos: Arena<Proto>,
}

impl GcHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> GcIdx<Table> {
        self.tables.alloc(Table::new(array_hint, hash_hint))
    }

    pub fn get_table(&self, idx: GcIdx<Table>) -> &Table {
        self.tables.get(idx).expect("table was freed")
    }

    pub fn get_table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        self.tables.get_mut(idx).expect("table was freed")
    }

    pub fn alloc_closure(&mut self, proto: GcIdx<Proto>, upvalues: Vec<GcIdx<UpVal>>) -> GcIdx<LuaClosure> {
        self.closures.alloc(LuaClosure { proto, upvalues })
    }

    pub fn get_closure(&self, idx: GcIdx<LuaClosure>) -> &LuaClosure {
        self.closures.get(idx).expect("closure was freed")
    }

    pub fn alloc_native(&mut self, func: NativeFn, upvalues: Vec<Value>) -> GcIdx<NativeClosure> {
        self.natives.alloc(NativeClosure {
            func,
            upvalues,
            env: None,
        })
    }

    pub fn get_native(&self, idx: GcIdx<NativeClosure>) -> &NativeClosure {
        self.natives.get(idx).expect("native fn was freed")
    }

    pub fn alloc_upval(&mut self, location: UpValLocation) -> GcIdx<UpVal> {
        self.upvals.alloc(UpVal { location })
    }

    pub fn get_upval(&self, idx: GcIdx<UpVal>) -> &UpVal {
        self.upvals.get(idx).expect("upval was freed")
    }

    pub fn get_upval_mut(&mut self, idx: GcIdx<UpVal>) -> &mut UpVal {
        self.upvals.get_mut(idx).expect("upval was freed")
    }

    pub fn alloc_userdata(&mut self, data: Vec<u8>) -> GcIdx<UserData> {
        self.userdata.alloc(UserData {
            data,
            metatable: None,
            user_value: Value::Nil,
        })
    }

    pub fn get_userdata(&self, idx: GcIdx<UserData>) -> &UserData {
        self.userdata.get(idx).expect("userdata was freed")
    }

    pub fn alloc_thread(&mut self) -> GcIdx<Thread> {
        self.threads.alloc(Thread::new())
    }

    pub fn get_thread(&self, idx: GcIdx<Thread>) -> &Thread {
        self.threads.get(idx).expect("thread was freed")
    }

    pub fn get_thread_mut(&mut self, idx: GcIdx<Thread>) -> &mut Thread {
        self.threads.get_mut(idx).expect("thread was freed")
    }

    pub fn alloc_proto(&mut self, proto: Proto) -> GcIdx<Proto> {
        self.protos.alloc(proto)
    }

    pub fn get_proto(&self, idx: GcIdx<Proto>) -> &Proto {
        self.protos.get(idx).expect("proto was freed")
    }

    /// Whether `obj` names a live object.
    pub fn contains(&self, obj: ObjRef) -> bool {
        match obj {
            ObjRef::String(i) => self.strings.get(i).is_some(),
            ObjRef::Table(i) => self.tables.contains(i),
            ObjRef::LuaClosure(i) => self.closures.contains(i),
            ObjRef::NativeClosure(i) => self.natives.contains(i),
            ObjRef::UserData(i) => self.userdata.contains(i),
            ObjRef::Thread(i) => self.threads.contains(i),
            ObjRef::Proto(i) => self.protos.contains(i),
            ObjRef::UpVal(i) => self.upvals.contains(i),
        }
    }

    /// Free a single object regardless of reachability. Returns false if it
    /// was not live.
    pub fn free(&mut self, obj: ObjRef) -> bool {
        match obj {
            ObjRef::String(i) => self.strings.free(i),
            ObjRef::Table(i) => self.tables.free(i).is_some(),
            ObjRef::LuaClosure(i) => self.closures.free(i).is_some(),
            ObjRef::NativeClosure(i) => self.natives.free(i).is_some(),
            ObjRef::UserData(i) => self.userdata.free(i).is_some(),
            ObjRef::Thread(i) => self.threads.free(i).is_some(),
            ObjRef::Proto(i) => self.protos.free(i).is_some(),
            ObjRef::UpVal(i) => self.upvals.free(i).is_some(),
        }
    }

    /// Total number of live objects across all arenas.
    pub fn object_count(&self) -> usize {
        self.strings.len()
            + self.tables.len()
            + self.closures.len()
            + self.natives.len()
            + self.upvals.len()
            + self.userdata.len()
            + self.threads.len()
            + self.protos.len()
    }

    /// Append every object directly referenced by `obj` to `out`.
    pub fn references(&self, obj: ObjRef, out: &mut Vec<ObjRef>) {
        let push = |out: &mut Vec<ObjRef>, v: Value| {
            if let Some(r) = v.as_object() {
                out.push(r);
            }
        };
        match obj {
            ObjRef::String(_) => {}
            ObjRef::Table(i) => {
                let Some(t) = self.tables.get(i) else { return };
                if let Some(mt) = t.metatable {
                    out.push(ObjRef::Table(mt));
                }
                for &v in t.array_values() {
                    push(out, v);
                }
                for (k, &v) in t.hash_entries() {
                    match *k {
                        TableKey::String(s) => out.push(ObjRef::String(s)),
                        TableKey::Object(r) => out.push(r),
                        _ => {}
                    }
                    push(out, v);
                }
            }
            ObjRef::LuaClosure(i) => {
                let Some(cl) = self.closures.get(i) else { return };
                out.push(ObjRef::Proto(cl.proto));
                out.extend(cl.upvalues.iter().map(|&u| ObjRef::UpVal(u)));
            }
            ObjRef::NativeClosure(i) => {
                let Some(nc) = self.natives.get(i) else { return };
                for &v in &nc.upvalues {
                    push(out, v);
                }
                if let Some(env) = nc.env {
                    out.push(ObjRef::Table(env));
                }
            }
            ObjRef::UserData(i) => {
                let Some(ud) = self.userdata.get(i) else { return };
                if let Some(mt) = ud.metatable {
                    out.push(ObjRef::Table(mt));
                }
                push(out, ud.user_value);
            }
            ObjRef::Thread(i) => {
                let Some(th) = self.threads.get(i) else { return };
                for &v in &th.stack[..th.stack_top.min(th.stack.len())] {
                    push(out, v);
                }
                for ci in &th.frames {
                    if let Some(cl) = ci.closure {
                        out.push(ObjRef::LuaClosure(cl));
                    }
                }
                out.extend(th.open_upvals.iter().map(|&(_, u)| ObjRef::UpVal(u)));
                push(out, th.hook_func);
            }
            ObjRef::Proto(i) => {
                let Some(p) = self.protos.get(i) else { return };
                out.extend(p.string_refs().map(ObjRef::String));
                out.extend(p.protos.iter().map(|&c| ObjRef::Proto(c)));
            }
            ObjRef::UpVal(i) => {
                let Some(uv) = self.upvals.get(i) else { return };
                match uv.location {
                    UpValLocation::Open { thread, .. } => out.push(ObjRef::Thread(thread)),
                    UpValLocation::Closed(v) => push(out, v),
                }
            }
        }
    }

    fn mark(&mut self, obj: ObjRef) -> bool {
        match obj {
            ObjRef::String(i) => self.strings.mark(i),
            ObjRef::Table(i) => self.tables.mark(i),
            ObjRef::LuaClosure(i) => self.closures.mark(i),
            ObjRef::NativeClosure(i) => self.natives.mark(i),
            ObjRef::UserData(i) => self.userdata.mark(i),
            ObjRef::Thread(i) => self.threads.mark(i),
            ObjRef::Proto(i) => self.protos.mark(i),
            ObjRef::UpVal(i) => self.upvals.mark(i),
        }
    }

    /// Whether `obj` survived the marking phase of the last collection.
    pub fn is_marked(&self, obj: ObjRef) -> bool {
        match obj {
            ObjRef::String(i) => self.strings.is_marked(i),
            ObjRef::Table(i) => self.tables.is_marked(i),
            ObjRef::LuaClosure(i) => self.closures.is_marked(i),
            ObjRef::NativeClosure(i) => self.natives.is_marked(i),
            ObjRef::UserData(i) => self.userdata.is_marked(i),
            ObjRef::Thread(i) => self.threads.is_marked(i),
            ObjRef::Proto(i) => self.protos.is_marked(i),
            ObjRef::UpVal(i) => self.upvals.is_marked(i),
        }
    }

    fn clear_marks(&mut self) {
        self.strings.clear_marks();
        self.tables.clear_marks();
        self.closures.clear_marks();
        self.natives.clear_marks();
        self.upvals.clear_marks();
        self.userdata.clear_marks();
        self.threads.clear_marks();
        self.protos.clear_marks();
    }

    /// Run a full mark-sweep cycle from `roots`. Returns the number of
    /// objects freed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjRef>) -> usize {
        self.clear_marks();

        let mut gray: Vec<ObjRef> = Vec::new();
        for root in roots {
            if self.mark(root) {
                gray.push(root);
            }
        }

        let mut children = Vec::new();
        while let Some(obj) = gray.pop() {
            children.clear();
            self.references(obj, &mut children);
            for &child in &children {
                if self.mark(child) {
                    gray.push(child);
                }
            }
        }

        self.strings.sweep()
            + self.tables.sweep().len()
            + self.closures.sweep().len()
            + self.natives.sweep().len()
            + self.upvals.sweep().len()
            + self.userdata.sweep().len()
            + self.threads.sweep().len()
            + self.protos.sweep().len()
    }
}
