//! Restore: rebuild an object graph from a snapshot in two phases.
//!
//! Phase 1 allocates a default-initialized object for every record and
//! binds its id, so any record may refer to any other regardless of the
//! order records appear in. Phase 2 decodes each payload and links the
//! fields. Nothing built here is visible to the caller until both phases
//! and the root section succeed.

use crate::codec::{self, DecodeError, Decoder, Frame, Header, RawRecord, WireValue};
use crate::descriptor::{DescriptorSet, FieldClass, FieldDescriptor, KindDescriptor};
use crate::error::{Location, Phase, RestoreError};
use crate::identity::{Resolution, RestoreIds};
use crate::natives::NativeRegistry;
use crate::walker::thread_shape_error;
use selune_core::gc::{GcHeap, GcIdx};
use selune_core::object::{
    LuaClosure, NativeClosure, NativeContext, NativeError, ObjRef, ObjectKind, UpVal, UpValLocation, UserData,
};
use selune_core::proto::{Constant, LocalVar, Proto, UpvalDesc, BYTECODE_REVISION};
use selune_core::state::{GcParams, LuaState, StateRoots, NUM_TYPE_TAGS};
use selune_core::string::LuaString;
use selune_core::table::{Table, TableKey};
use selune_core::thread::{CallFrame, Thread, ThreadStatus};
use selune_core::value::Value;
use std::collections::HashSet;

type WireRef = (ObjectKind, u64);

fn corrupt(phase: Phase, at: Location, detail: impl Into<String>) -> RestoreError {
    RestoreError::Corrupt {
        phase,
        path: at.path(),
        detail: detail.into(),
    }
}

fn decode_error(phase: Phase, at: Location, e: DecodeError) -> RestoreError {
    corrupt(phase, at, format!("{e} at offset {}", e.offset()))
}

fn narrow<T: TryFrom<u64>>(n: u64, phase: Phase, at: Location) -> Result<T, RestoreError> {
    T::try_from(n).map_err(|_| corrupt(phase, at, format!("{n} is out of range")))
}

/// A phase 1 object that is no longer live. Only possible if the heap was
/// tampered with mid-restore.
fn vanished(phase: Phase, obj: ObjRef) -> RestoreError {
    RestoreError::Corrupt {
        phase,
        path: format!("{}#{}", obj.kind(), obj.index()),
        detail: "object vanished during restore".into(),
    }
}

/// Stand-in function for native closures between the two phases.
fn unlinked_native(_: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Err(NativeError::Runtime("native closure was never linked".into()))
}

// ---------------------------------------------------------------------------
// Payload readers
// ---------------------------------------------------------------------------

fn read_values(d: &mut Decoder<'_>) -> Result<Vec<WireValue>, DecodeError> {
    let n = d.read_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(d.read_value()?);
    }
    Ok(out)
}

fn read_pairs(d: &mut Decoder<'_>) -> Result<Vec<(WireValue, WireValue)>, DecodeError> {
    let n = d.read_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let k = d.read_value()?;
        out.push((k, d.read_value()?));
    }
    Ok(out)
}

fn read_opt_ref(d: &mut Decoder<'_>) -> Result<Option<WireRef>, DecodeError> {
    let offset = d.offset();
    match d.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(d.read_ref()?)),
        tag => Err(DecodeError::BadValueTag { offset, tag }),
    }
}

fn read_refs(d: &mut Decoder<'_>) -> Result<Vec<WireRef>, DecodeError> {
    let n = d.read_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(d.read_ref()?);
    }
    Ok(out)
}

struct WireFrame {
    closure: Option<WireRef>,
    func_stack_idx: u64,
    base: u64,
    pc: u64,
    num_results: i64,
    tail_calls: u64,
}

fn read_frames(d: &mut Decoder<'_>) -> Result<Vec<WireFrame>, DecodeError> {
    let n = d.read_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(WireFrame {
            closure: read_opt_ref(d)?,
            func_stack_idx: d.read_varint()?,
            base: d.read_varint()?,
            pc: d.read_varint()?,
            num_results: d.read_i64()?,
            tail_calls: d.read_varint()?,
        });
    }
    Ok(out)
}

fn read_open_upvals(d: &mut Decoder<'_>) -> Result<Vec<(u64, WireRef)>, DecodeError> {
    let n = d.read_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let slot = d.read_varint()?;
        out.push((slot, d.read_ref()?));
    }
    Ok(out)
}

struct WireUpvalDesc {
    name: Option<WireRef>,
    in_stack: bool,
    index: u8,
    kind: u8,
}

fn read_upval_descs(d: &mut Decoder<'_>) -> Result<Vec<WireUpvalDesc>, DecodeError> {
    let n = d.read_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(WireUpvalDesc {
            name: read_opt_ref(d)?,
            in_stack: d.read_u8()? != 0,
            index: d.read_u8()?,
            kind: d.read_u8()?,
        });
    }
    Ok(out)
}

fn read_local_vars(d: &mut Decoder<'_>) -> Result<Vec<(WireRef, u64, u64)>, DecodeError> {
    let n = d.read_len()?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let name = d.read_ref()?;
        let start = d.read_varint()?;
        out.push((name, start, d.read_varint()?));
    }
    Ok(out)
}

#[derive(Debug)]
enum WireLocation {
    Closed(WireValue),
    Open(WireRef, u64),
}

fn read_location(d: &mut Decoder<'_>) -> Result<WireLocation, DecodeError> {
    let offset = d.offset();
    match d.read_u8()? {
        0 => Ok(WireLocation::Closed(d.read_value()?)),
        1 => {
            let thread = d.read_ref()?;
            Ok(WireLocation::Open(thread, d.read_varint()?))
        }
        tag => Err(DecodeError::BadValueTag { offset, tag }),
    }
}

// ---------------------------------------------------------------------------
// Field source
// ---------------------------------------------------------------------------

/// Reads one object's payload in descriptor order; the mirror image of
/// the capture-side field sink.
pub(crate) struct FieldSource<'d, 'b> {
    desc: &'d KindDescriptor,
    id: u64,
    next: usize,
    dec: Decoder<'b>,
    phase: Phase,
}

impl<'d, 'b> FieldSource<'d, 'b> {
    pub fn new(desc: &'d KindDescriptor, record: &RawRecord<'b>, phase: Phase) -> Self {
        FieldSource {
            desc,
            id: record.id,
            next: 0,
            dec: Decoder::at_offset(record.payload, record.offset),
            phase,
        }
    }

    pub fn at(&self, field: &'static str) -> Location {
        Location::object(self.desc.kind, self.id, field)
    }

    fn open(&mut self, name: &'static str, class: FieldClass) -> Result<&'d FieldDescriptor, RestoreError> {
        let desc: &'d KindDescriptor = self.desc;
        while desc.fields.get(self.next).is_some_and(|f| !f.class.is_persisted()) {
            self.next += 1;
        }
        let at = self.at(name);
        let Some(field) = desc.fields.get(self.next).filter(|f| f.name == name && f.class == class) else {
            return Err(corrupt(self.phase, at, "field read out of descriptor order"));
        };
        let offset = self.dec.offset();
        let index = self.dec.read_u8().map_err(|e| decode_error(self.phase, at, e))?;
        if usize::from(index) != self.next {
            return Err(corrupt(
                self.phase,
                at,
                format!("expected field index {}, found {index} at offset {offset}", self.next),
            ));
        }
        self.next += 1;
        Ok(field)
    }

    fn read<T>(
        &mut self,
        name: &'static str,
        class: FieldClass,
        read: impl FnOnce(&mut Decoder<'b>) -> Result<T, DecodeError>,
    ) -> Result<(T, &'d FieldDescriptor), RestoreError> {
        let field = self.open(name, class)?;
        let at = self.at(name);
        let value = read(&mut self.dec).map_err(|e| decode_error(self.phase, at, e))?;
        Ok((value, field))
    }

    fn check_targets(&self, field: &FieldDescriptor, refs: &[WireRef]) -> Result<(), RestoreError> {
        match refs.iter().find(|(kind, _)| !field.targets.contains(kind)) {
            Some((kind, _)) => Err(corrupt(
                self.phase,
                self.at(field.name),
                format!("cannot refer to a {kind}"),
            )),
            None => Ok(()),
        }
    }

    pub fn value<T>(
        &mut self,
        name: &'static str,
        read: impl FnOnce(&mut Decoder<'b>) -> Result<T, DecodeError>,
    ) -> Result<T, RestoreError> {
        Ok(self.read(name, FieldClass::Value, read)?.0)
    }

    pub fn custom<T>(
        &mut self,
        name: &'static str,
        read: impl FnOnce(&mut Decoder<'b>) -> Result<T, DecodeError>,
    ) -> Result<T, RestoreError> {
        Ok(self.read(name, FieldClass::Custom, read)?.0)
    }

    pub fn owning(&mut self, name: &'static str) -> Result<WireRef, RestoreError> {
        let (r, field) = self.read(name, FieldClass::Owning, |d| d.read_ref())?;
        self.check_targets(field, &[r])?;
        Ok(r)
    }

    pub fn owning_list(&mut self, name: &'static str) -> Result<Vec<WireRef>, RestoreError> {
        let (refs, field) = self.read(name, FieldClass::Owning, read_refs)?;
        self.check_targets(field, &refs)?;
        Ok(refs)
    }

    pub fn shared(&mut self, name: &'static str) -> Result<Option<WireRef>, RestoreError> {
        let (r, field) = self.read(name, FieldClass::Shared, read_opt_ref)?;
        if let Some(r) = r {
            self.check_targets(field, &[r])?;
        }
        Ok(r)
    }

    pub fn shared_list(&mut self, name: &'static str) -> Result<Vec<WireRef>, RestoreError> {
        let (refs, field) = self.read(name, FieldClass::Shared, read_refs)?;
        self.check_targets(field, &refs)?;
        Ok(refs)
    }

    /// Every persisted field was read and nothing is left over.
    pub fn finish(self) -> Result<(), RestoreError> {
        if let Some(f) = self.desc.fields[self.next..].iter().find(|f| f.class.is_persisted()) {
            return Err(corrupt(self.phase, self.at(f.name), "field missing"));
        }
        if !self.dec.is_empty() {
            return Err(corrupt(
                self.phase,
                self.at("payload"),
                format!("{} trailing bytes", self.dec.remaining()),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed lookups
// ---------------------------------------------------------------------------

/// Heap object types reachable from a typed field.
trait Linkable: Sized {
    const KIND: ObjectKind;
    fn from_obj(obj: ObjRef) -> Option<GcIdx<Self>>;
}

macro_rules! linkable {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Linkable for $ty {
                const KIND: ObjectKind = ObjectKind::$variant;
                fn from_obj(obj: ObjRef) -> Option<GcIdx<Self>> {
                    match obj {
                        ObjRef::$variant(i) => Some(i),
                        _ => None,
                    }
                }
            }
        )*
    };
}

linkable! {
    LuaString => String,
    Table => Table,
    LuaClosure => LuaClosure,
    Thread => Thread,
    Proto => Proto,
    UpVal => UpVal,
}

// ---------------------------------------------------------------------------
// Restorer
// ---------------------------------------------------------------------------

pub(crate) struct Restorer<'a> {
    descriptors: &'a DescriptorSet,
    natives: &'a NativeRegistry,
}

fn check_header(header: &Header, single_value: bool) -> Result<(), RestoreError> {
    if header.is_single_value() != single_value {
        return Err(RestoreError::ModeMismatch {
            expected: if single_value { "single-value" } else { "full-state" },
            found: header.mode_name(),
        });
    }
    if header.bytecode_revision != BYTECODE_REVISION {
        return Err(RestoreError::BytecodeRevision {
            found: header.bytecode_revision,
            expected: BYTECODE_REVISION,
        });
    }
    Ok(())
}

impl<'a> Restorer<'a> {
    pub fn new(descriptors: &'a DescriptorSet, natives: &'a NativeRegistry) -> Self {
        Restorer { descriptors, natives }
    }

    /// Rebuild a whole runtime into a fresh heap.
    pub fn restore_state(&self, bytes: &[u8]) -> Result<LuaState, RestoreError> {
        let frame = codec::read_frame(bytes)?;
        check_header(&frame.header, false)?;
        let mut heap = GcHeap::new();
        let roots = {
            let mut pass = Pass::new(self, &mut heap, &frame);
            pass.build()?;
            pass.state_roots()?
        };
        tracing::debug!(objects = frame.records.len(), "state restored");
        Ok(LuaState::from_roots(heap, roots))
    }

    /// Rebuild a single value into an existing runtime. On failure every
    /// object created by this call is freed again.
    pub fn restore_value_into(&self, state: &mut LuaState, bytes: &[u8]) -> Result<Value, RestoreError> {
        let frame = codec::read_frame(bytes)?;
        check_header(&frame.header, true)?;
        let mut pass = Pass::new(self, &mut state.heap, &frame);
        let result = pass.build().and_then(|()| pass.value_root());
        match result {
            Ok(v) => {
                tracing::debug!(objects = frame.records.len(), fresh = pass.fresh.len(), "value restored");
                state.pin(v);
                Ok(v)
            }
            Err(e) => {
                pass.discard();
                Err(e)
            }
        }
    }
}

/// State of one restore.
struct Pass<'r, 'h, 'b> {
    descriptors: &'r DescriptorSet,
    natives: &'r NativeRegistry,
    heap: &'h mut GcHeap,
    frame: &'r Frame<'b>,
    deep: bool,
    phase: Phase,
    ids: RestoreIds,
    /// Objects this restore created, in creation order.
    fresh: Vec<ObjRef>,
    /// Strings produced by this snapshot's records.
    interned: HashSet<GcIdx<LuaString>>,
    threads: Vec<(u64, GcIdx<Thread>)>,
    open_upvals: Vec<(u64, GcIdx<UpVal>)>,
}

impl<'r, 'h, 'b> Pass<'r, 'h, 'b> {
    fn new(restorer: &Restorer<'r>, heap: &'h mut GcHeap, frame: &'r Frame<'b>) -> Self {
        Pass {
            descriptors: restorer.descriptors,
            natives: restorer.natives,
            heap,
            frame,
            deep: frame.header.is_deep(),
            phase: Phase::Allocate,
            ids: RestoreIds::with_count(frame.records.len()),
            fresh: Vec::new(),
            interned: HashSet::new(),
            threads: Vec::new(),
            open_upvals: Vec::new(),
        }
    }

    fn build(&mut self) -> Result<(), RestoreError> {
        self.allocate()?;
        tracing::debug!(objects = self.fresh.len(), "allocate phase done");
        self.link()?;
        let linked = self.ids.finish().map_err(|id| RestoreError::UnresolvedId {
            id,
            path: "record table".into(),
        })?;
        tracing::debug!(objects = linked, "link phase done");
        self.validate_threads()
    }

    fn discard(self) {
        let count = self.fresh.len();
        for obj in self.fresh.into_iter().rev() {
            self.heap.free(obj);
        }
        tracing::debug!(freed = count, "discarded partial restore");
    }

    // ---- Phase 1 ----

    fn allocate(&mut self) -> Result<(), RestoreError> {
        self.phase = Phase::Allocate;
        let frame = self.frame;
        for rec in &frame.records {
            let obj = self.allocate_one(rec)?;
            self.ids.allocate(rec.id, obj)?;
        }
        Ok(())
    }

    fn allocate_one(&mut self, rec: &RawRecord<'b>) -> Result<ObjRef, RestoreError> {
        let obj = match rec.kind {
            ObjectKind::String => {
                // Strings are immutable, so they are complete after this phase.
                let mut src = FieldSource::new(self.descriptors.get(ObjectKind::String), rec, Phase::Allocate);
                let bytes = src.value("bytes", |d| d.read_bytes())?;
                src.finish()?;
                let (s, fresh) = self.heap.strings.intern_with_status(bytes);
                if fresh {
                    self.fresh.push(ObjRef::String(s));
                }
                if !self.interned.insert(s) {
                    return Err(corrupt(
                        Phase::Allocate,
                        Location::object(ObjectKind::String, rec.id, "bytes"),
                        "string content appears in more than one record",
                    ));
                }
                return Ok(ObjRef::String(s));
            }
            ObjectKind::Table => ObjRef::Table(self.heap.alloc_table(0, 0)),
            ObjectKind::LuaClosure => ObjRef::LuaClosure(self.heap.alloc_closure(GcIdx::new(u32::MAX), Vec::new())),
            ObjectKind::NativeClosure => ObjRef::NativeClosure(self.heap.alloc_native(unlinked_native, Vec::new())),
            ObjectKind::UserData => ObjRef::UserData(self.heap.alloc_userdata(Vec::new())),
            ObjectKind::Thread => ObjRef::Thread(self.heap.alloc_thread()),
            ObjectKind::Proto => ObjRef::Proto(self.heap.alloc_proto(Proto::new())),
            ObjectKind::UpVal => ObjRef::UpVal(self.heap.alloc_upval(UpValLocation::Closed(Value::Nil))),
        };
        self.fresh.push(obj);
        Ok(obj)
    }

    // ---- Lookups ----

    fn object(&self, (kind, id): WireRef, at: Location) -> Result<ObjRef, RestoreError> {
        match self.ids.resolve(id) {
            Resolution::Ready(obj) if obj.kind() == kind => Ok(obj),
            Resolution::Ready(obj) => Err(corrupt(
                self.phase,
                at,
                format!("id {id} is a {}, not a {kind}", obj.kind()),
            )),
            Resolution::Pending | Resolution::Unknown => Err(RestoreError::UnresolvedId { id, path: at.path() }),
        }
    }

    fn typed<T: Linkable>(&self, r: WireRef, at: Location) -> Result<GcIdx<T>, RestoreError> {
        let obj = self.object(r, at)?;
        T::from_obj(obj).ok_or_else(|| corrupt(self.phase, at, format!("expected a {}, found a {}", T::KIND, obj.kind())))
    }

    fn typed_opt<T: Linkable>(&self, r: Option<WireRef>, at: Location) -> Result<Option<GcIdx<T>>, RestoreError> {
        r.map(|r| self.typed(r, at)).transpose()
    }

    fn typed_all<T: Linkable>(&self, refs: &[WireRef], at: Location) -> Result<Vec<GcIdx<T>>, RestoreError> {
        refs.iter().map(|&r| self.typed(r, at)).collect()
    }

    fn value(&self, w: WireValue, at: Location) -> Result<Value, RestoreError> {
        Ok(match w {
            WireValue::Nil => Value::Nil,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(bits) => Value::Float(f64::from_bits(bits)),
            WireValue::Ref(kind, id) => {
                let obj = self.object((kind, id), at)?;
                obj.to_value()
                    .ok_or_else(|| corrupt(self.phase, at, format!("a {kind} is not a first-class value")))?
            }
        })
    }

    fn values(&self, ws: &[WireValue], at: Location) -> Result<Vec<Value>, RestoreError> {
        ws.iter().map(|&w| self.value(w, at)).collect()
    }

    // ---- Phase 2 ----

    fn link(&mut self) -> Result<(), RestoreError> {
        self.phase = Phase::Link;
        let frame = self.frame;
        let descriptors = self.descriptors;
        for rec in &frame.records {
            let obj = match self.ids.resolve(rec.id) {
                Resolution::Ready(obj) => obj,
                _ => {
                    return Err(RestoreError::UnresolvedId {
                        id: rec.id,
                        path: "record table".into(),
                    })
                }
            };
            if obj.kind() == ObjectKind::String {
                continue;
            }
            let mut src = FieldSource::new(descriptors.get(rec.kind), rec, Phase::Link);
            match obj {
                ObjRef::String(_) => {}
                ObjRef::Table(t) => self.link_table(t, &mut src)?,
                ObjRef::LuaClosure(c) => self.link_closure(c, &mut src)?,
                ObjRef::NativeClosure(n) => self.link_native(n, rec.id, &mut src)?,
                ObjRef::UserData(u) => self.link_userdata(u, &mut src)?,
                ObjRef::Thread(t) => {
                    self.link_thread(t, &mut src)?;
                    self.threads.push((rec.id, t));
                }
                ObjRef::Proto(p) => self.link_proto(p, &mut src)?,
                ObjRef::UpVal(u) => {
                    if self.link_upval(u, &mut src)? {
                        self.open_upvals.push((rec.id, u));
                    }
                }
            }
            src.finish()?;
        }
        Ok(())
    }

    fn link_table(&mut self, t: GcIdx<Table>, src: &mut FieldSource<'_, 'b>) -> Result<(), RestoreError> {
        let phase = self.phase;
        let metatable = src.shared("metatable")?;
        let metatable = self.typed_opt::<Table>(metatable, src.at("metatable"))?;
        let array = src.custom("array", read_values)?;
        let array = self.values(&array, src.at("array"))?;

        let at = src.at("hash");
        let pairs = src.custom("hash", read_pairs)?;
        let mut hash = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            let key = TableKey::from_value(self.value(k, at)?).ok_or_else(|| corrupt(phase, at, "nil or NaN table key"))?;
            hash.push((key, self.value(v, at)?));
        }

        let table = self.heap.tables.get_mut(t).ok_or_else(|| vanished(phase, ObjRef::Table(t)))?;
        table.metatable = metatable;
        for v in array {
            table.push_array_raw(v);
        }
        for (k, v) in hash {
            table.insert_hash_raw(k, v);
        }
        Ok(())
    }

    fn link_closure(&mut self, c: GcIdx<LuaClosure>, src: &mut FieldSource<'_, 'b>) -> Result<(), RestoreError> {
        let phase = self.phase;
        let proto = src.owning("proto")?;
        let proto = self.typed::<Proto>(proto, src.at("proto"))?;
        let upvalues = src.shared_list("upvalues")?;
        let upvalues = self.typed_all::<UpVal>(&upvalues, src.at("upvalues"))?;

        let cl = self.heap.closures.get_mut(c).ok_or_else(|| vanished(phase, ObjRef::LuaClosure(c)))?;
        cl.proto = proto;
        cl.upvalues = upvalues;
        Ok(())
    }

    fn link_native(&mut self, n: GcIdx<NativeClosure>, id: u64, src: &mut FieldSource<'_, 'b>) -> Result<(), RestoreError> {
        let phase = self.phase;
        let name = src.value("function", |d| d.read_bytes())?;
        let name = std::str::from_utf8(name).map_err(|_| corrupt(phase, src.at("function"), "native name is not UTF-8"))?;
        let func = self.natives.function_of(name).ok_or_else(|| RestoreError::UnknownNative {
            name: name.to_string(),
            kind: ObjectKind::NativeClosure,
            id,
        })?;
        let upvalues = src.custom("upvalues", read_values)?;
        let upvalues = self.values(&upvalues, src.at("upvalues"))?;
        let env = src.shared("env")?;
        let env = self.typed_opt::<Table>(env, src.at("env"))?;

        let nc = self.heap.natives.get_mut(n).ok_or_else(|| vanished(phase, ObjRef::NativeClosure(n)))?;
        nc.func = func;
        nc.upvalues = upvalues;
        nc.env = env;
        Ok(())
    }

    fn link_userdata(&mut self, u: GcIdx<UserData>, src: &mut FieldSource<'_, 'b>) -> Result<(), RestoreError> {
        let phase = self.phase;
        let data = src.value("data", |d| d.read_bytes())?.to_vec();
        let metatable = src.shared("metatable")?;
        let metatable = self.typed_opt::<Table>(metatable, src.at("metatable"))?;
        let user_value = src.custom("user_value", |d| d.read_value())?;
        let user_value = self.value(user_value, src.at("user_value"))?;

        let ud = self.heap.userdata.get_mut(u).ok_or_else(|| vanished(phase, ObjRef::UserData(u)))?;
        ud.data = data;
        ud.metatable = metatable;
        ud.user_value = user_value;
        Ok(())
    }

    fn link_thread(&mut self, t: GcIdx<Thread>, src: &mut FieldSource<'_, 'b>) -> Result<(), RestoreError> {
        let phase = self.phase;
        let status = src.value("status", |d| d.read_u8())?;
        let status = ThreadStatus::from_tag(status)
            .ok_or_else(|| corrupt(phase, src.at("status"), format!("unknown thread status {status}")))?;
        let stack = src.custom("stack", read_values)?;
        let stack = self.values(&stack, src.at("stack"))?;
        let stack_top: usize = narrow(src.value("stack_top", |d| d.read_varint())?, phase, src.at("stack_top"))?;
        if stack_top > stack.len() {
            return Err(corrupt(
                phase,
                src.at("stack_top"),
                format!("stack top {stack_top} beyond {} slots", stack.len()),
            ));
        }

        let wire_frames = src.custom("frames", read_frames)?;
        let wire_open = src.custom("open_upvals", read_open_upvals)?;
        if !self.deep && (!wire_frames.is_empty() || !wire_open.is_empty()) {
            return Err(corrupt(phase, src.at("frames"), "execution state in a snapshot without deep threads"));
        }

        let at = src.at("frames");
        let mut frames = Vec::with_capacity(wire_frames.len());
        for f in wire_frames {
            frames.push(CallFrame {
                closure: self.typed_opt::<LuaClosure>(f.closure, at)?,
                func_stack_idx: narrow(f.func_stack_idx, phase, at)?,
                base: narrow(f.base, phase, at)?,
                pc: narrow(f.pc, phase, at)?,
                num_results: i32::try_from(f.num_results)
                    .map_err(|_| corrupt(phase, at, format!("result count {} out of range", f.num_results)))?,
                tail_calls: narrow(f.tail_calls, phase, at)?,
            });
        }

        let at = src.at("open_upvals");
        let mut open_upvals = Vec::with_capacity(wire_open.len());
        for (slot, uv) in wire_open {
            open_upvals.push((narrow(slot, phase, at)?, self.typed::<UpVal>(uv, at)?));
        }

        let hook_func = src.custom("hook_func", |d| d.read_value())?;
        let hook_func = self.value(hook_func, src.at("hook_func"))?;
        let hook_mask = src.value("hook_mask", |d| d.read_u8())?;
        let hook_count = narrow(src.value("hook_count", |d| d.read_varint())?, phase, src.at("hook_count"))?;

        let th = self.heap.threads.get_mut(t).ok_or_else(|| vanished(phase, ObjRef::Thread(t)))?;
        th.status = status;
        th.stack = stack;
        th.stack_top = stack_top;
        th.frames = frames;
        th.open_upvals = open_upvals;
        th.hook_func = hook_func;
        th.hook_mask = hook_mask;
        th.hook_count = hook_count;
        Ok(())
    }

    fn link_proto(&mut self, p: GcIdx<Proto>, src: &mut FieldSource<'_, 'b>) -> Result<(), RestoreError> {
        let phase = self.phase;
        let code = src.value("code", |d| {
            let n = d.read_len()?;
            let mut code = Vec::with_capacity(n);
            for _ in 0..n {
                code.push(d.read_u32()?);
            }
            Ok(code)
        })?;

        let at = src.at("constants");
        let mut constants = Vec::new();
        for k in src.custom("constants", read_values)? {
            constants.push(match k {
                WireValue::Nil => Constant::Nil,
                WireValue::Bool(b) => Constant::Boolean(b),
                WireValue::Int(i) => Constant::Integer(i),
                WireValue::Float(bits) => Constant::Float(f64::from_bits(bits)),
                WireValue::Ref(ObjectKind::String, id) => Constant::String(self.typed((ObjectKind::String, id), at)?),
                WireValue::Ref(kind, _) => return Err(corrupt(phase, at, format!("a {kind} cannot be a constant"))),
            });
        }

        let protos = src.owning_list("protos")?;
        let protos = self.typed_all::<Proto>(&protos, src.at("protos"))?;

        let at = src.at("upvalues");
        let mut upvalues = Vec::new();
        for u in src.custom("upvalues", read_upval_descs)? {
            upvalues.push(UpvalDesc {
                name: self.typed_opt(u.name, at)?,
                in_stack: u.in_stack,
                index: u.index,
                kind: u.kind,
            });
        }

        let num_params = src.value("num_params", |d| d.read_u8())?;
        let is_vararg = src.value("is_vararg", |d| d.read_u8())? != 0;
        let max_stack_size = src.value("max_stack_size", |d| d.read_u8())?;
        let source = src.shared("source")?;
        let source = self.typed_opt::<LuaString>(source, src.at("source"))?;
        let linedefined = narrow(src.value("linedefined", |d| d.read_varint())?, phase, src.at("linedefined"))?;
        let lastlinedefined = narrow(
            src.value("lastlinedefined", |d| d.read_varint())?,
            phase,
            src.at("lastlinedefined"),
        )?;

        let at = src.at("line_info");
        let raw_lines = src.value("line_info", |d| {
            let n = d.read_len()?;
            let mut lines = Vec::with_capacity(n);
            for _ in 0..n {
                lines.push(d.read_varint()?);
            }
            Ok(lines)
        })?;
        let line_info = raw_lines
            .into_iter()
            .map(|l| narrow(l, phase, at))
            .collect::<Result<Vec<u32>, _>>()?;

        let at = src.at("local_vars");
        let mut local_vars = Vec::new();
        for (name, start, end) in src.custom("local_vars", read_local_vars)? {
            local_vars.push(LocalVar {
                name: self.typed(name, at)?,
                start_pc: narrow(start, phase, at)?,
                end_pc: narrow(end, phase, at)?,
            });
        }

        let proto = self.heap.protos.get_mut(p).ok_or_else(|| vanished(phase, ObjRef::Proto(p)))?;
        proto.code = code;
        proto.constants = constants;
        proto.protos = protos;
        proto.upvalues = upvalues;
        proto.num_params = num_params;
        proto.is_vararg = is_vararg;
        proto.max_stack_size = max_stack_size;
        proto.source = source;
        proto.linedefined = linedefined;
        proto.lastlinedefined = lastlinedefined;
        proto.line_info = line_info;
        proto.local_vars = local_vars;
        Ok(())
    }

    /// Returns true when the upvalue was restored open.
    fn link_upval(&mut self, u: GcIdx<UpVal>, src: &mut FieldSource<'_, 'b>) -> Result<bool, RestoreError> {
        let phase = self.phase;
        let at = src.at("location");
        let location = match src.custom("location", read_location)? {
            WireLocation::Closed(v) => UpValLocation::Closed(self.value(v, at)?),
            WireLocation::Open(_, _) if !self.deep => {
                return Err(corrupt(phase, at, "open upvalue in a snapshot without deep threads"));
            }
            WireLocation::Open(thread, slot) => {
                UpValLocation::Open {
                    thread: self.typed::<Thread>(thread, at)?,
                    slot: narrow(slot, phase, at)?,
                }
            }
        };
        let open = matches!(location, UpValLocation::Open { .. });
        self.heap.upvals.get_mut(u).ok_or_else(|| vanished(phase, ObjRef::UpVal(u)))?.location = location;
        Ok(open)
    }

    /// Deep snapshots carry execution state; check that frames, program
    /// counters and open upvalues agree with each other before the graph
    /// is handed out.
    fn validate_threads(&self) -> Result<(), RestoreError> {
        let phase = Phase::Link;
        let heap = &*self.heap;
        for &(id, t) in &self.threads {
            let th = heap.threads.get(t).ok_or_else(|| vanished(phase, ObjRef::Thread(t)))?;
            let at = Location::object(ObjectKind::Thread, id, "frames");
            if let Some(problem) = thread_shape_error(th.stack.len(), &th.frames, &th.open_upvals) {
                return Err(corrupt(phase, at, problem));
            }
            for (i, f) in th.frames.iter().enumerate() {
                let Some(c) = f.closure else { continue };
                let code_len = heap
                    .closures
                    .get(c)
                    .and_then(|cl| heap.protos.get(cl.proto))
                    .map(Proto::code_len)
                    .ok_or_else(|| vanished(phase, ObjRef::LuaClosure(c)))?;
                if f.pc > code_len {
                    return Err(corrupt(
                        phase,
                        at,
                        format!("frame {i}: pc {} beyond {code_len} instructions", f.pc),
                    ));
                }
            }
            for &(slot, uv) in &th.open_upvals {
                let bound = matches!(
                    heap.upvals.get(uv).map(|u| u.location),
                    Some(UpValLocation::Open { thread, slot: s }) if thread == t && s == slot
                );
                if !bound {
                    return Err(corrupt(
                        phase,
                        Location::object(ObjectKind::Thread, id, "open_upvals"),
                        format!("slot {slot} lists an upvalue that is not open on this thread"),
                    ));
                }
            }
        }

        for &(id, u) in &self.open_upvals {
            let Some(UpValLocation::Open { thread, slot }) = heap.upvals.get(u).map(|uv| uv.location) else {
                continue;
            };
            let listed = heap
                .threads
                .get(thread)
                .is_some_and(|th| th.open_upvals.iter().any(|&(s, o)| s == slot && o == u));
            if !listed {
                return Err(corrupt(
                    phase,
                    Location::object(ObjectKind::UpVal, id, "location"),
                    format!("open on slot {slot} but missing from the thread's open list"),
                ));
            }
        }
        Ok(())
    }

    // ---- Roots ----

    fn roots_decoder(&self) -> Decoder<'b> {
        Decoder::at_offset(self.frame.roots, self.frame.roots_offset)
    }

    fn roots_done(dec: &Decoder<'_>) -> Result<(), RestoreError> {
        if dec.is_empty() {
            Ok(())
        } else {
            Err(RestoreError::Framing {
                phase: Phase::Roots,
                offset: dec.offset(),
                detail: format!("{} trailing bytes in root section", dec.remaining()),
            })
        }
    }

    fn state_roots(&mut self) -> Result<StateRoots, RestoreError> {
        self.phase = Phase::Roots;
        let mut dec = self.roots_decoder();
        let read = |dec: &mut Decoder<'b>, at: Location| dec.read_ref().map_err(|e| decode_error(Phase::Roots, at, e));

        let at = Location::root("registry");
        let registry = self.typed::<Table>(read(&mut dec, at)?, at)?;
        let at = Location::root("globals");
        let globals = self.typed::<Table>(read(&mut dec, at)?, at)?;
        let at = Location::root("main_thread");
        let main_thread = self.typed::<Thread>(read(&mut dec, at)?, at)?;

        let at = Location::root("type_metatables");
        let mut type_metatables = [None; NUM_TYPE_TAGS];
        for slot in type_metatables.iter_mut() {
            let r = read_opt_ref(&mut dec).map_err(|e| decode_error(Phase::Roots, at, e))?;
            *slot = self.typed_opt::<Table>(r, at)?;
        }

        let at = Location::root("tm_names");
        let names = read_refs(&mut dec).map_err(|e| decode_error(Phase::Roots, at, e))?;
        let tm_names = self.typed_all::<LuaString>(&names, at)?;

        let at = Location::root("gc_params");
        let pause = dec.read_varint().map_err(|e| decode_error(Phase::Roots, at, e))?;
        let step_mul = dec.read_varint().map_err(|e| decode_error(Phase::Roots, at, e))?;
        let gc_params = GcParams {
            pause: narrow(pause, Phase::Roots, at)?,
            step_mul: narrow(step_mul, Phase::Roots, at)?,
        };
        Self::roots_done(&dec)?;

        Ok(StateRoots {
            registry,
            globals,
            main_thread,
            type_metatables,
            tm_names,
            gc_params,
        })
    }

    fn value_root(&mut self) -> Result<Value, RestoreError> {
        self.phase = Phase::Roots;
        let mut dec = self.roots_decoder();
        let at = Location::root("value");
        let w = dec.read_value().map_err(|e| decode_error(Phase::Roots, at, e))?;
        let v = self.value(w, at)?;
        Self::roots_done(&dec)?;
        Ok(v)
    }
}
