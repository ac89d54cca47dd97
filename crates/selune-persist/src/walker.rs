//! Capture: walk the object graph from the roots and encode every reachable
//! object exactly once.
//!
//! Objects get ids in breadth-first discovery order. Roots are visited
//! first in a fixed order, then the queue is drained; since the queue is
//! FIFO, records come out in id order.

use crate::codec::{self, Encoder, Header, WireValue, FLAG_DEEP_THREADS, FLAG_SINGLE_VALUE, VERSION};
use crate::config::{SnapshotConfig, ThreadPolicy, UnserializablePolicy};
use crate::descriptor::{DescriptorSet, FieldClass, FieldDescriptor, KindDescriptor};
use crate::error::{CaptureError, DescriptorError, Location};
use crate::identity::CaptureIds;
use crate::natives::NativeRegistry;
use selune_core::gc::{GcHeap, GcIdx};
use selune_core::object::{LuaClosure, NativeClosure, ObjRef, ObjectKind, UpVal, UpValLocation, UserData};
use selune_core::proto::{Constant, Proto, BYTECODE_REVISION};
use selune_core::state::LuaState;
use selune_core::table::Table;
use selune_core::thread::{CallFrame, Thread, ThreadStatus};
use selune_core::value::Value;
use std::collections::VecDeque;
use std::fmt;

/// An encoded snapshot plus everything capture had to report.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub bytes: Vec<u8>,
    pub object_count: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// What capture did to a value it could not persist as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticAction {
    /// Written as nil.
    SubstitutedNil,
    /// A table entry whose key or value could not be written was left out.
    DroppedEntry,
    /// An open upvalue was written as closed over its current value.
    ClosedUpvalue,
    /// A thread's frames were discarded and the thread marked dead.
    ResetThread,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Field path of the affected slot, e.g. `table#4.hash`.
    pub path: String,
    pub action: DiagnosticAction,
    pub detail: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?} ({})", self.path, self.action, self.detail)
    }
}

const NOT_REGISTERED: &str = "not in the native registry";

/// Names a native closure by its heap identity and the host function
/// it wraps.
fn native_label(idx: GcIdx<NativeClosure>, nc: &NativeClosure) -> String {
    format!(
        "{} #{} (native function {:#x})",
        ObjectKind::NativeClosure,
        idx.index(),
        nc.func_addr()
    )
}

/// Frame and open-upvalue bounds a thread must satisfy to be persisted or
/// revived. Returns a description of the first violation.
pub(crate) fn thread_shape_error(
    stack_len: usize,
    frames: &[CallFrame],
    open_upvals: &[(usize, GcIdx<UpVal>)],
) -> Option<String> {
    for (i, f) in frames.iter().enumerate() {
        if f.func_stack_idx > f.base || f.base > stack_len {
            return Some(format!(
                "frame {i}: function slot {} / base {} outside stack of {stack_len}",
                f.func_stack_idx, f.base
            ));
        }
    }
    open_upvals
        .iter()
        .find(|(slot, _)| *slot >= stack_len)
        .map(|(slot, _)| format!("open upvalue slot {slot} beyond stack of {stack_len}"))
}

// ---------------------------------------------------------------------------
// Field sink
// ---------------------------------------------------------------------------

/// Writes one object's payload, enforcing the kind's descriptor: fields
/// must be written in declared order with their declared class, excluded
/// fields are skipped, and every persisted field must be written.
pub(crate) struct FieldSink<'d> {
    desc: &'d KindDescriptor,
    next: usize,
    enc: Encoder,
}

type WireRef = (ObjectKind, u64);

impl<'d> FieldSink<'d> {
    pub fn new(desc: &'d KindDescriptor) -> Self {
        FieldSink {
            desc,
            next: 0,
            enc: Encoder::new(),
        }
    }

    fn open(&mut self, name: &'static str, class: FieldClass) -> Result<&'d FieldDescriptor, DescriptorError> {
        let desc: &'d KindDescriptor = self.desc;
        while desc.fields.get(self.next).is_some_and(|f| !f.class.is_persisted()) {
            self.next += 1;
        }
        match desc.fields.get(self.next) {
            Some(f) if f.name == name && f.class == class => {
                // Descriptor validation caps field counts at 255.
                self.enc.write_u8(self.next as u8);
                self.next += 1;
                Ok(f)
            }
            _ => Err(DescriptorError::FieldOrder {
                kind: desc.kind,
                field: name,
            }),
        }
    }

    fn check_target(&self, field: &FieldDescriptor, target: ObjectKind) -> Result<(), DescriptorError> {
        if field.targets.contains(&target) {
            Ok(())
        } else {
            Err(DescriptorError::TargetKind {
                kind: self.desc.kind,
                field: field.name,
                target,
            })
        }
    }

    pub fn value(&mut self, name: &'static str) -> Result<&mut Encoder, DescriptorError> {
        self.open(name, FieldClass::Value)?;
        Ok(&mut self.enc)
    }

    pub fn custom(&mut self, name: &'static str) -> Result<&mut Encoder, DescriptorError> {
        self.open(name, FieldClass::Custom)?;
        Ok(&mut self.enc)
    }

    pub fn owning(&mut self, name: &'static str, (kind, id): WireRef) -> Result<(), DescriptorError> {
        let f = self.open(name, FieldClass::Owning)?;
        self.check_target(f, kind)?;
        self.enc.write_ref(kind, id);
        Ok(())
    }

    pub fn owning_list(&mut self, name: &'static str, refs: &[WireRef]) -> Result<(), DescriptorError> {
        let f = self.open(name, FieldClass::Owning)?;
        self.write_ref_list(f, refs)
    }

    pub fn shared(&mut self, name: &'static str, target: Option<WireRef>) -> Result<(), DescriptorError> {
        let f = self.open(name, FieldClass::Shared)?;
        match target {
            None => self.enc.write_u8(0),
            Some((kind, id)) => {
                self.check_target(f, kind)?;
                self.enc.write_u8(1);
                self.enc.write_ref(kind, id);
            }
        }
        Ok(())
    }

    pub fn shared_list(&mut self, name: &'static str, refs: &[WireRef]) -> Result<(), DescriptorError> {
        let f = self.open(name, FieldClass::Shared)?;
        self.write_ref_list(f, refs)
    }

    fn write_ref_list(&mut self, f: &FieldDescriptor, refs: &[WireRef]) -> Result<(), DescriptorError> {
        for &(kind, _) in refs {
            self.check_target(f, kind)?;
        }
        self.enc.write_len(refs.len());
        for &(kind, id) in refs {
            self.enc.write_ref(kind, id);
        }
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>, DescriptorError> {
        if let Some(f) = self.desc.fields[self.next..].iter().find(|f| f.class.is_persisted()) {
            return Err(DescriptorError::Incomplete {
                kind: self.desc.kind,
                field: f.name,
            });
        }
        Ok(self.enc.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Capturer
// ---------------------------------------------------------------------------

pub(crate) struct Capturer<'a> {
    state: &'a LuaState,
    descriptors: &'a DescriptorSet,
    natives: &'a NativeRegistry,
    config: &'a SnapshotConfig,
    ids: CaptureIds,
    queue: VecDeque<(ObjRef, u64)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Capturer<'a> {
    pub fn new(
        state: &'a LuaState,
        descriptors: &'a DescriptorSet,
        natives: &'a NativeRegistry,
        config: &'a SnapshotConfig,
    ) -> Self {
        Capturer {
            state,
            descriptors,
            natives,
            config,
            ids: CaptureIds::new(),
            queue: VecDeque::new(),
            diagnostics: Vec::new(),
        }
    }

    fn heap(&self) -> &'a GcHeap {
        &self.state.heap
    }

    fn deep(&self) -> bool {
        self.config.threads == ThreadPolicy::Deep
    }

    /// Capture the whole runtime: registry, globals, main thread, per-type
    /// metatables, metamethod names and collector parameters.
    pub fn capture_state(mut self) -> Result<Snapshot, CaptureError> {
        let state = self.state;
        let roots = state.roots();
        let mut enc = Encoder::new();

        let registry = self.required(ObjRef::Table(roots.registry), Location::root("registry"))?;
        let globals = self.required(ObjRef::Table(roots.globals), Location::root("globals"))?;
        let main = self.required(ObjRef::Thread(roots.main_thread), Location::root("main_thread"))?;
        for (kind, id) in [registry, globals, main] {
            enc.write_ref(kind, id);
        }

        for mt in roots.type_metatables {
            match mt {
                Some(t) => {
                    let (kind, id) = self.required(ObjRef::Table(t), Location::root("type_metatables"))?;
                    enc.write_u8(1);
                    enc.write_ref(kind, id);
                }
                None => enc.write_u8(0),
            }
        }

        enc.write_len(roots.tm_names.len());
        for &name in &roots.tm_names {
            let (kind, id) = self.required(ObjRef::String(name), Location::root("tm_names"))?;
            enc.write_ref(kind, id);
        }

        enc.write_varint(u64::from(roots.gc_params.pause));
        enc.write_varint(u64::from(roots.gc_params.step_mul));

        self.finish(enc, 0)
    }

    /// Capture one value and everything reachable from it.
    pub fn capture_value(mut self, value: Value) -> Result<Snapshot, CaptureError> {
        let mut enc = Encoder::new();
        let w = self.wire(value, Location::root("value"))?;
        enc.write_value(w);
        self.finish(enc, FLAG_SINGLE_VALUE)
    }

    fn finish(mut self, roots: Encoder, mut flags: u8) -> Result<Snapshot, CaptureError> {
        let mut records = Encoder::new();
        while let Some((obj, id)) = self.queue.pop_front() {
            let payload = self.capture_object(obj, id)?;
            codec::write_record(&mut records, obj.kind(), id, &payload);
        }

        if self.deep() {
            flags |= FLAG_DEEP_THREADS;
        }
        let header = Header {
            version: VERSION,
            flags,
            bytecode_revision: BYTECODE_REVISION,
            object_count: self.ids.len() as u64,
        };
        let mut out = Encoder::new();
        header.write(&mut out);
        out.write_raw(records.as_bytes());
        codec::write_trailer(&mut out, roots.as_bytes());

        tracing::debug!(
            objects = self.ids.len(),
            bytes = out.len(),
            diagnostics = self.diagnostics.len(),
            "capture finished"
        );
        Ok(Snapshot {
            bytes: out.into_bytes(),
            object_count: self.ids.len(),
            diagnostics: self.diagnostics,
        })
    }

    // ---- References ----

    fn report(&mut self, at: Location, action: DiagnosticAction, detail: String) {
        self.diagnostics.push(Diagnostic {
            path: at.path(),
            action,
            detail,
        });
    }

    /// Apply the unserializable policy. `Ok` means the caller writes nil.
    fn unserializable(&mut self, at: Location, object: String, reason: &str) -> Result<(), CaptureError> {
        match self.config.unserializable {
            UnserializablePolicy::Abort => Err(CaptureError::Unserializable {
                object,
                path: at.path(),
                reason: reason.to_string(),
            }),
            UnserializablePolicy::SubstituteNil => {
                tracing::warn!(path = %at.path(), %object, reason, "substituting nil for unserializable value");
                self.report(at, DiagnosticAction::SubstitutedNil, format!("{object}: {reason}"));
                Ok(())
            }
        }
    }

    /// Id for a referenced object, queueing it on first sight. `None` when
    /// the object was substituted by nil.
    fn reference(&mut self, obj: ObjRef, at: Location) -> Result<Option<WireRef>, CaptureError> {
        let heap = self.heap();
        if !heap.contains(obj) {
            return Err(CaptureError::Dangling {
                kind: obj.kind(),
                index: obj.index(),
                path: at.path(),
            });
        }
        if let ObjRef::NativeClosure(n) = obj {
            if let Some(object) = self.unregistered(n) {
                self.unserializable(at, object, NOT_REGISTERED)?;
                return Ok(None);
            }
        }
        let (id, fresh) = self.ids.assign(obj);
        if fresh {
            self.queue.push_back((obj, id));
        }
        Ok(Some((obj.kind(), id)))
    }

    /// Label of a native closure whose function has no registered name.
    fn unregistered(&self, n: GcIdx<NativeClosure>) -> Option<String> {
        let nc = self.heap().natives.get(n)?;
        match self.natives.name_of(nc.func) {
            Some(_) => None,
            None => Some(native_label(n, nc)),
        }
    }

    /// What makes `v` impossible to write as-is, without assigning ids or
    /// queueing anything.
    fn unpersistable(&self, v: Value) -> Option<(String, &'static str)> {
        match v {
            Value::LightUserData(p) => Some((format!("light userdata {p:#x}"), "raw host pointer")),
            Value::Native(n) => self.unregistered(n).map(|object| (object, NOT_REGISTERED)),
            _ => None,
        }
    }

    /// Like [`reference`](Self::reference) for slots that cannot hold nil.
    fn required(&mut self, obj: ObjRef, at: Location) -> Result<WireRef, CaptureError> {
        self.reference(obj, at)?.ok_or_else(|| CaptureError::Unserializable {
            object: format!("{} #{}", obj.kind(), obj.index()),
            path: at.path(),
            reason: "slot cannot hold nil".to_string(),
        })
    }

    fn wire(&mut self, v: Value, at: Location) -> Result<WireValue, CaptureError> {
        Ok(match v {
            Value::Nil => WireValue::Nil,
            Value::Bool(b) => WireValue::Bool(b),
            Value::Int(i) => WireValue::Int(i),
            Value::Float(f) => WireValue::Float(f.to_bits()),
            Value::LightUserData(p) => {
                self.unserializable(at, format!("light userdata {p:#x}"), "raw host pointer")?;
                WireValue::Nil
            }
            other => match other.as_object() {
                Some(obj) => match self.reference(obj, at)? {
                    Some((kind, id)) => WireValue::Ref(kind, id),
                    None => WireValue::Nil,
                },
                None => WireValue::Nil,
            },
        })
    }

    fn wire_all(&mut self, values: &[Value], at: Location) -> Result<Vec<WireValue>, CaptureError> {
        values.iter().map(|&v| self.wire(v, at)).collect()
    }

    // ---- Objects ----

    fn capture_object(&mut self, obj: ObjRef, id: u64) -> Result<Vec<u8>, CaptureError> {
        let descriptors = self.descriptors;
        let mut sink = FieldSink::new(descriptors.get(obj.kind()));
        let heap = self.heap();
        let gone = || CaptureError::Dangling {
            kind: obj.kind(),
            index: obj.index(),
            path: format!("{}#{id}", obj.kind()),
        };
        match obj {
            ObjRef::String(s) => {
                let s = heap.strings.get(s).ok_or_else(gone)?;
                sink.value("bytes")?.write_bytes(s.as_bytes());
            }
            ObjRef::Table(t) => self.table(heap.tables.get(t).ok_or_else(gone)?, id, &mut sink)?,
            ObjRef::LuaClosure(c) => self.closure(heap.closures.get(c).ok_or_else(gone)?, id, &mut sink)?,
            ObjRef::NativeClosure(n) => self.native(n, heap.natives.get(n).ok_or_else(gone)?, id, &mut sink)?,
            ObjRef::UserData(u) => self.userdata(heap.userdata.get(u).ok_or_else(gone)?, id, &mut sink)?,
            ObjRef::Thread(t) => self.thread(heap.threads.get(t).ok_or_else(gone)?, id, &mut sink)?,
            ObjRef::Proto(p) => self.proto(heap.protos.get(p).ok_or_else(gone)?, id, &mut sink)?,
            ObjRef::UpVal(u) => self.upval(u, heap.upvals.get(u).ok_or_else(gone)?, id, &mut sink)?,
        }
        Ok(sink.finish()?)
    }

    fn table(&mut self, t: &'a Table, id: u64, sink: &mut FieldSink<'_>) -> Result<(), CaptureError> {
        let at = |field| Location::object(ObjectKind::Table, id, field);

        let mt = match t.metatable {
            Some(m) => self.reference(ObjRef::Table(m), at("metatable"))?,
            None => None,
        };
        sink.shared("metatable", mt)?;

        let array = self.wire_all(t.array_values(), at("array"))?;
        let enc = sink.custom("array")?;
        enc.write_len(array.len());
        for v in array {
            enc.write_value(v);
        }

        let mut pairs = Vec::with_capacity(t.hash_len());
        for (&k, &v) in t.hash_entries() {
            // Tombstone left by a removal.
            if v.is_nil() {
                continue;
            }
            // Both sides are checked before either is wired, so a dropped
            // entry leaves nothing queued behind it.
            let k = k.to_value();
            if let Some((object, reason)) = self.unpersistable(k).or_else(|| self.unpersistable(v)) {
                self.unserializable(at("hash"), object, reason)?;
                if let Some(d) = self.diagnostics.last_mut() {
                    d.action = DiagnosticAction::DroppedEntry;
                }
                continue;
            }
            let key = self.wire(k, at("hash"))?;
            let value = self.wire(v, at("hash"))?;
            pairs.push((key, value));
        }
        let enc = sink.custom("hash")?;
        enc.write_len(pairs.len());
        for (k, v) in pairs {
            enc.write_value(k);
            enc.write_value(v);
        }
        Ok(())
    }

    fn closure(&mut self, cl: &'a LuaClosure, id: u64, sink: &mut FieldSink<'_>) -> Result<(), CaptureError> {
        let at = |field| Location::object(ObjectKind::LuaClosure, id, field);
        let proto = self.required(ObjRef::Proto(cl.proto), at("proto"))?;
        sink.owning("proto", proto)?;
        let upvalues = cl
            .upvalues
            .iter()
            .map(|&u| self.required(ObjRef::UpVal(u), at("upvalues")))
            .collect::<Result<Vec<_>, _>>()?;
        sink.shared_list("upvalues", &upvalues)?;
        Ok(())
    }

    fn native(
        &mut self,
        idx: GcIdx<NativeClosure>,
        nc: &'a NativeClosure,
        id: u64,
        sink: &mut FieldSink<'_>,
    ) -> Result<(), CaptureError> {
        let at = |field| Location::object(ObjectKind::NativeClosure, id, field);
        let natives = self.natives;
        let name = natives.name_of(nc.func).ok_or_else(|| CaptureError::Unserializable {
            object: native_label(idx, nc),
            path: at("function").path(),
            reason: NOT_REGISTERED.to_string(),
        })?;
        sink.value("function")?.write_bytes(name.as_bytes());

        let upvalues = self.wire_all(&nc.upvalues, at("upvalues"))?;
        let enc = sink.custom("upvalues")?;
        enc.write_len(upvalues.len());
        for v in upvalues {
            enc.write_value(v);
        }

        let env = match nc.env {
            Some(t) => self.reference(ObjRef::Table(t), at("env"))?,
            None => None,
        };
        sink.shared("env", env)?;
        Ok(())
    }

    fn userdata(&mut self, ud: &'a UserData, id: u64, sink: &mut FieldSink<'_>) -> Result<(), CaptureError> {
        let at = |field| Location::object(ObjectKind::UserData, id, field);
        sink.value("data")?.write_bytes(&ud.data);
        let mt = match ud.metatable {
            Some(t) => self.reference(ObjRef::Table(t), at("metatable"))?,
            None => None,
        };
        sink.shared("metatable", mt)?;
        let uv = self.wire(ud.user_value, at("user_value"))?;
        sink.custom("user_value")?.write_value(uv);
        Ok(())
    }

    fn thread(&mut self, th: &'a Thread, id: u64, sink: &mut FieldSink<'_>) -> Result<(), CaptureError> {
        let at = |field| Location::object(ObjectKind::Thread, id, field);
        let no_frames: &[CallFrame] = &[];
        let no_upvals: &[(usize, GcIdx<UpVal>)] = &[];

        let (status, stack, frames, open) = if self.deep() {
            if let Some(problem) = thread_shape_error(th.live_stack().len(), &th.frames, &th.open_upvals) {
                return Err(CaptureError::Unserializable {
                    object: format!("thread #{id}"),
                    path: at("frames").path(),
                    reason: problem,
                });
            }
            (th.status, th.live_stack(), &th.frames[..], &th.open_upvals[..])
        } else if th.frames.is_empty() {
            (th.status, th.live_stack(), no_frames, no_upvals)
        } else {
            tracing::debug!(thread = id, frames = th.frames.len(), "resetting active thread");
            self.report(
                at("frames"),
                DiagnosticAction::ResetThread,
                format!("{} frames dropped", th.frames.len()),
            );
            (ThreadStatus::Dead, &[][..], no_frames, no_upvals)
        };

        sink.value("status")?.write_u8(status.tag());

        let values = self.wire_all(stack, at("stack"))?;
        let enc = sink.custom("stack")?;
        enc.write_len(values.len());
        for v in values {
            enc.write_value(v);
        }
        sink.value("stack_top")?.write_len(stack.len());

        let mut frame_refs = Vec::with_capacity(frames.len());
        for f in frames {
            let closure = match f.closure {
                Some(c) => Some(self.required(ObjRef::LuaClosure(c), at("frames"))?),
                None => None,
            };
            frame_refs.push((closure, f));
        }
        let enc = sink.custom("frames")?;
        enc.write_len(frame_refs.len());
        for (closure, f) in frame_refs {
            match closure {
                Some((kind, cid)) => {
                    enc.write_u8(1);
                    enc.write_ref(kind, cid);
                }
                None => enc.write_u8(0),
            }
            enc.write_len(f.func_stack_idx);
            enc.write_len(f.base);
            enc.write_len(f.pc);
            enc.write_i64(i64::from(f.num_results));
            enc.write_varint(u64::from(f.tail_calls));
        }

        let mut open_refs = Vec::with_capacity(open.len());
        for &(slot, uv) in open {
            open_refs.push((slot, self.required(ObjRef::UpVal(uv), at("open_upvals"))?));
        }
        let enc = sink.custom("open_upvals")?;
        enc.write_len(open_refs.len());
        for (slot, (kind, uid)) in open_refs {
            enc.write_len(slot);
            enc.write_ref(kind, uid);
        }

        let hook = self.wire(th.hook_func, at("hook_func"))?;
        sink.custom("hook_func")?.write_value(hook);
        sink.value("hook_mask")?.write_u8(th.hook_mask);
        sink.value("hook_count")?.write_varint(u64::from(th.hook_count));
        Ok(())
    }

    fn proto(&mut self, p: &'a Proto, id: u64, sink: &mut FieldSink<'_>) -> Result<(), CaptureError> {
        let at = |field| Location::object(ObjectKind::Proto, id, field);

        let enc = sink.value("code")?;
        enc.write_len(p.code.len());
        for &inst in &p.code {
            enc.write_u32(inst);
        }

        let mut constants = Vec::with_capacity(p.constants.len());
        for k in &p.constants {
            constants.push(match *k {
                Constant::Nil => WireValue::Nil,
                Constant::Boolean(b) => WireValue::Bool(b),
                Constant::Integer(i) => WireValue::Int(i),
                Constant::Float(f) => WireValue::Float(f.to_bits()),
                Constant::String(s) => {
                    let (kind, sid) = self.required(ObjRef::String(s), at("constants"))?;
                    WireValue::Ref(kind, sid)
                }
            });
        }
        let enc = sink.custom("constants")?;
        enc.write_len(constants.len());
        for k in constants {
            enc.write_value(k);
        }

        let children = p
            .protos
            .iter()
            .map(|&c| self.required(ObjRef::Proto(c), at("protos")))
            .collect::<Result<Vec<_>, _>>()?;
        sink.owning_list("protos", &children)?;

        let mut upvalues = Vec::with_capacity(p.upvalues.len());
        for u in &p.upvalues {
            let name = match u.name {
                Some(s) => Some(self.required(ObjRef::String(s), at("upvalues"))?),
                None => None,
            };
            upvalues.push((name, u));
        }
        let enc = sink.custom("upvalues")?;
        enc.write_len(upvalues.len());
        for (name, u) in upvalues {
            match name {
                Some((kind, sid)) => {
                    enc.write_u8(1);
                    enc.write_ref(kind, sid);
                }
                None => enc.write_u8(0),
            }
            enc.write_u8(u8::from(u.in_stack));
            enc.write_u8(u.index);
            enc.write_u8(u.kind);
        }

        sink.value("num_params")?.write_u8(p.num_params);
        sink.value("is_vararg")?.write_u8(u8::from(p.is_vararg));
        sink.value("max_stack_size")?.write_u8(p.max_stack_size);

        let source = match p.source {
            Some(s) => Some(self.required(ObjRef::String(s), at("source"))?),
            None => None,
        };
        sink.shared("source", source)?;

        sink.value("linedefined")?.write_varint(u64::from(p.linedefined));
        sink.value("lastlinedefined")?.write_varint(u64::from(p.lastlinedefined));

        let enc = sink.value("line_info")?;
        enc.write_len(p.line_info.len());
        for &line in &p.line_info {
            enc.write_varint(u64::from(line));
        }

        let mut locals = Vec::with_capacity(p.local_vars.len());
        for lv in &p.local_vars {
            locals.push((self.required(ObjRef::String(lv.name), at("local_vars"))?, lv));
        }
        let enc = sink.custom("local_vars")?;
        enc.write_len(locals.len());
        for ((kind, sid), lv) in locals {
            enc.write_ref(kind, sid);
            enc.write_varint(u64::from(lv.start_pc));
            enc.write_varint(u64::from(lv.end_pc));
        }
        Ok(())
    }

    fn upval(&mut self, idx: GcIdx<UpVal>, uv: &'a UpVal, id: u64, sink: &mut FieldSink<'_>) -> Result<(), CaptureError> {
        let at = Location::object(ObjectKind::UpVal, id, "location");
        match uv.location {
            UpValLocation::Open { thread, slot } if self.deep() => {
                let (kind, tid) = self.required(ObjRef::Thread(thread), at)?;
                let enc = sink.custom("location")?;
                enc.write_u8(1);
                enc.write_ref(kind, tid);
                enc.write_len(slot);
            }
            UpValLocation::Open { slot, .. } => {
                let current = self.state.get_upval_value(idx);
                self.report(at, DiagnosticAction::ClosedUpvalue, format!("closed over stack slot {slot}"));
                let v = self.wire(current, at)?;
                let enc = sink.custom("location")?;
                enc.write_u8(0);
                enc.write_value(v);
            }
            UpValLocation::Closed(v) => {
                let v = self.wire(v, at)?;
                let enc = sink.custom("location")?;
                enc.write_u8(0);
                enc.write_value(v);
            }
        }
        Ok(())
    }
}
