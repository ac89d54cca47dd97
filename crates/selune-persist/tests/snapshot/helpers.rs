#![allow(dead_code)]

use selune_core::gc::GcIdx;
use selune_core::object::{NativeContext, NativeError, ObjRef, UpValLocation};
use selune_core::proto::{Constant, LocalVar, Proto, UpvalDesc};
use selune_core::state::LuaState;
use selune_core::table::Table;
use selune_core::value::Value;
use selune_persist::{NativeRegistry, SnapshotConfig, Snapshotter, ThreadPolicy, UnserializablePolicy};
use std::collections::HashMap;

/// Route `tracing` output through the test harness. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---- Natives ----
// Each body differs so no two share an address.

/// Sum of integer arguments plus the first upvalue.
pub fn native_sum(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let bias = ctx.upvalues.first().and_then(Value::as_integer).unwrap_or(0);
    let sum: i64 = ctx.args.iter().filter_map(Value::as_integer).sum();
    Ok(vec![Value::Int(sum + bias)])
}

/// Number of arguments.
pub fn native_count(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Ok(vec![Value::Int(ctx.args.len() as i64)])
}

/// Returns its upvalues.
pub fn native_upvalues(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Ok(ctx.upvalues.to_vec())
}

/// Never registered.
pub fn native_orphan(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Err(NativeError::Runtime(format!("orphan called with {} args", ctx.args.len())))
}

pub fn registry() -> NativeRegistry {
    let mut natives = NativeRegistry::new();
    natives.register("test.sum", native_sum).unwrap();
    natives.register("test.count", native_count).unwrap();
    natives.register("test.upvalues", native_upvalues).unwrap();
    natives
}

// ---- Configs ----

pub fn deep_config() -> SnapshotConfig {
    SnapshotConfig::builder().threads(ThreadPolicy::Deep).build().unwrap()
}

pub fn lenient_config() -> SnapshotConfig {
    SnapshotConfig::builder()
        .unserializable(UnserializablePolicy::SubstituteNil)
        .build()
        .unwrap()
}

pub fn snapshotter(natives: &NativeRegistry) -> Snapshotter<'_> {
    Snapshotter::new(SnapshotConfig::default(), natives).unwrap()
}

pub fn snapshotter_with(config: SnapshotConfig, natives: &NativeRegistry) -> Snapshotter<'_> {
    Snapshotter::new(config, natives).unwrap()
}

/// Capture with default settings and restore into a fresh runtime.
pub fn round_trip(st: &LuaState, natives: &NativeRegistry) -> LuaState {
    let s = snapshotter(natives);
    let snap = s.capture(st).unwrap_or_else(|e| panic!("capture failed: {e}"));
    s.restore(&snap.bytes).unwrap_or_else(|e| panic!("restore failed: {e}"))
}

// ---- Accessors ----

pub fn str_of(st: &LuaState, v: Value) -> String {
    let s = v.as_string().unwrap_or_else(|| panic!("expected a string, got {v:?}"));
    String::from_utf8_lossy(st.heap.strings.get_bytes(s)).into_owned()
}

pub fn table_of(v: Value) -> GcIdx<Table> {
    v.as_table().unwrap_or_else(|| panic!("expected a table, got {v:?}"))
}

pub fn global_table(st: &LuaState, name: &str) -> GcIdx<Table> {
    table_of(st.get_global(name))
}

/// A prototype with every debug field populated and one child.
pub fn sample_proto(st: &mut LuaState) -> GcIdx<Proto> {
    let mut child = Proto::new();
    child.emit(0x0000_0046, 3);
    child.source = Some(st.intern("@sample.lua"));
    let child = st.new_proto(child);

    let mut p = Proto::new();
    p.emit(0x0000_0003, 1);
    p.emit(0x0001_0044, 2);
    p.emit(0x0000_0046, 2);
    p.add_constant(Constant::String(st.intern("greeting")));
    p.add_constant(Constant::Float(f64::from_bits(0x7FF8_0000_0000_0ABC)));
    p.add_constant(Constant::Integer(-7));
    p.add_constant(Constant::Boolean(true));
    p.add_constant(Constant::Nil);
    p.protos.push(child);
    p.upvalues.push(UpvalDesc {
        name: Some(st.intern("_ENV")),
        in_stack: true,
        index: 0,
        kind: 0,
    });
    p.upvalues.push(UpvalDesc {
        name: None,
        in_stack: false,
        index: 3,
        kind: 2,
    });
    p.num_params = 2;
    p.is_vararg = true;
    p.max_stack_size = 6;
    p.source = Some(st.intern("@sample.lua"));
    p.linedefined = 10;
    p.lastlinedefined = 20;
    p.local_vars.push(LocalVar {
        name: st.intern("x"),
        start_pc: 0,
        end_pc: 3,
    });
    st.new_proto(p)
}

// ---- Graph comparison ----

/// Assert that two runtimes hold the same object graph: same shape, same
/// sharing, same scalar bits, starting from their roots.
pub fn assert_isomorphic(a: &LuaState, b: &LuaState) {
    let (ra, rb) = (a.roots(), b.roots());
    assert_eq!(ra.gc_params, rb.gc_params);
    let mut m = GraphMatch::new(a, b);
    m.pair_obj(ObjRef::Table(ra.registry), ObjRef::Table(rb.registry));
    m.pair_obj(ObjRef::Table(ra.globals), ObjRef::Table(rb.globals));
    m.pair_obj(ObjRef::Thread(ra.main_thread), ObjRef::Thread(rb.main_thread));
    for (x, y) in ra.type_metatables.iter().zip(&rb.type_metatables) {
        m.pair_opt_table(*x, *y);
    }
    assert_eq!(ra.tm_names.len(), rb.tm_names.len());
    for (&x, &y) in ra.tm_names.iter().zip(&rb.tm_names) {
        m.pair_obj(ObjRef::String(x), ObjRef::String(y));
    }
    m.run();
}

/// Assert that `x` in `a` and `y` in `b` are structurally the same value.
pub fn assert_same_value(a: &LuaState, x: Value, b: &LuaState, y: Value) {
    let mut m = GraphMatch::new(a, b);
    m.pair(x, y);
    m.run();
}

struct GraphMatch<'s> {
    a: &'s LuaState,
    b: &'s LuaState,
    forward: HashMap<ObjRef, ObjRef>,
    backward: HashMap<ObjRef, ObjRef>,
    work: Vec<(ObjRef, ObjRef)>,
}

impl<'s> GraphMatch<'s> {
    fn new(a: &'s LuaState, b: &'s LuaState) -> Self {
        GraphMatch {
            a,
            b,
            forward: HashMap::new(),
            backward: HashMap::new(),
            work: Vec::new(),
        }
    }

    fn pair_obj(&mut self, x: ObjRef, y: ObjRef) {
        assert_eq!(x.kind(), y.kind(), "{x:?} matched against {y:?}");
        match self.forward.get(&x) {
            Some(&seen) => assert_eq!(seen, y, "{x:?} is shared differently"),
            None => {
                assert!(self.backward.insert(y, x).is_none(), "{y:?} matched twice");
                self.forward.insert(x, y);
                self.work.push((x, y));
            }
        }
    }

    fn pair(&mut self, x: Value, y: Value) {
        match (x.as_object(), y.as_object()) {
            (Some(ox), Some(oy)) => self.pair_obj(ox, oy),
            (None, None) => assert!(x.identical(&y), "{x:?} vs {y:?}"),
            _ => panic!("{x:?} vs {y:?}"),
        }
    }

    fn pair_opt_table(&mut self, x: Option<GcIdx<Table>>, y: Option<GcIdx<Table>>) {
        match (x, y) {
            (Some(x), Some(y)) => self.pair_obj(ObjRef::Table(x), ObjRef::Table(y)),
            (None, None) => {}
            _ => panic!("metatable presence differs: {x:?} vs {y:?}"),
        }
    }

    fn run(&mut self) {
        while let Some((x, y)) = self.work.pop() {
            self.compare(x, y);
        }
    }

    fn compare(&mut self, x: ObjRef, y: ObjRef) {
        let (a, b) = (self.a, self.b);
        let (ha, hb) = (&a.heap, &b.heap);
        match (x, y) {
            (ObjRef::String(s), ObjRef::String(t)) => {
                assert_eq!(ha.strings.get_bytes(s), hb.strings.get_bytes(t));
            }
            (ObjRef::Table(s), ObjRef::Table(t)) => {
                let (ts, tt) = (ha.get_table(s), hb.get_table(t));
                assert_eq!(ts.array_len(), tt.array_len(), "array part of {x:?}");
                assert_eq!(ts.hash_len(), tt.hash_len(), "hash part of {x:?}");
                self.pair_opt_table(ts.metatable, tt.metatable);
                for (&v, &w) in ts.array_values().iter().zip(tt.array_values()) {
                    self.pair(v, w);
                }
                for ((k, &v), (l, &w)) in ts.hash_entries().zip(tt.hash_entries()) {
                    self.pair(k.to_value(), l.to_value());
                    self.pair(v, w);
                }
            }
            (ObjRef::LuaClosure(s), ObjRef::LuaClosure(t)) => {
                let (cs, ct) = (ha.get_closure(s), hb.get_closure(t));
                self.pair_obj(ObjRef::Proto(cs.proto), ObjRef::Proto(ct.proto));
                assert_eq!(cs.upvalues.len(), ct.upvalues.len());
                for (&u, &v) in cs.upvalues.iter().zip(&ct.upvalues) {
                    self.pair_obj(ObjRef::UpVal(u), ObjRef::UpVal(v));
                }
            }
            (ObjRef::NativeClosure(s), ObjRef::NativeClosure(t)) => {
                let (ns, nt) = (ha.get_native(s), hb.get_native(t));
                assert_eq!(ns.func_addr(), nt.func_addr());
                assert_eq!(ns.upvalues.len(), nt.upvalues.len());
                for (&v, &w) in ns.upvalues.iter().zip(&nt.upvalues) {
                    self.pair(v, w);
                }
                self.pair_opt_table(ns.env, nt.env);
            }
            (ObjRef::UserData(s), ObjRef::UserData(t)) => {
                let (us, ut) = (ha.get_userdata(s), hb.get_userdata(t));
                assert_eq!(us.data, ut.data);
                self.pair_opt_table(us.metatable, ut.metatable);
                self.pair(us.user_value, ut.user_value);
            }
            (ObjRef::Thread(s), ObjRef::Thread(t)) => {
                let (ts, tt) = (ha.get_thread(s), hb.get_thread(t));
                assert_eq!(ts.status, tt.status);
                assert_eq!(ts.live_stack().len(), tt.live_stack().len());
                for (&v, &w) in ts.live_stack().iter().zip(tt.live_stack()) {
                    self.pair(v, w);
                }
                assert_eq!(ts.frames.len(), tt.frames.len());
                for (f, g) in ts.frames.iter().zip(&tt.frames) {
                    assert_eq!(
                        (f.func_stack_idx, f.base, f.pc, f.num_results, f.tail_calls),
                        (g.func_stack_idx, g.base, g.pc, g.num_results, g.tail_calls)
                    );
                    match (f.closure, g.closure) {
                        (Some(c), Some(d)) => self.pair_obj(ObjRef::LuaClosure(c), ObjRef::LuaClosure(d)),
                        (None, None) => {}
                        other => panic!("frame closures differ: {other:?}"),
                    }
                }
                assert_eq!(ts.open_upvals.len(), tt.open_upvals.len());
                for (&(i, u), &(j, v)) in ts.open_upvals.iter().zip(&tt.open_upvals) {
                    assert_eq!(i, j);
                    self.pair_obj(ObjRef::UpVal(u), ObjRef::UpVal(v));
                }
                self.pair(ts.hook_func, tt.hook_func);
                assert_eq!((ts.hook_mask, ts.hook_count), (tt.hook_mask, tt.hook_count));
            }
            (ObjRef::Proto(s), ObjRef::Proto(t)) => {
                let (ps, pt) = (ha.get_proto(s), hb.get_proto(t));
                assert_eq!(ps.code, pt.code);
                assert_eq!(ps.constants.len(), pt.constants.len());
                for (k, l) in ps.constants.iter().zip(&pt.constants) {
                    match (k, l) {
                        (Constant::String(a), Constant::String(b)) => self.pair_obj(ObjRef::String(*a), ObjRef::String(*b)),
                        (Constant::Float(a), Constant::Float(b)) => assert_eq!(a.to_bits(), b.to_bits()),
                        (a, b) => assert_eq!(a, b),
                    }
                }
                assert_eq!(ps.protos.len(), pt.protos.len());
                for (&c, &d) in ps.protos.iter().zip(&pt.protos) {
                    self.pair_obj(ObjRef::Proto(c), ObjRef::Proto(d));
                }
                assert_eq!(ps.upvalues.len(), pt.upvalues.len());
                for (u, v) in ps.upvalues.iter().zip(&pt.upvalues) {
                    assert_eq!((u.in_stack, u.index, u.kind), (v.in_stack, v.index, v.kind));
                    match (u.name, v.name) {
                        (Some(a), Some(b)) => self.pair_obj(ObjRef::String(a), ObjRef::String(b)),
                        (None, None) => {}
                        other => panic!("upvalue names differ: {other:?}"),
                    }
                }
                assert_eq!(
                    (ps.num_params, ps.is_vararg, ps.max_stack_size, ps.linedefined, ps.lastlinedefined),
                    (pt.num_params, pt.is_vararg, pt.max_stack_size, pt.linedefined, pt.lastlinedefined)
                );
                match (ps.source, pt.source) {
                    (Some(a), Some(b)) => self.pair_obj(ObjRef::String(a), ObjRef::String(b)),
                    (None, None) => {}
                    other => panic!("sources differ: {other:?}"),
                }
                assert_eq!(ps.line_info, pt.line_info);
                assert_eq!(ps.local_vars.len(), pt.local_vars.len());
                for (u, v) in ps.local_vars.iter().zip(&pt.local_vars) {
                    assert_eq!((u.start_pc, u.end_pc), (v.start_pc, v.end_pc));
                    self.pair_obj(ObjRef::String(u.name), ObjRef::String(v.name));
                }
            }
            (ObjRef::UpVal(s), ObjRef::UpVal(t)) => match (ha.get_upval(s).location, hb.get_upval(t).location) {
                (UpValLocation::Closed(v), UpValLocation::Closed(w)) => self.pair(v, w),
                (UpValLocation::Open { thread: a, slot: i }, UpValLocation::Open { thread: b, slot: j }) => {
                    assert_eq!(i, j);
                    self.pair_obj(ObjRef::Thread(a), ObjRef::Thread(b));
                }
                other => panic!("upvalue locations differ: {other:?}"),
            },
            _ => unreachable!("kinds checked in pair_obj"),
        }
    }
}
