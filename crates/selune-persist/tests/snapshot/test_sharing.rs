use super::helpers::*;
use selune_core::object::{ObjectKind, UpValLocation};
use selune_core::proto::Proto;
use selune_core::state::LuaState;
use selune_core::value::Value;
use selune_persist::summarize;

// ---- Cycles ----

#[test]
fn test_self_cycle() {
    let mut st = LuaState::new();
    let t = st.new_table();
    st.set_field(t, "self", Value::Table(t));
    st.heap.get_table_mut(t).raw_seti(1, Value::Table(t));
    st.set_global("t", Value::Table(t));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let rt = global_table(&restored, "t");
    assert!(restored.get_field(rt, "self").identical(&Value::Table(rt)));
    assert!(restored.heap.get_table(rt).raw_geti(1).identical(&Value::Table(rt)));
}

#[test]
fn test_cycle_through_metatables() {
    let mut st = LuaState::new();
    let a = st.new_table();
    let b = st.new_table();
    st.heap.get_table_mut(a).metatable = Some(b);
    st.heap.get_table_mut(b).metatable = Some(a);
    st.set_global("a", Value::Table(a));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let ra = global_table(&restored, "a");
    let rb = restored.heap.get_table(ra).metatable.unwrap();
    assert_ne!(ra, rb);
    assert_eq!(restored.heap.get_table(rb).metatable, Some(ra));
}

#[test]
fn test_long_cycle() {
    let mut st = LuaState::new();
    let first = st.new_table();
    let mut prev = first;
    for i in 0..200 {
        let t = st.new_table();
        st.heap.get_table_mut(t).raw_seti(1, Value::Int(i));
        st.heap.get_table_mut(prev).raw_seti(2, Value::Table(t));
        prev = t;
    }
    st.heap.get_table_mut(prev).raw_seti(2, Value::Table(first));
    st.set_global("ring", Value::Table(first));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let start = global_table(&restored, "ring");
    let mut cur = start;
    for _ in 0..201 {
        cur = table_of(restored.heap.get_table(cur).raw_geti(2));
    }
    assert_eq!(cur, start);
    assert_isomorphic(&st, &restored);
}

// ---- Aliasing ----

#[test]
fn test_aliases_stay_aliased() {
    let mut st = LuaState::new();
    let shared = st.new_table();
    let holder = st.new_table();
    st.set_global("x", Value::Table(shared));
    st.set_global("y", Value::Table(shared));
    st.set_field(holder, "inner", Value::Table(shared));
    st.set_global("holder", Value::Table(holder));

    let natives = registry();
    let mut restored = round_trip(&st, &natives);

    let x = global_table(&restored, "x");
    let y = global_table(&restored, "y");
    let rh = global_table(&restored, "holder");
    assert_eq!(x, y);
    assert!(restored.get_field(rh, "inner").identical(&Value::Table(x)));

    restored.set_field(x, "written", Value::Int(9));
    assert_eq!(restored.get_field(y, "written"), Value::Int(9));
}

#[test]
fn test_closures_share_proto_and_upvalue() {
    let mut st = LuaState::new();
    let mut p = Proto::new();
    p.emit(0x0000_0001, 1);
    let proto = st.new_proto(p);
    let uv = st.heap.alloc_upval(UpValLocation::Closed(Value::Int(0)));
    let f = st.new_closure(proto, vec![uv]);
    let g = st.new_closure(proto, vec![uv]);
    st.set_global("f", Value::Closure(f));
    st.set_global("g", Value::Closure(g));

    let natives = registry();
    let mut restored = round_trip(&st, &natives);

    let (Value::Closure(rf), Value::Closure(rg)) = (restored.get_global("f"), restored.get_global("g")) else {
        panic!("closures did not restore");
    };
    assert_ne!(rf, rg);
    let (cf, cg) = (restored.heap.get_closure(rf), restored.heap.get_closure(rg));
    assert_eq!(cf.proto, cg.proto);
    assert_eq!(cf.upvalues, cg.upvalues);

    let uv = cf.upvalues[0];
    let other = cg.upvalues[0];
    restored.set_upval_value(uv, Value::Int(41));
    assert_eq!(restored.get_upval_value(other), Value::Int(41));
    assert_eq!(restored.heap.protos.len(), 1);
}

#[test]
fn test_object_keys_keep_identity() {
    let mut st = LuaState::new();
    let key = st.new_table();
    let t = st.new_table();
    let v = st.new_string("found");
    st.heap.get_table_mut(t).raw_set(Value::Table(key), v).unwrap();
    st.set_global("key", Value::Table(key));
    st.set_global("t", Value::Table(t));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let rk = global_table(&restored, "key");
    let rt = global_table(&restored, "t");
    let found = restored.heap.get_table(rt).raw_get(Value::Table(rk));
    assert_eq!(str_of(&restored, found), "found");
}

// ---- Interning ----

#[test]
fn test_each_string_written_once() {
    let mut st = LuaState::new();
    let s = st.new_string("everywhere");
    for i in 0..10 {
        let t = st.new_table();
        st.set_field(t, "name", s);
        st.heap.get_table_mut(t).raw_seti(1, s);
        st.set_global(&format!("t{i}"), Value::Table(t));
    }
    let natives = registry();
    let snapper = snapshotter(&natives);
    let snap = snapper.capture(&st).unwrap();
    let before = summarize(&snap.bytes).unwrap().count(ObjectKind::String);

    st.set_global("again", s);
    let snap2 = snapper.capture(&st).unwrap();
    // Only the new key "again" is added.
    assert_eq!(summarize(&snap2.bytes).unwrap().count(ObjectKind::String), before + 1);

    let restored = snapper.restore(&snap2.bytes).unwrap();
    let interned = restored.heap.strings.find(b"everywhere").unwrap();
    for i in 0..10 {
        let t = global_table(&restored, &format!("t{i}"));
        assert!(restored.get_field(t, "name").identical(&Value::String(interned)));
        assert!(restored.heap.get_table(t).raw_geti(1).identical(&Value::String(interned)));
    }
    assert!(restored.get_global("again").identical(&Value::String(interned)));
}

#[test]
fn test_registry_entries_round_trip() {
    let mut st = LuaState::new();
    let stash = st.new_table();
    st.set_field(stash, "hidden", Value::Int(5));
    let reg = st.registry();
    st.heap.get_table_mut(reg).raw_seti(3, Value::Table(stash));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let rreg = restored.registry();
    let rstash = table_of(restored.heap.get_table(rreg).raw_geti(3));
    assert_eq!(restored.get_field(rstash, "hidden"), Value::Int(5));
}
