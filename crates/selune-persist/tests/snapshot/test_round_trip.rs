use super::helpers::*;
use selune_core::object::{ObjectKind, UpValLocation};
use selune_core::state::{GcParams, LuaState, REGISTRY_GLOBALS, REGISTRY_MAINTHREAD};
use selune_core::table::TableKey;
use selune_core::value::{Value, TAG_NUMBER, TAG_STRING};
use selune_persist::{summarize, SnapshotConfig, Snapshotter};

// ---- Scalars ----

#[test]
fn test_scalars_round_trip_bit_exact() {
    init_tracing();
    let mut st = LuaState::new();
    let nan_bits = 0x7FF8_0000_DEAD_BEEF_u64;
    st.set_global("int", Value::Int(42));
    st.set_global("min", Value::Int(i64::MIN));
    st.set_global("half", Value::Float(1.5));
    st.set_global("negzero", Value::Float(-0.0));
    st.set_global("inf", Value::Float(f64::INFINITY));
    st.set_global("nan", Value::Float(f64::from_bits(nan_bits)));
    st.set_global("yes", Value::Bool(true));
    st.set_global("no", Value::Bool(false));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    assert!(restored.get_global("int").identical(&Value::Int(42)));
    assert!(restored.get_global("min").identical(&Value::Int(i64::MIN)));
    assert!(restored.get_global("half").identical(&Value::Float(1.5)));
    assert!(restored.get_global("negzero").identical(&Value::Float(-0.0)));
    assert!(!restored.get_global("negzero").identical(&Value::Float(0.0)));
    assert!(restored.get_global("inf").identical(&Value::Float(f64::INFINITY)));
    assert_eq!(restored.get_global("nan").as_float().map(f64::to_bits), Some(nan_bits));
    assert!(restored.get_global("yes").identical(&Value::Bool(true)));
    assert!(restored.get_global("no").identical(&Value::Bool(false)));
}

#[test]
fn test_strings_round_trip() {
    let mut st = LuaState::new();
    let long = "a string long enough to live outside the inline buffer".repeat(3);
    let short = st.new_string("hello");
    let empty = st.new_string("");
    let long_v = st.new_string(&long);
    let binary = Value::String(st.heap.strings.intern(&[0, 0xFF, b'\n', 0x80]));
    st.set_global("short", short);
    st.set_global("empty", empty);
    st.set_global("long", long_v);
    st.set_global("binary", binary);

    let natives = registry();
    let restored = round_trip(&st, &natives);

    assert_eq!(str_of(&restored, restored.get_global("short")), "hello");
    assert_eq!(str_of(&restored, restored.get_global("empty")), "");
    assert_eq!(str_of(&restored, restored.get_global("long")), long);
    let b = restored.get_global("binary").as_string().unwrap();
    assert_eq!(restored.heap.strings.get_bytes(b), &[0, 0xFF, b'\n', 0x80]);
}

// ---- Tables ----

#[test]
fn test_table_layout_is_exact() {
    let mut st = LuaState::new();
    let t = st.new_table();
    {
        let tbl = st.heap.get_table_mut(t);
        tbl.raw_seti(1, Value::Int(10));
        tbl.raw_seti(2, Value::Int(20));
        tbl.raw_seti(3, Value::Int(30));
        // Leaves a hole inside the array part.
        tbl.raw_seti(2, Value::Nil);
        tbl.raw_seti(100, Value::Int(100));
        tbl.raw_set(Value::Float(2.5), Value::Bool(true)).unwrap();
        tbl.raw_set(Value::Bool(false), Value::Int(-1)).unwrap();
    }
    st.set_field(t, "zeta", Value::Int(1));
    st.set_field(t, "alpha", Value::Int(2));
    st.set_global("t", Value::Table(t));

    let natives = registry();
    let restored = round_trip(&st, &natives);
    let rt = global_table(&restored, "t");
    let tbl = restored.heap.get_table(rt);

    assert_eq!(tbl.array_len(), 3);
    assert!(tbl.array_values()[1].is_nil());
    assert_eq!(tbl.raw_geti(3), Value::Int(30));
    assert_eq!(tbl.raw_geti(100), Value::Int(100));
    assert!(tbl.raw_get(Value::Float(2.5)).identical(&Value::Bool(true)));
    assert_eq!(tbl.raw_get(Value::Bool(false)), Value::Int(-1));

    let keys: Vec<String> = tbl
        .hash_entries()
        .map(|(k, _)| match *k {
            TableKey::String(s) => String::from_utf8_lossy(restored.heap.strings.get_bytes(s)).into_owned(),
            other => format!("{other:?}"),
        })
        .collect();
    assert_eq!(keys, vec!["Integer(100)", "Float(4612811918334230528)", "Boolean(false)", "zeta", "alpha"]);
    assert_isomorphic(&st, &restored);
}

#[test]
fn test_nested_tables() {
    let mut st = LuaState::new();
    let outer = st.new_table();
    let mut parent = outer;
    for depth in 0..50 {
        let child = st.new_table();
        st.set_field(child, "depth", Value::Int(depth));
        st.set_field(parent, "next", Value::Table(child));
        parent = child;
    }
    st.set_global("chain", Value::Table(outer));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let mut cur = global_table(&restored, "chain");
    for depth in 0..50 {
        cur = table_of(restored.get_field(cur, "next"));
        assert_eq!(restored.get_field(cur, "depth"), Value::Int(depth));
    }
    assert!(restored.get_field(cur, "next").is_nil());
}

#[test]
fn test_metatables_round_trip() {
    let mut st = LuaState::new();
    let mt = st.new_table();
    st.set_field(mt, "__index", Value::Table(mt));
    let a = st.new_table();
    let b = st.new_table();
    st.heap.get_table_mut(a).metatable = Some(mt);
    st.heap.get_table_mut(b).metatable = Some(mt);
    st.set_global("a", Value::Table(a));
    st.set_global("b", Value::Table(b));

    let string_mt = st.new_table();
    st.set_field(string_mt, "kind", Value::Int(1));
    st.set_type_metatable(TAG_STRING, Some(string_mt));
    st.roots_mut().gc_params = GcParams {
        pause: 150,
        step_mul: 300,
    };

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let ra = global_table(&restored, "a");
    let rb = global_table(&restored, "b");
    let rmt = restored.metatable_of(Value::Table(ra)).unwrap();
    assert_eq!(restored.metatable_of(Value::Table(rb)), Some(rmt));
    assert!(restored.get_field(rmt, "__index").identical(&Value::Table(rmt)));

    let s = restored.heap.strings.find(b"kind").map(Value::String).unwrap();
    let rsmt = restored.metatable_of(s).unwrap();
    assert_eq!(restored.get_field(rsmt, "kind"), Value::Int(1));
    assert_eq!(restored.metatable_of(Value::Int(1)), None);
    assert!(restored.roots().type_metatables[TAG_NUMBER as usize].is_none());
    assert_eq!(restored.roots().gc_params, GcParams { pause: 150, step_mul: 300 });
}

// ---- Other kinds ----

#[test]
fn test_userdata_round_trip() {
    let mut st = LuaState::new();
    let ud = st.new_userdata(vec![1, 2, 3, 0xFE]);
    let mt = st.new_table();
    st.set_field(mt, "__name", Value::Int(7));
    let uv = st.new_table();
    {
        let u = st.heap.userdata.get_mut(ud).unwrap();
        u.metatable = Some(mt);
        u.user_value = Value::Table(uv);
    }
    st.set_global("ud", Value::UserData(ud));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let Value::UserData(rud) = restored.get_global("ud") else {
        panic!("ud did not restore as userdata");
    };
    let u = restored.heap.get_userdata(rud);
    assert_eq!(u.data, vec![1, 2, 3, 0xFE]);
    assert!(u.user_value.as_table().is_some());
    assert_isomorphic(&st, &restored);
}

#[test]
fn test_closure_and_proto_round_trip() {
    let mut st = LuaState::new();
    let proto = sample_proto(&mut st);
    let uv = st.heap.alloc_upval(UpValLocation::Closed(Value::Int(3)));
    let f = st.new_closure(proto, vec![uv]);
    st.set_global("f", Value::Closure(f));

    let natives = registry();
    let restored = round_trip(&st, &natives);

    let Value::Closure(rf) = restored.get_global("f") else {
        panic!("f did not restore as a closure");
    };
    let cl = restored.heap.get_closure(rf);
    let p = restored.heap.get_proto(cl.proto);
    assert_eq!(p.code, vec![0x0000_0003, 0x0001_0044, 0x0000_0046]);
    assert_eq!(p.line_info, vec![1, 2, 2]);
    assert_eq!(p.num_params, 2);
    assert!(p.is_vararg);
    assert_eq!(p.protos.len(), 1);
    assert_eq!(restored.get_upval_value(cl.upvalues[0]), Value::Int(3));
    assert_isomorphic(&st, &restored);
}

// ---- Whole-runtime properties ----

fn populated_state() -> LuaState {
    let mut st = LuaState::new();
    let proto = sample_proto(&mut st);
    let uv = st.heap.alloc_upval(UpValLocation::Closed(Value::Int(1)));
    let f = st.new_closure(proto, vec![uv]);
    let g = st.new_closure(proto, vec![uv]);
    let lib = st.new_table();
    let sum = st.new_native(native_sum, vec![Value::Int(5)]);
    st.set_field(lib, "sum", Value::Native(sum));
    st.set_field(lib, "f", Value::Closure(f));
    st.set_field(lib, "g", Value::Closure(g));
    let greeting = st.new_string("greeting");
    st.set_field(lib, "name", greeting);
    st.set_global("lib", Value::Table(lib));
    let co = st.new_thread(Value::Closure(f));
    st.set_global("co", Value::Thread(co));
    st
}

#[test]
fn test_restored_state_has_no_garbage() {
    let st = populated_state();
    let natives = registry();
    let s = snapshotter(&natives);
    let snap = s.capture(&st).unwrap();
    let mut restored = s.restore(&snap.bytes).unwrap();

    assert_eq!(restored.heap.object_count(), snap.object_count);
    assert_eq!(restored.collect_garbage(), 0);
    assert_eq!(restored.heap.object_count(), snap.object_count);
}

#[test]
fn test_capture_skips_unreachable_objects() {
    let mut st = populated_state();
    st.new_table();
    st.new_string("nobody refers to this");

    let natives = registry();
    let snap = snapshotter(&natives).capture(&st).unwrap();
    assert_eq!(snap.object_count, st.heap.object_count() - 2);

    st.collect_garbage();
    assert_eq!(snap.object_count, st.heap.object_count());
}

#[test]
fn test_registry_and_globals_wiring() {
    let st = populated_state();
    let natives = registry();
    let restored = round_trip(&st, &natives);

    let reg = restored.heap.get_table(restored.registry());
    assert!(reg.raw_geti(REGISTRY_MAINTHREAD).identical(&Value::Thread(restored.main_thread())));
    assert!(reg.raw_geti(REGISTRY_GLOBALS).identical(&Value::Table(restored.globals())));
    assert!(restored.get_global("_G").identical(&Value::Table(restored.globals())));
    assert_eq!(restored.roots().tm_names.len(), st.roots().tm_names.len());
    assert_eq!(str_of(&restored, Value::String(restored.roots().tm_names[0])), "__index");
    assert_isomorphic(&st, &restored);
}

#[test]
fn test_capture_is_deterministic() {
    let st = populated_state();
    let natives = registry();
    let s = snapshotter(&natives);
    let first = s.capture(&st).unwrap();
    let second = s.capture(&st).unwrap();
    assert_eq!(first.bytes, second.bytes);

    // Heap indices differ after a restore; the bytes do not.
    let restored = s.restore(&first.bytes).unwrap();
    assert_eq!(s.capture(&restored).unwrap().bytes, first.bytes);
}

#[test]
fn test_summary_matches_capture() {
    let st = populated_state();
    let natives = registry();
    let snap = snapshotter(&natives).capture(&st).unwrap();
    let summary = summarize(&snap.bytes).unwrap();

    assert_eq!(summary.total_objects(), snap.object_count);
    assert!(!summary.header.is_single_value());
    assert!(!summary.header.is_deep());
    assert_eq!(summary.count(ObjectKind::Proto), 2);
    assert_eq!(summary.count(ObjectKind::LuaClosure), 2);
    assert_eq!(summary.count(ObjectKind::NativeClosure), 1);
    assert_eq!(summary.count(ObjectKind::UpVal), 1);
    assert_eq!(summary.count(ObjectKind::Thread), 2);
    assert!(summary.to_string().contains("full-state"));
}

#[test]
fn test_config_from_toml_drives_capture() {
    let config = SnapshotConfig::from_toml_str(
        r#"
        threads = "deep"
        unserializable = "substitute_nil"
        "#,
    )
    .unwrap();
    let natives = registry();
    let s = Snapshotter::new(config, &natives).unwrap();
    let mut st = populated_state();
    st.set_global("ptr", Value::LightUserData(0x1000));

    let snap = s.capture(&st).unwrap();
    assert!(summarize(&snap.bytes).unwrap().header.is_deep());
    assert_eq!(snap.diagnostics.len(), 1);
    let restored = s.restore(&snap.bytes).unwrap();
    assert!(restored.get_global("ptr").is_nil());
}
