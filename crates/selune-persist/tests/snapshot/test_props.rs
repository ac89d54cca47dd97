use super::helpers::*;
use proptest::prelude::*;
use selune_core::gc::GcIdx;
use selune_core::state::LuaState;
use selune_core::table::Table;
use selune_core::value::Value;
use selune_persist::summarize;

const NAMES: &[&str] = &["", "a", "b", "name", "__index", "a rather longer string key"];

#[derive(Clone, Debug)]
enum Key {
    Int(i64),
    Str(usize),
    Float(i32),
    Bool(bool),
    Table(usize),
}

#[derive(Clone, Debug)]
enum Val {
    Int(i64),
    Float(u64),
    Bool(bool),
    Str(usize),
    Table(usize),
    Native,
}

#[derive(Clone, Debug)]
enum Op {
    NewTable,
    Set { table: usize, key: Key, val: Val },
    Meta { table: usize, mt: Option<usize> },
}

fn key() -> impl Strategy<Value = Key> {
    prop_oneof![
        (-3i64..20).prop_map(Key::Int),
        (0..NAMES.len()).prop_map(Key::Str),
        any::<i32>().prop_map(Key::Float),
        any::<bool>().prop_map(Key::Bool),
        any::<usize>().prop_map(Key::Table),
    ]
}

fn val() -> impl Strategy<Value = Val> {
    prop_oneof![
        any::<i64>().prop_map(Val::Int),
        proptest::bits::u64::ANY.prop_map(Val::Float),
        any::<bool>().prop_map(Val::Bool),
        (0..NAMES.len()).prop_map(Val::Str),
        any::<usize>().prop_map(Val::Table),
        Just(Val::Native),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => Just(Op::NewTable),
        6 => (any::<usize>(), key(), val()).prop_map(|(table, key, val)| Op::Set { table, key, val }),
        1 => (any::<usize>(), proptest::option::of(any::<usize>())).prop_map(|(table, mt)| Op::Meta { table, mt }),
    ]
}

fn pick(tables: &[GcIdx<Table>], i: usize) -> GcIdx<Table> {
    tables[i % tables.len()]
}

/// Replay `ops` against a fresh runtime. Table indices wrap around the
/// tables created so far; the first table is reachable as `root`.
fn build(ops: &[Op]) -> LuaState {
    let mut st = LuaState::new();
    let sum = st.new_native(native_sum, vec![]);
    let mut tables: Vec<GcIdx<Table>> = vec![st.new_table()];
    st.set_global("root", Value::Table(tables[0]));
    for op in ops {
        match op {
            Op::NewTable => {
                let t = st.new_table();
                tables.push(t);
            }
            Op::Set { table, key, val } => {
                let k = match key {
                    Key::Int(i) => Value::Int(*i),
                    Key::Str(i) => st.new_string(NAMES[*i]),
                    Key::Float(i) => Value::Float(f64::from(*i) + 0.5),
                    Key::Bool(b) => Value::Bool(*b),
                    Key::Table(i) => Value::Table(pick(&tables, *i)),
                };
                let v = match val {
                    Val::Int(i) => Value::Int(*i),
                    Val::Float(bits) => Value::Float(f64::from_bits(*bits)),
                    Val::Bool(b) => Value::Bool(*b),
                    Val::Str(i) => st.new_string(NAMES[*i]),
                    Val::Table(i) => Value::Table(pick(&tables, *i)),
                    Val::Native => Value::Native(sum),
                };
                let t = pick(&tables, *table);
                st.heap.get_table_mut(t).raw_set(k, v).unwrap();
            }
            Op::Meta { table, mt } => {
                let t = pick(&tables, *table);
                let mt = mt.map(|i| pick(&tables, i));
                st.heap.get_table_mut(t).metatable = mt;
            }
        }
    }
    st
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_round_trip_is_isomorphic(ops in proptest::collection::vec(op(), 0..60)) {
        let st = build(&ops);
        let natives = registry();
        let s = snapshotter(&natives);
        let snap = s.capture(&st).unwrap();
        let mut restored = s.restore(&snap.bytes).unwrap();

        assert_isomorphic(&st, &restored);
        prop_assert_eq!(restored.heap.object_count(), snap.object_count);
        prop_assert_eq!(restored.collect_garbage(), 0);
    }

    #[test]
    fn prop_recapture_is_byte_identical(ops in proptest::collection::vec(op(), 0..60)) {
        let st = build(&ops);
        let natives = registry();
        let s = snapshotter(&natives);
        let snap = s.capture(&st).unwrap();
        let restored = s.restore(&snap.bytes).unwrap();
        prop_assert_eq!(s.capture(&restored).unwrap().bytes, snap.bytes);
    }

    #[test]
    fn prop_summary_agrees_with_capture(ops in proptest::collection::vec(op(), 0..60)) {
        let st = build(&ops);
        let natives = registry();
        let snap = snapshotter(&natives).capture(&st).unwrap();
        let summary = summarize(&snap.bytes).unwrap();
        prop_assert_eq!(summary.total_objects(), snap.object_count);
    }

    #[test]
    fn prop_value_snapshot_preserves_float_bits(bits in proptest::bits::u64::ANY) {
        let mut src = LuaState::new();
        let t = src.new_table();
        src.heap.get_table_mut(t).raw_seti(1, Value::Float(f64::from_bits(bits)));
        let natives = registry();
        let s = snapshotter(&natives);
        let snap = s.capture_value(&src, Value::Table(t)).unwrap();

        let mut dst = LuaState::new();
        let v = s.restore_value_into(&mut dst, &snap.bytes).unwrap();
        let got = dst.heap.get_table(table_of(v)).raw_geti(1);
        prop_assert_eq!(got.as_float().map(f64::to_bits), Some(bits));
    }
}
