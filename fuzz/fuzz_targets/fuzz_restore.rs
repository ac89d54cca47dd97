#![no_main]

use libfuzzer_sys::fuzz_target;
use selune_core::object::{NativeContext, NativeError};
use selune_core::state::LuaState;
use selune_core::value::Value;
use selune_persist::{NativeRegistry, SnapshotConfig, Snapshotter};

fn fuzz_native(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Ok(ctx.args.to_vec())
}

fuzz_target!(|data: &[u8]| {
    // Restore must reject bad input with an error, never a panic.
    let mut natives = NativeRegistry::new();
    let _ = natives.register("fuzz.native", fuzz_native);
    let Ok(s) = Snapshotter::new(SnapshotConfig::default(), &natives) else {
        return;
    };
    let _ = s.restore(data);

    // A failed value restore leaves the host runtime untouched.
    let mut st = LuaState::new();
    let before = st.heap.object_count();
    match s.restore_value_into(&mut st, data) {
        Ok(v) => {
            st.unpin(v);
        }
        Err(_) => assert_eq!(st.heap.object_count(), before),
    }
    let _ = selune_persist::summarize(data);
});
