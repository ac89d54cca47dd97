//! Selune core types: the heap, values, strings, and the objects a running
//! interpreter is built from.

pub mod gc;
pub mod object;
pub mod proto;
pub mod state;
pub mod string;
pub mod table;
pub mod thread;
pub mod value;
