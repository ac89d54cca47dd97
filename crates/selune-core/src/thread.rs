//! Coroutine state: value stack, call frames, and open upvalues.

use crate::gc::GcIdx;
use crate::object::{LuaClosure, UpVal};
use crate::value::Value;

/// Coroutine lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Created or yielded — ready to be resumed.
    #[default]
    Suspended = 0,
    /// Currently executing.
    Running = 1,
    /// Resumed another coroutine (waiting for it to yield/finish).
    Normal = 2,
    /// Finished execution or errored out.
    Dead = 3,
}

impl ThreadStatus {
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ThreadStatus::Suspended),
            1 => Some(ThreadStatus::Running),
            2 => Some(ThreadStatus::Normal),
            3 => Some(ThreadStatus::Dead),
            _ => None,
        }
    }
}

/// A call frame on a thread's call stack.
#[derive(Clone, Debug, PartialEq)]
pub struct CallFrame {
    /// The closure being executed (None for native frames).
    pub closure: Option<GcIdx<LuaClosure>>,
    /// Stack position where the function value lives (for result placement).
    pub func_stack_idx: usize,
    /// Stack base for registers in this frame.
    pub base: usize,
    /// Program counter (index into proto.code).
    pub pc: usize,
    /// Expected number of results (-1 = multi-return).
    pub num_results: i32,
    /// Counter for tail calls to detect infinite tail recursion.
    pub tail_calls: u32,
}

impl CallFrame {
    pub fn new(closure: Option<GcIdx<LuaClosure>>, func_stack_idx: usize) -> Self {
        CallFrame {
            closure,
            func_stack_idx,
            base: func_stack_idx + 1,
            pc: 0,
            num_results: -1,
            tail_calls: 0,
        }
    }
}

/// A coroutine (the main thread is one as well).
#[derive(Debug, Default)]
pub struct Thread {
    pub stack: Vec<Value>,
    pub stack_top: usize,
    pub frames: Vec<CallFrame>,
    /// Open upvalues sorted by stack slot.
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    pub status: ThreadStatus,
    pub hook_func: Value,
    pub hook_mask: u8,
    pub hook_count: u32,
}

impl Thread {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a value, growing the stack as needed.
    pub fn push(&mut self, v: Value) {
        if self.stack_top < self.stack.len() {
            self.stack[self.stack_top] = v;
        } else {
            self.stack.push(v);
        }
        self.stack_top += 1;
    }

    /// Live portion of the stack.
    pub fn live_stack(&self) -> &[Value] {
        &self.stack[..self.stack_top.min(self.stack.len())]
    }

    /// Whether the thread is mid-execution (has frames or open upvalues).
    pub fn is_active(&self) -> bool {
        !self.frames.is_empty() || !self.open_upvals.is_empty()
    }
}
