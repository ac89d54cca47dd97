//! Function prototypes: the immutable template a Lua closure is made from.
//!
//! A prototype lives on the heap like any other object, so a parent and
//! every closure built from it share it by index.

use crate::gc::GcIdx;
use crate::string::LuaString;

/// One encoded VM instruction.
pub type Instruction = u32;

/// Instruction-set revision. Anything that stores raw bytecode or program
/// counters is only valid against the same revision.
pub const BYTECODE_REVISION: u8 = 0x54;

/// Constant pool entry.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(GcIdx<LuaString>),
}

impl Constant {
    /// Identity for pooling: floats compare by bit pattern, so a NaN
    /// constant pools with itself and `0.0` stays apart from `-0.0`.
    fn same_as(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

/// How a closure built from this prototype finds an upvalue.
#[derive(Clone, Debug, PartialEq)]
pub struct UpvalDesc {
    pub name: Option<GcIdx<LuaString>>,
    /// Captured from the enclosing function's registers rather than from
    /// its upvalues.
    pub in_stack: bool,
    /// Register or upvalue slot in the enclosing function.
    pub index: u8,
    /// 0 regular, 1 const, 2 close, 3 to-be-closed.
    pub kind: u8,
}

/// Debug entry for a local variable, live over `start_pc..end_pc`.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalVar {
    pub name: GcIdx<LuaString>,
    pub start_pc: u32,
    pub end_pc: u32,
}

#[derive(Clone, Debug)]
pub struct Proto {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Prototypes of functions defined inside this one.
    pub protos: Vec<GcIdx<Proto>>,
    pub upvalues: Vec<UpvalDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub source: Option<GcIdx<LuaString>>,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    /// Source line per instruction; same length as `code`.
    pub line_info: Vec<u32>,
    pub local_vars: Vec<LocalVar>,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2,
            source: None,
            linedefined: 0,
            lastlinedefined: 0,
            line_info: Vec::new(),
            local_vars: Vec::new(),
        }
    }

    /// Append an instruction tagged with its source line; returns its pc.
    pub fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.code.push(inst);
        self.line_info.push(line);
        self.code.len() - 1
    }

    /// Pool a constant, reusing an identical entry if there is one.
    pub fn add_constant(&mut self, k: Constant) -> usize {
        match self.constants.iter().position(|c| c.same_as(&k)) {
            Some(i) => i,
            None => {
                self.constants.push(k);
                self.constants.len() - 1
            }
        }
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Every string this prototype refers to: source name, string
    /// constants, upvalue names and local variable names.
    pub fn string_refs(&self) -> impl Iterator<Item = GcIdx<LuaString>> + '_ {
        let constants = self.constants.iter().filter_map(|k| match k {
            Constant::String(s) => Some(*s),
            _ => None,
        });
        self.source
            .into_iter()
            .chain(constants)
            .chain(self.upvalues.iter().filter_map(|u| u.name))
            .chain(self.local_vars.iter().map(|lv| lv.name))
    }
}

impl Default for Proto {
    fn default() -> Self {
        Self::new()
    }
}
