/// Interned Lua strings with SSO (Small String Optimization).
///
/// Every string, short or long, is interned: two live strings never share
/// the same contents, so string identity is content identity. Short strings
/// (<=40 bytes) are stored inline; longer ones are heap-allocated.
use crate::gc::{Arena, GcIdx};
use std::collections::HashMap;
use std::fmt;

/// Maximum bytes for inline (short) string storage.
const SSO_MAX: usize = 40;

#[derive(Clone)]
enum StringData {
    Short { buf: [u8; SSO_MAX], len: u8 },
    Long(Box<[u8]>),
}

/// A Lua string with precomputed hash.
#[derive(Clone)]
pub struct LuaString {
    data: StringData,
    hash: u32,
}

impl LuaString {
    fn new(bytes: &[u8], hash: u32) -> Self {
        let data = if bytes.len() <= SSO_MAX {
            let mut buf = [0u8; SSO_MAX];
            buf[..bytes.len()].copy_from_slice(bytes);
            StringData::Short {
                buf,
                len: bytes.len() as u8,
            }
        } else {
            StringData::Long(bytes.into())
        };
        LuaString { data, hash }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            StringData::Short { buf, len } => &buf[..*len as usize],
            StringData::Long(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this is a short (inline) string.
    pub fn is_short(&self) -> bool {
        matches!(&self.data, StringData::Short { .. })
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = std::str::from_utf8(self.as_bytes()) {
            write!(f, "\"{}\"", s)
        } else {
            write!(f, "<binary string len={}>", self.len())
        }
    }
}

/// PUC Lua compatible hash function (luaS_hash algorithm).
pub fn lua_hash(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    // Hash step: skip some bytes for long strings
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h = h ^ ((h << 5).wrapping_add(h >> 2).wrapping_add(bytes[i - 1] as u32));
        i -= step;
    }
    h
}

/// String interner: owns all strings and guarantees one object per content.
pub struct StringInterner {
    strings: Arena<LuaString>,
    /// hash -> slot indices with that hash.
    lookup: HashMap<u32, Vec<u32>>,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner {
            strings: Arena::new(),
            lookup: HashMap::new(),
        }
    }

    /// Intern `bytes`, returning the existing string when one matches.
    pub fn intern(&mut self, bytes: &[u8]) -> GcIdx<LuaString> {
        self.intern_with_status(bytes).0
    }

    /// Like [`intern`](Self::intern), also reporting whether a new string
    /// object was created.
    pub fn intern_with_status(&mut self, bytes: &[u8]) -> (GcIdx<LuaString>, bool) {
        let hash = lua_hash(bytes);
        if let Some(id) = self.find_hashed(bytes, hash) {
            return (id, false);
        }
        let id = self.strings.alloc(LuaString::new(bytes, hash));
        self.lookup.entry(hash).or_default().push(id.index());
        (id, true)
    }

    /// Look up an already-interned string without creating one.
    pub fn find(&self, bytes: &[u8]) -> Option<GcIdx<LuaString>> {
        self.find_hashed(bytes, lua_hash(bytes))
    }

    fn find_hashed(&self, bytes: &[u8], hash: u32) -> Option<GcIdx<LuaString>> {
        self.lookup.get(&hash)?.iter().map(|&i| GcIdx::new(i)).find(|&id| {
            self.strings
                .get(id)
                .is_some_and(|s| s.as_bytes() == bytes)
        })
    }

    pub fn get(&self, id: GcIdx<LuaString>) -> Option<&LuaString> {
        self.strings.get(id)
    }

    /// Get the raw bytes of a live string.
    ///
    /// # Panics
    /// Panics if `id` has been freed.
    pub fn get_bytes(&self, id: GcIdx<LuaString>) -> &[u8] {
        self.strings.get(id).expect("string was freed").as_bytes()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (GcIdx<LuaString>, &LuaString)> {
        self.strings.iter()
    }

    /// Drop a string and its lookup entry. Returns false if it was not live.
    pub fn free(&mut self, id: GcIdx<LuaString>) -> bool {
        match self.strings.free(id) {
            Some(s) => {
                self.unlink(s.hash, id);
                true
            }
            None => false,
        }
    }

    fn unlink(&mut self, hash: u32, id: GcIdx<LuaString>) {
        if let Some(ids) = self.lookup.get_mut(&hash) {
            ids.retain(|&i| i != id.index());
            if ids.is_empty() {
                self.lookup.remove(&hash);
            }
        }
    }

    pub(crate) fn mark(&mut self, id: GcIdx<LuaString>) -> bool {
        self.strings.mark(id)
    }

    pub(crate) fn is_marked(&self, id: GcIdx<LuaString>) -> bool {
        self.strings.is_marked(id)
    }

    pub(crate) fn clear_marks(&mut self) {
        self.strings.clear_marks();
    }

    /// Free unmarked strings. Returns how many were freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let dead: Vec<(u32, GcIdx<LuaString>)> = self
            .strings
            .iter()
            .filter(|&(id, _)| !self.strings.is_marked(id))
            .map(|(id, s)| (s.hash, id))
            .collect();
        for &(hash, id) in &dead {
            self.strings.free(id);
            self.unlink(hash, id);
        }
        dead.len()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StringInterner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StringInterner(len={})", self.len())
    }
}
