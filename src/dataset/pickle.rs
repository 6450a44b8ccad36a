//! Restricted pickle decoder for `torch.save` payloads.
//!
//! The decoder runs the pickle stack machine without importing or calling
//! anything. Globals stay as names, `REDUCE`/`NEWOBJ` produce inert
//! [`Value::Object`] nodes and `BUILD` attaches their state. The only calls
//! that are interpreted are tensor rebuilds and `OrderedDict()`, which are
//! turned into [`Value::Tensor`] and [`Value::Dict`].
//!
//! Memoized values are snapshots taken when they are stored, so a value
//! fetched back from the memo does not see mutations applied afterwards.
//! The graph containers only rely on memo lookups for back references.

use std::collections::HashMap;

use crate::dataset::tensor::{DType, StorageRef, TensorRef};
use crate::error::DecodeError;

/// A decoded pickle object.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Global {
        module: String,
        name: String,
    },
    Object {
        class: Box<Value>,
        args: Box<Value>,
        state: Option<Box<Value>>,
    },
    PersistentId(Box<Value>),
    Storage(StorageRef),
    Tensor(TensorRef),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorRef> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Key/value pairs of a dict.
    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// The state attached by `BUILD`, if this is an object.
    pub fn state(&self) -> Option<&Value> {
        match self {
            Value::Object { state, .. } => state.as_deref(),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    fn is_global(&self, module: &str, name: &str) -> bool {
        matches!(self, Value::Global { module: m, name: n } if m == module && n == name)
    }
}

/// Decodes a complete pickle stream.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    Machine::new(bytes).run()
}

struct Machine<'a> {
    bytes: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl<'a> Machine<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Machine {
            bytes,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<Value, DecodeError> {
        loop {
            let offset = self.pos;
            let opcode = self.read_u8()?;
            match opcode {
                // PROTO
                0x80 => {
                    self.read_u8()?;
                }
                // FRAME
                0x95 => {
                    self.take(8)?;
                }
                // STOP
                b'.' => return self.pop(),
                b'N' => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                // BININT, BININT1, BININT2
                b'J' => {
                    let v = i32::from_le_bytes(self.array()?);
                    self.stack.push(Value::Int(v as i64));
                }
                b'K' => {
                    let v = self.read_u8()?;
                    self.stack.push(Value::Int(v as i64));
                }
                b'M' => {
                    let v = u16::from_le_bytes(self.array()?);
                    self.stack.push(Value::Int(v as i64));
                }
                // LONG1, LONG4
                0x8a => {
                    let n = self.read_u8()? as usize;
                    let v = self.read_long(n)?;
                    self.stack.push(Value::Int(v));
                }
                0x8b => {
                    let n = self.read_len4()?;
                    let v = self.read_long(n)?;
                    self.stack.push(Value::Int(v));
                }
                // BINFLOAT is big-endian
                b'G' => {
                    let v = f64::from_be_bytes(self.array()?);
                    self.stack.push(Value::Float(v));
                }
                // BINUNICODE, SHORT_BINUNICODE, BINUNICODE8
                b'X' => {
                    let n = self.read_len4()?;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                0x8c => {
                    let n = self.read_u8()? as usize;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                0x8d => {
                    let n = self.read_len8()?;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                // BINSTRING, SHORT_BINSTRING (protocol 2 str)
                b'T' => {
                    let n = self.read_len4()?;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                b'U' => {
                    let n = self.read_u8()? as usize;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                // BINBYTES, SHORT_BINBYTES, BINBYTES8
                b'B' => {
                    let n = self.read_len4()?;
                    let b = self.take(n)?.to_vec();
                    self.stack.push(Value::Bytes(b));
                }
                b'C' => {
                    let n = self.read_u8()? as usize;
                    let b = self.take(n)?.to_vec();
                    self.stack.push(Value::Bytes(b));
                }
                0x8e => {
                    let n = self.read_len8()?;
                    let b = self.take(n)?.to_vec();
                    self.stack.push(Value::Bytes(b));
                }
                b'}' => self.stack.push(Value::Dict(Vec::new())),
                b']' => self.stack.push(Value::List(Vec::new())),
                b')' => self.stack.push(Value::Tuple(Vec::new())),
                0x8f => self.stack.push(Value::Set(Vec::new())),
                b'(' => self.marks.push(self.stack.len()),
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                0x85 => {
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a]));
                }
                0x86 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b]));
                }
                0x87 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b, c]));
                }
                // LIST, DICT, FROZENSET from marked items
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                b'd' => {
                    let items = self.pop_mark()?;
                    let entries = pairs(items)?;
                    self.stack.push(Value::Dict(entries));
                }
                0x91 => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Set(items));
                }
                // APPEND, APPENDS
                b'a' => {
                    let item = self.pop()?;
                    self.extend_top(vec![item])?;
                }
                b'e' => {
                    let items = self.pop_mark()?;
                    self.extend_top(items)?;
                }
                // ADDITEMS
                0x90 => {
                    let items = self.pop_mark()?;
                    match self.top_mut()? {
                        Value::Set(set) => set.extend(items),
                        other => {
                            return Err(malformed(format!("ADDITEMS on {}", kind(other))));
                        }
                    }
                }
                // SETITEM, SETITEMS
                b's' => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.insert_top(vec![(key, value)])?;
                }
                b'u' => {
                    let items = self.pop_mark()?;
                    let entries = pairs(items)?;
                    self.insert_top(entries)?;
                }
                // POP, POP_MARK, DUP
                b'0' => {
                    self.pop()?;
                }
                b'1' => {
                    self.pop_mark()?;
                }
                b'2' => {
                    let top = self.top_mut()?.clone();
                    self.stack.push(top);
                }
                // BINPUT, LONG_BINPUT, MEMOIZE
                b'q' => {
                    let idx = self.read_u8()? as u32;
                    self.memoize(idx)?;
                }
                b'r' => {
                    let idx = u32::from_le_bytes(self.array()?);
                    self.memoize(idx)?;
                }
                0x94 => {
                    let idx = self.memo.len() as u32;
                    self.memoize(idx)?;
                }
                // BINGET, LONG_BINGET
                b'h' => {
                    let idx = self.read_u8()? as u32;
                    self.recall(idx)?;
                }
                b'j' => {
                    let idx = u32::from_le_bytes(self.array()?);
                    self.recall(idx)?;
                }
                // GLOBAL, STACK_GLOBAL
                b'c' => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Value::Global { module, name });
                }
                0x93 => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.stack.push(Value::Global { module, name })
                        }
                        _ => return Err(malformed("STACK_GLOBAL expects two strings")),
                    }
                }
                // REDUCE
                b'R' => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = reduce(callable, args)?;
                    self.stack.push(value);
                }
                // NEWOBJ, NEWOBJ_EX
                0x81 => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.stack.push(Value::Object {
                        class: Box::new(class),
                        args: Box::new(args),
                        state: None,
                    });
                }
                0x92 => {
                    let _kwargs = self.pop()?;
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.stack.push(Value::Object {
                        class: Box::new(class),
                        args: Box::new(args),
                        state: None,
                    });
                }
                // BUILD
                b'b' => {
                    let new_state = self.pop()?;
                    match self.top_mut()? {
                        Value::Object { state, .. } => *state = Some(Box::new(new_state)),
                        Value::Dict(entries) => match new_state {
                            Value::Dict(extra) => entries.extend(extra),
                            _ => return Err(malformed("BUILD on dict with non-dict state")),
                        },
                        other => return Err(malformed(format!("BUILD on {}", kind(other)))),
                    }
                }
                // BINPERSID
                b'Q' => {
                    let pid = self.pop()?;
                    let value = persistent_load(pid)?;
                    self.stack.push(value);
                }
                other => {
                    return Err(DecodeError::UnsupportedOpcode {
                        opcode: other,
                        offset,
                    });
                }
            }
        }
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DecodeError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_len4(&mut self) -> Result<usize, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?) as usize)
    }

    fn read_len8(&mut self) -> Result<usize, DecodeError> {
        usize::try_from(u64::from_le_bytes(self.array()?))
            .map_err(|_| malformed("length does not fit in memory"))
    }

    fn read_string(&mut self, n: usize) -> Result<String, DecodeError> {
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|e| malformed(format!("invalid utf-8: {e}")))
    }

    fn read_line(&mut self) -> Result<String, DecodeError> {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(DecodeError::Truncated(self.bytes.len()))?;
        let line = self.read_string(len)?;
        self.pos += 1;
        Ok(line)
    }

    /// Little-endian two's complement integer of `n` bytes.
    fn read_long(&mut self, n: usize) -> Result<i64, DecodeError> {
        if n > 8 {
            return Err(malformed(format!("{n}-byte integer does not fit in i64")));
        }
        let raw = self.take(n)?;
        if n == 0 {
            return Ok(0);
        }
        let fill = if raw[n - 1] & 0x80 != 0 { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        buf[..n].copy_from_slice(raw);
        Ok(i64::from_le_bytes(buf))
    }

    fn pop(&mut self) -> Result<Value, DecodeError> {
        if self.marks.last().is_some_and(|mark| *mark >= self.stack.len()) {
            return Err(malformed("pop across a mark"));
        }
        self.stack.pop().ok_or_else(|| malformed("stack underflow"))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, DecodeError> {
        let mark = self.marks.pop().ok_or_else(|| malformed("missing mark"))?;
        if mark > self.stack.len() {
            return Err(malformed("mark beyond stack"));
        }
        Ok(self.stack.split_off(mark))
    }

    fn top_mut(&mut self) -> Result<&mut Value, DecodeError> {
        self.stack
            .last_mut()
            .ok_or_else(|| malformed("stack underflow"))
    }

    fn extend_top(&mut self, items: Vec<Value>) -> Result<(), DecodeError> {
        match self.top_mut()? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(malformed(format!("APPEND on {}", kind(other)))),
        }
    }

    fn insert_top(&mut self, entries: Vec<(Value, Value)>) -> Result<(), DecodeError> {
        match self.top_mut()? {
            Value::Dict(dict) => {
                for (key, value) in entries {
                    match dict.iter_mut().find(|(k, _)| *k == key) {
                        Some(slot) => slot.1 = value,
                        None => dict.push((key, value)),
                    }
                }
                Ok(())
            }
            other => Err(malformed(format!("SETITEM on {}", kind(other)))),
        }
    }

    fn memoize(&mut self, idx: u32) -> Result<(), DecodeError> {
        let top = self.top_mut()?.clone();
        self.memo.insert(idx, top);
        Ok(())
    }

    fn recall(&mut self, idx: u32) -> Result<(), DecodeError> {
        let value = self
            .memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| malformed(format!("memo entry {idx} missing")))?;
        self.stack.push(value);
        Ok(())
    }
}

fn reduce(callable: Value, args: Value) -> Result<Value, DecodeError> {
    if callable.is_global("torch._utils", "_rebuild_tensor_v2")
        || callable.is_global("torch._utils", "_rebuild_tensor")
    {
        return rebuild_tensor(args).map(Value::Tensor);
    }

    if callable.is_global("collections", "OrderedDict")
        && args.as_seq().is_some_and(|a| a.is_empty())
    {
        return Ok(Value::Dict(Vec::new()));
    }

    Ok(Value::Object {
        class: Box::new(callable),
        args: Box::new(args),
        state: None,
    })
}

/// `_rebuild_tensor_v2(storage, storage_offset, size, stride, ...)`
fn rebuild_tensor(args: Value) -> Result<TensorRef, DecodeError> {
    let Value::Tuple(args) = args else {
        return Err(malformed("tensor rebuild args must be a tuple"));
    };

    let storage = match args.first() {
        Some(Value::Storage(storage)) => storage.clone(),
        _ => return Err(malformed("tensor rebuild without storage")),
    };
    let offset = args
        .get(1)
        .and_then(Value::as_int)
        .ok_or_else(|| malformed("tensor rebuild without storage offset"))?;

    Ok(TensorRef {
        storage,
        offset: to_usize(offset)?,
        shape: usize_tuple(args.get(2))?,
        stride: usize_tuple(args.get(3))?,
    })
}

/// `('storage', torch.LongStorage, key, location, numel)`
fn persistent_load(pid: Value) -> Result<Value, DecodeError> {
    let Value::Tuple(items) = &pid else {
        return Ok(Value::PersistentId(Box::new(pid)));
    };
    if items.first().and_then(Value::as_str) != Some("storage") {
        return Ok(Value::PersistentId(Box::new(pid)));
    }

    let dtype = match items.get(1) {
        Some(Value::Global { name, .. }) => DType::from_storage_class(name)?,
        _ => return Err(malformed("storage id without storage type")),
    };
    let key = items
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("storage id without key"))?
        .to_string();
    let numel = items
        .get(4)
        .and_then(Value::as_int)
        .ok_or_else(|| malformed("storage id without element count"))?;

    Ok(Value::Storage(StorageRef {
        dtype,
        key,
        numel: to_usize(numel)?,
    }))
}

fn usize_tuple(value: Option<&Value>) -> Result<Vec<usize>, DecodeError> {
    value
        .and_then(Value::as_seq)
        .ok_or_else(|| malformed("expected an integer tuple"))?
        .iter()
        .map(|v| {
            v.as_int()
                .ok_or_else(|| malformed("expected an integer"))
                .and_then(to_usize)
        })
        .collect()
}

fn to_usize(v: i64) -> Result<usize, DecodeError> {
    usize::try_from(v).map_err(|_| malformed(format!("negative size {v}")))
}

fn pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>, DecodeError> {
    if items.len() % 2 != 0 {
        return Err(malformed("odd number of dict items"));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Ok(out)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::None => "None",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "str",
        Value::Bytes(_) => "bytes",
        Value::List(_) => "list",
        Value::Tuple(_) => "tuple",
        Value::Dict(_) => "dict",
        Value::Set(_) => "set",
        Value::Global { .. } => "global",
        Value::Object { .. } => "object",
        Value::PersistentId(_) => "persistent id",
        Value::Storage(_) => "storage",
        Value::Tensor(_) => "tensor",
    }
}

fn malformed(msg: impl Into<String>) -> DecodeError {
    DecodeError::Malformed(msg.into())
}
