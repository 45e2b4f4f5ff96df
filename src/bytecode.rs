//! # Grimoire Bytecode Format & Codec
//!
//! This module defines the **instruction word layout**, the **opcode set**,
//! the immutable [`Bytecode`] artifact the compiler front-end produces, and
//! a strict little-endian **binary codec** for it.
//!
//! ## Instruction word
//! Every instruction is one 32-bit word:
//! ```text
//! bits [0..7]   opcode
//! bits [8..31]  value — unsigned, or signed via a 2^23 bias
//! bits [8..15]  v1  \  two-field form (e.g. new_channel: kind + capacity)
//! bits [16..31] v2  /
//! ```
//! Control opcodes (jumps, try/catch/defer, shift, try_channel) interpret
//! the value as a signed offset; resource sizes and indices are unsigned.
//!
//! ## Binary layout (little-endian)
//! ```text
//! +------------------+------------------------------------------+
//! | Magic "GRIM"     | 4 bytes                                  |
//! | Version          | u32 (see `BC_VERSION`)                   |
//! | Header           | u32[4]: n_iconst n_fconst n_sconst n_ops |
//! | iconsts          | i32 × n_iconst                           |
//! | fconsts          | f32 × n_fconst                           |
//! | sconsts          | wide string × n_sconst                   |
//! | opcodes          | u32 × n_ops                              |
//! | events           | u32 n, then (name, u32 pc) × n           |
//! | globals          | u32[4]: per-partition global counts      |
//! | variables        | u32 n, then (name, u32 idx, u8 mask) × n |
//! | primitives       | u32 n, then (u32 lib, signature) × n     |
//! | classes          | u32 n, then (name, fields…) × n          |
//! | debug info       | u32 n, then (name, u32 pos, u32 len) × n |
//! +------------------+------------------------------------------+
//! ```
//! Strings serialize as a `u32` count of UTF-16 code units followed by the
//! units themselves. Every count precedes its payload, so a reader makes a
//! single forward pass. Unlike a compiler's internal tables, the image may
//! come from disk, so the reader reports truncation and bad discriminants
//! as [`HostError::MalformedBytecode`] instead of panicking.

use crate::error::HostError;

/// Packed bytecode version: `(MAJOR << 16) | (MINOR << 8) | PATCH`.
const BC_VERSION: u32 = (0 << 16) | (1 << 8) | 0;

/// Bias applied to the 24-bit value field when an opcode interprets it as
/// a signed quantity.
pub const VALUE_BIAS: i32 = 1 << 23;

/// The four type partitions. The discriminants double as type-mask bit
/// positions for the host variable table.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Int = 0,
    Float = 1,
    Str = 2,
    Obj = 3,
}

impl Kind {
    /// The type-mask bit for this partition.
    pub fn mask(self) -> u8 {
        1 << self as u8
    }
}

impl TryFrom<u8> for Kind {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Kind::Int),
            1 => Ok(Kind::Float),
            2 => Ok(Kind::Str),
            3 => Ok(Kind::Obj),
            other => Err(other),
        }
    }
}

/// Defines [`Opcode`] together with its `TryFrom<u8>` decoding table so the
/// two can never drift apart.
macro_rules! opcodes {
    ($($(#[$meta:meta])* $name:ident = $val:literal,)+) => {
        /// Instruction set for the Grimoire VM.
        ///
        /// Typed opcodes come in per-partition quadruples (`…Int`,
        /// `…Float`, `…String`, `…Object`) with consecutive discriminants;
        /// mixed-type operations are the compiler's responsibility.
        #[repr(u8)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum Opcode {
            $($(#[$meta])* $name = $val,)+
        }

        impl TryFrom<u8> for Opcode {
            type Error = u8;
            fn try_from(v: u8) -> Result<Self, u8> {
                match v {
                    $($val => Ok(Opcode::$name),)+
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    // ----- Control flow (signed offsets) -----
    /// Unconditional relative jump.
    Jump = 0,
    /// Pop an integer; jump when it is non-zero.
    JumpEqual = 1,
    /// Pop an integer; jump when it is zero.
    JumpNotEqual = 2,
    /// Give up the rest of this scheduling round.
    Yield = 3,
    /// Run remaining defers, then pop the frame; removes the coroutine at root.
    Return = 4,
    /// Push a frame and jump to the absolute target.
    Call = 5,
    /// Like `Call`, but the target PC is popped from the integer stack.
    AnonCall = 6,
    /// Invoke a host primitive by resolved index, synchronously, frameless.
    PrimCall = 7,
    /// Enqueue a new coroutine at the absolute target for the next round.
    Task = 8,
    /// Like `Task`, but the target PC is popped from the integer stack.
    AnonTask = 9,
    /// Cooperative death: run all defers, tear down all frames, remove.
    Kill = 10,
    /// Mark every live coroutine killed and clear the spawn queue.
    KillAll = 11,
    /// Push `pc + offset` as an exception handler for the current frame.
    Try = 12,
    /// Pop the top handler; clear a pending panic or skip the handler body.
    Catch = 13,
    /// Push `pc + offset` as a deferred block for the current frame.
    Defer = 14,
    /// Continue the pending unwind reason: panic, kill, or normal return.
    Unwind = 15,
    /// Pop the top string as the message and start panicking.
    Raise = 16,
    /// Allocate an instance of the indexed class, fields default-initialized.
    New = 17,

    // ----- Constants, locals, globals, stack shape -----
    /// Push a signed 24-bit immediate on the integer stack.
    PushInt = 20,
    ConstInt = 21,
    ConstFloat = 22,
    ConstString = 23,
    PushNull = 24,
    LoadInt = 25,
    LoadFloat = 26,
    LoadString = 27,
    LoadObject = 28,
    StoreInt = 29,
    StoreFloat = 30,
    StoreString = 31,
    StoreObject = 32,
    GlobalLoadInt = 33,
    GlobalLoadFloat = 34,
    GlobalLoadString = 35,
    GlobalLoadObject = 36,
    GlobalStoreInt = 37,
    GlobalStoreFloat = 38,
    GlobalStoreString = 39,
    GlobalStoreObject = 40,
    CopyInt = 41,
    CopyFloat = 42,
    CopyString = 43,
    CopyObject = 44,
    SwapInt = 45,
    SwapFloat = 46,
    SwapString = 47,
    SwapObject = 48,
    /// Shift the stack top by a signed count: reserve defaults or drop.
    ShiftInt = 49,
    ShiftFloat = 50,
    ShiftString = 51,
    ShiftObject = 52,
    /// Widen the current frame's local reservation for one partition.
    LocalStackInt = 53,
    LocalStackFloat = 54,
    LocalStackString = 55,
    LocalStackObject = 56,
    /// Drain N stack values into the outgoing mailbox.
    GlobalPushInt = 57,
    GlobalPushFloat = 58,
    GlobalPushString = 59,
    GlobalPushObject = 60,
    /// Dequeue N incoming mailbox values onto the stack.
    GlobalPopInt = 61,
    GlobalPopFloat = 62,
    GlobalPopString = 63,
    GlobalPopObject = 64,

    // ----- Integer arithmetic / comparison / boolean -----
    AddInt = 70,
    SubInt = 71,
    MulInt = 72,
    DivInt = 73,
    RemInt = 74,
    NegInt = 75,
    IncInt = 76,
    DecInt = 77,
    EqInt = 78,
    NeInt = 79,
    LtInt = 80,
    LeInt = 81,
    GtInt = 82,
    GeInt = 83,
    AndInt = 84,
    OrInt = 85,
    NotInt = 86,

    // ----- Float arithmetic / comparison -----
    AddFloat = 90,
    SubFloat = 91,
    MulFloat = 92,
    DivFloat = 93,
    RemFloat = 94,
    NegFloat = 95,
    IncFloat = 96,
    DecFloat = 97,
    EqFloat = 98,
    NeFloat = 99,
    LtFloat = 100,
    LeFloat = 101,
    GtFloat = 102,
    GeFloat = 103,

    // ----- String operations -----
    ConcatString = 110,
    EqString = 111,
    NeString = 112,
    LtString = 113,
    LeString = 114,
    GtString = 115,
    GeString = 116,

    // ----- Integer arrays -----
    /// Build an array from the top N values.
    ArrayInt = 120,
    /// Pop an index, push a slot reference (negative wrap + bounds check).
    IndexInt = 121,
    /// Value-load form of `IndexInt`.
    Index2Int = 122,
    /// Dual form: push both the slot reference and the value.
    Index3Int = 123,
    LengthInt = 124,
    ConcatIntArray = 125,
    AppendInt = 126,
    PrependInt = 127,
    EqIntArray = 128,

    // ----- Float arrays -----
    ArrayFloat = 130,
    IndexFloat = 131,
    Index2Float = 132,
    Index3Float = 133,
    LengthFloat = 134,
    ConcatFloatArray = 135,
    AppendFloat = 136,
    PrependFloat = 137,
    EqFloatArray = 138,

    // ----- String arrays -----
    ArrayString = 140,
    IndexString = 141,
    Index2String = 142,
    Index3String = 143,
    LengthString = 144,
    ConcatStringArray = 145,
    AppendString = 146,
    PrependString = 147,
    EqStringArray = 148,

    // ----- Object arrays -----
    ArrayObject = 150,
    IndexObject = 151,
    Index2Object = 152,
    Index3Object = 153,
    LengthObject = 154,
    ConcatObjectArray = 155,
    AppendObject = 156,
    PrependObject = 157,
    EqObjectArray = 158,

    // ----- References -----
    /// Write through the reference on top of the object stack.
    RefStoreInt = 160,
    RefStoreFloat = 161,
    RefStoreString = 162,
    RefStoreObject = 163,
    /// Push a reference to the local slot at `base + offset`.
    RefLocalInt = 164,
    RefLocalFloat = 165,
    RefLocalString = 166,
    RefLocalObject = 167,

    // ----- Object fields -----
    FieldLoadInt = 170,
    FieldLoadFloat = 171,
    FieldLoadString = 172,
    FieldLoadObject = 173,
    FieldStoreInt = 174,
    FieldStoreFloat = 175,
    FieldStoreString = 176,
    FieldStoreObject = 177,

    // ----- Channels and select -----
    /// Two-field form: v1 = element kind, v2 = capacity.
    NewChannel = 180,
    SendInt = 181,
    SendFloat = 182,
    SendString = 183,
    SendObject = 184,
    ReceiveInt = 185,
    ReceiveFloat = 186,
    ReceiveString = 187,
    ReceiveObject = 188,
    /// Snapshot stack tops and locals bases for the select block.
    StartSelectChannel = 189,
    /// Arm the next send/receive as a select case; offset names the next case.
    TryChannel = 190,
    /// Restore the snapshot and leave select evaluation.
    CheckChannel = 191,
    /// Drop the select snapshot.
    EndSelectChannel = 192,
}

//
// --- Instruction word packing ----------------------------------------------
//

/// Pack an opcode with an unsigned 24-bit value.
pub fn word(op: Opcode, value: u32) -> u32 {
    debug_assert!(value < (1 << 24), "value field overflow");
    (value << 8) | op as u32
}

/// Pack an opcode with a signed value, biased by 2^23.
pub fn word_signed(op: Opcode, value: i32) -> u32 {
    debug_assert!((-VALUE_BIAS..VALUE_BIAS).contains(&value));
    word(op, (value + VALUE_BIAS) as u32)
}

/// Pack the two-field form: v1 in bits 8..15, v2 in bits 16..31.
pub fn word2(op: Opcode, v1: u8, v2: u16) -> u32 {
    ((v2 as u32) << 16) | ((v1 as u32) << 8) | op as u32
}

/// Split a word into its opcode byte and raw 24-bit value.
pub fn decode(w: u32) -> (u8, u32) {
    ((w & 0xff) as u8, w >> 8)
}

/// Interpret a raw value field as signed.
pub fn signed(value: u32) -> i32 {
    value as i32 - VALUE_BIAS
}

/// Split a raw value field into the two-field form.
pub fn fields(value: u32) -> (u8, u16) {
    ((value & 0xff) as u8, (value >> 8) as u16)
}

//
// --- Artifact model --------------------------------------------------------
//

/// A labeled entry point: spawning the event seeds a coroutine at `pc`.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub name: String,
    pub pc: u32,
}

/// Per-partition global array sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GlobalCounts {
    pub ints: u32,
    pub floats: u32,
    pub strings: u32,
    pub objects: u32,
}

/// Host-visible global variable: name, index into its partition, and a
/// type mask (bit 0 = int, 1 = float, 2 = string, 3 = object).
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name: String,
    pub index: u32,
    pub mask: u8,
}

/// A primitive the artifact calls: the providing library's index and the
/// mangled signature, e.g. `string(i):s`.
#[derive(Clone, Debug, PartialEq)]
pub struct Primitive {
    pub library: u32,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: Kind,
}

/// Class descriptor: ordered, kind-typed fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Class {
    pub name: String,
    pub fields: Vec<Field>,
}

/// Debug descriptor mapping a bytecode range to a function name.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub pos: u32,
    pub len: u32,
}

/// The compiled artifact. Immutable once loaded into a VM.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bytecode {
    pub iconsts: Vec<i32>,
    pub fconsts: Vec<f32>,
    pub sconsts: Vec<String>,
    pub opcodes: Vec<u32>,
    pub events: Vec<Event>,
    pub globals: GlobalCounts,
    pub variables: Vec<Variable>,
    pub primitives: Vec<Primitive>,
    pub classes: Vec<Class>,
    pub debug_info: Vec<FunctionInfo>,
}

//
// --- Little-endian readers --------------------------------------------------
//

fn short(section: &str) -> HostError {
    HostError::MalformedBytecode(format!("truncated {}", section))
}

fn read_u32(data: &[u8], idx: &mut usize, section: &str) -> Result<u32, HostError> {
    let bytes: [u8; 4] = data
        .get(*idx..*idx + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| short(section))?;
    *idx += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u16(data: &[u8], idx: &mut usize, section: &str) -> Result<u16, HostError> {
    let bytes: [u8; 2] = data
        .get(*idx..*idx + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| short(section))?;
    *idx += 2;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u8(data: &[u8], idx: &mut usize, section: &str) -> Result<u8, HostError> {
    let b = *data.get(*idx).ok_or_else(|| short(section))?;
    *idx += 1;
    Ok(b)
}

/// Read a length-prefixed UTF-16 string and advance `idx`.
fn read_wstring(data: &[u8], idx: &mut usize, section: &str) -> Result<String, HostError> {
    let len = read_u32(data, idx, section)? as usize;
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(read_u16(data, idx, section)?);
    }
    String::from_utf16(&units)
        .map_err(|_| HostError::MalformedBytecode(format!("invalid string in {}", section)))
}

fn write_wstring(out: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    out.extend_from_slice(&(units.len() as u32).to_le_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
}

impl Bytecode {
    /// Decode a binary image. Single forward pass; any truncation or bad
    /// discriminant is reported as [`HostError::MalformedBytecode`].
    pub fn read(data: &[u8]) -> Result<Bytecode, HostError> {
        let mut idx = 0;

        // ---- Magic + version ----
        if data.len() < 4 || &data[0..4] != b"GRIM" {
            return Err(HostError::MalformedBytecode("bad magic".to_string()));
        }
        idx += 4;
        let version = read_u32(data, &mut idx, "header")?;
        if version != BC_VERSION {
            return Err(HostError::MalformedBytecode(format!(
                "unsupported version {:#x}",
                version
            )));
        }

        // ---- Header counts ----
        let n_iconst = read_u32(data, &mut idx, "header")? as usize;
        let n_fconst = read_u32(data, &mut idx, "header")? as usize;
        let n_sconst = read_u32(data, &mut idx, "header")? as usize;
        let n_opcodes = read_u32(data, &mut idx, "header")? as usize;

        // ---- Constant pools ----
        let mut iconsts = Vec::with_capacity(n_iconst);
        for _ in 0..n_iconst {
            iconsts.push(read_u32(data, &mut idx, "iconsts")? as i32);
        }
        let mut fconsts = Vec::with_capacity(n_fconst);
        for _ in 0..n_fconst {
            fconsts.push(f32::from_le_bytes(
                read_u32(data, &mut idx, "fconsts")?.to_le_bytes(),
            ));
        }
        let mut sconsts = Vec::with_capacity(n_sconst);
        for _ in 0..n_sconst {
            sconsts.push(read_wstring(data, &mut idx, "sconsts")?);
        }

        // ---- Code stream ----
        let mut opcodes = Vec::with_capacity(n_opcodes);
        for _ in 0..n_opcodes {
            opcodes.push(read_u32(data, &mut idx, "opcodes")?);
        }

        // ---- Events ----
        let n_events = read_u32(data, &mut idx, "events")? as usize;
        let mut events = Vec::with_capacity(n_events);
        for _ in 0..n_events {
            let name = read_wstring(data, &mut idx, "events")?;
            let pc = read_u32(data, &mut idx, "events")?;
            events.push(Event { name, pc });
        }

        // ---- Global counts ----
        let globals = GlobalCounts {
            ints: read_u32(data, &mut idx, "globals")?,
            floats: read_u32(data, &mut idx, "globals")?,
            strings: read_u32(data, &mut idx, "globals")?,
            objects: read_u32(data, &mut idx, "globals")?,
        };

        // ---- Variables ----
        let n_vars = read_u32(data, &mut idx, "variables")? as usize;
        let mut variables = Vec::with_capacity(n_vars);
        for _ in 0..n_vars {
            let name = read_wstring(data, &mut idx, "variables")?;
            let index = read_u32(data, &mut idx, "variables")?;
            let mask = read_u8(data, &mut idx, "variables")?;
            variables.push(Variable { name, index, mask });
        }

        // ---- Primitives ----
        let n_prims = read_u32(data, &mut idx, "primitives")? as usize;
        let mut primitives = Vec::with_capacity(n_prims);
        for _ in 0..n_prims {
            let library = read_u32(data, &mut idx, "primitives")?;
            let signature = read_wstring(data, &mut idx, "primitives")?;
            primitives.push(Primitive { library, signature });
        }

        // ---- Classes ----
        let n_classes = read_u32(data, &mut idx, "classes")? as usize;
        let mut classes = Vec::with_capacity(n_classes);
        for _ in 0..n_classes {
            let name = read_wstring(data, &mut idx, "classes")?;
            let n_fields = read_u32(data, &mut idx, "classes")? as usize;
            let mut fields = Vec::with_capacity(n_fields);
            for _ in 0..n_fields {
                let field_name = read_wstring(data, &mut idx, "classes")?;
                let kind_b = read_u8(data, &mut idx, "classes")?;
                let kind = Kind::try_from(kind_b).map_err(|b| {
                    HostError::MalformedBytecode(format!("bad field kind {}", b))
                })?;
                fields.push(Field {
                    name: field_name,
                    kind,
                });
            }
            classes.push(Class { name, fields });
        }

        // ---- Debug info ----
        let n_funcs = read_u32(data, &mut idx, "debug info")? as usize;
        let mut debug_info = Vec::with_capacity(n_funcs);
        for _ in 0..n_funcs {
            let name = read_wstring(data, &mut idx, "debug info")?;
            let pos = read_u32(data, &mut idx, "debug info")?;
            let len = read_u32(data, &mut idx, "debug info")?;
            debug_info.push(FunctionInfo { name, pos, len });
        }

        Ok(Bytecode {
            iconsts,
            fconsts,
            sconsts,
            opcodes,
            events,
            globals,
            variables,
            primitives,
            classes,
            debug_info,
        })
    }

    /// Encode into the binary image `read` accepts. `read(write(bc)) == bc`
    /// on every field.
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"GRIM");
        out.extend_from_slice(&BC_VERSION.to_le_bytes());

        out.extend_from_slice(&(self.iconsts.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.fconsts.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.sconsts.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.opcodes.len() as u32).to_le_bytes());

        for v in &self.iconsts {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.fconsts {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for s in &self.sconsts {
            write_wstring(&mut out, s);
        }
        for w in &self.opcodes {
            out.extend_from_slice(&w.to_le_bytes());
        }

        out.extend_from_slice(&(self.events.len() as u32).to_le_bytes());
        for event in &self.events {
            write_wstring(&mut out, &event.name);
            out.extend_from_slice(&event.pc.to_le_bytes());
        }

        out.extend_from_slice(&self.globals.ints.to_le_bytes());
        out.extend_from_slice(&self.globals.floats.to_le_bytes());
        out.extend_from_slice(&self.globals.strings.to_le_bytes());
        out.extend_from_slice(&self.globals.objects.to_le_bytes());

        out.extend_from_slice(&(self.variables.len() as u32).to_le_bytes());
        for var in &self.variables {
            write_wstring(&mut out, &var.name);
            out.extend_from_slice(&var.index.to_le_bytes());
            out.push(var.mask);
        }

        out.extend_from_slice(&(self.primitives.len() as u32).to_le_bytes());
        for prim in &self.primitives {
            out.extend_from_slice(&prim.library.to_le_bytes());
            write_wstring(&mut out, &prim.signature);
        }

        out.extend_from_slice(&(self.classes.len() as u32).to_le_bytes());
        for class in &self.classes {
            write_wstring(&mut out, &class.name);
            out.extend_from_slice(&(class.fields.len() as u32).to_le_bytes());
            for field in &class.fields {
                write_wstring(&mut out, &field.name);
                out.push(field.kind as u8);
            }
        }

        out.extend_from_slice(&(self.debug_info.len() as u32).to_le_bytes());
        for func in &self.debug_info {
            write_wstring(&mut out, &func.name);
            out.extend_from_slice(&func.pos.to_le_bytes());
            out.extend_from_slice(&func.len.to_le_bytes());
        }

        out
    }

    /// Resolve a PC against the debug info. When ranges overlap, the
    /// shortest enclosing function wins, so nested helpers shadow the
    /// outer routine in stack traces.
    pub fn resolve_function(&self, pc: u32) -> Option<&FunctionInfo> {
        self.debug_info
            .iter()
            .filter(|f| f.pos <= pc && pc < f.pos.saturating_add(f.len))
            .min_by_key(|f| f.len)
    }
}
