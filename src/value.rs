//! # Value Containers for the Grimoire VM
//!
//! The integer, float and string partitions hold plain `i32`/`f32`/`String`
//! values directly on their stacks. Everything pointer-sized lives in the
//! object partition as an [`Obj`]: typed arrays, class instances, channels,
//! raw host pointers, and slot references produced by the indexing opcodes.
//!
//! Containers are reference-counted with interior mutability
//! (`Rc<RefCell<…>>`) so that stack slots, locals, globals, fields and
//! channel buffers can share one allocation; a container lives exactly as
//! long as some live reference does.
//!
//! ## Equality
//! - `Null == Null`, raw pointers compare by address value.
//! - Arrays compare structurally (element by element, recursively for
//!   object arrays).
//! - Instances and channels compare by identity (`Rc::ptr_eq`).
//! - References never compare equal; they are transient write targets.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::bytecode::{Class, Kind};

/// A value in the object partition.
#[derive(Clone, Debug)]
pub enum Obj {
    /// Absent object; field loads and container ops through it raise `NullError`.
    Null,
    /// Mutable sequence of integers.
    IntArray(Rc<RefCell<Vec<i32>>>),
    /// Mutable sequence of floats.
    FloatArray(Rc<RefCell<Vec<f32>>>),
    /// Mutable sequence of strings.
    StringArray(Rc<RefCell<Vec<String>>>),
    /// Mutable sequence of objects.
    ObjectArray(Rc<RefCell<Vec<Obj>>>),
    /// Class instance with typed field storage.
    Instance(Rc<RefCell<Object>>),
    /// Bounded FIFO channel of one kind.
    Channel(Rc<RefCell<Channel>>),
    /// Opaque host pointer, carried but never dereferenced by the VM.
    Raw(usize),
    /// Write-through reference to an array slot or a local slot.
    Ref(Ref),
}

impl Obj {
    /// The zero value a `receive` pushes when its select case is taken on a
    /// closed channel.
    pub fn null() -> Obj {
        Obj::Null
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Obj::Null)
    }
}

impl Default for Obj {
    fn default() -> Self {
        Obj::Null
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Obj::Null, Obj::Null) => true,
            (Obj::IntArray(a), Obj::IntArray(b)) => *a.borrow() == *b.borrow(),
            (Obj::FloatArray(a), Obj::FloatArray(b)) => *a.borrow() == *b.borrow(),
            (Obj::StringArray(a), Obj::StringArray(b)) => *a.borrow() == *b.borrow(),
            (Obj::ObjectArray(a), Obj::ObjectArray(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Obj::Instance(a), Obj::Instance(b)) => Rc::ptr_eq(a, b),
            (Obj::Channel(a), Obj::Channel(b)) => Rc::ptr_eq(a, b),
            (Obj::Raw(a), Obj::Raw(b)) => a == b,
            _ => false,
        }
    }
}

/// A class instance. Field storage is partitioned by kind, in the order the
/// class descriptor declares the fields of that kind.
#[derive(Clone, Debug)]
pub struct Object {
    pub class: u32,
    pub i_fields: Vec<i32>,
    pub f_fields: Vec<f32>,
    pub s_fields: Vec<String>,
    pub o_fields: Vec<Obj>,
}

impl Object {
    /// Allocate an instance of `class` with every field default-initialized
    /// per its declared kind.
    pub fn new(class_idx: u32, class: &Class) -> Object {
        let mut obj = Object {
            class: class_idx,
            i_fields: Vec::new(),
            f_fields: Vec::new(),
            s_fields: Vec::new(),
            o_fields: Vec::new(),
        };
        for field in &class.fields {
            match field.kind {
                Kind::Int => obj.i_fields.push(0),
                Kind::Float => obj.f_fields.push(0.0),
                Kind::Str => obj.s_fields.push(String::new()),
                Kind::Obj => obj.o_fields.push(Obj::Null),
            }
        }
        obj
    }
}

/// Kind-typed channel storage.
#[derive(Clone, Debug)]
pub enum ChannelBuf {
    Int(VecDeque<i32>),
    Float(VecDeque<f32>),
    Str(VecDeque<String>),
    Obj(VecDeque<Obj>),
}

/// A bounded rendezvous channel. `send` succeeds while `len < capacity`,
/// `receive` while `len > 0`; otherwise the coroutine blocks and retries on
/// a later scheduling round. `owned` drops to false when the channel is
/// closed, after which send/receive outside a select raise `ChannelError`.
#[derive(Clone, Debug)]
pub struct Channel {
    pub kind: Kind,
    pub capacity: usize,
    pub buf: ChannelBuf,
    /// A receiver is parked on this channel. The next send clears the
    /// flag; the scheduler resumes the receiver once it clears or the
    /// channel closes.
    pub receiver_ready: bool,
    pub owned: bool,
}

impl Channel {
    pub fn new(kind: Kind, capacity: usize) -> Channel {
        let buf = match kind {
            Kind::Int => ChannelBuf::Int(VecDeque::new()),
            Kind::Float => ChannelBuf::Float(VecDeque::new()),
            Kind::Str => ChannelBuf::Str(VecDeque::new()),
            Kind::Obj => ChannelBuf::Obj(VecDeque::new()),
        };
        Channel {
            kind,
            capacity,
            buf,
            receiver_ready: false,
            owned: true,
        }
    }

    pub fn len(&self) -> usize {
        match &self.buf {
            ChannelBuf::Int(q) => q.len(),
            ChannelBuf::Float(q) => q.len(),
            ChannelBuf::Str(q) => q.len(),
            ChannelBuf::Obj(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn send_int(&mut self, v: i32) {
        if let ChannelBuf::Int(q) = &mut self.buf {
            q.push_back(v);
        }
    }

    pub fn send_float(&mut self, v: f32) {
        if let ChannelBuf::Float(q) = &mut self.buf {
            q.push_back(v);
        }
    }

    pub fn send_string(&mut self, v: String) {
        if let ChannelBuf::Str(q) = &mut self.buf {
            q.push_back(v);
        }
    }

    pub fn send_object(&mut self, v: Obj) {
        if let ChannelBuf::Obj(q) = &mut self.buf {
            q.push_back(v);
        }
    }

    pub fn recv_int(&mut self) -> Option<i32> {
        match &mut self.buf {
            ChannelBuf::Int(q) => q.pop_front(),
            _ => None,
        }
    }

    pub fn recv_float(&mut self) -> Option<f32> {
        match &mut self.buf {
            ChannelBuf::Float(q) => q.pop_front(),
            _ => None,
        }
    }

    pub fn recv_string(&mut self) -> Option<String> {
        match &mut self.buf {
            ChannelBuf::Str(q) => q.pop_front(),
            _ => None,
        }
    }

    pub fn recv_object(&mut self) -> Option<Obj> {
        match &mut self.buf {
            ChannelBuf::Obj(q) => q.pop_front(),
            _ => None,
        }
    }
}

/// A write-through reference. Element references pin the array allocation;
/// local references index the owning coroutine's local arena absolutely.
#[derive(Clone, Debug)]
pub enum Ref {
    IntElem(Rc<RefCell<Vec<i32>>>, usize),
    FloatElem(Rc<RefCell<Vec<f32>>>, usize),
    StrElem(Rc<RefCell<Vec<String>>>, usize),
    ObjElem(Rc<RefCell<Vec<Obj>>>, usize),
    IntLocal(usize),
    FloatLocal(usize),
    StrLocal(usize),
    ObjLocal(usize),
}
