//! # Per-Task Execution State
//!
//! A [`Coroutine`] is one cooperative thread of bytecode execution: its own
//! program counter, four type-partitioned value stacks, four local-variable
//! arenas, and a call stack of [`Frame`]s. The scheduler owns a pool of
//! these and walks each one to its next suspension point per round.
//!
//! ## Locals bookkeeping
//! `locals_base[kind]` is the base of the *current* frame's locals in that
//! partition's arena; `Load`/`Store` address `base + offset`. Each frame
//! tracks how much it has reserved (`reserved`, grown by the `localStack`
//! opcodes) and what the caller had reserved when the call was made
//! (`saved`). A call advances the base past the caller's reservation; a
//! return subtracts the popped frame's `saved` sizes to restore it.
//! Arenas double when a reservation outgrows them.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::{Channel, Obj};

/// One call-stack entry.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    /// Where `return` resumes in the caller. The root frame uses
    /// `usize::MAX`, which is never jumped to: popping the root removes
    /// the coroutine instead.
    pub ret_pc: usize,
    /// Locals reserved by this frame so far, per partition.
    pub reserved: [usize; 4],
    /// The caller's reservation at call time, per partition.
    pub saved: [usize; 4],
    /// Pending deferred-block PCs, popped LIFO on every exit path.
    pub defers: Vec<usize>,
    /// Exception-handler PCs, popped LIFO; the top one always belongs to
    /// this frame.
    pub handlers: Vec<usize>,
}

impl Frame {
    pub fn root() -> Frame {
        Frame {
            ret_pc: usize::MAX,
            ..Frame::default()
        }
    }
}

/// Saved coroutine shape for one select block: stack tops and locals bases,
/// restored when a case misses or at `check_channel`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectSnapshot {
    pub i_sp: usize,
    pub f_sp: usize,
    pub s_sp: usize,
    pub o_sp: usize,
    pub base: [usize; 4],
}

#[derive(Debug, Default)]
pub struct Coroutine {
    pub id: u32,
    pub pc: usize,

    pub i_stack: Vec<i32>,
    pub f_stack: Vec<f32>,
    pub s_stack: Vec<String>,
    pub o_stack: Vec<Obj>,

    pub i_locals: Vec<i32>,
    pub f_locals: Vec<f32>,
    pub s_locals: Vec<String>,
    pub o_locals: Vec<Obj>,
    /// Current frame's locals base per partition.
    pub locals_base: [usize; 4],

    pub frames: Vec<Frame>,

    /// An exception is propagating; cleared by `catch`.
    pub is_panicking: bool,
    /// Cooperative death signal; defers still run, handlers do not.
    pub is_killed: bool,
    /// The last channel operation could not proceed.
    pub is_locked: bool,
    /// The channel a blocked receive is parked on; the scheduler skips the
    /// coroutine until a send clears the channel's receiver-ready flag or
    /// the channel closes.
    pub waiting: Option<Rc<RefCell<Channel>>>,
    /// Between `try_channel` and the send/receive it arms.
    pub is_evaluating_channel: bool,
    /// Where a missed select case continues.
    pub select_jump_pc: usize,
    /// Select snapshots, one per nested `start_select_channel`.
    pub selects: Vec<SelectSnapshot>,

    /// The message carried while `is_panicking`.
    pub panic_msg: String,
    /// Swept out of the pool at the end of the round.
    pub removed: bool,
}

impl Coroutine {
    pub fn new(id: u32, pc: usize) -> Coroutine {
        Coroutine {
            id,
            pc,
            frames: vec![Frame::root()],
            ..Coroutine::default()
        }
    }

    // ----- Value stack accessors -----
    //
    // Underflow is a compiler bug, never a script error: checked in debug
    // builds, defaulted in release so a broken image cannot take the host
    // down with it.

    #[inline]
    pub fn pop_int(&mut self) -> i32 {
        debug_assert!(!self.i_stack.is_empty(), "int stack underflow");
        self.i_stack.pop().unwrap_or_default()
    }

    #[inline]
    pub fn pop_float(&mut self) -> f32 {
        debug_assert!(!self.f_stack.is_empty(), "float stack underflow");
        self.f_stack.pop().unwrap_or_default()
    }

    #[inline]
    pub fn pop_string(&mut self) -> String {
        debug_assert!(!self.s_stack.is_empty(), "string stack underflow");
        self.s_stack.pop().unwrap_or_default()
    }

    #[inline]
    pub fn pop_obj(&mut self) -> Obj {
        debug_assert!(!self.o_stack.is_empty(), "object stack underflow");
        self.o_stack.pop().unwrap_or_default()
    }

    // ----- Locals -----

    /// Widen the current frame's reservation for one partition, doubling
    /// the arena when `base + reserved` outgrows it.
    pub fn reserve_locals(&mut self, kind: usize, extra: usize) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        frame.reserved[kind] += extra;
        let need = self.locals_base[kind] + frame.reserved[kind];
        match kind {
            0 => grow_arena(&mut self.i_locals, need),
            1 => grow_arena(&mut self.f_locals, need),
            2 => grow_arena(&mut self.s_locals, need),
            _ => grow_arena(&mut self.o_locals, need),
        }
    }

    pub fn local_int(&mut self, offset: usize) -> &mut i32 {
        let at = self.locals_base[0] + offset;
        grow_arena(&mut self.i_locals, at + 1);
        &mut self.i_locals[at]
    }

    pub fn local_float(&mut self, offset: usize) -> &mut f32 {
        let at = self.locals_base[1] + offset;
        grow_arena(&mut self.f_locals, at + 1);
        &mut self.f_locals[at]
    }

    pub fn local_string(&mut self, offset: usize) -> &mut String {
        let at = self.locals_base[2] + offset;
        grow_arena(&mut self.s_locals, at + 1);
        &mut self.s_locals[at]
    }

    pub fn local_obj(&mut self, offset: usize) -> &mut Obj {
        let at = self.locals_base[3] + offset;
        grow_arena(&mut self.o_locals, at + 1);
        &mut self.o_locals[at]
    }

    // ----- Select snapshots -----

    pub fn save_select(&mut self) {
        self.selects.push(SelectSnapshot {
            i_sp: self.i_stack.len(),
            f_sp: self.f_stack.len(),
            s_sp: self.s_stack.len(),
            o_sp: self.o_stack.len(),
            base: self.locals_base,
        });
    }

    /// Restore the innermost snapshot without consuming it; a select block
    /// restores once per missed case and once more at `check_channel`.
    pub fn restore_select(&mut self) {
        let Some(snap) = self.selects.last().copied() else {
            debug_assert!(false, "select restore without snapshot");
            return;
        };
        self.i_stack.truncate(snap.i_sp);
        self.f_stack.truncate(snap.f_sp);
        self.s_stack.truncate(snap.s_sp);
        self.o_stack.truncate(snap.o_sp);
        self.locals_base = snap.base;
    }

    pub fn drop_select(&mut self) {
        self.selects.pop();
    }
}

/// Doubling growth, default-filled. Reserved-but-unwritten slots read as
/// the partition's zero value.
fn grow_arena<T: Clone + Default>(arena: &mut Vec<T>, need: usize) {
    if need <= arena.len() {
        return;
    }
    let mut cap = arena.len().max(8);
    while cap < need {
        cap *= 2;
    }
    arena.resize(cap, T::default());
}
