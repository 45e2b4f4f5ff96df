//! # Grimoire Virtual Machine (Runtime)
//!
//! This module implements the cooperative bytecode VM that executes a
//! compiled [`Bytecode`] artifact.
//!
//! ## High-level model
//! - **Coroutine pool (`tasks`)**: every logical task owns its PC, four
//!   typed value stacks, four local arenas, and a call stack (see
//!   `vm::coroutine`).
//! - **Spawn queue (`spawned`)**: coroutines created this round; they
//!   become runnable on the *next* round.
//! - **Mailboxes**: process-wide, type-partitioned in/out queues used to
//!   hand arguments to freshly spawned tasks; the buffers swap at the top
//!   of each round so producers and consumers never share one within a
//!   tick.
//! - **Globals**: four type-partitioned arrays, reachable from script code
//!   by index and from the host by name through the variable table.
//!
//! ## Scheduling
//! `process()` drives one round: swap mailboxes, admit the spawn queue,
//! then walk every ready coroutine until it yields, blocks on a channel,
//! dies, or the host clears `is_running`. Removal is mark-and-sweep so the
//! ready order stays stable while the round is in flight.
//!
//! The per-instruction dispatch is the `exec` match below; typed stack
//! arithmetic lives in `ops_arith`, containers in `ops_struct`, calls and
//! the unwinder in `ops_control`, channels and select in `channel`, and
//! the primitive ABI in `primitives`. A handler that fails returns the
//! exception message; the dispatcher routes it into the unwinder, which
//! walks handlers, defers, and frames, and escalates to a VM panic when a
//! coroutine's root frame is reached.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::mem;
use std::rc::Rc;

use tracing::{debug, error, trace};

use crate::bytecode::{decode, fields, signed, word, Bytecode, Kind, Opcode};
use crate::error::{exception, Exception, HostError};
use crate::value::{Channel, Obj, Object};

pub(crate) mod channel;
pub(crate) mod coroutine;
mod ops_arith;
mod ops_control;
mod ops_struct;
pub mod primitives;

#[cfg(test)]
mod tests;

use coroutine::Coroutine;
use primitives::{parse_signature, Call, CallValues, Context, Library, PrimitiveFn, Signature};

/// What an instruction asks of the dispatcher.
enum Ctl {
    /// Completed; advance the PC.
    Next,
    /// Completed; the PC was set by the instruction.
    Jumped,
    /// Advance the PC, then suspend the coroutine for this round.
    YieldNext,
    /// Could not proceed; retry the same instruction next round.
    Block,
    /// The coroutine is done for this round (killed, removed, kill_all).
    Halt,
}

/// Whether the inner loop keeps running this coroutine.
enum Flow {
    Continue,
    Suspend,
}

/// Process-wide argument queues, one in/out pair per partition.
#[derive(Default)]
pub(crate) struct Mailbox {
    pub i_in: VecDeque<i32>,
    pub i_out: VecDeque<i32>,
    pub f_in: VecDeque<f32>,
    pub f_out: VecDeque<f32>,
    pub s_in: VecDeque<String>,
    pub s_out: VecDeque<String>,
    pub o_in: VecDeque<Obj>,
    pub o_out: VecDeque<Obj>,
}

impl Mailbox {
    /// Deliver this tick's production. Unconsumed incoming values keep
    /// their place ahead of the new arrivals, so FIFO holds across ticks.
    fn swap(&mut self) {
        self.i_in.extend(self.i_out.drain(..));
        self.f_in.extend(self.f_out.drain(..));
        self.s_in.extend(self.s_out.drain(..));
        self.o_in.extend(self.o_out.drain(..));
    }
}

struct ResolvedPrimitive {
    signature: Signature,
    func: PrimitiveFn,
}

/// The virtual machine. One per loaded program; single-threaded, driven by
/// repeated [`Vm::process`] calls from the host.
pub struct Vm {
    code: Bytecode,
    /// PC of the terminal `unwind` word appended at load time; killed
    /// coroutines are pointed here.
    pub(crate) unwind_pc: usize,
    events: HashMap<String, usize>,
    variables: HashMap<String, (usize, u8)>,
    registry: HashMap<String, PrimitiveFn>,
    primitives: Vec<ResolvedPrimitive>,

    i_globals: Vec<i32>,
    f_globals: Vec<f32>,
    s_globals: Vec<String>,
    o_globals: Vec<Obj>,
    pub(crate) mailbox: Mailbox,

    pub(crate) tasks: Vec<Coroutine>,
    pub(crate) spawned: Vec<Coroutine>,
    next_id: u32,
    round: u64,

    out: Box<dyn Write>,
    /// Cleared by the host to halt the VM cooperatively; every coroutine
    /// stays in place with its PC intact.
    pub is_running: bool,
    pub(crate) panicked: bool,
    pub(crate) panic_message: String,
    loaded: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            code: Bytecode::default(),
            unwind_pc: 0,
            events: HashMap::new(),
            variables: HashMap::new(),
            registry: HashMap::new(),
            primitives: Vec::new(),
            i_globals: Vec::new(),
            f_globals: Vec::new(),
            s_globals: Vec::new(),
            o_globals: Vec::new(),
            mailbox: Mailbox::default(),
            tasks: Vec::new(),
            spawned: Vec::new(),
            next_id: 0,
            round: 0,
            out: Box::new(io::stdout()),
            is_running: true,
            panicked: false,
            panic_message: String::new(),
            loaded: false,
        }
    }

    /// Redirect the print sink (stdout by default).
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    //
    // --- Loading -----------------------------------------------------------
    //

    /// Merge a library's primitive table. Must happen before `load`, which
    /// resolves the artifact's primitive references against the merged set.
    pub fn add_library(&mut self, lib: &Library) {
        debug!(library = lib.name, count = lib.primitives.len(), "add_library");
        for (signature, func) in lib.primitives {
            self.registry.insert((*signature).to_string(), *func);
        }
    }

    /// One-time initialization with a compiled artifact.
    pub fn load(&mut self, mut code: Bytecode) -> Result<(), HostError> {
        let mut primitives = Vec::with_capacity(code.primitives.len());
        for (index, prim) in code.primitives.iter().enumerate() {
            let signature = parse_signature(&prim.signature)?;
            let func = *self.registry.get(&prim.signature).ok_or_else(|| {
                HostError::UnresolvedPrimitive {
                    index,
                    signature: prim.signature.clone(),
                }
            })?;
            primitives.push(ResolvedPrimitive { signature, func });
        }

        // Terminal unwind target for killed coroutines.
        let unwind_pc = code.opcodes.len();
        code.opcodes.push(word(Opcode::Unwind, 0));

        self.events = code
            .events
            .iter()
            .map(|e| (e.name.clone(), e.pc as usize))
            .collect();
        self.variables = code
            .variables
            .iter()
            .map(|v| (v.name.clone(), (v.index as usize, v.mask)))
            .collect();
        self.i_globals = vec![0; code.globals.ints as usize];
        self.f_globals = vec![0.0; code.globals.floats as usize];
        self.s_globals = vec![String::new(); code.globals.strings as usize];
        self.o_globals = vec![Obj::Null; code.globals.objects as usize];
        self.primitives = primitives;
        self.unwind_pc = unwind_pc;
        self.code = code;
        self.loaded = true;
        Ok(())
    }

    //
    // --- Spawning ----------------------------------------------------------
    //

    /// Seed the root coroutine at the `main` event.
    pub fn spawn(&mut self) -> Result<(), HostError> {
        if !self.loaded {
            return Err(HostError::NotLoaded);
        }
        let pc = *self.events.get("main").ok_or(HostError::MissingMain)?;
        self.spawn_at(pc);
        Ok(())
    }

    /// Enqueue a coroutine at a labeled event. Arguments, if any, are the
    /// host's to push through the mailbox before the next round.
    pub fn spawn_event(&mut self, name: &str) -> Result<(), HostError> {
        if !self.loaded {
            return Err(HostError::NotLoaded);
        }
        let pc = *self
            .events
            .get(name)
            .ok_or_else(|| HostError::UnknownEvent(name.to_string()))?;
        self.spawn_at(pc);
        Ok(())
    }

    /// Spawn an event with arguments in one step: the arguments enter the
    /// outgoing mailboxes and the new coroutine drains them in its
    /// prologue on the round it first runs.
    pub fn push_context(&mut self, ctx: Context) -> Result<(), HostError> {
        if !self.loaded {
            return Err(HostError::NotLoaded);
        }
        let pc = *self
            .events
            .get(&ctx.event)
            .ok_or_else(|| HostError::UnknownEvent(ctx.event.clone()))?;
        self.mailbox.i_out.extend(ctx.args.ints);
        self.mailbox.f_out.extend(ctx.args.floats);
        self.mailbox.s_out.extend(ctx.args.strings);
        self.mailbox.o_out.extend(ctx.args.objects);
        self.spawn_at(pc);
        Ok(())
    }

    fn spawn_at(&mut self, pc: usize) {
        let id = self.next_id;
        self.next_id += 1;
        trace!(coroutine = id, pc, "spawn");
        self.spawned.push(Coroutine::new(id, pc));
    }

    //
    // --- Introspection -----------------------------------------------------
    //

    pub fn has_coroutines(&self) -> bool {
        !self.tasks.is_empty() || !self.spawned.is_empty()
    }

    pub fn is_panicking(&self) -> bool {
        self.panicked
    }

    pub fn panic_message(&self) -> &str {
        &self.panic_message
    }

    /// Render the call stack of a coroutine against the debug info.
    pub(crate) fn stack_trace(&self, co: &Coroutine) -> String {
        let describe = |pc: usize| match self.code.resolve_function(pc as u32) {
            Some(func) => format!("{} instr {}", func.name, pc),
            None => format!("Unknown Function instr {}", pc),
        };
        let mut lines = vec![describe(co.pc)];
        for frame in co.frames.iter().rev() {
            if frame.ret_pc != usize::MAX {
                lines.push(describe(frame.ret_pc));
            }
        }
        lines.join("\n")
    }

    //
    // --- Host variables ----------------------------------------------------
    //

    fn variable(&self, name: &str, kind: Kind) -> Result<usize, HostError> {
        let (index, mask) = *self
            .variables
            .get(name)
            .ok_or_else(|| HostError::UnknownVariable(name.to_string()))?;
        if mask & kind.mask() == 0 {
            return Err(HostError::VariableType(name.to_string()));
        }
        Ok(index)
    }

    pub fn get_bool_variable(&self, name: &str) -> Result<bool, HostError> {
        Ok(self.get_int_variable(name)? != 0)
    }

    pub fn set_bool_variable(&mut self, name: &str, value: bool) -> Result<(), HostError> {
        self.set_int_variable(name, value as i32)
    }

    pub fn get_int_variable(&self, name: &str) -> Result<i32, HostError> {
        let index = self.variable(name, Kind::Int)?;
        Ok(self.i_globals.get(index).copied().unwrap_or_default())
    }

    pub fn set_int_variable(&mut self, name: &str, value: i32) -> Result<(), HostError> {
        let index = self.variable(name, Kind::Int)?;
        if let Some(slot) = self.i_globals.get_mut(index) {
            *slot = value;
        }
        Ok(())
    }

    pub fn get_float_variable(&self, name: &str) -> Result<f32, HostError> {
        let index = self.variable(name, Kind::Float)?;
        Ok(self.f_globals.get(index).copied().unwrap_or_default())
    }

    pub fn set_float_variable(&mut self, name: &str, value: f32) -> Result<(), HostError> {
        let index = self.variable(name, Kind::Float)?;
        if let Some(slot) = self.f_globals.get_mut(index) {
            *slot = value;
        }
        Ok(())
    }

    pub fn get_string_variable(&self, name: &str) -> Result<String, HostError> {
        let index = self.variable(name, Kind::Str)?;
        Ok(self.s_globals.get(index).cloned().unwrap_or_default())
    }

    pub fn set_string_variable(&mut self, name: &str, value: String) -> Result<(), HostError> {
        let index = self.variable(name, Kind::Str)?;
        if let Some(slot) = self.s_globals.get_mut(index) {
            *slot = value;
        }
        Ok(())
    }

    /// Read an object-partition variable: arrays, channels, instances,
    /// raw pointers.
    pub fn get_object_variable(&self, name: &str) -> Result<Obj, HostError> {
        let index = self.variable(name, Kind::Obj)?;
        Ok(self.o_globals.get(index).cloned().unwrap_or_default())
    }

    pub fn set_object_variable(&mut self, name: &str, value: Obj) -> Result<(), HostError> {
        let index = self.variable(name, Kind::Obj)?;
        if let Some(slot) = self.o_globals.get_mut(index) {
            *slot = value;
        }
        Ok(())
    }

    /// Raw pointers ride in the object partition and are never
    /// dereferenced by the VM.
    pub fn get_raw_variable(&self, name: &str) -> Result<usize, HostError> {
        match self.get_object_variable(name)? {
            Obj::Raw(ptr) => Ok(ptr),
            _ => Ok(0),
        }
    }

    pub fn set_raw_variable(&mut self, name: &str, value: usize) -> Result<(), HostError> {
        self.set_object_variable(name, Obj::Raw(value))
    }

    //
    // --- Scheduler ---------------------------------------------------------
    //

    /// Drive one scheduling round: swap mailboxes, admit the spawn queue,
    /// give every ready coroutine one run to its next suspension point,
    /// then sweep removals.
    pub fn process(&mut self) {
        if !self.loaded || !self.is_running {
            return;
        }
        self.round += 1;
        trace!(
            round = self.round,
            ready = self.tasks.len(),
            spawning = self.spawned.len(),
            "process"
        );
        self.mailbox.swap();
        while let Some(task) = self.spawned.pop() {
            self.tasks.push(task);
        }
        let mut index = 0;
        while index < self.tasks.len() {
            if !self.is_running {
                break;
            }
            self.run_coroutine(index);
            index += 1;
        }
        self.tasks.retain(|task| {
            if task.removed {
                trace!(coroutine = task.id, "removed");
            }
            !task.removed
        });
    }

    fn run_coroutine(&mut self, index: usize) {
        // Parked receiver: nothing to do until a send clears the channel's
        // receiver-ready flag or the channel closes. Kill signals still run.
        if !self.tasks[index].is_killed {
            if let Some(ch) = &self.tasks[index].waiting {
                let chan = ch.borrow();
                if chan.owned && chan.receiver_ready {
                    return;
                }
            }
        }
        let mut co = mem::take(&mut self.tasks[index]);
        co.waiting = None;
        co.is_locked = false;
        loop {
            if co.removed || !self.is_running {
                break;
            }
            match self.step(&mut co) {
                Flow::Continue => {}
                Flow::Suspend => break,
            }
        }
        self.tasks[index] = co;
    }

    // === Fetch–Decode–Execute ==============================================

    fn step(&mut self, co: &mut Coroutine) -> Flow {
        let Some(&w) = self.code.opcodes.get(co.pc) else {
            co.removed = true;
            return Flow::Suspend;
        };
        let (op_byte, value) = decode(w);
        let op = match Opcode::try_from(op_byte) {
            Ok(op) => op,
            Err(bad) => {
                error!(coroutine = co.id, pc = co.pc, opcode = bad, "illegal opcode");
                co.removed = true;
                return Flow::Suspend;
            }
        };
        match self.exec(co, op, value) {
            Ok(Ctl::Next) => {
                co.pc += 1;
                Flow::Continue
            }
            Ok(Ctl::Jumped) => Flow::Continue,
            Ok(Ctl::YieldNext) => {
                co.pc += 1;
                Flow::Suspend
            }
            Ok(Ctl::Block) => Flow::Suspend,
            Ok(Ctl::Halt) => Flow::Suspend,
            Err(message) => {
                ops_control::raise(self, co, message);
                Flow::Continue
            }
        }
    }

    fn exec(&mut self, co: &mut Coroutine, op: Opcode, value: u32) -> Result<Ctl, Exception> {
        match op {
            // ----- Control flow -----
            Opcode::Jump => {
                co.pc = jump_target(co.pc, signed(value));
                Ok(Ctl::Jumped)
            }
            Opcode::JumpEqual => {
                if co.pop_int() != 0 {
                    co.pc = jump_target(co.pc, signed(value));
                    Ok(Ctl::Jumped)
                } else {
                    Ok(Ctl::Next)
                }
            }
            Opcode::JumpNotEqual => {
                if co.pop_int() == 0 {
                    co.pc = jump_target(co.pc, signed(value));
                    Ok(Ctl::Jumped)
                } else {
                    Ok(Ctl::Next)
                }
            }
            Opcode::Yield => Ok(Ctl::YieldNext),
            Opcode::Return => {
                ops_control::do_return(self, co);
                Ok(if co.removed { Ctl::Halt } else { Ctl::Jumped })
            }
            Opcode::Call => {
                ops_control::call(co, value as usize);
                Ok(Ctl::Jumped)
            }
            Opcode::AnonCall => {
                ops_control::anon_call(co);
                Ok(Ctl::Jumped)
            }
            Opcode::PrimCall => self.prim_call(co, value as usize),
            Opcode::Task => {
                self.spawn_at(value as usize);
                Ok(Ctl::Next)
            }
            Opcode::AnonTask => {
                let target = co.pop_int().max(0) as usize;
                self.spawn_at(target);
                Ok(Ctl::Next)
            }
            Opcode::Kill => {
                ops_control::kill(self, co);
                Ok(if co.removed { Ctl::Halt } else { Ctl::Jumped })
            }
            Opcode::KillAll => {
                ops_control::kill_all(self, co);
                Ok(Ctl::Halt)
            }
            Opcode::Try => {
                let handler = jump_target(co.pc, signed(value));
                if let Some(frame) = co.frames.last_mut() {
                    frame.handlers.push(handler);
                }
                Ok(Ctl::Next)
            }
            Opcode::Catch => {
                if let Some(frame) = co.frames.last_mut() {
                    debug_assert!(!frame.handlers.is_empty(), "catch without try");
                    frame.handlers.pop();
                }
                if co.is_panicking {
                    co.is_panicking = false;
                    let message = mem::take(&mut co.panic_msg);
                    co.s_stack.push(message);
                    Ok(Ctl::Next)
                } else {
                    co.pc = jump_target(co.pc, signed(value));
                    Ok(Ctl::Jumped)
                }
            }
            Opcode::Defer => {
                let block = jump_target(co.pc, signed(value));
                if let Some(frame) = co.frames.last_mut() {
                    frame.defers.push(block);
                }
                Ok(Ctl::Next)
            }
            Opcode::Unwind => {
                ops_control::unwind(self, co);
                Ok(if co.removed { Ctl::Halt } else { Ctl::Jumped })
            }
            Opcode::Raise => Err(co.pop_string()),
            Opcode::New => {
                let idx = value as usize;
                let Some(class) = self.code.classes.get(idx) else {
                    return Err(exception::NULL.to_string());
                };
                let obj = Object::new(idx as u32, class);
                co.o_stack.push(Obj::Instance(Rc::new(RefCell::new(obj))));
                Ok(Ctl::Next)
            }

            // ----- Constants and stack shape -----
            Opcode::PushInt => {
                co.i_stack.push(signed(value));
                Ok(Ctl::Next)
            }
            Opcode::ConstInt => {
                let v = self.code.iconsts.get(value as usize).copied();
                debug_assert!(v.is_some(), "iconst index out of range");
                co.i_stack.push(v.unwrap_or_default());
                Ok(Ctl::Next)
            }
            Opcode::ConstFloat => {
                let v = self.code.fconsts.get(value as usize).copied();
                debug_assert!(v.is_some(), "fconst index out of range");
                co.f_stack.push(v.unwrap_or_default());
                Ok(Ctl::Next)
            }
            Opcode::ConstString => {
                let v = self.code.sconsts.get(value as usize).cloned();
                debug_assert!(v.is_some(), "sconst index out of range");
                co.s_stack.push(v.unwrap_or_default());
                Ok(Ctl::Next)
            }
            Opcode::PushNull => {
                co.o_stack.push(Obj::Null);
                Ok(Ctl::Next)
            }

            Opcode::LoadInt => {
                let v = *co.local_int(value as usize);
                co.i_stack.push(v);
                Ok(Ctl::Next)
            }
            Opcode::LoadFloat => {
                let v = *co.local_float(value as usize);
                co.f_stack.push(v);
                Ok(Ctl::Next)
            }
            Opcode::LoadString => {
                let v = co.local_string(value as usize).clone();
                co.s_stack.push(v);
                Ok(Ctl::Next)
            }
            Opcode::LoadObject => {
                let v = co.local_obj(value as usize).clone();
                co.o_stack.push(v);
                Ok(Ctl::Next)
            }
            Opcode::StoreInt => {
                let v = co.pop_int();
                *co.local_int(value as usize) = v;
                Ok(Ctl::Next)
            }
            Opcode::StoreFloat => {
                let v = co.pop_float();
                *co.local_float(value as usize) = v;
                Ok(Ctl::Next)
            }
            Opcode::StoreString => {
                let v = co.pop_string();
                *co.local_string(value as usize) = v;
                Ok(Ctl::Next)
            }
            Opcode::StoreObject => {
                let v = co.pop_obj();
                *co.local_obj(value as usize) = v;
                Ok(Ctl::Next)
            }

            Opcode::GlobalLoadInt => {
                co.i_stack
                    .push(self.i_globals.get(value as usize).copied().unwrap_or_default());
                Ok(Ctl::Next)
            }
            Opcode::GlobalLoadFloat => {
                co.f_stack
                    .push(self.f_globals.get(value as usize).copied().unwrap_or_default());
                Ok(Ctl::Next)
            }
            Opcode::GlobalLoadString => {
                co.s_stack
                    .push(self.s_globals.get(value as usize).cloned().unwrap_or_default());
                Ok(Ctl::Next)
            }
            Opcode::GlobalLoadObject => {
                co.o_stack
                    .push(self.o_globals.get(value as usize).cloned().unwrap_or_default());
                Ok(Ctl::Next)
            }
            Opcode::GlobalStoreInt => {
                let v = co.pop_int();
                if let Some(slot) = self.i_globals.get_mut(value as usize) {
                    *slot = v;
                }
                Ok(Ctl::Next)
            }
            Opcode::GlobalStoreFloat => {
                let v = co.pop_float();
                if let Some(slot) = self.f_globals.get_mut(value as usize) {
                    *slot = v;
                }
                Ok(Ctl::Next)
            }
            Opcode::GlobalStoreString => {
                let v = co.pop_string();
                if let Some(slot) = self.s_globals.get_mut(value as usize) {
                    *slot = v;
                }
                Ok(Ctl::Next)
            }
            Opcode::GlobalStoreObject => {
                let v = co.pop_obj();
                if let Some(slot) = self.o_globals.get_mut(value as usize) {
                    *slot = v;
                }
                Ok(Ctl::Next)
            }

            Opcode::CopyInt => {
                ops_arith::copy_int(co);
                Ok(Ctl::Next)
            }
            Opcode::CopyFloat => {
                ops_arith::copy_float(co);
                Ok(Ctl::Next)
            }
            Opcode::CopyString => {
                ops_arith::copy_string(co);
                Ok(Ctl::Next)
            }
            Opcode::CopyObject => {
                ops_arith::copy_obj(co);
                Ok(Ctl::Next)
            }
            Opcode::SwapInt => {
                ops_arith::swap_int(co);
                Ok(Ctl::Next)
            }
            Opcode::SwapFloat => {
                ops_arith::swap_float(co);
                Ok(Ctl::Next)
            }
            Opcode::SwapString => {
                ops_arith::swap_string(co);
                Ok(Ctl::Next)
            }
            Opcode::SwapObject => {
                ops_arith::swap_obj(co);
                Ok(Ctl::Next)
            }
            Opcode::ShiftInt => {
                ops_arith::shift_int(co, signed(value));
                Ok(Ctl::Next)
            }
            Opcode::ShiftFloat => {
                ops_arith::shift_float(co, signed(value));
                Ok(Ctl::Next)
            }
            Opcode::ShiftString => {
                ops_arith::shift_string(co, signed(value));
                Ok(Ctl::Next)
            }
            Opcode::ShiftObject => {
                ops_arith::shift_obj(co, signed(value));
                Ok(Ctl::Next)
            }

            Opcode::LocalStackInt => {
                co.reserve_locals(0, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::LocalStackFloat => {
                co.reserve_locals(1, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::LocalStackString => {
                co.reserve_locals(2, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::LocalStackObject => {
                co.reserve_locals(3, value as usize);
                Ok(Ctl::Next)
            }

            Opcode::GlobalPushInt => {
                let at = co.i_stack.len().saturating_sub(value as usize);
                self.mailbox.i_out.extend(co.i_stack.drain(at..));
                Ok(Ctl::Next)
            }
            Opcode::GlobalPushFloat => {
                let at = co.f_stack.len().saturating_sub(value as usize);
                self.mailbox.f_out.extend(co.f_stack.drain(at..));
                Ok(Ctl::Next)
            }
            Opcode::GlobalPushString => {
                let at = co.s_stack.len().saturating_sub(value as usize);
                self.mailbox.s_out.extend(co.s_stack.drain(at..));
                Ok(Ctl::Next)
            }
            Opcode::GlobalPushObject => {
                let at = co.o_stack.len().saturating_sub(value as usize);
                self.mailbox.o_out.extend(co.o_stack.drain(at..));
                Ok(Ctl::Next)
            }
            Opcode::GlobalPopInt => {
                for _ in 0..value {
                    co.i_stack
                        .push(self.mailbox.i_in.pop_front().unwrap_or_default());
                }
                Ok(Ctl::Next)
            }
            Opcode::GlobalPopFloat => {
                for _ in 0..value {
                    co.f_stack
                        .push(self.mailbox.f_in.pop_front().unwrap_or_default());
                }
                Ok(Ctl::Next)
            }
            Opcode::GlobalPopString => {
                for _ in 0..value {
                    co.s_stack
                        .push(self.mailbox.s_in.pop_front().unwrap_or_default());
                }
                Ok(Ctl::Next)
            }
            Opcode::GlobalPopObject => {
                for _ in 0..value {
                    co.o_stack
                        .push(self.mailbox.o_in.pop_front().unwrap_or_default());
                }
                Ok(Ctl::Next)
            }

            // ----- Integer arithmetic -----
            Opcode::AddInt => {
                ops_arith::add_int(co);
                Ok(Ctl::Next)
            }
            Opcode::SubInt => {
                ops_arith::sub_int(co);
                Ok(Ctl::Next)
            }
            Opcode::MulInt => {
                ops_arith::mul_int(co);
                Ok(Ctl::Next)
            }
            Opcode::DivInt => {
                ops_arith::div_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::RemInt => {
                ops_arith::rem_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::NegInt => {
                ops_arith::neg_int(co);
                Ok(Ctl::Next)
            }
            Opcode::IncInt => {
                ops_arith::inc_int(co);
                Ok(Ctl::Next)
            }
            Opcode::DecInt => {
                ops_arith::dec_int(co);
                Ok(Ctl::Next)
            }
            Opcode::EqInt => {
                ops_arith::eq_int(co);
                Ok(Ctl::Next)
            }
            Opcode::NeInt => {
                ops_arith::ne_int(co);
                Ok(Ctl::Next)
            }
            Opcode::LtInt => {
                ops_arith::lt_int(co);
                Ok(Ctl::Next)
            }
            Opcode::LeInt => {
                ops_arith::le_int(co);
                Ok(Ctl::Next)
            }
            Opcode::GtInt => {
                ops_arith::gt_int(co);
                Ok(Ctl::Next)
            }
            Opcode::GeInt => {
                ops_arith::ge_int(co);
                Ok(Ctl::Next)
            }
            Opcode::AndInt => {
                ops_arith::and_int(co);
                Ok(Ctl::Next)
            }
            Opcode::OrInt => {
                ops_arith::or_int(co);
                Ok(Ctl::Next)
            }
            Opcode::NotInt => {
                ops_arith::not_int(co);
                Ok(Ctl::Next)
            }

            // ----- Float arithmetic -----
            Opcode::AddFloat => {
                ops_arith::add_float(co);
                Ok(Ctl::Next)
            }
            Opcode::SubFloat => {
                ops_arith::sub_float(co);
                Ok(Ctl::Next)
            }
            Opcode::MulFloat => {
                ops_arith::mul_float(co);
                Ok(Ctl::Next)
            }
            Opcode::DivFloat => {
                ops_arith::div_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::RemFloat => {
                ops_arith::rem_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::NegFloat => {
                ops_arith::neg_float(co);
                Ok(Ctl::Next)
            }
            Opcode::IncFloat => {
                ops_arith::inc_float(co);
                Ok(Ctl::Next)
            }
            Opcode::DecFloat => {
                ops_arith::dec_float(co);
                Ok(Ctl::Next)
            }
            Opcode::EqFloat => {
                ops_arith::eq_float(co);
                Ok(Ctl::Next)
            }
            Opcode::NeFloat => {
                ops_arith::ne_float(co);
                Ok(Ctl::Next)
            }
            Opcode::LtFloat => {
                ops_arith::lt_float(co);
                Ok(Ctl::Next)
            }
            Opcode::LeFloat => {
                ops_arith::le_float(co);
                Ok(Ctl::Next)
            }
            Opcode::GtFloat => {
                ops_arith::gt_float(co);
                Ok(Ctl::Next)
            }
            Opcode::GeFloat => {
                ops_arith::ge_float(co);
                Ok(Ctl::Next)
            }

            // ----- Strings -----
            Opcode::ConcatString => {
                ops_arith::concat_string(co);
                Ok(Ctl::Next)
            }
            Opcode::EqString => {
                ops_arith::eq_string(co);
                Ok(Ctl::Next)
            }
            Opcode::NeString => {
                ops_arith::ne_string(co);
                Ok(Ctl::Next)
            }
            Opcode::LtString => {
                ops_arith::lt_string(co);
                Ok(Ctl::Next)
            }
            Opcode::LeString => {
                ops_arith::le_string(co);
                Ok(Ctl::Next)
            }
            Opcode::GtString => {
                ops_arith::gt_string(co);
                Ok(Ctl::Next)
            }
            Opcode::GeString => {
                ops_arith::ge_string(co);
                Ok(Ctl::Next)
            }

            // ----- Arrays -----
            Opcode::ArrayInt => {
                ops_struct::build_int(co, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::IndexInt => {
                ops_struct::index_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::Index2Int => {
                ops_struct::index2_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::Index3Int => {
                ops_struct::index3_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::LengthInt => {
                ops_struct::length_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::ConcatIntArray => {
                ops_struct::concat_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::AppendInt => {
                ops_struct::append_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::PrependInt => {
                ops_struct::prepend_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::EqIntArray => {
                ops_struct::eq_int_array(co)?;
                Ok(Ctl::Next)
            }

            Opcode::ArrayFloat => {
                ops_struct::build_float(co, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::IndexFloat => {
                ops_struct::index_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::Index2Float => {
                ops_struct::index2_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::Index3Float => {
                ops_struct::index3_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::LengthFloat => {
                ops_struct::length_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::ConcatFloatArray => {
                ops_struct::concat_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::AppendFloat => {
                ops_struct::append_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::PrependFloat => {
                ops_struct::prepend_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::EqFloatArray => {
                ops_struct::eq_float_array(co)?;
                Ok(Ctl::Next)
            }

            Opcode::ArrayString => {
                ops_struct::build_string(co, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::IndexString => {
                ops_struct::index_string(co)?;
                Ok(Ctl::Next)
            }
            Opcode::Index2String => {
                ops_struct::index2_string(co)?;
                Ok(Ctl::Next)
            }
            Opcode::Index3String => {
                ops_struct::index3_string(co)?;
                Ok(Ctl::Next)
            }
            Opcode::LengthString => {
                ops_struct::length_string(co)?;
                Ok(Ctl::Next)
            }
            Opcode::ConcatStringArray => {
                ops_struct::concat_string(co)?;
                Ok(Ctl::Next)
            }
            Opcode::AppendString => {
                ops_struct::append_string(co)?;
                Ok(Ctl::Next)
            }
            Opcode::PrependString => {
                ops_struct::prepend_string(co)?;
                Ok(Ctl::Next)
            }
            Opcode::EqStringArray => {
                ops_struct::eq_string_array(co)?;
                Ok(Ctl::Next)
            }

            Opcode::ArrayObject => {
                ops_struct::build_object(co, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::IndexObject => {
                ops_struct::index_object(co)?;
                Ok(Ctl::Next)
            }
            Opcode::Index2Object => {
                ops_struct::index2_object(co)?;
                Ok(Ctl::Next)
            }
            Opcode::Index3Object => {
                ops_struct::index3_object(co)?;
                Ok(Ctl::Next)
            }
            Opcode::LengthObject => {
                ops_struct::length_object(co)?;
                Ok(Ctl::Next)
            }
            Opcode::ConcatObjectArray => {
                ops_struct::concat_object(co)?;
                Ok(Ctl::Next)
            }
            Opcode::AppendObject => {
                ops_struct::append_object(co)?;
                Ok(Ctl::Next)
            }
            Opcode::PrependObject => {
                ops_struct::prepend_object(co)?;
                Ok(Ctl::Next)
            }
            Opcode::EqObjectArray => {
                ops_struct::eq_object_array(co)?;
                Ok(Ctl::Next)
            }

            // ----- References -----
            Opcode::RefStoreInt => {
                ops_struct::ref_store_int(co)?;
                Ok(Ctl::Next)
            }
            Opcode::RefStoreFloat => {
                ops_struct::ref_store_float(co)?;
                Ok(Ctl::Next)
            }
            Opcode::RefStoreString => {
                ops_struct::ref_store_string(co)?;
                Ok(Ctl::Next)
            }
            Opcode::RefStoreObject => {
                ops_struct::ref_store_obj(co)?;
                Ok(Ctl::Next)
            }
            Opcode::RefLocalInt => {
                ops_struct::ref_local_int(co, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::RefLocalFloat => {
                ops_struct::ref_local_float(co, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::RefLocalString => {
                ops_struct::ref_local_string(co, value as usize);
                Ok(Ctl::Next)
            }
            Opcode::RefLocalObject => {
                ops_struct::ref_local_obj(co, value as usize);
                Ok(Ctl::Next)
            }

            // ----- Fields -----
            Opcode::FieldLoadInt => {
                ops_struct::field_load_int(co, value as usize)?;
                Ok(Ctl::Next)
            }
            Opcode::FieldLoadFloat => {
                ops_struct::field_load_float(co, value as usize)?;
                Ok(Ctl::Next)
            }
            Opcode::FieldLoadString => {
                ops_struct::field_load_string(co, value as usize)?;
                Ok(Ctl::Next)
            }
            Opcode::FieldLoadObject => {
                ops_struct::field_load_obj(co, value as usize)?;
                Ok(Ctl::Next)
            }
            Opcode::FieldStoreInt => {
                ops_struct::field_store_int(co, value as usize)?;
                Ok(Ctl::Next)
            }
            Opcode::FieldStoreFloat => {
                ops_struct::field_store_float(co, value as usize)?;
                Ok(Ctl::Next)
            }
            Opcode::FieldStoreString => {
                ops_struct::field_store_string(co, value as usize)?;
                Ok(Ctl::Next)
            }
            Opcode::FieldStoreObject => {
                ops_struct::field_store_obj(co, value as usize)?;
                Ok(Ctl::Next)
            }

            // ----- Channels and select -----
            Opcode::NewChannel => {
                let (kind_b, capacity) = fields(value);
                let kind = Kind::try_from(kind_b).unwrap_or(Kind::Int);
                debug_assert!(Kind::try_from(kind_b).is_ok(), "bad channel kind");
                let chan = Channel::new(kind, capacity as usize);
                co.o_stack.push(Obj::Channel(Rc::new(RefCell::new(chan))));
                Ok(Ctl::Next)
            }
            Opcode::SendInt => channel::send_int(co),
            Opcode::SendFloat => channel::send_float(co),
            Opcode::SendString => channel::send_string(co),
            Opcode::SendObject => channel::send_object(co),
            Opcode::ReceiveInt => channel::receive_int(co),
            Opcode::ReceiveFloat => channel::receive_float(co),
            Opcode::ReceiveString => channel::receive_string(co),
            Opcode::ReceiveObject => channel::receive_object(co),
            Opcode::StartSelectChannel => {
                channel::start_select(co);
                Ok(Ctl::Next)
            }
            Opcode::TryChannel => {
                channel::try_channel(co, jump_target(co.pc, signed(value)))?;
                Ok(Ctl::Next)
            }
            Opcode::CheckChannel => {
                channel::check_channel(co);
                Ok(Ctl::Next)
            }
            Opcode::EndSelectChannel => {
                channel::end_select(co);
                Ok(Ctl::Next)
            }
        }
    }

    /// Invoke a host primitive: pop its parameters per the resolved
    /// signature, run it synchronously, push whatever it returned, then
    /// honor any contexts it queued.
    fn prim_call(&mut self, co: &mut Coroutine, index: usize) -> Result<Ctl, Exception> {
        let Some(prim) = self.primitives.get(index) else {
            debug_assert!(false, "primitive index out of range");
            return Ok(Ctl::Next);
        };
        let func = prim.func;
        let params = prim.signature.params.clone();

        let mut args = CallValues::default();
        for kind in params.iter().rev() {
            match kind {
                Kind::Int => args.ints.insert(0, co.pop_int()),
                Kind::Float => args.floats.insert(0, co.pop_float()),
                Kind::Str => args.strings.insert(0, co.pop_string()),
                Kind::Obj => args.objects.insert(0, co.pop_obj()),
            }
        }

        let mut call = Call::new(args, &mut *self.out);
        func(&mut call);
        let (rets, contexts) = call.finish();

        co.i_stack.extend(rets.ints);
        co.f_stack.extend(rets.floats);
        co.s_stack.extend(rets.strings);
        co.o_stack.extend(rets.objects);

        for ctx in contexts {
            if let Err(err) = self.push_context(ctx) {
                error!(%err, "context from primitive rejected");
            }
        }
        Ok(Ctl::Next)
    }
}

fn jump_target(pc: usize, offset: i32) -> usize {
    (pc as i64 + offset as i64) as usize
}
