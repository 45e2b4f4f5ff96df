//! # Calls, Returns, and the Unwinder
//!
//! The single live unwinding sequence lives in [`unwind`]. It is entered
//! from `raise`, from the `unwind` opcode at the end of deferred blocks,
//! from `return`, and from `kill`, and proceeds per frame:
//!
//! 1. While panicking, a frame with a pending handler gets control at the
//!    handler PC (`catch` then decides whether the panic is absorbed).
//! 2. A frame with pending defers runs them LIFO; each deferred block ends
//!    in an `unwind` opcode that re-enters the sequence.
//! 3. Otherwise the frame is torn down — locals bases restored — and the
//!    sequence continues in the caller. A plain return stops here and
//!    resumes at `ret_pc`; panic and kill keep going.
//! 4. A panic that tears down the root frame escalates to a VM panic:
//!    every other coroutine is killed and pointed at the terminal unwind,
//!    the spawn queue is cleared, and the panicking coroutine is removed.

use tracing::{debug, trace};

use crate::error::Exception;

use super::coroutine::{Coroutine, Frame};
use super::Vm;

/// Push a frame and jump. The caller's per-partition reservation is
/// snapshotted into the new frame so the return can restore the base.
pub(super) fn call(co: &mut Coroutine, target: usize) {
    let saved = co.frames.last().map(|f| f.reserved).unwrap_or_default();
    for kind in 0..4 {
        co.locals_base[kind] += saved[kind];
    }
    co.frames.push(Frame {
        ret_pc: co.pc + 1,
        reserved: [0; 4],
        saved,
        defers: Vec::new(),
        handlers: Vec::new(),
    });
    co.pc = target;
}

/// `anonymous_call`: the target PC comes from the integer stack.
pub(super) fn anon_call(co: &mut Coroutine) {
    let target = co.pop_int().max(0) as usize;
    call(co, target);
}

/// Begin panicking with `message` and enter the unwinder.
pub(super) fn raise(vm: &mut Vm, co: &mut Coroutine, message: Exception) {
    debug!(
        coroutine = co.id,
        message = %message,
        trace = %vm.stack_trace(co),
        "raise"
    );
    co.panic_msg = message;
    co.is_panicking = true;
    co.is_evaluating_channel = false;
    unwind(vm, co);
}

/// Normal return: run remaining defers, then pop the frame and resume the
/// caller. Popping the root frame removes the coroutine.
pub(super) fn do_return(vm: &mut Vm, co: &mut Coroutine) {
    unwind(vm, co);
}

/// Cooperative death: defers still run, handlers are skipped, every frame
/// is torn down.
pub(super) fn kill(vm: &mut Vm, co: &mut Coroutine) {
    co.is_killed = true;
    unwind(vm, co);
}

/// Kill every live coroutine and clear the spawn queue. The issuing
/// coroutine unwinds from the terminal PC like the rest.
pub(super) fn kill_all(vm: &mut Vm, co: &mut Coroutine) {
    debug!(coroutine = co.id, "kill_all");
    for other in vm.tasks.iter_mut() {
        if !other.removed {
            other.is_killed = true;
            other.pc = vm.unwind_pc;
        }
    }
    vm.spawned.clear();
    co.is_killed = true;
    co.pc = vm.unwind_pc;
}

/// The unwinding walk; see the module docs for the per-frame sequence.
pub(super) fn unwind(vm: &mut Vm, co: &mut Coroutine) {
    loop {
        if co.is_panicking {
            if let Some(frame) = co.frames.last() {
                if let Some(&handler) = frame.handlers.last() {
                    co.pc = handler;
                    return;
                }
            }
        }
        if let Some(frame) = co.frames.last_mut() {
            if let Some(defer_pc) = frame.defers.pop() {
                trace!(coroutine = co.id, pc = defer_pc, "running defer");
                co.pc = defer_pc;
                return;
            }
        }
        match co.frames.pop() {
            Some(frame) => {
                if co.frames.is_empty() {
                    if co.is_panicking {
                        escalate(vm, co);
                    }
                    co.removed = true;
                    return;
                }
                for kind in 0..4 {
                    co.locals_base[kind] -= frame.saved[kind];
                }
                if !co.is_panicking && !co.is_killed {
                    co.pc = frame.ret_pc;
                    return;
                }
            }
            None => {
                co.removed = true;
                return;
            }
        }
    }
}

/// A panic left the root frame: the whole VM goes down cooperatively.
fn escalate(vm: &mut Vm, co: &mut Coroutine) {
    debug!(coroutine = co.id, message = %co.panic_msg, "panic reached root frame");
    vm.panicked = true;
    vm.panic_message = co.panic_msg.clone();
    vm.mailbox.s_in.push_back(co.panic_msg.clone());
    for other in vm.tasks.iter_mut() {
        if !other.removed {
            other.is_killed = true;
            other.pc = vm.unwind_pc;
        }
    }
    vm.spawned.clear();
}
