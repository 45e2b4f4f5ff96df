//! # Channel Send/Receive and Select Evaluation
//!
//! A send or receive finds its channel on the object stack (and, for the
//! value-carrying partitions, its operand on the matching typed stack) and
//! proceeds only when the transfer can complete:
//!
//! - **Outside a select**: an op that cannot proceed leaves the operands
//!   and the PC untouched, marks the coroutine locked, and suspends it.
//!   A blocked sender retries its instruction on every later round; a
//!   blocked receiver additionally parks on the channel (setting its
//!   receiver-ready flag) and is skipped by the scheduler until a send
//!   clears the flag or the channel closes. A closed channel raises
//!   `ChannelError`.
//! - **Inside a select** (armed by `try_channel`): a miss restores the
//!   select snapshot, records the lock, and jumps to the next case; a
//!   closed channel takes the case without a transfer (receive pushes the
//!   partition's zero value); success falls through into the case body.
//!
//! Operand convention: the channel sits on the object stack with the value
//! on its partition's stack; for object transfers both share the object
//! stack, value above channel.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{exception, Exception};
use crate::value::{Channel, Obj};

use super::coroutine::Coroutine;
use super::Ctl;

/// Channel operand for the non-object partitions: top of the object stack.
fn channel_at(co: &Coroutine, depth: usize) -> Result<Rc<RefCell<Channel>>, Exception> {
    let n = co.o_stack.len();
    let slot = n.checked_sub(depth + 1).and_then(|i| co.o_stack.get(i));
    match slot {
        Some(Obj::Channel(ch)) => Ok(ch.clone()),
        Some(Obj::Null) | None => Err(exception::NULL.to_string()),
        Some(_) => Err(exception::CHANNEL.to_string()),
    }
}

/// A select case that cannot proceed: restore the snapshot and move on to
/// the next case, remembering that something blocked.
fn select_miss(co: &mut Coroutine) {
    co.restore_select();
    co.is_locked = true;
    co.is_evaluating_channel = false;
    co.pc = co.select_jump_pc;
}

macro_rules! send_op {
    ($name:ident, $vpop:ident, $send:ident, $chan_depth:literal) => {
        pub(super) fn $name(co: &mut Coroutine) -> Result<Ctl, Exception> {
            let ch = channel_at(co, $chan_depth)?;
            let mut chan = ch.borrow_mut();
            if !chan.owned {
                if co.is_evaluating_channel {
                    // Closed channel selects this case without a transfer.
                    co.is_evaluating_channel = false;
                    let _ = co.$vpop();
                    discard_channel_operand(co);
                    return Ok(Ctl::Next);
                }
                let _ = co.$vpop();
                discard_channel_operand(co);
                return Err(exception::CHANNEL.to_string());
            }
            if !chan.is_full() {
                let value = co.$vpop();
                discard_channel_operand(co);
                chan.$send(value);
                // Wake any parked receiver on the next round.
                chan.receiver_ready = false;
                co.is_evaluating_channel = false;
                Ok(Ctl::Next)
            } else if co.is_evaluating_channel {
                drop(chan);
                select_miss(co);
                Ok(Ctl::Jumped)
            } else {
                co.is_locked = true;
                Ok(Ctl::Block)
            }
        }
    };
}

/// Remove the channel operand once the op resolves. For object sends the
/// value sat above the channel and has already been popped, so the channel
/// is back on top.
fn discard_channel_operand(co: &mut Coroutine) {
    co.pop_obj();
}

send_op!(send_int, pop_int, send_int, 0);
send_op!(send_float, pop_float, send_float, 0);
send_op!(send_string, pop_string, send_string, 0);
send_op!(send_object, pop_obj, send_object, 1);

macro_rules! receive_op {
    ($name:ident, $vstack:ident, $recv:ident, $zero:expr) => {
        pub(super) fn $name(co: &mut Coroutine) -> Result<Ctl, Exception> {
            let ch = channel_at(co, 0)?;
            let mut chan = ch.borrow_mut();
            if !chan.owned {
                if co.is_evaluating_channel {
                    co.is_evaluating_channel = false;
                    co.pop_obj();
                    co.$vstack.push($zero);
                    return Ok(Ctl::Next);
                }
                co.pop_obj();
                return Err(exception::CHANNEL.to_string());
            }
            match chan.$recv() {
                Some(value) => {
                    chan.receiver_ready = false;
                    co.pop_obj();
                    co.$vstack.push(value);
                    co.is_evaluating_channel = false;
                    Ok(Ctl::Next)
                }
                None if co.is_evaluating_channel => {
                    drop(chan);
                    select_miss(co);
                    Ok(Ctl::Jumped)
                }
                None => {
                    chan.receiver_ready = true;
                    co.is_locked = true;
                    co.waiting = Some(ch.clone());
                    Ok(Ctl::Block)
                }
            }
        }
    };
}

receive_op!(receive_int, i_stack, recv_int, 0);
receive_op!(receive_float, f_stack, recv_float, 0.0);
receive_op!(receive_string, s_stack, recv_string, String::new());
receive_op!(receive_object, o_stack, recv_object, Obj::Null);

// ----- Select scaffolding -----

pub(super) fn start_select(co: &mut Coroutine) {
    co.save_select();
}

/// Arm the next send/receive as a select case. A second `try_channel`
/// while one is already armed raises `SelectError`.
pub(super) fn try_channel(co: &mut Coroutine, jump_pc: usize) -> Result<(), Exception> {
    if co.is_evaluating_channel {
        return Err(exception::SELECT.to_string());
    }
    co.is_evaluating_channel = true;
    co.select_jump_pc = jump_pc;
    Ok(())
}

/// Unify paths at the end of the select body.
pub(super) fn check_channel(co: &mut Coroutine) {
    co.restore_select();
    co.is_evaluating_channel = false;
}

pub(super) fn end_select(co: &mut Coroutine) {
    co.drop_select();
}
