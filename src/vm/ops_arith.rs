//! # Arithmetic, Comparison, and Stack-Shape Operations
//!
//! Handlers for the per-partition value opcodes: push/copy/swap/shift,
//! integer and float arithmetic, comparisons (which always push their
//! integer truth value on the integer stack), boolean logic on integers,
//! and string concatenation/ordering.
//!
//! Each handler pops its operands right-then-left and pushes one result,
//! returning `Result<(), Exception>` where a script-level fault is
//! possible so the dispatcher can route the message into the unwinder.
//! Division and remainder check the divisor *before* touching the
//! dividend, for both partitions. Integer arithmetic wraps.

use crate::error::{exception, Exception};
use crate::value::Obj;

use super::coroutine::Coroutine;

macro_rules! int_binop {
    ($name:ident, $method:ident) => {
        pub(super) fn $name(co: &mut Coroutine) {
            let b = co.pop_int();
            let a = co.pop_int();
            co.i_stack.push(a.$method(b));
        }
    };
}

int_binop!(add_int, wrapping_add);
int_binop!(sub_int, wrapping_sub);
int_binop!(mul_int, wrapping_mul);

pub(super) fn div_int(co: &mut Coroutine) -> Result<(), Exception> {
    let b = co.pop_int();
    if b == 0 {
        return Err(exception::ZERO_DIVISION.to_string());
    }
    let a = co.pop_int();
    co.i_stack.push(a.wrapping_div(b));
    Ok(())
}

pub(super) fn rem_int(co: &mut Coroutine) -> Result<(), Exception> {
    let b = co.pop_int();
    if b == 0 {
        return Err(exception::ZERO_DIVISION.to_string());
    }
    let a = co.pop_int();
    co.i_stack.push(a.wrapping_rem(b));
    Ok(())
}

pub(super) fn neg_int(co: &mut Coroutine) {
    let v = co.pop_int();
    co.i_stack.push(v.wrapping_neg());
}

pub(super) fn inc_int(co: &mut Coroutine) {
    if let Some(top) = co.i_stack.last_mut() {
        *top = top.wrapping_add(1);
    }
}

pub(super) fn dec_int(co: &mut Coroutine) {
    if let Some(top) = co.i_stack.last_mut() {
        *top = top.wrapping_sub(1);
    }
}

macro_rules! cmp_op {
    ($name:ident, $pop:ident, $op:tt) => {
        pub(super) fn $name(co: &mut Coroutine) {
            let b = co.$pop();
            let a = co.$pop();
            co.i_stack.push((a $op b) as i32);
        }
    };
}

cmp_op!(eq_int, pop_int, ==);
cmp_op!(ne_int, pop_int, !=);
cmp_op!(lt_int, pop_int, <);
cmp_op!(le_int, pop_int, <=);
cmp_op!(gt_int, pop_int, >);
cmp_op!(ge_int, pop_int, >=);

pub(super) fn and_int(co: &mut Coroutine) {
    let b = co.pop_int();
    let a = co.pop_int();
    co.i_stack.push((a != 0 && b != 0) as i32);
}

pub(super) fn or_int(co: &mut Coroutine) {
    let b = co.pop_int();
    let a = co.pop_int();
    co.i_stack.push((a != 0 || b != 0) as i32);
}

pub(super) fn not_int(co: &mut Coroutine) {
    let v = co.pop_int();
    co.i_stack.push((v == 0) as i32);
}

macro_rules! float_binop {
    ($name:ident, $op:tt) => {
        pub(super) fn $name(co: &mut Coroutine) {
            let b = co.pop_float();
            let a = co.pop_float();
            co.f_stack.push(a $op b);
        }
    };
}

float_binop!(add_float, +);
float_binop!(sub_float, -);
float_binop!(mul_float, *);

pub(super) fn div_float(co: &mut Coroutine) -> Result<(), Exception> {
    let b = co.pop_float();
    if b == 0.0 {
        return Err(exception::ZERO_DIVISION.to_string());
    }
    let a = co.pop_float();
    co.f_stack.push(a / b);
    Ok(())
}

pub(super) fn rem_float(co: &mut Coroutine) -> Result<(), Exception> {
    let b = co.pop_float();
    if b == 0.0 {
        return Err(exception::ZERO_DIVISION.to_string());
    }
    let a = co.pop_float();
    co.f_stack.push(a % b);
    Ok(())
}

pub(super) fn neg_float(co: &mut Coroutine) {
    let v = co.pop_float();
    co.f_stack.push(-v);
}

pub(super) fn inc_float(co: &mut Coroutine) {
    if let Some(top) = co.f_stack.last_mut() {
        *top += 1.0;
    }
}

pub(super) fn dec_float(co: &mut Coroutine) {
    if let Some(top) = co.f_stack.last_mut() {
        *top -= 1.0;
    }
}

cmp_op!(eq_float, pop_float, ==);
cmp_op!(ne_float, pop_float, !=);
cmp_op!(lt_float, pop_float, <);
cmp_op!(le_float, pop_float, <=);
cmp_op!(gt_float, pop_float, >);
cmp_op!(ge_float, pop_float, >=);

pub(super) fn concat_string(co: &mut Coroutine) {
    let b = co.pop_string();
    let mut a = co.pop_string();
    a.push_str(&b);
    co.s_stack.push(a);
}

cmp_op!(eq_string, pop_string, ==);
cmp_op!(ne_string, pop_string, !=);
cmp_op!(lt_string, pop_string, <);
cmp_op!(le_string, pop_string, <=);
cmp_op!(gt_string, pop_string, >);
cmp_op!(ge_string, pop_string, >=);

// ----- Stack shape: copy / swap / shift, one triple per partition -----

macro_rules! shape_ops {
    ($copy:ident, $swap:ident, $shift:ident, $stack:ident, $default:expr) => {
        pub(super) fn $copy(co: &mut Coroutine) {
            debug_assert!(!co.$stack.is_empty(), "copy on empty stack");
            if let Some(top) = co.$stack.last().cloned() {
                co.$stack.push(top);
            }
        }

        pub(super) fn $swap(co: &mut Coroutine) {
            let n = co.$stack.len();
            debug_assert!(n >= 2, "swap needs two values");
            if n >= 2 {
                co.$stack.swap(n - 1, n - 2);
            }
        }

        /// Positive count reserves default-valued slots, negative drops.
        pub(super) fn $shift(co: &mut Coroutine, by: i32) {
            if by >= 0 {
                for _ in 0..by {
                    co.$stack.push($default);
                }
            } else {
                let keep = co.$stack.len().saturating_sub(-by as usize);
                co.$stack.truncate(keep);
            }
        }
    };
}

shape_ops!(copy_int, swap_int, shift_int, i_stack, 0);
shape_ops!(copy_float, swap_float, shift_float, f_stack, 0.0);
shape_ops!(copy_string, swap_string, shift_string, s_stack, String::new());
shape_ops!(copy_obj, swap_obj, shift_obj, o_stack, Obj::Null);
