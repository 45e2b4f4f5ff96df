//! # Structural Operations: Arrays, Objects, References
//!
//! Handlers for the compound-value opcodes:
//! - **Array build** (`array_<kind>`): pop N values into a fresh array.
//! - **Indexing**: the reference form pushes a write-through slot
//!   reference, the value form pushes the element, the dual form pushes
//!   both (for in-place operators). Indices wrap once when negative and
//!   must land in `[0, len)` or `IndexError` is raised.
//! - **Length / concatenate / append / prepend / structural equality.**
//!   Append and prepend leave the array back on the object stack so
//!   chained inserts need no reload.
//! - **Field access** on class instances; a null receiver raises
//!   `NullError`.
//! - **Reference stores** (`refStore_<kind>`), writing through an
//!   array-slot or local-slot reference from the object stack.
//!
//! Containers live behind `Rc<RefCell<…>>`, so popping an array and
//! pushing a reference into it keeps the allocation alive.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{exception, Exception};
use crate::value::{Obj, Object, Ref};

use super::coroutine::Coroutine;

/// Wrap a possibly negative index once and bounds-check the result.
fn wrap_index(idx: i32, len: usize) -> Result<usize, Exception> {
    let wrapped = if idx < 0 { idx + len as i32 } else { idx };
    if wrapped >= 0 && (wrapped as usize) < len {
        Ok(wrapped as usize)
    } else {
        Err(exception::INDEX.to_string())
    }
}

fn instance(receiver: Obj) -> Result<Rc<RefCell<Object>>, Exception> {
    match receiver {
        Obj::Instance(obj) => Ok(obj),
        _ => Err(exception::NULL.to_string()),
    }
}

macro_rules! array_ops {
    ($elem:ty, $variant:ident, $refvariant:ident, $vpop:ident, $vstack:ident,
     $popped:ident, $build:ident, $index:ident, $index2:ident, $index3:ident,
     $length:ident, $concat:ident, $append:ident, $prepend:ident, $eq:ident) => {
        fn $popped(co: &mut Coroutine) -> Result<Rc<RefCell<Vec<$elem>>>, Exception> {
            match co.pop_obj() {
                Obj::$variant(items) => Ok(items),
                _ => Err(exception::NULL.to_string()),
            }
        }

        pub(super) fn $build(co: &mut Coroutine, n: usize) {
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(co.$vpop());
            }
            items.reverse();
            co.o_stack.push(Obj::$variant(Rc::new(RefCell::new(items))));
        }

        pub(super) fn $index(co: &mut Coroutine) -> Result<(), Exception> {
            let idx = co.pop_int();
            let items = $popped(co)?;
            let at = wrap_index(idx, items.borrow().len())?;
            co.o_stack.push(Obj::Ref(Ref::$refvariant(items, at)));
            Ok(())
        }

        pub(super) fn $index2(co: &mut Coroutine) -> Result<(), Exception> {
            let idx = co.pop_int();
            let items = $popped(co)?;
            let at = wrap_index(idx, items.borrow().len())?;
            let value = items.borrow()[at].clone();
            co.$vstack.push(value);
            Ok(())
        }

        pub(super) fn $index3(co: &mut Coroutine) -> Result<(), Exception> {
            let idx = co.pop_int();
            let items = $popped(co)?;
            let at = wrap_index(idx, items.borrow().len())?;
            let value = items.borrow()[at].clone();
            co.o_stack.push(Obj::Ref(Ref::$refvariant(items, at)));
            co.$vstack.push(value);
            Ok(())
        }

        pub(super) fn $length(co: &mut Coroutine) -> Result<(), Exception> {
            let items = $popped(co)?;
            let len = items.borrow().len() as i32;
            co.i_stack.push(len);
            Ok(())
        }

        pub(super) fn $concat(co: &mut Coroutine) -> Result<(), Exception> {
            let b = $popped(co)?;
            let a = $popped(co)?;
            let mut joined = a.borrow().clone();
            joined.extend(b.borrow().iter().cloned());
            co.o_stack.push(Obj::$variant(Rc::new(RefCell::new(joined))));
            Ok(())
        }

        pub(super) fn $append(co: &mut Coroutine) -> Result<(), Exception> {
            let value = co.$vpop();
            let items = $popped(co)?;
            items.borrow_mut().push(value);
            co.o_stack.push(Obj::$variant(items));
            Ok(())
        }

        pub(super) fn $prepend(co: &mut Coroutine) -> Result<(), Exception> {
            let value = co.$vpop();
            let items = $popped(co)?;
            items.borrow_mut().insert(0, value);
            co.o_stack.push(Obj::$variant(items));
            Ok(())
        }

        pub(super) fn $eq(co: &mut Coroutine) -> Result<(), Exception> {
            let b = $popped(co)?;
            let a = $popped(co)?;
            let equal = Rc::ptr_eq(&a, &b) || *a.borrow() == *b.borrow();
            co.i_stack.push(equal as i32);
            Ok(())
        }
    };
}

array_ops!(
    i32, IntArray, IntElem, pop_int, i_stack, popped_int_array, build_int, index_int, index2_int,
    index3_int, length_int, concat_int, append_int, prepend_int, eq_int_array
);
array_ops!(
    f32, FloatArray, FloatElem, pop_float, f_stack, popped_float_array, build_float, index_float,
    index2_float, index3_float, length_float, concat_float, append_float, prepend_float,
    eq_float_array
);
array_ops!(
    String, StringArray, StrElem, pop_string, s_stack, popped_string_array, build_string,
    index_string, index2_string, index3_string, length_string, concat_string, append_string,
    prepend_string, eq_string_array
);
array_ops!(
    Obj, ObjectArray, ObjElem, pop_obj, o_stack, popped_object_array, build_object, index_object,
    index2_object, index3_object, length_object, concat_object, append_object, prepend_object,
    eq_object_array
);

// ----- Field access -----

macro_rules! field_ops {
    ($load:ident, $store:ident, $fields:ident, $vpop:ident, $vstack:ident) => {
        pub(super) fn $load(co: &mut Coroutine, field: usize) -> Result<(), Exception> {
            let receiver = co.pop_obj();
            let obj = instance(receiver)?;
            let value = obj
                .borrow()
                .$fields
                .get(field)
                .cloned()
                .ok_or_else(|| exception::NULL.to_string())?;
            co.$vstack.push(value);
            Ok(())
        }

        pub(super) fn $store(co: &mut Coroutine, field: usize) -> Result<(), Exception> {
            let value = co.$vpop();
            let receiver = co.pop_obj();
            let obj = instance(receiver)?;
            if let Some(slot) = obj.borrow_mut().$fields.get_mut(field) {
                *slot = value;
            }
            Ok(())
        }
    };
}

field_ops!(field_load_int, field_store_int, i_fields, pop_int, i_stack);
field_ops!(field_load_float, field_store_float, f_fields, pop_float, f_stack);
field_ops!(field_load_string, field_store_string, s_fields, pop_string, s_stack);
field_ops!(field_load_obj, field_store_obj, o_fields, pop_obj, o_stack);

// ----- Reference stores and local references -----

macro_rules! ref_store {
    ($name:ident, $elem:ident, $local:ident, $vpop:ident, $arena:ident, $default:expr) => {
        pub(super) fn $name(co: &mut Coroutine) -> Result<(), Exception> {
            let value = co.$vpop();
            match co.pop_obj() {
                Obj::Ref(Ref::$elem(items, at)) => {
                    if let Some(slot) = items.borrow_mut().get_mut(at) {
                        *slot = value;
                    }
                    Ok(())
                }
                Obj::Ref(Ref::$local(at)) => {
                    if at >= co.$arena.len() {
                        co.$arena.resize(at + 1, $default);
                    }
                    co.$arena[at] = value;
                    Ok(())
                }
                _ => Err(exception::NULL.to_string()),
            }
        }
    };
}

ref_store!(ref_store_int, IntElem, IntLocal, pop_int, i_locals, 0);
ref_store!(ref_store_float, FloatElem, FloatLocal, pop_float, f_locals, 0.0);
ref_store!(ref_store_string, StrElem, StrLocal, pop_string, s_locals, String::new());
ref_store!(ref_store_obj, ObjElem, ObjLocal, pop_obj, o_locals, Obj::Null);

pub(super) fn ref_local_int(co: &mut Coroutine, offset: usize) {
    co.o_stack.push(Obj::Ref(Ref::IntLocal(co.locals_base[0] + offset)));
}

pub(super) fn ref_local_float(co: &mut Coroutine, offset: usize) {
    co.o_stack.push(Obj::Ref(Ref::FloatLocal(co.locals_base[1] + offset)));
}

pub(super) fn ref_local_string(co: &mut Coroutine, offset: usize) {
    co.o_stack.push(Obj::Ref(Ref::StrLocal(co.locals_base[2] + offset)));
}

pub(super) fn ref_local_obj(co: &mut Coroutine, offset: usize) {
    co.o_stack.push(Obj::Ref(Ref::ObjLocal(co.locals_base[3] + offset)));
}
