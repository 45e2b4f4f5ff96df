use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use super::Vm;
use crate::bytecode::{
    word, word2, word_signed, Bytecode, Class, Event, Field, GlobalCounts, Kind, Opcode, Primitive,
    Variable,
};
use crate::error::HostError;
use crate::vm::primitives::{CallValues, Context, CORE};

/// Capturing print sink; the test keeps a clone of the handle.
#[derive(Clone, Default)]
struct Sink(Rc<RefCell<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Sink {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).to_string()
    }
}

fn main_program(opcodes: Vec<u32>) -> Bytecode {
    Bytecode {
        opcodes,
        events: vec![Event {
            name: "main".to_string(),
            pc: 0,
        }],
        ..Bytecode::default()
    }
}

fn prim(signature: &str) -> Primitive {
    Primitive {
        library: 0,
        signature: signature.to_string(),
    }
}

fn int_var(name: &str, index: u32) -> Variable {
    Variable {
        name: name.to_string(),
        index,
        mask: Kind::Int.mask(),
    }
}

fn vm_with(code: Bytecode) -> (Vm, Sink) {
    let mut vm = Vm::new();
    vm.add_library(&CORE);
    let sink = Sink::default();
    vm.set_output(Box::new(sink.clone()));
    vm.load(code).expect("load");
    vm.spawn().expect("spawn");
    (vm, sink)
}

/// Run rounds until the pool drains; returns how many rounds it took.
fn drive(vm: &mut Vm) -> u32 {
    let mut rounds = 0;
    while vm.has_coroutines() && rounds < 100 {
        vm.process();
        rounds += 1;
    }
    assert!(rounds < 100, "program did not settle");
    rounds
}

#[test]
fn hello_world() {
    let mut code = main_program(vec![
        word(Opcode::ConstString, 0),
        word(Opcode::PrimCall, 0),
        word(Opcode::Return, 0),
    ]);
    code.sconsts = vec!["hi".to_string()];
    code.primitives = vec![prim("printl(s)")];

    let (mut vm, sink) = vm_with(code);
    drive(&mut vm);
    assert_eq!(sink.contents(), "hi\n");
    assert!(!vm.has_coroutines());
    assert!(!vm.is_panicking());
}

#[test]
fn arithmetic_and_typecast() {
    // string(1 + 2) ++ " " ++ string(3.5 / 2.0)
    let mut code = main_program(vec![
        word_signed(Opcode::PushInt, 1),
        word_signed(Opcode::PushInt, 2),
        word(Opcode::AddInt, 0),
        word(Opcode::PrimCall, 0),
        word(Opcode::ConstString, 0),
        word(Opcode::ConcatString, 0),
        word(Opcode::ConstFloat, 0),
        word(Opcode::ConstFloat, 1),
        word(Opcode::DivFloat, 0),
        word(Opcode::PrimCall, 1),
        word(Opcode::ConcatString, 0),
        word(Opcode::PrimCall, 2),
        word(Opcode::Return, 0),
    ]);
    code.sconsts = vec![" ".to_string()];
    code.fconsts = vec![3.5, 2.0];
    code.primitives = vec![prim("string(i):s"), prim("string(f):s"), prim("printl(s)")];

    let (mut vm, sink) = vm_with(code);
    drive(&mut vm);
    assert_eq!(sink.contents(), "3 1.75\n");
}

#[test]
fn division_by_zero_panics() {
    let code = main_program(vec![
        word_signed(Opcode::PushInt, 10),
        word_signed(Opcode::PushInt, 0),
        word(Opcode::DivInt, 0),
        word(Opcode::Return, 0),
    ]);
    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "ZeroDivisionError");
    assert!(!vm.has_coroutines());
}

#[test]
fn defer_runs_in_reverse_registration_order() {
    let mut code = main_program(vec![
        word_signed(Opcode::Defer, 3), // block at 3 prints "a"
        word_signed(Opcode::Defer, 5), // block at 6 prints "b"
        word(Opcode::Return, 0),
        word(Opcode::ConstString, 0),
        word(Opcode::PrimCall, 0),
        word(Opcode::Unwind, 0),
        word(Opcode::ConstString, 1),
        word(Opcode::PrimCall, 0),
        word(Opcode::Unwind, 0),
    ]);
    code.sconsts = vec!["a".to_string(), "b".to_string()];
    code.primitives = vec![prim("print(s)")];

    let (mut vm, sink) = vm_with(code);
    drive(&mut vm);
    assert_eq!(sink.contents(), "ba");
    assert!(!vm.is_panicking());
}

#[test]
fn try_catch_prints_the_message() {
    let mut code = main_program(vec![
        word_signed(Opcode::Try, 3), // handler is the catch at 3
        word(Opcode::ConstString, 0),
        word(Opcode::Raise, 0),
        word_signed(Opcode::Catch, 3),
        word(Opcode::PrimCall, 0),
        word_signed(Opcode::Jump, 1),
        word(Opcode::Return, 0),
    ]);
    code.sconsts = vec!["oops".to_string()];
    code.primitives = vec![prim("print(s)")];

    let (mut vm, sink) = vm_with(code);
    drive(&mut vm);
    assert_eq!(sink.contents(), "oops");
    assert!(!vm.is_panicking());
    assert!(!vm.has_coroutines());
}

#[test]
fn catch_skips_handler_on_the_normal_path() {
    let mut code = main_program(vec![
        word_signed(Opcode::Try, 2),
        word_signed(Opcode::PushInt, 7),
        word_signed(Opcode::Catch, 2),
        word_signed(Opcode::PushInt, 99), // handler body, skipped
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("x"), Ok(7));
}

#[test]
fn defer_runs_while_a_panic_unwinds_into_the_caller() {
    let mut code = main_program(vec![
        // main
        word_signed(Opcode::Try, 3),
        word(Opcode::Call, 6),
        word_signed(Opcode::Jump, 3),
        word_signed(Opcode::Catch, 2),
        word(Opcode::PrimCall, 0),
        word(Opcode::Return, 0),
        // f: defer "d", then raise "boom"
        word_signed(Opcode::Defer, 3),
        word(Opcode::ConstString, 1),
        word(Opcode::Raise, 0),
        word(Opcode::ConstString, 0),
        word(Opcode::PrimCall, 0),
        word(Opcode::Unwind, 0),
    ]);
    code.sconsts = vec!["d".to_string(), "boom".to_string()];
    code.primitives = vec![prim("print(s)")];

    let (mut vm, sink) = vm_with(code);
    drive(&mut vm);
    // The callee's defer fires before the caller's handler sees the panic.
    assert_eq!(sink.contents(), "dboom");
    assert!(!vm.is_panicking());
}

#[test]
fn kill_still_runs_defers() {
    let mut code = main_program(vec![
        word_signed(Opcode::Defer, 2),
        word(Opcode::Kill, 0),
        word(Opcode::ConstString, 0),
        word(Opcode::PrimCall, 0),
        word(Opcode::Unwind, 0),
    ]);
    code.sconsts = vec!["k".to_string()];
    code.primitives = vec![prim("print(s)")];

    let (mut vm, sink) = vm_with(code);
    drive(&mut vm);
    assert_eq!(sink.contents(), "k");
    assert!(!vm.is_panicking());
    assert!(!vm.has_coroutines());
}

#[test]
fn channel_rendezvous_sums_to_six() {
    let mut code = main_program(vec![
        // main: channel into object global 0, then both tasks
        word2(Opcode::NewChannel, Kind::Int as u8, 1),
        word(Opcode::GlobalStoreObject, 0),
        word(Opcode::Task, 5),
        word(Opcode::Task, 15),
        word(Opcode::Return, 0),
        // producer: send 1, 2, 3
        word(Opcode::GlobalLoadObject, 0),
        word_signed(Opcode::PushInt, 1),
        word(Opcode::SendInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word_signed(Opcode::PushInt, 2),
        word(Opcode::SendInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word_signed(Opcode::PushInt, 3),
        word(Opcode::SendInt, 0),
        word(Opcode::Return, 0),
        // consumer: receive three times, sum into int global 0
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0),
        word(Opcode::AddInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0),
        word(Opcode::AddInt, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        objects: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("sum", 0)];

    let (mut vm, _) = vm_with(code);
    let rounds = drive(&mut vm);
    assert_eq!(vm.get_int_variable("sum"), Ok(6));
    assert!(rounds >= 3, "capacity-1 rendezvous needs rounds, got {}", rounds);
}

#[test]
fn channel_is_fifo() {
    let mut code = main_program(vec![
        word2(Opcode::NewChannel, Kind::Int as u8, 3),
        word(Opcode::GlobalStoreObject, 0),
        word(Opcode::GlobalLoadObject, 0),
        word_signed(Opcode::PushInt, 1),
        word(Opcode::SendInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word_signed(Opcode::PushInt, 2),
        word(Opcode::SendInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word_signed(Opcode::PushInt, 3),
        word(Opcode::SendInt, 0),
        // acc = ((recv * 10) + recv) * 10 + recv
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0),
        word_signed(Opcode::PushInt, 10),
        word(Opcode::MulInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0),
        word(Opcode::AddInt, 0),
        word_signed(Opcode::PushInt, 10),
        word(Opcode::MulInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0),
        word(Opcode::AddInt, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        objects: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("acc", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("acc"), Ok(123));
}

#[test]
fn receive_on_closed_channel_panics() {
    let mut code = main_program(vec![
        word2(Opcode::NewChannel, Kind::Int as u8, 1),
        word(Opcode::GlobalStoreObject, 0),
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::PrimCall, 0), // close
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        objects: 1,
        ..GlobalCounts::default()
    };
    code.primitives = vec![prim("close(o)")];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "ChannelError");
}

#[test]
fn close_wakes_a_parked_receiver() {
    let mut code = main_program(vec![
        word2(Opcode::NewChannel, Kind::Int as u8, 1),
        word(Opcode::GlobalStoreObject, 0),
        word(Opcode::Task, 8),
        word(Opcode::Yield, 0),
        word(Opcode::Yield, 0),
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::PrimCall, 0), // close while the receiver is parked
        word(Opcode::Return, 0),
        // receiver: blocks on the empty channel
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        objects: 1,
        ..GlobalCounts::default()
    };
    code.primitives = vec![prim("close(o)")];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "ChannelError");
}

#[test]
fn select_takes_the_ready_case() {
    let mut code = main_program(vec![
        word2(Opcode::NewChannel, Kind::Int as u8, 1), // a: stays empty
        word(Opcode::GlobalStoreObject, 0),
        word2(Opcode::NewChannel, Kind::Int as u8, 1), // b: holds 5
        word(Opcode::GlobalStoreObject, 1),
        word(Opcode::GlobalLoadObject, 1),
        word_signed(Opcode::PushInt, 5),
        word(Opcode::SendInt, 0),
        word(Opcode::StartSelectChannel, 0), // 7
        word_signed(Opcode::TryChannel, 5),  // 8: miss -> 13
        word(Opcode::GlobalLoadObject, 0),
        word(Opcode::ReceiveInt, 0), // 10: empty, case missed
        word(Opcode::GlobalStoreInt, 0),
        word_signed(Opcode::Jump, 6), // 12 -> 18
        word_signed(Opcode::TryChannel, 5), // 13: miss -> 18
        word(Opcode::GlobalLoadObject, 1),
        word(Opcode::ReceiveInt, 0), // 15: ready, case taken
        word(Opcode::GlobalStoreInt, 0),
        word_signed(Opcode::Jump, 1), // 17 -> 18
        word(Opcode::CheckChannel, 0),
        word(Opcode::EndSelectChannel, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        objects: 2,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("got", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("got"), Ok(5));
    assert!(!vm.is_panicking());
}

#[test]
fn second_try_channel_raises_select_error() {
    let code = main_program(vec![
        word(Opcode::StartSelectChannel, 0),
        word_signed(Opcode::TryChannel, 2),
        word_signed(Opcode::TryChannel, 2),
        word(Opcode::Return, 0),
    ]);
    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "SelectError");
}

#[test]
fn negative_index_wraps_once() {
    let mut code = main_program(vec![
        word_signed(Opcode::PushInt, 10),
        word_signed(Opcode::PushInt, 20),
        word_signed(Opcode::PushInt, 30),
        word(Opcode::ArrayInt, 3),
        word_signed(Opcode::PushInt, -1),
        word(Opcode::Index2Int, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("x"), Ok(30));
}

#[test]
fn out_of_range_index_panics() {
    for idx in [3, -4] {
        let code = main_program(vec![
            word_signed(Opcode::PushInt, 10),
            word_signed(Opcode::PushInt, 20),
            word_signed(Opcode::PushInt, 30),
            word(Opcode::ArrayInt, 3),
            word_signed(Opcode::PushInt, idx),
            word(Opcode::Index2Int, 0),
            word(Opcode::Return, 0),
        ]);
        let (mut vm, _) = vm_with(code);
        drive(&mut vm);
        assert!(vm.is_panicking(), "index {} should panic", idx);
        assert_eq!(vm.panic_message(), "IndexError");
    }
}

#[test]
fn ref_store_writes_through_an_index_reference() {
    let mut code = main_program(vec![
        word_signed(Opcode::PushInt, 1),
        word_signed(Opcode::PushInt, 2),
        word(Opcode::ArrayInt, 2),
        word(Opcode::GlobalStoreObject, 0),
        word(Opcode::GlobalLoadObject, 0),
        word_signed(Opcode::PushInt, 0),
        word(Opcode::IndexInt, 0),
        word_signed(Opcode::PushInt, 42),
        word(Opcode::RefStoreInt, 0),
        word(Opcode::GlobalLoadObject, 0),
        word_signed(Opcode::PushInt, 0),
        word(Opcode::Index2Int, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        objects: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("x"), Ok(42));
}

#[test]
fn object_fields_roundtrip() {
    let mut code = main_program(vec![
        word(Opcode::New, 0),
        word(Opcode::CopyObject, 0),
        word_signed(Opcode::PushInt, 9),
        word(Opcode::FieldStoreInt, 1),
        word(Opcode::FieldLoadInt, 1),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.classes = vec![Class {
        name: "point".to_string(),
        fields: vec![
            Field {
                name: "x".to_string(),
                kind: Kind::Int,
            },
            Field {
                name: "y".to_string(),
                kind: Kind::Int,
            },
        ],
    }];
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("y", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("y"), Ok(9));
}

#[test]
fn field_load_on_null_panics() {
    let code = main_program(vec![
        word(Opcode::PushNull, 0),
        word(Opcode::FieldLoadInt, 0),
        word(Opcode::Return, 0),
    ]);
    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "NullError");
}

#[test]
fn root_panic_kills_the_other_coroutines_but_their_defers_run() {
    let mut code = main_program(vec![
        // main: spawn the worker, let it start, then raise unhandled
        word(Opcode::Task, 5),
        word(Opcode::Yield, 0),
        word(Opcode::Yield, 0),
        word(Opcode::ConstString, 0),
        word(Opcode::Raise, 0),
        // worker: defer "w", then yield forever
        word_signed(Opcode::Defer, 3),
        word(Opcode::Yield, 0),
        word_signed(Opcode::Jump, -1),
        word(Opcode::ConstString, 1),
        word(Opcode::PrimCall, 0),
        word(Opcode::Unwind, 0),
    ]);
    code.sconsts = vec!["boom".to_string(), "w".to_string()];
    code.primitives = vec![prim("print(s)")];

    let (mut vm, sink) = vm_with(code);
    drive(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "boom");
    assert_eq!(sink.contents(), "w");
    assert!(!vm.has_coroutines());
}

#[test]
fn spawned_task_first_runs_the_next_round() {
    let mut code = main_program(vec![
        word(Opcode::Task, 2),
        word(Opcode::Return, 0),
        word_signed(Opcode::PushInt, 1),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    vm.process();
    assert_eq!(vm.get_int_variable("x"), Ok(0));
    vm.process();
    assert_eq!(vm.get_int_variable("x"), Ok(1));
}

#[test]
fn push_context_delivers_event_arguments() {
    let mut code = Bytecode {
        opcodes: vec![
            word(Opcode::GlobalPopInt, 2),
            word(Opcode::AddInt, 0),
            word(Opcode::GlobalStoreInt, 0),
            word(Opcode::Return, 0),
        ],
        events: vec![Event {
            name: "worker".to_string(),
            pc: 0,
        }],
        ..Bytecode::default()
    };
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("sum", 0)];

    let mut vm = Vm::new();
    vm.add_library(&CORE);
    vm.load(code).expect("load");
    vm.push_context(Context {
        event: "worker".to_string(),
        args: CallValues {
            ints: vec![4, 5],
            ..CallValues::default()
        },
    })
    .expect("push_context");
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("sum"), Ok(9));
}

#[test]
fn mailbox_preserves_push_order() {
    let mut code = main_program(vec![
        word_signed(Opcode::PushInt, 7),
        word_signed(Opcode::PushInt, 8),
        word(Opcode::GlobalPushInt, 2),
        word(Opcode::Task, 5),
        word(Opcode::Return, 0),
        word(Opcode::GlobalPopInt, 2),
        word(Opcode::SubInt, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    // 7 - 8: order-sensitive
    assert_eq!(vm.get_int_variable("x"), Ok(-1));
}

#[test]
fn host_variable_access_is_type_checked() {
    let mut code = main_program(vec![word(Opcode::Return, 0)]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    vm.set_int_variable("x", 17).unwrap();
    assert_eq!(vm.get_int_variable("x"), Ok(17));
    assert_eq!(vm.get_bool_variable("x"), Ok(true));
    assert_eq!(
        vm.get_float_variable("x"),
        Err(HostError::VariableType("x".to_string()))
    );
    assert_eq!(
        vm.get_int_variable("nope"),
        Err(HostError::UnknownVariable("nope".to_string()))
    );
}

#[test]
fn clearing_is_running_halts_in_place() {
    let code = main_program(vec![
        word(Opcode::Yield, 0),
        word_signed(Opcode::Jump, -1),
    ]);
    let (mut vm, _) = vm_with(code);
    vm.process();
    assert!(vm.has_coroutines());
    vm.is_running = false;
    vm.process();
    assert!(vm.has_coroutines(), "coroutines stay in place when halted");
}

#[test]
fn load_rejects_unresolved_primitives() {
    let mut code = main_program(vec![word(Opcode::Return, 0)]);
    code.primitives = vec![prim("nope(i)")];
    let mut vm = Vm::new();
    vm.add_library(&CORE);
    assert_eq!(
        vm.load(code),
        Err(HostError::UnresolvedPrimitive {
            index: 0,
            signature: "nope(i)".to_string(),
        })
    );
}

#[test]
fn spawn_requires_a_main_event() {
    let code = Bytecode {
        opcodes: vec![word(Opcode::Return, 0)],
        ..Bytecode::default()
    };
    let mut vm = Vm::new();
    vm.load(code).expect("load");
    assert_eq!(vm.spawn(), Err(HostError::MissingMain));
}

#[test]
fn anonymous_call_pops_its_target() {
    let mut code = main_program(vec![
        word_signed(Opcode::PushInt, 4),
        word(Opcode::AnonCall, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
        word_signed(Opcode::PushInt, 11),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("x"), Ok(11));
}

#[test]
fn callee_locals_do_not_clobber_the_caller() {
    let mut code = main_program(vec![
        word(Opcode::LocalStackInt, 1),
        word_signed(Opcode::PushInt, 5),
        word(Opcode::StoreInt, 0),
        word(Opcode::Call, 7),
        word(Opcode::LoadInt, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
        // f: its own slot 0, shifted past the caller's reservation
        word(Opcode::LocalStackInt, 1),
        word_signed(Opcode::PushInt, 99),
        word(Opcode::StoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("x"), Ok(5));
}

#[test]
fn string_comparison_is_lexicographic() {
    let mut code = main_program(vec![
        word(Opcode::ConstString, 0),
        word(Opcode::ConstString, 1),
        word(Opcode::LtString, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.sconsts = vec!["ab".to_string(), "cd".to_string()];
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("lt", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("lt"), Ok(1));
}

#[test]
fn array_append_and_length() {
    let mut code = main_program(vec![
        word(Opcode::ArrayInt, 0),
        word_signed(Opcode::PushInt, 1),
        word(Opcode::AppendInt, 0),
        word_signed(Opcode::PushInt, 2),
        word(Opcode::AppendInt, 0),
        word(Opcode::LengthInt, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("len", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("len"), Ok(2));
}

#[test]
fn array_equality_is_structural() {
    let mut code = main_program(vec![
        word_signed(Opcode::PushInt, 1),
        word_signed(Opcode::PushInt, 2),
        word(Opcode::ArrayInt, 2),
        word_signed(Opcode::PushInt, 1),
        word_signed(Opcode::PushInt, 2),
        word(Opcode::ArrayInt, 2),
        word(Opcode::EqIntArray, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("eq", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("eq"), Ok(1));
}

#[test]
fn swap_shift_copy_reshape_the_stack() {
    let mut code = main_program(vec![
        word_signed(Opcode::PushInt, 1),
        word_signed(Opcode::PushInt, 2),
        word(Opcode::SwapInt, 0),
        word_signed(Opcode::ShiftInt, -1),
        word(Opcode::CopyInt, 0),
        word(Opcode::AddInt, 0),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("x"), Ok(4));
}

#[test]
fn kill_all_clears_the_spawn_queue() {
    let mut code = main_program(vec![
        word(Opcode::Task, 2),
        word(Opcode::KillAll, 0),
        word_signed(Opcode::PushInt, 1),
        word(Opcode::GlobalStoreInt, 0),
        word(Opcode::Return, 0),
    ]);
    code.globals = GlobalCounts {
        ints: 1,
        ..GlobalCounts::default()
    };
    code.variables = vec![int_var("x", 0)];

    let (mut vm, _) = vm_with(code);
    drive(&mut vm);
    assert_eq!(vm.get_int_variable("x"), Ok(0));
    assert!(!vm.has_coroutines());
}
