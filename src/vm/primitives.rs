//! # Primitive ABI and Built-in Libraries
//!
//! Host primitives run synchronously inside the calling coroutine's step,
//! without a frame. A primitive receives one [`Call`] handle exposing:
//!
//! - `get_<kind>(param_index)` — the i-th parameter of that partition, in
//!   signature order,
//! - `set_<kind>(value)` — append a return value, pushed onto the
//!   coroutine's stacks when the primitive completes,
//! - `push_context(ctx)` — enqueue an event spawn with typed arguments,
//! - `write(text)` — the VM's output sink.
//!
//! Primitives must not block; anything long-running belongs in script code
//! around a channel.
//!
//! ## Signatures
//! A primitive is named by a mangled signature such as `printl(s)` or
//! `string(i):s` — parameter kinds between parentheses, optional return
//! kind after a colon, with the letters `i f s o`. The artifact references
//! primitives by `(library index, signature)`; `load` resolves each one
//! against the tables merged by `add_library`.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::bytecode::Kind;
use crate::error::HostError;
use crate::value::Obj;

/// A host callback. Runs to completion within one instruction step.
pub type PrimitiveFn = fn(&mut Call);

/// A named table of primitives, merged into the VM with `add_library`.
pub struct Library {
    pub name: &'static str,
    pub primitives: &'static [(&'static str, PrimitiveFn)],
}

/// A parsed primitive signature.
#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub name: String,
    pub params: Vec<Kind>,
    pub ret: Option<Kind>,
}

fn kind_of(letter: char) -> Option<Kind> {
    match letter {
        'i' => Some(Kind::Int),
        'f' => Some(Kind::Float),
        's' => Some(Kind::Str),
        'o' => Some(Kind::Obj),
        _ => None,
    }
}

/// Parse `name(params):ret`. The return kind is optional.
pub fn parse_signature(text: &str) -> Result<Signature, HostError> {
    let bad = || HostError::BadSignature(text.to_string());
    let open = text.find('(').ok_or_else(bad)?;
    let close = text.find(')').ok_or_else(bad)?;
    if close < open || text[..open].is_empty() {
        return Err(bad());
    }
    let mut params = Vec::new();
    for letter in text[open + 1..close].chars() {
        params.push(kind_of(letter).ok_or_else(bad)?);
    }
    let rest = &text[close + 1..];
    let ret = match rest.strip_prefix(':') {
        Some(r) if r.chars().count() == 1 => {
            Some(kind_of(r.chars().next().unwrap_or_default()).ok_or_else(bad)?)
        }
        None if rest.is_empty() => None,
        _ => return Err(bad()),
    };
    Ok(Signature {
        name: text[..open].to_string(),
        params,
        ret,
    })
}

/// Typed value vectors, used for primitive parameters and returns and for
/// event-spawn arguments.
#[derive(Clone, Debug, Default)]
pub struct CallValues {
    pub ints: Vec<i32>,
    pub floats: Vec<f32>,
    pub strings: Vec<String>,
    pub objects: Vec<Obj>,
}

/// An event spawn prepared by a primitive or by the host: the mangled
/// event name plus the arguments to deliver through the mailboxes.
#[derive(Clone, Debug, Default)]
pub struct Context {
    pub event: String,
    pub args: CallValues,
}

/// The single handle a primitive receives.
pub struct Call<'a> {
    args: CallValues,
    rets: CallValues,
    contexts: Vec<Context>,
    out: &'a mut dyn Write,
}

impl<'a> Call<'a> {
    pub(super) fn new(args: CallValues, out: &'a mut dyn Write) -> Call<'a> {
        Call {
            args,
            rets: CallValues::default(),
            contexts: Vec::new(),
            out,
        }
    }

    pub fn get_int(&self, index: usize) -> i32 {
        self.args.ints.get(index).copied().unwrap_or_default()
    }

    pub fn get_float(&self, index: usize) -> f32 {
        self.args.floats.get(index).copied().unwrap_or_default()
    }

    pub fn get_string(&self, index: usize) -> &str {
        self.args.strings.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn get_object(&self, index: usize) -> Obj {
        self.args.objects.get(index).cloned().unwrap_or_default()
    }

    pub fn set_int(&mut self, value: i32) {
        self.rets.ints.push(value);
    }

    pub fn set_float(&mut self, value: f32) {
        self.rets.floats.push(value);
    }

    pub fn set_string(&mut self, value: String) {
        self.rets.strings.push(value);
    }

    pub fn set_object(&mut self, value: Obj) {
        self.rets.objects.push(value);
    }

    /// Spawn an event with arguments once this primitive returns.
    pub fn push_context(&mut self, ctx: Context) {
        self.contexts.push(ctx);
    }

    /// Write to the VM's print sink.
    pub fn write(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
    }

    pub(super) fn finish(self) -> (CallValues, Vec<Context>) {
        (self.rets, self.contexts)
    }
}

//
// --- Core library -----------------------------------------------------------
//

fn prim_print(call: &mut Call) {
    let text = call.get_string(0).to_string();
    call.write(&text);
}

fn prim_printl(call: &mut Call) {
    let mut text = call.get_string(0).to_string();
    text.push('\n');
    call.write(&text);
}

fn prim_string_of_int(call: &mut Call) {
    call.set_string(call.get_int(0).to_string());
}

fn prim_string_of_float(call: &mut Call) {
    call.set_string(call.get_float(0).to_string());
}

fn prim_int_of_string(call: &mut Call) {
    let parsed = call.get_string(0).trim().parse::<i32>().unwrap_or(0);
    call.set_int(parsed);
}

fn prim_close(call: &mut Call) {
    if let Obj::Channel(ch) = call.get_object(0) {
        ch.borrow_mut().owned = false;
    }
}

/// Conversions, printing, and channel close.
pub const CORE: Library = Library {
    name: "core",
    primitives: &[
        ("print(s)", prim_print as PrimitiveFn),
        ("printl(s)", prim_printl as PrimitiveFn),
        ("string(i):s", prim_string_of_int as PrimitiveFn),
        ("string(f):s", prim_string_of_float as PrimitiveFn),
        ("int(s):i", prim_int_of_string as PrimitiveFn),
        ("close(o)", prim_close as PrimitiveFn),
    ],
};

//
// --- File library -----------------------------------------------------------
//

/// Process-local registry mapping integer descriptors to open files.
static FILE_HANDLES: Lazy<Mutex<HashMap<i32, fs::File>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Monotonic counter for new descriptors.
static NEXT_FD: AtomicI32 = AtomicI32::new(1);

/// `file_open(path, mode)` with mode `r`, `w` or `a`; returns the new
/// descriptor, or -1 when the file cannot be opened.
fn prim_file_open(call: &mut Call) {
    let path = call.get_string(0).to_string();
    let mode = call.get_string(1).to_string();
    let opened = match mode.as_str() {
        "r" => fs::File::open(&path),
        "w" => fs::File::create(&path),
        "a" => OpenOptions::new().append(true).create(true).open(&path),
        _ => {
            call.set_int(-1);
            return;
        }
    };
    match opened {
        Ok(file) => {
            let fd = NEXT_FD.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut table) = FILE_HANDLES.lock() {
                table.insert(fd, file);
            }
            call.set_int(fd);
        }
        Err(_) => call.set_int(-1),
    }
}

/// Read the remaining contents of a descriptor as UTF-8 text; unknown
/// descriptors and read failures yield the empty string.
fn prim_file_read(call: &mut Call) {
    let fd = call.get_int(0);
    let mut text = String::new();
    if let Ok(mut table) = FILE_HANDLES.lock() {
        if let Some(file) = table.get_mut(&fd) {
            let _ = file.read_to_string(&mut text);
        }
    }
    call.set_string(text);
}

fn prim_file_write(call: &mut Call) {
    let fd = call.get_int(0);
    let text = call.get_string(1).to_string();
    if let Ok(mut table) = FILE_HANDLES.lock() {
        if let Some(file) = table.get_mut(&fd) {
            let _ = file.write_all(text.as_bytes());
        }
    }
}

fn prim_file_close(call: &mut Call) {
    let fd = call.get_int(0);
    if let Ok(mut table) = FILE_HANDLES.lock() {
        table.remove(&fd);
    }
}

/// Descriptor-based text file access.
pub const FILE: Library = Library {
    name: "file",
    primitives: &[
        ("file_open(ss):i", prim_file_open as PrimitiveFn),
        ("file_read(i):s", prim_file_read as PrimitiveFn),
        ("file_write(is)", prim_file_write as PrimitiveFn),
        ("file_close(i)", prim_file_close as PrimitiveFn),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_parse() {
        let sig = parse_signature("string(i):s").unwrap();
        assert_eq!(sig.name, "string");
        assert_eq!(sig.params, vec![Kind::Int]);
        assert_eq!(sig.ret, Some(Kind::Str));

        let sig = parse_signature("printl(s)").unwrap();
        assert_eq!(sig.params, vec![Kind::Str]);
        assert_eq!(sig.ret, None);

        let sig = parse_signature("spawn_workers(iso)").unwrap();
        assert_eq!(sig.params, vec![Kind::Int, Kind::Str, Kind::Obj]);
    }

    #[test]
    fn bad_signatures_are_rejected() {
        for text in ["", "()", "noparens", "f(x)", "f(i):q", "f(i):ss"] {
            assert!(parse_signature(text).is_err(), "{}", text);
        }
    }
}
