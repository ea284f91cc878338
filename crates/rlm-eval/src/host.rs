//! The globals a fragment can call into.
//!
//! - `context`: the current document text
//! - `llm_query(sub_context, instruction?)`: ask the parent and block
//! - `async_llm_query(sub_context, instruction?)`: ask now, collect later
//! - `await(pending)`, `gather(p1, p2, ...)`: collect answers
//! - `FINAL(x)`, `FINAL_VAR(x)`: set the final-result sentinel
//!
//! plus `print`, `io.write`, `io.output`, `io.stdout` and `io.stderr`, which
//! write into the active capture instead of the process's own streams.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{
    AnyUserData, Function, Lua, MetaMethod, Table, UserData, UserDataMethods, Value, Variadic,
};

use crate::bridge::QueryBridge;
use crate::capture::{Stream, Streams};

/// Name of the context global.
pub const CONTEXT_GLOBAL: &str = "context";

/// Holder for the final-result sentinel.
#[derive(Debug, Default)]
pub struct FinalSlot {
    value: RefCell<Option<String>>,
}

impl FinalSlot {
    pub fn get(&self) -> Option<String> {
        self.value.borrow().clone()
    }

    pub fn set(&self, value: Option<String>) {
        *self.value.borrow_mut() = value;
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

/// A query that has been sent but whose answer has not been collected.
///
/// The bridge keeps tracking the query for as long as the handle is alive.
/// Once Lua collects an unawaited handle, nothing can wait on it any more
/// and the bridge forgets it.
pub struct PendingQuery {
    id: String,
    bridge: Rc<QueryBridge>,
}

impl Drop for PendingQuery {
    fn drop(&mut self) {
        self.bridge.forget(&self.id);
    }
}

impl UserData for PendingQuery {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("id", |_, this, ()| Ok(this.id.clone()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("pending query {}", this.id))
        });
    }
}

/// `io.stdout` / `io.stderr` stand-in that writes into the capture.
struct CaptureFile {
    stream: Stream,
    streams: Rc<Streams>,
    tostring: Function,
}

impl UserData for CaptureFile {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("write", |_, (file, args): (AnyUserData, Variadic<Value>)| {
            {
                let this = file.borrow::<CaptureFile>()?;
                let text = concat_writable(&this.tostring, args)?;
                this.streams.write(this.stream, &text);
            }
            Ok(file)
        });
        methods.add_function("flush", |_, file: AnyUserData| Ok(file));
        methods.add_method("setvbuf", |_, _, _: Variadic<Value>| Ok(true));
        methods.add_method("close", |_, _, ()| {
            Ok((Value::Nil, "cannot close standard file"))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.stream {
                Stream::Stdout => "file (captured stdout)",
                Stream::Stderr => "file (captured stderr)",
            })
        });
    }
}

/// Install the host globals into `lua`.
pub fn install(
    lua: &Lua,
    streams: Rc<Streams>,
    bridge: Rc<QueryBridge>,
    final_slot: Rc<FinalSlot>,
) -> mlua::Result<()> {
    let globals = lua.globals();
    let tostring: Function = globals.get("tostring")?;

    globals.set(CONTEXT_GLOBAL, "")?;
    install_streams(lua, &globals, &streams, &tostring)?;
    install_queries(lua, &globals, &bridge)?;
    install_final(lua, &globals, &final_slot, &tostring)?;
    Ok(())
}

fn install_streams(
    lua: &Lua,
    globals: &Table,
    streams: &Rc<Streams>,
    tostring: &Function,
) -> mlua::Result<()> {
    let stdout = lua.create_userdata(CaptureFile {
        stream: Stream::Stdout,
        streams: Rc::clone(streams),
        tostring: tostring.clone(),
    })?;
    let stderr = lua.create_userdata(CaptureFile {
        stream: Stream::Stderr,
        streams: Rc::clone(streams),
        tostring: tostring.clone(),
    })?;

    let print = {
        let streams = Rc::clone(streams);
        let tostring = tostring.clone();
        lua.create_function(move |_, args: Variadic<Value>| {
            let mut line = String::new();
            for (i, value) in args.into_iter().enumerate() {
                if i > 0 {
                    line.push('\t');
                }
                let text: String = tostring.call(value)?;
                line.push_str(&text);
            }
            line.push('\n');
            streams.write(Stream::Stdout, &line);
            Ok(())
        })?
    };
    globals.set("print", print)?;

    let write = {
        let streams = Rc::clone(streams);
        let tostring = tostring.clone();
        let stdout = stdout.clone();
        lua.create_function(move |_, args: Variadic<Value>| {
            let text = concat_writable(&tostring, args)?;
            streams.write(Stream::Stdout, &text);
            Ok(stdout.clone())
        })?
    };

    let io: Table = globals.get("io")?;

    // Only the default output is redirected. An explicit file or file name
    // still goes to the stock implementation.
    let output = {
        let stdout = stdout.clone();
        let stock: Function = io.get("output")?;
        lua.create_function(move |_, file: Value| match file {
            Value::Nil => Ok(Value::UserData(stdout.clone())),
            Value::UserData(ud) if ud.is::<CaptureFile>() => Ok(Value::UserData(ud)),
            other => stock.call(other),
        })?
    };

    io.set("write", write)?;
    io.set("output", output)?;
    io.set("stdout", stdout)?;
    io.set("stderr", stderr)?;
    Ok(())
}

fn install_queries(lua: &Lua, globals: &Table, bridge: &Rc<QueryBridge>) -> mlua::Result<()> {
    let llm_query = {
        let bridge = Rc::clone(bridge);
        lua.create_function(move |_, (sub_context, instruction): (String, Option<String>)| {
            let answer = bridge.query(&sub_context, instruction.as_deref().unwrap_or(""))?;
            Ok(answer)
        })?
    };
    globals.set("llm_query", llm_query)?;

    let async_llm_query = {
        let bridge = Rc::clone(bridge);
        lua.create_function(move |_, (sub_context, instruction): (String, Option<String>)| {
            let id = bridge.issue(&sub_context, instruction.as_deref().unwrap_or(""))?;
            Ok(PendingQuery {
                id,
                bridge: Rc::clone(&bridge),
            })
        })?
    };
    globals.set("async_llm_query", async_llm_query)?;

    // Waiting reads the inbound endpoint directly; while a fragment waits
    // there is nothing else for its scheduler to run.
    let await_fn = {
        let bridge = Rc::clone(bridge);
        lua.create_async_function(move |_, value: Value| {
            let bridge = Rc::clone(&bridge);
            async move { resolve(&bridge, value) }
        })?
    };
    globals.set("await", await_fn)?;

    let gather = {
        let bridge = Rc::clone(bridge);
        lua.create_async_function(move |lua, args: Variadic<Value>| {
            let bridge = Rc::clone(&bridge);
            async move {
                let mut answers = Vec::new();
                for value in gather_args(args)? {
                    answers.push(resolve(&bridge, value)?);
                }
                lua.create_sequence_from(answers)
            }
        })?
    };
    globals.set("gather", gather)?;
    Ok(())
}

fn install_final(
    lua: &Lua,
    globals: &Table,
    final_slot: &Rc<FinalSlot>,
    tostring: &Function,
) -> mlua::Result<()> {
    let set_final = {
        let slot = Rc::clone(final_slot);
        let tostring = tostring.clone();
        lua.create_function(move |_, value: Value| {
            let text: String = tostring.call(value)?;
            slot.set(Some(text));
            Ok(())
        })?
    };
    globals.set("FINAL", set_final)?;

    let set_final_var = {
        let slot = Rc::clone(final_slot);
        let tostring = tostring.clone();
        lua.create_function(move |_, value: Value| {
            match value {
                Value::Nil => slot.clear(),
                value => {
                    let text: String = tostring.call(value)?;
                    slot.set(Some(text));
                }
            }
            Ok(())
        })?
    };
    globals.set("FINAL_VAR", set_final_var)?;
    Ok(())
}

/// Collect the answer a value stands for.
fn resolve(bridge: &QueryBridge, value: Value) -> mlua::Result<String> {
    match value {
        Value::UserData(ud) => {
            let id = ud.borrow::<PendingQuery>()?.id.clone();
            Ok(bridge.wait(&id)?)
        }
        Value::String(s) => Ok(s.to_string_lossy().to_string()),
        other => Err(mlua::Error::RuntimeError(format!(
            "expected a pending query, got {}",
            other.type_name()
        ))),
    }
}

/// `gather(a, b)` and `gather({a, b})` both mean the same thing.
fn gather_args(args: Variadic<Value>) -> mlua::Result<Vec<Value>> {
    let mut args: Vec<Value> = args.into_iter().collect();
    if args.len() == 1 {
        if let Value::Table(table) = &args[0] {
            let items = table.sequence_values::<Value>().collect::<mlua::Result<Vec<_>>>()?;
            args = items;
        }
    }
    Ok(args)
}

/// `io.write` semantics: strings and numbers only, no separators.
fn concat_writable(tostring: &Function, args: Variadic<Value>) -> mlua::Result<String> {
    let mut text = String::new();
    for (i, value) in args.into_iter().enumerate() {
        match value {
            Value::String(s) => text.push_str(&s.to_string_lossy()),
            value @ (Value::Integer(_) | Value::Number(_)) => {
                let s: String = tostring.call(value)?;
                text.push_str(&s);
            }
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "bad argument #{} to 'write' (string expected, got {})",
                    i + 1,
                    other.type_name()
                )))
            }
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Redirect;
    use crate::channel::Channel;
    use std::io::{self, Cursor};

    fn setup(input: &str) -> (Lua, Rc<Streams>, Rc<FinalSlot>, Rc<QueryBridge>) {
        let lua = Lua::new();
        let streams = Rc::new(Streams::new());
        let final_slot = Rc::new(FinalSlot::default());
        let channel = Rc::new(Channel::new(
            Cursor::new(input.as_bytes().to_vec()),
            io::sink(),
        ));
        let mut n = 0;
        let bridge = Rc::new(QueryBridge::with_tokens(channel, move || {
            n += 1;
            format!("t{n}")
        }));
        install(
            &lua,
            Rc::clone(&streams),
            Rc::clone(&bridge),
            Rc::clone(&final_slot),
        )
        .unwrap();
        (lua, streams, final_slot, bridge)
    }

    fn captured(lua: &Lua, streams: &Rc<Streams>, code: &str) -> (String, String) {
        let guard = Redirect::begin(Rc::clone(streams), lua);
        lua.load(code).exec().unwrap();
        guard.finish()
    }

    #[test]
    fn test_print_joins_with_tabs() {
        let (lua, streams, _, _) = setup("");
        let (out, err) = captured(&lua, &streams, "print('a', 1, nil, true)");
        assert_eq!(out, "a\t1\tnil\ttrue\n");
        assert_eq!(err, "");
    }

    #[test]
    fn test_io_write_and_handles() {
        let (lua, streams, _, _) = setup("");
        let (out, err) = captured(
            &lua,
            &streams,
            "io.write('x', 2); io.stdout:write('y'):write('z'); io.stderr:write('bad\\n')",
        );
        assert_eq!(out, "x2yz");
        assert_eq!(err, "bad\n");
    }

    #[test]
    fn test_io_write_rejects_tables() {
        let (lua, _, _, _) = setup("");
        let err = lua.load("io.write({})").exec().unwrap_err();
        assert!(err.to_string().contains("string expected, got table"));
    }

    #[test]
    fn test_final_and_final_var() {
        let (lua, _, slot, _) = setup("");
        lua.load("FINAL(42)").exec().unwrap();
        assert_eq!(slot.get().as_deref(), Some("42"));

        lua.load("FINAL_VAR(nil)").exec().unwrap();
        assert_eq!(slot.get(), None);

        lua.load("answer = 'done'; FINAL_VAR(answer)").exec().unwrap();
        assert_eq!(slot.get().as_deref(), Some("done"));
    }

    #[test]
    fn test_llm_query_defaults_instruction() {
        let (lua, _, _, _) = setup("{\"type\":\"llm_result\",\"id\":\"t1\",\"result\":\"blue\"}\n");
        let answer: String = lua.load("return llm_query('sky')").eval().unwrap();
        assert_eq!(answer, "blue");
    }

    #[test]
    fn test_pending_query_handle() {
        let (lua, _, _, _) = setup("");
        let described: String = lua
            .load("local p = async_llm_query('doc', 'go'); return p:id() .. ' ' .. tostring(p)")
            .eval()
            .unwrap();
        assert_eq!(described, "t1 pending query t1");
    }

    #[test]
    fn test_context_starts_empty() {
        let (lua, _, _, _) = setup("");
        let context: String = lua.globals().get(CONTEXT_GLOBAL).unwrap();
        assert_eq!(context, "");
    }

    #[test]
    fn test_default_output_is_captured() {
        let (lua, streams, _, _) = setup("");
        let (out, _) = captured(
            &lua,
            &streams,
            "io.output():write('default '); io.output(io.stdout):write('explicit')",
        );
        assert_eq!(out, "default explicit");
    }

    #[test]
    fn test_collected_handle_is_forgotten() {
        let (lua, _, _, bridge) = setup("");
        lua.load("local p = async_llm_query('doc')").exec().unwrap();
        assert_eq!(bridge.outstanding(), 1);

        lua.gc_collect().unwrap();
        assert_eq!(bridge.outstanding(), 0);
    }

    #[test]
    fn test_live_handle_stays_outstanding() {
        let (lua, _, _, bridge) = setup("");
        lua.load("kept = async_llm_query('doc')").exec().unwrap();
        lua.gc_collect().unwrap();
        assert_eq!(bridge.outstanding(), 1);
    }
}
