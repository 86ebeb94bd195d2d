//! Host API bindings for script space
//!
//! Installs the `system` and `fs` tables on a sandboxed state and converts
//! values across the native/script boundary. File paths go through the
//! virtual root jail; native objects go through the session's handle table
//! as opaque light-userdata tokens; failures follow the `nil, message`
//! convention.

use std::ffi::c_void;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

use mlua::{IntoLuaMulti, LightUserData, Lua, MultiValue, Value, Variadic};

use perch_protocol::{Event, EventValue, HandleToken, PowerAction};
use perch_vfs::VirtualRoot;

use crate::{
    EventQueue, FileMode, HandleError, HandleTable, OpenFile, PowerSwitch, Resource, ResourceKind,
};

/// Everything the script-facing API reaches back into.
#[derive(Clone)]
pub struct HostContext {
    pub vfs: Arc<VirtualRoot>,
    pub queue: Arc<EventQueue>,
    pub power: Arc<PowerSwitch>,
    pub handles: Arc<HandleTable>,
}

/// Install the `system` and `fs` tables.
pub fn install_host_api(lua: &Lua, ctx: &HostContext) -> mlua::Result<()> {
    install_system_table(lua, ctx)?;
    install_fs_table(lua, ctx)?;
    Ok(())
}

fn install_system_table(lua: &Lua, ctx: &HostContext) -> mlua::Result<()> {
    let system = lua.create_table()?;

    let queue = ctx.queue.clone();
    system.set(
        "queue_event",
        lua.create_function(move |_, (name, args): (String, Variadic<Value>)| {
            let mut payload = Vec::with_capacity(args.len());
            for value in args.iter() {
                payload.push(lua_to_event_value(value)?);
            }
            queue.push(Event::new(name, payload));
            Ok(())
        })?,
    )?;

    let power = ctx.power.clone();
    system.set(
        "reboot",
        lua.create_function(move |_, ()| {
            power.request(PowerAction::Reboot);
            Ok(())
        })?,
    )?;

    let power = ctx.power.clone();
    system.set(
        "shutdown",
        lua.create_function(move |_, ()| {
            power.request(PowerAction::Shutdown);
            Ok(())
        })?,
    )?;

    system.set(
        "log",
        lua.create_function(|_, message: String| {
            tracing::info!(target: "script", "{message}");
            Ok(())
        })?,
    )?;

    let booted = Instant::now();
    system.set(
        "uptime",
        lua.create_function(move |_, ()| Ok(booted.elapsed().as_secs_f64()))?,
    )?;

    lua.globals().set("system", system)
}

fn install_fs_table(lua: &Lua, ctx: &HostContext) -> mlua::Result<()> {
    let fs = lua.create_table()?;

    let vfs = ctx.vfs.clone();
    let handles = ctx.handles.clone();
    fs.set(
        "open",
        lua.create_function(
            move |lua, (path, mode): (String, Option<String>)| -> mlua::Result<MultiValue> {
                let mode = match mode.as_deref() {
                    None | Some("r") => FileMode::Read,
                    Some("w") => FileMode::Write,
                    Some("a") => FileMode::Append,
                    Some(other) => {
                        return (Value::Nil, format!("unsupported mode '{other}'"))
                            .into_lua_multi(lua)
                    }
                };
                let opened = match mode {
                    FileMode::Read => vfs.open_read(&path),
                    FileMode::Write => vfs.open_write(&path),
                    FileMode::Append => vfs.open_append(&path),
                };
                match opened {
                    Ok(file) => {
                        let token = handles
                            .push(Some(Resource::File(OpenFile { file, mode })))
                            .ok_or_else(|| mlua::Error::RuntimeError("handle allocation failed".into()))?;
                        token_to_value(token).into_lua_multi(lua)
                    }
                    Err(err) => (Value::Nil, err.to_string()).into_lua_multi(lua),
                }
            },
        )?,
    )?;

    let handles = ctx.handles.clone();
    fs.set(
        "read",
        lua.create_function(move |lua, handle: LightUserData| -> mlua::Result<MultiValue> {
            let token = token_from_userdata(handle);
            let read = handles.with_typed(token, ResourceKind::File, |resource| {
                let Resource::File(open) = resource else {
                    unreachable!("kind checked by the table");
                };
                if open.mode != FileMode::Read {
                    return Err("handle is not open for reading".to_string());
                }
                let mut contents = Vec::new();
                open.file
                    .read_to_end(&mut contents)
                    .map_err(|e| e.to_string())?;
                Ok(contents)
            });
            match flatten_handle_result(read) {
                Ok(contents) => Value::String(lua.create_string(&contents)?).into_lua_multi(lua),
                Err(message) => (Value::Nil, message).into_lua_multi(lua),
            }
        })?,
    )?;

    let handles = ctx.handles.clone();
    fs.set(
        "write",
        lua.create_function(
            move |lua, (handle, data): (LightUserData, mlua::String)| -> mlua::Result<MultiValue> {
                let token = token_from_userdata(handle);
                let written = handles.with_typed(token, ResourceKind::File, |resource| {
                    let Resource::File(open) = resource else {
                        unreachable!("kind checked by the table");
                    };
                    if open.mode == FileMode::Read {
                        return Err("handle is not open for writing".to_string());
                    }
                    open.file
                        .write_all(&data.as_bytes())
                        .map_err(|e| e.to_string())
                });
                match flatten_handle_result(written) {
                    Ok(()) => true.into_lua_multi(lua),
                    Err(message) => (Value::Nil, message).into_lua_multi(lua),
                }
            },
        )?,
    )?;

    let handles = ctx.handles.clone();
    fs.set(
        "close",
        lua.create_function(move |_, handle: LightUserData| {
            let token = token_from_userdata(handle);
            let resource = handles
                .take_typed(token, ResourceKind::File)
                .map_err(|err| mlua::Error::RuntimeError(err.to_string()))?;
            resource.dispose();
            Ok(true)
        })?,
    )?;

    let vfs = ctx.vfs.clone();
    fs.set(
        "exists",
        lua.create_function(move |_, path: String| Ok(vfs.exists(&path)))?,
    )?;

    let vfs = ctx.vfs.clone();
    fs.set(
        "list",
        lua.create_function(move |lua, path: String| -> mlua::Result<MultiValue> {
            match vfs.list(&path) {
                Ok(names) => lua.create_sequence_from(names)?.into_lua_multi(lua),
                Err(err) => (Value::Nil, err.to_string()).into_lua_multi(lua),
            }
        })?,
    )?;

    let vfs = ctx.vfs.clone();
    fs.set(
        "makedir",
        lua.create_function(move |lua, path: String| -> mlua::Result<MultiValue> {
            match vfs.create_dir_all(&path) {
                Ok(()) => true.into_lua_multi(lua),
                Err(err) => (Value::Nil, err.to_string()).into_lua_multi(lua),
            }
        })?,
    )?;

    let vfs = ctx.vfs.clone();
    fs.set(
        "delete",
        lua.create_function(move |lua, path: String| -> mlua::Result<MultiValue> {
            match vfs.remove(&path) {
                Ok(()) => true.into_lua_multi(lua),
                Err(err) => (Value::Nil, err.to_string()).into_lua_multi(lua),
            }
        })?,
    )?;

    lua.globals().set("fs", fs)
}

fn flatten_handle_result<T>(
    outer: Result<Result<T, String>, HandleError>,
) -> Result<T, String> {
    match outer {
        Ok(inner) => inner,
        Err(err) => Err(err.to_string()),
    }
}

/// Tokens cross into script space as pointer-sized light userdata.
#[must_use]
pub fn token_to_value(token: HandleToken) -> Value {
    Value::LightUserData(LightUserData(token.0 as *mut c_void))
}

#[must_use]
pub fn token_from_userdata(userdata: LightUserData) -> HandleToken {
    HandleToken(userdata.0 as u64)
}

/// Convert an event payload value onto the script stack.
pub fn event_value_to_lua(lua: &Lua, value: &EventValue) -> mlua::Result<Value> {
    Ok(match value {
        EventValue::Nil => Value::Nil,
        EventValue::Bool(b) => Value::Boolean(*b),
        EventValue::Int(i) => Value::Integer(*i),
        EventValue::Number(n) => Value::Number(*n),
        EventValue::Str(s) => Value::String(lua.create_string(s)?),
        EventValue::Bytes(b) => Value::String(lua.create_string(b)?),
        EventValue::Handle(token) => token_to_value(*token),
    })
}

/// Convert a script value into the closed event payload set. Tables,
/// functions, and full userdata are rejected with an argument error.
pub fn lua_to_event_value(value: &Value) -> mlua::Result<EventValue> {
    Ok(match value {
        Value::Nil => EventValue::Nil,
        Value::Boolean(b) => EventValue::Bool(*b),
        Value::Integer(i) => EventValue::Int(*i),
        Value::Number(n) => EventValue::Number(*n),
        Value::String(s) => match s.to_str() {
            Ok(text) => EventValue::Str(text.to_string()),
            Err(_) => EventValue::Bytes(s.as_bytes().to_vec()),
        },
        Value::LightUserData(userdata) => {
            EventValue::Handle(token_from_userdata(*userdata))
        }
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "cannot carry a {} in an event",
                other.type_name()
            )))
        }
    })
}

/// Build the resume arguments for an event: name first, then its payload.
pub fn event_to_args(lua: &Lua, event: &Event) -> mlua::Result<MultiValue> {
    let mut values = Vec::with_capacity(event.args.len() + 1);
    values.push(Value::String(lua.create_string(&event.name)?));
    for arg in &event.args {
        values.push(event_value_to_lua(lua, arg)?);
    }
    Ok(MultiValue::from_vec(values))
}
