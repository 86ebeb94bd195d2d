//! Perch Sandbox Policy
//!
//! Produces interpreter states that cannot escape the virtual data root or
//! invoke dangerous host operations, while keeping a usable standard-library
//! surface (base, coroutine, string, table, math, utf8, a restricted `os`,
//! a restricted module system).
//!
//! Default posture: everything not explicitly offered is absent. The native
//! library loader never exists, the two C module searchers are removed, and
//! every path a script can name is resolved through the root jail before
//! the real filesystem is touched.

use std::sync::Arc;

use mlua::{
    Function, IntoLuaMulti, Lua, LuaOptions, MultiValue, StdLib, Table, Value, Variadic,
};

use perch_vfs::VirtualRoot;

/// `os` entries removed after the standard library loads.
///
/// `exit` is stripped alongside the listed process/file primitives: a script
/// must never be able to terminate the host process.
const STRIPPED_OS_FUNCTIONS: &[&str] =
    &["execute", "tmpname", "remove", "rename", "getenv", "exit"];

/// The closed module search path, rooted at the virtual filesystem.
const MODULE_SEARCH_PATH: &str = "?.lua;?/init.lua";

/// Errors raised while building a sandboxed state.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("interpreter setup failed: {0}")]
    Setup(#[from] mlua::Error),
}

/// Sandbox configuration applied to every fresh interpreter state.
pub struct Sandbox {
    root: Arc<VirtualRoot>,
    memory_limit: Option<usize>,
}

impl Sandbox {
    pub fn new(root: Arc<VirtualRoot>) -> Self {
        Self {
            root,
            memory_limit: None,
        }
    }

    /// Cap the interpreter's allocation; exceeding it surfaces as an
    /// out-of-memory script error, never a host abort.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Create a fresh state with the safe standard libraries, strip the
    /// dangerous `os` entries, and apply the module-system patch.
    pub fn open(&self) -> Result<Lua, SandboxError> {
        let libs = StdLib::COROUTINE
            | StdLib::TABLE
            | StdLib::STRING
            | StdLib::UTF8
            | StdLib::MATH
            | StdLib::OS
            | StdLib::PACKAGE;
        let lua = Lua::new_with(libs, LuaOptions::default())?;

        if let Some(limit) = self.memory_limit {
            lua.set_memory_limit(limit)?;
        }

        let globals = lua.globals();

        let os_table: Table = globals.get("os")?;
        for name in STRIPPED_OS_FUNCTIONS {
            os_table.set(*name, Value::Nil)?;
        }

        // The real debug library is never loaded; scripts still get a table
        // so `debug.debug()` stalls nothing and `debug.traceback(msg)` keeps
        // the message-passthrough contract.
        let debug_table = lua.create_table()?;
        debug_table.set("debug", lua.create_function(|_, ()| Ok(()))?)?;
        debug_table.set(
            "traceback",
            lua.create_function(|_, args: Variadic<Value>| {
                for value in args {
                    if let Value::String(s) = value {
                        return Ok(Value::String(s));
                    }
                }
                Ok(Value::Nil)
            })?,
        )?;
        globals.set("debug", debug_table)?;

        // Script prints land in the host log, not the host terminal.
        globals.set(
            "print",
            lua.create_function(|_, args: Variadic<Value>| {
                let line = args
                    .iter()
                    .map(display_value)
                    .collect::<Vec<_>>()
                    .join("\t");
                tracing::info!(target: "script", "{line}");
                Ok(())
            })?,
        )?;

        self.patch(&lua)?;
        Ok(lua)
    }

    /// Rewrite the module system so every load goes through the root jail.
    pub fn patch(&self, lua: &Lua) -> Result<(), SandboxError> {
        let globals = lua.globals();
        let package: Table = globals.get("package")?;

        package.set("loadlib", Value::Nil)?;
        package.set("cpath", "")?;
        package.set("path", MODULE_SEARCH_PATH)?;

        // Searcher 1 (preload) stays. Searcher 2 becomes the jailed script
        // searcher. Searchers 3 and 4 (C loader, all-in-one) are removed;
        // the loader loop stops at the first nil entry.
        let searchers: Table = package.get("searchers")?;
        let root = self.root.clone();
        searchers.raw_set(
            2,
            lua.create_function(move |lua, name: String| {
                let package: Table = lua.globals().get("package")?;
                let path: String = package.get("path")?;
                match search_module(&root, &name, &path) {
                    Ok((virtual_path, source)) => {
                        let loader = lua
                            .load(source.as_str())
                            .set_name(format!("@{virtual_path}"))
                            .into_function()?;
                        (loader, virtual_path).into_lua_multi(lua)
                    }
                    Err(message) => message.into_lua_multi(lua),
                }
            })?,
        )?;
        searchers.raw_set(3, Value::Nil)?;
        searchers.raw_set(4, Value::Nil)?;

        let root = self.root.clone();
        let loadfile = lua.create_function(move |lua, path: String| {
            match load_chunk(lua, &root, &path) {
                Ok(func) => func.into_lua_multi(lua),
                Err(message) => (Value::Nil, message).into_lua_multi(lua),
            }
        })?;
        globals.set("loadfile", loadfile)?;

        let root = self.root.clone();
        let dofile = lua.create_function(move |lua, path: String| {
            let func = load_chunk(lua, &root, &path).map_err(mlua::Error::RuntimeError)?;
            func.call::<MultiValue>(())
        })?;
        globals.set("dofile", dofile)?;

        Ok(())
    }
}

/// Resolve a dotted module name against the search path, jailing every
/// candidate. Success returns the virtual path and the file contents;
/// failure returns a Lua-convention searcher message listing what was tried.
fn search_module(
    root: &VirtualRoot,
    name: &str,
    path: &str,
) -> Result<(String, String), String> {
    let slashed = name.replace('.', "/");
    let mut tried = String::new();
    for pattern in path.split(';').filter(|p| !p.is_empty()) {
        let candidate = pattern.replace('?', &slashed);
        match root.jail(&candidate) {
            Ok(_) if root.is_dir(&candidate) => {
                tried.push_str(&format!("\n\tno file '{candidate}' (is a directory)"));
            }
            Ok(_) => match root.read_to_string(&candidate) {
                Ok(source) => return Ok((candidate, source)),
                Err(err) => tried.push_str(&format!("\n\tno file '{candidate}' ({err})")),
            },
            Err(err) => tried.push_str(&format!("\n\tno file '{candidate}' ({err})")),
        }
    }
    Err(tried)
}

/// Load a single file as a chunk through the jail. Directories and
/// resolution failures come back as descriptive strings for the
/// `nil, message` convention.
fn load_chunk(lua: &Lua, root: &VirtualRoot, path: &str) -> Result<Function, String> {
    if root.is_dir(path) {
        return Err(format!("cannot load '{path}': is a directory"));
    }
    let source = root
        .read_to_string(path)
        .map_err(|err| format!("cannot load '{path}': {err}"))?;
    lua.load(source.as_str())
        .set_name(format!("@{path}"))
        .into_function()
        .map_err(|err| format!("cannot load '{path}': {err}"))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => format!("<{}>", other.type_name()),
    }
}
