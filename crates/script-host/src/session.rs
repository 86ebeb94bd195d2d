//! Interpreter session: one state, one coroutine, one event loop

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mlua::{HookTriggers, Lua, MultiValue, Thread, ThreadStatus, Value, VmState};

use perch_protocol::{Event, FaultReport, SessionId};

use crate::bindings::event_to_args;
use crate::watchdog::{Watchdog, WATCHDOG_MESSAGE};
use crate::{EventQueue, HandleTable, ScriptError};

/// Tuning for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a single resume may run before the watchdog kills it.
    pub watchdog_timeout: Duration,
    /// Instruction cadence at which the hook samples the expiry flag.
    pub hook_interval: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(3),
            hook_interval: 1024,
        }
    }
}

/// Lifecycle of a session's coroutine.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// Compiled, never resumed.
    Created,
    /// Suspended at a yield, waiting for the next accepted event.
    Yielded,
    /// Returned normally; no more resumes are possible.
    Finished,
    /// A script error propagated out of a resume.
    Faulted(ScriptError),
}

/// Result of one queue drain.
#[derive(Debug)]
pub enum DrainOutcome {
    /// The coroutine is suspended and waiting for more events.
    Pending,
    /// The coroutine returned normally; the caller must transition the boot
    /// stage.
    Finished,
    /// A script error escaped; the caller must capture it and enter the
    /// panic path.
    Faulted(ScriptError),
}

enum Resumed {
    Yielded,
    Finished,
    Faulted(ScriptError),
}

/// One interpreter state plus its single execution coroutine.
///
/// Created fresh per boot stage and never reused; `teardown` disposes the
/// handle table before the interpreter state goes away.
pub struct Session {
    id: SessionId,
    lua: Lua,
    thread: Thread,
    handles: Arc<HandleTable>,
    watchdog: Watchdog,
    /// Event names accepted at the moment; empty means "accept any".
    filters: Vec<String>,
    state: SessionState,
    config: SessionConfig,
}

impl Session {
    /// Compile the entry chunk on a prepared (sandboxed, API-installed)
    /// state and derive the main coroutine. Compilation failures surface as
    /// `ScriptError::Syntax`.
    pub fn spawn(
        lua: Lua,
        chunk_name: &str,
        source: &str,
        handles: Arc<HandleTable>,
        config: SessionConfig,
    ) -> Result<Self, ScriptError> {
        let watchdog = Watchdog::spawn();
        let expired = watchdog.expired_flag();

        let entry = lua
            .load(source)
            .set_name(format!("@{chunk_name}"))
            .into_function()
            .map_err(ScriptError::from_lua)?;
        let thread = lua.create_thread(entry).map_err(ScriptError::from_lua)?;

        // The hook is installed on the coroutine itself: in mlua 0.10 a hook
        // set on the parent state is not inherited by threads, so it must be
        // attached to this thread to fire during its execution.
        thread.set_hook(
            HookTriggers::new().every_nth_instruction(config.hook_interval.max(1)),
            move |_lua, _debug| {
                if expired.load(Ordering::SeqCst) {
                    Err(mlua::Error::RuntimeError(WATCHDOG_MESSAGE.into()))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let id = SessionId::new();
        tracing::debug!(session = %id, chunk = chunk_name, "session spawned");

        Ok(Self {
            id,
            lua,
            thread,
            handles,
            watchdog,
            filters: Vec::new(),
            state: SessionState::Created,
            config,
        })
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The interpreter state, for privileged API installation and tests.
    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    #[must_use]
    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// The filter set established at the last yield.
    #[must_use]
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Deliver queued events to the coroutine, one resume per accepted
    /// event.
    ///
    /// At most the number of events present at entry is processed, so a
    /// script that re-posts events on every resume cannot keep one tick
    /// spinning forever. Filtered-out events are dropped, not requeued.
    pub fn drain(&mut self, queue: &EventQueue) -> DrainOutcome {
        match &self.state {
            SessionState::Finished => return DrainOutcome::Finished,
            SessionState::Faulted(err) => return DrainOutcome::Faulted(err.clone()),
            SessionState::Created | SessionState::Yielded => {}
        }

        let budget = queue.len();
        for _ in 0..budget {
            let Some(event) = queue.pop() else { break };

            if !self.accepts(&event) {
                tracing::trace!(session = %self.id, event = %event.name, "event dropped by filter");
                continue;
            }

            match self.deliver(&event) {
                Resumed::Yielded => {}
                Resumed::Finished => {
                    self.state = SessionState::Finished;
                    tracing::debug!(session = %self.id, "coroutine finished");
                    return DrainOutcome::Finished;
                }
                Resumed::Faulted(err) => {
                    tracing::warn!(session = %self.id, error = %err, "coroutine faulted");
                    self.state = SessionState::Faulted(err.clone());
                    return DrainOutcome::Faulted(err);
                }
            }
        }

        DrainOutcome::Pending
    }

    fn accepts(&self, event: &Event) -> bool {
        event.always_deliver
            || self.filters.is_empty()
            || self.filters.iter().any(|name| name == &event.name)
    }

    fn deliver(&mut self, event: &Event) -> Resumed {
        // The filter set lives only until the next delivery
        self.filters.clear();

        let args = match event_to_args(&self.lua, event) {
            Ok(args) => args,
            Err(err) => return Resumed::Faulted(ScriptError::from_lua(err)),
        };

        self.watchdog.arm(self.config.watchdog_timeout);
        let result = self.thread.resume::<MultiValue>(args);
        self.watchdog.disarm();

        match result {
            Ok(values) => match self.thread.status() {
                ThreadStatus::Resumable => {
                    self.filters = coerce_filter_names(values);
                    self.state = SessionState::Yielded;
                    Resumed::Yielded
                }
                _ => Resumed::Finished,
            },
            Err(err) => Resumed::Faulted(ScriptError::from_lua(err)),
        }
    }

    /// Dispose every native handle, then the interpreter state.
    pub fn teardown(self) {
        self.watchdog.disarm();
        self.handles.teardown();
        tracing::debug!(session = %self.id, "session torn down");
        drop(self.lua);
    }
}

/// Yielded values become the next filter set; each is coerced to a string
/// event name, values that cannot coerce are ignored. An empty yield means
/// "accept any event".
fn coerce_filter_names(values: MultiValue) -> Vec<String> {
    let mut names = Vec::new();
    for value in values {
        match value {
            Value::String(s) => names.push(s.to_string_lossy().to_string()),
            Value::Integer(i) => names.push(i.to_string()),
            Value::Number(n) => names.push(n.to_string()),
            _ => {}
        }
    }
    names
}

impl ScriptError {
    pub(crate) fn from_lua(err: mlua::Error) -> Self {
        match err {
            mlua::Error::SyntaxError { message, .. } => Self::Syntax { message },
            mlua::Error::MemoryError(message) => Self::OutOfMemory { message },
            mlua::Error::CallbackError { traceback, cause } => Self::Runtime {
                message: cause.to_string(),
                traceback: Some(traceback),
            },
            other => {
                let text = other.to_string();
                match text.split_once("\nstack traceback:") {
                    Some((message, trace)) => Self::Runtime {
                        message: message.trim_end().to_string(),
                        traceback: Some(format!("stack traceback:{trace}")),
                    },
                    None => Self::Runtime {
                        message: text,
                        traceback: None,
                    },
                }
            }
        }
    }

    /// Shape the error for the panic surface; the message is preserved
    /// verbatim.
    #[must_use]
    pub fn to_report(&self) -> FaultReport {
        match self {
            Self::Syntax { message } | Self::OutOfMemory { message } => {
                FaultReport::new(message.clone())
            }
            Self::Runtime { message, traceback } => {
                let report = FaultReport::new(message.clone());
                match traceback {
                    Some(trace) => report.with_traceback(trace.clone()),
                    None => report,
                }
            }
        }
    }

    /// Whether this is the watchdog's timeout error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Runtime { message, .. } if message.contains(WATCHDOG_MESSAGE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Table;
    use perch_protocol::EventValue;
    use std::time::Instant;

    fn session_with(source: &str, config: SessionConfig) -> Session {
        let lua = Lua::new();
        Session::spawn(
            lua,
            "test.lua",
            source,
            Arc::new(HandleTable::new()),
            config,
        )
        .unwrap()
    }

    fn session(source: &str) -> Session {
        session_with(source, SessionConfig::default())
    }

    fn recorded(session: &Session) -> Vec<String> {
        let table: Table = session.lua().globals().get("received").unwrap();
        table
            .sequence_values::<String>()
            .collect::<mlua::Result<Vec<_>>>()
            .unwrap()
    }

    const RECORDER: &str = r#"
        received = {}
        while true do
            local name = coroutine.yield()
            table.insert(received, name)
        end
    "#;

    #[test]
    fn events_arrive_in_fifo_order() {
        let mut session = session(RECORDER);
        let queue = EventQueue::new();
        queue.push(Event::new("boot", vec![]));
        queue.push(Event::new("x", vec![]));
        queue.push(Event::new("y", vec![]));
        queue.push(Event::new("z", vec![]));

        assert!(matches!(session.drain(&queue), DrainOutcome::Pending));
        assert_eq!(recorded(&session), vec!["x", "y", "z"]);
    }

    #[test]
    fn filtered_events_are_dropped_not_requeued() {
        // First resume runs the body up to the filtering yield
        let mut session = session(
            r#"
            received = {}
            local name = coroutine.yield("a", "b")
            table.insert(received, name)
            coroutine.yield()
        "#,
        );
        let queue = EventQueue::new();
        queue.push(Event::new("boot", vec![]));
        queue.push(Event::new("c", vec![]));
        queue.push(Event::new("a", vec![]));

        assert!(matches!(session.drain(&queue), DrainOutcome::Pending));
        assert_eq!(recorded(&session), vec!["a"]);
        assert!(queue.is_empty(), "dropped events must not reappear");
    }

    #[test]
    fn unfiltered_events_bypass_the_filter_set() {
        let mut session = session(
            r#"
            received = {}
            while true do
                local name = coroutine.yield("never_matches")
                table.insert(received, name)
            end
        "#,
        );
        let queue = EventQueue::new();
        queue.push(Event::new("boot", vec![]));
        queue.push(Event::new("ignored", vec![]));
        queue.push(Event::interrupt());

        assert!(matches!(session.drain(&queue), DrainOutcome::Pending));
        assert_eq!(recorded(&session), vec!["interrupt"]);
    }

    #[test]
    fn empty_yield_accepts_everything_again() {
        let mut session = session(
            r#"
            received = {}
            coroutine.yield("only_this")
            while true do
                local name = coroutine.yield()
                table.insert(received, name)
            end
        "#,
        );
        let queue = EventQueue::new();
        queue.push(Event::new("boot", vec![]));
        queue.push(Event::new("only_this", vec![]));
        queue.push(Event::new("anything", vec![]));
        assert!(matches!(session.drain(&queue), DrainOutcome::Pending));
        assert_eq!(recorded(&session), vec!["anything"]);
    }

    #[test]
    fn event_arguments_reach_the_coroutine() {
        let mut session = session(
            r#"
            received = {}
            local name, key, down = coroutine.yield()
            table.insert(received, string.format("%s:%d:%s", name, key, tostring(down)))
            coroutine.yield()
        "#,
        );
        let queue = EventQueue::new();
        queue.push(Event::new("boot", vec![]));
        queue.push(Event::new(
            "key",
            vec![EventValue::Int(32), EventValue::Bool(true)],
        ));
        assert!(matches!(session.drain(&queue), DrainOutcome::Pending));
        assert_eq!(recorded(&session), vec!["key:32:true"]);
    }

    #[test]
    fn normal_return_finishes_the_session() {
        let mut session = session("return 0");
        let queue = EventQueue::new();
        queue.push(Event::new("boot", vec![]));
        assert!(matches!(session.drain(&queue), DrainOutcome::Finished));
        // Subsequent drains short-circuit
        queue.push(Event::new("late", vec![]));
        assert!(matches!(session.drain(&queue), DrainOutcome::Finished));
        assert!(matches!(session.state(), SessionState::Finished));
    }

    #[test]
    fn script_errors_fault_with_message_preserved() {
        let mut session = session(r#"error("kernel oops")"#);
        let queue = EventQueue::new();
        queue.push(Event::new("boot", vec![]));
        let DrainOutcome::Faulted(err) = session.drain(&queue) else {
            panic!("expected a fault");
        };
        let report = err.to_report();
        assert!(report.message.contains("kernel oops"), "{}", report.message);
    }

    #[test]
    fn syntax_errors_are_their_own_kind() {
        let lua = Lua::new();
        let result = Session::spawn(
            lua,
            "broken.lua",
            "this is not lua(",
            Arc::new(HandleTable::new()),
            SessionConfig::default(),
        );
        assert!(matches!(result, Err(ScriptError::Syntax { .. })));
    }

    #[test]
    fn watchdog_kills_non_yielding_scripts() {
        let mut session = session_with(
            "while true do end",
            SessionConfig {
                watchdog_timeout: Duration::from_millis(100),
                hook_interval: 256,
            },
        );
        let queue = EventQueue::new();
        queue.push(Event::new("boot", vec![]));

        let started = Instant::now();
        let DrainOutcome::Faulted(err) = session.drain(&queue) else {
            panic!("expected a watchdog fault");
        };
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "tick loop blocked too long"
        );
    }

    #[test]
    fn drain_budget_is_snapshot_at_entry() {
        let queue = Arc::new(EventQueue::new());
        let lua = Lua::new();
        // The script re-posts two events on every resume
        let queue_for_script = queue.clone();
        lua.globals()
            .set(
                "repost",
                lua.create_function(move |_, ()| {
                    queue_for_script.push(Event::new("echo", vec![]));
                    queue_for_script.push(Event::new("echo", vec![]));
                    Ok(())
                })
                .unwrap(),
            )
            .unwrap();
        let mut session = Session::spawn(
            lua,
            "reposter.lua",
            r#"
            while true do
                repost()
                coroutine.yield()
            end
        "#,
            Arc::new(HandleTable::new()),
            SessionConfig::default(),
        )
        .unwrap();

        queue.push(Event::new("boot", vec![]));
        assert!(matches!(session.drain(&queue), DrainOutcome::Pending));
        // One event processed, two self-posted remain for the next tick
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn teardown_empties_the_handle_table() {
        let handles = Arc::new(HandleTable::new());
        let token = handles
            .push(Some(crate::Resource::Buffer(vec![1, 2, 3])))
            .unwrap();
        let session = Session::spawn(
            Lua::new(),
            "idle.lua",
            "coroutine.yield()",
            handles.clone(),
            SessionConfig::default(),
        )
        .unwrap();

        session.teardown();
        assert!(handles.take(token).is_none());
        assert!(handles.is_empty());
    }
}
