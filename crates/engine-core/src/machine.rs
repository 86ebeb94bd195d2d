//! Boot state machine
//!
//! Sequences the bootstrap and user-space sessions over the application's
//! lifetime and owns everything that happens after a script dies. The host
//! calls [`Machine::tick`] once per fixed-rate tick; session teardown only
//! happens between drains, never in the middle of one.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, Table};

use perch_policy::Sandbox;
use perch_protocol::{BootStage, Event, EventValue, FaultReport, PowerAction};
use perch_script_host::{
    install_host_api, DrainOutcome, EventQueue, HandleTable, HostContext, PowerSwitch, Session,
    SessionConfig,
};
use perch_vfs::VirtualRoot;

use crate::gesture::RebootGesture;
use crate::install::install_default_files;
use crate::panic::PanicSurface;

/// Embedded recovery environment run by the bootstrap stage.
const RECOVERY_SOURCE: &str = include_str!("boot/recovery.lua");

/// Event seeding the first resume of a freshly booted stage.
const BOOT_EVENT: &str = "boot";

/// Requests from script space that only the embedding host can honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Reveal the data root in the host's file manager.
    OpenDataFolder,
}

/// Machine tuning.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// How long one coroutine resume may run before it is killed.
    pub watchdog_timeout: Duration,
    /// Instruction cadence for the watchdog hook.
    pub hook_interval: u32,
    /// Interpreter allocation cap per session.
    pub memory_limit: Option<usize>,
    /// Consecutive held ticks before the reboot gesture fires.
    pub reboot_hold_ticks: u32,
    /// Virtual path of the persisted user entry script.
    pub entry_path: String,
    /// Override for the embedded recovery script (hosts shipping their own).
    pub recovery_source: Option<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(3),
            hook_interval: 1024,
            memory_limit: Some(64 * 1024 * 1024),
            reboot_hold_ticks: 40,
            entry_path: "init.lua".into(),
            recovery_source: None,
        }
    }
}

/// Host input sampled once per tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickInput {
    /// Whether the forced-reboot key combination is currently held.
    pub reboot_combo_held: bool,
}

/// What the host should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// Keep ticking.
    Running,
    /// The panic surface is up; keep ticking and sampling the gesture.
    Panicked,
    /// The machine halted; the host application should exit.
    Shutdown,
}

/// Machine lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineState {
    Running,
    Panicked(FaultReport),
    Halted,
}

/// The simulated computer: one live interpreter session at a time, driven
/// by the host tick.
pub struct Machine {
    vfs: Arc<VirtualRoot>,
    queue: Arc<EventQueue>,
    power: Arc<PowerSwitch>,
    signals: Sender<HostSignal>,
    session: Option<Session>,
    step: u8,
    state: MachineState,
    surface: Box<dyn PanicSurface>,
    gesture: RebootGesture,
    config: MachineConfig,
}

impl Machine {
    /// Build a machine over a data root. Returns the receiver for host
    /// signals raised by the privileged bootstrap API.
    pub fn new(
        vfs: Arc<VirtualRoot>,
        config: MachineConfig,
        surface: Box<dyn PanicSurface>,
    ) -> (Self, Receiver<HostSignal>) {
        let (signals, signal_rx) = mpsc::channel();
        let gesture = RebootGesture::new(config.reboot_hold_ticks);
        let machine = Self {
            vfs,
            queue: Arc::new(EventQueue::new()),
            power: Arc::new(PowerSwitch::new()),
            signals,
            session: None,
            step: 0,
            state: MachineState::Running,
            surface,
            gesture,
            config,
        };
        (machine, signal_rx)
    }

    /// The queue host collaborators (input, timers, I/O completions) post
    /// into.
    #[must_use]
    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    /// The power switch, for host-side shutdown/reboot requests.
    #[must_use]
    pub fn power(&self) -> Arc<PowerSwitch> {
        self.power.clone()
    }

    #[must_use]
    pub fn stage(&self) -> BootStage {
        BootStage::from_step(self.step)
    }

    #[must_use]
    pub fn step(&self) -> u8 {
        self.step
    }

    #[must_use]
    pub fn state(&self) -> &MachineState {
        &self.state
    }

    #[must_use]
    pub fn fault_report(&self) -> Option<&FaultReport> {
        match &self.state {
            MachineState::Panicked(report) => Some(report),
            _ => None,
        }
    }

    /// The live session, if any (diagnostics and tests).
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// One host tick: sample the gesture, drain the queue, honor power
    /// requests. Never blocks longer than one watchdog window.
    pub fn tick(&mut self, input: TickInput) -> TickResult {
        match &self.state {
            MachineState::Halted => return TickResult::Shutdown,
            MachineState::Panicked(_) => {
                if self.gesture.sample(input.reboot_combo_held) {
                    tracing::info!("reboot gesture accepted; restarting at bootstrap");
                    self.hard_reset();
                }
                return self.result_for_state();
            }
            MachineState::Running => {}
        }

        if self.gesture.sample(input.reboot_combo_held) {
            tracing::info!("forced reboot gesture");
            self.power.request(PowerAction::Reboot);
        }

        if self.session.is_none() {
            self.boot_current_stage();
            if self.session.is_none() {
                return self.result_for_state();
            }
        }

        let outcome = match self.session.as_mut() {
            Some(session) => session.drain(&self.queue),
            None => return self.result_for_state(),
        };

        if let DrainOutcome::Faulted(err) = outcome {
            self.fault(err.to_report());
            return self.result_for_state();
        }

        // Power requests take effect between drains, never mid-drain.
        // Shutdown wins over a normal finish; a finish with no request
        // advances to the next stage.
        match self.power.take() {
            Some(PowerAction::Shutdown) => {
                tracing::info!("shutdown requested; halting");
                self.teardown_session();
                self.state = MachineState::Halted;
            }
            Some(PowerAction::Reboot) => self.advance_stage(),
            None => {
                if matches!(outcome, DrainOutcome::Finished) {
                    self.advance_stage();
                }
            }
        }

        self.result_for_state()
    }

    fn result_for_state(&self) -> TickResult {
        match self.state {
            MachineState::Running => TickResult::Running,
            MachineState::Panicked(_) => TickResult::Panicked,
            MachineState::Halted => TickResult::Shutdown,
        }
    }

    fn advance_stage(&mut self) {
        self.teardown_session();
        self.step = self.step.wrapping_add(1);
        self.boot_current_stage();
    }

    fn hard_reset(&mut self) {
        self.teardown_session();
        self.step = 0;
        self.state = MachineState::Running;
        self.gesture.reset();
        self.boot_current_stage();
    }

    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.teardown();
        }
        self.queue.clear();
    }

    fn fault(&mut self, report: FaultReport) {
        tracing::error!(stage = %self.stage(), message = %report.message, "session faulted");
        self.teardown_session();
        self.surface.render(&report);
        self.gesture.reset();
        self.state = MachineState::Panicked(report);
    }

    fn boot_current_stage(&mut self) {
        let stage = self.stage();
        self.queue.clear();
        let _ = self.power.take();

        match self.build_session(stage) {
            Ok(session) => {
                tracing::info!(stage = %stage, step = self.step, session = %session.id(), "stage booted");
                self.queue.push(Event::new(
                    BOOT_EVENT,
                    vec![EventValue::Str(stage.to_string())],
                ));
                self.session = Some(session);
            }
            Err(report) => self.fault(report),
        }
    }

    fn build_session(&self, stage: BootStage) -> Result<Session, FaultReport> {
        let mut sandbox = Sandbox::new(self.vfs.clone());
        if let Some(limit) = self.config.memory_limit {
            sandbox = sandbox.with_memory_limit(limit);
        }
        let lua = sandbox
            .open()
            .map_err(|e| FaultReport::new(format!("sandbox setup failed: {e}")))?;

        let handles = Arc::new(HandleTable::new());
        let ctx = HostContext {
            vfs: self.vfs.clone(),
            queue: self.queue.clone(),
            power: self.power.clone(),
            handles: handles.clone(),
        };
        install_host_api(&lua, &ctx)
            .map_err(|e| FaultReport::new(format!("host api setup failed: {e}")))?;

        let (chunk_name, source) = match stage {
            BootStage::Bootstrap => {
                self.install_recovery_api(&lua)
                    .map_err(|e| FaultReport::new(format!("recovery api setup failed: {e}")))?;
                let source = self
                    .config
                    .recovery_source
                    .clone()
                    .unwrap_or_else(|| RECOVERY_SOURCE.to_string());
                ("recovery.lua".to_string(), source)
            }
            BootStage::UserSpace => {
                let entry = self.config.entry_path.clone();
                let source = self.vfs.read_to_string(&entry).map_err(|e| {
                    FaultReport::new(format!("cannot start '{entry}': {e}"))
                })?;
                (entry, source)
            }
        };

        Session::spawn(
            lua,
            &chunk_name,
            &source,
            handles,
            SessionConfig {
                watchdog_timeout: self.config.watchdog_timeout,
                hook_interval: self.config.hook_interval,
            },
        )
        .map_err(|e| e.to_report())
    }

    /// Privileged primitives only the bootstrap stage gets.
    fn install_recovery_api(&self, lua: &Lua) -> mlua::Result<()> {
        let system: Table = lua.globals().get("system")?;

        let vfs = self.vfs.clone();
        system.set(
            "install",
            lua.create_function(move |_, force: Option<bool>| {
                install_default_files(&vfs, force.unwrap_or(false))
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                Ok(true)
            })?,
        )?;

        let signals = self.signals.clone();
        system.set(
            "open_data_folder",
            lua.create_function(move |_, ()| {
                let _ = signals.send(HostSignal::OpenDataFolder);
                Ok(())
            })?,
        )?;

        let power = self.power.clone();
        system.set(
            "exit",
            lua.create_function(move |_, ()| {
                power.request(PowerAction::Shutdown);
                Ok(())
            })?,
        )?;

        Ok(())
    }
}
