//! Panic surface: the diagnostic display shown after a fatal script error
//!
//! Deliberately independent of the sandboxed interpreter; by the time it
//! renders, the session that caused the fault is already gone.

use perch_protocol::FaultReport;

/// Rendering sink for fault diagnostics. The host's display layer
/// implements this; `LogPanicSurface` is the headless default.
pub trait PanicSurface: Send {
    fn render(&mut self, report: &FaultReport);
}

/// Default surface: emits the report to the log and keeps the last one
/// around for inspection.
#[derive(Debug, Default)]
pub struct LogPanicSurface {
    last: Option<FaultReport>,
}

impl LogPanicSurface {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_report(&self) -> Option<&FaultReport> {
        self.last.as_ref()
    }
}

impl PanicSurface for LogPanicSurface {
    fn render(&mut self, report: &FaultReport) {
        tracing::error!(message = %report.message, "machine panicked");
        if let Some(trace) = &report.traceback {
            tracing::error!("{trace}");
        }
        self.last = Some(report.clone());
    }
}

/// Terminal-style text block for hosts that render the panic screen
/// themselves.
#[must_use]
pub fn format_screen(report: &FaultReport) -> String {
    let mut screen = String::new();
    screen.push_str("================ perch ================\n");
    screen.push_str("the machine hit an unrecoverable error\n\n");
    screen.push_str(&report.message);
    screen.push('\n');
    if let Some(trace) = &report.traceback {
        screen.push('\n');
        screen.push_str(trace);
        screen.push('\n');
    }
    screen.push_str("\nhold the reboot combo to restart\n");
    screen.push_str("=======================================\n");
    screen
}
