use crossterm::{
    cursor,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{Clear, ClearType},
    tty::IsTty,
    QueueableCommand,
};
use log::warn;
use std::io::{self, Stdout, Write};

// Banner framing, as wide as the original installer drew it.
const BANNER_BAR: &str = "===============================================";

/// Progress reporting surface for an installation run.
///
/// Calls are synchronous, side-effecting and always complete; reporting
/// failures are swallowed by the implementation, never surfaced to the
/// sequencer.
pub trait Reporter {
    /// Reset any console state owned by this reporter before a new run.
    fn reset(&mut self);

    /// Print a framed banner line.
    fn banner(&mut self, text: &str);

    /// Announce a step starting.
    fn report_step(&mut self, name: &str, message: &str);

    /// Report a successful detail within the current step.
    fn report_success(&mut self, message: &str);

    /// Report a failure.
    fn report_failure(&mut self, message: &str);
}

/// Console reporting over the host terminal. Owns the stdout handle, and
/// with it the cursor state, for the lifetime of one reporting session.
pub struct TerminalReporter {
    out: Stdout,
}

impl TerminalReporter {
    pub fn new() -> Self {
        TerminalReporter { out: io::stdout() }
    }

    fn try_reset(&mut self) -> crossterm::Result<()> {
        // Only clear when talking to a real terminal; piped output keeps
        // its scrollback.
        if self.out.is_tty() {
            self.out
                .queue(Clear(ClearType::All))?
                .queue(cursor::MoveTo(0, 0))?;
        }
        self.out.flush()
    }

    fn try_banner(&mut self, text: &str) -> crossterm::Result<()> {
        self.out
            .queue(Print("\n"))?
            .queue(Print(BANNER_BAR))?
            .queue(Print("\n"))?
            .queue(Print(format!("  {}\n", text)))?
            .queue(Print(BANNER_BAR))?
            .queue(Print("\n\n"))?;
        self.out.flush()
    }

    fn try_line(&mut self, color: Option<Color>, text: &str) -> crossterm::Result<()> {
        if let Some(color) = color {
            self.out.queue(SetForegroundColor(color))?;
        }
        self.out.queue(Print(text))?.queue(Print("\n"))?;
        if color.is_some() {
            self.out.queue(ResetColor)?;
        }
        self.out.flush()
    }
}

impl Default for TerminalReporter {
    fn default() -> Self {
        TerminalReporter::new()
    }
}

impl Reporter for TerminalReporter {
    fn reset(&mut self) {
        checked(self.try_reset());
    }

    fn banner(&mut self, text: &str) {
        checked(self.try_banner(text));
    }

    fn report_step(&mut self, name: &str, message: &str) {
        let line = format!("[{}] {}", name, message);
        checked(self.try_line(None, &line));
    }

    fn report_success(&mut self, message: &str) {
        let line = format!("  OK: {}", message);
        checked(self.try_line(Some(Color::Green), &line));
    }

    fn report_failure(&mut self, message: &str) {
        let line = format!("  ERROR: {}", message);
        checked(self.try_line(Some(Color::Red), &line));
    }
}

/// The reporting contract has no failure channel; log and carry on.
fn checked(result: crossterm::Result<()>) {
    if let Err(e) = result {
        warn!("Console write failed: {}.", e);
    }
}
