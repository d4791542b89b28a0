//! The status-line capability injected into the runtime index, so the
//! terminal-cursor-control presentation concern stays out of the index's
//! core logic and tests can observe it instead of writing to stdout.

use std::io::Write;
use std::sync::Mutex;

/// Whether a plugin's cache path was already present (and valid) at `open`
/// time, or had to be downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenState {
    Cached,
    Downloading,
}

/// A capability for reporting the "first open of this cache path" status
/// line described in the external interfaces. Implementations decide where
/// (or whether) that line goes.
pub trait Reporter: Send + Sync {
    fn report(
        &self,
        host_tool: &str,
        kind: &str,
        name: &str,
        version: &str,
        platform: &str,
        state: OpenState,
    );
}

/// Writes one status line per unique plugin path to a locked writer, using a
/// terminal cursor-up escape to rewrite the previous (blank) line for every
/// entry after the first.
pub struct TerminalReporter<W> {
    out: Mutex<W>,
    printed_any: Mutex<bool>,
}

impl<W: Write + Send> TerminalReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            printed_any: Mutex::new(false),
        }
    }
}

impl<W: Write + Send> Reporter for TerminalReporter<W> {
    fn report(
        &self,
        host_tool: &str,
        kind: &str,
        name: &str,
        version: &str,
        platform: &str,
        state: OpenState,
    ) {
        let state_word = match state {
            OpenState::Cached => "cached",
            OpenState::Downloading => "downloading",
        };

        let mut printed_any = self.printed_any.lock().unwrap();
        let mut out = self.out.lock().unwrap();

        if *printed_any {
            // cursor up one line so the next status line overwrites the previous blank line
            let _ = write!(out, "\x1b[1A");
        }

        let _ = writeln!(
            out,
            "- Para provides 3rd-party {host_tool} {kind} plugin '{name}' version '{version}' for '{platform}' ({state_word})\n"
        );
        let _ = out.flush();

        *printed_any = true;
    }
}

/// A reporter that does nothing, used when stdout isn't a terminal or in tests.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _: &str, _: &str, _: &str, _: &str, _: &str, _: OpenState) {}
}
