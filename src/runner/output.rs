use std::io::Write;
use std::sync::PoisonError;
use std::time::Duration;

use tracing::warn;

use crate::runner::env::Sink;
use crate::runner::unit::{State, Unit};

/// An indent of 4 spaces neatly aligns the dashes of a subtest's status line
/// with the status indicator of its parent.
const INDENT: &[u8] = b"    ";

/// Format `d` in the form `87.00s`.
pub fn fmt_duration(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}

/// Status line written when a test completes.
pub fn status_line(status: &str, name: &str, duration: Duration) -> String {
    format!("--- {status}: {name} ({})\n", fmt_duration(duration))
}

/// TAP result line for a reported test. Failure wins over skip.
pub fn tap_line(name: &str, failed: bool, skipped: bool) -> String {
    let name = name.replace('#', "");
    if failed {
        format!("not ok - {name}\n")
    } else if skipped {
        format!("ok - {name} # SKIP\n")
    } else {
        format!("ok - {name}\n")
    }
}

/// Append `bytes` to `out`, prefixing every line with the fixed indent.
pub(crate) fn write_indented(out: &mut Vec<u8>, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let end = bytes
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |i| i + 1);
        out.extend_from_slice(INDENT);
        out.extend_from_slice(&bytes[..end]);
        bytes = &bytes[end..];
    }
}

pub(crate) fn write_sink(sink: &Sink, bytes: &[u8]) {
    let mut w = sink.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = w.write_all(bytes).and_then(|()| w.flush()) {
        warn!(error = %e, "failed to write test output");
    }
}

impl Unit {
    /// Write into this unit's output destination: the root sink for the
    /// root, otherwise the unit's own buffer, indented. `state` is this
    /// unit's locked state.
    fn emit(&self, state: &mut State, bytes: &[u8]) {
        if self.parent.is_none() {
            write_sink(&self.sink, bytes);
        } else {
            write_indented(&mut state.output, bytes);
        }
    }

    /// Print straight to the root sink, bypassing all buffering.
    pub(crate) fn print_to_root(&self, text: &str) {
        write_sink(&self.sink, text.as_bytes());
    }

    /// Write `header` to the parent, then move this unit's buffered output
    /// under it.
    fn flush_to_parent(&self, header: &str) {
        let Some(parent) = self.parent() else {
            return;
        };
        // Always parent first, then child.
        let mut parent_state = parent.write();
        let mut state = self.write();

        parent.emit(&mut parent_state, header.as_bytes());

        if let Some(tap) = &parent.tap {
            write_sink(tap, tap_line(&self.name, state.failed, state.skipped).as_bytes());
        }

        let output = std::mem::take(&mut state.output);
        parent.emit(&mut parent_state, &output);
    }

    /// Emit this unit's status line and log to its parent, if the reporting
    /// policy calls for it. The root never reports.
    pub(crate) fn report(&self) {
        if self.parent.is_none() {
            return;
        }
        let (failed, skipped, duration) = {
            let state = self.read();
            (state.failed, state.skipped, state.duration)
        };
        let status = if failed {
            "FAIL"
        } else if !self.env.verbose() {
            return;
        } else if skipped {
            "SKIP"
        } else {
            "PASS"
        };
        self.flush_to_parent(&status_line(status, &self.name, duration));
    }
}
