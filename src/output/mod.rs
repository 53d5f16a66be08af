//! Output formatters for manager events.
//!
//! The CLI prints one line per [`Event`]. Formatters are kept behind a trait
//! so the binary and the benchmarks share the same rendering.

pub mod logfmt;

use crate::event::Event;

/// Trait for formatting events into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format an event.
    ///
    /// # Arguments
    /// * `event` - The event to render
    ///
    /// # Returns
    /// A single line without the trailing newline
    fn format(&self, event: &Event) -> String;
}
