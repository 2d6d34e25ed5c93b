//! Terminal rendering of received events.

use chrono::DateTime;
use esmon_monitor::types::FileEvent;

/// How events are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// A timestamp header followed by the event description.
    #[default]
    Pretty,
    /// One wire record per line.
    Json,
}

/// Renders one event; the caller terminates the last line.
///
/// Pretty output ends with an empty line so consecutive events stay apart.
///
/// # Errors
///
/// Returns the serializer error in [`OutputFormat::Json`] mode.
pub fn render(event: &FileEvent, format: OutputFormat) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Pretty => Ok(format!(
            "[{}]\n{}\n",
            format_timestamp(event.timestamp()),
            event.description()
        )),
        OutputFormat::Json => {
            let wire = event.to_wire()?;
            Ok(String::from_utf8_lossy(&wire).into_owned())
        }
    }
}

/// Formats epoch milliseconds as RFC 3339 UTC, or the raw number if out of
/// range.
#[must_use]
pub fn format_timestamp(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis).map_or_else(
        || millis.to_string(),
        |time| time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
    )
}
