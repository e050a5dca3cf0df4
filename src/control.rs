//! Thin control surface: commands that replace the session configuration.
//!
//! Every command maps to a configuration change followed by a full reset;
//! there is no partial reconfiguration of a running session.

/// External control commands, applied between ticks.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlCommand {
    SetHost(String),
    SetPort(u16),
    /// Select a quality variant by index into the configured list.
    SetQuality(usize),
    SetFrameRate(f64),
    Reconnect,
}

/// Parse one line of the interactive control prompt. Returns `None` for
/// blank lines and anything unrecognized.
pub fn parse_line(line: &str) -> Option<ControlCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    let arg = parts.next();

    match (verb, arg) {
        ("host", Some(h)) => Some(ControlCommand::SetHost(h.to_string())),
        ("port", Some(p)) => p.parse().ok().map(ControlCommand::SetPort),
        ("quality", Some(q)) => q.parse().ok().map(ControlCommand::SetQuality),
        ("fps", Some(f)) => f.parse().ok().map(ControlCommand::SetFrameRate),
        ("reconnect", None) => Some(ControlCommand::Reconnect),
        _ => None,
    }
}
