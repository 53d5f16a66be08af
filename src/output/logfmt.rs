//! logfmt output formatter.
//!
//! Every event becomes one `key=value` line starting with `event=<kind>`.
//! Values containing spaces, quotes or `=` are quoted.

use crate::attribute::AttributeValue;
use crate::event::Event;
use crate::output::OutputFormatter;
use std::fmt;

/// Field values of a logfmt line.
#[derive(Debug, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Int(num) => write!(f, "{num}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Text(s) if needs_quotes(s) => {
                write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
            FieldValue::Text(s) => write!(f, "{s}"),
        }
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '=' || c.is_control())
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// An ordered set of fields rendered as one logfmt line.
#[derive(Debug, Default)]
pub struct Line {
    fields: Vec<(&'static str, FieldValue)>,
}

impl Line {
    pub fn new(kind: &str) -> Self {
        let mut line = Self::default();
        line.push("event", kind);
        line
    }

    pub fn push(&mut self, key: &'static str, value: impl Into<FieldValue>) -> &mut Self {
        self.fields.push((key, value.into()));
        self
    }
}

impl fmt::Display for Line {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.fields {
            if first {
                first = false;
            } else {
                write!(fmt, " ")?;
            }
            write!(fmt, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// logfmt formatter for manager events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogfmtFormatter;

impl LogfmtFormatter {
    pub fn new() -> Self {
        Self
    }

    fn push_value(line: &mut Line, value: &AttributeValue) {
        line.push("attribute", value.attribute().to_string());
        match value {
            AttributeValue::CardData(s)
            | AttributeValue::SerialNumber(s)
            | AttributeValue::Location(s) => line.push("value", s.as_str()),
            AttributeValue::StickyConnect(b) | AttributeValue::LinkActive(b) => {
                line.push("value", *b)
            }
            AttributeValue::TerminalKind(kind) => line.push("value", kind.to_string()),
            AttributeValue::AssetNumber(n) | AttributeValue::Denomination(n) => {
                line.push("value", i64::from(*n))
            }
            AttributeValue::RfPowerLevel(level) => line.push("value", i64::from(level.value())),
        };
    }

    fn to_line(&self, event: &Event) -> Line {
        match event {
            Event::DiscoveryStateChanged { old, new } => {
                let mut line = Line::new("discovery");
                line.push("old", old.to_string()).push("new", new.to_string());
                line
            }
            Event::Connection { event, beacon } => {
                let mut line = Line::new(&event.to_string());
                line.push("device", beacon.id().to_string())
                    .push("signal", i64::from(beacon.filtered_signal))
                    .push("terminal", beacon.terminal_kind.to_string())
                    .push("sticky", beacon.wants_sticky_connection);
                if let Some(name) = &beacon.advertised_name {
                    line.push("name", name.as_str());
                }
                line
            }
            Event::SignalStrength { device, signal } => {
                let mut line = Line::new("signal");
                line.push("device", device.to_string())
                    .push("signal", i64::from(*signal));
                line
            }
            Event::Value { device, value } => {
                let mut line = Line::new("value");
                line.push("device", device.to_string());
                Self::push_value(&mut line, value);
                line
            }
            Event::WriteCompleted {
                device,
                attribute,
                error,
            } => {
                let mut line = Line::new("write");
                line.push("device", device.to_string())
                    .push("attribute", attribute.to_string());
                match error {
                    Some(e) => line.push("error", e.as_str()),
                    None => line.push("ok", true),
                };
                line
            }
            Event::ReconnectTimedOut { device } => {
                let mut line = Line::new("reconnect_timeout");
                line.push("device", device.to_string());
                line
            }
        }
    }
}

impl OutputFormatter for LogfmtFormatter {
    fn format(&self, event: &Event) -> String {
        self.to_line(event).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{Attribute, RfPowerLevel};
    use crate::beacon::{BeaconRecord, TerminalKind};
    use crate::event::{ConnectionEvent, DiscoveryState};
    use crate::test_utils::TEST_ID;
    use tokio::time::Instant;

    #[test]
    fn test_field_value_display() {
        assert_eq!(FieldValue::Int(-70).to_string(), "-70");
        assert_eq!(FieldValue::Bool(true).to_string(), "true");
        assert_eq!(FieldValue::from("KIOSK").to_string(), "KIOSK");
        assert_eq!(FieldValue::from("Bank 4").to_string(), "\"Bank 4\"");
        assert_eq!(FieldValue::from("a=\"b\"").to_string(), "\"a=\\\"b\\\"\"");
        assert_eq!(FieldValue::from("").to_string(), "\"\"");
    }

    #[test]
    fn test_discovery_line() {
        let line = LogfmtFormatter::new().format(&Event::DiscoveryStateChanged {
            old: DiscoveryState::Inactive,
            new: DiscoveryState::Scanning,
        });
        assert_eq!(line, "event=discovery old=inactive new=scanning");
    }

    #[test]
    fn test_connection_line() {
        let mut beacon = BeaconRecord::new(TEST_ID, Instant::now());
        beacon.filtered_signal = -48;
        beacon.terminal_kind = TerminalKind::Kiosk;
        beacon.advertised_name = Some("Bank 4".to_string());

        let line = LogfmtFormatter::new().format(&Event::Connection {
            event: ConnectionEvent::Connect,
            beacon,
        });
        assert_eq!(
            line,
            "event=connect device=AA:BB:CC:DD:EE:FF signal=-48 terminal=kiosk sticky=false name=\"Bank 4\""
        );
    }

    #[test]
    fn test_value_lines() {
        let formatter = LogfmtFormatter::new();
        assert_eq!(
            formatter.format(&Event::Value {
                device: TEST_ID,
                value: AttributeValue::RfPowerLevel(RfPowerLevel::try_from(2).unwrap()),
            }),
            "event=value device=AA:BB:CC:DD:EE:FF attribute=rf_power_level value=2"
        );
        assert_eq!(
            formatter.format(&Event::Value {
                device: TEST_ID,
                value: AttributeValue::Location("Floor 2".to_string()),
            }),
            "event=value device=AA:BB:CC:DD:EE:FF attribute=location value=\"Floor 2\""
        );
    }

    #[test]
    fn test_write_lines() {
        let formatter = LogfmtFormatter::new();
        assert_eq!(
            formatter.format(&Event::WriteCompleted {
                device: TEST_ID,
                attribute: Attribute::CardData,
                error: None,
            }),
            "event=write device=AA:BB:CC:DD:EE:FF attribute=card_data ok=true"
        );
        assert!(
            formatter
                .format(&Event::WriteCompleted {
                    device: TEST_ID,
                    attribute: Attribute::CardData,
                    error: Some("not permitted".to_string()),
                })
                .ends_with("error=\"not permitted\"")
        );
    }

    #[test]
    fn test_reconnect_timeout_line() {
        assert_eq!(
            LogfmtFormatter::new().format(&Event::ReconnectTimedOut { device: TEST_ID }),
            "event=reconnect_timeout device=AA:BB:CC:DD:EE:FF"
        );
    }
}
