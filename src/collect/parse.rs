//! Proxy access-log parsing.
//!
//! Lines come either prefixed with the container runtime timestamp
//! (`<RFC3339> {json}`, as returned by the pod log API with
//! `timestamps=true`) or as a bare JSON object carrying `start_time`.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::analysis::Event;

/// Result of parsing a batch of lines.
#[derive(Debug, Default)]
pub struct Parsed {
    pub events: Vec<Event>,
    /// Blank lines are not counted.
    pub skipped: usize,
}

pub fn parse_access_log(text: &str, target: &str) -> Parsed {
    let mut parsed = Parsed::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line, target) {
            Some(event) => parsed.events.push(event),
            None => parsed.skipped += 1,
        }
    }
    parsed
}

pub fn parse_line(line: &str, target: &str) -> Option<Event> {
    let (prefix_ts, json) = if line.starts_with('{') {
        (None, line)
    } else {
        let (ts, rest) = line.split_once(' ')?;
        (Some(parse_ts(ts)?), rest.trim_start())
    };
    if !json.starts_with('{') {
        return None;
    }

    let record: Value = serde_json::from_str(json).ok()?;
    let timestamp = match prefix_ts {
        Some(ts) => ts,
        None => parse_ts(record.get("start_time")?.as_str()?)?,
    };

    let source = record
        .get("client_ip")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty() && *s != "-")
        .or_else(|| record.get("downstream_remote_address").and_then(Value::as_str))
        .map(strip_port)
        .unwrap_or_default()
        .to_string();

    let id = ["request_id", "x_request_id"]
        .iter()
        .filter_map(|k| record.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty() && *s != "-")
        .map(str::to_string);

    Some(Event {
        id,
        timestamp,
        target: target.to_string(),
        source,
        latency_ms: number(record.get("duration")).unwrap_or(0.0),
        status: number(record.get("response_code")).unwrap_or(0.0) as u16,
    })
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Envoy logs numbers either as JSON numbers or as strings ("-" if unset).
fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// `10.0.0.7:53412` -> `10.0.0.7`, `[fd00::1]:80` -> `fd00::1`.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        // Bare IPv6 without brackets has several colons and no port.
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamped_line() {
        let line = r#"2025-05-01T12:00:03.250000000Z {"downstream_remote_address":"10.0.0.7:53412","response_code":503,"duration":12,"request_id":"abc"}"#;
        let e = parse_line(line, "ratings").unwrap();
        assert_eq!(e.timestamp, Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 3).unwrap() + chrono::Duration::milliseconds(250));
        assert_eq!(e.source, "10.0.0.7");
        assert_eq!(e.status, 503);
        assert_eq!(e.latency_ms, 12.0);
        assert_eq!(e.id.as_deref(), Some("abc"));
        assert_eq!(e.target, "ratings");
    }

    #[test]
    fn test_bare_json_line() {
        let line = r#"{"start_time":"2025-05-01T12:00:05Z","client_ip":"192.168.1.4","response_code":"200","duration":"7","x_request_id":"-"}"#;
        let e = parse_line(line, "ratings").unwrap();
        assert_eq!(e.source, "192.168.1.4");
        assert_eq!(e.status, 200);
        assert_eq!(e.latency_ms, 7.0);
        assert_eq!(e.id, None);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let text = "\n\
            not a log line\n\
            2025-05-01T12:00:05Z [2025-05-01] plain text access log\n\
            2025-05-01T12:00:05Z {broken json\n\
            {\"response_code\":200}\n\
            2025-05-01T12:00:06Z {\"client_ip\":\"1.2.3.4\",\"response_code\":200}\n";
        let parsed = parse_access_log(text, "ratings");
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.skipped, 4);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("10.0.0.1:80"), "10.0.0.1");
        assert_eq!(strip_port("[fd00::1]:80"), "fd00::1");
        assert_eq!(strip_port("fd00::1"), "fd00::1");
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
    }
}
