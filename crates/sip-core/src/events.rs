//! Switch event datagram parsing
//!
//! The telephony switch announces call lifecycle over UDP datagrams, either
//! as a JSON object or as `key=value` lines. Key names vary between switch
//! script versions, so several aliases are accepted for each field.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// A call lifecycle event from the switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    /// A new call reached the connector
    CallStart {
        /// B2B key correlating the call through the switch
        call_id: String,
        /// SDP offer carried in the event, when present
        sdp: Option<String>,
        /// Calling party, when present
        caller: Option<String>,
        /// Called party, when present
        callee: Option<String>,
    },
    /// The far end answered (informational)
    CallAnswered {
        /// B2B key of the call
        call_id: String,
    },
    /// A call ended
    CallEnd {
        /// B2B key of the call
        call_id: String,
        /// Free-form reason, when present
        reason: Option<String>,
    },
}

/// Field lookup across the alias sets the switch uses
fn field<'a>(map: &'a HashMap<String, String>, aliases: &[&str]) -> Option<&'a str> {
    for alias in aliases {
        if let Some(v) = map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(alias))
            .map(|(_, v)| v.as_str())
        {
            return Some(v);
        }
    }
    None
}

fn flatten_json(value: &Value, out: &mut HashMap<String, String>) {
    if let Value::Object(obj) = value {
        for (k, v) in obj {
            match v {
                Value::String(s) => {
                    out.insert(k.clone(), s.clone());
                }
                Value::Number(n) => {
                    out.insert(k.clone(), n.to_string());
                }
                Value::Bool(b) => {
                    out.insert(k.clone(), b.to_string());
                }
                // One level of nesting is enough for the params object the
                // switch wraps event fields in.
                Value::Object(_) => flatten_json(v, out),
                _ => {}
            }
        }
    }
}

/// Parse a datagram into key/value form (JSON object or `key=value` lines)
fn parse_fields(datagram: &str) -> Result<HashMap<String, String>> {
    let trimmed = datagram.trim();
    if trimmed.is_empty() {
        return Err(Error::UnparseableEvent("empty datagram".into()));
    }

    if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| Error::UnparseableEvent(format!("bad JSON: {e}")))?;
        let mut map = HashMap::new();
        flatten_json(&value, &mut map);
        if map.is_empty() {
            return Err(Error::UnparseableEvent("JSON object carried no fields".into()));
        }
        return Ok(map);
    }

    let mut map = HashMap::new();
    for line in trimmed.lines() {
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    if map.is_empty() {
        return Err(Error::UnparseableEvent("no key=value lines".into()));
    }
    Ok(map)
}

/// Parse one switch datagram into a [`SwitchEvent`].
///
/// Unknown event names fall back to a heuristic: if a call id is present
/// alongside a start/end keyword anywhere in the datagram, the intent is
/// honored; otherwise the datagram is rejected.
pub fn parse_event(datagram: &str) -> Result<SwitchEvent> {
    let fields = parse_fields(datagram)?;

    let event_type = field(&fields, &["event_type", "Event", "event"]).unwrap_or("");
    let call_id = field(&fields, &["call_id", "callid", "Call-ID", "key", "b2b_key"]);
    let action = field(&fields, &["action"]);
    let sdp = field(&fields, &["sdp", "SDP", "body"]).map(str::to_string);
    let reason = field(&fields, &["reason", "Reason"]).map(str::to_string);
    let caller = field(&fields, &["caller", "from", "From"]).map(str::to_string);
    let callee = field(&fields, &["callee", "to", "To"]).map(str::to_string);

    let call_id = match call_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return Err(Error::UnparseableEvent(format!(
                "event {event_type:?} carries no call id"
            )))
        }
    };

    match event_type {
        "E_CALL_SETUP" => Ok(SwitchEvent::CallStart { call_id, sdp, caller, callee }),
        "E_CALL_ANSWERED" => Ok(SwitchEvent::CallAnswered { call_id }),
        "E_CALL_TERMINATED" => Ok(SwitchEvent::CallEnd { call_id, reason }),
        "OAVC_CALL_EVENT" => match action {
            Some("start") => Ok(SwitchEvent::CallStart { call_id, sdp, caller, callee }),
            Some("end") => Ok(SwitchEvent::CallEnd { call_id, reason }),
            other => Err(Error::UnparseableEvent(format!(
                "OAVC_CALL_EVENT with unknown action {other:?}"
            ))),
        },
        other => {
            // Heuristic rescue for event names we have not seen before
            debug!(event = other, "unknown switch event, applying keyword heuristic");
            let haystack = datagram.to_ascii_lowercase();
            if haystack.contains("start") || haystack.contains("setup") || haystack.contains("invite") {
                Ok(SwitchEvent::CallStart { call_id, sdp, caller, callee })
            } else if haystack.contains("end")
                || haystack.contains("terminat")
                || haystack.contains("bye")
                || haystack.contains("hangup")
            {
                Ok(SwitchEvent::CallEnd { call_id, reason })
            } else {
                Err(Error::UnparseableEvent(format!("unhandled event {other:?}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_call_setup() {
        let event = parse_event(
            r#"{"event_type":"E_CALL_SETUP","call_id":"abc-1","sdp":"v=0","caller":"alice","callee":"bot"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            SwitchEvent::CallStart {
                call_id: "abc-1".into(),
                sdp: Some("v=0".into()),
                caller: Some("alice".into()),
                callee: Some("bot".into()),
            }
        );
    }

    #[test]
    fn key_value_terminated() {
        let event = parse_event("Event=E_CALL_TERMINATED\ncallid=xyz\nreason=BYE\n").unwrap();
        assert_eq!(event, SwitchEvent::CallEnd { call_id: "xyz".into(), reason: Some("BYE".into()) });
    }

    #[test]
    fn oavc_action_dispatch() {
        let start = parse_event(r#"{"event_type":"OAVC_CALL_EVENT","action":"start","call_id":"c1"}"#)
            .unwrap();
        assert!(matches!(start, SwitchEvent::CallStart { .. }));

        let end = parse_event(r#"{"event_type":"OAVC_CALL_EVENT","action":"end","call_id":"c1"}"#)
            .unwrap();
        assert!(matches!(end, SwitchEvent::CallEnd { .. }));
    }

    #[test]
    fn nested_params_are_flattened() {
        let event = parse_event(
            r#"{"Event":"E_CALL_ANSWERED","params":{"call_id":"deep-7"}}"#,
        )
        .unwrap();
        assert_eq!(event, SwitchEvent::CallAnswered { call_id: "deep-7".into() });
    }

    #[test]
    fn heuristic_rescues_unknown_names() {
        let event = parse_event("Event=E_UA_SESSION_START\ncall_id=h1\n").unwrap();
        assert!(matches!(event, SwitchEvent::CallStart { .. }));

        let event = parse_event("Event=E_UA_HANGUP\ncall_id=h2\n").unwrap();
        assert!(matches!(event, SwitchEvent::CallEnd { .. }));
    }

    #[test]
    fn garbage_is_rejected_not_crashed() {
        assert!(parse_event("").is_err());
        assert!(parse_event("{not json").is_err());
        assert!(parse_event("no separators here").is_err());
        // Known event without a call id is rejected
        assert!(parse_event("Event=E_CALL_SETUP\n").is_err());
        // Unknown event with id but no keyword is rejected
        assert!(parse_event("Event=E_SOMETHING\ncall_id=x\n").is_err());
    }
}
