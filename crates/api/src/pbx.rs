//! OnlinePBX call-center webhook events
//!
//! The PBX posts one event per call state change. Each event is mapped to a
//! [`CallUpdate`] that the calls service applies to the `calls` row.

use linedesk_shared::{workflow::normalize_phone, CallDirection, CallStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PbxEventKind {
    CallStart,
    CallAnswered,
    CallEnd,
    CallMissed,
}

impl PbxEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallStart => "call_start",
            Self::CallAnswered => "call_answered",
            Self::CallEnd => "call_end",
            Self::CallMissed => "call_missed",
        }
    }
}

/// Webhook body, accepted as JSON or form data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbxEvent {
    pub event: PbxEventKind,
    pub uuid: String,
    pub direction: CallDirection,
    pub caller: String,
    pub callee: String,
    #[serde(default)]
    pub extension: Option<String>,
    /// Unix seconds
    #[serde(default, deserialize_with = "lenient_i64")]
    pub date: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub duration: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub billsec: Option<i64>,
    #[serde(default)]
    pub record_url: Option<String>,
    #[serde(default)]
    pub hangup_cause: Option<String>,
}

/// Form bodies carry every field as a string
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(i64),
        Str(String),
    }

    Ok(match Option::<NumOrString>::deserialize(deserializer)? {
        Some(NumOrString::Num(n)) => Some(n),
        Some(NumOrString::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}

impl PbxEvent {
    pub fn occurred_at(&self) -> OffsetDateTime {
        self.date
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(OffsetDateTime::now_utc)
    }

    /// The external party's number, normalized
    pub fn client_number(&self) -> String {
        match self.direction {
            CallDirection::Inbound => normalize_phone(&self.caller),
            CallDirection::Outbound => normalize_phone(&self.callee),
        }
    }

    /// Operator extension, falling back to the internal side of the call
    pub fn operator_extension(&self) -> Option<String> {
        self.extension.clone().filter(|e| !e.is_empty()).or_else(|| {
            let internal = match self.direction {
                CallDirection::Inbound => &self.callee,
                CallDirection::Outbound => &self.caller,
            };
            // Internal extensions are short numbers
            (!internal.is_empty() && internal.len() <= 6).then(|| internal.clone())
        })
    }
}

/// Changes to apply to a call row
#[derive(Debug, Clone, PartialEq)]
pub struct CallUpdate {
    pub status: CallStatus,
    pub answered_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub duration_seconds: Option<i32>,
    pub talk_seconds: Option<i32>,
    pub record_url: Option<String>,
}

/// Compute the new call state for an event.
///
/// `current` is the stored status (`None` when the call is new) and
/// `was_answered` whether the call has been answered before. Final states
/// are never overwritten, so late or duplicated events are harmless.
pub fn apply_event(
    event: &PbxEvent,
    current: Option<CallStatus>,
    was_answered: bool,
) -> Option<CallUpdate> {
    if current.is_some_and(|s| s.is_final()) {
        return None;
    }

    let at = event.occurred_at();
    let seconds = |v: Option<i64>| v.and_then(|n| i32::try_from(n.max(0)).ok());

    let update = match event.event {
        PbxEventKind::CallStart => CallUpdate {
            status: current.unwrap_or(CallStatus::Ringing),
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
            talk_seconds: None,
            record_url: None,
        },
        PbxEventKind::CallAnswered => CallUpdate {
            status: CallStatus::Answered,
            answered_at: Some(at),
            ended_at: None,
            duration_seconds: None,
            talk_seconds: None,
            record_url: None,
        },
        PbxEventKind::CallEnd => {
            let talked = event.billsec.unwrap_or(0) > 0;
            let answered = was_answered || talked;
            let silent_inbound =
                event.direction == CallDirection::Inbound && event.billsec == Some(0);
            let status = if answered && !silent_inbound {
                CallStatus::Completed
            } else {
                CallStatus::Missed
            };

            CallUpdate {
                status,
                answered_at: None,
                ended_at: Some(at),
                duration_seconds: seconds(event.duration),
                talk_seconds: seconds(event.billsec),
                record_url: event.record_url.clone().filter(|u| !u.is_empty()),
            }
        }
        PbxEventKind::CallMissed => CallUpdate {
            status: CallStatus::Missed,
            answered_at: None,
            ended_at: Some(at),
            duration_seconds: seconds(event.duration),
            talk_seconds: Some(0),
            record_url: None,
        },
    };

    Some(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: PbxEventKind, direction: CallDirection) -> PbxEvent {
        PbxEvent {
            event: kind,
            uuid: "c-1".into(),
            direction,
            caller: "+7 (916) 123-45-67".into(),
            callee: "101".into(),
            extension: None,
            date: Some(1_717_000_000),
            duration: Some(95),
            billsec: Some(80),
            record_url: Some("https://pbx.example.com/rec/c-1.mp3".into()),
            hangup_cause: None,
        }
    }

    #[test]
    fn test_call_start_is_ringing() {
        let update = apply_event(&event(PbxEventKind::CallStart, CallDirection::Inbound), None, false)
            .unwrap();
        assert_eq!(update.status, CallStatus::Ringing);
    }

    #[test]
    fn test_call_end_after_answer_completes() {
        let update = apply_event(
            &event(PbxEventKind::CallEnd, CallDirection::Inbound),
            Some(CallStatus::Answered),
            true,
        )
        .unwrap();

        assert_eq!(update.status, CallStatus::Completed);
        assert_eq!(update.duration_seconds, Some(95));
        assert_eq!(update.talk_seconds, Some(80));
        assert!(update.record_url.is_some());
        assert_eq!(update.ended_at.map(|t| t.unix_timestamp()), Some(1_717_000_000));
    }

    #[test]
    fn test_unanswered_inbound_end_is_missed() {
        let mut e = event(PbxEventKind::CallEnd, CallDirection::Inbound);
        e.billsec = Some(0);
        let update = apply_event(&e, Some(CallStatus::Ringing), false).unwrap();
        assert_eq!(update.status, CallStatus::Missed);
    }

    #[test]
    fn test_unanswered_outbound_end_is_missed() {
        let mut e = event(PbxEventKind::CallEnd, CallDirection::Outbound);
        e.billsec = Some(0);
        let update = apply_event(&e, Some(CallStatus::Ringing), false).unwrap();
        assert_eq!(update.status, CallStatus::Missed);

        e.billsec = None;
        let update = apply_event(&e, Some(CallStatus::Ringing), false).unwrap();
        assert_eq!(update.status, CallStatus::Missed);
    }

    #[test]
    fn test_inbound_end_without_talk_time_is_missed() {
        let mut e = event(PbxEventKind::CallEnd, CallDirection::Inbound);
        e.billsec = Some(0);
        let update = apply_event(&e, Some(CallStatus::Answered), true).unwrap();
        assert_eq!(update.status, CallStatus::Missed);
    }

    #[test]
    fn test_outbound_end_after_answer_completes() {
        let mut e = event(PbxEventKind::CallEnd, CallDirection::Outbound);
        e.billsec = Some(0);
        let update = apply_event(&e, Some(CallStatus::Answered), true).unwrap();
        assert_eq!(update.status, CallStatus::Completed);
    }

    #[test]
    fn test_final_state_not_overwritten() {
        let e = event(PbxEventKind::CallAnswered, CallDirection::Inbound);
        assert!(apply_event(&e, Some(CallStatus::Completed), true).is_none());
        assert!(apply_event(&e, Some(CallStatus::Missed), false).is_none());
    }

    #[test]
    fn test_numbers_and_extension() {
        let e = event(PbxEventKind::CallStart, CallDirection::Inbound);
        assert_eq!(e.client_number(), "79161234567");
        assert_eq!(e.operator_extension().as_deref(), Some("101"));

        let mut out = event(PbxEventKind::CallStart, CallDirection::Outbound);
        out.caller = "102".into();
        out.callee = "8 916 765 43 21".into();
        assert_eq!(out.client_number(), "79167654321");
        assert_eq!(out.operator_extension().as_deref(), Some("102"));
    }

    #[test]
    fn test_deserialize_form_style_numbers() {
        let e: PbxEvent = serde_json::from_str(
            r#"{"event":"call_end","uuid":"u1","direction":"inbound","caller":"79161234567",
                "callee":"101","date":"1717000000","duration":"12","billsec":"0"}"#,
        )
        .unwrap();
        assert_eq!(e.event, PbxEventKind::CallEnd);
        assert_eq!(e.duration, Some(12));
        assert_eq!(e.billsec, Some(0));
    }
}
