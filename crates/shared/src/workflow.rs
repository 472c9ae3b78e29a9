//! Business rules for tickets, lines, funnels, templates and reports
//!
//! Everything here is pure and independent of the database so the rules can be
//! tested directly. Handlers load rows, call these functions, and persist the
//! outcome.

use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::LineDeskError;
use crate::types::{ReportFrequency, TicketStatus, UserStatus};

// =============================================================================
// Ticket status transitions
// =============================================================================

impl TicketStatus {
    /// Check whether a ticket may move from `self` to `next`.
    ///
    /// Setting the current status again is always allowed and is a no-op.
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;

        if *self == next {
            return true;
        }

        match self {
            New => matches!(next, Open | Pending | Resolved | Closed),
            Open => matches!(next, Pending | Resolved | Closed),
            Pending => matches!(next, Open | Resolved | Closed),
            Resolved => matches!(next, Open | Closed),
            Closed => matches!(next, Open),
        }
    }
}

/// Validate a transition, producing an error that names both states
pub fn check_transition(from: TicketStatus, to: TicketStatus) -> Result<(), LineDeskError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LineDeskError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Timestamp changes implied by a status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampChange {
    Keep,
    Set,
    Clear,
}

/// Effect of a status transition on `resolved_at` / `closed_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEffect {
    pub resolved_at: TimestampChange,
    pub closed_at: TimestampChange,
}

/// Compute how the lifecycle timestamps change for `from -> to`
pub fn transition_effect(from: TicketStatus, to: TicketStatus) -> TransitionEffect {
    use TimestampChange::*;

    if from == to {
        return TransitionEffect {
            resolved_at: Keep,
            closed_at: Keep,
        };
    }

    match to {
        TicketStatus::Resolved => TransitionEffect {
            resolved_at: Set,
            closed_at: Clear,
        },
        TicketStatus::Closed => TransitionEffect {
            resolved_at: Keep,
            closed_at: Set,
        },
        // Reopening or moving between working states
        _ => TransitionEffect {
            resolved_at: Clear,
            closed_at: Clear,
        },
    }
}

// =============================================================================
// Line assignment
// =============================================================================

/// An operator that belongs to a line
#[derive(Debug, Clone)]
pub struct OperatorCandidate {
    pub user_id: Uuid,
    pub line_position: i32,
    pub created_at: OffsetDateTime,
    pub is_active: bool,
    pub status: UserStatus,
}

impl OperatorCandidate {
    pub fn is_available(&self) -> bool {
        self.is_active && self.status == UserStatus::Online
    }
}

/// Pick the first available operator of a line.
///
/// Candidates are ordered by `line_position`, then by `created_at`, regardless
/// of the order they are passed in. Busy, offline and deactivated operators
/// are skipped.
pub fn pick_line_operator(candidates: &[OperatorCandidate]) -> Option<Uuid> {
    let mut ordered: Vec<&OperatorCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        a.line_position
            .cmp(&b.line_position)
            .then(a.created_at.cmp(&b.created_at))
    });

    ordered
        .into_iter()
        .find(|c| c.is_available())
        .map(|c| c.user_id)
}

// =============================================================================
// Funnels
// =============================================================================

/// A funnel stage as seen by the auto-transition rule
#[derive(Debug, Clone)]
pub struct StageRule {
    pub stage_id: Uuid,
    pub position: i32,
    pub trigger_status: Option<TicketStatus>,
}

/// Find the stage a ticket should advance to after its status changed.
///
/// Only stages whose trigger matches `new_status` are considered, and only
/// those strictly after the current position. Returns `None` when the ticket
/// should stay where it is.
pub fn next_funnel_stage(
    stages: &[StageRule],
    current_position: Option<i32>,
    new_status: TicketStatus,
) -> Option<Uuid> {
    stages
        .iter()
        .filter(|s| s.trigger_status == Some(new_status))
        .filter(|s| match current_position {
            Some(pos) => s.position > pos,
            None => true,
        })
        .min_by_key(|s| s.position)
        .map(|s| s.stage_id)
}

// =============================================================================
// AI settings
// =============================================================================

/// Result of applying a desired AI flag to the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AiToggle {
    pub is_enabled: bool,
    pub changed: bool,
}

/// Apply a desired `is_enabled` value. `stored` is `None` when no setting row
/// exists yet, which is equivalent to a disabled setting.
pub fn apply_ai_toggle(stored: Option<bool>, desired: bool) -> AiToggle {
    let current = stored.unwrap_or(false);
    AiToggle {
        is_enabled: desired,
        changed: current != desired,
    }
}

// =============================================================================
// Phones
// =============================================================================

/// Normalize a phone number for matching.
///
/// Keeps digits only. Eleven-digit numbers with the domestic `8` trunk prefix
/// are rewritten to the `7` country code.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == 11 && digits.starts_with('8') {
        return format!("7{}", &digits[1..]);
    }

    digits
}

// =============================================================================
// Templates
// =============================================================================

/// Highest `{{n}}` placeholder index in a template body
pub fn count_template_variables(body: &str) -> usize {
    let mut max = 0;
    let mut rest = body;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                if let Ok(n) = after[..end].trim().parse::<usize>() {
                    max = max.max(n);
                }
                rest = &after[end + 2..];
            }
            None => break,
        }
    }

    max
}

/// Ensure a campaign supplies exactly the variables its template expects
pub fn check_template_variables(body: &str, vars: &[String]) -> Result<(), LineDeskError> {
    let expected = count_template_variables(body);
    if vars.len() != expected {
        return Err(LineDeskError::Validation(format!(
            "Template expects {} variables, got {}",
            expected,
            vars.len()
        )));
    }
    if vars.iter().any(|v| v.trim().is_empty()) {
        return Err(LineDeskError::Validation(
            "Template variables cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Substitute `{{1}}..{{n}}` with the given values. Placeholders without a
/// value are left as-is.
pub fn render_template(body: &str, vars: &[String]) -> String {
    let mut out = body.to_string();
    // Replace from the highest index so {{1}} never clobbers {{10}}
    for (idx, value) in vars.iter().enumerate().rev() {
        let placeholder = format!("{{{{{}}}}}", idx + 1);
        out = out.replace(&placeholder, value);
    }
    out
}

// =============================================================================
// Report scheduling
// =============================================================================

fn shift_month(t: OffsetDateTime, forward: bool) -> OffsetDateTime {
    let (year, month) = match (forward, t.month()) {
        (true, Month::December) => (t.year() + 1, Month::January),
        (true, m) => (t.year(), m.next()),
        (false, Month::January) => (t.year() - 1, Month::December),
        (false, m) => (t.year(), m.previous()),
    };
    let day = t.day().min(time::util::days_in_year_month(year, month));

    match Date::from_calendar_date(year, month, day) {
        Ok(date) => t.replace_date(date),
        Err(_) if forward => t + Duration::days(30),
        Err(_) => t - Duration::days(30),
    }
}

impl ReportFrequency {
    /// When the report is due next after a run at `t`
    pub fn next_run_after(&self, t: OffsetDateTime) -> OffsetDateTime {
        match self {
            Self::Daily => t + Duration::days(1),
            Self::Weekly => t + Duration::weeks(1),
            Self::Monthly => shift_month(t, true),
        }
    }

    /// The reporting period that ends at `t`
    pub fn period_ending(&self, t: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        let start = match self {
            Self::Daily => t - Duration::days(1),
            Self::Weekly => t - Duration::weeks(1),
            Self::Monthly => shift_month(t, false),
        };
        (start, t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const ALL: [TicketStatus; 5] = [
        TicketStatus::New,
        TicketStatus::Open,
        TicketStatus::Pending,
        TicketStatus::Resolved,
        TicketStatus::Closed,
    ];

    // =========================================================================
    // Status transitions
    // =========================================================================

    #[test]
    fn test_same_status_is_noop() {
        for status in ALL {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn test_new_ticket_can_go_anywhere() {
        for next in ALL {
            assert!(TicketStatus::New.can_transition_to(next));
        }
    }

    #[test]
    fn test_nothing_returns_to_new() {
        for from in ALL.iter().filter(|s| **s != TicketStatus::New) {
            assert!(!from.can_transition_to(TicketStatus::New), "{:?} -> new", from);
        }
    }

    #[test]
    fn test_closed_only_reopens() {
        assert!(TicketStatus::Closed.can_transition_to(TicketStatus::Open));
        assert!(!TicketStatus::Closed.can_transition_to(TicketStatus::Pending));
        assert!(!TicketStatus::Closed.can_transition_to(TicketStatus::Resolved));
    }

    #[test]
    fn test_resolved_transitions() {
        assert!(TicketStatus::Resolved.can_transition_to(TicketStatus::Open));
        assert!(TicketStatus::Resolved.can_transition_to(TicketStatus::Closed));
        assert!(!TicketStatus::Resolved.can_transition_to(TicketStatus::Pending));
    }

    #[test]
    fn test_check_transition_error_names_states() {
        assert!(check_transition(TicketStatus::Open, TicketStatus::Resolved).is_ok());
        let err = check_transition(TicketStatus::Closed, TicketStatus::Pending).unwrap_err();
        assert_eq!(err.to_string(), "Invalid status transition: closed -> pending");
    }

    #[test]
    fn test_transition_effects() {
        let e = transition_effect(TicketStatus::Open, TicketStatus::Resolved);
        assert_eq!(e.resolved_at, TimestampChange::Set);
        assert_eq!(e.closed_at, TimestampChange::Clear);

        let e = transition_effect(TicketStatus::Resolved, TicketStatus::Closed);
        assert_eq!(e.resolved_at, TimestampChange::Keep);
        assert_eq!(e.closed_at, TimestampChange::Set);

        let e = transition_effect(TicketStatus::Closed, TicketStatus::Open);
        assert_eq!(e.resolved_at, TimestampChange::Clear);
        assert_eq!(e.closed_at, TimestampChange::Clear);

        let e = transition_effect(TicketStatus::Closed, TicketStatus::Closed);
        assert_eq!(e.resolved_at, TimestampChange::Keep);
        assert_eq!(e.closed_at, TimestampChange::Keep);
    }

    // =========================================================================
    // Line assignment
    // =========================================================================

    fn candidate(position: i32, minutes: i64, status: UserStatus, active: bool) -> OperatorCandidate {
        OperatorCandidate {
            user_id: Uuid::new_v4(),
            line_position: position,
            created_at: datetime!(2024-01-01 09:00 UTC) + Duration::minutes(minutes),
            is_active: active,
            status,
        }
    }

    #[test]
    fn test_pick_first_available_operator() {
        let busy = candidate(0, 0, UserStatus::Busy, true);
        let online = candidate(1, 0, UserStatus::Online, true);
        let later = candidate(2, 0, UserStatus::Online, true);

        let picked = pick_line_operator(&[later.clone(), busy, online.clone()]);
        assert_eq!(picked, Some(online.user_id));
    }

    #[test]
    fn test_pick_breaks_position_ties_by_age() {
        let newer = candidate(0, 30, UserStatus::Online, true);
        let older = candidate(0, 5, UserStatus::Online, true);

        assert_eq!(pick_line_operator(&[newer, older.clone()]), Some(older.user_id));
    }

    #[test]
    fn test_pick_skips_deactivated_operator() {
        let inactive = candidate(0, 0, UserStatus::Online, false);
        let active = candidate(1, 0, UserStatus::Online, true);

        assert_eq!(pick_line_operator(&[inactive, active.clone()]), Some(active.user_id));
    }

    #[test]
    fn test_pick_none_when_line_unavailable() {
        let a = candidate(0, 0, UserStatus::Offline, true);
        let b = candidate(1, 0, UserStatus::Busy, true);
        assert_eq!(pick_line_operator(&[a, b]), None);
        assert_eq!(pick_line_operator(&[]), None);
    }

    // =========================================================================
    // Funnels
    // =========================================================================

    fn stages() -> (Vec<StageRule>, [Uuid; 4]) {
        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let rules = vec![
            StageRule {
                stage_id: ids[0],
                position: 0,
                trigger_status: Some(TicketStatus::New),
            },
            StageRule {
                stage_id: ids[1],
                position: 1,
                trigger_status: Some(TicketStatus::Open),
            },
            StageRule {
                stage_id: ids[2],
                position: 2,
                trigger_status: None,
            },
            StageRule {
                stage_id: ids[3],
                position: 3,
                trigger_status: Some(TicketStatus::Resolved),
            },
        ];
        (rules, ids)
    }

    #[test]
    fn test_funnel_advances_to_matching_stage() {
        let (rules, ids) = stages();
        assert_eq!(
            next_funnel_stage(&rules, Some(0), TicketStatus::Open),
            Some(ids[1])
        );
        assert_eq!(
            next_funnel_stage(&rules, Some(1), TicketStatus::Resolved),
            Some(ids[3])
        );
    }

    #[test]
    fn test_funnel_never_moves_backwards() {
        let (rules, _) = stages();
        assert_eq!(next_funnel_stage(&rules, Some(3), TicketStatus::Open), None);
        assert_eq!(next_funnel_stage(&rules, Some(1), TicketStatus::Open), None);
    }

    #[test]
    fn test_funnel_without_current_stage_takes_first_match() {
        let (rules, ids) = stages();
        assert_eq!(next_funnel_stage(&rules, None, TicketStatus::Open), Some(ids[1]));
    }

    #[test]
    fn test_funnel_ignores_unmatched_status() {
        let (rules, _) = stages();
        assert_eq!(next_funnel_stage(&rules, Some(0), TicketStatus::Pending), None);
    }

    // =========================================================================
    // AI toggle
    // =========================================================================

    #[test]
    fn test_ai_toggle_flips_and_is_idempotent() {
        let first = apply_ai_toggle(Some(false), true);
        assert!(first.is_enabled);
        assert!(first.changed);

        let again = apply_ai_toggle(Some(first.is_enabled), true);
        assert!(again.is_enabled);
        assert!(!again.changed);

        let off = apply_ai_toggle(Some(true), false);
        assert!(!off.is_enabled);
        assert!(off.changed);
    }

    #[test]
    fn test_ai_toggle_missing_setting_counts_as_disabled() {
        assert!(!apply_ai_toggle(None, false).changed);
        assert!(apply_ai_toggle(None, true).changed);
    }

    // =========================================================================
    // Phones and templates
    // =========================================================================

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+7 (999) 123-45-67"), "79991234567");
        assert_eq!(normalize_phone("8 999 123 45 67"), "79991234567");
        assert_eq!(normalize_phone("+1 415 555 0100"), "14155550100");
        assert_eq!(normalize_phone("101"), "101");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn test_count_template_variables() {
        assert_eq!(count_template_variables("Hello"), 0);
        assert_eq!(count_template_variables("Hi {{1}}, order {{2}} ships {{2}}"), 2);
        assert_eq!(count_template_variables("{{ 3 }} only"), 3);
        assert_eq!(count_template_variables("broken {{1"), 0);
        assert_eq!(count_template_variables("{{name}} is not numbered"), 0);
    }

    #[test]
    fn test_render_template() {
        let vars = vec!["Anna".to_string(), "A-42".to_string()];
        assert_eq!(
            render_template("Hi {{1}}, order {{2}} is ready", &vars),
            "Hi Anna, order A-42 is ready"
        );
        assert_eq!(render_template("Hi {{1}} {{3}}", &vars), "Hi Anna {{3}}");
    }

    #[test]
    fn test_check_template_variables() {
        let body = "Hi {{1}}, your code is {{2}}";
        assert!(check_template_variables(body, &["a".into(), "b".into()]).is_ok());
        assert!(check_template_variables(body, &["a".into()]).is_err());
        assert!(check_template_variables(body, &["a".into(), " ".into()]).is_err());
        assert!(check_template_variables("static", &[]).is_ok());
    }

    #[test]
    fn test_render_template_double_digit_placeholders() {
        let vars: Vec<String> = (1..=10).map(|n| format!("v{}", n)).collect();
        assert_eq!(render_template("{{1}}|{{10}}", &vars), "v1|v10");
    }

    // =========================================================================
    // Report scheduling
    // =========================================================================

    #[test]
    fn test_next_run_daily_and_weekly() {
        let t = datetime!(2024-03-10 08:00 UTC);
        assert_eq!(
            ReportFrequency::Daily.next_run_after(t),
            datetime!(2024-03-11 08:00 UTC)
        );
        assert_eq!(
            ReportFrequency::Weekly.next_run_after(t),
            datetime!(2024-03-17 08:00 UTC)
        );
    }

    #[test]
    fn test_next_run_monthly_clamps_day() {
        assert_eq!(
            ReportFrequency::Monthly.next_run_after(datetime!(2024-01-31 08:00 UTC)),
            datetime!(2024-02-29 08:00 UTC)
        );
        assert_eq!(
            ReportFrequency::Monthly.next_run_after(datetime!(2024-12-15 08:00 UTC)),
            datetime!(2025-01-15 08:00 UTC)
        );
    }

    #[test]
    fn test_period_ending() {
        let t = datetime!(2024-03-31 00:00 UTC);
        assert_eq!(
            ReportFrequency::Daily.period_ending(t),
            (datetime!(2024-03-30 00:00 UTC), t)
        );
        assert_eq!(
            ReportFrequency::Monthly.period_ending(t),
            (datetime!(2024-02-29 00:00 UTC), t)
        );
        assert_eq!(
            ReportFrequency::Monthly.period_ending(datetime!(2024-01-15 00:00 UTC)).0,
            datetime!(2023-12-15 00:00 UTC)
        );
    }
}
