//! Checkable state machine (spec §4.5)
//!
//! This is the heart of the engine: `process_result` implements the ten-step
//! algorithm spec.md lays out for turning one `CheckResult` into updated
//! state, flap bookkeeping, acknowledgement expiry, downtime recomputation
//! and a batch of events for downstream consumers (scheduler, notification
//! engine, cluster replication).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{instrument, trace, warn};

use crate::error::{CoreError, CoreResult};
use crate::registry::ObjectId;
use crate::util::splay;

/// Service state codes (OK=0 Warning=1 Critical=2 Unknown=3). A host's
/// "raw state" is stored using the same representation (Up=0, any non-OK
/// service-style code maps to Down) so the state machine itself doesn't
/// need to branch on Host vs. Service — only the public accessors do.
pub const STATE_OK_OR_UP: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateType {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acknowledgement {
    None,
    Normal,
    Sticky,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableFlags {
    pub active_checks: bool,
    pub passive_checks: bool,
    pub notifications: bool,
    pub flap_detection: bool,
    pub event_handler: bool,
    pub perfdata: bool,
}

impl Default for EnableFlags {
    fn default() -> Self {
        Self {
            active_checks: true,
            passive_checks: true,
            notifications: true,
            flap_detection: true,
            event_handler: true,
            perfdata: true,
        }
    }
}

/// Immutable value produced by one check execution (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub state: u8,
    pub exit_status: i32,
    pub output: String,
    pub performance_data: Vec<String>,
    pub schedule_start: f64,
    pub schedule_end: f64,
    pub execution_start: f64,
    pub execution_end: f64,
    pub command: Vec<String>,
    pub check_source: String,
    pub active: bool,
    pub vars_before: Option<serde_json::Value>,
    pub vars_after: Option<serde_json::Value>,
}

impl CheckResult {
    /// Validates the ordering invariants from spec §6 before the result is
    /// allowed to enter `process_result`.
    pub fn validate(&self) -> CoreResult<()> {
        if self.execution_start > self.execution_end {
            return Err(CoreError::BadCheckResult {
                message: "execution_start is after execution_end".to_string(),
            });
        }
        if self.schedule_start > self.execution_start {
            return Err(CoreError::BadCheckResult {
                message: "schedule_start is after execution_start".to_string(),
            });
        }
        Ok(())
    }
}

/// Rolling 20-bit transition buffer (spec §3 invariant, §4.5 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlapState {
    buffer: [bool; 20],
    oldest_index: u8,
    pub flapping_current: f64,
    pub is_flapping: bool,
    pub high_threshold: f64,
    pub low_threshold: f64,
}

impl Default for FlapState {
    fn default() -> Self {
        Self {
            buffer: [false; 20],
            oldest_index: 0,
            flapping_current: 0.0,
            is_flapping: false,
            high_threshold: 30.0,
            low_threshold: 25.0,
        }
    }
}

impl FlapState {
    /// Record the outcome of one check (`transitioned` = this check's raw
    /// state differs from the previous one) and recompute the flapping
    /// percentage. The ring buffer advances on every check, not only on a
    /// transition, so a run of stable results ages transitions out again.
    /// Returns `Some(true)` on a flap-start transition, `Some(false)` on a
    /// flap-end transition, `None` if `is_flapping` didn't change.
    fn record_check(&mut self, transitioned: bool) -> Option<bool> {
        self.buffer[self.oldest_index as usize] = transitioned;
        self.oldest_index = (self.oldest_index + 1) % 20;

        let ones = self.buffer.iter().filter(|b| **b).count();
        self.flapping_current = (ones as f64 / 20.0) * 100.0;

        let was_flapping = self.is_flapping;
        if !was_flapping && self.flapping_current >= self.high_threshold {
            self.is_flapping = true;
        } else if was_flapping && self.flapping_current < self.low_threshold {
            self.is_flapping = false;
        }

        if self.is_flapping != was_flapping {
            Some(self.is_flapping)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Downtime {
    pub id: ObjectId,
    pub author: String,
    pub comment: String,
    pub start: f64,
    pub end: f64,
    pub fixed: bool,
    pub duration: f64,
    pub trigger_parent: Option<ObjectId>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: ObjectId,
    pub author: String,
    pub text: String,
    pub created: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostData {
    pub addresses: Vec<String>,
    pub display_name: String,
    pub groups: Vec<String>,
    pub services: HashMap<String, ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceData {
    pub short_name: String,
    pub host: ObjectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CheckableKind {
    Host(HostData),
    Service(ServiceData),
}

/// Fields shared by Host and Service (spec §3 "Checkable").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckableCommon {
    pub name: String,
    pub check_command: String,
    pub check_interval: f64,
    pub retry_interval: f64,
    pub max_check_attempts: u32,
    pub check_period: Option<ObjectId>,
    pub check_timeout: f64,
    pub enabled: EnableFlags,

    pub raw_state: u8,
    pub state_type: StateType,
    pub check_attempt: u32,
    pub last_state_change: f64,
    pub last_hard_state_change: f64,
    pub last_check: f64,
    pub next_check: f64,
    pub last_hard_state: u8,
    pub last_time_in_state: HashMap<u8, f64>,

    pub downtime_depth: u32,
    pub acknowledgement: Acknowledgement,
    pub ack_expiry: f64,
    pub force_next_check: bool,

    pub flapping: FlapState,

    pub notifications: Vec<ObjectId>,
    pub comments: Vec<Comment>,
    pub downtimes: Vec<Downtime>,
    pub last_check_result: Option<CheckResult>,
    pub command_endpoint: Option<ObjectId>,
    pub dependency_groups: Vec<ObjectId>,
}

impl CheckableCommon {
    pub fn new(name: impl Into<String>, check_command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            check_command: check_command.into(),
            check_interval: 60.0,
            retry_interval: 60.0,
            max_check_attempts: 3,
            check_period: None,
            check_timeout: 0.0,
            enabled: EnableFlags::default(),
            raw_state: STATE_OK_OR_UP,
            state_type: StateType::Hard,
            check_attempt: 1,
            last_state_change: 0.0,
            last_hard_state_change: 0.0,
            last_check: 0.0,
            next_check: 0.0,
            last_hard_state: STATE_OK_OR_UP,
            last_time_in_state: HashMap::new(),
            downtime_depth: 0,
            acknowledgement: Acknowledgement::None,
            ack_expiry: 0.0,
            force_next_check: false,
            flapping: FlapState::default(),
            notifications: Vec::new(),
            comments: Vec::new(),
            downtimes: Vec::new(),
            last_check_result: None,
            command_endpoint: None,
            dependency_groups: Vec::new(),
        }
    }

    /// `interval` used for the *next* scheduling decision: check_interval on
    /// Hard/OK states, retry_interval while soft-retrying a problem.
    fn active_interval(&self) -> f64 {
        if self.state_type == StateType::Hard || self.raw_state == STATE_OK_OR_UP {
            self.check_interval
        } else {
            self.retry_interval
        }
    }

    /// spec §4.5 "Next-check scheduling".
    pub fn update_next_check(&mut self) -> f64 {
        let old_next_check = self.next_check;
        let interval = self.active_interval();
        self.next_check = self.last_check + interval + splay(&self.name, interval);
        old_next_check
    }

    pub fn is_acked(&self) -> bool {
        self.acknowledgement != Acknowledgement::None
    }
}

/// One event for every downstream consumer §4.5 step 9 lists.
#[derive(Debug, Clone)]
pub enum CheckableEvent {
    NewCheckResult { checkable: ObjectId, result: CheckResult },
    StateChange { checkable: ObjectId, old_state: u8, new_state: u8, old_type: StateType, new_type: StateType },
    FlapStart { checkable: ObjectId },
    FlapEnd { checkable: ObjectId },
    NotificationsRequested { checkable: ObjectId, ntype: NotificationType, author: String, text: String, force: bool },
    ReachabilityChanged { checkable: ObjectId, reachable: bool },
    NextCheckChanged { checkable: ObjectId, old_next_check: f64 },
    NotificationSentToUser { checkable: ObjectId, notification: ObjectId, user: ObjectId },
    NotificationSentToAllUsers { checkable: ObjectId, notification: ObjectId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    Problem,
    Recovery,
    FlappingStart,
    FlappingEnd,
    DowntimeStart,
    DowntimeEnd,
    DowntimeRemoved,
    Acknowledgement,
    Custom,
}

/// Broadcasts [`CheckableEvent`]s to whatever is subscribed (scheduler,
/// notification engine, cluster replication) — the "channel/broadcast
/// abstraction" Design Notes §9 calls for in place of `boost::signals2`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CheckableEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<CheckableEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, event: CheckableEvent) {
        // No subscribers is fine; events are best-effort fan-out.
        let _ = self.sender.send(event);
    }

    /// Entry point for modules outside this one (scheduler, external
    /// command bus) that need to publish an event without going through
    /// `process_result`.
    pub fn publish(&self, event: CheckableEvent) {
        self.emit(event);
    }
}

/// Implements spec §4.5 steps 1-10. The caller is responsible for holding
/// the checkable's own lock for the full duration (spec §5) — this function
/// assumes exclusive access to `checkable`. `id` is the checkable's
/// registry id, stamped onto every emitted event (the common struct itself
/// doesn't know its own id).
#[instrument(skip(checkable, result, events), fields(name = %checkable.name))]
pub fn process_result(
    id: ObjectId,
    checkable: &mut CheckableCommon,
    result: CheckResult,
    now: f64,
    events: &EventBus,
) -> CoreResult<()> {
    result.validate()?;

    let old_state = checkable.raw_state;
    let old_state_type = checkable.state_type;

    checkable.last_check = result.execution_end;

    let raw_state_changed = result.state != old_state;

    // Step 3/4: soft/hard transition and attempt counter.
    if result.state == STATE_OK_OR_UP {
        checkable.check_attempt = 1;
        if old_state != STATE_OK_OR_UP || old_state_type != StateType::Hard {
            checkable.state_type = StateType::Hard;
        }
        checkable.force_next_check = false;
    } else {
        checkable.check_attempt += 1;
        if checkable.check_attempt < checkable.max_check_attempts {
            checkable.state_type = StateType::Soft;
        } else {
            checkable.state_type = StateType::Hard;
            checkable.check_attempt = checkable.max_check_attempts;
        }
    }
    checkable.raw_state = result.state;

    // Step 5: last-time-in-state + state-change timestamps.
    checkable.last_time_in_state.insert(result.state, result.execution_end);
    if raw_state_changed {
        checkable.last_state_change = result.execution_end;
    }
    let hard_state_changed = checkable.state_type == StateType::Hard
        && (old_state_type != StateType::Hard || old_state != result.state);
    if hard_state_changed {
        checkable.last_hard_state_change = result.execution_end;
        checkable.last_hard_state = old_state;
    }

    // Step 6: flap buffer advances on every check; the bit records whether
    // this particular check was a raw state change.
    let mut flap_transition = None;
    if checkable.enabled.flap_detection {
        flap_transition = checkable.flapping.record_check(raw_state_changed);
    }

    // Step 7: acknowledgement expiry.
    let hard_ok_now = checkable.state_type == StateType::Hard && result.state == STATE_OK_OR_UP;
    match checkable.acknowledgement {
        Acknowledgement::Sticky if hard_ok_now => {
            checkable.acknowledgement = Acknowledgement::None;
            checkable.ack_expiry = 0.0;
        }
        Acknowledgement::Normal if hard_ok_now || raw_state_changed => {
            checkable.acknowledgement = Acknowledgement::None;
            checkable.ack_expiry = 0.0;
        }
        _ => {}
    }
    if checkable.ack_expiry != 0.0 && now >= checkable.ack_expiry {
        checkable.acknowledgement = Acknowledgement::None;
        checkable.ack_expiry = 0.0;
    }

    // Step 8: downtime trigger/expiry/depth recompute.
    for downtime in checkable.downtimes.iter_mut() {
        if downtime.trigger_parent.is_some() && now >= downtime.start && now < downtime.end {
            downtime.active = true;
        }
    }
    checkable.downtimes.retain(|d| now < d.end);
    checkable.downtime_depth = checkable.downtimes.iter().filter(|d| d.active).count() as u32;

    // Step 9: UpdateNextCheck + events.
    let old_next_check = checkable.update_next_check();
    if old_next_check != checkable.next_check {
        events.emit(CheckableEvent::NextCheckChanged { checkable: id, old_next_check });
    }

    checkable.last_check_result = Some(result.clone());
    events.emit(CheckableEvent::NewCheckResult { checkable: id, result: result.clone() });

    if raw_state_changed || hard_state_changed {
        events.emit(CheckableEvent::StateChange {
            checkable: id,
            old_state,
            new_state: result.state,
            old_type: old_state_type,
            new_type: checkable.state_type,
        });
    }

    if let Some(started) = flap_transition {
        events.emit(if started {
            CheckableEvent::FlapStart { checkable: id }
        } else {
            CheckableEvent::FlapEnd { checkable: id }
        });
    }

    if hard_state_changed {
        let ntype = if result.state == STATE_OK_OR_UP {
            NotificationType::Recovery
        } else {
            NotificationType::Problem
        };
        events.emit(CheckableEvent::NotificationsRequested {
            checkable: id,
            ntype,
            author: String::new(),
            text: String::new(),
            force: false,
        });
    }

    trace!(
        old_state, new_state = result.state, attempt = checkable.check_attempt,
        state_type = ?checkable.state_type, "processed check result"
    );

    Ok(())
}

/// A malformed result (§4.5 "Failure semantics"): the schedule is untouched.
pub fn reject_bad_result(checkable_name: &str, message: impl Into<String>) -> CoreError {
    let message = message.into();
    warn!(checkable = checkable_name, %message, "rejecting bad check result");
    CoreError::BadCheckResult { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result(state: u8, t: f64) -> CheckResult {
        CheckResult {
            state,
            exit_status: state as i32,
            output: "test".to_string(),
            performance_data: vec![],
            schedule_start: t,
            schedule_end: t,
            execution_start: t,
            execution_end: t,
            command: vec!["test".to_string()],
            check_source: "test".to_string(),
            active: true,
            vars_before: None,
            vars_after: None,
        }
    }

    #[test]
    fn soft_then_hard_transition_on_repeated_failures() {
        let events = EventBus::default();
        let mut c = CheckableCommon::new("svc", "check_test");
        c.max_check_attempts = 3;

        process_result(ObjectId(1), &mut c, ok_result(2, 1.0), 1.0, &events).unwrap();
        assert_eq!(c.state_type, StateType::Soft);
        assert_eq!(c.check_attempt, 2);

        process_result(ObjectId(1), &mut c, ok_result(2, 2.0), 2.0, &events).unwrap();
        assert_eq!(c.state_type, StateType::Hard);
        assert_eq!(c.check_attempt, 3);
    }

    #[test]
    fn recovering_resets_attempt_counter() {
        let events = EventBus::default();
        let mut c = CheckableCommon::new("svc", "check_test");
        c.max_check_attempts = 3;
        c.check_attempt = 3;
        c.state_type = StateType::Hard;
        c.raw_state = 2;

        process_result(ObjectId(1), &mut c, ok_result(0, 10.0), 10.0, &events).unwrap();
        assert_eq!(c.state_type, StateType::Hard);
        assert_eq!(c.check_attempt, 1);
        assert_eq!(c.raw_state, 0);
    }

    #[test]
    fn flap_law_detects_and_clears() {
        // Popcount/20 model (buffer advances on every check, not only on a
        // transition): 6 alternations set 6 of 20 bits -> 30%, crossing the
        // high threshold. Clearing then needs enough same-state checks for
        // the ring to both wrap past the untouched tail and overwrite enough
        // of those 6 bits to drop under the 25% low threshold; 20 is a safe
        // upper bound (a full wrap zeroes the whole buffer).
        let events = EventBus::default();
        let mut c = CheckableCommon::new("svc", "check_test");
        c.max_check_attempts = 1;

        let mut t = 0.0;
        let mut state = 0u8;
        for _ in 0..6 {
            t += 1.0;
            state = if state == 0 { 1 } else { 0 };
            process_result(ObjectId(1), &mut c, ok_result(state, t), t, &events).unwrap();
        }
        assert!(c.flapping.is_flapping);
        assert!(c.flapping.flapping_current >= 30.0);

        for _ in 0..20 {
            t += 1.0;
            process_result(ObjectId(1), &mut c, ok_result(state, t), t, &events).unwrap();
        }
        assert!(!c.flapping.is_flapping);
        assert!(c.flapping.flapping_current < 25.0);
    }

    #[test]
    fn acknowledgement_normal_clears_on_state_change() {
        let events = EventBus::default();
        let mut c = CheckableCommon::new("svc", "check_test");
        c.max_check_attempts = 1;
        c.acknowledgement = Acknowledgement::Normal;
        c.raw_state = 2;
        c.state_type = StateType::Hard;

        process_result(ObjectId(1), &mut c, ok_result(1, 1.0), 1.0, &events).unwrap();
        assert_eq!(c.acknowledgement, Acknowledgement::None);
    }

    #[test]
    fn acknowledgement_sticky_survives_soft_state_change() {
        let events = EventBus::default();
        let mut c = CheckableCommon::new("svc", "check_test");
        c.max_check_attempts = 3;
        c.acknowledgement = Acknowledgement::Sticky;
        c.raw_state = 2;
        c.state_type = StateType::Hard;
        c.check_attempt = 1;

        process_result(ObjectId(1), &mut c, ok_result(1, 1.0), 1.0, &events).unwrap();
        assert_eq!(c.acknowledgement, Acknowledgement::Sticky);

        process_result(ObjectId(1), &mut c, ok_result(0, 2.0), 2.0, &events).unwrap();
        assert_eq!(c.acknowledgement, Acknowledgement::None);
    }

}
