//! Last-known value metadata for one channel.
//!
//! A [`Record`] accumulates whatever the channel has told us so far: basic type,
//! alarm status, display metadata, timestamp, and enumeration labels. It is
//! mutated only on the thread that owns the consumer object, in response to
//! delivered notifications - never from a client library callback thread.
//!
//! Two behaviours here are load-bearing:
//!
//! - Precision and units are *sticky*. Some servers resend their metadata
//!   zeroed out after the first delivery, so an update carrying a zero
//!   precision or an empty units string must not clobber a previously recorded
//!   non-trivial value. This applies to precision and units only.
//! - The process state advances `NoUpdate -> FirstUpdate -> Update` and never
//!   regresses. Consumers use it to distinguish "metadata just arrived" from
//!   "ordinary value update".

use crate::dbr::{dbr_type_code, CtrlMeta, Dbr, DbrCategory, TimeStamp, MAX_ENUM_STATES};
use tracing::trace;

/// How far along the first-read-then-subscribe ladder this record is
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    NoUpdate,
    FirstUpdate,
    Update,
}

/// The most recently known value metadata for one named channel
#[derive(Debug, Clone)]
pub struct Record {
    name: String,
    /// Basic type code as reported by the host, -1 until known
    dbr_type: i32,
    valid: bool,
    process_state: ProcessState,
    status: i16,
    severity: i16,
    precision: i16,
    units: String,
    stamp: TimeStamp,
    enum_states: Vec<String>,
    /// Limit pairs are (lower, upper)
    display_limits: (f64, f64),
    alarm_limits: (f64, f64),
    warning_limits: (f64, f64),
    control_limits: (f64, f64),
}

impl Record {
    pub fn new(name: &str) -> Self {
        let mut record = Record {
            name: name.to_string(),
            dbr_type: -1,
            valid: false,
            process_state: ProcessState::NoUpdate,
            status: 0,
            severity: 0,
            precision: 0,
            units: String::new(),
            stamp: TimeStamp::default(),
            enum_states: Vec::new(),
            display_limits: (0.0, 0.0),
            alarm_limits: (0.0, 0.0),
            warning_limits: (0.0, 0.0),
            control_limits: (0.0, 0.0),
        };
        record.reset();
        record
    }

    /// Clear all fields back to protocol-neutral defaults.
    ///
    /// Called at construction and whenever the channel is fully re-established;
    /// metadata must not survive a disconnect/reconnect cycle.
    pub fn reset(&mut self) {
        self.dbr_type = -1;
        self.valid = false;
        self.process_state = ProcessState::NoUpdate;
        self.status = 0;
        self.severity = 0;
        self.precision = 0;
        self.units.clear();
        self.stamp = TimeStamp::default();
        self.enum_states.clear();
        self.display_limits = (0.0, 0.0);
        self.alarm_limits = (0.0, 0.0);
        self.warning_limits = (0.0, 0.0);
        self.control_limits = (0.0, 0.0);
    }

    /// Decorated type code for issuing a request in the given category, or -1
    /// if the basic type is unknown or has no entry for that category.
    pub fn dbr_type(&self, category: DbrCategory) -> i32 {
        dbr_type_code(self.dbr_type, category)
    }

    pub fn set_dbr_type(&mut self, basic: i32) {
        self.dbr_type = basic;
    }

    pub fn set_status(&mut self, status: i16) {
        self.status = status;
    }

    pub fn set_alarm_severity(&mut self, severity: i16) {
        self.severity = severity;
    }

    /// Sticky: a zero precision never overwrites a recorded non-zero one.
    pub fn set_precision(&mut self, precision: i16) {
        if precision == 0 && self.precision != 0 {
            trace!(
                name = %self.name,
                "ignoring zero precision over recorded {}",
                self.precision
            );
            return;
        }
        self.precision = precision;
    }

    /// Sticky: an empty units string never overwrites a recorded non-empty one.
    pub fn set_units(&mut self, units: &str) {
        if units.is_empty() && !self.units.is_empty() {
            trace!(name = %self.name, "ignoring empty units over recorded {:?}", self.units);
            return;
        }
        self.units = units.to_string();
    }

    pub fn set_time_stamp(&mut self, stamp: TimeStamp) {
        self.stamp = stamp;
    }

    pub fn set_display_limit(&mut self, lower: f64, upper: f64) {
        self.display_limits = (lower, upper);
    }

    pub fn set_alarm_limit(&mut self, lower: f64, upper: f64) {
        self.alarm_limits = (lower, upper);
    }

    pub fn set_warning_limit(&mut self, lower: f64, upper: f64) {
        self.warning_limits = (lower, upper);
    }

    pub fn set_control_limit(&mut self, lower: f64, upper: f64) {
        self.control_limits = (lower, upper);
    }

    /// Record an enumeration label if it is new and there is room for it.
    pub fn add_enum_state(&mut self, label: &str) {
        if self.enum_states.len() >= MAX_ENUM_STATES {
            return;
        }
        if self.enum_states.iter().any(|s| s == label) {
            return;
        }
        self.enum_states.push(label.to_string());
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Advance the process state one rung; saturates at `Update`.
    ///
    /// Called exactly once per delivered notification.
    pub fn update_process_state(&mut self) {
        self.process_state = match self.process_state {
            ProcessState::NoUpdate => ProcessState::FirstUpdate,
            ProcessState::FirstUpdate | ProcessState::Update => ProcessState::Update,
        };
    }

    /// Apply one delivered payload: each present field goes through its setter
    /// (so the sticky rules hold), then the process state advances once.
    pub fn apply(&mut self, dbr: &Dbr) {
        if let Some(status) = dbr.status() {
            self.set_status(status.status);
            self.set_alarm_severity(status.severity);
        }
        if let Some(stamp) = dbr.stamp() {
            self.set_time_stamp(stamp);
        }
        if let Some(meta) = dbr.meta() {
            self.apply_meta(meta);
        }
        self.set_valid(true);
        self.update_process_state();
    }

    fn apply_meta(&mut self, meta: &CtrlMeta) {
        self.set_precision(meta.precision);
        self.set_units(&meta.units);
        self.set_display_limit(meta.display_limits.0, meta.display_limits.1);
        self.set_alarm_limit(meta.alarm_limits.0, meta.alarm_limits.1);
        self.set_warning_limit(meta.warning_limits.0, meta.warning_limits.1);
        self.set_control_limit(meta.control_limits.0, meta.control_limits.1);
        for label in &meta.enum_states {
            self.add_enum_state(label);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn basic_type(&self) -> i32 {
        self.dbr_type
    }
    pub fn is_valid(&self) -> bool {
        self.valid
    }
    pub fn process_state(&self) -> ProcessState {
        self.process_state
    }
    pub fn status(&self) -> i16 {
        self.status
    }
    pub fn alarm_severity(&self) -> i16 {
        self.severity
    }
    pub fn precision(&self) -> i16 {
        self.precision
    }
    pub fn units(&self) -> &str {
        &self.units
    }
    pub fn time_stamp(&self) -> TimeStamp {
        self.stamp
    }
    pub fn enum_states(&self) -> &[String] {
        &self.enum_states
    }
    pub fn display_limits(&self) -> (f64, f64) {
        self.display_limits
    }
    pub fn alarm_limits(&self) -> (f64, f64) {
        self.alarm_limits
    }
    pub fn warning_limits(&self) -> (f64, f64) {
        self.warning_limits
    }
    pub fn control_limits(&self) -> (f64, f64) {
        self.control_limits
    }
}
