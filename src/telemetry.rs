//! Structured telemetry for protocol anomalies and broken invariants.
//!
//! Anything unexpected that the library absorbs, or is about to turn into a fatal error, is
//! reported as a [`Violation`] record instead of a bare log line. Violations can be:
//!
//! - Logged via tracing (the default, through [`TracingObserver`])
//! - Collected programmatically for testing ([`CollectingObserver`])
//! - Fanned out to several observers at once ([`CompositeObserver`])
//!
//! # Example
//!
//! ```
//! use netplay_rollback::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! assert!(observer.violations().is_empty(), "unexpected violations");
//! assert!(!observer.has_violation(ViolationKind::Transport));
//! ```

use crate::IndexedFrame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serializes `Option<IndexedFrame>` as `"index:frame"` or `null`.
mod indexed_frame_serializer {
    use crate::IndexedFrame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<IndexedFrame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            Some(f) if !f.is_max() => serializer.collect_str(f),
            _ => serializer.serialize_none(),
        }
    }
}

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but absorbed; the operation continued.
    Warning,
    /// The operation failed and the caller was told.
    Error,
    /// The session cannot continue.
    Critical,
}

impl ViolationSeverity {
    /// Lowercase label used in log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Datagram framing, sequencing, fragmentation or keep-alive problems.
    Transport,
    /// Input timeline writes that were ignored or inconsistent.
    InputTimeline,
    /// Rejected netplay state transitions.
    StateMachine,
    /// Snapshot save/load problems.
    Snapshot,
    /// State hash mismatch between peers.
    Desync,
    /// Configuration rejected at runtime.
    Configuration,
    /// Session bookkeeping that contradicts itself.
    InternalError,
}

impl ViolationKind {
    /// Lowercase label used in log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::InputTimeline => "input_timeline",
            Self::StateMachine => "state_machine",
            Self::Snapshot => "snapshot",
            Self::Desync => "desync",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with enough context to diagnose it after the fact.
///
/// ```
/// use netplay_rollback::telemetry::{Violation, ViolationKind, ViolationSeverity};
/// use netplay_rollback::IndexedFrame;
///
/// let violation = Violation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::Transport,
///     "stale ack",
///     "reliable_channel.rs:1",
/// )
/// .with_indexed_frame(IndexedFrame::new(2, 40))
/// .with_context("sequence", "17");
///
/// assert_eq!(violation.context.get("sequence").map(String::as_str), Some("17"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Which subsystem noticed it.
    pub kind: ViolationKind,
    /// What happened, in prose.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// The timeline position at which the violation occurred, if applicable.
    #[serde(serialize_with = "indexed_frame_serializer::serialize")]
    pub indexed_frame: Option<IndexedFrame>,
    /// Extra fields such as sequence numbers or player numbers.
    pub context: BTreeMap<String, String>,
}

impl Violation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            indexed_frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the timeline position at which this violation occurred.
    #[must_use]
    pub fn with_indexed_frame(mut self, indexed_frame: IndexedFrame) -> Self {
        self.indexed_frame = Some(indexed_frame);
        self
    }

    /// Attaches one extra field.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// JSON rendering for log shippers. `None` only if `serde_json` refuses the record.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Like [`to_json`](Self::to_json), but indented.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.indexed_frame {
            write!(f, ", indexed_frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives violations as they are reported.
///
/// Observers are shared behind an `Arc` by the channel and the session, so they must be
/// `Send + Sync`. Implementations should return quickly.
pub trait ViolationObserver: Send + Sync {
    /// Called once per reported violation.
    fn on_violation(&self, violation: &Violation);
}

/// Logs violations through `tracing` with structured fields.
///
/// `Warning` maps to `warn!`; `Error` and `Critical` map to `error!`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// The observer used when none is installed.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let indexed_frame = violation
            .indexed_frame
            .map_or_else(|| "null".to_owned(), |f| f.to_string());
        let context = format!("{:?}", violation.context);

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    indexed_frame = %indexed_frame,
                    context = %context,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    indexed_frame = %indexed_frame,
                    context = %context,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Stores every violation it sees, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything seen so far.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// How many violations were seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Whether nothing was seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Whether at least one violation of `kind` was seen.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// The violations of `kind`, oldest first.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<Violation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Forgets everything seen.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Forwards violations to several observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ViolationObserver>>,
}

impl CompositeObserver {
    /// Creates a composite observer with no children.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child that receives every later violation.
    pub fn add(&mut self, observer: Arc<dyn ViolationObserver>) {
        self.observers.push(observer);
    }
}

impl ViolationObserver for CompositeObserver {
    fn on_violation(&self, violation: &Violation) {
        for observer in &self.observers {
            observer.on_violation(violation);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("num_observers", &self.observers.len())
            .finish()
    }
}

/// Reports a violation to `observer`, or to a [`TracingObserver`] when there is none.
pub fn report_to_observer(observer: Option<&Arc<dyn ViolationObserver>>, violation: &Violation) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a [`Violation`] tagged with the caller's file and line to the tracing log.
///
/// ```
/// use netplay_rollback::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::Snapshot,
///     "evicted {} snapshots", 3);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Like [`report_violation!`], but routes through an `Option<Arc<dyn ViolationObserver>>`.
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Asserts that a [`CollectingObserver`] saw nothing.
///
/// # Panics
///
/// Panics listing every collected violation.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a [`CollectingObserver`] saw a violation of the given kind.
///
/// # Panics
///
/// Panics listing what was collected instead.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> Violation {
        Violation::new(
            ViolationSeverity::Error,
            ViolationKind::Snapshot,
            "slot overflow",
            "test.rs:10",
        )
    }

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(ViolationKind::Transport.as_str(), "transport");
        assert_eq!(ViolationKind::InputTimeline.as_str(), "input_timeline");
        assert_eq!(ViolationKind::StateMachine.to_string(), "state_machine");
    }

    #[test]
    fn display_includes_frame_and_context() {
        let text = sample()
            .with_indexed_frame(IndexedFrame::new(4, 12))
            .with_context("slot", "3")
            .to_string();
        assert!(text.starts_with("[error/snapshot] slot overflow (at test.rs:10"));
        assert!(text.contains("indexed_frame=4:12"));
        assert!(text.contains("slot"));
    }

    #[test]
    fn collecting_observer_filters_by_kind() {
        let observer = CollectingObserver::new();
        observer.on_violation(&sample());
        observer.on_violation(&Violation::new(
            ViolationSeverity::Warning,
            ViolationKind::Transport,
            "late ack",
            "test.rs:1",
        ));

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.violations_of_kind(ViolationKind::Transport).len(), 1);
        assert_violation!(observer, ViolationKind::Snapshot);

        observer.clear();
        assert!(observer.is_empty());
        assert_no_violations!(observer);
    }

    #[test]
    fn composite_forwards_to_every_child() {
        let a = Arc::new(CollectingObserver::new());
        let b = Arc::new(CollectingObserver::new());
        let mut composite = CompositeObserver::new();
        composite.add(a.clone());
        composite.add(b.clone());

        composite.on_violation(&sample());
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn report_violation_to_uses_given_observer() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            observer,
            ViolationSeverity::Warning,
            ViolationKind::InputTimeline,
            "ignored write at {}",
            IndexedFrame::new(1, 1)
        );

        let seen = collector.violations();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "ignored write at 1:1");
        assert!(seen[0].location.contains("telemetry.rs"));
    }

    #[test]
    fn report_violation_to_without_observer_falls_back_to_tracing() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            observer,
            ViolationSeverity::Warning,
            ViolationKind::Transport,
            "dropped"
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_uses_snake_case_and_frame_string() {
        let json = sample()
            .with_indexed_frame(IndexedFrame::new(2, 7))
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["severity"], "error");
        assert_eq!(value["kind"], "snapshot");
        assert_eq!(value["indexed_frame"], "2:7");

        let none = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&none).unwrap();
        assert!(value["indexed_frame"].is_null());
    }
}
