//! End-of-session reporting.
//!
//! Collaborators that want to appear in the final report implement
//! [`Reportable`] and are registered with the session's [`Reporter`]. When the
//! `report` topic is published the reporter queries every one of them, in
//! registration order, and keeps the assembled sections for the orchestrator.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::bus::{EventBus, Topic};
use crate::termination::StopReason;

/// A single report value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Absent,
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for PropertyValue {
    fn from(v: usize) -> Self {
        PropertyValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<Option<String>> for PropertyValue {
    fn from(v: Option<String>) -> Self {
        v.map_or(PropertyValue::Absent, PropertyValue::Text)
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Float(x) => write!(f, "{x:.3}"),
            PropertyValue::Text(s) => f.write_str(s),
            PropertyValue::Absent => f.write_str("-"),
        }
    }
}

/// Something that contributes a named section to the session report.
///
/// `property_names` and `property_values` are parallel sequences.
pub trait Reportable: Send + Sync {
    fn name(&self) -> String;
    fn property_names(&self) -> Vec<String>;
    fn property_values(&self) -> Vec<PropertyValue>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSection {
    pub name: String,
    pub properties: Vec<Property>,
}

impl ReportSection {
    /// Query a reportable once.
    pub fn capture(reportable: &dyn Reportable) -> Self {
        let name = reportable.name();
        let names = reportable.property_names();
        let values = reportable.property_values();
        if names.len() != values.len() {
            warn!(
                section = %name,
                names = names.len(),
                values = values.len(),
                "reportable returned mismatched names and values"
            );
        }
        let properties = names
            .into_iter()
            .zip(values)
            .map(|(name, value)| Property { name, value })
            .collect();
        Self { name, properties }
    }

    pub fn get(&self, property: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|p| p.name == property)
            .map(|p| &p.value)
    }
}

/// Everything known about a session once it has stopped.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub stop_reason: StopReason,
    pub duration: Duration,
    pub completed: u64,
    pub sections: Vec<ReportSection>,
}

impl SessionReport {
    pub fn section(&self, name: &str) -> Option<&ReportSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Look up `section.property`.
    pub fn value(&self, section: &str, property: &str) -> Option<&PropertyValue> {
        self.section(section)?.get(property)
    }
}

/// Collects report sections when `report` is published.
#[derive(Default)]
pub struct Reporter {
    reportables: Mutex<Vec<Arc<dyn Reportable>>>,
    collected: Mutex<Vec<ReportSection>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reporter listening on `bus`'s `report` topic.
    pub fn attach(bus: &EventBus) -> Arc<Self> {
        let reporter = Arc::new(Self::new());
        let weak = Arc::downgrade(&reporter);
        bus.subscribe(Topic::Report, move |_| {
            if let Some(reporter) = weak.upgrade() {
                reporter.collect();
            }
            Ok(())
        });
        reporter
    }

    pub fn register(&self, reportable: Arc<dyn Reportable>) {
        self.reportables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reportable);
    }

    pub fn len(&self) -> usize {
        self.reportables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Query every registered reportable now.
    pub fn collect(&self) {
        let reportables = self
            .reportables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let sections: Vec<ReportSection> = reportables
            .iter()
            .map(|r| ReportSection::capture(r.as_ref()))
            .collect();
        *self.collected.lock().unwrap_or_else(PoisonError::into_inner) = sections;
    }

    /// Take the sections gathered by the last `collect`.
    pub fn take_sections(&self) -> Vec<ReportSection> {
        std::mem::take(&mut *self.collected.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Event;

    struct Fixed;

    impl Reportable for Fixed {
        fn name(&self) -> String {
            "Fixed".into()
        }

        fn property_names(&self) -> Vec<String> {
            vec!["#count".into(), "ok".into(), "note".into()]
        }

        fn property_values(&self) -> Vec<PropertyValue> {
            vec![3u64.into(), true.into(), None.into()]
        }
    }

    struct Lopsided;

    impl Reportable for Lopsided {
        fn name(&self) -> String {
            "Lopsided".into()
        }

        fn property_names(&self) -> Vec<String> {
            vec!["a".into(), "b".into()]
        }

        fn property_values(&self) -> Vec<PropertyValue> {
            vec![PropertyValue::Int(1)]
        }
    }

    #[test]
    fn test_capture_zips_names_and_values() {
        let section = ReportSection::capture(&Fixed);
        assert_eq!(section.name, "Fixed");
        assert_eq!(section.get("#count"), Some(&PropertyValue::Int(3)));
        assert_eq!(section.get("ok"), Some(&PropertyValue::Bool(true)));
        assert_eq!(section.get("note"), Some(&PropertyValue::Absent));
        assert_eq!(section.get("missing"), None);
    }

    #[test]
    fn test_capture_truncates_mismatch() {
        let section = ReportSection::capture(&Lopsided);
        assert_eq!(section.properties.len(), 1);
    }

    #[test]
    fn test_reporter_collects_on_report_topic() {
        let bus = EventBus::new();
        let reporter = Reporter::attach(&bus);
        reporter.register(Arc::new(Fixed));
        reporter.register(Arc::new(Lopsided));
        assert_eq!(reporter.len(), 2);

        assert!(reporter.take_sections().is_empty());
        bus.publish(Event::Report);
        let sections = reporter.take_sections();
        let names: Vec<_> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Fixed", "Lopsided"]);
    }

    #[test]
    fn test_session_report_lookup_and_json() {
        let report = SessionReport {
            stop_reason: StopReason::Stopped(Some("halt".into())),
            duration: Duration::from_millis(1500),
            completed: 7,
            sections: vec![ReportSection::capture(&Fixed)],
        };
        assert_eq!(report.value("Fixed", "#count"), Some(&PropertyValue::Int(3)));
        assert!(report.value("Nope", "#count").is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stop_reason"]["kind"], "stopped");
        assert_eq!(json["stop_reason"]["message"], "halt");
        assert_eq!(json["sections"][0]["properties"][0]["value"], 3);
    }

    #[test]
    fn test_property_value_display() {
        assert_eq!(PropertyValue::Float(0.5).to_string(), "0.500");
        assert_eq!(PropertyValue::Absent.to_string(), "-");
        assert_eq!(PropertyValue::from("x".to_string()).to_string(), "x");
    }
}
