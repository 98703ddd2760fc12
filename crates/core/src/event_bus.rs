//! Engine event bus: trait for emitting journey lifecycle events.
//!
//! The automation engine accepts an `Arc<dyn EventSink>` and reports
//! enrollments, step outcomes and terminal transitions through it so that
//! reporting and notification consumers stay decoupled from the engine.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{EngineEvent, EngineEventType};

/// Receives engine lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for deployments that don't consume engine events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating an `EngineEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EngineEventType,
    automation_id: Uuid,
    enrollment_id: Option<Uuid>,
    contact_id: Option<String>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        automation_id,
        enrollment_id,
        contact_id,
        step_id: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let automation_id = Uuid::new_v4();
        sink.emit(make_event(
            EngineEventType::EnrollmentCreated,
            automation_id,
            Some(Uuid::new_v4()),
            Some("contact-1".into()),
        ));
        let mut completed = make_event(
            EngineEventType::EnrollmentCompleted,
            automation_id,
            None,
            Some("contact-1".into()),
        );
        completed.detail = Some("all steps done".into());
        sink.emit(completed);

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EngineEventType::EnrollmentCreated), 1);
        assert_eq!(sink.count_type(EngineEventType::EnrollmentFailed), 0);

        let events = sink.events();
        assert_eq!(events[1].detail.as_deref(), Some("all steps done"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(
            EngineEventType::StepCompleted,
            Uuid::new_v4(),
            None,
            None,
        ));
    }
}
