//! Messages routed through the pipeline
//!
//! A message is an immutable envelope around one of a closed set of bodies.
//! Filters never change a message; they supersede it with a new one.

use crate::models::{ContainerInfo, Sample, StateChange};
use crate::reporting::Report;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ContainerDiscovery,
    StateChange,
    ContainerSample,
    SendReport,
    DevNull,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ContainerDiscovery => "container_discovery",
            MessageType::StateChange => "state_change",
            MessageType::ContainerSample => "container_sample",
            MessageType::SendReport => "send_report",
            MessageType::DevNull => "devnull",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// A container found running, at startup or through admission
    Discovery(Arc<ContainerInfo>),
    StateChange(StateChange),
    Sample(Sample),
    SendReport(Report),
    /// Carries nothing; no filter handles it
    DevNull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: Uuid,
    body: MessageBody,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
        }
    }

    pub fn discovery(container: Arc<ContainerInfo>) -> Self {
        Self::new(MessageBody::Discovery(container))
    }

    pub fn state_change(change: StateChange) -> Self {
        Self::new(MessageBody::StateChange(change))
    }

    pub fn sample(sample: Sample) -> Self {
        Self::new(MessageBody::Sample(sample))
    }

    pub fn send_report(report: Report) -> Self {
        Self::new(MessageBody::SendReport(report))
    }

    pub fn devnull() -> Self {
        Self::new(MessageBody::DevNull)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn message_type(&self) -> MessageType {
        match &self.body {
            MessageBody::Discovery(_) => MessageType::ContainerDiscovery,
            MessageBody::StateChange(_) => MessageType::StateChange,
            MessageBody::Sample(_) => MessageType::ContainerSample,
            MessageBody::SendReport(_) => MessageType::SendReport,
            MessageBody::DevNull => MessageType::DevNull,
        }
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerEvent, EventType};

    #[test]
    fn test_message_type_tags() {
        let discovery = Message::discovery(Arc::new(ContainerInfo::new("web-1")));
        assert_eq!(discovery.message_type().as_str(), "container_discovery");

        let change = Message::state_change(StateChange::from_event(ContainerEvent::new(
            EventType::Creation,
            "web-1",
        )));
        assert_eq!(change.message_type().as_str(), "state_change");

        assert_eq!(Message::devnull().message_type().as_str(), "devnull");
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::devnull();
        let b = Message::devnull();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().get_version_num(), 4);
    }
}
