use crate::interpreter::Transition;
use crate::protocol::Command;
use crate::registry::{Snapshot, TestGroup};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Opened { endpoint: String },
    Closed { reason: Option<String> },
    Errored { message: String },
}

/// Presentation side of the engine. Receives owned views only, never the
/// registry itself.
pub trait ViewProjector {
    fn on_discovery(&mut self, groups: &[TestGroup]);

    fn on_group_replaced(&mut self, assembly_name: &str, group: &TestGroup);

    fn on_transition(&mut self, transition: &Transition);

    fn on_list_changed(&mut self, _assembly_name: Option<&str>) {}

    fn on_connection(&mut self, _status: &ConnectionStatus) {}

    fn on_command_rejected(&mut self, _command: &Command, _reason: &str) {}

    fn on_summary(&mut self, _snapshot: &Snapshot) {}
}
