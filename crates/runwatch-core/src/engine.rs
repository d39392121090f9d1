use crate::interpreter::{interpret, mark_pending, Notification};
use crate::projector::{ConnectionStatus, ViewProjector};
use crate::protocol::{Command, Update};
use crate::registry::{Registry, RegistryError, Snapshot};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Applied(usize),
    Dropped,
}

/// Owns the registry for one session and forwards every resulting notification
/// to the projector before returning.
pub struct Engine<P> {
    registry: Registry,
    projector: P,
}

impl<P: ViewProjector> Engine<P> {
    pub fn new(projector: P) -> Self {
        Self {
            registry: Registry::new(),
            projector,
        }
    }

    pub fn dispatch(&mut self, update: Update) -> Dispatch {
        let kind = update.kind();
        match interpret(&mut self.registry, update) {
            Ok(notifications) => {
                let count = notifications.len();
                debug!(event = "update_applied", update = %kind, notifications = count);
                for notification in notifications {
                    self.notify(notification);
                }
                Dispatch::Applied(count)
            }
            Err(RegistryError::UnknownIdentity(identity)) => {
                warn!(
                    event = "unknown_identity",
                    update = %kind,
                    identity = %identity,
                    "lifecycle update dropped"
                );
                Dispatch::Dropped
            }
        }
    }

    pub fn command_issued(&mut self, command: &Command) -> usize {
        let notifications = mark_pending(&mut self.registry, command);
        let count = notifications.len();
        for notification in notifications {
            self.notify(notification);
        }
        count
    }

    pub fn command_rejected(&mut self, command: &Command, reason: &str) {
        self.projector.on_command_rejected(command, reason);
    }

    pub fn connection(&mut self, status: &ConnectionStatus) {
        self.projector.on_connection(status);
    }

    pub fn report_summary(&mut self) {
        let snapshot = self.registry.snapshot();
        self.projector.on_summary(&snapshot);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn projector(&self) -> &P {
        &self.projector
    }

    pub fn into_projector(self) -> P {
        self.projector
    }

    fn notify(&mut self, notification: Notification) {
        match notification {
            Notification::Discovered(groups) => self.projector.on_discovery(&groups),
            Notification::GroupReplaced {
                assembly_name,
                group,
            } => self.projector.on_group_replaced(&assembly_name, &group),
            Notification::ListChanged { assembly_name } => {
                self.projector.on_list_changed(assembly_name.as_deref())
            }
            Notification::Transition(transition) => self.projector.on_transition(&transition),
        }
    }
}
