use crate::protocol::{Command, LifecycleKind, TestDuration, TestIdentity, TestReport, Update};
use crate::registry::{FieldUpdate, Mutation, Registry, RegistryError, TestGroup, TestStatus};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub identity: TestIdentity,
    pub assembly_name: String,
    pub previous: TestStatus,
    pub status: TestStatus,
    pub message: Option<String>,
    pub duration: Option<TestDuration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Discovered(Vec<TestGroup>),
    GroupReplaced {
        assembly_name: String,
        group: TestGroup,
    },
    ListChanged {
        assembly_name: Option<String>,
    },
    Transition(Transition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldRule {
    Keep,
    Clear,
    FromEvent,
}

impl FieldRule {
    fn resolve<T>(self, value: Option<T>) -> FieldUpdate<T> {
        match (self, value) {
            (FieldRule::Keep, _) => FieldUpdate::Keep,
            (FieldRule::Clear, _) | (FieldRule::FromEvent, None) => FieldUpdate::Clear,
            (FieldRule::FromEvent, Some(value)) => FieldUpdate::Set(value),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LifecycleRule {
    kind: LifecycleKind,
    status: TestStatus,
    message: FieldRule,
    duration: FieldRule,
}

const LIFECYCLE_RULES: [LifecycleRule; 4] = [
    LifecycleRule {
        kind: LifecycleKind::Starting,
        status: TestStatus::Running,
        message: FieldRule::Clear,
        duration: FieldRule::Keep,
    },
    LifecycleRule {
        kind: LifecycleKind::Passed,
        status: TestStatus::Passed,
        message: FieldRule::Clear,
        duration: FieldRule::FromEvent,
    },
    LifecycleRule {
        kind: LifecycleKind::Failed,
        status: TestStatus::Failed,
        message: FieldRule::FromEvent,
        duration: FieldRule::FromEvent,
    },
    LifecycleRule {
        kind: LifecycleKind::Ignored,
        status: TestStatus::Ignored,
        message: FieldRule::FromEvent,
        duration: FieldRule::Keep,
    },
];

fn lifecycle_rule(kind: LifecycleKind) -> Option<&'static LifecycleRule> {
    LIFECYCLE_RULES.iter().find(|rule| rule.kind == kind)
}

/// Applies one inbound update to the registry and returns what observers should
/// be told. Updates are applied exactly as given; nothing is buffered.
pub fn interpret(registry: &mut Registry, update: Update) -> Result<Vec<Notification>, RegistryError> {
    match update {
        Update::TestSetDiscovered(lists) => {
            registry.replace_all(lists.into_iter().map(TestGroup::from).collect());
            Ok(vec![Notification::Discovered(registry.snapshot().groups)])
        }
        Update::TestListDiscovered(list) => {
            let assembly_name = list.assembly_name.clone();
            registry.replace_group(&assembly_name, TestGroup::from(list));
            let group = registry
                .group(&assembly_name)
                .unwrap_or_else(|| TestGroup::new(assembly_name.clone()));
            Ok(vec![Notification::GroupReplaced {
                assembly_name,
                group,
            }])
        }
        Update::TestListChanged { assembly_name } => {
            Ok(vec![Notification::ListChanged { assembly_name }])
        }
        Update::Lifecycle { kind, report } => {
            let Some(rule) = lifecycle_rule(kind) else {
                return Ok(Vec::new());
            };
            let TestReport {
                identity,
                message,
                duration,
            } = report;
            let mutation = Mutation {
                status: rule.status,
                message: rule.message.resolve(message),
                duration: rule.duration.resolve(duration),
            };
            let transition = transition(registry, &identity, mutation)?;
            Ok(vec![Notification::Transition(transition)])
        }
    }
}

/// Marks the tests a run command targets as `Pending`. Identities the registry
/// does not know, or that belong to another assembly, are skipped.
pub fn mark_pending(registry: &mut Registry, command: &Command) -> Vec<Notification> {
    let targets: Vec<TestIdentity> = match command {
        Command::RunAll => registry.identities().map(str::to_string).collect(),
        Command::RunTests {
            test_codes,
            assembly_name,
        } => test_codes
            .iter()
            .filter(|identity| match registry.get(identity) {
                Some(record) if &record.assembly_name == assembly_name => true,
                Some(record) => {
                    warn!(
                        event = "run_target_assembly_mismatch",
                        identity = %identity,
                        requested = %assembly_name,
                        owner = %record.assembly_name
                    );
                    false
                }
                None => {
                    warn!(event = "run_target_unknown", identity = %identity);
                    false
                }
            })
            .cloned()
            .collect(),
        Command::DiscoverAll => Vec::new(),
    };

    targets
        .iter()
        .filter_map(|identity| {
            let mutation = Mutation {
                status: TestStatus::Pending,
                message: FieldUpdate::Clear,
                duration: FieldUpdate::Keep,
            };
            transition(registry, identity, mutation).ok()
        })
        .map(Notification::Transition)
        .collect()
}

fn transition(
    registry: &mut Registry,
    identity: &str,
    mutation: Mutation,
) -> Result<Transition, RegistryError> {
    let previous = registry
        .get(identity)
        .map(|record| record.status)
        .ok_or_else(|| RegistryError::UnknownIdentity(identity.to_string()))?;
    let record = registry.apply(identity, mutation)?;
    Ok(Transition {
        identity: record.identity.clone(),
        assembly_name: record.assembly_name.clone(),
        previous,
        status: record.status,
        message: record.last_message.clone(),
        duration: record.last_duration.clone(),
    })
}
