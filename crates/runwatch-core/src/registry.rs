use crate::protocol::{DiscoveredList, TestDuration, TestIdentity};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TestStatus {
    #[default]
    Unknown,
    Pending,
    Running,
    Passed,
    Failed,
    Ignored,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Unknown => "unknown",
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Ignored => "ignored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Passed | TestStatus::Failed | TestStatus::Ignored
        )
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub identity: TestIdentity,
    pub assembly_name: String,
    pub status: TestStatus,
    pub last_message: Option<String>,
    pub last_duration: Option<TestDuration>,
}

impl TestRecord {
    pub fn new(identity: impl Into<TestIdentity>, assembly_name: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            assembly_name: assembly_name.into(),
            status: TestStatus::Unknown,
            last_message: None,
            last_duration: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestGroup {
    pub assembly_name: String,
    pub tests: Vec<TestRecord>,
}

impl TestGroup {
    pub fn new(assembly_name: impl Into<String>) -> Self {
        Self {
            assembly_name: assembly_name.into(),
            tests: Vec::new(),
        }
    }

    pub fn from_identities<I, S>(assembly_name: impl Into<String>, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TestIdentity>,
    {
        let assembly_name = assembly_name.into();
        let tests = identities
            .into_iter()
            .map(|identity| TestRecord::new(identity, assembly_name.clone()))
            .collect();
        Self {
            assembly_name,
            tests,
        }
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.tests.iter().map(|record| record.identity.as_str())
    }

    pub fn get(&self, identity: &str) -> Option<&TestRecord> {
        self.tests.iter().find(|record| record.identity == identity)
    }
}

impl From<DiscoveredList> for TestGroup {
    fn from(list: DiscoveredList) -> Self {
        TestGroup::from_identities(
            list.assembly_name,
            list.test_cases.into_iter().map(|case| case.identity),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> FieldUpdate<T> {
    fn apply_to(self, slot: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Clear => *slot = None,
            FieldUpdate::Set(value) => *slot = Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub status: TestStatus,
    pub message: FieldUpdate<String>,
    pub duration: FieldUpdate<TestDuration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown test identity: {0}")]
    UnknownIdentity(TestIdentity),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: u32,
    pub unknown: u32,
    pub pending: u32,
    pub running: u32,
    pub passed: u32,
    pub failed: u32,
    pub ignored: u32,
}

impl RunSummary {
    fn count(&mut self, status: TestStatus) {
        self.total += 1;
        match status {
            TestStatus::Unknown => self.unknown += 1,
            TestStatus::Pending => self.pending += 1,
            TestStatus::Running => self.running += 1,
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Ignored => self.ignored += 1,
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.pending + self.running
    }
}

/// Owned point-in-time view of the registry, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub groups: Vec<TestGroup>,
}

impl Snapshot {
    pub fn group(&self, assembly_name: &str) -> Option<&TestGroup> {
        self.groups
            .iter()
            .find(|group| group.assembly_name == assembly_name)
    }

    pub fn record(&self, identity: &str) -> Option<&TestRecord> {
        self.groups.iter().find_map(|group| group.get(identity))
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for record in self.groups.iter().flat_map(|group| group.tests.iter()) {
            summary.count(record.status);
        }
        summary
    }
}

#[derive(Debug, Clone, Default)]
struct GroupIndex {
    assembly_name: String,
    identities: Vec<TestIdentity>,
}

/// Known tests keyed by identity, plus the ordered membership of each assembly.
///
/// Every record belongs to exactly one group. When two assemblies report the same
/// identity, the most recent discovery owns it.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: HashMap<TestIdentity, TestRecord>,
    groups: Vec<GroupIndex>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.records.contains_key(identity)
    }

    pub fn get(&self, identity: &str) -> Option<&TestRecord> {
        self.records.get(identity)
    }

    pub fn assembly_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|group| group.assembly_name.as_str())
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .flat_map(|group| group.identities.iter().map(String::as_str))
    }

    pub fn replace_all(&mut self, groups: Vec<TestGroup>) {
        self.records.clear();
        self.groups.clear();
        for group in groups {
            let assembly_name = group.assembly_name.clone();
            if self.group_position(&assembly_name).is_some() {
                debug!(
                    event = "registry_duplicate_group",
                    assembly = %assembly_name,
                    "later group replaces earlier one"
                );
            }
            self.install_group(&assembly_name, group, false);
        }
    }

    /// Swaps the membership of one assembly. Surviving identities keep their
    /// status, message and duration; new identities start as `Unknown`.
    pub fn replace_group(&mut self, assembly_name: &str, group: TestGroup) {
        self.install_group(assembly_name, group, true);
    }

    pub fn apply(&mut self, identity: &str, mutation: Mutation) -> Result<&TestRecord, RegistryError> {
        let record = self
            .records
            .get_mut(identity)
            .ok_or_else(|| RegistryError::UnknownIdentity(identity.to_string()))?;
        record.status = mutation.status;
        mutation.message.apply_to(&mut record.last_message);
        mutation.duration.apply_to(&mut record.last_duration);
        Ok(record)
    }

    pub fn group(&self, assembly_name: &str) -> Option<TestGroup> {
        let position = self.group_position(assembly_name)?;
        Some(self.materialize(&self.groups[position]))
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            groups: self
                .groups
                .iter()
                .map(|group| self.materialize(group))
                .collect(),
        }
    }

    fn group_position(&self, assembly_name: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|group| group.assembly_name == assembly_name)
    }

    fn materialize(&self, index: &GroupIndex) -> TestGroup {
        TestGroup {
            assembly_name: index.assembly_name.clone(),
            tests: index
                .identities
                .iter()
                .filter_map(|identity| self.records.get(identity).cloned())
                .collect(),
        }
    }

    fn install_group(&mut self, assembly_name: &str, group: TestGroup, preserve: bool) {
        let mut seen = HashSet::new();
        let identities: Vec<TestIdentity> = group
            .tests
            .into_iter()
            .map(|record| record.identity)
            .filter(|identity| seen.insert(identity.clone()))
            .collect();

        if let Some(position) = self.group_position(assembly_name) {
            let previous = std::mem::take(&mut self.groups[position].identities);
            for identity in previous {
                if !seen.contains(&identity) || !preserve {
                    self.records.remove(&identity);
                }
            }
        }

        for identity in &identities {
            let owned_here = self
                .records
                .get(identity)
                .map(|record| record.assembly_name == assembly_name);
            match owned_here {
                Some(true) => {}
                Some(false) => {
                    self.detach_from_other_groups(identity, assembly_name);
                    self.records.insert(
                        identity.clone(),
                        TestRecord::new(identity.clone(), assembly_name),
                    );
                }
                None => {
                    self.records.insert(
                        identity.clone(),
                        TestRecord::new(identity.clone(), assembly_name),
                    );
                }
            }
        }

        let index = GroupIndex {
            assembly_name: assembly_name.to_string(),
            identities,
        };
        match self.group_position(assembly_name) {
            Some(position) => self.groups[position] = index,
            None => self.groups.push(index),
        }
    }

    fn detach_from_other_groups(&mut self, identity: &str, assembly_name: &str) {
        for group in self
            .groups
            .iter_mut()
            .filter(|group| group.assembly_name != assembly_name)
        {
            group.identities.retain(|existing| existing != identity);
        }
    }
}
