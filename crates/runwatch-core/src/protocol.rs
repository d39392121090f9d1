//! Wire format of the command channel.
//!
//! Outbound commands are tagged by `commandName`, inbound updates by a
//! case-insensitive `updateName` with a `data` payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type TestIdentity = String;

/// Keys that carry a test identity. Discovery payloads use `testCode`,
/// lifecycle payloads use `name`.
pub const IDENTITY_KEYS: [&str; 2] = ["testCode", "name"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "commandName")]
pub enum Command {
    #[serde(rename = "run all")]
    RunAll,
    #[serde(rename = "run test", rename_all = "camelCase")]
    RunTests {
        test_codes: Vec<TestIdentity>,
        assembly_name: String,
    },
    #[serde(rename = "discover all")]
    DiscoverAll,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RunAll => "run all",
            Command::RunTests { .. } => "run test",
            Command::DiscoverAll => "discover all",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::RunTests {
                test_codes,
                assembly_name,
            } => write!(
                f,
                "run test {assembly_name} [{}]",
                test_codes.join(", ")
            ),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed update: {0}")]
    Malformed(String),
    #[error("unrecognized update kind: {0}")]
    UnrecognizedKind(String),
    #[error("command encode failed: {0}")]
    Encode(String),
}

pub fn encode_command(command: &Command) -> Result<String, ProtocolError> {
    serde_json::to_string(command).map_err(|err| ProtocolError::Encode(err.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    TestSetDiscovered,
    TestListDiscovered,
    TestListChanged,
    TestStarting,
    TestPassed,
    TestFailed,
    TestIgnored,
}

impl UpdateKind {
    pub const ALL: [UpdateKind; 7] = [
        UpdateKind::TestSetDiscovered,
        UpdateKind::TestListDiscovered,
        UpdateKind::TestListChanged,
        UpdateKind::TestStarting,
        UpdateKind::TestPassed,
        UpdateKind::TestFailed,
        UpdateKind::TestIgnored,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateKind::TestSetDiscovered => "TestSetDiscovered",
            UpdateKind::TestListDiscovered => "TestListDiscovered",
            UpdateKind::TestListChanged => "TestListChanged",
            UpdateKind::TestStarting => "TestStarting",
            UpdateKind::TestPassed => "TestPassed",
            UpdateKind::TestFailed => "TestFailed",
            UpdateKind::TestIgnored => "TestIgnored",
        }
    }

    /// Server casing has varied between protocol revisions, so names match
    /// case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Starting,
    Passed,
    Failed,
    Ignored,
}

impl LifecycleKind {
    pub fn update_kind(self) -> UpdateKind {
        match self {
            LifecycleKind::Starting => UpdateKind::TestStarting,
            LifecycleKind::Passed => UpdateKind::TestPassed,
            LifecycleKind::Failed => UpdateKind::TestFailed,
            LifecycleKind::Ignored => UpdateKind::TestIgnored,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredList {
    pub assembly_name: String,
    #[serde(default)]
    pub test_cases: Vec<TestCaseRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct TestCaseRef {
    pub identity: TestIdentity,
}

impl TryFrom<Map<String, Value>> for TestCaseRef {
    type Error = String;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let identity = extract_identity(&fields).ok_or_else(missing_identity)?;
        Ok(Self { identity })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct TestReport {
    pub identity: TestIdentity,
    pub message: Option<String>,
    pub duration: Option<TestDuration>,
}

impl TryFrom<Map<String, Value>> for TestReport {
    type Error = String;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let identity = extract_identity(&fields).ok_or_else(missing_identity)?;
        let message = optional_text(&fields, "message")?;
        let duration = optional_text(&fields, "duration")?.map(TestDuration::new);
        Ok(Self {
            identity,
            message,
            duration,
        })
    }
}

/// Resolves the test identity from either of the [`IDENTITY_KEYS`], first match
/// wins. Numeric codes are accepted and rendered as text.
pub fn extract_identity(fields: &Map<String, Value>) -> Option<TestIdentity> {
    IDENTITY_KEYS.iter().find_map(|key| match fields.get(*key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value.clone()),
        Some(Value::Number(value)) => Some(value.to_string()),
        _ => None,
    })
}

fn missing_identity() -> String {
    format!("missing test identity (expected one of {IDENTITY_KEYS:?})")
}

fn optional_text(fields: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(format!("field `{key}` must be a string, got {other}")),
    }
}

/// Duration as reported by the runner. The raw text is kept for display; the
/// parsed value is present for `[d.]hh:mm:ss[.fffffff]` or plain seconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestDuration {
    raw: String,
    parsed: Option<Duration>,
}

impl TestDuration {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let parsed = parse_timespan(&raw);
        Self { raw, parsed }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn as_duration(&self) -> Option<Duration> {
        self.parsed
    }
}

impl fmt::Display for TestDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_timespan(input: &str) -> Option<Duration> {
    let value = input.trim();
    if value.is_empty() || value.starts_with('-') {
        return None;
    }
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() == 1 {
        let secs = value.parse::<f64>().ok()?;
        return Duration::try_from_secs_f64(secs).ok();
    }
    if parts.len() != 3 {
        return None;
    }
    let (days, hours) = match parts[0].split_once('.') {
        Some((days, hours)) => (days.parse::<u64>().ok()?, hours.parse::<u64>().ok()?),
        None => (0, parts[0].parse::<u64>().ok()?),
    };
    let minutes = parts[1].parse::<u64>().ok()?;
    let (seconds, nanos) = match parts[2].split_once('.') {
        Some((seconds, fraction)) => (seconds.parse::<u64>().ok()?, fraction_nanos(fraction)?),
        None => (parts[2].parse::<u64>().ok()?, 0),
    };
    if minutes >= 60 || seconds >= 60 {
        return None;
    }
    let total = days
        .checked_mul(86_400)?
        .checked_add(hours.checked_mul(3_600)?)?
        .checked_add(minutes * 60 + seconds)?;
    Some(Duration::new(total, nanos))
}

fn fraction_nanos(fraction: &str) -> Option<u32> {
    if fraction.is_empty() || !fraction.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let digits = &fraction[..fraction.len().min(9)];
    let scale = 10u32.pow(9 - digits.len() as u32);
    digits.parse::<u32>().ok().map(|value| value * scale)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    TestSetDiscovered(Vec<DiscoveredList>),
    TestListDiscovered(DiscoveredList),
    TestListChanged { assembly_name: Option<String> },
    Lifecycle {
        kind: LifecycleKind,
        report: TestReport,
    },
}

impl Update {
    pub fn kind(&self) -> UpdateKind {
        match self {
            Update::TestSetDiscovered(_) => UpdateKind::TestSetDiscovered,
            Update::TestListDiscovered(_) => UpdateKind::TestListDiscovered,
            Update::TestListChanged { .. } => UpdateKind::TestListChanged,
            Update::Lifecycle { kind, .. } => kind.update_kind(),
        }
    }
}

#[derive(Deserialize)]
struct UpdateEnvelope {
    #[serde(rename = "updateName")]
    update_name: String,
    #[serde(default)]
    data: Value,
}

pub fn decode_update(text: &str) -> Result<Update, ProtocolError> {
    let envelope: UpdateEnvelope =
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let Some(kind) = UpdateKind::from_name(&envelope.update_name) else {
        return Err(ProtocolError::UnrecognizedKind(envelope.update_name));
    };
    let data = unwrap_embedded_json(envelope.data);
    let update = match kind {
        UpdateKind::TestSetDiscovered => Update::TestSetDiscovered(payload(kind, data)?),
        UpdateKind::TestListDiscovered => Update::TestListDiscovered(payload(kind, data)?),
        UpdateKind::TestListChanged => Update::TestListChanged {
            assembly_name: changed_assembly(&data),
        },
        UpdateKind::TestStarting => lifecycle(LifecycleKind::Starting, data)?,
        UpdateKind::TestPassed => lifecycle(LifecycleKind::Passed, data)?,
        UpdateKind::TestFailed => lifecycle(LifecycleKind::Failed, data)?,
        UpdateKind::TestIgnored => lifecycle(LifecycleKind::Ignored, data)?,
    };
    Ok(update)
}

fn lifecycle(kind: LifecycleKind, data: Value) -> Result<Update, ProtocolError> {
    let report = payload(kind.update_kind(), data)?;
    Ok(Update::Lifecycle { kind, report })
}

fn payload<T: DeserializeOwned>(kind: UpdateKind, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|err| ProtocolError::Malformed(format!("{kind}: {err}")))
}

// Some server builds send `data` as a JSON document inside a string.
fn unwrap_embedded_json(data: Value) -> Value {
    let Value::String(text) = &data else {
        return data;
    };
    let trimmed = text.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return data;
    }
    serde_json::from_str(trimmed).unwrap_or(data)
}

fn changed_assembly(data: &Value) -> Option<String> {
    match data {
        Value::String(name) if !name.trim().is_empty() => Some(name.clone()),
        Value::Object(fields) => fields
            .get("assemblyName")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_serialize_to_wire_envelopes() {
        assert_eq!(
            encode_command(&Command::RunAll).expect("encode"),
            r#"{"commandName":"run all"}"#
        );
        assert_eq!(
            encode_command(&Command::DiscoverAll).expect("encode"),
            r#"{"commandName":"discover all"}"#
        );
        let run_tests = Command::RunTests {
            test_codes: vec!["T1".to_string(), "T2".to_string()],
            assembly_name: "Suite".to_string(),
        };
        let value: Value =
            serde_json::from_str(&encode_command(&run_tests).expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({"commandName": "run test", "testCodes": ["T1", "T2"], "assemblyName": "Suite"})
        );
    }

    #[test]
    fn update_names_match_case_insensitively() {
        let upper = decode_update(r#"{"updateName":"TESTPASSED","data":{"name":"T1"}}"#)
            .expect("upper");
        let lower = decode_update(r#"{"updateName":"testpassed","data":{"name":"T1"}}"#)
            .expect("lower");
        assert_eq!(upper, lower);
        assert_eq!(upper.kind(), UpdateKind::TestPassed);
    }

    #[test]
    fn identity_is_read_from_name_or_test_code() {
        let by_name = decode_update(r#"{"updateName":"TestStarting","data":{"name":"T1"}}"#)
            .expect("name");
        let by_code = decode_update(r#"{"updateName":"TestStarting","data":{"testCode":"T1"}}"#)
            .expect("testCode");
        assert_eq!(by_name, by_code);

        let discovered = decode_update(
            r#"{"updateName":"TestListDiscovered","data":{"assemblyName":"Suite","testCases":[{"testCode":"T1"},{"name":"T2"},{"testCode":7}]}}"#,
        )
        .expect("discovered");
        let Update::TestListDiscovered(list) = discovered else {
            panic!("unexpected update: {discovered:?}");
        };
        let identities: Vec<&str> = list
            .test_cases
            .iter()
            .map(|case| case.identity.as_str())
            .collect();
        assert_eq!(identities, vec!["T1", "T2", "7"]);
    }

    #[test]
    fn lifecycle_payload_carries_message_and_duration() {
        let update = decode_update(
            r#"{"updateName":"TestFailed","data":{"name":"T2","message":"assert failed","duration":"00:00:01.5000000"}}"#,
        )
        .expect("decode");
        let Update::Lifecycle { kind, report } = update else {
            panic!("unexpected update: {update:?}");
        };
        assert_eq!(kind, LifecycleKind::Failed);
        assert_eq!(report.identity, "T2");
        assert_eq!(report.message.as_deref(), Some("assert failed"));
        let duration = report.duration.expect("duration");
        assert_eq!(duration.as_str(), "00:00:01.5000000");
        assert_eq!(duration.as_duration(), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            decode_update("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_update(r#"{"data":{"name":"T1"}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_update(r#"{"updateName":"TestPassed","data":{"message":"no identity"}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_update(r#"{"updateName":"TestSetDiscovered"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_update(r#"{"updateName":"TestFailed","data":{"name":"T1","message":42}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_update_names_are_reported_separately() {
        let err = decode_update(r#"{"updateName":"TestTimedOut","data":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnrecognizedKind("TestTimedOut".to_string()));
    }

    #[test]
    fn string_encoded_data_is_unwrapped() {
        let update = decode_update(
            r#"{"updateName":"TestSetDiscovered","data":"[{\"assemblyName\":\"Suite\",\"testCases\":[{\"testCode\":\"T1\"}]}]"}"#,
        )
        .expect("decode");
        let Update::TestSetDiscovered(lists) = update else {
            panic!("unexpected update: {update:?}");
        };
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].assembly_name, "Suite");
    }

    #[test]
    fn list_changed_reads_optional_assembly() {
        let named = decode_update(r#"{"updateName":"TestListChanged","data":{"assemblyName":"Suite"}}"#)
            .expect("named");
        assert_eq!(
            named,
            Update::TestListChanged {
                assembly_name: Some("Suite".to_string())
            }
        );
        let bare = decode_update(r#"{"updateName":"testlistchanged"}"#).expect("bare");
        assert_eq!(bare, Update::TestListChanged { assembly_name: None });
    }

    #[test]
    fn timespans_parse_with_days_and_fractions() {
        assert_eq!(parse_timespan("00:00:01"), Some(Duration::from_secs(1)));
        assert_eq!(parse_timespan("01:02:03"), Some(Duration::from_secs(3_723)));
        assert_eq!(
            parse_timespan("1.00:00:00.25"),
            Some(Duration::new(86_400, 250_000_000))
        );
        assert_eq!(parse_timespan("2.5"), Some(Duration::from_millis(2_500)));
        assert_eq!(parse_timespan("00:75:00"), None);
        assert_eq!(parse_timespan("-00:00:01"), None);
        assert_eq!(parse_timespan("soon"), None);
    }
}
