use chrono::Utc;
use runwatch_core::{
    Command, ConnectionStatus, Snapshot, TestGroup, TestStatus, Transition, ViewProjector,
};
use std::io::Write;

pub fn status_badge(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Unknown => "    ",
        TestStatus::Pending => "QUEUED",
        TestStatus::Running => "RUN",
        TestStatus::Passed => "PASS",
        TestStatus::Failed => "FAIL",
        TestStatus::Ignored => "SKIP",
    }
}

/// Line-oriented dashboard: one line per transition, indented detail for
/// failure and skip messages.
pub struct ConsoleProjector<W> {
    out: W,
}

impl<W: Write> ConsoleProjector<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_group(&mut self, group: &TestGroup) {
        let _ = writeln!(
            self.out,
            "== {} ({} tests)",
            group.assembly_name,
            group.tests.len()
        );
        for record in &group.tests {
            let _ = writeln!(
                self.out,
                "  [{:<6}] {}",
                status_badge(record.status),
                record.identity
            );
        }
    }

    fn timestamp() -> String {
        Utc::now().format("%H:%M:%S").to_string()
    }
}

impl<W: Write> ViewProjector for ConsoleProjector<W> {
    fn on_discovery(&mut self, groups: &[TestGroup]) {
        let total: usize = groups.iter().map(|group| group.tests.len()).sum();
        let _ = writeln!(
            self.out,
            "discovered {total} tests in {} assemblies",
            groups.len()
        );
        for group in groups {
            self.write_group(group);
        }
        let _ = self.out.flush();
    }

    fn on_group_replaced(&mut self, assembly_name: &str, group: &TestGroup) {
        let _ = writeln!(self.out, "rediscovered {assembly_name}");
        self.write_group(group);
        let _ = self.out.flush();
    }

    fn on_transition(&mut self, transition: &Transition) {
        let duration = transition
            .duration
            .as_ref()
            .filter(|_| transition.status.is_terminal())
            .map(|duration| format!(" ({duration})"))
            .unwrap_or_default();
        let _ = writeln!(
            self.out,
            "[{:<6}] {} :: {}{duration}",
            status_badge(transition.status),
            transition.assembly_name,
            transition.identity
        );
        if let Some(message) = transition.message.as_deref() {
            for line in message.lines() {
                let _ = writeln!(self.out, "         {line}");
            }
        }
        let _ = self.out.flush();
    }

    fn on_list_changed(&mut self, assembly_name: Option<&str>) {
        let _ = match assembly_name {
            Some(name) => writeln!(self.out, "-- test list changed for {name}; rediscovery pending"),
            None => writeln!(self.out, "-- test list changed; rediscovery pending"),
        };
        let _ = self.out.flush();
    }

    fn on_connection(&mut self, status: &ConnectionStatus) {
        let at = Self::timestamp();
        let _ = match status {
            ConnectionStatus::Opened { endpoint } => {
                writeln!(self.out, "-- {at} connected to {endpoint}")
            }
            ConnectionStatus::Closed { reason: Some(reason) } => {
                writeln!(self.out, "-- {at} disconnected: {reason}")
            }
            ConnectionStatus::Closed { reason: None } => {
                writeln!(self.out, "-- {at} disconnected")
            }
            ConnectionStatus::Errored { message } => {
                writeln!(self.out, "-- {at} connection error: {message}")
            }
        };
        let _ = self.out.flush();
    }

    fn on_command_rejected(&mut self, command: &Command, reason: &str) {
        let _ = writeln!(self.out, "!! {command} not sent: {reason}");
        let _ = self.out.flush();
    }

    fn on_summary(&mut self, snapshot: &Snapshot) {
        let summary = snapshot.summary();
        let _ = writeln!(
            self.out,
            "{} tests: {} passed, {} failed, {} ignored, {} in flight ({} running, {} queued), {} not run",
            summary.total,
            summary.passed,
            summary.failed,
            summary.ignored,
            summary.in_flight(),
            summary.running,
            summary.pending,
            summary.unknown
        );
        let _ = self.out.flush();
    }
}
