//! Status-store key grammar and change notifications.
//!
//! Run fields are stored under `run.<name>.<suffix>`. The run name never
//! contains a dot; the suffix may (`allocate.timeout`, `method.name`).

use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Prefix shared by every run-scoped key.
pub const RUN_KEY_PREFIX: &str = "run.";

/// Known run field suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunKeySuffix {
    Status,
    InterruptReason,
    InterruptedAt,
    ArchiveActions,
    ArchiveRunId,
    Result,
    Finished,
    Queued,
    Allocated,
    AllocateTimeout,
    Controller,
    Heartbeat,
    Local,
    Trace,
}

impl RunKeySuffix {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKeySuffix::Status => "status",
            RunKeySuffix::InterruptReason => "interruptReason",
            RunKeySuffix::InterruptedAt => "interruptedAt",
            RunKeySuffix::ArchiveActions => "rasActions",
            RunKeySuffix::ArchiveRunId => "rasrunid",
            RunKeySuffix::Result => "result",
            RunKeySuffix::Finished => "finished",
            RunKeySuffix::Queued => "queued",
            RunKeySuffix::Allocated => "allocated",
            RunKeySuffix::AllocateTimeout => "allocate.timeout",
            RunKeySuffix::Controller => "controller",
            RunKeySuffix::Heartbeat => "heartbeat",
            RunKeySuffix::Local => "local",
            RunKeySuffix::Trace => "trace",
        }
    }

    const ALL: [RunKeySuffix; 14] = [
        RunKeySuffix::Status,
        RunKeySuffix::InterruptReason,
        RunKeySuffix::InterruptedAt,
        RunKeySuffix::ArchiveActions,
        RunKeySuffix::ArchiveRunId,
        RunKeySuffix::Result,
        RunKeySuffix::Finished,
        RunKeySuffix::Queued,
        RunKeySuffix::Allocated,
        RunKeySuffix::AllocateTimeout,
        RunKeySuffix::Controller,
        RunKeySuffix::Heartbeat,
        RunKeySuffix::Local,
        RunKeySuffix::Trace,
    ];
}

impl std::fmt::Display for RunKeySuffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunKeySuffix {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunKeySuffix::ALL
            .iter()
            .find(|suffix| suffix.as_str() == s)
            .copied()
            .ok_or_else(|| RunError::UnknownSuffix(s.to_string()))
    }
}

/// Build the status-store key for a run field.
pub fn run_key(run_name: &str, suffix: RunKeySuffix) -> String {
    format!("{RUN_KEY_PREFIX}{run_name}.{}", suffix.as_str())
}

/// A parsed run-scoped key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKey {
    pub run_name: String,
    pub suffix: String,
}

impl RunKey {
    /// Parse `run.<name>.<suffix>`. Returns `None` for anything else.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(RUN_KEY_PREFIX)?;
        let (run_name, suffix) = rest.split_once('.')?;
        if run_name.is_empty() || suffix.is_empty() {
            return None;
        }
        Some(Self {
            run_name: run_name.to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn known_suffix(&self) -> Option<RunKeySuffix> {
        self.suffix.parse().ok()
    }
}

/// Kind of change reported by a status-store watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    New,
    Modified,
    Delete,
}

impl std::fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchEventType::New => write!(f, "NEW"),
            WatchEventType::Modified => write!(f, "MODIFIED"),
            WatchEventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A raw change notification as delivered by the status store.
///
/// Every field is optional because the store makes no promises about the
/// shape of notifications for keys outside the run namespace.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusChange {
    pub key: Option<String>,
    pub event_type: Option<WatchEventType>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl StatusChange {
    pub fn new(
        key: impl Into<String>,
        event_type: WatchEventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            event_type: Some(event_type),
            old_value,
            new_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_run_key_format() {
        assert_eq!(run_key("U2345", RunKeySuffix::Status), "run.U2345.status");
        assert_eq!(
            run_key("U2345", RunKeySuffix::ArchiveActions),
            "run.U2345.rasActions"
        );
    }

    #[test]
    fn test_parse_dotted_suffix() {
        let key = RunKey::parse("run.U7.allocate.timeout").unwrap();
        assert_eq!(key.run_name, "U7");
        assert_eq!(key.known_suffix(), Some(RunKeySuffix::AllocateTimeout));
    }

    #[rstest]
    #[case("run.U2345xstatus")]
    #[case("somethingWhichFailsTheRegexWithNoRunId")]
    #[case("run..status")]
    #[case("run.U1.")]
    #[case("framework.run.U1.status")]
    #[case("")]
    fn test_parse_rejects(#[case] raw: &str) {
        assert_eq!(RunKey::parse(raw), None);
    }

    #[test]
    fn test_unknown_suffix_is_kept() {
        let key = RunKey::parse("run.U1.method.total.extra").unwrap();
        assert_eq!(key.suffix, "method.total.extra");
        assert_eq!(key.known_suffix(), None);
    }

    proptest! {
        #[test]
        fn parse_never_yields_dotted_run_names(key in ".*") {
            if let Some(parsed) = RunKey::parse(&key) {
                prop_assert!(!parsed.run_name.contains('.'));
                prop_assert!(!parsed.run_name.is_empty());
                prop_assert!(!parsed.suffix.is_empty());
            }
        }
    }
}
