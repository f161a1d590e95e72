//! Control surface: named, argument-free commands that report status text.
//!
//! ```
//! use ledger_sync::reconcile::Command;
//!
//! let command: Command = "check-connection".parse().unwrap();
//! assert_eq!(command, Command::CheckConnection);
//! assert!("rebase".parse::<Command>().is_err());
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::{CompareReport, ReconcileError, Reconciler};
use crate::remote::RemoteStore;
use crate::store::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Push,
    Pull,
    Compare,
    Sync,
    CheckConnection,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Push,
        Command::Pull,
        Command::Compare,
        Command::Sync,
        Command::CheckConnection,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Compare => "compare",
            Self::Sync => "sync",
            Self::CheckConnection => "check-connection",
        }
    }

    fn success_text(&self) -> &'static str {
        match self {
            Self::Push => "Push Success!",
            Self::Pull => "Pull Success!",
            Self::Sync => "Sync Complete!",
            Self::CheckConnection => "Connection OK",
            Self::Compare => "Compare Complete!",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown command '{0}' (expected push, pull, compare, sync or check-connection)")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// What a command reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: Command,
    pub ok: bool,
    pub status: String,
    /// Per-collection counts, for `compare`
    pub compare: Option<CompareReport>,
}

impl CommandOutcome {
    fn from_result<T>(command: Command, result: Result<T, ReconcileError>) -> Self {
        match result {
            Ok(_) => Self {
                command,
                ok: true,
                status: command.success_text().to_string(),
                compare: None,
            },
            Err(e) => Self {
                command,
                ok: false,
                status: format!("Error: {e}"),
                compare: None,
            },
        }
    }

    /// Skipped remote records still count as success but are surfaced.
    fn with_warnings(mut self, warnings: usize) -> Self {
        if self.ok && warnings > 0 {
            let plural = if warnings == 1 { "" } else { "s" };
            self.status = format!("{} ({warnings} warning{plural})", self.status);
        }
        self
    }
}

impl<L, R> Reconciler<L, R>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
{
    /// Run one control command. Failures are reported in the outcome.
    pub async fn run(&self, command: Command) -> CommandOutcome {
        match command {
            Command::Push => CommandOutcome::from_result(command, self.force_push().await),
            Command::Pull => {
                let result = self.force_pull().await;
                let warnings = result.as_ref().map_or(0, |r| r.warnings.len());
                CommandOutcome::from_result(command, result).with_warnings(warnings)
            }
            Command::Sync => {
                let result = self.sync().await;
                let warnings = result.as_ref().map_or(0, |r| r.warnings.len());
                CommandOutcome::from_result(command, result).with_warnings(warnings)
            }
            Command::CheckConnection => {
                CommandOutcome::from_result(command, self.check_connection().await)
            }
            Command::Compare => match self.compare().await {
                Ok(report) => CommandOutcome {
                    command,
                    ok: true,
                    status: report.to_string(),
                    compare: Some(report),
                },
                Err(e) => CommandOutcome {
                    command,
                    ok: false,
                    status: format!("Error Comparing: {e}"),
                    compare: None,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::LedgerSyncConfig;
    use crate::ledger::Ledger;
    use crate::record::Collection;
    use crate::remote::MemoryRemote;
    use crate::store::MemoryLocalStore;

    fn reconciler() -> Reconciler<MemoryLocalStore, MemoryRemote> {
        let ledger = Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default());
        Reconciler::new(ledger, Arc::new(MemoryRemote::new()))
    }

    #[test]
    fn test_parse_every_command() {
        for command in Command::ALL {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
        assert_eq!(" sync\n".parse::<Command>().unwrap(), Command::Sync);
        let err = "merge".parse::<Command>().unwrap_err();
        assert_eq!(err, UnknownCommand("merge".into()));
    }

    #[tokio::test]
    async fn test_status_text() {
        let reconciler = reconciler();
        assert_eq!(reconciler.run(Command::CheckConnection).await.status, "Connection OK");
        assert_eq!(reconciler.run(Command::Push).await.status, "Push Success!");
        assert_eq!(reconciler.run(Command::Pull).await.status, "Pull Success!");
        assert_eq!(reconciler.run(Command::Sync).await.status, "Sync Complete!");
    }

    #[tokio::test]
    async fn test_compare_returns_counts() {
        let reconciler = reconciler();
        reconciler.ledger().ensure_default_categories().await.unwrap();

        let outcome = reconciler.run(Command::Compare).await;
        assert!(outcome.ok);
        let counts = outcome.compare.unwrap().get(Collection::Categories);
        assert_eq!((counts.local, counts.remote), (6, 0));
        assert!(outcome.status.starts_with("categories: Local=6 / Remote=0"));
    }

    #[tokio::test]
    async fn test_skipped_remote_records_are_counted_in_status() {
        let ledger = Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default());
        let remote = MemoryRemote::with_document(serde_json::json!({
            "categories": { "bad": { "kind": 5 } }
        }));
        let reconciler = Reconciler::new(ledger, Arc::new(remote));

        let outcome = reconciler.run(Command::Sync).await;
        assert!(outcome.ok);
        assert_eq!(outcome.status, "Sync Complete! (1 warning)");

        let outcome = reconciler.run(Command::Pull).await;
        assert!(outcome.ok);
        assert_eq!(outcome.status, "Pull Success! (1 warning)");
    }

    #[tokio::test]
    async fn test_malformed_remote_reports_error() {
        let ledger = Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default());
        let remote = MemoryRemote::with_document(serde_json::json!("not a document"));
        let reconciler = Reconciler::new(ledger, Arc::new(remote));

        let outcome = reconciler.run(Command::Sync).await;
        assert!(!outcome.ok);
        assert!(outcome.status.starts_with("Error: malformed remote document"));

        let outcome = reconciler.run(Command::Compare).await;
        assert!(outcome.status.starts_with("Error Comparing:"));
    }
}
