//! Configuration for ledger-sync.
//!
//! # Example
//!
//! ```
//! use ledger_sync::LedgerSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = LedgerSyncConfig::default();
//! assert_eq!(config.rollover_max_months, 60);
//! assert_eq!(config.balance_forward_label, "Balance Forward");
//!
//! // On-disk store, three months of rollover lookahead
//! let config = LedgerSyncConfig {
//!     local_url: Some("sqlite://ledger.db".into()),
//!     rollover_lookahead_months: 3,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for the local store, the rollover cascade and the reconciler.
///
/// Every field has a default; an empty document deserializes to
/// [`LedgerSyncConfig::default`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LedgerSyncConfig {
    /// SQLite URL (e.g. "sqlite://ledger.db"). `None` keeps the store in memory.
    #[serde(default)]
    pub local_url: Option<String>,

    /// Description written on synthesized carry-over entries
    #[serde(default = "default_balance_forward_label")]
    pub balance_forward_label: String,

    /// Older descriptions still recognized as carry-over entries
    #[serde(default = "default_legacy_balance_forward_labels")]
    pub legacy_balance_forward_labels: Vec<String>,

    /// Category written on synthesized carry-over entries
    #[serde(default = "default_category_name")]
    pub balance_forward_category: String,

    /// Name of the protected fallback category (one per kind)
    #[serde(default = "default_category_name")]
    pub default_category_name: String,

    /// Seed the default category set into an empty store
    #[serde(default = "default_true")]
    pub seed_default_categories: bool,

    /// Hard bound on months walked by one rollover run (default: 5 years)
    #[serde(default = "default_rollover_max_months")]
    pub rollover_max_months: u32,

    /// How far past the current month the cascade may write
    #[serde(default = "default_rollover_lookahead_months")]
    pub rollover_lookahead_months: u32,

    /// Purge published tombstones at the end of every sync
    #[serde(default = "default_true")]
    pub purge_after_sync: bool,

    /// Buffered change events per subscriber
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
}

fn default_balance_forward_label() -> String { "Balance Forward".into() }
fn default_legacy_balance_forward_labels() -> Vec<String> { vec!["ยอดยกมา".into()] }
fn default_category_name() -> String { "Other".into() }
fn default_true() -> bool { true }
fn default_rollover_max_months() -> u32 { 60 }
fn default_rollover_lookahead_months() -> u32 { 1 }
fn default_notify_capacity() -> usize { 64 }

impl Default for LedgerSyncConfig {
    fn default() -> Self {
        Self {
            local_url: None,
            balance_forward_label: default_balance_forward_label(),
            legacy_balance_forward_labels: default_legacy_balance_forward_labels(),
            balance_forward_category: default_category_name(),
            default_category_name: default_category_name(),
            seed_default_categories: default_true(),
            rollover_max_months: default_rollover_max_months(),
            rollover_lookahead_months: default_rollover_lookahead_months(),
            purge_after_sync: default_true(),
            notify_capacity: default_notify_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config: LedgerSyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LedgerSyncConfig::default());
        assert!(config.purge_after_sync);
        assert_eq!(config.rollover_lookahead_months, 1);
    }

    #[test]
    fn test_partial_document_overrides() {
        let config: LedgerSyncConfig = serde_json::from_str(
            r#"{"local_url": "sqlite://x.db", "rollover_max_months": 12, "default_category_name": "Misc"}"#,
        )
        .unwrap();
        assert_eq!(config.local_url.as_deref(), Some("sqlite://x.db"));
        assert_eq!(config.rollover_max_months, 12);
        assert_eq!(config.default_category_name, "Misc");
        assert_eq!(config.balance_forward_category, "Other");
    }
}
