//! The typed config file the node loads on startup (SPEC_FULL.md §0's
//! `shardval-cli`): serde-deserialised with field defaults, following
//! teacher's `DbOptions`/`NodeConfig` convention (`deny_unknown_fields`,
//! `#[serde(default)]`, a `Default` impl carrying the operational
//! defaults). Loading/saving this file is ambient CLI concern; the
//! resulting values are handed to the core only as the opaque
//! `ValidatorManagerOptions` it already consumes.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shardval_validator::{CollatorsListEntry, SelectMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodeConfig {
    pub local_id: [u8; 32],
    pub sync_upto: u32,
    pub state_ttl_secs: u64,
    pub block_ttl_secs: u64,
    pub archive_ttl_secs: u64,
    pub key_proof_ttl_secs: u64,
    pub max_mempool_num: usize,
    pub collator_ban_secs: u64,
    pub collator_ping_cooldown_secs: u64,
    pub candidate_ttl_secs: u64,
    pub apply_block_priority: u32,
    pub handle_lru_max_size: usize,
    pub group_anticipation_secs: u64,
    pub group_destroy_grace_secs: u64,
    pub opts_hash: u32,
    pub collators: Vec<CollatorConfigEntry>,
    pub stats_interval_secs: u64,
}

/// A single shard's collator pool, the on-disk shape of
/// [`CollatorsListEntry`] (the typed version carries opaque pubkeys the
/// config file stores as hex).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollatorConfigEntry {
    /// The workchain whose full shard this entry configures. Splittable
    /// shard-prefix configuration lives in the masterchain config the
    /// validator manager reads at runtime (spec.md §4.10), not here.
    pub workchain: i32,
    pub select_mode: SelectModeConfig,
    #[serde(default)]
    pub collators: Vec<String>,
    #[serde(default)]
    pub self_collate: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectModeConfig {
    Random,
    Ordered,
    RoundRobin,
}

impl From<SelectModeConfig> for SelectMode {
    fn from(mode: SelectModeConfig) -> Self {
        match mode {
            SelectModeConfig::Random => SelectMode::Random,
            SelectModeConfig::Ordered => SelectMode::Ordered,
            SelectModeConfig::RoundRobin => SelectMode::RoundRobin,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_id: [0; 32],
            sync_upto: 0,
            state_ttl_secs: 86400 * 2,
            block_ttl_secs: 86400,
            archive_ttl_secs: 86400 * 365,
            key_proof_ttl_secs: 86400 * 365,
            max_mempool_num: 4096,
            collator_ban_secs: 300,
            collator_ping_cooldown_secs: 10,
            candidate_ttl_secs: 120,
            apply_block_priority: 253,
            handle_lru_max_size: 16,
            group_anticipation_secs: 60,
            group_destroy_grace_secs: 10,
            opts_hash: 0,
            collators: Vec::new(),
            stats_interval_secs: 30,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
    }

    pub fn collators_list(&self) -> anyhow::Result<Vec<CollatorsListEntry>> {
        self.collators
            .iter()
            .map(|entry| {
                let mut collators = Vec::with_capacity(entry.collators.len());
                for hex_id in &entry.collators {
                    let bytes = hex_decode(hex_id)
                        .with_context(|| format!("collator id {hex_id:?} must be 32 hex bytes"))?;
                    collators.push(bytes);
                }
                Ok(shardval_validator::CollatorsListEntry {
                    shard: shardval_block_util::ShardIdent::new_full(entry.workchain),
                    select_mode: entry.select_mode.into(),
                    collators,
                    self_collate: entry.self_collate,
                })
            })
            .collect()
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn block_ttl(&self) -> Duration {
        Duration::from_secs(self.block_ttl_secs)
    }

    pub fn archive_ttl(&self) -> Duration {
        Duration::from_secs(self.archive_ttl_secs)
    }

    pub fn key_proof_ttl(&self) -> Duration {
        Duration::from_secs(self.key_proof_ttl_secs)
    }

    pub fn collator_ban_duration(&self) -> Duration {
        Duration::from_secs(self.collator_ban_secs)
    }

    pub fn collator_ping_cooldown(&self) -> Duration {
        Duration::from_secs(self.collator_ping_cooldown_secs)
    }

    pub fn candidate_ttl(&self) -> Duration {
        Duration::from_secs(self.candidate_ttl_secs)
    }

    pub fn group_anticipation(&self) -> Duration {
        Duration::from_secs(self.group_anticipation_secs)
    }

    pub fn group_destroy_grace(&self) -> Duration {
        Duration::from_secs(self.group_destroy_grace_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

fn hex_decode(s: &str) -> anyhow::Result<[u8; 32]> {
    anyhow::ensure!(s.len() == 64, "expected 64 hex characters, got {}", s.len());
    let mut out = [0u8; 32];
    for (i, chunk) in out.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = NodeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_mempool_num, cfg.max_mempool_num);
        assert_eq!(back.handle_lru_max_size, cfg.handle_lru_max_size);
    }

    #[test]
    fn collators_list_rejects_malformed_hex() {
        let mut cfg = NodeConfig::default();
        cfg.collators.push(CollatorConfigEntry {
            workchain: 0,
            select_mode: SelectModeConfig::Ordered,
            collators: vec!["not-hex".to_owned()],
            self_collate: false,
        });
        assert!(cfg.collators_list().is_err());
    }
}
