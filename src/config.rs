//! Engine and stage configuration.
//!
//! `JetConfig` holds the tunables of the shuffle engine and is persisted as
//! JSON. `StageConfig` and `ChannelConfiguration` describe one stage and one
//! channel; they are built elsewhere and only read here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CompressionKind;
use crate::error::{JetError, Result};
use crate::record::{
    BytewiseComparator, Combiner, HashPartitioner, KeyPrefixComparator, Partitioner, RawComparator,
    RecordFraming,
};
use crate::resource::TuningProfile;

const CONFIG_FILE: &str = "jet_config.json";

// ── Engine Config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpillConfig {
    /// Arena size of one spill buffer in bytes.
    pub buffer_size: usize,
    /// Fraction of the arena that triggers a spill.
    pub spill_threshold: f64,
    pub framing: RecordFraming,
    pub allow_record_wrapping: bool,
    pub coalesce_records: bool,
    pub compression: CompressionKind,
    pub checksum: bool,
    /// Spills needed before the combiner is re-run during the final merge.
    pub min_spills_for_combine: u32,
    pub max_merge_fan_in: usize,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024 * 1024,
            spill_threshold: 0.8,
            framing: RecordFraming::LengthPrefixed,
            allow_record_wrapping: false,
            coalesce_records: false,
            compression: CompressionKind::Deflate,
            checksum: true,
            min_spills_for_combine: 3,
            max_merge_fan_in: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    pub max_fan_in: usize,
    /// Memory storage usage fraction above which buffered inputs are
    /// purged to disk.
    pub memory_purge_trigger: f64,
    /// Purge memory inputs once more before the final pass.
    pub purge_before_final_pass: bool,
    /// How often the coordinator re-checks memory pressure while idle.
    pub poll_interval_ms: u64,
    pub compression: CompressionKind,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_fan_in: 16,
            memory_purge_trigger: 0.7,
            purge_before_final_pass: false,
            poll_interval_ms: 100,
            compression: CompressionKind::Deflate,
        }
    }
}

impl MergeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileChannelConfig {
    /// Budget shared by every in-memory download.
    pub memory_storage_bytes: u64,
    /// How long a download waits for memory before spooling to disk.
    pub memory_wait_timeout_ms: u64,
    pub max_download_retries: u32,
    pub retry_base_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// UDP port for completion broadcasts; `None` disables the listener.
    pub broadcast_port: Option<u16>,
}

impl Default for FileChannelConfig {
    fn default() -> Self {
        Self {
            memory_storage_bytes: 256 * 1024 * 1024,
            memory_wait_timeout_ms: 5_000,
            max_download_retries: 5,
            retry_base_delay_ms: 200,
            poll_interval_ms: 500,
            broadcast_port: None,
        }
    }
}

impl FileChannelConfig {
    pub fn memory_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_wait_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TcpChannelConfig {
    /// Keep destination connections open across spills.
    pub keep_alive: bool,
    pub connect_timeout_ms: u64,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            connect_timeout_ms: 10_000,
        }
    }
}

impl TcpChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Tunables of the shuffle engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JetConfig {
    pub spill: SpillConfig,
    pub merge: MergeConfig,
    pub file_channel: FileChannelConfig,
    pub tcp_channel: TcpChannelConfig,
}

impl JetConfig {
    /// Read config from a directory. Returns None if the file doesn't exist.
    pub fn read_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write config to a directory.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Defaults sized for the current machine.
    pub fn tuned() -> Self {
        Self::default().with_profile(&TuningProfile::for_host())
    }

    pub fn with_profile(mut self, profile: &TuningProfile) -> Self {
        self.spill.buffer_size = profile.spill_buffer_size;
        self.spill.max_merge_fan_in = profile.merge_fan_in;
        self.merge.max_fan_in = profile.merge_fan_in;
        self.file_channel.memory_storage_bytes = profile.memory_storage_bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.spill.buffer_size == 0 {
            return Err(JetError::Config("spill.buffer_size must be positive".into()));
        }
        if !(self.spill.spill_threshold > 0.0 && self.spill.spill_threshold <= 1.0) {
            return Err(JetError::Config("spill.spill_threshold must be in (0, 1]".into()));
        }
        if self.spill.max_merge_fan_in < 2 || self.merge.max_fan_in < 2 {
            return Err(JetError::Config("merge fan-in must be at least 2".into()));
        }
        if !(0.0..=1.0).contains(&self.merge.memory_purge_trigger) {
            return Err(JetError::Config("merge.memory_purge_trigger must be in [0, 1]".into()));
        }
        Ok(())
    }
}

// ── Stage & Channel ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    File,
    Tcp,
    Pipeline,
}

/// What the file output channel writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// Regions appended unsorted.
    #[default]
    Spill,
    /// Sorted per partition, always length-prefixed.
    SortSpill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComparerSpec {
    Bytewise,
    KeyPrefix { key_len: usize },
}

impl ComparerSpec {
    pub fn build(&self) -> Arc<dyn RawComparator> {
        match self {
            ComparerSpec::Bytewise => Arc::new(BytewiseComparator),
            ComparerSpec::KeyPrefix { key_len } => Arc::new(KeyPrefixComparator::new(*key_len)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionerSpec {
    Hash { key_len: Option<usize> },
}

impl PartitionerSpec {
    pub fn build(&self) -> Arc<dyn Partitioner> {
        match self {
            PartitionerSpec::Hash { key_len: None } => Arc::new(HashPartitioner::default()),
            PartitionerSpec::Hash { key_len: Some(n) } => Arc::new(HashPartitioner::with_key_len(*n)),
        }
    }
}

/// How partitions are spread over the tasks of the consuming stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionAssignmentMethod {
    /// Task `n` owns the `n`-th contiguous block.
    #[default]
    Linear,
    /// Task `n` owns every `task_count`-th partition starting at `n - 1`.
    Striped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfiguration {
    pub channel_type: ChannelType,
    pub output_stage: String,
    pub partitions_per_task: u32,
    #[serde(default)]
    pub disable_dynamic_partition_assignment: bool,
    #[serde(default)]
    pub partition_assignment_method: PartitionAssignmentMethod,
    pub partitioner: PartitionerSpec,
    /// Overrides the stage compression when set.
    #[serde(default)]
    pub compression: Option<CompressionKind>,
}

impl ChannelConfiguration {
    /// Partitions owned by `task_number` (1-based) out of `task_count` tasks.
    pub fn partitions_for_task(&self, task_number: u32, task_count: u32) -> Vec<u32> {
        if task_number == 0 || task_number > task_count {
            return Vec::new();
        }
        let per_task = self.partitions_per_task;
        match self.partition_assignment_method {
            PartitionAssignmentMethod::Linear => {
                let start = (task_number - 1) * per_task;
                (start..start + per_task).collect()
            }
            PartitionAssignmentMethod::Striped => (0..per_task)
                .map(|i| task_number - 1 + i * task_count)
                .collect(),
        }
    }

    pub fn partition_count(&self, task_count: u32) -> u32 {
        self.partitions_per_task * task_count
    }
}

/// Stage properties the shuffle engine consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage_id: String,
    pub comparer: ComparerSpec,
    /// Name of a registered combiner.
    #[serde(default)]
    pub combiner: Option<String>,
    pub partitions_per_task: u32,
    pub output_channel_type: ChannelType,
    #[serde(default)]
    pub output_type: OutputType,
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default)]
    pub output_prepartitioned: bool,
}

/// Combiners by name, resolved when a stage is set up.
#[derive(Default, Clone)]
pub struct CombinerRegistry {
    combiners: HashMap<String, Arc<dyn Combiner>>,
}

impl CombinerRegistry {
    pub fn register(&mut self, name: impl Into<String>, combiner: Arc<dyn Combiner>) {
        self.combiners.insert(name.into(), combiner);
    }

    pub fn resolve(&self, stage: &StageConfig) -> Result<Option<Arc<dyn Combiner>>> {
        match &stage.combiner {
            None => Ok(None),
            Some(name) => self
                .combiners
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| JetError::Config(format!("stage {} uses unknown combiner {name}", stage.stage_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::record::FnCombiner;

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        assert!(JetConfig::read_from(dir.path()).unwrap().is_none());

        let mut config = JetConfig::default();
        config.spill.compression = CompressionKind::Gzip;
        config.file_channel.broadcast_port = Some(9123);
        config.write_to(dir.path()).unwrap();

        let loaded = JetConfig::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: JetConfig = serde_json::from_str(r#"{"merge": {"max_fan_in": 4}}"#).unwrap();
        assert_eq!(config.merge.max_fan_in, 4);
        assert_eq!(config.spill, SpillConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"merge": {"max_fan_in": 1}}"#).unwrap();
        assert!(matches!(JetConfig::read_from(dir.path()), Err(JetError::Config(_))));
    }

    #[test]
    fn test_tuned_config_valid_on_this_host() {
        let config = JetConfig::tuned();
        config.validate().unwrap();
        assert_eq!(config.spill.max_merge_fan_in, config.merge.max_fan_in);
        assert!((8..=64).contains(&config.merge.max_fan_in));
        assert!((16 << 20..=256 << 20).contains(&config.spill.buffer_size));
        assert!(config.file_channel.memory_storage_bytes >= 64 << 20);
    }

    #[test]
    fn test_profile_applies_to_config() {
        let profile = TuningProfile {
            spill_buffer_size: 1 << 20,
            memory_storage_bytes: 1 << 30,
            merge_fan_in: 8,
        };
        let config = JetConfig::default().with_profile(&profile);
        assert_eq!(config.spill.buffer_size, 1 << 20);
        assert_eq!(config.merge.max_fan_in, 8);
        assert_eq!(config.file_channel.memory_storage_bytes, 1 << 30);
    }

    #[test]
    fn test_partition_assignment() {
        let mut channel = ChannelConfiguration {
            channel_type: ChannelType::File,
            output_stage: "reduce".into(),
            partitions_per_task: 3,
            disable_dynamic_partition_assignment: false,
            partition_assignment_method: PartitionAssignmentMethod::Linear,
            partitioner: PartitionerSpec::Hash { key_len: None },
            compression: None,
        };
        assert_eq!(channel.partitions_for_task(2, 4), vec![3, 4, 5]);
        channel.partition_assignment_method = PartitionAssignmentMethod::Striped;
        assert_eq!(channel.partitions_for_task(2, 4), vec![1, 5, 9]);
        assert!(channel.partitions_for_task(0, 4).is_empty());
        assert_eq!(channel.partition_count(4), 12);
    }

    #[test]
    fn test_stage_combiner_resolution() {
        let stage: StageConfig = serde_json::from_str(
            r#"{"stage_id": "count", "comparer": {"type": "key_prefix", "key_len": 8},
                "combiner": "sum", "partitions_per_task": 2, "output_channel_type": "file",
                "output_type": "sort_spill"}"#,
        )
        .unwrap();
        assert_eq!(stage.comparer, ComparerSpec::KeyPrefix { key_len: 8 });

        let mut registry = CombinerRegistry::default();
        assert!(registry.resolve(&stage).is_err());
        registry.register(
            "sum",
            Arc::new(FnCombiner::new(|g: &[&[u8]], emit: &mut dyn FnMut(&[u8]) -> Result<()>| emit(g[0]))),
        );
        assert!(registry.resolve(&stage).unwrap().is_some());
    }
}
