use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::{
    consumer::DEFAULT_MAX_BATCH,
    probes::{EntryPoint, default_entry_points},
};

const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
const DEFAULT_DROP_REPORT_INTERVAL_SECS: u64 = 10;
const DEFAULT_LOCAL_SLOTS: usize = 1024;
const PAGE_SIZE: u32 = 4096;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RingSettings {
    /// Kernel ring buffer size in bytes.
    pub byte_size: Option<u32>,
    /// Slot count of the in-process ring.
    pub slots: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConsumerSettings {
    pub poll_timeout_ms: Option<u64>,
    pub max_batch: Option<usize>,
    /// 0 turns drop reporting off.
    pub drop_report_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AttachSettings {
    pub entry_points: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Line,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputSettings {
    #[serde(default)]
    pub format: OutputFormat,
    pub resolve_parent: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub ring: RingSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub attach: AttachSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl Settings {
    /// Optional YAML file first, then `EXECMON_*` environment variables
    /// (`__` between nesting levels, commas between list items).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        let s = builder
            .add_source(
                Environment::with_prefix("EXECMON")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("attach.entry_points")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.ring_byte_size()?;
        settings.entry_points()?;
        Ok(settings)
    }

    pub fn ring_byte_size(&self) -> Result<u32, ConfigError> {
        let size = self
            .ring
            .byte_size
            .unwrap_or(execmon_common::EVENTS_RING_BYTES);
        if !size.is_power_of_two() || size % PAGE_SIZE != 0 {
            return Err(ConfigError::Message(format!(
                "ring.byte_size {size} must be a power of two and a multiple of {PAGE_SIZE}"
            )));
        }
        Ok(size)
    }

    pub fn local_slots(&self) -> usize {
        self.ring.slots.unwrap_or(DEFAULT_LOCAL_SLOTS)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(
            self.consumer
                .poll_timeout_ms
                .unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
        )
    }

    pub fn max_batch(&self) -> usize {
        self.consumer.max_batch.unwrap_or(DEFAULT_MAX_BATCH)
    }

    pub fn drop_report_interval(&self) -> Option<Duration> {
        match self
            .consumer
            .drop_report_interval_secs
            .unwrap_or(DEFAULT_DROP_REPORT_INTERVAL_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Configured candidates in order, or the built-in list.
    pub fn entry_points(&self) -> Result<Vec<EntryPoint>, ConfigError> {
        match &self.attach.entry_points {
            Some(list) if !list.is_empty() => list
                .iter()
                .map(|s| s.parse().map_err(|e| ConfigError::Message(format!("{e}"))))
                .collect(),
            _ => Ok(default_entry_points()),
        }
    }
}
