//! TOML topology description: queue defaults, ends, edges and simulated
//! producers.

use crate::edge::EdgeParams;
use crate::ends::{EndsId, PRIO_NR};
use crate::filter::CanFilter;
use crate::frame::CAN_FRAME_MAX_DLEN;
use crate::notify::Notify;
use crate::router::{CanQueues, QueueSettings};
use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub ends: Vec<EndsConfig>,
    #[serde(default)]
    pub edge: Vec<EdgeConfig>,
    #[serde(default)]
    pub producer: Vec<ProducerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_fifo_size")]
    pub fifo_size: usize,
    #[serde(default = "default_max_data_length")]
    pub max_data_length: usize,
    /// 0 waits for consumers without bound.
    #[serde(default = "default_dispose_timeout_ms")]
    pub dispose_timeout_ms: u64,
    /// 0 disables the stats reporter.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            fifo_size: default_fifo_size(),
            max_data_length: default_max_data_length(),
            dispose_timeout_ms: default_dispose_timeout_ms(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

fn default_fifo_size() -> usize { 64 }
fn default_max_data_length() -> usize { CAN_FRAME_MAX_DLEN }
fn default_dispose_timeout_ms() -> u64 { 1000 }
fn default_stats_interval_ms() -> u64 { 1000 }

#[derive(Debug, Deserialize, Clone)]
pub struct EndsConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EdgeConfig {
    /// Producing ends
    pub from: String,
    /// Consuming ends
    pub to: String,
    #[serde(default)]
    pub prio: u8,
    /// 0 selects `general.fifo_size`
    #[serde(default)]
    pub slots: usize,
    /// 0 selects `general.max_data_length`
    #[serde(default)]
    pub dlen: usize,
    #[serde(default)]
    pub filter: CanFilter,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProducerConfig {
    pub ends: String,
    /// Identifiers sent in turn
    #[serde(default = "default_producer_ids")]
    pub ids: Vec<u32>,
    #[serde(default = "default_producer_count")]
    pub count: u64,
    #[serde(default = "default_producer_dlen")]
    pub dlen: usize,
    #[serde(default)]
    pub prio: u8,
    /// Fan each frame out to every matching edge instead of the best one.
    #[serde(default)]
    pub broadcast: bool,
}

fn default_producer_ids() -> Vec<u32> { vec![0x100] }
fn default_producer_count() -> u64 { 1000 }
fn default_producer_dlen() -> usize { 8 }

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.fifo_size == 0 {
            anyhow::bail!("fifo_size must be at least 1");
        }
        if self.general.max_data_length == 0 || self.general.max_data_length > CAN_FRAME_MAX_DLEN {
            anyhow::bail!(
                "max_data_length {} out of range 1..={}",
                self.general.max_data_length,
                CAN_FRAME_MAX_DLEN
            );
        }

        let mut names = AHashSet::new();
        for ends in &self.ends {
            if !names.insert(ends.name.as_str()) {
                anyhow::bail!("Duplicate ends name '{}'", ends.name);
            }
        }

        let mut feeding = AHashSet::new();
        for (i, edge) in self.edge.iter().enumerate() {
            for name in [&edge.from, &edge.to] {
                if !names.contains(name.as_str()) {
                    anyhow::bail!("Edge {} refers to unknown ends '{}'", i, name);
                }
            }
            if usize::from(edge.prio) >= PRIO_NR {
                anyhow::bail!("Edge {} priority {} out of range 0..{}", i, edge.prio, PRIO_NR);
            }
            if edge.dlen > CAN_FRAME_MAX_DLEN {
                anyhow::bail!("Edge {} dlen {} exceeds {}", i, edge.dlen, CAN_FRAME_MAX_DLEN);
            }
            feeding.insert(edge.from.as_str());
        }

        for (i, producer) in self.producer.iter().enumerate() {
            if !names.contains(producer.ends.as_str()) {
                anyhow::bail!("Producer {} refers to unknown ends '{}'", i, producer.ends);
            }
            if producer.dlen > CAN_FRAME_MAX_DLEN {
                anyhow::bail!("Producer {} dlen {} exceeds {}", i, producer.dlen, CAN_FRAME_MAX_DLEN);
            }
            if usize::from(producer.prio) >= PRIO_NR {
                anyhow::bail!("Producer {} priority {} out of range 0..{}", i, producer.prio, PRIO_NR);
            }
            if producer.ids.is_empty() {
                anyhow::bail!("Producer {} has no identifiers", i);
            }
            if !feeding.contains(producer.ends.as_str()) {
                tracing::warn!(
                    "Producer {} sends from ends '{}' which has no outgoing edge",
                    i,
                    producer.ends
                );
            }
        }

        Ok(())
    }

    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            default_fifo_size: self.general.fifo_size,
            default_max_data_length: self.general.max_data_length,
            dispose_timeout: match self.general.dispose_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    /// Registers every ends and connects every edge in `queues`.
    ///
    /// `listener` supplies the notification target of each ends by name.
    pub fn build<F>(&self, queues: &CanQueues, mut listener: F) -> Result<AHashMap<String, EndsId>>
    where
        F: FnMut(&str) -> Option<Arc<dyn Notify>>,
    {
        let mut ends = AHashMap::with_capacity(self.ends.len());
        for cfg in &self.ends {
            let id = queues.ends_init(cfg.name.clone(), listener(&cfg.name));
            ends.insert(cfg.name.clone(), id);
        }

        for (i, cfg) in self.edge.iter().enumerate() {
            let (Some(&from), Some(&to)) = (ends.get(&cfg.from), ends.get(&cfg.to)) else {
                anyhow::bail!("Edge {} refers to unknown ends", i);
            };
            let params = EdgeParams::new()
                .slots(cfg.slots)
                .max_data_length(cfg.dlen)
                .prio(cfg.prio)
                .filter(cfg.filter);
            let edge = queues
                .new_edge(params)
                .with_context(|| format!("Failed to create edge {}", i))?;
            queues
                .connect_edge(edge, from, to)
                .with_context(|| format!("Failed to connect edge {} ({} -> {})", i, cfg.from, cfg.to))?;
        }

        Ok(ends)
    }
}
