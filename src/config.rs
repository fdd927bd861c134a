//! Runtime configuration for the standard chain and the binary.
//!
//! Values come from an optional config file, then `MDPIPE__*` environment
//! variables (nested keys separated by `__`, e.g. `MDPIPE__UPDATER__MAX_SEQUENCE_GAP`).

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::engine::types::{MessageCategory, MessageFormat, PipelineResult};
use crate::graph::NodeSpec;
use crate::market_data::extractor::ExtractorConfig;
use crate::market_data::filter::FilterConfig;
use crate::market_data::processor::{ProcessorConfig, ProcessorKind};
use crate::market_data::updater::UpdaterConfig;

pub const ENV_PREFIX: &str = "MDPIPE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source_id: String,
    pub format: MessageFormat,
    pub category: MessageCategory,
    pub inbox_capacity: usize,
    pub tick_interval_ms: u64,
    pub log_filter: String,
    // stage overrides; defaults follow format and category
    pub extractor: Option<ExtractorConfig>,
    pub filter: Option<FilterConfig>,
    pub processor: Option<ProcessorConfig>,
    pub updater: Option<UpdaterConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_id: "stdin".to_string(),
            format: MessageFormat::Json,
            category: MessageCategory::Trade,
            inbox_capacity: 1_000,
            tick_interval_ms: 50,
            log_filter: "info".to_string(),
            extractor: None,
            filter: None,
            processor: None,
            updater: None,
        }
    }
}

impl PipelineConfig {
    /// Loads the optional file at `path` and applies environment overrides.
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()?;
        let cfg: PipelineConfig = settings.try_deserialize()?;
        Ok(cfg)
    }

    pub fn connection_spec(&self) -> NodeSpec {
        NodeSpec::Connection { source_id: self.source_id.clone(), inbox_capacity: self.inbox_capacity }
    }

    pub fn extractor_spec(&self) -> NodeSpec {
        NodeSpec::Extractor(
            self.extractor.clone().unwrap_or_else(|| ExtractorConfig::for_format(self.format, self.category)),
        )
    }

    pub fn filter_spec(&self) -> NodeSpec {
        NodeSpec::Filter(self.filter.clone().unwrap_or_else(|| FilterConfig::for_category(self.category)))
    }

    pub fn processor_spec(&self) -> NodeSpec {
        NodeSpec::Processor(
            self.processor
                .clone()
                .unwrap_or_else(|| ProcessorConfig::new(ProcessorKind::new(self.format, self.category))),
        )
    }

    pub fn updater_spec(&self) -> NodeSpec {
        NodeSpec::Updater(self.updater.clone().unwrap_or_else(|| UpdaterConfig::for_category(self.category)))
    }
}
