//! Declarative stack documents.
//!
//! Presets and endpoints with plain-data fields can be declared in YAML and
//! loaded into the composer; middleware references appear as registry kind
//! names, with `base` splicing in the inherited chain.

use crate::chain::{ChainRef, ChainSpec};
use crate::error::{ConfigError, Result};
use crate::options::{EndpointOptions, PresetOptions, PresetRef, RetryDelay};
use crate::request_init::RequestInitPatch;
use crate::setting::Setting;
use crate::url::UrlParts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StackDoc {
    pub stack: StackMeta,
    #[serde(default)]
    pub presets: Vec<PresetDecl>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDecl>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StackMeta {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Base URL registered on the default config class.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueDecl {
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub key: Setting<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub limit: Setting<u32>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub priority: Setting<u32>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub unordered: Setting<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PresetDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub timeout_ms: Setting<u64>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub retries: Setting<u32>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub retry_delay_ms: Setting<u64>,
    #[serde(default)]
    pub queue: Option<QueueDecl>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub headers: Setting<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "RequestInitPatch::is_empty")]
    pub request_init: RequestInitPatch,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub executor: Setting<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub preprocess: Setting<Vec<String>>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub postprocess: Setting<Vec<String>>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub errorprocess: Setting<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDecl {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    /// Absolute URL or path fragment.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub method: Setting<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub preset: Setting<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub timeout_ms: Setting<u64>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub retries: Setting<u32>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub retry_delay_ms: Setting<u64>,
    #[serde(default)]
    pub queue: Option<QueueDecl>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub headers: Setting<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "RequestInitPatch::is_empty")]
    pub request_init: RequestInitPatch,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub executor: Setting<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub preprocess: Setting<Vec<String>>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub postprocess: Setting<Vec<String>>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub errorprocess: Setting<Vec<String>>,
}

pub fn parse_config(path: &Path) -> Result<StackDoc> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
    parse_config_from_str(&content)
}

pub fn parse_config_from_str(yaml: &str) -> Result<StackDoc> {
    serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn chain_from_names<M>(names: &[String]) -> ChainSpec<M> {
    ChainSpec::Many(
        names
            .iter()
            .map(|name| {
                if name == "base" {
                    ChainRef::Base
                } else {
                    ChainRef::Kind(name.clone())
                }
            })
            .collect(),
    )
}

fn chain_setting<M>(setting: &Setting<Vec<String>>) -> Setting<ChainSpec<M>> {
    match setting {
        Setting::Inherit => Setting::Inherit,
        Setting::Off => Setting::Off,
        Setting::Value(names) => Setting::Value(chain_from_names(names)),
    }
}

fn header_entries(setting: &Setting<BTreeMap<String, String>>) -> Setting<Vec<(String, String)>> {
    match setting {
        Setting::Inherit => Setting::Inherit,
        Setting::Off => Setting::Off,
        Setting::Value(map) => {
            Setting::Value(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
    }
}

fn delay_setting(setting: &Setting<u64>) -> Setting<RetryDelay> {
    match setting {
        Setting::Inherit => Setting::Inherit,
        Setting::Off => Setting::Off,
        Setting::Value(ms) => Setting::Value(RetryDelay::fixed(*ms)),
    }
}

impl PresetDecl {
    pub fn to_options<M: Clone, H: Clone>(&self) -> PresetOptions<M, H> {
        let mut options = PresetOptions::default();
        options.timeout_ms = self.timeout_ms.clone();
        options.retries = self.retries.clone();
        options.retry_delay = delay_setting(&self.retry_delay_ms);
        if let Some(queue) = &self.queue {
            options.queue_key = queue.key.clone();
            options.queue_limit = queue.limit.clone();
            options.queue_priority = queue.priority.clone();
            options.queue_unordered = queue.unordered.clone();
        }
        options.headers = header_entries(&self.headers);
        options.request_init = self.request_init.clone();
        options.executor = self.executor.clone().map(ChainRef::Kind);
        options.preprocess = chain_setting(&self.preprocess);
        options.postprocess = chain_setting(&self.postprocess);
        options.errorprocess = chain_setting(&self.errorprocess);
        options
    }
}

impl EndpointDecl {
    pub fn to_options<M: Clone, H: Clone>(&self) -> Result<EndpointOptions<M, H>> {
        let mut options = EndpointOptions::default();
        options.kind = self.kind.clone();
        if let Some(path) = &self.path {
            options.url = Some(UrlParts::parse(path)?);
        }
        options.request_init = self.request_init.clone();
        options.request_init.method = match &self.method {
            Setting::Inherit => options.request_init.method.clone(),
            other => other.clone(),
        };
        options.preset = match &self.preset {
            Setting::Inherit => Setting::Inherit,
            Setting::Off => Setting::Off,
            Setting::Value(name) => Setting::Value(PresetRef::Named(name.clone())),
        };
        options.timeout_ms = self.timeout_ms.clone();
        options.retries = self.retries.clone();
        options.retry_delay = delay_setting(&self.retry_delay_ms);
        if let Some(queue) = &self.queue {
            options.queue_key = queue.key.clone();
            options.queue_limit = queue.limit.clone();
            options.queue_priority = queue.priority.clone();
            options.queue_unordered = queue.unordered.clone();
        }
        options.headers = header_entries(&self.headers);
        options.executor = self.executor.clone().map(ChainRef::Kind);
        options.preprocess = chain_setting(&self.preprocess);
        options.postprocess = chain_setting(&self.postprocess);
        options.errorprocess = chain_setting(&self.errorprocess);
        Ok(options)
    }
}
