//! Fetch-style base request options.

use crate::setting::Setting;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    Default,
    NoStore,
    Reload,
    NoCache,
    ForceCache,
    OnlyIfCached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    Omit,
    SameOrigin,
    Include,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorsMode {
    SameOrigin,
    Cors,
    NoCors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    High,
    Low,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    Follow,
    Error,
    Manual,
}

/// Immutable base options attached to a resolved endpoint. The HTTP method
/// lives here as well so one endpoint fully describes its native request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestInit {
    pub method: Option<String>,
    pub cache: Option<CacheMode>,
    pub credentials: Option<CredentialsMode>,
    pub integrity: Option<String>,
    pub keepalive: Option<bool>,
    pub mode: Option<CorsMode>,
    pub priority: Option<RequestPriority>,
    pub redirect: Option<RedirectMode>,
    pub referrer: Option<String>,
    pub referrer_policy: Option<String>,
}

impl RequestInit {
    /// Merge a patch into this init. Fields the patch inherits are kept,
    /// explicit-off fields are cleared, values overwrite.
    pub fn extend(&mut self, patch: &RequestInitPatch) {
        patch.method.apply(&mut self.method);
        patch.cache.apply(&mut self.cache);
        patch.credentials.apply(&mut self.credentials);
        patch.integrity.apply(&mut self.integrity);
        patch.keepalive.apply(&mut self.keepalive);
        patch.mode.apply(&mut self.mode);
        patch.priority.apply(&mut self.priority);
        patch.redirect.apply(&mut self.redirect);
        patch.referrer.apply(&mut self.referrer);
        patch.referrer_policy.apply(&mut self.referrer_policy);
    }

    /// Re-express this init as a patch that recreates it from scratch.
    pub fn as_patch(&self) -> RequestInitPatch {
        RequestInitPatch {
            method: self.method.clone().into(),
            cache: self.cache.into(),
            credentials: self.credentials.into(),
            integrity: self.integrity.clone().into(),
            keepalive: self.keepalive.into(),
            mode: self.mode.into(),
            priority: self.priority.into(),
            redirect: self.redirect.into(),
            referrer: self.referrer.clone().into(),
            referrer_policy: self.referrer_policy.clone().into(),
            headers: Setting::Inherit,
        }
    }
}

/// Layerable request-init options. `headers` declared here are promoted
/// into the headers channel by the composer; the headers channel applies
/// last and wins.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestInitPatch {
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub method: Setting<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub cache: Setting<CacheMode>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub credentials: Setting<CredentialsMode>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub integrity: Setting<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub keepalive: Setting<bool>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub mode: Setting<CorsMode>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub priority: Setting<RequestPriority>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub redirect: Setting<RedirectMode>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub referrer: Setting<String>,
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub referrer_policy: Setting<String>,
    /// Headers carried inside request-init, promoted by the composer.
    #[serde(default, skip_serializing_if = "Setting::is_inherit")]
    pub headers: Setting<Vec<(String, String)>>,
}

impl RequestInitPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
