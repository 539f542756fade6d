//! URL components with explicit inheritance modes.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// How a fragment's query combines with the base URL's query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Drop the base query; keep only the fragment's parameters.
    None,
    /// Base parameters with matching keys are overwritten, others kept.
    #[default]
    Set,
    /// Base parameters kept, fragment parameters appended.
    Append,
}

/// Whether a fragment without its own hash keeps the base hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    #[default]
    None,
    Inherit,
}

/// Decomposed URL: `origin` is `scheme://authority`, `path` always starts
/// with `/` when non-empty, `query` is an ordered parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UrlParts {
    pub origin: Option<String>,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub hash: Option<String>,
    pub query_mode: QueryMode,
    pub hash_mode: HashMode,
}

impl UrlParts {
    /// Parse an absolute URL.
    pub fn parse_absolute(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", input, e)))?;
        if !url.has_host() {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: absolute URL must have an authority",
                input
            )));
        }
        let origin = format!(
            "{}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.port().map(|p| format!(":{}", p)).unwrap_or_default()
        );
        Ok(Self {
            origin: Some(origin),
            path: url.path().to_string(),
            query: url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            hash: url.fragment().map(str::to_string),
            query_mode: QueryMode::default(),
            hash_mode: HashMode::default(),
        })
    }

    /// Parse a path-only fragment (`/a/b?x=1#top`), used to extend a base.
    pub fn parse_fragment(input: &str) -> Result<Self> {
        // Lean on the url crate by resolving against a throwaway base.
        let base = Url::parse("http://fragment.invalid/").expect("static base URL");
        let url = base
            .join(input)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", input, e)))?;
        // A query- or hash-only fragment must not reset the base path.
        let path = if url.path() == "/" && !input.starts_with('/') {
            String::new()
        } else {
            url.path().to_string()
        };
        Ok(Self {
            origin: None,
            path,
            query: url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            hash: url.fragment().map(str::to_string),
            query_mode: QueryMode::default(),
            hash_mode: HashMode::default(),
        })
    }

    /// Parse either form: inputs with a scheme are absolute, everything
    /// else is a fragment.
    pub fn parse(input: &str) -> Result<Self> {
        if input.contains("://") {
            Self::parse_absolute(input)
        } else {
            Self::parse_fragment(input)
        }
    }

    pub fn with_query_mode(mut self, mode: QueryMode) -> Self {
        self.query_mode = mode;
        self
    }

    pub fn with_hash_mode(mut self, mode: HashMode) -> Self {
        self.hash_mode = mode;
        self
    }

    pub fn is_absolute(&self) -> bool {
        self.origin.is_some()
    }

    /// Compose `source` onto `self`. An absolute source replaces
    /// origin/path/query/hash wholesale; a path-only source appends path
    /// segments and merges query/hash per the source's modes. A path-only
    /// source over a base without an origin is a configuration failure.
    pub fn extend(&self, source: &UrlParts) -> Result<UrlParts> {
        if source.is_absolute() {
            return Ok(source.clone());
        }
        if self.origin.is_none() {
            return Err(ConfigError::MissingBaseUrl);
        }

        let path = join_paths(&self.path, &source.path);
        let query = match source.query_mode {
            QueryMode::None => source.query.clone(),
            QueryMode::Set => {
                let mut query = self.query.clone();
                for (key, value) in &source.query {
                    if let Some(at) = query.iter().position(|(k, _)| k == key) {
                        query[at].1 = value.clone();
                    } else {
                        query.push((key.clone(), value.clone()));
                    }
                }
                query
            }
            QueryMode::Append => {
                let mut query = self.query.clone();
                query.extend(source.query.iter().cloned());
                query
            }
        };
        let hash = match (&source.hash, source.hash_mode) {
            (Some(hash), _) => Some(hash.clone()),
            (None, HashMode::Inherit) => self.hash.clone(),
            (None, HashMode::None) => None,
        };

        Ok(UrlParts {
            origin: self.origin.clone(),
            path,
            query,
            hash,
            query_mode: self.query_mode,
            hash_mode: self.hash_mode,
        })
    }

    /// Append or overwrite one query parameter.
    pub fn set_query_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(at) = self.query.iter().position(|(k, _)| *k == key) {
            self.query[at].1 = value;
        } else {
            self.query.push((key, value));
        }
    }

    /// Render the full URL. Fails when no origin was composed in.
    pub fn href(&self) -> Result<String> {
        let origin = self.origin.as_ref().ok_or(ConfigError::MissingBaseUrl)?;
        let mut url = Url::parse(origin).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        url.set_path(&self.path);
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        url.set_fragment(self.hash.as_deref());
        Ok(url.to_string())
    }
}

fn join_paths(base: &str, fragment: &str) -> String {
    if fragment.is_empty() {
        return base.to_string();
    }
    let base = base.trim_end_matches('/');
    let fragment = fragment.trim_start_matches('/');
    if fragment.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base, fragment)
}
