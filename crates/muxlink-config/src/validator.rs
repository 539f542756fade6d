use crate::error::{ConfigError, Result};
use crate::parser::StackDoc;
use crate::setting::Setting;
use std::collections::HashSet;

pub fn validate_doc(doc: &StackDoc) -> Result<()> {
    if doc.stack.name.is_empty() {
        return Err(ConfigError::ValidationError("stack name must be non-empty".into()));
    }

    let mut preset_names = HashSet::new();
    for preset in &doc.presets {
        if preset.name.is_empty() {
            return Err(ConfigError::ValidationError("preset name must be non-empty".into()));
        }
        if !preset_names.insert(preset.name.as_str()) {
            return Err(ConfigError::DuplicateKind(preset.name.clone()));
        }
    }

    let mut endpoint_names = HashSet::new();
    for endpoint in &doc.endpoints {
        if endpoint.name.is_empty() {
            return Err(ConfigError::ValidationError("endpoint name must be non-empty".into()));
        }
        if !endpoint_names.insert(endpoint.name.as_str()) {
            return Err(ConfigError::DuplicateKind(endpoint.name.clone()));
        }
        // Named presets must be declared in the same document.
        if let Setting::Value(name) = &endpoint.preset {
            if !preset_names.contains(name.as_str()) {
                return Err(ConfigError::InvalidPreset(name.clone()));
            }
        }
        if let Some(queue) = &endpoint.queue {
            if queue.limit == Setting::Value(0) {
                return Err(ConfigError::ValidationError(format!(
                    "endpoint {}: queue limit must be positive",
                    endpoint.name
                )));
            }
        }
    }

    Ok(())
}
