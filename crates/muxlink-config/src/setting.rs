//! Per-field tri-state used by the composition engine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Value of one layerable configuration field.
///
/// `Inherit` leaves the underlying field untouched, `Off` clears it to
/// "none", `Value` overwrites it. In declarative documents `false` maps to
/// `Off` and an absent field to `Inherit`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Setting<T> {
    #[default]
    Inherit,
    Off,
    Value(T),
}

impl<T> Setting<T> {
    pub fn is_inherit(&self) -> bool {
        matches!(self, Setting::Inherit)
    }

    pub fn is_off(&self) -> bool {
        matches!(self, Setting::Off)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Setting::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Merge this setting into a resolved field: overwrite on `Value`,
    /// clear on `Off`, keep on `Inherit`.
    pub fn apply(&self, target: &mut Option<T>)
    where
        T: Clone,
    {
        match self {
            Setting::Inherit => {}
            Setting::Off => *target = None,
            Setting::Value(v) => *target = Some(v.clone()),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Setting<U> {
        match self {
            Setting::Inherit => Setting::Inherit,
            Setting::Off => Setting::Off,
            Setting::Value(v) => Setting::Value(f(v)),
        }
    }
}

impl<T> From<Option<T>> for Setting<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Setting::Value(v),
            None => Setting::Inherit,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Setting<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // A typed value wins over the bare `false` disable marker, so
        // boolean-typed fields still deserialize as values.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<T> {
            Value(T),
            Flag(bool),
        }
        match Raw::<T>::deserialize(deserializer)? {
            Raw::Value(v) => Ok(Setting::Value(v)),
            Raw::Flag(false) => Ok(Setting::Off),
            Raw::Flag(true) => Err(serde::de::Error::custom(
                "expected a value or `false`, got `true`",
            )),
        }
    }
}

impl<T: Serialize> Serialize for Setting<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Setting::Inherit => serializer.serialize_none(),
            Setting::Off => serializer.serialize_bool(false),
            Setting::Value(v) => v.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_semantics() {
        let mut field = Some(10u32);
        Setting::Inherit.apply(&mut field);
        assert_eq!(field, Some(10));
        Setting::Value(20u32).apply(&mut field);
        assert_eq!(field, Some(20));
        Setting::<u32>::Off.apply(&mut field);
        assert_eq!(field, None);
    }

    #[test]
    fn test_deserialize_value_off_and_absent() {
        #[derive(Deserialize, Default)]
        struct Holder {
            #[serde(default)]
            timeout: Setting<u64>,
        }
        let with_value: Holder = serde_yaml::from_str("timeout: 500").unwrap();
        assert_eq!(with_value.timeout, Setting::Value(500));

        let disabled: Holder = serde_yaml::from_str("timeout: false").unwrap();
        assert_eq!(disabled.timeout, Setting::Off);

        let absent: Holder = serde_yaml::from_str("{}").unwrap();
        assert_eq!(absent.timeout, Setting::Inherit);
    }

    #[test]
    fn test_boolean_fields_stay_values() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default)]
            unordered: Setting<bool>,
        }
        let enabled: Holder = serde_yaml::from_str("unordered: true").unwrap();
        assert_eq!(enabled.unordered, Setting::Value(true));
        let disabled: Holder = serde_yaml::from_str("unordered: false").unwrap();
        assert_eq!(disabled.unordered, Setting::Value(false));
    }

    #[test]
    fn test_true_rejected_for_non_bool() {
        #[derive(Deserialize)]
        struct Holder {
            #[allow(dead_code)]
            timeout: Setting<u64>,
        }
        assert!(serde_yaml::from_str::<Holder>("timeout: true").is_err());
    }
}
