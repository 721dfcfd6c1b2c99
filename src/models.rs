//! Wire model of the configuration document.
//!
//! Field names follow the compact JSON served by the CDN (`f` for flags, `v` for value, etc.).
use std::{collections::HashMap, fmt};

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::rules::Comparator;

/// Parsed configuration document (`config_v5.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data governance preferences used for CDN redirects.
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Preferences>,
    /// Flag key to setting.
    #[serde(rename = "f", default)]
    pub settings: HashMap<String, TryParse<Setting>>,
}

impl Config {
    /// Parse a configuration document from JSON text.
    pub fn from_json(json: &str) -> serde_json::Result<Config> {
        serde_json::from_str(json)
    }

    /// Keys of all settings, including ones that failed to parse.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.settings.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed; holds the raw JSON.
    ParseFailed(serde_json::Value),
}

impl<T> From<T> for TryParse<T> {
    fn from(value: T) -> TryParse<T> {
        TryParse::Parsed(value)
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// CDN preferences embedded into the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    /// Base URL the config should be fetched from.
    #[serde(rename = "u", default)]
    pub base_url: Option<String>,
    /// How the client should react to `base_url` differing from the one it used.
    #[serde(rename = "r", default)]
    pub redirect: RedirectMode,
}

/// Redirect mode carried in [`Preferences`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RedirectMode {
    /// Remember the new URL for subsequent fetches.
    #[default]
    NoRedirect,
    /// Re-fetch from the new URL and warn about the data governance mismatch.
    ShouldRedirect,
    /// Re-fetch from the new URL, even if a custom base URL is configured.
    ForceRedirect,
}

impl TryFrom<u8> for RedirectMode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(RedirectMode::NoRedirect),
            1 => Ok(RedirectMode::ShouldRedirect),
            2 => Ok(RedirectMode::ForceRedirect),
            other => Err(format!("unknown redirect mode: {other}")),
        }
    }
}

impl From<RedirectMode> for u8 {
    fn from(value: RedirectMode) -> u8 {
        value as u8
    }
}

/// A feature flag or setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    /// Default value, served when no rule matches.
    #[serde(rename = "v")]
    pub value: Value,
    /// Declared value type.
    #[serde(rename = "t")]
    pub setting_type: SettingType,
    /// Percentage options, evaluated when no targeting rule matches.
    #[serde(rename = "p", default)]
    pub percentage_options: Vec<PercentageOption>,
    /// Targeting rules in evaluation order.
    #[serde(rename = "r", default)]
    pub targeting_rules: Vec<RolloutRule>,
    /// Variation id of the default value.
    #[serde(rename = "i", default)]
    pub variation_id: Option<String>,
}

impl Setting {
    /// Build a rule-less setting serving `value`. Used for local overrides.
    pub fn from_value(value: SettingValue) -> Setting {
        Setting {
            setting_type: value.setting_type(),
            value: value.into(),
            percentage_options: Vec::new(),
            targeting_rules: Vec::new(),
            variation_id: None,
        }
    }

    /// Iterate over every (variation id, value) pair served by this setting.
    pub(crate) fn variations(&self) -> impl Iterator<Item = (Option<&str>, &Value)> {
        let rules = self.targeting_rules.iter().flat_map(|rule| {
            let served = rule
                .value
                .as_ref()
                .map(|value| (rule.variation_id.as_deref(), value));
            served.into_iter().chain(
                rule.percentage_options
                    .iter()
                    .map(|option| (option.variation_id.as_deref(), &option.value)),
            )
        });
        std::iter::once((self.variation_id.as_deref(), &self.value))
            .chain(rules)
            .chain(
                self.percentage_options
                    .iter()
                    .map(|option| (option.variation_id.as_deref(), &option.value)),
            )
    }
}

/// Value type declared by a [`Setting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SettingType {
    /// On/off flag.
    Boolean,
    /// Text setting.
    String,
    /// Whole number setting.
    Int,
    /// Decimal number setting.
    Double,
}

impl TryFrom<u8> for SettingType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(SettingType::Boolean),
            1 => Ok(SettingType::String),
            2 => Ok(SettingType::Int),
            3 => Ok(SettingType::Double),
            other => Err(format!("unknown setting type: {other}")),
        }
    }
}

impl From<SettingType> for u8 {
    fn from(value: SettingType) -> u8 {
        value as u8
    }
}

/// Untyped value as it appears in the document.
///
/// Unlike [`SettingValue`], `Value` is untagged, so we don't know the exact type until we combine
/// it with [`SettingType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum Value {
    /// JSON boolean.
    Boolean(bool),
    /// JSON number; maps to [`SettingValue::Int`] or [`SettingValue::Double`].
    Number(f64),
    /// JSON string.
    String(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl Value {
    /// Interpret the value as `setting_type`. Returns `None` on mismatch.
    pub fn to_setting_value(&self, setting_type: SettingType) -> Option<SettingValue> {
        Some(match (self, setting_type) {
            (Value::Boolean(b), SettingType::Boolean) => SettingValue::Boolean(*b),
            (Value::String(s), SettingType::String) => SettingValue::String(s.clone()),
            (Value::Number(n), SettingType::Int) if n.fract() == 0.0 => {
                SettingValue::Int(*n as i64)
            }
            (Value::Number(n), SettingType::Double) => SettingValue::Double(*n),
            _ => return None,
        })
    }
}

impl From<SettingValue> for Value {
    fn from(value: SettingValue) -> Value {
        match value {
            SettingValue::Boolean(b) => Value::Boolean(b),
            SettingValue::String(s) => Value::String(s),
            SettingValue::Int(i) => Value::Number(i as f64),
            SettingValue::Double(d) => Value::Number(d),
        }
    }
}

/// A typed flag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum SettingValue {
    /// Boolean value.
    Boolean(bool),
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
}

impl SettingValue {
    /// Type of the value.
    pub fn setting_type(&self) -> SettingType {
        match self {
            SettingValue::Boolean(_) => SettingType::Boolean,
            SettingValue::String(_) => SettingType::String,
            SettingValue::Int(_) => SettingType::Int,
            SettingValue::Double(_) => SettingType::Double,
        }
    }

    /// Returns the boolean if this is a boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the string if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the number if this is a floating point value.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            SettingValue::Double(d) => Some(*d),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Boolean(b) => write!(f, "{b}"),
            SettingValue::String(s) => write!(f, "{s}"),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::Double(d) => write!(f, "{d}"),
        }
    }
}

/// A targeting rule: a single attribute comparison plus what it serves when matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRule {
    /// Name of the user attribute to compare.
    #[serde(rename = "a")]
    pub comparison_attribute: String,
    /// Comparison operator.
    #[serde(rename = "t")]
    pub comparator: Comparator,
    /// Value the attribute is compared against.
    #[serde(rename = "c", default)]
    pub comparison_value: String,
    /// Value served when the rule matches.
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Nested percentage options, evaluated when the rule matches and serves no value.
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    pub percentage_options: Vec<PercentageOption>,
    /// Variation id of the served value.
    #[serde(rename = "i", default)]
    pub variation_id: Option<String>,
}

/// A percentage option of a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentageOption {
    /// Value served to users bucketed into this option.
    #[serde(rename = "v")]
    pub value: Value,
    /// Share of users (0-100).
    #[serde(rename = "p")]
    pub percentage: f64,
    /// Variation id of the served value.
    #[serde(rename = "i", default)]
    pub variation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{Config, SettingType, SettingValue, TryParse, Value};

    #[test]
    fn parse_sample_config() {
        let config = Config::from_json(include_str!("../tests/data/config/sample_v5.json"))
            .expect("sample config should parse");
        assert!(config.preferences.is_some());
        assert!(config.keys().contains(&"isFeatureEnabled".to_owned()));
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let config = Config::from_json(
            r#"
              {
                "f": {
                  "success": { "v": true, "t": 0 },
                  "fail_parsing": { "v": true, "t": 42 },
                  "bad_comparator": {
                    "v": "x", "t": 1,
                    "r": [ { "a": "Email", "t": 99, "c": "a", "v": "y" } ]
                  }
                }
              }
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.settings.get("success").unwrap(),
            TryParse::Parsed(_)
        ));
        assert!(matches!(
            config.settings.get("fail_parsing").unwrap(),
            TryParse::ParseFailed(_)
        ));
        assert!(matches!(
            config.settings.get("bad_comparator").unwrap(),
            TryParse::ParseFailed(_)
        ));
    }

    #[test]
    fn value_to_setting_value() {
        assert_eq!(
            Value::Number(42.0).to_setting_value(SettingType::Int),
            Some(SettingValue::Int(42))
        );
        assert_eq!(Value::Number(4.2).to_setting_value(SettingType::Int), None);
        assert_eq!(
            Value::Number(4.2).to_setting_value(SettingType::Double),
            Some(SettingValue::Double(4.2))
        );
        assert_eq!(Value::Boolean(true).to_setting_value(SettingType::String), None);
    }
}
