//! Local flag overrides.
use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::{
    models::{Config, Setting, SettingValue, TryParse},
    Result,
};

/// How local overrides combine with the remote configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideBehavior {
    /// Only local values are used. The client never makes HTTP requests.
    LocalOnly,
    /// Local values win over remote ones with the same key.
    LocalOverRemote,
    /// Remote values win over local ones with the same key.
    RemoteOverLocal,
}

/// A set of locally defined settings plus the rule for combining them with the remote ones.
///
/// # Examples
/// ```
/// # use flagpole::{FlagOverrides, OverrideBehavior};
/// let overrides = FlagOverrides::from_values(
///     [("isFeatureEnabled", true.into()), ("discount", 12.5.into())],
///     OverrideBehavior::LocalOverRemote,
/// );
/// assert_eq!(overrides.keys(), vec!["discount".to_owned(), "isFeatureEnabled".to_owned()]);
/// ```
#[derive(Debug, Clone)]
pub struct FlagOverrides {
    behavior: OverrideBehavior,
    settings: HashMap<String, TryParse<Setting>>,
}

/// Simplified override file format: `{"flags": {"key": value, ...}}`.
#[derive(Deserialize)]
struct SimpleOverrides {
    flags: HashMap<String, serde_json::Value>,
}

impl FlagOverrides {
    /// Overrides serving plain values, without targeting.
    pub fn from_values<K: Into<String>>(
        values: impl IntoIterator<Item = (K, SettingValue)>,
        behavior: OverrideBehavior,
    ) -> FlagOverrides {
        let settings = values
            .into_iter()
            .map(|(key, value)| (key.into(), Setting::from_value(value).into()))
            .collect();
        FlagOverrides { behavior, settings }
    }

    /// Parse overrides from JSON text.
    ///
    /// Accepts either a complete configuration document (`{"f": {...}}`, with targeting rules)
    /// or the simplified `{"flags": {"key": value}}` format.
    pub fn from_json(json: &str, behavior: OverrideBehavior) -> Result<FlagOverrides> {
        if let Ok(simple) = serde_json::from_str::<SimpleOverrides>(json) {
            let settings = simple
                .flags
                .into_iter()
                .map(|(key, raw)| {
                    let setting = match simple_value(&raw) {
                        Some(value) => TryParse::Parsed(Setting::from_value(value)),
                        None => TryParse::ParseFailed(raw),
                    };
                    (key, setting)
                })
                .collect();
            return Ok(FlagOverrides { behavior, settings });
        }

        let config = Config::from_json(json)?;
        Ok(FlagOverrides {
            behavior,
            settings: config.settings,
        })
    }

    /// Read overrides from a JSON file. See [`FlagOverrides::from_json()`] for the format.
    pub fn from_file(path: impl AsRef<Path>, behavior: OverrideBehavior) -> Result<FlagOverrides> {
        let json = std::fs::read_to_string(path)?;
        FlagOverrides::from_json(&json, behavior)
    }

    /// The combination rule.
    pub fn behavior(&self) -> OverrideBehavior {
        self.behavior
    }

    /// Sorted keys of the local settings.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.settings.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolve `key` against the local settings and the (optional) remote document.
    pub(crate) fn lookup<'a>(
        &'a self,
        key: &str,
        remote: Option<&'a Config>,
    ) -> Option<&'a TryParse<Setting>> {
        let local = self.settings.get(key);
        let remote = || remote.and_then(|config| config.settings.get(key));
        match self.behavior {
            OverrideBehavior::LocalOnly => local,
            OverrideBehavior::LocalOverRemote => local.or_else(remote),
            OverrideBehavior::RemoteOverLocal => remote().or(local),
        }
    }

    /// Sorted union of the local keys and the keys of `remote`, per the combination rule.
    pub(crate) fn merged_keys(&self, remote: Option<&Config>) -> Vec<String> {
        let mut keys = self.keys();
        if let (Some(remote), false) = (remote, self.behavior == OverrideBehavior::LocalOnly) {
            keys.extend(remote.settings.keys().cloned());
            keys.sort();
            keys.dedup();
        }
        keys
    }
}

fn simple_value(raw: &serde_json::Value) -> Option<SettingValue> {
    Some(match raw {
        serde_json::Value::Bool(b) => SettingValue::Boolean(*b),
        serde_json::Value::String(s) => SettingValue::String(s.clone()),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SettingValue::Int(i),
            None => SettingValue::Double(n.as_f64()?),
        },
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::{FlagOverrides, OverrideBehavior};
    use crate::models::{Config, Setting, SettingValue, TryParse};

    fn remote() -> Config {
        Config::from_json(
            r#"{"f":{"shared":{"v":"remote","t":1},"remote_only":{"v":1,"t":2}}}"#,
        )
        .unwrap()
    }

    fn value_of(setting: Option<&TryParse<Setting>>) -> Option<SettingValue> {
        let setting: Option<&Setting> = setting?.into();
        let setting = setting?;
        setting.value.to_setting_value(setting.setting_type)
    }

    fn overrides(behavior: OverrideBehavior) -> FlagOverrides {
        FlagOverrides::from_values(
            [("shared", "local".into()), ("local_only", true.into())],
            behavior,
        )
    }

    #[test]
    fn local_only_ignores_remote() {
        let remote = remote();
        let overrides = overrides(OverrideBehavior::LocalOnly);
        assert_eq!(
            value_of(overrides.lookup("shared", Some(&remote))),
            Some("local".into())
        );
        assert_eq!(value_of(overrides.lookup("remote_only", Some(&remote))), None);
        assert_eq!(
            overrides.merged_keys(Some(&remote)),
            vec!["local_only".to_owned(), "shared".to_owned()]
        );
    }

    #[test]
    fn local_over_remote() {
        let remote = remote();
        let overrides = overrides(OverrideBehavior::LocalOverRemote);
        assert_eq!(
            value_of(overrides.lookup("shared", Some(&remote))),
            Some("local".into())
        );
        assert_eq!(
            value_of(overrides.lookup("remote_only", Some(&remote))),
            Some(SettingValue::Int(1))
        );
        assert_eq!(overrides.merged_keys(Some(&remote)).len(), 3);
    }

    #[test]
    fn remote_over_local() {
        let remote = remote();
        let overrides = overrides(OverrideBehavior::RemoteOverLocal);
        assert_eq!(
            value_of(overrides.lookup("shared", Some(&remote))),
            Some("remote".into())
        );
        assert_eq!(
            value_of(overrides.lookup("local_only", Some(&remote))),
            Some(true.into())
        );
        assert_eq!(
            value_of(overrides.lookup("local_only", None)),
            Some(true.into())
        );
    }

    #[test]
    fn simple_json_format() {
        let overrides = FlagOverrides::from_json(
            r#"{"flags":{"enabled":true,"name":"x","count":3,"ratio":0.5,"bad":[1]}}"#,
            OverrideBehavior::LocalOnly,
        )
        .unwrap();
        assert_eq!(value_of(overrides.lookup("enabled", None)), Some(true.into()));
        assert_eq!(value_of(overrides.lookup("count", None)), Some(SettingValue::Int(3)));
        assert_eq!(
            value_of(overrides.lookup("ratio", None)),
            Some(SettingValue::Double(0.5))
        );
        assert!(matches!(
            overrides.lookup("bad", None),
            Some(TryParse::ParseFailed(_))
        ));
    }

    #[test]
    fn full_document_format() {
        let overrides = FlagOverrides::from_json(
            include_str!("../tests/data/config/sample_v5.json"),
            OverrideBehavior::LocalOnly,
        )
        .unwrap();
        assert!(overrides.keys().contains(&"isFeatureEnabled".to_owned()));
    }
}
