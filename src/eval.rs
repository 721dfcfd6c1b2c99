use std::{collections::BTreeMap, fmt::Write as _};

use chrono::{DateTime, Utc};

use crate::{
    logger::{ClientLogger, LogLevel},
    models::{PercentageOption, RolloutRule, Setting, SettingType, SettingValue, TryParse, Value},
    sharder::Sharder,
    Error, Result, User,
};

/// Rust types flag values can be requested as.
pub trait FlagValue: Sized + Clone + Send + 'static {
    /// Setting type the Rust type corresponds to.
    const SETTING_TYPE: SettingType;

    /// Extract `Self` from a typed value. `None` on type mismatch.
    fn from_setting_value(value: SettingValue) -> Option<Self>;

    /// Wrap `self` into a typed value.
    fn into_setting_value(self) -> SettingValue;
}

impl FlagValue for bool {
    const SETTING_TYPE: SettingType = SettingType::Boolean;

    fn from_setting_value(value: SettingValue) -> Option<Self> {
        value.as_bool()
    }

    fn into_setting_value(self) -> SettingValue {
        SettingValue::Boolean(self)
    }
}

impl FlagValue for String {
    const SETTING_TYPE: SettingType = SettingType::String;

    fn from_setting_value(value: SettingValue) -> Option<Self> {
        match value {
            SettingValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn into_setting_value(self) -> SettingValue {
        SettingValue::String(self)
    }
}

impl FlagValue for i64 {
    const SETTING_TYPE: SettingType = SettingType::Int;

    fn from_setting_value(value: SettingValue) -> Option<Self> {
        value.as_int()
    }

    fn into_setting_value(self) -> SettingValue {
        SettingValue::Int(self)
    }
}

impl FlagValue for f64 {
    const SETTING_TYPE: SettingType = SettingType::Double;

    fn from_setting_value(value: SettingValue) -> Option<Self> {
        value.as_double()
    }

    fn into_setting_value(self) -> SettingValue {
        SettingValue::Double(self)
    }
}

/// Outcome of evaluating a single setting.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    /// Served value.
    pub value: SettingValue,
    /// Variation id of the served value.
    pub variation_id: Option<String>,
    /// Targeting rule that matched, if any.
    pub matched_targeting_rule: Option<RolloutRule>,
    /// Percentage option the user was bucketed into, if any.
    pub matched_percentage_option: Option<PercentageOption>,
}

/// Detailed result of a flag evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationDetails<T> {
    /// Key of the evaluated flag.
    pub key: String,
    /// Evaluated value, or the caller's default on error.
    pub value: T,
    /// Variation id of the served value.
    pub variation_id: Option<String>,
    /// User the flag was evaluated for.
    pub user: Option<User>,
    /// `true` when `value` is the caller's default because evaluation failed.
    pub is_default_value: bool,
    /// Why evaluation failed.
    pub error: Option<Error>,
    /// When the configuration used for evaluation was fetched.
    pub fetch_time: Option<DateTime<Utc>>,
    /// Targeting rule that matched, if any.
    pub matched_targeting_rule: Option<RolloutRule>,
    /// Percentage option the user was bucketed into, if any.
    pub matched_percentage_option: Option<PercentageOption>,
}

impl<T> EvaluationDetails<T> {
    pub(crate) fn from_result(
        key: &str,
        value: T,
        result: EvaluationResult,
        user: Option<User>,
        fetch_time: Option<DateTime<Utc>>,
    ) -> EvaluationDetails<T> {
        EvaluationDetails {
            key: key.to_owned(),
            value,
            variation_id: result.variation_id,
            user,
            is_default_value: false,
            error: None,
            fetch_time,
            matched_targeting_rule: result.matched_targeting_rule,
            matched_percentage_option: result.matched_percentage_option,
        }
    }

    pub(crate) fn from_error(
        key: &str,
        default: T,
        error: Error,
        user: Option<User>,
        fetch_time: Option<DateTime<Utc>>,
    ) -> EvaluationDetails<T> {
        EvaluationDetails {
            key: key.to_owned(),
            value: default,
            variation_id: None,
            user,
            is_default_value: true,
            error: Some(error),
            fetch_time,
            matched_targeting_rule: None,
            matched_percentage_option: None,
        }
    }

    /// Map `value` using `f`.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> EvaluationDetails<U> {
        EvaluationDetails {
            key: self.key,
            value: f(self.value),
            variation_id: self.variation_id,
            user: self.user,
            is_default_value: self.is_default_value,
            error: self.error,
            fetch_time: self.fetch_time,
            matched_targeting_rule: self.matched_targeting_rule,
            matched_percentage_option: self.matched_percentage_option,
        }
    }
}

/// Evaluate a (possibly unparsed) setting.
///
/// `requested` is the type the caller asked for; `None` accepts any type.
pub(crate) fn eval_setting(
    key: &str,
    setting: &TryParse<Setting>,
    requested: Option<SettingType>,
    user: Option<&User>,
    sharder: &impl Sharder,
    logger: &ClientLogger,
) -> Result<EvaluationResult> {
    let TryParse::Parsed(setting) = setting else {
        return Err(Error::ConfigurationParseError(key.to_owned()));
    };

    if let Some(requested) = requested {
        if requested != setting.setting_type {
            return Err(Error::TypeMismatch {
                key: key.to_owned(),
                requested,
                actual: setting.setting_type,
            });
        }
    }

    let mut evaluate_log = logger
        .enabled(LogLevel::Info)
        .then(|| EvaluateLog::new(key, user));

    let result = setting.eval(key, user, sharder, logger, &mut evaluate_log);

    if let Some(mut evaluate_log) = evaluate_log {
        match &result {
            Ok(result) => evaluate_log.line(format_args!("Returning '{}'.", result.value)),
            Err(err) => evaluate_log.line(format_args!("Failed: {err}")),
        }
        logger.info(5000, evaluate_log.text);
    }

    result
}

impl Setting {
    fn eval(
        &self,
        key: &str,
        user: Option<&User>,
        sharder: &impl Sharder,
        logger: &ClientLogger,
        evaluate_log: &mut Option<EvaluateLog>,
    ) -> Result<EvaluationResult> {
        let Some(user) = user else {
            if !self.targeting_rules.is_empty() || !self.percentage_options.is_empty() {
                logger.warn(
                    3001,
                    format_args!(
                        "cannot evaluate targeting rules and % options for setting {key:?} \
                         (user object is missing); serving the default value"
                    ),
                );
            }
            return self.serve(key, &self.value, self.variation_id.as_deref(), None, None);
        };

        for rule in &self.targeting_rules {
            let matched = match rule.eval(user) {
                Ok(matched) => matched,
                Err(err) => {
                    logger.warn(
                        3004,
                        format_args!(
                            "cannot evaluate rule on attribute {:?} of setting {key:?}: {err}; \
                             skipping rule",
                            rule.comparison_attribute
                        ),
                    );
                    false
                }
            };

            if let Some(log) = evaluate_log {
                log.line(format_args!(
                    "Evaluating rule: [{}] [{:?}] [{}] => {}",
                    rule.comparison_attribute,
                    rule.comparator,
                    rule.comparison_value,
                    if matched { "match" } else { "no match" }
                ));
            }

            if !matched {
                continue;
            }

            if let Some(value) = &rule.value {
                return self.serve(key, value, rule.variation_id.as_deref(), Some(rule), None);
            }

            match pick_percentage_option(key, user, &rule.percentage_options, sharder) {
                Some(option) => {
                    return self.serve(
                        key,
                        &option.value,
                        option.variation_id.as_deref(),
                        Some(rule),
                        Some(option),
                    )
                }
                None => logger.warn(
                    3005,
                    format_args!("matched rule of setting {key:?} serves nothing; skipping rule"),
                ),
            }
        }

        if let Some(option) = pick_percentage_option(key, user, &self.percentage_options, sharder) {
            if let Some(log) = evaluate_log {
                log.line(format_args!(
                    "Evaluating % options => user bucketed into {}% option",
                    option.percentage
                ));
            }
            return self.serve(
                key,
                &option.value,
                option.variation_id.as_deref(),
                None,
                Some(option),
            );
        }

        self.serve(key, &self.value, self.variation_id.as_deref(), None, None)
    }

    fn serve(
        &self,
        key: &str,
        value: &Value,
        variation_id: Option<&str>,
        rule: Option<&RolloutRule>,
        option: Option<&PercentageOption>,
    ) -> Result<EvaluationResult> {
        let value = value.to_setting_value(self.setting_type).ok_or_else(|| {
            log::warn!(target: "flagpole",
                       key,
                       setting_type:debug = self.setting_type;
                       "internal: served value does not match the setting type");
            Error::ConfigurationParseError(key.to_owned())
        })?;

        Ok(EvaluationResult {
            value,
            variation_id: variation_id.map(str::to_owned),
            matched_targeting_rule: rule.cloned(),
            matched_percentage_option: option.cloned(),
        })
    }
}

/// Pick the option whose cumulative percentage first exceeds the user's bucket.
fn pick_percentage_option<'a>(
    key: &str,
    user: &User,
    options: &'a [PercentageOption],
    sharder: &impl Sharder,
) -> Option<&'a PercentageOption> {
    if options.is_empty() {
        return None;
    }

    let bucket = sharder.get_shard(format!("{key}{}", user.identifier()), 100) as f64;

    let mut cumulative = 0.0;
    options.iter().find(|option| {
        cumulative += option.percentage;
        bucket < cumulative
    })
}

/// Human readable trace of a single evaluation, emitted at info level.
struct EvaluateLog {
    text: String,
}

impl EvaluateLog {
    fn new(key: &str, user: Option<&User>) -> EvaluateLog {
        let text = match user {
            Some(user) => {
                let attributes: BTreeMap<_, _> = user.attributes().iter().collect();
                format!("Evaluating '{key}' for user {attributes:?}")
            }
            None => format!("Evaluating '{key}'"),
        };
        EvaluateLog { text }
    }

    fn line(&mut self, line: std::fmt::Arguments<'_>) {
        let _ = write!(self.text, "\n  {line}");
    }
}
