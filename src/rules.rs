use std::cmp::Ordering;

use semver::{BuildMetadata, Version};
use serde::{Deserialize, Serialize};

use crate::{models::RolloutRule, sharder::sha1_hex, user::AttributeValue, User};

/// Comparison operator of a [`RolloutRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Comparator {
    /// Attribute is one of the comma separated values.
    IsOneOf,
    /// Attribute is none of the comma separated values.
    IsNotOneOf,
    /// Attribute contains the comparison value.
    Contains,
    /// Attribute does not contain the comparison value.
    NotContains,
    /// Attribute is one of the listed semantic versions.
    SemverIsOneOf,
    /// Attribute is none of the listed semantic versions.
    SemverIsNotOneOf,
    /// Attribute is a lower semantic version.
    SemverLess,
    /// Attribute is a lower or equal semantic version.
    SemverLessEquals,
    /// Attribute is a greater semantic version.
    SemverGreater,
    /// Attribute is a greater or equal semantic version.
    SemverGreaterEquals,
    /// Attribute equals the number.
    NumberEquals,
    /// Attribute differs from the number.
    NumberNotEquals,
    /// Attribute is less than the number.
    NumberLess,
    /// Attribute is less than or equal to the number.
    NumberLessEquals,
    /// Attribute is greater than the number.
    NumberGreater,
    /// Attribute is greater than or equal to the number.
    NumberGreaterEquals,
    /// SHA-1 of the attribute is one of the listed hashes.
    SensitiveIsOneOf,
    /// SHA-1 of the attribute is none of the listed hashes.
    SensitiveIsNotOneOf,
}

const COMPARATORS: [Comparator; 18] = [
    Comparator::IsOneOf,
    Comparator::IsNotOneOf,
    Comparator::Contains,
    Comparator::NotContains,
    Comparator::SemverIsOneOf,
    Comparator::SemverIsNotOneOf,
    Comparator::SemverLess,
    Comparator::SemverLessEquals,
    Comparator::SemverGreater,
    Comparator::SemverGreaterEquals,
    Comparator::NumberEquals,
    Comparator::NumberNotEquals,
    Comparator::NumberLess,
    Comparator::NumberLessEquals,
    Comparator::NumberGreater,
    Comparator::NumberGreaterEquals,
    Comparator::SensitiveIsOneOf,
    Comparator::SensitiveIsNotOneOf,
];

impl TryFrom<u8> for Comparator {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        COMPARATORS
            .get(value as usize)
            .copied()
            .ok_or_else(|| format!("unknown comparator: {value}"))
    }
}

impl From<Comparator> for u8 {
    fn from(value: Comparator) -> u8 {
        value as u8
    }
}

/// The attribute or comparison value could not be interpreted by the comparator.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub(crate) enum ComparisonError {
    #[error("{0:?} is not a valid semantic version")]
    InvalidSemver(String),
    #[error("{0:?} is not a valid decimal number")]
    InvalidNumber(String),
}

impl RolloutRule {
    /// Evaluate the rule condition against `user`.
    ///
    /// Missing attributes make the rule non-matching. `Err` means the attribute or the comparison
    /// value is malformed for this comparator; callers treat it as non-matching too.
    pub(crate) fn eval(&self, user: &User) -> Result<bool, ComparisonError> {
        self.comparator.eval(
            user.attribute(&self.comparison_attribute),
            &self.comparison_value,
        )
    }
}

impl Comparator {
    /// Apply the comparator to an attribute value.
    pub(crate) fn eval(
        self,
        attribute: Option<&AttributeValue>,
        comparison_value: &str,
    ) -> Result<bool, ComparisonError> {
        let Some(attribute) = attribute else {
            return Ok(false);
        };

        match attribute {
            AttributeValue::StringSet(items) => {
                let Some((positive, negated)) = self.set_form() else {
                    // Ordering comparators are meaningless for sets.
                    return Ok(false);
                };
                if items.is_empty() {
                    return Ok(false);
                }
                let any = items.iter().any(|item| {
                    positive
                        .eval_text(item, comparison_value)
                        .unwrap_or(false)
                });
                Ok(any != negated)
            }
            other => match other.as_text() {
                Some(text) => self.eval_text(&text, comparison_value),
                None => Ok(false),
            },
        }
    }

    /// For membership-style comparators, return the positive comparator and whether `self` is
    /// its negation.
    fn set_form(self) -> Option<(Comparator, bool)> {
        use Comparator::*;
        Some(match self {
            IsOneOf => (IsOneOf, false),
            IsNotOneOf => (IsOneOf, true),
            Contains => (Contains, false),
            NotContains => (Contains, true),
            SemverIsOneOf => (SemverIsOneOf, false),
            SemverIsNotOneOf => (SemverIsOneOf, true),
            SensitiveIsOneOf => (SensitiveIsOneOf, false),
            SensitiveIsNotOneOf => (SensitiveIsOneOf, true),
            _ => return None,
        })
    }

    fn eval_text(self, user_value: &str, comparison_value: &str) -> Result<bool, ComparisonError> {
        use Comparator::*;

        if user_value.is_empty() {
            return Ok(false);
        }

        match self {
            IsOneOf | IsNotOneOf => {
                let is_one_of = split_list(comparison_value).any(|v| v == user_value);
                Ok(is_one_of == (self == IsOneOf))
            }

            Contains => Ok(user_value.contains(comparison_value)),
            NotContains => Ok(!user_value.contains(comparison_value)),

            SemverIsOneOf | SemverIsNotOneOf => {
                let user_version = parse_semver(user_value)?;
                let mut matched = false;
                for item in split_list(comparison_value) {
                    matched |= parse_semver(item)?.cmp(&user_version) == Ordering::Equal;
                }
                Ok(matched == (self == SemverIsOneOf))
            }

            SemverLess | SemverLessEquals | SemverGreater | SemverGreaterEquals => {
                let user_version = parse_semver(user_value)?;
                let condition_version = parse_semver(comparison_value)?;
                let ordering = user_version.cmp(&condition_version);
                Ok(match self {
                    SemverLess => ordering == Ordering::Less,
                    SemverLessEquals => ordering != Ordering::Greater,
                    SemverGreater => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }

            NumberEquals | NumberNotEquals | NumberLess | NumberLessEquals | NumberGreater
            | NumberGreaterEquals => {
                let attribute_value = parse_number(user_value)?;
                let condition_value = parse_number(comparison_value)?;
                Ok(match self {
                    NumberEquals => attribute_value == condition_value,
                    NumberNotEquals => attribute_value != condition_value,
                    NumberLess => attribute_value < condition_value,
                    NumberLessEquals => attribute_value <= condition_value,
                    NumberGreater => attribute_value > condition_value,
                    _ => attribute_value >= condition_value,
                })
            }

            SensitiveIsOneOf | SensitiveIsNotOneOf => {
                let hashed = sha1_hex(user_value);
                let is_one_of = split_list(comparison_value).any(|v| v == hashed);
                Ok(is_one_of == (self == SensitiveIsOneOf))
            }
        }
    }
}

/// Comma separated list with items trimmed and empty items dropped.
fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_semver(value: &str) -> Result<Version, ComparisonError> {
    let mut version = Version::parse(value.trim())
        .map_err(|_| ComparisonError::InvalidSemver(value.to_owned()))?;
    // Build metadata does not take part in precedence.
    version.build = BuildMetadata::EMPTY;
    Ok(version)
}

fn parse_number(value: &str) -> Result<f64, ComparisonError> {
    value
        .trim()
        .replace(',', ".")
        .parse()
        .map_err(|_| ComparisonError::InvalidNumber(value.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::{Comparator, ComparisonError};
    use crate::{models::RolloutRule, user::AttributeValue, User};

    fn eval(comparator: Comparator, attribute: impl Into<AttributeValue>, value: &str) -> bool {
        comparator.eval(Some(&attribute.into()), value).unwrap()
    }

    #[test]
    fn is_one_of() {
        assert!(eval(Comparator::IsOneOf, "alice", "alice, bob"));
        assert!(eval(Comparator::IsOneOf, "bob", " alice ,bob "));
        assert!(!eval(Comparator::IsOneOf, "charlie", "alice, bob"));
        assert!(!eval(Comparator::IsOneOf, "", "alice,,bob"));
    }

    #[test]
    fn is_not_one_of() {
        assert!(!eval(Comparator::IsNotOneOf, "alice", "alice, bob"));
        assert!(eval(Comparator::IsNotOneOf, "charlie", "alice, bob"));

        // Missing attribute never matches, not even a negated comparator.
        assert!(!Comparator::IsNotOneOf.eval(None, "alice").unwrap());
    }

    #[test]
    fn is_one_of_number_attribute() {
        assert!(eval(Comparator::IsOneOf, 42.0, "41,42"));
    }

    #[test]
    fn contains() {
        assert!(eval(Comparator::Contains, "someone@example.com", "@example.com"));
        assert!(!eval(Comparator::Contains, "someone@test.com", "@example.com"));
        assert!(eval(Comparator::NotContains, "someone@test.com", "@example.com"));
        assert!(!eval(Comparator::NotContains, "someone@example.com", "@example.com"));
    }

    #[test]
    fn semver_is_one_of() {
        assert!(eval(Comparator::SemverIsOneOf, "1.0.0", "0.9.0, 1.0.0"));
        assert!(eval(Comparator::SemverIsOneOf, "1.0.0+build.3", "1.0.0"));
        assert!(!eval(Comparator::SemverIsOneOf, "1.0.1", "0.9.0, 1.0.0"));
        assert!(eval(Comparator::SemverIsNotOneOf, "1.0.1", "0.9.0, 1.0.0"));
    }

    #[test]
    fn semver_ordering() {
        assert!(eval(Comparator::SemverLess, "1.2.0", "1.10.0"));
        assert!(!eval(Comparator::SemverLess, "1.0.0", "1.0.0"));
        assert!(eval(Comparator::SemverLessEquals, "1.0.0", "1.0.0"));
        assert!(eval(Comparator::SemverGreater, "1.13.0", "1.5.0"));
        assert!(eval(Comparator::SemverGreaterEquals, "1.0.0", "1.0.0"));
        assert!(!eval(Comparator::SemverGreaterEquals, "0.9.9", "1.0.0"));
        assert!(eval(Comparator::SemverLess, "1.0.0-alpha", "1.0.0"));
    }

    #[test]
    fn invalid_semver() {
        assert_eq!(
            Comparator::SemverLess.eval(Some(&"not-a-version".into()), "1.0.0"),
            Err(ComparisonError::InvalidSemver("not-a-version".to_owned()))
        );
    }

    #[test]
    fn numbers() {
        assert!(eval(Comparator::NumberEquals, "5", "5.0"));
        assert!(eval(Comparator::NumberEquals, "5,5", "5.5"));
        assert!(eval(Comparator::NumberNotEquals, 4.0, "5"));
        assert!(eval(Comparator::NumberLess, 4.0, "5"));
        assert!(eval(Comparator::NumberLessEquals, 5.0, "5"));
        assert!(eval(Comparator::NumberGreater, 18.5, "18"));
        assert!(!eval(Comparator::NumberGreaterEquals, 17.0, "18"));
    }

    #[test]
    fn invalid_number() {
        assert!(matches!(
            Comparator::NumberLess.eval(Some(&"abc".into()), "5"),
            Err(ComparisonError::InvalidNumber(_))
        ));
    }

    #[test]
    fn sensitive() {
        let hash = "35ec787213111d373d62cba111d7011429b1b03f";
        assert!(eval(Comparator::SensitiveIsOneOf, "secret@example.com", hash));
        assert!(!eval(Comparator::SensitiveIsNotOneOf, "secret@example.com", hash));
        assert!(eval(Comparator::SensitiveIsNotOneOf, "other@example.com", hash));
    }

    #[test]
    fn string_sets() {
        let roles: &[&str] = &["admin", "beta"];
        assert!(eval(Comparator::IsOneOf, roles, "beta, gamma"));
        assert!(!eval(Comparator::IsNotOneOf, roles, "beta, gamma"));
        assert!(eval(Comparator::IsNotOneOf, roles, "gamma"));
        assert!(eval(Comparator::Contains, roles, "adm"));
        assert!(!eval(Comparator::NumberEquals, roles, "1"));
        assert!(!eval(Comparator::IsNotOneOf, Vec::<String>::new(), "gamma"));
    }

    #[test]
    fn rule_uses_named_attribute() {
        let rule = RolloutRule {
            comparison_attribute: "Email".to_owned(),
            comparator: Comparator::Contains,
            comparison_value: "@example.com".to_owned(),
            value: Some(true.into()),
            percentage_options: Vec::new(),
            variation_id: None,
        };
        let user = User::builder("id").email("someone@example.com").build();
        assert_eq!(rule.eval(&user), Ok(true));
        assert_eq!(rule.eval(&User::new("id")), Ok(false));
    }

    #[test]
    fn comparator_ids() {
        assert_eq!(Comparator::try_from(2), Ok(Comparator::Contains));
        assert_eq!(Comparator::try_from(17), Ok(Comparator::SensitiveIsNotOneOf));
        assert!(Comparator::try_from(18).is_err());
    }
}
