use std::collections::{BTreeSet, HashMap};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Evaluation context: describes the user a flag is evaluated for.
///
/// A `User` is immutable once built. The identifier doubles as the `Identifier` attribute and is
/// the input for percentage rollout bucketing.
///
/// # Examples
/// ```
/// # use flagpole::User;
/// let user = User::builder("user-42")
///     .email("someone@example.com")
///     .country("Hungary")
///     .custom("SubscriptionType", "Pro")
///     .custom("Age", 31.0)
///     .build();
/// assert_eq!(user.identifier(), "user-42");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    identifier: String,
    attributes: HashMap<String, AttributeValue>,
}

/// Name of the identifier attribute.
pub const IDENTIFIER_ATTRIBUTE: &str = "Identifier";
/// Name of the email attribute.
pub const EMAIL_ATTRIBUTE: &str = "Email";
/// Name of the country attribute.
pub const COUNTRY_ATTRIBUTE: &str = "Country";

impl User {
    /// Create a user with only an identifier.
    pub fn new(identifier: impl Into<String>) -> User {
        User::builder(identifier).build()
    }

    /// Start building a user with the given identifier.
    pub fn builder(identifier: impl Into<String>) -> UserBuilder {
        UserBuilder {
            identifier: identifier.into(),
            attributes: HashMap::new(),
        }
    }

    /// The user identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Look up an attribute by name. `Identifier` resolves to the user identifier.
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// All attributes, including the well-known ones.
    pub fn attributes(&self) -> &HashMap<String, AttributeValue> {
        &self.attributes
    }
}

/// Builder for [`User`].
#[derive(Debug, Clone)]
pub struct UserBuilder {
    identifier: String,
    attributes: HashMap<String, AttributeValue>,
}

impl UserBuilder {
    /// Set the `Email` attribute.
    pub fn email(self, email: impl Into<String>) -> Self {
        self.custom(EMAIL_ATTRIBUTE, email.into())
    }

    /// Set the `Country` attribute.
    pub fn country(self, country: impl Into<String>) -> Self {
        self.custom(COUNTRY_ATTRIBUTE, country.into())
    }

    /// Set a custom attribute. Setting `Identifier` here has no effect.
    pub fn custom(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        let name = name.into();
        if name != IDENTIFIER_ATTRIBUTE {
            self.attributes.insert(name, value.into());
        }
        self
    }

    /// Finish building.
    pub fn build(mut self) -> User {
        self.attributes.insert(
            IDENTIFIER_ATTRIBUTE.to_owned(),
            AttributeValue::String(self.identifier.clone()),
        );
        User {
            identifier: self.identifier,
            attributes: self.attributes,
        }
    }
}

/// Value of a user attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, and string sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Text value.
    String(String),
    /// Numeric value.
    Number(f64),
    /// Set of strings (e.g., roles or tags).
    StringSet(BTreeSet<String>),
}

impl AttributeValue {
    /// Text form used by text, semver and number comparators. `None` for sets.
    pub(crate) fn as_text(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(n) => Some(n.to_string()),
            AttributeValue::StringSet(_) => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringSet(value.into_iter().collect())
    }
}

impl From<&[&str]> for AttributeValue {
    fn from(value: &[&str]) -> Self {
        Self::StringSet(value.iter().map(|s| (*s).to_owned()).collect())
    }
}
