//! Validated primitive types shared across the homecare workspace.
//!
//! These wrappers are used wherever a blank or malformed value would otherwise
//! slip into a persisted file: template group names, mail senders and recipients,
//! operator-entered folder names.

use std::str::FromStr;

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
    /// The input does not look like a mail address
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
}

/// A string type that guarantees non-empty content.
///
/// The input is trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// Returns `Err(TextError::Empty)` if the trimmed input is empty.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl FromStr for NonEmptyText {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// A syntactically plausible mail address (`local@domain.tld`).
///
/// This is a cheap shape check for operator input, not RFC 5322 validation; the
/// SMTP layer performs the authoritative parse when a message is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }

        let (local, domain) = trimmed
            .split_once('@')
            .ok_or_else(|| TextError::InvalidEmail(trimmed.to_owned()))?;

        let domain_ok = domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && !domain.contains('@');

        if local.is_empty() || !domain_ok || trimmed.chars().any(char::is_whitespace) {
            return Err(TextError::InvalidEmail(trimmed.to_owned()));
        }

        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for EmailAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EmailAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EmailAddress::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_text_trims_input() {
        let text = NonEmptyText::new("  Vertragsmappe  ").expect("should accept padded text");
        assert_eq!(text.as_str(), "Vertragsmappe");
    }

    #[test]
    fn test_non_empty_text_rejects_whitespace() {
        assert_eq!(NonEmptyText::new("   "), Err(TextError::Empty));
    }

    #[test]
    fn test_non_empty_text_deserialize_rejects_blank() {
        let err = serde_json::from_str::<NonEmptyText>("\"  \"");
        assert!(err.is_err(), "blank string must not deserialize");
    }

    #[test]
    fn test_email_address_accepts_plain_address() {
        let email = EmailAddress::parse("buero@pflege-example.at").expect("valid address");
        assert_eq!(email.to_string(), "buero@pflege-example.at");
    }

    #[test]
    fn test_email_address_rejects_malformed() {
        for bad in ["kein-at.example", "@example.at", "a@b", "a b@example.at", "a@.at"] {
            assert!(
                matches!(EmailAddress::parse(bad), Err(TextError::InvalidEmail(_))),
                "{bad} should be rejected"
            );
        }
    }
}
