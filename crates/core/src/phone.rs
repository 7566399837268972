//! Learner phone numbers.
//!
//! The messaging provider reports senders as bare digits (`919876543210`)
//! while admins usually enter numbers with a leading `+` and separators.
//! Both normalize to the same canonical `+<digits>` form so lookups and
//! idempotency keys agree.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::value_object::ValueObject;

const MIN_DIGITS: usize = 7;
const MAX_DIGITS: usize = 15;

/// E.164-style phone number, stored as `+<digits>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        let rest = trimmed.strip_prefix('+').unwrap_or(trimmed);

        let mut digits = String::with_capacity(rest.len());
        for c in rest.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '(' | ')' | '.' => {}
                _ => {
                    return Err(DomainError::validation(format!(
                        "phone number contains invalid character '{c}'"
                    )));
                }
            }
        }

        if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
            return Err(DomainError::validation(format!(
                "phone number must have {MIN_DIGITS}-{MAX_DIGITS} digits, got {}",
                digits.len()
            )));
        }

        Ok(Self(format!("+{digits}")))
    }

    /// Canonical `+<digits>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits only, as the provider expects in the `to` field.
    pub fn digits(&self) -> &str {
        &self.0[1..]
    }
}

impl ValueObject for PhoneNumber {}

impl core::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PhoneNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_and_admin_formats_normalize_equal() {
        let from_provider = PhoneNumber::parse("919876543210").unwrap();
        let from_admin = PhoneNumber::parse("+91 98765-43210").unwrap();
        assert_eq!(from_provider, from_admin);
        assert_eq!(from_admin.as_str(), "+919876543210");
        assert_eq!(from_admin.digits(), "919876543210");
    }

    #[test]
    fn rejects_letters_and_short_numbers() {
        assert!(PhoneNumber::parse("+91abc").is_err());
        assert!(PhoneNumber::parse("12345").is_err());
        assert!(PhoneNumber::parse("").is_err());
    }

    #[test]
    fn serde_uses_canonical_string() {
        let phone = PhoneNumber::parse("900000000").unwrap();
        let json = serde_json::to_string(&phone).unwrap();
        assert_eq!(json, "\"+900000000\"");
        let back: PhoneNumber = serde_json::from_str("\"900000000\"").unwrap();
        assert_eq!(back, phone);
    }
}
