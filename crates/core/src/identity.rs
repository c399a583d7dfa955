//! Identity values carried by the contact sync stream.
//!
//! An [`Aci`] is the stable, account-level identifier and is always preferred
//! over an [`E164`] phone number when merging remote records into local state.

use std::collections::BTreeSet;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Account identifier (stable service identity).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Aci(Uuid);

impl Aci {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for Aci {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Aci {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s.trim())
            .map_err(|e| DomainError::invalid_id(format!("Aci: {e}")))?;
        if uuid.is_nil() {
            return Err(DomainError::invalid_id("Aci: nil uuid"));
        }
        Ok(Self(uuid))
    }
}

impl TryFrom<String> for Aci {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Aci> for String {
    fn from(value: Aci) -> Self {
        value.0.to_string()
    }
}

/// Phone number in E.164 form (`+` followed by 7 to 15 digits, no leading zero).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct E164(String);

impl E164 {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let value = value.trim();
        let digits = value
            .strip_prefix('+')
            .ok_or_else(|| DomainError::validation("phone number must start with '+'"))?;

        if !(7..=15).contains(&digits.len()) {
            return Err(DomainError::validation(format!(
                "phone number must have 7-15 digits (found {})",
                digits.len()
            )));
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation("phone number must contain only digits"));
        }
        if digits.starts_with('0') {
            return Err(DomainError::validation("country code cannot start with 0"));
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for E164 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for E164 {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for E164 {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<E164> for String {
    fn from(value: E164) -> Self {
        value.0
    }
}

/// Identifiers of the registered local user.
///
/// A local account may be reachable through more than one phone number; every
/// one of them counts as "self" for reconciliation purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentifiers {
    aci: Aci,
    phone_numbers: BTreeSet<E164>,
}

impl LocalIdentifiers {
    pub fn new(aci: Aci, phone_number: E164) -> Self {
        Self {
            aci,
            phone_numbers: BTreeSet::from([phone_number]),
        }
    }

    pub fn with_phone_number(mut self, phone_number: E164) -> Self {
        self.phone_numbers.insert(phone_number);
        self
    }

    pub fn aci(&self) -> Aci {
        self.aci
    }

    pub fn phone_numbers(&self) -> &BTreeSet<E164> {
        &self.phone_numbers
    }

    pub fn contains_phone_number(&self, phone_number: &E164) -> bool {
        self.phone_numbers.contains(phone_number)
    }

    /// Whether either half of a remote identity refers to the local user.
    pub fn matches(&self, aci: Option<&Aci>, phone_number: Option<&E164>) -> bool {
        aci.is_some_and(|aci| *aci == self.aci)
            || phone_number.is_some_and(|p| self.contains_phone_number(p))
    }
}
