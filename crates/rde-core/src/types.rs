//! Core domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::IdentifierError;

/// Identifier of a workload agent: `user-{owner}-{name}`
///
/// The hyphen after `user` and after the owner are separators, so the owner
/// segment itself may not contain one (`[a-z0-9]+`). The name may contain
/// inner hyphens. The whole identifier is a DNS label because it names the
/// workload and is used as a subdomain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    pub const PREFIX: &'static str = "user-";
    pub const MAX_LEN: usize = 63;

    /// Parse and validate an identifier
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        if raw.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if raw.len() > Self::MAX_LEN {
            return Err(IdentifierError::TooLong(raw.len()));
        }
        let rest = raw
            .strip_prefix(Self::PREFIX)
            .ok_or(IdentifierError::MissingPrefix)?;
        let (owner, name) = rest.split_once('-').ok_or(IdentifierError::MissingName)?;

        validate_owner(owner)?;
        validate_name(name)?;

        Ok(Self(raw.to_string()))
    }

    /// Build an identifier from its owner and name
    pub fn from_parts(owner: &str, name: &str) -> Result<Self, IdentifierError> {
        validate_owner(owner)?;
        Self::parse(&format!("{}{}-{}", Self::PREFIX, owner, name))
    }

    /// Owner segment
    pub fn owner(&self) -> &str {
        self.segments().0
    }

    /// Name segment
    pub fn name(&self) -> &str {
        self.segments().1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> (&str, &str) {
        // Validated at construction: prefix and separator are present.
        let rest = &self.0[Self::PREFIX.len()..];
        rest.split_once('-').unwrap_or((rest, ""))
    }
}

fn validate_owner(owner: &str) -> Result<(), IdentifierError> {
    let valid = !owner.is_empty()
        && owner
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(IdentifierError::InvalidOwner(owner.to_string()))
    }
}

fn validate_name(name: &str) -> Result<(), IdentifierError> {
    if name.is_empty() {
        return Err(IdentifierError::MissingName);
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = name.as_bytes();
    let valid = alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| alnum(b) || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(IdentifierError::InvalidName(name.to_string()))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

/// Resolves the ownership claim recorded for an agent
pub trait OwnershipLookup: Send + Sync {
    /// The identity that owns `id`, or None if no owner is known
    fn owner_of(&self, id: &AgentId) -> Option<String>;
}

/// Ownership taken from the identifier's owner segment
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierOwnership;

impl OwnershipLookup for IdentifierOwnership {
    fn owner_of(&self, id: &AgentId) -> Option<String> {
        Some(id.owner().to_string())
    }
}

/// Ownership records for admitted agents; unknown identifiers have no owner
#[derive(Debug, Clone, Default)]
pub struct StaticOwners {
    owners: HashMap<String, String>,
}

impl StaticOwners {
    pub fn new(owners: HashMap<String, String>) -> Self {
        Self { owners }
    }
}

impl OwnershipLookup for StaticOwners {
    fn owner_of(&self, id: &AgentId) -> Option<String> {
        self.owners.get(id.as_str()).cloned()
    }
}
