use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical identifier of a chat entity: `localpart@domain/resource`.
///
/// Localpart and domain are case-folded on construction; equality and
/// ordering are defined on the canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    localpart: Option<String>,
    domain: String,
    resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address has an empty domain")]
    EmptyDomain,
    #[error("invalid character in address part: {0:?}")]
    InvalidCharacter(char),
}

impl Address {
    pub fn new(
        localpart: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, AddressError> {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain);
        }
        for c in domain.chars() {
            if c == '@' || c == '/' || c.is_whitespace() {
                return Err(AddressError::InvalidCharacter(c));
            }
        }
        let localpart = match localpart {
            Some(l) if !l.is_empty() => {
                for c in l.chars() {
                    if c == '@' || c == '/' || c.is_whitespace() {
                        return Err(AddressError::InvalidCharacter(c));
                    }
                }
                Some(l.to_lowercase())
            }
            _ => None,
        };
        let resource = match resource {
            Some(r) if !r.is_empty() => Some(r.to_string()),
            _ => None,
        };
        Ok(Address {
            localpart,
            domain,
            resource,
        })
    }

    pub fn from_domain(domain: &str) -> Result<Self, AddressError> {
        Address::new(None, domain, None)
    }

    pub fn localpart(&self) -> Option<&str> {
        self.localpart.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address without its resource part.
    pub fn bare(&self) -> Address {
        Address {
            localpart: self.localpart.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// The bare domain this address lives on.
    pub fn domain_address(&self) -> Address {
        Address {
            localpart: None,
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// True for addresses that name a domain itself rather than an entity on it.
    pub fn is_bare_domain(&self) -> bool {
        self.localpart.is_none() && self.resource.is_none()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref l) = self.localpart {
            write!(f, "{l}@")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(ref r) = self.resource {
            write!(f, "/{r}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.find('/') {
            Some(idx) => (&s[..idx], Some(&s[idx + 1..])),
            None => (s, None),
        };
        let (localpart, domain) = match bare.find('@') {
            Some(idx) => (Some(&bare[..idx]), &bare[idx + 1..]),
            None => (None, bare),
        };
        Address::new(localpart, domain, resource)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.to_string()
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}
