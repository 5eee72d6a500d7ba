pub mod resolver;

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{BtpsError, Result};

fn account_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid regex"))
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*(\.[A-Za-z0-9][A-Za-z0-9-]*)*$").expect("valid regex")
    })
}

/// An addressable BTPS identity in the form `account$domain`.
///
/// Both halves are non-empty and follow a conservative label grammar; anything
/// else is rejected up front as [`BtpsError::InvalidIdentity`], which is
/// terminal and never retried.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[display("{account}${domain}")]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    account: String,
    domain: String,
}

impl Identity {
    pub fn new(account: impl Into<String>, domain: impl Into<String>) -> Result<Self> {
        let account = account.into();
        let domain = domain.into();

        if !account_re().is_match(&account) {
            return Err(BtpsError::InvalidIdentity(format!(
                "malformed account label `{account}`"
            )));
        }
        if !domain_re().is_match(&domain) {
            return Err(BtpsError::InvalidIdentity(format!(
                "malformed domain label `{domain}`"
            )));
        }

        Ok(Self { account, domain })
    }

    /// Parse the canonical `account$domain` string form.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.split('$');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(account), Some(domain), None) if !account.is_empty() && !domain.is_empty() => {
                Self::new(account, domain)
            }
            _ => Err(BtpsError::InvalidIdentity(format!(
                "`{input}` is not of the form account$domain"
            ))),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl FromStr for Identity {
    type Err = BtpsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = BtpsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.to_string()
    }
}
