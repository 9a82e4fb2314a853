//! Address ownership and destination class policy
//!
//! Two questions get answered here: may an authenticated user put a given
//! address in From, and may they call a given PSTN destination. Destination
//! numbers are classified by the first matching rule in the configured,
//! ordered class list.

use super::message::SipRequest;
use crate::config::ClassRule;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{NumberClass, UserId};
use crate::domain::user::UserDirectory;
use regex::Regex;
use rsip::Uri;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why an address may not be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Somebody else owns the address
    Eperm,
    /// Nobody owns the address
    NoMatch,
}

/// Outcome of an address ownership check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressCheck {
    Allowed,
    Denied(DenyReason),
}

impl AddressCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AddressCheck::Allowed)
    }
}

/// Compiled destination classification rules, first match wins
pub struct ClassRules {
    rules: Vec<(Regex, NumberClass)>,
}

impl ClassRules {
    /// Compile the configured rule list
    ///
    /// Patterns starting with `^+` are skipped: `+` anchors nothing and the
    /// author almost certainly meant `^\+`. A pattern that fails to compile
    /// aborts configuration evaluation.
    pub fn compile(rules: &[ClassRule]) -> Result<Self, DomainError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.pattern.starts_with("^+") {
                warn!(
                    "Skipping class pattern {:?}: did you mean \"^\\+\"?",
                    rule.pattern
                );
                continue;
            }
            let regex = Regex::new(&rule.pattern).map_err(|e| {
                DomainError::Configuration(format!(
                    "bad class pattern {:?}: {}",
                    rule.pattern, e
                ))
            })?;
            compiled.push((regex, NumberClass::from_name(&rule.class)));
        }
        Ok(Self { rules: compiled })
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Class of the first matching rule, `Unknown` when nothing matches
    pub fn classify(&self, number: Option<&str>) -> NumberClass {
        let Some(number) = number else {
            return NumberClass::Unknown;
        };
        for (regex, class) in &self.rules {
            if regex.is_match(number) {
                return class.clone();
            }
        }
        NumberClass::Unknown
    }
}

/// Rewrites dialled numbers to E.164 before classification
pub trait NumberRewriter: Send + Sync {
    fn rewrite_to_e164(&self, number: &str) -> Result<String, DomainError>;
}

/// Prefix-based E.164 rewriting
///
/// `00` becomes `+`, a single leading `0` becomes `+<country code>`, numbers
/// already in `+`-form pass through untouched.
pub struct PrefixRewriter {
    country_code: String,
}

impl PrefixRewriter {
    pub fn new(country_code: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
        }
    }
}

impl NumberRewriter for PrefixRewriter {
    fn rewrite_to_e164(&self, number: &str) -> Result<String, DomainError> {
        if number.is_empty() {
            return Err(DomainError::Validation("empty number".to_string()));
        }
        if let Some(rest) = number.strip_prefix("00") {
            return Ok(format!("+{}", rest));
        }
        if let Some(rest) = number.strip_prefix('0') {
            return Ok(format!("+{}{}", self.country_code, rest));
        }
        Ok(number.to_string())
    }
}

/// Identity rewriting for deployments without a dial plan
pub struct IdentityRewriter;

impl NumberRewriter for IdentityRewriter {
    fn rewrite_to_e164(&self, number: &str) -> Result<String, DomainError> {
        Ok(number.to_string())
    }
}

/// Address ownership and PSTN destination policy
pub struct AddressPolicy {
    directory: Arc<dyn UserDirectory>,
}

impl AddressPolicy {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    /// May `user` assert `url` as their own address?
    pub async fn can_use_address(&self, user: &UserId, url: &Uri) -> AddressCheck {
        match self.directory.users_for_url(url).await {
            None => AddressCheck::Denied(DenyReason::NoMatch),
            Some(owners) if owners.is_empty() => AddressCheck::Denied(DenyReason::NoMatch),
            Some(owners) if owners.contains(user) => AddressCheck::Allowed,
            Some(owners) => {
                debug!(
                    "Address {} belongs to {:?}, not to {}",
                    url, owners, user
                );
                AddressCheck::Denied(DenyReason::Eperm)
            }
        }
    }

    /// May `user` call a destination of this class?
    ///
    /// A Route header means the user follows an explicit forwarding path
    /// and we defer to it.
    pub async fn is_allowed_pstn_dst(
        &self,
        user: &UserId,
        _number: Option<&str>,
        request: &SipRequest,
        class: &NumberClass,
    ) -> bool {
        if request.has_route() {
            return true;
        }
        match self.directory.classes_for_user(user).await {
            Some(classes) => classes.contains(class),
            None => false,
        }
    }
}
