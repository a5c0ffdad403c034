//! Service unit (bundle) identifiers.
//!
//! A bundle covers a half-open slice `[lower, upper)` of a namespace's
//! 32-bit topic hash space and is named `"<namespace>/0xLOWER_0xUPPER"`.
//! The last bundle of a namespace ends at `0xffffffff`, which it includes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{BUNDLE_RANGE_MAX, BUNDLE_RANGE_MIN};
use crate::error::{Error, Result};

/// Name of a bundle: a namespace plus a range of the topic hash space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceUnitId {
    namespace: String,
    lower: u32,
    upper: u32,
}

impl ServiceUnitId {
    pub fn new(namespace: impl Into<String>, lower: u32, upper: u32) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.trim().is_empty() {
            return Err(Error::NullArgument("namespace"));
        }
        if lower >= upper {
            return Err(Error::InvalidArgument(format!(
                "bundle range lower bound 0x{lower:08x} must be below upper bound 0x{upper:08x}"
            )));
        }
        Ok(Self {
            namespace,
            lower,
            upper,
        })
    }

    /// The bundle covering the namespace's whole hash space.
    pub fn full(namespace: impl Into<String>) -> Result<Self> {
        Self::new(namespace, BUNDLE_RANGE_MIN, BUNDLE_RANGE_MAX)
    }

    /// Parse `"<namespace>/0xLOWER_0xUPPER"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("invalid service unit '{raw}'"));

        let (namespace, range) = raw.rsplit_once('/').ok_or_else(invalid)?;
        let (lower, upper) = range.split_once('_').ok_or_else(invalid)?;
        let parse_bound = |bound: &str| {
            bound
                .strip_prefix("0x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .ok_or_else(invalid)
        };
        Self::new(namespace, parse_bound(lower)?, parse_bound(upper)?)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn lower(&self) -> u32 {
        self.lower
    }

    pub fn upper(&self) -> u32 {
        self.upper
    }

    /// True when the bundle owns `hash`.
    pub fn contains(&self, hash: u32) -> bool {
        self.lower <= hash && (hash < self.upper || self.upper == BUNDLE_RANGE_MAX)
    }

    /// Split the range at its midpoint.
    ///
    /// Fails for a bundle whose range is too narrow to split.
    pub fn split_in_half(&self) -> Result<(ServiceUnitId, ServiceUnitId)> {
        let mid = self.lower + (self.upper - self.lower) / 2;
        if mid == self.lower {
            return Err(Error::InvalidArgument(format!(
                "service unit {self} is too small to split"
            )));
        }
        Ok((
            Self::new(self.namespace.clone(), self.lower, mid)?,
            Self::new(self.namespace.clone(), mid, self.upper)?,
        ))
    }
}

impl fmt::Display for ServiceUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/0x{:08x}_0x{:08x}", self.namespace, self.lower, self.upper)
    }
}

impl FromStr for ServiceUnitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServiceUnitId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ServiceUnitId> for String {
    fn from(value: ServiceUnitId) -> Self {
        value.to_string()
    }
}
