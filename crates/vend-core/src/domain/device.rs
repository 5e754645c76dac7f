//! Payment controllers as seen over the air.
//!
//! A controller advertises a name of the form `<digits>.<suffix>`, for
//! example `42.vmflow.xyz`.  The digits are the numeric site identifier the
//! backend knows the machine by.  A freshly flashed controller advertises
//! site `0` until it has been registered.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain suffix used by production controllers.
pub const DEFAULT_ALIAS_SUFFIX: &str = "vmflow.xyz";

/// Numeric site identifier encoded in a controller's advertised name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub u32);

impl SiteId {
    /// The reserved identifier of a controller awaiting registration.
    pub const UNPROVISIONED: SiteId = SiteId(0);

    pub fn is_unprovisioned(self) -> bool {
        self == Self::UNPROVISIONED
    }

    /// The zero-padded six-digit form written by `SET_SUBDOMAIN`.
    pub fn site_alias(self) -> String {
        format!("{:06}", self.0)
    }

    /// The full advertised name under `suffix`.
    pub fn advertised_name(self, suffix: &str) -> String {
        format!("{}.{}", self.0, suffix)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SiteId {
    fn from(value: u32) -> Self {
        SiteId(value)
    }
}

/// Reasons an advertised name is not a controller alias.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AliasError {
    /// The name does not end in `.<suffix>`.
    #[error("name {name:?} does not end with .{suffix}")]
    WrongSuffix { name: String, suffix: String },

    /// The part before the suffix is empty or contains non-digits.
    #[error("name {0:?} does not start with a numeric site id")]
    NotNumeric(String),

    /// The digits do not fit a site identifier.
    #[error("site id in {0:?} is out of range")]
    OutOfRange(String),
}

/// Parses `name` as `<digits>.<suffix>` and returns the site identifier.
///
/// # Examples
///
/// ```rust
/// use vend_core::domain::device::{parse_alias, SiteId};
///
/// assert_eq!(parse_alias("42.vmflow.xyz", "vmflow.xyz"), Ok(SiteId(42)));
/// assert!(parse_alias("0.vmflow.xyz", "vmflow.xyz").unwrap().is_unprovisioned());
/// assert!(parse_alias("speaker", "vmflow.xyz").is_err());
/// ```
pub fn parse_alias(name: &str, suffix: &str) -> Result<SiteId, AliasError> {
    let digits = name
        .strip_suffix(suffix)
        .and_then(|rest| rest.strip_suffix('.'))
        .ok_or_else(|| AliasError::WrongSuffix {
            name: name.to_string(),
            suffix: suffix.to_string(),
        })?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AliasError::NotNumeric(name.to_string()));
    }

    digits
        .parse::<u32>()
        .map(SiteId)
        .map_err(|_| AliasError::OutOfRange(name.to_string()))
}

/// A peer found by the transport: its link-level handle plus the name it advertised.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    /// Transport-level handle (a Bluetooth address for BLE).
    pub address: String,
    /// Advertised local name.
    pub name: String,
}

impl Device {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    pub fn site_id(&self, suffix: &str) -> Result<SiteId, AliasError> {
        parse_alias(&self.name, suffix)
    }

    /// True only for a controller alias carrying the reserved site `0`.
    pub fn is_unprovisioned(&self, suffix: &str) -> bool {
        matches!(self.site_id(suffix), Ok(id) if id.is_unprovisioned())
    }
}

/// A controller with a registered site identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearbyMachine {
    pub device: Device,
    pub site_id: SiteId,
}

/// Keeps the provisioned controllers from a scan, first sighting of each address wins.
///
/// Peers whose name is not an alias, and controllers still on site `0`, are dropped.
pub fn nearby_machines<I>(peers: I, suffix: &str) -> Vec<NearbyMachine>
where
    I: IntoIterator<Item = Device>,
{
    let mut seen = HashSet::new();
    peers
        .into_iter()
        .filter_map(|device| {
            let site_id = device.site_id(suffix).ok()?;
            if site_id.is_unprovisioned() || !seen.insert(device.address.clone()) {
                return None;
            }
            Some(NearbyMachine { device, site_id })
        })
        .collect()
}

/// Returns the first controller still advertising the unprovisioned alias.
pub fn first_unprovisioned<I>(peers: I, suffix: &str) -> Option<Device>
where
    I: IntoIterator<Item = Device>,
{
    peers
        .into_iter()
        .find(|d| d.is_unprovisioned(suffix))
}
