//! The split contract handed from the load manager to the orchestrator.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::constants::SPLIT_CHILD_COUNT;
use crate::error::{Error, Result};
use crate::loadbalance::service_unit::ServiceUnitId;

/// Child service unit → destination broker (`None` until assigned).
pub type SplitDestinations = BTreeMap<String, Option<String>>;

/// Decision to split one service unit into exactly two children.
///
/// Immutable once built. Every constructor, including deserialization,
/// goes through [`Split::new`], so an invalid split cannot exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    service_unit: String,
    source_broker: String,
    split_service_unit_to_dest_broker: Option<SplitDestinations>,
}

/// Wire shape of a [`Split`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplitData {
    #[serde(default)]
    service_unit: Option<String>,
    #[serde(default)]
    source_broker: String,
    #[serde(default)]
    split_service_unit_to_dest_broker: Option<SplitDestinations>,
}

impl Split {
    /// Build a split.
    ///
    /// # Errors
    ///
    /// - [`Error::NullArgument`] when `service_unit` is empty.
    /// - [`Error::InvalidArgument`] when `destinations` is present and does
    ///   not name exactly two children.
    pub fn new(
        service_unit: impl Into<String>,
        source_broker: impl Into<String>,
        destinations: Option<SplitDestinations>,
    ) -> Result<Self> {
        let service_unit = service_unit.into();
        if service_unit.is_empty() {
            return Err(Error::NullArgument("service_unit"));
        }
        if let Some(map) = &destinations
            && map.len() != SPLIT_CHILD_COUNT
        {
            return Err(Error::InvalidArgument(format!(
                "split service unit should be split into {SPLIT_CHILD_COUNT} service units, got {}",
                map.len()
            )));
        }
        Ok(Self {
            service_unit,
            source_broker: source_broker.into(),
            split_service_unit_to_dest_broker: destinations,
        })
    }

    /// A split whose children are not decided yet.
    pub fn undecided(service_unit: impl Into<String>, source_broker: impl Into<String>) -> Result<Self> {
        Self::new(service_unit, source_broker, None)
    }

    /// Split `service_unit` at the midpoint of its range. Both children are
    /// named, neither has a destination broker.
    pub fn halve(service_unit: &ServiceUnitId, source_broker: impl Into<String>) -> Result<Self> {
        let (low, high) = service_unit.split_in_half()?;
        let destinations = [low, high]
            .into_iter()
            .map(|child| (child.to_string(), None))
            .collect();
        Self::new(service_unit.to_string(), source_broker, Some(destinations))
    }

    pub fn builder() -> SplitBuilder {
        SplitBuilder::default()
    }

    pub fn service_unit(&self) -> &str {
        &self.service_unit
    }

    pub fn source_broker(&self) -> &str {
        &self.source_broker
    }

    pub fn split_service_unit_to_dest_broker(&self) -> Option<&SplitDestinations> {
        self.split_service_unit_to_dest_broker.as_ref()
    }

    /// Destination of `child`. The outer `None` means `child` is not part of
    /// this split, the inner one that it has no broker yet.
    pub fn destination_for(&self, child: &str) -> Option<Option<&str>> {
        self.split_service_unit_to_dest_broker
            .as_ref()?
            .get(child)
            .map(|dest| dest.as_deref())
    }

    /// True when both children have a destination broker.
    pub fn is_assigned(&self) -> bool {
        self.split_service_unit_to_dest_broker
            .as_ref()
            .is_some_and(|map| map.values().all(Option::is_some))
    }
}

impl Serialize for Split {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        SplitData {
            service_unit: Some(self.service_unit.clone()),
            source_broker: self.source_broker.clone(),
            split_service_unit_to_dest_broker: self.split_service_unit_to_dest_broker.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Split {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let data = SplitData::deserialize(deserializer)?;
        Split::new(
            data.service_unit.unwrap_or_default(),
            data.source_broker,
            data.split_service_unit_to_dest_broker,
        )
        .map_err(serde::de::Error::custom)
    }
}

/// Incremental construction of a [`Split`].
#[derive(Debug, Clone, Default)]
pub struct SplitBuilder {
    service_unit: Option<String>,
    source_broker: String,
    destinations: Option<SplitDestinations>,
}

impl SplitBuilder {
    pub fn service_unit(mut self, service_unit: impl Into<String>) -> Self {
        self.service_unit = Some(service_unit.into());
        self
    }

    pub fn source_broker(mut self, source_broker: impl Into<String>) -> Self {
        self.source_broker = source_broker.into();
        self
    }

    /// Add a child, optionally pinned to a destination broker.
    pub fn child(mut self, service_unit: impl Into<String>, destination: Option<&str>) -> Self {
        self.destinations
            .get_or_insert_with(BTreeMap::new)
            .insert(service_unit.into(), destination.map(str::to_string));
        self
    }

    pub fn build(self) -> Result<Split> {
        let service_unit = self
            .service_unit
            .ok_or(Error::NullArgument("service_unit"))?;
        Split::new(service_unit, self.source_broker, self.destinations)
    }
}
