use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::labels;
use crate::requirements::{Compatibility, Requirement, Requirements};

/// Newtype wrapper so zones can't be mixed up with other label values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
pub struct Zone(pub String);

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the capacity is purchased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
    OnDemand,
    Spot,
    Reserved,
}

impl CapacityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Spot => "spot",
            Self::Reserved => "reserved",
        }
    }

    pub fn parse(s: &str) -> Option<CapacityType> {
        match s {
            "on-demand" => Some(Self::OnDemand),
            "spot" => Some(Self::Spot),
            "reserved" => Some(Self::Reserved),
            _ => None,
        }
    }
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One place an instance type can be bought: a zone and a capacity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    pub zone: Zone,
    pub capacity_type: CapacityType,
    /// Hourly price in USD.
    pub price: f64,
    pub available: bool,
}

impl Offering {
    /// The zone / capacity-type facts of this offering as requirements.
    pub fn requirements(&self) -> Requirements {
        Requirements::new()
            .with(Requirement::in_values(labels::ZONE, [self.zone.0.as_str()]))
            .with(Requirement::in_values(
                labels::CAPACITY_TYPE,
                [self.capacity_type.as_str()],
            ))
    }

    /// Whether `requirements` allow this offering's zone and capacity type.
    pub fn compatible_with(&self, requirements: &Requirements) -> bool {
        requirements
            .compatible(&self.requirements(), Compatibility::AllowUndefinedWellKnownLabels)
            .is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Offerings(Vec<Offering>);

impl Offerings {
    pub fn new(offerings: Vec<Offering>) -> Self {
        Self(offerings)
    }

    /// Offerings whose zone and capacity type `requirements` allow.
    pub fn compatible(&self, requirements: &Requirements) -> Offerings {
        self.0
            .iter()
            .filter(|o| o.compatible_with(requirements))
            .cloned()
            .collect()
    }

    pub fn available(&self) -> Offerings {
        self.0.iter().filter(|o| o.available).cloned().collect()
    }

    /// Lowest price; the first one listed wins a tie.
    pub fn cheapest(&self) -> Option<&Offering> {
        self.0.iter().fold(None, |best: Option<&Offering>, o| match best {
            Some(b) if b.price <= o.price => Some(b),
            _ => Some(o),
        })
    }

    pub fn find(&self, zone: &Zone, capacity_type: CapacityType) -> Option<&Offering> {
        self.0
            .iter()
            .find(|o| &o.zone == zone && o.capacity_type == capacity_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Offering> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Offering> for Offerings {
    fn from_iter<T: IntoIterator<Item = Offering>>(iter: T) -> Self {
        Offerings(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::requirements::Operator;

    fn offering(zone: &str, capacity_type: CapacityType, price: f64, available: bool) -> Offering {
        Offering {
            zone: Zone(zone.into()),
            capacity_type,
            price,
            available,
        }
    }

    fn zone_in(zones: &[&str]) -> Requirements {
        Requirements::new().with(Requirement::in_values(labels::ZONE, zones.iter().copied()))
    }

    #[test]
    fn capacity_type_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&CapacityType::OnDemand).unwrap(),
            "\"on-demand\""
        );
        assert_eq!(CapacityType::parse("spot"), Some(CapacityType::Spot));
        assert_eq!(CapacityType::parse("preemptible"), None);
    }

    #[test]
    fn compatible_filters_by_zone() {
        let offerings = Offerings::new(vec![
            offering("us-east-1a", CapacityType::OnDemand, 0.1, true),
            offering("us-east-1b", CapacityType::OnDemand, 0.1, true),
        ]);
        let kept = offerings.compatible(&zone_in(&["us-east-1a"]));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.iter().next().unwrap().zone, Zone("us-east-1a".into()));
    }

    #[test]
    fn compatible_filters_by_capacity_type() {
        let offerings = Offerings::new(vec![
            offering("a", CapacityType::Spot, 0.03, true),
            offering("a", CapacityType::OnDemand, 0.1, true),
        ]);
        let reqs = Requirements::new().with(
            Requirement::new(labels::CAPACITY_TYPE, Operator::NotIn, ["spot"]).unwrap(),
        );
        let kept = offerings.compatible(&reqs);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.iter().next().unwrap().capacity_type, CapacityType::OnDemand);
    }

    #[test]
    fn unrelated_requirements_keep_every_offering() {
        let offerings = Offerings::new(vec![offering("a", CapacityType::Spot, 0.03, true)]);
        let reqs = Requirements::new().with(Requirement::in_values(labels::ARCH, ["amd64"]));
        assert_eq!(offerings.compatible(&reqs).len(), 1);
    }

    #[test]
    fn available_drops_unavailable() {
        let offerings = Offerings::new(vec![
            offering("a", CapacityType::OnDemand, 0.1, false),
            offering("b", CapacityType::OnDemand, 0.1, true),
        ]);
        let available = offerings.available();
        assert_eq!(available.len(), 1);
        assert!(available.iter().all(|o| o.available));
    }

    #[test]
    fn cheapest_prefers_first_on_tie() {
        let offerings = Offerings::new(vec![
            offering("a", CapacityType::OnDemand, 0.2, true),
            offering("b", CapacityType::Spot, 0.05, true),
            offering("c", CapacityType::Spot, 0.05, true),
        ]);
        assert_eq!(offerings.cheapest().unwrap().zone, Zone("b".into()));
        assert!(Offerings::default().cheapest().is_none());
    }
}
