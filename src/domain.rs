//! Processor domain identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Addressable remote (or local) processor domain, as numbered by GPR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainId(pub u8);

impl DomainId {
    pub const MODEM: DomainId = DomainId(1);
    pub const ADSP: DomainId = DomainId(2);
    pub const APPS: DomainId = DomainId(3);
    pub const SDSP: DomainId = DomainId(4);
    pub const CDSP: DomainId = DomainId(5);

    /// Largest domain id representable in a subsystem mask
    pub const MAX: u8 = 31;

    /// Get a human-readable name for the domain
    pub fn name(&self) -> &'static str {
        match self.0 {
            1 => "modem",
            2 => "adsp",
            3 => "apps",
            4 => "sdsp",
            5 => "cdsp",
            _ => "pd",
        }
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Bitmask of domains a shared allocation must additionally be mapped to
///
/// Bit `n` selects `DomainId(n)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemMask(pub u32);

impl SubsystemMask {
    pub const NONE: SubsystemMask = SubsystemMask(0);

    /// Build a mask from a list of domains
    pub fn from_domains(domains: &[DomainId]) -> Self {
        let bits = domains
            .iter()
            .filter(|d| d.0 <= DomainId::MAX)
            .fold(0u32, |acc, d| acc | (1 << d.0));
        Self(bits)
    }

    /// Check if a domain is selected
    pub fn contains(&self, domain: DomainId) -> bool {
        domain.0 <= DomainId::MAX && self.0 & (1 << domain.0) != 0
    }

    /// Iterate the selected domains in ascending order
    pub fn domains(&self) -> impl Iterator<Item = DomainId> + '_ {
        (0..=DomainId::MAX)
            .map(DomainId)
            .filter(move |d| self.contains(*d))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_round_trip_order() {
        let mask = SubsystemMask::from_domains(&[DomainId::CDSP, DomainId::ADSP]);
        assert!(mask.contains(DomainId::ADSP));
        assert!(!mask.contains(DomainId::MODEM));
        let domains: Vec<_> = mask.domains().collect();
        assert_eq!(domains, vec![DomainId::ADSP, DomainId::CDSP]);
    }

    #[test]
    fn test_display() {
        assert_eq!(DomainId::ADSP.to_string(), "adsp(2)");
        assert_eq!(DomainId(9).to_string(), "pd(9)");
    }
}
