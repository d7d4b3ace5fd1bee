//! Hardware identifier to logical system id mapping

use std::collections::HashMap;
use tracing::debug;

/// Read-only table mapping modem identifiers (IMEIs) to logical system ids
///
/// The table is built once at startup and never mutated. Several identifiers
/// may share a target id; the registry does not interpret the table.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, u32>,
}

impl DeviceRegistry {
    /// System id returned for unknown, empty or absent identifiers
    pub const UNKNOWN_SYSTEM_ID: u32 = 0;

    /// Build a registry from `(identifier, system id)` pairs
    ///
    /// Identifiers are trimmed; later duplicates win.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: AsRef<str>,
    {
        let devices = entries
            .into_iter()
            .map(|(id, system_id)| (id.as_ref().trim().to_string(), system_id))
            .filter(|(id, _)| !id.is_empty())
            .collect::<HashMap<_, _>>();

        debug!(devices = devices.len(), "Device registry loaded");
        Self { devices }
    }

    /// Look up the system id for a device identifier
    ///
    /// Returns [`Self::UNKNOWN_SYSTEM_ID`] when the identifier is absent,
    /// blank or not configured.
    pub fn lookup(&self, device_id: Option<&str>) -> u32 {
        device_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .and_then(|id| self.devices.get(id).copied())
            .unwrap_or(Self::UNKNOWN_SYSTEM_ID)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new([
            ("300434063839690", 3),
            ("300434063833730", 7),
            ("300434063836760", 0),
        ])
    }

    #[test]
    fn known_identifier_resolves() {
        assert_eq!(registry().lookup(Some("300434063839690")), 3);
        assert_eq!(registry().lookup(Some(" 300434063833730\n")), 7);
    }

    #[test]
    fn unknown_or_missing_identifier_is_zero() {
        let registry = registry();
        assert_eq!(registry.lookup(None), 0);
        assert_eq!(registry.lookup(Some("")), 0);
        assert_eq!(registry.lookup(Some("   ")), 0);
        assert_eq!(registry.lookup(Some("not-an-imei")), 0);
    }

    #[test]
    fn blank_entries_are_dropped() {
        let registry = DeviceRegistry::new([("", 4), ("  ", 5), ("42", 6)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(Some("")), 0);
    }

    proptest! {
        #[test]
        fn unconfigured_identifiers_fall_back(id in "[a-z]{1,20}") {
            prop_assert_eq!(registry().lookup(Some(&id)), DeviceRegistry::UNKNOWN_SYSTEM_ID);
        }
    }
}
