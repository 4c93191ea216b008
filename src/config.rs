//! Store configuration.

use crate::ble::types::{AdvertisingParameters, ConnectOptions, ServiceFilter};
use crate::session::registry::SessionId;

/// Default capacity of the state and rejection broadcast channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Configuration for a [`Store`](crate::store::Store) and its reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StoreConfig {
    /// Identifier of the central session.
    pub central_session: SessionId,
    /// Identifier of the peripheral-manager session.
    pub peripheral_manager_session: SessionId,
    /// Services to scan for.
    pub scan_filter: ServiceFilter,
    /// Services to discover after connecting.
    pub discovery_filter: ServiceFilter,
    /// Options passed with every connect request.
    pub connect_options: ConnectOptions,
    /// When set, the advertiser role is brought up on `appear` and starts
    /// advertising as soon as its radio is powered on.
    pub advertising: Option<AdvertisingParameters>,
    /// Capacity of the state and rejection broadcast channels.
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            central_session: SessionId::new("central"),
            peripheral_manager_session: SessionId::new("peripheral-manager"),
            scan_filter: ServiceFilter::any(),
            discovery_filter: ServiceFilter::any(),
            connect_options: ConnectOptions::default(),
            advertising: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// Restrict scanning to the given filter.
    pub fn with_scan_filter(mut self, filter: ServiceFilter) -> Self {
        self.scan_filter = filter;
        self
    }

    /// Restrict service discovery to the given filter.
    pub fn with_discovery_filter(mut self, filter: ServiceFilter) -> Self {
        self.discovery_filter = filter;
        self
    }

    /// Set the options used for connect requests.
    pub fn with_connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect_options = options;
        self
    }

    /// Enable the advertiser role.
    pub fn with_advertising(mut self, parameters: AdvertisingParameters) -> Self {
        self.advertising = Some(parameters);
        self
    }

    /// Use custom session identifiers.
    pub fn with_session_ids(
        mut self,
        central: impl Into<SessionId>,
        peripheral_manager: impl Into<SessionId>,
    ) -> Self {
        self.central_session = central.into();
        self.peripheral_manager_session = peripheral_manager.into();
        self
    }

    /// Set the broadcast channel capacity (minimum 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.central_session.as_str(), "central");
        assert!(config.scan_filter.is_any());
        assert!(config.advertising.is_none());
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::default()
            .with_session_ids("c", "pm")
            .with_event_capacity(0)
            .with_connect_options(ConnectOptions {
                timeout: Some(Duration::from_secs(3)),
                ..Default::default()
            })
            .with_advertising(AdvertisingParameters::default());

        assert_eq!(config.central_session, SessionId::new("c"));
        assert_eq!(config.peripheral_manager_session, SessionId::new("pm"));
        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.connect_options.timeout, Some(Duration::from_secs(3)));
        assert!(config.advertising.is_some());
    }
}
