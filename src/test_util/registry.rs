use std::sync::Arc;

use crate::config::PeerConfig;
use crate::events::PeerEventNotifier;
use crate::registry::PeerRegistry;
use crate::test_util::transport::{TrackingServerSender, TrackingTransportFactory};

/// A [PeerRegistry] wired to tracking transports and a tracking server connection.
pub struct RegistryFixture {
    pub config: Arc<PeerConfig>,
    pub events: Arc<PeerEventNotifier>,
    pub server: Arc<TrackingServerSender>,
    pub transports: Arc<TrackingTransportFactory>,
    pub registry: Arc<PeerRegistry>,
}

impl RegistryFixture {
    pub fn new(direct_channel_capable: bool) -> RegistryFixture {
        let mut config = PeerConfig::new("ws://localhost:3000");
        config.direct_channel_capable = direct_channel_capable;
        RegistryFixture::with_config(config)
    }

    pub fn with_config(config: PeerConfig) -> RegistryFixture {
        let config = Arc::new(config);
        let events = Arc::new(PeerEventNotifier::new(config.event_buffer_size));
        let transports = Arc::new(TrackingTransportFactory::new());
        let registry = Arc::new(PeerRegistry::new(config.clone(), transports.clone(), events.clone()));

        RegistryFixture {
            config,
            events,
            server: Arc::new(TrackingServerSender::new()),
            transports,
            registry,
        }
    }
}
