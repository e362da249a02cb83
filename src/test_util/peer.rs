use crate::protocol::{PeerId, PeerIdentity};

/// convenience method for unit test code: create a [PeerIdentity] whose display name is derived
///  from the id
pub fn test_identity(id: &str, rtc_supported: bool) -> PeerIdentity {
    PeerIdentity {
        id: PeerId::new(id),
        display_name: format!("Peer {}", id),
        device_label: "Test Device".to_string(),
        rtc_supported,
    }
}
