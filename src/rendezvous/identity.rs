//! Everything the rendezvous server derives from a client's handshake request: its id, a
//!  human-friendly display name, a device label, and the room it belongs to.

use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};

use rustc_hash::FxHasher;

use crate::protocol::PeerId;

pub const PEER_ID_COOKIE: &str = "peerid";

const COLORS: [&str; 32] = [
    "Amber", "Aqua", "Azure", "Beige", "Black", "Blue", "Bronze", "Brown",
    "Coral", "Crimson", "Cyan", "Emerald", "Gold", "Gray", "Green", "Indigo",
    "Ivory", "Jade", "Lavender", "Lime", "Magenta", "Maroon", "Olive", "Orange",
    "Pink", "Plum", "Purple", "Red", "Silver", "Teal", "Violet", "Yellow",
];

const ANIMALS: [&str; 40] = [
    "Albatross", "Badger", "Beaver", "Bison", "Camel", "Cheetah", "Crane", "Dolphin",
    "Eagle", "Falcon", "Ferret", "Flamingo", "Fox", "Gazelle", "Gecko", "Heron",
    "Ibex", "Jaguar", "Koala", "Lemur", "Leopard", "Llama", "Lynx", "Marmot",
    "Moose", "Narwhal", "Otter", "Owl", "Panda", "Pelican", "Penguin", "Quail",
    "Raccoon", "Salmon", "Seal", "Tiger", "Toucan", "Walrus", "Whale", "Zebra",
];

/// Groups clients by their network origin: everybody behind the same public address ends up in
///  the same room.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RoomKey(String);
impl RoomKey {
    pub fn new(key: impl Into<String>) -> RoomKey {
        RoomKey(key.into())
    }
}
impl Debug for RoomKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Display for RoomKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The first `X-Forwarded-For` entry if proxies are trusted, the socket's address otherwise.
///  Loopback addresses are normalized so that local clients share a room regardless of the IP
///  version they connected with.
pub fn room_key(forwarded_for: Option<&str>, remote: IpAddr, trust_forwarded_for: bool) -> RoomKey {
    let forwarded = forwarded_for
        .filter(|_| trust_forwarded_for)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let addr = match forwarded {
        Some(forwarded) => match forwarded.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => return RoomKey::new(forwarded),
        },
        None => remote,
    };

    RoomKey::new(normalize(addr).to_string())
}

fn normalize(addr: IpAddr) -> IpAddr {
    let addr = match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        IpAddr::V4(_) => addr,
    };
    if addr.is_loopback() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
    else {
        addr
    }
}

/// Looks for the `peerid` entry in a `Cookie` header.
pub fn peer_id_from_cookie(cookie_header: &str) -> Option<PeerId> {
    cookie_header.split(';')
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| *name == PEER_ID_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(PeerId::new)
}

/// the `Cookie` header a returning client sends to keep its id
pub fn cookie_header(peer_id: &PeerId) -> String {
    format!("{}={}", PEER_ID_COOKIE, peer_id)
}

pub fn set_cookie_header(peer_id: &PeerId) -> String {
    format!("{}={}; SameSite=Strict; Secure", PEER_ID_COOKIE, peer_id)
}

/// Two capitalized words, e.g. "Teal Otter". The same id always gets the same name.
pub fn display_name(peer_id: &PeerId) -> String {
    let mut hasher = FxHasher::default();
    peer_id.as_str().hash(&mut hasher);
    let hash = hasher.finish() as usize;

    let color = COLORS[hash % COLORS.len()];
    let animal = ANIMALS[(hash / COLORS.len()) % ANIMALS.len()];
    format!("{} {}", color, animal)
}

/// A short description of the client device, e.g. "Mac Safari" or "iOS iPhone".
pub fn device_label(user_agent: &str) -> String {
    let model = device_model(user_agent);
    let browser = browser_name(user_agent);
    let device = model.or(browser).unwrap_or("Unknown Device");

    match os_name(user_agent) {
        Some(os) => format!("{} {}", os, device),
        None => device.to_string(),
    }
}

fn os_name(ua: &str) -> Option<&'static str> {
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        Some("iOS")
    }
    else if ua.contains("Android") {
        Some("Android")
    }
    else if ua.contains("Windows") {
        Some("Windows")
    }
    else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        Some("Mac")
    }
    else if ua.contains("CrOS") {
        Some("Chrome OS")
    }
    else if ua.contains("Linux") {
        Some("Linux")
    }
    else {
        None
    }
}

fn device_model(ua: &str) -> Option<&'static str> {
    ["iPhone", "iPad", "iPod"].into_iter()
        .find(|model| ua.contains(model))
}

fn browser_name(ua: &str) -> Option<&'static str> {
    // order matters: most browsers claim to be Chrome and Safari as well
    if ua.contains("Edg/") {
        Some("Edge")
    }
    else if ua.contains("OPR/") || ua.contains("Opera") {
        Some("Opera")
    }
    else if ua.contains("Firefox/") {
        Some("Firefox")
    }
    else if ua.contains("Chrome/") || ua.contains("Chromium/") {
        Some("Chrome")
    }
    else if ua.contains("Safari/") {
        Some("Safari")
    }
    else {
        None
    }
}
