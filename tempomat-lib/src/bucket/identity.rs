//! Identity derivation: which string a request is billed to.
//!
//! IP buckets bill the client address truncated to the bucket's
//! netmask; the UserAgent bucket bills the raw header. Forwarding
//! headers are only believed when the connecting peer is itself a
//! trusted proxy.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use http::header::USER_AGENT;
use http::HeaderMap;
use ipnet::IpNet;

const FORWARDING_HEADERS: [&str; 2] = ["x-forwarded-for", "x-real-ip"];

/// Identity string for an IP bucket: the resolved client address
/// truncated to `prefix` bits, in CIDR form (`192.0.2.0/24`).
pub(crate) fn masked_ip(
    peer: SocketAddr,
    headers: &HeaderMap,
    trusted: &HashSet<String>,
    prefix: u8,
) -> String {
    let ip = client_ip(peer, headers, trusted);
    match IpNet::new(ip, prefix) {
        Ok(net) => net.trunc().to_string(),
        Err(_) => "0.0.0.0/0".to_string(),
    }
}

/// Identity string for the UserAgent bucket. An absent or unreadable
/// header yields the empty string, which is a valid identity.
pub(crate) fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Bucket key: MD5 hex digest of the identity string.
pub(crate) fn key(identity: &str) -> String {
    format!("{:x}", md5::compute(identity))
}

/// Resolve the billable client address.
///
/// The peer address wins unless it is a trusted proxy, in which case
/// the forwarding headers are scanned for the rightmost address that is
/// not itself a trusted proxy. An unparseable candidate falls back to
/// `0.0.0.0`.
fn client_ip(peer: SocketAddr, headers: &HeaderMap, trusted: &HashSet<String>) -> IpAddr {
    let peer_ip = peer.ip();
    if !trusted.contains(&peer_ip.to_string()) {
        return peer_ip;
    }
    match forwarded_for(headers, trusted) {
        Some(raw) => raw
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        None => peer_ip,
    }
}

fn forwarded_for(headers: &HeaderMap, trusted: &HashSet<String>) -> Option<String> {
    for name in FORWARDING_HEADERS {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        for candidate in value.split(',').rev() {
            let candidate = candidate.trim();
            if candidate.is_empty() {
                continue;
            }
            if !trusted.contains(candidate) {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    fn trusted(addrs: &[&str]) -> HashSet<String> {
        addrs.iter().map(|s| s.to_string()).collect()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn untrusted_peer_ignores_forwarding_headers() {
        let h = headers(&[("x-forwarded-for", "2.2.2.2")]);
        let id = masked_ip(peer("1.1.1.1:4711"), &h, &trusted(&["10.0.0.1"]), 32);
        assert_eq!(id, "1.1.1.1/32");
    }

    #[test]
    fn trusted_peer_unwraps_rightmost_untrusted() {
        let h = headers(&[("x-forwarded-for", "2.2.2.2, 10.0.0.1")]);
        let t = trusted(&["10.0.0.1"]);
        assert_eq!(masked_ip(peer("10.0.0.1:4711"), &h, &t, 32), "2.2.2.2/32");
        assert_eq!(masked_ip(peer("10.0.0.1:4711"), &h, &t, 24), "2.2.2.0/24");
    }

    #[test]
    fn x_real_ip_is_consulted_after_forwarded_for() {
        let h = headers(&[("x-real-ip", "3.3.3.3")]);
        let t = trusted(&["10.0.0.1"]);
        assert_eq!(masked_ip(peer("10.0.0.1:4711"), &h, &t, 32), "3.3.3.3/32");
    }

    #[test]
    fn all_trusted_chain_falls_back_to_peer() {
        let h = headers(&[("x-forwarded-for", "10.0.0.2, 10.0.0.1")]);
        let t = trusted(&["10.0.0.1", "10.0.0.2"]);
        assert_eq!(masked_ip(peer("10.0.0.1:4711"), &h, &t, 32), "10.0.0.1/32");
    }

    #[test]
    fn garbage_forwarded_address_becomes_unspecified() {
        let h = headers(&[("x-forwarded-for", "not-an-ip")]);
        let t = trusted(&["10.0.0.1"]);
        assert_eq!(masked_ip(peer("10.0.0.1:4711"), &h, &t, 24), "0.0.0.0/24");
    }

    #[test]
    fn netmask_aggregates_neighbours() {
        let t = HashSet::new();
        let h = HeaderMap::new();
        assert_eq!(masked_ip(peer("3.3.3.4:1"), &h, &t, 24), "3.3.3.0/24");
        assert_eq!(masked_ip(peer("3.3.3.5:1"), &h, &t, 24), "3.3.3.0/24");
        assert_eq!(masked_ip(peer("3.3.3.4:1"), &h, &t, 16), "3.3.0.0/16");
    }

    #[test]
    fn empty_user_agent_is_a_valid_identity() {
        let h = HeaderMap::new();
        assert_eq!(user_agent(&h), "");

        let h = headers(&[("user-agent", "curl/8.0")]);
        assert_eq!(user_agent(&h), "curl/8.0");
    }

    #[test]
    fn key_is_md5_hex_of_identity() {
        // Stable across runs and matches the wire format consumed by
        // the doctor tooling.
        assert_eq!(key(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(key("1.1.1.1/32").len(), 32);
        assert_ne!(key("1.1.1.1/32"), key("1.1.1.2/32"));
    }
}
