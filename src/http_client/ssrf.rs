//! Private/loopback/link-local/CGNAT/documentation range classification.
//!
//! Grounded directly on the reference gateway's `services/ssrf.rs`: the same
//! range tables, generalized here to run against DNS-resolved addresses
//! rather than only literal IPs embedded in a URL.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // 10.0.0.0/8
    if ip.octets()[0] == 10 {
        return true;
    }

    // 172.16.0.0/12
    if ip.octets()[0] == 172 && (16..=31).contains(&ip.octets()[1]) {
        return true;
    }

    // 192.168.0.0/16
    if ip.octets()[0] == 192 && ip.octets()[1] == 168 {
        return true;
    }

    // Link-local: 169.254.0.0/16
    if ip.is_link_local() {
        return true;
    }

    if ip.is_broadcast() || ip.is_unspecified() {
        return true;
    }

    // Documentation ranges (TEST-NET-1/2/3)
    if (ip.octets()[0] == 192 && ip.octets()[1] == 0 && ip.octets()[2] == 2)
        || (ip.octets()[0] == 198 && ip.octets()[1] == 51 && ip.octets()[2] == 100)
        || (ip.octets()[0] == 203 && ip.octets()[1] == 0 && ip.octets()[2] == 113)
    {
        return true;
    }

    // Carrier-grade NAT: 100.64.0.0/10
    if ip.octets()[0] == 100 && (64..=127).contains(&ip.octets()[1]) {
        return true;
    }

    false
}

pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }

    let segments = ip.segments();

    // Unique local addresses: fc00::/7
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }

    // Link-local: fe80::/10
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }

    if let Some(ipv4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&ipv4);
    }

    false
}

pub fn is_private_socket_addr(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(v4) => is_private_ipv4(v4.ip()),
        SocketAddr::V6(v6) => is_private_ipv6(v6.ip()),
    }
}

pub fn is_localhost_hostname(host: &str) -> bool {
    let host = host.to_lowercase();
    host == "localhost"
        || host == "localhost.localdomain"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_private_ipv4_ranges() {
        assert!(is_private_ipv4(&"127.0.0.1".parse().unwrap()));
        assert!(is_private_ipv4(&"10.0.0.1".parse().unwrap()));
        assert!(is_private_ipv4(&"172.16.0.1".parse().unwrap()));
        assert!(is_private_ipv4(&"172.31.255.255".parse().unwrap()));
        assert!(is_private_ipv4(&"192.168.1.1".parse().unwrap()));
        assert!(is_private_ipv4(&"169.254.1.1".parse().unwrap()));
        assert!(is_private_ipv4(&"100.64.0.1".parse().unwrap()));
        assert!(is_private_ipv4(&"192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn allows_public_ipv4() {
        assert!(!is_private_ipv4(&"8.8.8.8".parse().unwrap()));
        assert!(!is_private_ipv4(&"1.1.1.1".parse().unwrap()));
        assert!(!is_private_ipv4(&"172.32.0.1".parse().unwrap()));
        assert!(!is_private_ipv4(&"172.15.255.255".parse().unwrap()));
    }

    #[test]
    fn blocks_private_ipv6_ranges() {
        assert!(is_private_ipv6(&"::1".parse().unwrap()));
        assert!(is_private_ipv6(&"fc00::1".parse().unwrap()));
        assert!(is_private_ipv6(&"fd00::1".parse().unwrap()));
        assert!(is_private_ipv6(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn localhost_hostname_variants() {
        assert!(is_localhost_hostname("localhost"));
        assert!(is_localhost_hostname("foo.local"));
        assert!(is_localhost_hostname("a.localhost"));
        assert!(!is_localhost_hostname("example.com"));
    }
}
