//! Call-id generation.
//!
//! Ids are 16 bytes — 48-bit millisecond timestamp, 48-bit machine id
//! (IPv4 + port), 32-bit per-process counter — rendered as 26 characters
//! of Crockford base32. They sort lexicographically by creation time,
//! which keeps call listing cursors cheap.
//!
//! The machine id is process-wide immutable configuration: it is resolved
//! once at startup and read-only thereafter.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use rand::Rng;

static MACHINE_ID: OnceLock<u64> = OnceLock::new();
static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

const ENCODING: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

/// Set the machine id from this node's address and listen port.
///
/// Later calls are no-ops; the first caller wins.
pub fn set_machine_id(addr: Ipv4Addr, port: u16) {
    let octets = addr.octets();
    let id = (u64::from(octets[0]) << 40)
        | (u64::from(octets[1]) << 32)
        | (u64::from(octets[2]) << 24)
        | (u64::from(octets[3]) << 16)
        | u64::from(port);
    let _ = MACHINE_ID.set(id);
}

/// Resolve the first non-loopback IPv4 address of this host.
///
/// Routes a datagram socket towards a public address to learn the
/// preferred outbound interface; no packet is sent. Falls back to
/// loopback when the host has no route, which is fine for single-node
/// deployments but will produce duplicate ids in a cluster.
pub fn local_ipv4() -> Ipv4Addr {
    let probe = || -> Option<Ipv4Addr> {
        let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
        sock.connect("198.51.100.1:80").ok()?;
        match sock.local_addr().ok()?.ip() {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
            _ => None,
        }
    };
    probe().unwrap_or_else(|| {
        tracing::warn!(
            "could not find non-loopback ipv4 address, using 127.0.0.1 for ids; \
             beware of duplicate ids in a cluster"
        );
        Ipv4Addr::LOCALHOST
    })
}

/// Generate a new call id.
pub fn new_call_id() -> String {
    let machine = *MACHINE_ID.get_or_init(|| {
        // Tests and embedded uses that never called set_machine_id.
        let addr = Ipv4Addr::LOCALHOST.octets();
        (u64::from(addr[0]) << 40) | (u64::from(addr[3]) << 16)
    });
    let counter =
        COUNTER.get_or_init(|| AtomicU32::new(rand::thread_rng().gen::<u32>()));

    let millis = crate::models::now_millis();
    let seq = counter.fetch_add(1, Ordering::Relaxed);

    let mut bytes = [0u8; 16];
    bytes[..6].copy_from_slice(&millis.to_be_bytes()[2..8]);
    bytes[6..12].copy_from_slice(&machine.to_be_bytes()[2..8]);
    bytes[12..].copy_from_slice(&seq.to_be_bytes());
    encode_base32(&bytes)
}

/// Crockford base32 over 16 bytes → 26 chars (130 bits, top 2 unused).
fn encode_base32(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(26);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ENCODING[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ENCODING[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_fixed_length() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = new_call_id();
            assert_eq!(id.len(), 26);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn ids_sort_by_time() {
        let a = new_call_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_call_id();
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn encoding_is_crockford_lowercase() {
        let id = new_call_id();
        assert!(id
            .chars()
            .all(|c| ENCODING.contains(&(c as u8))));
    }
}
