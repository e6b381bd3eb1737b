use std::time::Duration;

// ICMP echo over IPv4: 20 bytes IP header + 8 bytes ICMP header.
// ping's payload size does not include either of them.
pub const IPV4_HEADER_LEN: usize = 20;
pub const ICMP_HEADER_LEN: usize = 8;
pub const PROBE_HEADER_OVERHEAD: usize = IPV4_HEADER_LEN + ICMP_HEADER_LEN;

pub const ETHERNET_MTU: usize = 1500;

// Largest ICMP payload that fits in a plain ethernet frame
pub const DEFAULT_PAYLOAD_CEILING: usize = ETHERNET_MTU - PROBE_HEADER_OVERHEAD;

// Sizes below this are never disputed by any hop, so they are assumed good without probing
pub const DEFAULT_PAYLOAD_FLOOR: usize = 0;

// A floor above this is probed before searching
pub const MIN_DISPUTED_PAYLOAD: usize = 8;

// WireGuard over IPv6 is 80 bytes (40 IP + 8 UDP + 32 WG), which also covers
// the IPv4 case and typical OpenVPN UDP setups.
pub const DEFAULT_TUNNEL_OVERHEAD: usize = 80;

// IPv4 minimum reassembly size. Recommendations never go below it.
pub const DEFAULT_MIN_TUNNEL_MTU: usize = 576;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_INCONCLUSIVE_BUDGET: u32 = 2;

pub const DEFAULT_TARGET: &str = "1.1.1.1";

static_assertions::const_assert_eq!(DEFAULT_PAYLOAD_CEILING, 1472);
static_assertions::const_assert!(DEFAULT_PAYLOAD_FLOOR < DEFAULT_PAYLOAD_CEILING);
static_assertions::const_assert!(DEFAULT_MIN_TUNNEL_MTU + DEFAULT_TUNNEL_OVERHEAD <= ETHERNET_MTU);
