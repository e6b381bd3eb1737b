use std::net::{Ipv4Addr, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use crate::cancel::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Echo reply received, the payload went through unfragmented
    Success,
    /// Some hop (or the local stack) refused the packet because DF is set.
    /// Carries the next-hop MTU when the reply reports it; informational only,
    /// the search still moves its bounds by probing.
    NeedsFragmentation { reported_mtu: Option<usize> },
    /// Explicit destination unreachable, not caused by fragmentation
    Unreachable,
    Timeout,
    /// The probe facility itself could not run (missing binary, permission, bad target)
    ExecutionError(String),
}

impl ProbeOutcome {
    /// Timeout and Unreachable say nothing about whether the size fits.
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, ProbeOutcome::Timeout | ProbeOutcome::Unreachable)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub target: String,
    /// ICMP payload size, excluding the IP and ICMP headers
    pub payload_size: usize,
    pub timeout: Duration,
}

impl ProbeRequest {
    pub fn new<S: Into<String>>(target: S, payload_size: usize, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            payload_size,
            timeout,
        }
    }
}

pub trait Prober: Send + Sync {
    // Sends exactly one DF probe, no retries. Must return within `req.timeout`
    // (plus process bookkeeping), and should return early once `cancel` is set.
    fn probe(&self, req: &ProbeRequest, cancel: &CancelToken) -> ProbeOutcome;
}

impl<T> Prober for &T where T: Prober + ?Sized {
    fn probe(&self, req: &ProbeRequest, cancel: &CancelToken) -> ProbeOutcome {
        (**self).probe(req, cancel)
    }
}

/// Return the first IPv4 address of host, or host itself if it is already IPv4 or cannot be resolved.
/// DF probing only makes sense over IPv4; resolution errors are left for the probe to report.
pub fn resolve_ipv4(host: &str) -> String {
    if host.parse::<Ipv4Addr>().is_ok() {
        return host.to_owned();
    }
    match (host, 0).to_socket_addrs() {
        Ok(addrs) => {
            let resolved = addrs
                .filter(|addr| addr.is_ipv4())
                .map(|addr| addr.ip().to_string())
                .next();
            match resolved {
                Some(ip) => {
                    debug!("Resolved {host} to {ip}");
                    ip
                },
                None => host.to_owned(),
            }
        },
        Err(e) => {
            debug!("Unable to resolve {host}: {e}");
            host.to_owned()
        },
    }
}


pub mod ping;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconclusive_outcomes() {
        assert!(ProbeOutcome::Timeout.is_inconclusive());
        assert!(ProbeOutcome::Unreachable.is_inconclusive());
        assert!(!ProbeOutcome::Success.is_inconclusive());
        assert!(!ProbeOutcome::NeedsFragmentation { reported_mtu: None }.is_inconclusive());
        assert!(!ProbeOutcome::ExecutionError("x".into()).is_inconclusive());
    }

    #[test]
    fn test_resolve_ipv4_literal() {
        assert_eq!(resolve_ipv4("1.1.1.1"), "1.1.1.1");
        assert_eq!(resolve_ipv4("127.0.0.1"), "127.0.0.1");
    }
}
