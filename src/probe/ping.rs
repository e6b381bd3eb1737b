use std::io::ErrorKind;
use std::process::{Command, Stdio};
use std::time;

use log::{debug, trace};

use super::{ProbeOutcome, ProbeRequest, Prober};
use crate::cancel::CancelToken;

const POLL_INTERVAL: time::Duration = time::Duration::from_millis(10);

const FRAG_PATTERNS: &[&str] = &[
    "message too long",  // iputils, local interface too small
    "frag needed",  // iputils, ICMP type 3 code 4 from a router
    "fragmentation needed",
    "packet needs to be fragmented",  // windows
];

const EXEC_ERROR_PATTERNS: &[&str] = &[
    "name or service not known",
    "unknown host",
    "temporary failure in name resolution",
    "could not find host",  // windows
    "operation not permitted",
    "permission denied",
    "invalid argument",
    "usage:",
];

/// Command line dialect of the system ping utility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingFlavor {
    Iputils,
    Windows,
}

impl PingFlavor {
    pub fn native() -> Self {
        if cfg!(target_os = "windows") { PingFlavor::Windows } else { PingFlavor::Iputils }
    }

    pub fn args(&self, req: &ProbeRequest) -> Vec<String> {
        match self {
            PingFlavor::Iputils => {
                // -W takes whole seconds on older iputils. The hard deadline is enforced by us anyway.
                let wait_secs = u64::max(1, (req.timeout.as_millis() as u64 + 999) / 1000);
                vec![
                    "-n".into(), "-4".into(),
                    "-M".into(), "do".into(),
                    "-c".into(), "1".into(),
                    "-s".into(), req.payload_size.to_string(),
                    "-W".into(), wait_secs.to_string(),
                    req.target.clone(),
                ]
            },
            PingFlavor::Windows => vec![
                "-4".into(), "-f".into(),
                "-l".into(), req.payload_size.to_string(),
                "-n".into(), "1".into(),
                "-w".into(), req.timeout.as_millis().to_string(),
                req.target.clone(),
            ],
        }
    }
}

/// Extract "mtu = 1400" / "mtu=1400" from one lowercased output line
fn parse_reported_mtu(line: &str) -> Option<usize> {
    let start = line.rfind("mtu")? + 3;
    let rest = line[start..].trim_start_matches(|c: char| c == ' ' || c == '=');
    let digits_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..digits_len].parse().ok()
}

/// Map the exit code and combined stdout/stderr of one ping run to an outcome.
pub fn classify(exit_code: Option<i32>, output: &str) -> ProbeOutcome {
    let lower = output.to_lowercase();

    if let Some(line) = lower.lines().find(|l| FRAG_PATTERNS.iter().any(|pat| l.contains(pat))) {
        return ProbeOutcome::NeedsFragmentation { reported_mtu: parse_reported_mtu(line) };
    }
    // "64 bytes from 1.1.1.1: icmp_seq=1 ttl=57" / "Reply from 1.1.1.1: bytes=32 time=5ms TTL=57"
    if lower.lines().any(|l| l.contains("ttl=") && l.contains("bytes")) {
        return ProbeOutcome::Success;
    }
    if lower.contains("unreachable") {
        return ProbeOutcome::Unreachable;
    }
    if EXEC_ERROR_PATTERNS.iter().any(|pat| lower.contains(pat)) || exit_code.map_or(false, |c| c > 1) {
        let message = output.lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("ping failed without output");
        return ProbeOutcome::ExecutionError(message.to_owned());
    }
    ProbeOutcome::Timeout
}

/// Probe executor backed by the system ping utility
pub struct PingProber {
    program: String,
    flavor: PingFlavor,
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new("ping", PingFlavor::native())
    }
}

impl PingProber {
    pub fn new<S: Into<String>>(program: S, flavor: PingFlavor) -> Self {
        Self {
            program: program.into(),
            flavor,
        }
    }
}

impl Prober for PingProber {
    fn probe(&self, req: &ProbeRequest, cancel: &CancelToken) -> ProbeOutcome {
        if cancel.is_cancelled() {
            return ProbeOutcome::Timeout;
        }

        let args = self.flavor.args(req);
        trace!("Running {} {}", self.program, args.join(" "));
        let mut child = match Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound =>
                return ProbeOutcome::ExecutionError(format!("{} not found", self.program)),
            Err(e) =>
                return ProbeOutcome::ExecutionError(format!("Failed to run {}: {e}", self.program)),
        };

        let deadline = time::Instant::now() + req.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {},
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return ProbeOutcome::ExecutionError(format!("Failed to wait for {}: {e}", self.program));
                },
            }
            let now = time::Instant::now();
            if cancel.is_cancelled() || now >= deadline {
                debug!("Killing ping for {} size {}", req.target, req.payload_size);
                let _ = child.kill();
                let _ = child.wait();
                return ProbeOutcome::Timeout;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }

        let output = match child.wait_with_output() {
            Ok(output) => output,
            Err(e) => return ProbeOutcome::ExecutionError(format!("Failed to read ping output: {e}")),
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        trace!("ping output ({:?}): {}", output.status.code(), text.trim_end());

        classify(output.status.code(), &text)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const IPUTILS_SUCCESS: &str = "\
PING 1.1.1.1 (1.1.1.1) 1400(1428) bytes of data.
1408 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=11.2 ms

--- 1.1.1.1 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
";

    const IPUTILS_LOCAL_TOO_BIG: &str = "\
PING 1.1.1.1 (1.1.1.1) 1473(1501) bytes of data.
ping: local error: message too long, mtu=1500

--- 1.1.1.1 ping statistics ---
1 packets transmitted, 0 received, +1 errors, 100% packet loss, time 0ms
";

    const IPUTILS_FRAG_NEEDED: &str = "\
PING 10.0.0.1 (10.0.0.1) 1450(1478) bytes of data.
From 192.168.1.1 icmp_seq=1 Frag needed and DF set (mtu = 1420)

--- 10.0.0.1 ping statistics ---
1 packets transmitted, 0 received, +1 errors, 100% packet loss, time 0ms
";

    const IPUTILS_UNREACHABLE: &str = "\
PING 10.9.9.9 (10.9.9.9) 56(84) bytes of data.
From 10.0.0.1 icmp_seq=1 Destination Host Unreachable

--- 10.9.9.9 ping statistics ---
1 packets transmitted, 0 received, +1 errors, 100% packet loss, time 0ms
";

    const IPUTILS_NO_REPLY: &str = "\
PING 10.9.9.9 (10.9.9.9) 56(84) bytes of data.

--- 10.9.9.9 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";

    const WINDOWS_SUCCESS: &str = "\
Pinging 1.1.1.1 with 1400 bytes of data:
Reply from 1.1.1.1: bytes=1400 time=12ms TTL=57
";

    const WINDOWS_FRAG: &str = "\
Pinging 1.1.1.1 with 1473 bytes of data:
Packet needs to be fragmented but DF set.
";

    const WINDOWS_TIMEOUT: &str = "\
Pinging 10.9.9.9 with 32 bytes of data:
Request timed out.
";

    #[test]
    fn test_classify_iputils() {
        assert_eq!(classify(Some(0), IPUTILS_SUCCESS), ProbeOutcome::Success);
        assert_eq!(classify(Some(1), IPUTILS_LOCAL_TOO_BIG),
                   ProbeOutcome::NeedsFragmentation { reported_mtu: Some(1500) });
        assert_eq!(classify(Some(1), IPUTILS_FRAG_NEEDED),
                   ProbeOutcome::NeedsFragmentation { reported_mtu: Some(1420) });
        assert_eq!(classify(Some(1), IPUTILS_UNREACHABLE), ProbeOutcome::Unreachable);
        assert_eq!(classify(Some(1), IPUTILS_NO_REPLY), ProbeOutcome::Timeout);
    }

    #[test]
    fn test_classify_windows() {
        assert_eq!(classify(Some(0), WINDOWS_SUCCESS), ProbeOutcome::Success);
        assert_eq!(classify(Some(1), WINDOWS_FRAG),
                   ProbeOutcome::NeedsFragmentation { reported_mtu: None });
        assert_eq!(classify(Some(1), WINDOWS_TIMEOUT), ProbeOutcome::Timeout);
    }

    #[test]
    fn test_classify_execution_errors() {
        assert_eq!(classify(Some(2), "ping: nosuchhost: Name or service not known\n"),
                   ProbeOutcome::ExecutionError("ping: nosuchhost: Name or service not known".into()));
        assert!(matches!(classify(Some(2), "ping: socket: Operation not permitted\n"),
                         ProbeOutcome::ExecutionError(_)));
        assert!(matches!(classify(Some(2), ""), ProbeOutcome::ExecutionError(_)));
        // killed by a signal, nothing printed
        assert_eq!(classify(None, ""), ProbeOutcome::Timeout);
    }

    #[test]
    fn test_iputils_args() {
        let req = ProbeRequest::new("1.1.1.1", 1472, time::Duration::from_millis(1500));
        assert_eq!(PingFlavor::Iputils.args(&req).join(" "),
                   "-n -4 -M do -c 1 -s 1472 -W 2 1.1.1.1");

        let req = ProbeRequest::new("1.1.1.1", 8, time::Duration::from_millis(100));
        assert_eq!(PingFlavor::Iputils.args(&req).join(" "),
                   "-n -4 -M do -c 1 -s 8 -W 1 1.1.1.1");
    }

    #[test]
    fn test_windows_args() {
        let req = ProbeRequest::new("1.1.1.1", 1472, time::Duration::from_millis(1500));
        assert_eq!(PingFlavor::Windows.args(&req).join(" "),
                   "-4 -f -l 1472 -n 1 -w 1500 1.1.1.1");
    }

    #[test]
    fn test_missing_program_is_execution_error() {
        let prober = PingProber::new("/nonexistent/ping", PingFlavor::Iputils);
        let req = ProbeRequest::new("127.0.0.1", 100, time::Duration::from_millis(200));
        assert!(matches!(prober.probe(&req, &CancelToken::new()), ProbeOutcome::ExecutionError(_)));
    }

    #[test]
    fn test_reported_mtu_ignores_hostnames() {
        let output = "\
PING mtu.example.net (10.0.0.1) 1450(1478) bytes of data.
From mtu9000.example.net (192.168.1.1) icmp_seq=1 Frag needed and DF set (mtu = 1420)
";
        assert_eq!(classify(Some(1), output),
                   ProbeOutcome::NeedsFragmentation { reported_mtu: Some(1420) });
    }

    /// A stand-in for ping that never answers
    fn hanging_ping(name: &str) -> anyhow::Result<std::path::PathBuf> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let path = std::env::temp_dir().join(format!("mtufind-{}-{name}", std::process::id()));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o755)
            .open(&path)?;
        file.write_all(b"#!/bin/sh\nexec sleep 5\n")?;
        drop(file);
        Ok(path)
    }

    #[test]
    fn test_hanging_ping_is_killed_at_deadline() -> anyhow::Result<()> {
        let script = hanging_ping("deadline")?;
        let prober = PingProber::new(script.to_string_lossy(), PingFlavor::Iputils);
        let req = ProbeRequest::new("127.0.0.1", 100, time::Duration::from_millis(300));

        let start = time::Instant::now();
        let outcome = prober.probe(&req, &CancelToken::new());
        let elapsed = start.elapsed();
        let _ = std::fs::remove_file(&script);

        assert_eq!(outcome, ProbeOutcome::Timeout);
        assert!(elapsed >= time::Duration::from_millis(300));
        assert!(elapsed < time::Duration::from_millis(1500), "took {elapsed:?}");
        Ok(())
    }

    #[test]
    fn test_cancel_interrupts_running_ping() -> anyhow::Result<()> {
        let script = hanging_ping("cancel")?;
        let prober = PingProber::new(script.to_string_lossy(), PingFlavor::Iputils);
        let req = ProbeRequest::new("127.0.0.1", 100, time::Duration::from_secs(10));
        let cancel = CancelToken::new();

        let start = time::Instant::now();
        let outcome = std::thread::scope(|s| {
            let cancel_ = cancel.clone();
            s.spawn(move || {
                std::thread::sleep(time::Duration::from_millis(200));
                cancel_.cancel();
            });
            prober.probe(&req, &cancel)
        });
        let elapsed = start.elapsed();
        let _ = std::fs::remove_file(&script);

        assert_eq!(outcome, ProbeOutcome::Timeout);
        assert!(elapsed < time::Duration::from_secs(2), "took {elapsed:?}");
        Ok(())
    }

    #[test]
    fn test_cancelled_probe_does_not_run() {
        let prober = PingProber::new("/nonexistent/ping", PingFlavor::Iputils);
        let req = ProbeRequest::new("127.0.0.1", 100, time::Duration::from_millis(200));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(prober.probe(&req, &cancel), ProbeOutcome::Timeout);
    }
}
