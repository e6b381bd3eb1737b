use std::process::ExitCode;
use std::sync::OnceLock;
use std::time::Duration;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::info;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use mtufind::cancel::CancelToken;
use mtufind::constants::{
    DEFAULT_INCONCLUSIVE_BUDGET, DEFAULT_MIN_TUNNEL_MTU, DEFAULT_PAYLOAD_FLOOR,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_TARGET, DEFAULT_TUNNEL_OVERHEAD,
};
use mtufind::error::SearchError;
use mtufind::interface::query_interface_mtu;
use mtufind::probe::ping::PingProber;
use mtufind::probe::resolve_ipv4;
use mtufind::search::{InconclusivePolicy, MtuResult, MtuSearch, SearchConfig};

/// Find the path MTU to a host and the MTU to configure on a tunnel running over it
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Hosts to probe, searched in parallel
    #[arg(default_value = DEFAULT_TARGET)]
    hosts: Vec<String>,

    /// Interface whose MTU is reported (default: the one carrying the default route)
    #[arg(short, long)]
    interface: Option<String>,

    /// Largest ICMP payload to try (default: interface MTU - 28, or 1472)
    #[arg(long)]
    ceiling: Option<usize>,

    /// Smallest ICMP payload considered; probed first when above 8
    #[arg(long, default_value_t = DEFAULT_PAYLOAD_FLOOR)]
    floor: usize,

    /// Per-probe timeout in milliseconds
    #[arg(short = 'w', long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Replies required at a size before it counts as passing
    #[arg(short = 'n', long, default_value_t = 1)]
    attempts: u32,

    /// Give up after this many timeouts/unreachables in a row
    #[arg(long, default_value_t = DEFAULT_INCONCLUSIVE_BUDGET)]
    inconclusive_budget: u32,

    /// Probe the same size again after a timeout instead of treating it as too large
    #[arg(long)]
    no_shrink_on_inconclusive: bool,

    /// Encapsulation overhead of the tunnel, in bytes
    #[arg(long, default_value_t = DEFAULT_TUNNEL_OVERHEAD)]
    tunnel_overhead: usize,

    /// Never recommend a tunnel MTU below this
    #[arg(long, default_value_t = DEFAULT_MIN_TUNNEL_MTU)]
    min_tunnel_mtu: usize,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

impl Args {
    fn search_config(&self) -> SearchConfig {
        SearchConfig {
            floor: self.floor,
            ceiling: self.ceiling,
            probe_timeout: Duration::from_millis(self.timeout_ms),
            attempts_per_size: self.attempts,
            inconclusive: InconclusivePolicy {
                budget: self.inconclusive_budget,
                shrink_high: !self.no_shrink_on_inconclusive,
            },
            tunnel_overhead: self.tunnel_overhead,
            min_tunnel_mtu: self.min_tunnel_mtu,
            ..SearchConfig::default()
        }
    }
}

static INTERRUPT: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    if let Some(cancel) = INTERRUPT.get() {
        cancel.cancel();
    }
}

fn install_interrupt_handler(cancel: &CancelToken) -> anyhow::Result<()> {
    let _ = INTERRUPT.set(cancel.clone());
    let action = SigAction::new(SigHandler::Handler(on_interrupt), SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

fn print_result(host: &str, result: &MtuResult) {
    if host == result.target {
        println!("{host}");
    } else {
        println!("{host} ({})", result.target);
    }
    match result.interface_mtu {
        Some(mtu) => println!("  Interface MTU:          {mtu}"),
        None => println!("  Interface MTU:          -"),
    }
    println!("  Path MTU:               {}", result.path_mtu);
    println!("  Recommended tunnel MTU: {}{}", result.recommended_tunnel_mtu,
             if result.constrained { " (raised to minimum)" } else { "" });
    println!("  Probes:                 {}", result.probes);
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(args.verbose.log_level_filter())
        .init()?;

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel)?;

    let interface_mtu = query_interface_mtu(args.interface.as_deref());
    let targets: Vec<String> = args.hosts.iter()
        .map(|host| resolve_ipv4(host.trim()))
        .collect();
    info!("Probing {} host(s), interface MTU {:?}", targets.len(), interface_mtu);

    let search = MtuSearch::new(PingProber::default(), args.search_config(), cancel);
    let results = search.discover_all(&targets, interface_mtu);

    for (host, result) in args.hosts.iter().zip(&results) {
        match result {
            Ok(result) => print_result(host, result),
            Err(e) => eprintln!("{host}: {e}"),
        }
    }
    Ok(ExitCode::from(exit_status(&results)))
}

/// 130 if any search was interrupted, 1 if any other search failed, 0 otherwise
fn exit_status(results: &[Result<MtuResult, SearchError>]) -> u8 {
    let errors = results.iter().filter_map(|r| r.as_ref().err());
    let mut status = 0;
    for e in errors {
        match e {
            SearchError::Cancelled { .. } => return 130,
            _ => status = 1,
        }
    }
    status
}
