use std::net::UdpSocket;
use std::os::fd::AsRawFd;

use anyhow::Result;
use log::debug;

const IFNAMSIZ: usize = 16;
const RTF_UP: u32 = 0x0001;

#[repr(C)]
struct Ifreq {
    pub ifrn_name: [std::ffi::c_char; IFNAMSIZ],
    pub ifru_mtu: std::ffi::c_int,
    // rest of the ifr_ifru union
    _pad: [u8; 20],
}

nix::ioctl_read_bad!(siocgifmtu, nix::libc::SIOCGIFMTU, Ifreq);

/// Interface carrying the default route, lowest metric first.
fn parse_default_route(route_table: &str) -> Option<String> {
    route_table.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 || fields[1] != "00000000" || fields[7] != "00000000" {
                return None;
            }
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            if flags & RTF_UP == 0 {
                return None;
            }
            let metric: u32 = fields[6].parse().ok()?;
            Some((metric, fields[0]))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, name)| name.to_owned())
}

/// Non-loopback interface that received the most bytes.
fn parse_busiest_interface(dev_stats: &str) -> Option<String> {
    dev_stats.lines()
        .skip(2)
        .filter_map(|line| {
            let (name, stats) = line.split_once(':')?;
            let name = name.trim();
            if name == "lo" {
                return None;
            }
            let rx_bytes: u64 = stats.split_whitespace().next()?.parse().ok()?;
            Some((rx_bytes, name))
        })
        .max_by_key(|(rx_bytes, _)| *rx_bytes)
        .map(|(_, name)| name.to_owned())
}

pub fn default_interface() -> Option<String> {
    if let Ok(route_table) = std::fs::read_to_string("/proc/net/route") {
        if let Some(name) = parse_default_route(&route_table) {
            return Some(name);
        }
    }
    let dev_stats = std::fs::read_to_string("/proc/net/dev").ok()?;
    parse_busiest_interface(&dev_stats)
}

pub fn interface_mtu<S: AsRef<str>>(ifname: S) -> Result<usize> {
    let ifname_bytes = ifname.as_ref().as_bytes();
    if ifname_bytes.is_empty() || ifname_bytes.len() >= IFNAMSIZ {
        anyhow::bail!("Invalid interface name {:?}", ifname.as_ref());
    }

    let mut ifreq = Ifreq {
        ifrn_name: [0; IFNAMSIZ],
        ifru_mtu: 0,
        _pad: [0; 20],
    };
    for (dst, src) in ifreq.ifrn_name.iter_mut().zip(ifname_bytes) {
        *dst = *src as std::ffi::c_char;
    }

    // any socket will do for interface ioctls
    let sock = UdpSocket::bind("0.0.0.0:0")?;
    unsafe {
        siocgifmtu(sock.as_raw_fd(), &mut ifreq)?;
    }
    if ifreq.ifru_mtu <= 0 {
        anyhow::bail!("Interface {} reported MTU {}", ifname.as_ref(), ifreq.ifru_mtu);
    }
    Ok(ifreq.ifru_mtu as usize)
}

/// MTU of the given interface, or of the default one. None if it cannot be determined.
pub fn query_interface_mtu(ifname: Option<&str>) -> Option<usize> {
    let ifname = match ifname {
        Some(name) => name.to_owned(),
        None => default_interface()?,
    };
    match interface_mtu(&ifname) {
        Ok(mtu) => {
            debug!("Interface {ifname} has MTU {mtu}");
            Some(mtu)
        },
        Err(e) => {
            debug!("Unable to get MTU of {ifname}: {e}");
            None
        },
    }
}
