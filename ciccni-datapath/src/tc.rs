//! Egress rate limiting with HTB over rtnetlink.
//!
//! Builds a minimal HTB tree on a container interface:
//!
//! ```text
//! qdisc 1:0 htb
//!   └─ class 1:1 htb rate <rate> ceil <rate+burst>
//!        └─ filter u32 "ip dst <pod network>" → flowid 1:1
//! ```
//!
//! The messages are encoded by hand and written to a raw NETLINK_ROUTE
//! socket. All functions here are synchronous so they can run on a blocking
//! thread that has been moved into the container's network namespace (the
//! netlink socket must be created there for the qdisc to land on the right
//! interface).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use ipnet::Ipv4Net;
use regex::Regex;

use crate::error::{DatapathError, Result};

/// Per-pod shaping parameters, in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcArgs {
    pub rate: u32,
    pub burst: u32,
}

// Netlink message plumbing
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_REPLACE: u16 = 0x100;
const NLMSG_ERROR: u16 = 0x2;

const RTM_NEWQDISC: u16 = 36;
const RTM_NEWTCLASS: u16 = 40;
const RTM_NEWTFILTER: u16 = 44;

const SOL_NETLINK: libc::c_int = 270;
const NETLINK_EXT_ACK: libc::c_int = 11;

// Handles
const TC_H_ROOT: u32 = 0xFFFF_FFFF;
const HANDLE_ROOT_QDISC: u32 = 0x0001_0000; // 1:0
const HANDLE_SHAPING_CLASS: u32 = 0x0001_0001; // 1:1

// Attribute kinds
const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const NLA_F_NESTED: u16 = 0x8000;

const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;

const TCA_U32_CLASSID: u16 = 1;
const TCA_U32_SEL: u16 = 5;
const TCA_U32_FLAGS: u16 = 11;

const TC_U32_TERMINAL: u8 = 1;
const TCA_CLS_FLAGS_SKIP_HW: u32 = 1;

/// ETH_P_IP in network byte order, as the kernel expects in tcm_info.
const ETH_P_IP_BE: u16 = 0x0008;
const FILTER_PRIORITY: u16 = 1;

/// Offset of the destination address within the IP header.
const IP_DST_OFFSET: i32 = 16;

// ============================================================================
// Public API
// ============================================================================

/// Install the full egress limiter on an interface: root qdisc, shaping
/// class, and a u32 filter steering traffic for `pod_network` into it.
pub fn setup_egress_limit(ifname: &str, args: &TcArgs, pod_network: Ipv4Net) -> Result<()> {
    create_root_htb(ifname)?;
    create_htb_class(ifname, args.rate, args.burst)?;
    add_filter_dst_cidr(ifname, pod_network)?;
    Ok(())
}

/// `tc qdisc add dev <ifname> root handle 1:0 htb`
pub fn create_root_htb(ifname: &str) -> Result<()> {
    let ifindex = ifindex(ifname)?;
    let mut attrs = Vec::new();
    push_attr(&mut attrs, TCA_KIND, b"htb\0");
    let mut options = Vec::new();
    push_attr(&mut options, TCA_HTB_INIT, &htb_glob());
    push_attr(&mut attrs, TCA_OPTIONS | NLA_F_NESTED, &options);

    let msg = tc_request(
        RTM_NEWQDISC,
        NLM_F_CREATE | NLM_F_REPLACE,
        ifindex,
        HANDLE_ROOT_QDISC,
        TC_H_ROOT,
        0,
        &attrs,
    );
    send_and_ack(&msg)
}

/// `tc class add dev <ifname> parent 1:0 classid 1:1 htb rate <rate> ceil <rate+burst>`
///
/// Rates arrive in bits per second (the annotation unit) and are converted
/// to the kernel's bytes-per-second rate spec.
pub fn create_htb_class(ifname: &str, rate_bps: u32, burst_bps: u32) -> Result<()> {
    if rate_bps == 0 {
        return Err(DatapathError::InvalidBandwidth("rate must be non-zero".into()));
    }
    let ifindex = ifindex(ifname)?;
    let rate_bytes = rate_bps / 8;
    let ceil_bytes = rate_bps.saturating_add(burst_bps) / 8;

    let mut attrs = Vec::new();
    push_attr(&mut attrs, TCA_KIND, b"htb\0");
    let mut options = Vec::new();
    push_attr(&mut options, TCA_HTB_PARMS, &htb_class_parms(rate_bytes, ceil_bytes));
    push_attr(&mut attrs, TCA_OPTIONS | NLA_F_NESTED, &options);

    let msg = tc_request(
        RTM_NEWTCLASS,
        NLM_F_CREATE | NLM_F_REPLACE,
        ifindex,
        HANDLE_SHAPING_CLASS,
        HANDLE_ROOT_QDISC,
        0,
        &attrs,
    );
    send_and_ack(&msg)
}

/// `tc filter add dev <ifname> protocol ip parent 1:0 prio 1 u32
///  match ip dst <cidr> flowid 1:1`
pub fn add_filter_dst_cidr(ifname: &str, dst: Ipv4Net) -> Result<()> {
    let ifindex = ifindex(ifname)?;

    let mut attrs = Vec::new();
    push_attr(&mut attrs, TCA_KIND, b"u32\0");
    let mut options = Vec::new();
    push_attr(&mut options, TCA_U32_CLASSID, &HANDLE_SHAPING_CLASS.to_ne_bytes());
    push_attr(&mut options, TCA_U32_SEL, &u32_sel_dst(dst));
    push_attr(&mut options, TCA_U32_FLAGS, &TCA_CLS_FLAGS_SKIP_HW.to_ne_bytes());
    push_attr(&mut attrs, TCA_OPTIONS | NLA_F_NESTED, &options);

    let info = (u32::from(FILTER_PRIORITY) << 16) | u32::from(ETH_P_IP_BE);
    let msg = tc_request(
        RTM_NEWTFILTER,
        NLM_F_CREATE | NLM_F_REPLACE,
        ifindex,
        0,
        HANDLE_ROOT_QDISC,
        info,
        &attrs,
    );
    send_and_ack(&msg)
}

/// Parse a human bandwidth string into bits per second.
///
/// Accepted units: `k|K|kbps|Kbps` (×1 000) and `m|M|mbps|Mbps`
/// (×1 000 000); a bare number is taken as bits per second. Zero and
/// malformed strings are rejected.
pub fn validate_bandwidth(bandwidth: &str) -> Result<u32> {
    let grammar = Regex::new(r"^[1-9][0-9]*(k|K|m|M|kbps|mbps|Kbps|Mbps)?$")
        .expect("bandwidth grammar compiles");
    if !grammar.is_match(bandwidth) {
        return Err(DatapathError::InvalidBandwidth(bandwidth.to_string()));
    }

    let digits: String = bandwidth.chars().take_while(char::is_ascii_digit).collect();
    let number: u64 = digits
        .parse()
        .map_err(|_| DatapathError::InvalidBandwidth(bandwidth.to_string()))?;
    let multiplier: u64 = match &bandwidth[digits.len()..] {
        "k" | "K" | "kbps" | "Kbps" => 1_000,
        "m" | "M" | "mbps" | "Mbps" => 1_000_000,
        "" => 1,
        _ => return Err(DatapathError::InvalidBandwidth(bandwidth.to_string())),
    };

    u32::try_from(number * multiplier)
        .map_err(|_| DatapathError::InvalidBandwidth(bandwidth.to_string()))
}

// ============================================================================
// Message encoding
// ============================================================================

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Append one netlink attribute, padded to 4 bytes.
fn push_attr(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let len = 4 + payload.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(buf.len() + (align4(len) - len), 0);
}

/// nlmsghdr + tcmsg + attributes.
fn tc_request(
    msg_type: u16,
    extra_flags: u16,
    ifindex: i32,
    handle: u32,
    parent: u32,
    info: u32,
    attrs: &[u8],
) -> Vec<u8> {
    let len = 16 + 20 + attrs.len();
    let mut buf = Vec::with_capacity(len);
    // nlmsghdr
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_ACK | extra_flags).to_ne_bytes());
    buf.extend_from_slice(&1u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid
    // tcmsg
    buf.push(libc::AF_UNSPEC as u8);
    buf.extend_from_slice(&[0u8; 3]); // padding
    buf.extend_from_slice(&ifindex.to_ne_bytes());
    buf.extend_from_slice(&handle.to_ne_bytes());
    buf.extend_from_slice(&parent.to_ne_bytes());
    buf.extend_from_slice(&info.to_ne_bytes());
    buf.extend_from_slice(attrs);
    buf
}

/// struct tc_htb_glob
fn htb_glob() -> [u8; 20] {
    let mut glob = [0u8; 20];
    glob[0..4].copy_from_slice(&3u32.to_ne_bytes()); // version
    glob[4..8].copy_from_slice(&10u32.to_ne_bytes()); // rate2quantum
    // defcls, debug, direct_pkts stay zero
    glob
}

/// struct tc_ratespec (12 bytes), rate in bytes per second.
fn ratespec(rate_bytes: u32) -> [u8; 12] {
    let mut spec = [0u8; 12];
    spec[0] = 0x3; // cell_log
    spec[1] = 0x1; // linklayer: ethernet
    // overhead = 0
    spec[4..6].copy_from_slice(&(-1i16).to_ne_bytes()); // cell_align
    // mpu = 0
    spec[8..12].copy_from_slice(&rate_bytes.to_ne_bytes());
    spec
}

/// struct tc_htb_opt: rate + ceil rate specs followed by buffer, cbuffer,
/// quantum, level, prio.
fn htb_class_parms(rate_bytes: u32, ceil_bytes: u32) -> Vec<u8> {
    let mut parms = Vec::with_capacity(44);
    parms.extend_from_slice(&ratespec(rate_bytes));
    parms.extend_from_slice(&ratespec(ceil_bytes));
    parms.extend_from_slice(&[0u8; 20]); // buffer, cbuffer, quantum, level, prio
    parms
}

/// struct tc_u32_sel with a single key matching the IP destination field.
fn u32_sel_dst(dst: Ipv4Net) -> Vec<u8> {
    let mut sel = Vec::with_capacity(32);
    sel.push(TC_U32_TERMINAL); // flags
    sel.push(0); // offshift
    sel.push(1); // nkeys
    sel.push(0); // implicit struct padding
    sel.extend_from_slice(&[0u8; 2]); // offmask
    sel.extend_from_slice(&[0u8; 2]); // off
    sel.extend_from_slice(&[0u8; 2]); // offoff
    sel.extend_from_slice(&[0u8; 2]); // hoff
    sel.extend_from_slice(&[0u8; 4]); // hmask

    // struct tc_u32_key: mask and value in network byte order.
    let network = u32::from(dst.network());
    let mask = u32::from(dst.netmask());
    sel.extend_from_slice(&mask.to_be_bytes());
    sel.extend_from_slice(&(network & mask).to_be_bytes());
    sel.extend_from_slice(&IP_DST_OFFSET.to_ne_bytes());
    sel.extend_from_slice(&0i32.to_ne_bytes()); // offmask
    sel
}

// ============================================================================
// Netlink socket
// ============================================================================

fn ifindex(ifname: &str) -> Result<i32> {
    let index = nix::net::if_::if_nametoindex(ifname)
        .map_err(|_| DatapathError::LinkNotFound(ifname.to_string()))?;
    Ok(index as i32)
}

fn open_route_socket() -> Result<OwnedFd> {
    // Safety: plain socket(2) call; the fd is owned immediately below.
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(DatapathError::Io(std::io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // Extended acks carry kernel error strings; best-effort (pre-4.12
    // kernels return ENOPROTOOPT).
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_NETLINK,
            NETLINK_EXT_ACK,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    Ok(fd)
}

/// Send one request and wait for the kernel's ack (an NLMSG_ERROR with a
/// zero code).
fn send_and_ack(msg: &[u8]) -> Result<()> {
    let socket = open_route_socket()?;

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    let sent = unsafe {
        libc::sendto(
            socket.as_raw_fd(),
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
            0,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(DatapathError::Io(std::io::Error::last_os_error()));
    }

    let mut buf = [0u8; 4096];
    let received = unsafe {
        libc::recv(
            socket.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        )
    };
    if received < 0 {
        return Err(DatapathError::Io(std::io::Error::last_os_error()));
    }
    let received = received as usize;
    if received < 20 {
        return Err(DatapathError::Netlink("short netlink reply".to_string()));
    }

    let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
    if msg_type == NLMSG_ERROR {
        let code = i32::from_ne_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if code != 0 {
            let err = std::io::Error::from_raw_os_error(-code);
            return Err(DatapathError::Netlink(format!("tc request failed: {err}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_units() {
        assert_eq!(validate_bandwidth("100k").unwrap(), 100_000);
        assert_eq!(validate_bandwidth("5M").unwrap(), 5_000_000);
        assert_eq!(validate_bandwidth("20Mbps").unwrap(), 20_000_000);
        assert_eq!(validate_bandwidth("42").unwrap(), 42);
        assert_eq!(validate_bandwidth("7Kbps").unwrap(), 7_000);
    }

    #[test]
    fn bandwidth_rejects_zero_and_garbage() {
        assert!(validate_bandwidth("0k").is_err());
        assert!(validate_bandwidth("abc").is_err());
        assert!(validate_bandwidth("").is_err());
        assert!(validate_bandwidth("-5M").is_err());
        assert!(validate_bandwidth("5G").is_err());
    }

    #[test]
    fn attributes_are_aligned() {
        let mut buf = Vec::new();
        push_attr(&mut buf, TCA_KIND, b"htb\0");
        assert_eq!(buf.len() % 4, 0);
        // length field covers header + payload, unpadded
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), 8);

        let mut odd = Vec::new();
        push_attr(&mut odd, TCA_KIND, b"u32\0\0");
        assert_eq!(odd.len(), 12); // 4 + 5 padded to 12
    }

    #[test]
    fn ratespec_layout() {
        let spec = ratespec(2_500_000);
        assert_eq!(spec.len(), 12);
        assert_eq!(spec[0], 0x3);
        assert_eq!(spec[1], 0x1);
        assert_eq!(u32::from_ne_bytes([spec[8], spec[9], spec[10], spec[11]]), 2_500_000);
    }

    #[test]
    fn htb_class_parms_is_44_bytes() {
        assert_eq!(htb_class_parms(1_000, 2_000).len(), 44);
    }

    #[test]
    fn u32_selector_matches_destination() {
        let dst: Ipv4Net = "10.244.0.0/16".parse().unwrap();
        let sel = u32_sel_dst(dst);
        assert_eq!(sel.len(), 32);
        assert_eq!(sel[0], TC_U32_TERMINAL);
        assert_eq!(sel[2], 1); // one key
        // key mask/value are big-endian
        assert_eq!(&sel[16..20], &[0xff, 0xff, 0x00, 0x00]);
        assert_eq!(&sel[20..24], &[10, 244, 0, 0]);
        let off = i32::from_ne_bytes([sel[24], sel[25], sel[26], sel[27]]);
        assert_eq!(off, IP_DST_OFFSET);
    }

    #[test]
    fn request_header_covers_whole_message() {
        let mut attrs = Vec::new();
        push_attr(&mut attrs, TCA_KIND, b"htb\0");
        let msg = tc_request(RTM_NEWQDISC, NLM_F_CREATE, 3, HANDLE_ROOT_QDISC, TC_H_ROOT, 0, &attrs);
        let len = u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]) as usize;
        assert_eq!(len, msg.len());
        assert_eq!(u16::from_ne_bytes([msg[4], msg[5]]), RTM_NEWQDISC);
    }

    #[test]
    fn rate_is_converted_to_bytes() {
        // 20 Mbit/s shaping → 2.5 MB/s on the wire spec
        let parms = htb_class_parms(20_000_000 / 8, 22_000_000 / 8);
        let rate = u32::from_ne_bytes([parms[8], parms[9], parms[10], parms[11]]);
        assert_eq!(rate, 2_500_000);
    }
}
