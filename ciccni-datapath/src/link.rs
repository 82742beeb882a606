//! Veth, address, route and netns plumbing for pod interfaces.
//!
//! Container-side operations run against rtnetlink handles whose sockets
//! are created *inside* the target namespace: the creating thread enters
//! the netns, opens the connection, restores its own namespace, and the
//! resulting handle can then be driven from ordinary async code. Raw-socket
//! work (gratuitous ARP, TC) runs through [`Netns::run_sync`], which swaps
//! the namespace of a blocking-pool thread for the duration of the closure
//! and restores it on every exit path.

use std::fs::File;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use nix::sched::{setns, CloneFlags};
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::RouteAttribute;
use rtnetlink::{Handle, LinkUnspec, LinkVeth, RouteMessageBuilder};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::{DatapathError, Result};

const INTERFACE_NAME_LENGTH: usize = 15;
const POD_NAME_PREFIX_LENGTH: usize = 8;
const CONTAINER_KEY_CONNECTOR: &str = "-";

/// Calculates a suitable host-side interface name from the pod namespace
/// and pod name. Deterministic, length exactly 15 (the kernel's IFNAMSIZ
/// minus the terminator), with a negligible collision probability thanks to
/// the SHA-1 suffix.
pub fn generate_container_interface_name(pod_name: &str, pod_namespace: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{pod_namespace}/{pod_name}"));
    let pod_key = hex::encode(hasher.finalize());

    let mut prefix: String = pod_name.chars().filter(|c| *c != '-').collect();
    prefix.truncate(POD_NAME_PREFIX_LENGTH);

    let key_len = INTERFACE_NAME_LENGTH - prefix.len() - CONTAINER_KEY_CONNECTOR.len();
    format!("{prefix}{CONTAINER_KEY_CONNECTOR}{}", &pod_key[..key_len])
}

// ============================================================================
// Network namespaces
// ============================================================================

/// An open handle on a network namespace.
pub struct Netns {
    path: PathBuf,
    file: File,
}

impl Netns {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| DatapathError::Netns(format!("{}: {e}", path.display())))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// An rtnetlink handle whose socket lives inside this namespace.
    pub async fn rtnetlink_handle(&self) -> Result<Handle> {
        let runtime = tokio::runtime::Handle::current();
        let netns = self
            .file
            .try_clone()
            .map_err(|e| DatapathError::Netns(e.to_string()))?;

        tokio::task::spawn_blocking(move || -> Result<Handle> {
            let _ns = NetnsGuard::enter(&netns)?;
            // The connection socket has to be created in the runtime context
            // so its I/O driver registration lands on the right reactor.
            let _rt = runtime.enter();
            let (connection, handle, _) = rtnetlink::new_connection()?;
            runtime.spawn(connection);
            Ok(handle)
        })
        .await
        .map_err(|e| DatapathError::Internal(e.to_string()))?
    }

    /// Run a synchronous closure on a blocking thread that has been moved
    /// into this namespace.
    pub async fn run_sync<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let netns = self
            .file
            .try_clone()
            .map_err(|e| DatapathError::Netns(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _ns = NetnsGuard::enter(&netns)?;
            f()
        })
        .await
        .map_err(|e| DatapathError::Internal(e.to_string()))?
    }
}

/// Moves the current thread into a target netns; restores the original
/// namespace when dropped, whatever path the enclosing code takes out.
struct NetnsGuard {
    host: File,
}

impl NetnsGuard {
    fn enter(target: &File) -> Result<Self> {
        let host = File::open("/proc/thread-self/ns/net")
            .map_err(|e| DatapathError::Netns(format!("opening current netns: {e}")))?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| DatapathError::Netns(format!("entering netns: {e}")))?;
        Ok(Self { host })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.host.as_fd(), CloneFlags::CLONE_NEWNET) {
            // A thread stuck in a foreign netns must not be reused.
            tracing::error!(error = %e, "Failed to restore host netns, aborting thread");
            std::process::abort();
        }
    }
}

// ============================================================================
// Links
// ============================================================================

/// Identity of a kernel link.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub mac: Vec<u8>,
}

impl LinkInfo {
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Look a link up by name; `Ok(None)` when it does not exist.
pub async fn get_link(handle: &Handle, name: &str) -> Result<Option<LinkInfo>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(msg)) => {
            let mac = msg
                .attributes
                .iter()
                .find_map(|attr| match attr {
                    LinkAttribute::Address(mac) => Some(mac.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            Ok(Some(LinkInfo {
                name: name.to_string(),
                index: msg.header.index,
                mac,
            }))
        }
        Ok(None) => Ok(None),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(netlink_err(e)),
    }
}

/// Wait for a kernel link to appear (vswitchd creates internal ports
/// asynchronously).
pub async fn wait_for_link(
    handle: &Handle,
    name: &str,
    retries: usize,
    interval: Duration,
) -> Result<LinkInfo> {
    for attempt in 0..retries {
        if let Some(link) = get_link(handle, name).await? {
            return Ok(link);
        }
        debug!(link = %name, attempt, "Link not present yet, retrying");
        tokio::time::sleep(interval).await;
    }
    Err(DatapathError::LinkNotFound(name.to_string()))
}

pub async fn set_link_up(handle: &Handle, index: u32) -> Result<()> {
    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .map_err(netlink_err)
}

/// Add an address to a link unless it is already assigned.
pub async fn ensure_link_addr(
    handle: &Handle,
    index: u32,
    address: Ipv4Addr,
    prefix_len: u8,
) -> Result<()> {
    let mut addrs = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    while let Some(msg) = addrs.try_next().await.map_err(netlink_err)? {
        let present = msg.attributes.iter().any(|attr| {
            matches!(attr, AddressAttribute::Address(std::net::IpAddr::V4(ip)) if *ip == address)
        });
        if present {
            debug!(%address, index, "Address already assigned, leaving it alone");
            return Ok(());
        }
    }
    handle
        .address()
        .add(index, std::net::IpAddr::V4(address), prefix_len)
        .execute()
        .await
        .map_err(netlink_err)
}

// ============================================================================
// Veth pairs
// ============================================================================

/// The two ends of a pod's veth pair.
#[derive(Debug, Clone)]
pub struct VethPair {
    pub host: LinkInfo,
    pub container: LinkInfo,
}

/// Create the pod's veth pair inside its netns and move the host-side end
/// into the host namespace, bringing it up there.
///
/// Any pre-existing link with the container-side name is deleted first, so
/// a re-delivered ADD converges instead of failing.
pub async fn setup_veth_pair(
    host_handle: &Handle,
    netns: &Netns,
    ifname: &str,
    host_veth_name: &str,
    mtu: u32,
) -> Result<VethPair> {
    let ns_handle = netns.rtnetlink_handle().await?;

    if let Some(existing) = get_link(&ns_handle, ifname).await? {
        debug!(link = %ifname, netns = %netns.path().display(), "Deleting pre-existing container link");
        ns_handle
            .link()
            .del(existing.index)
            .execute()
            .await
            .map_err(netlink_err)?;
    }

    ns_handle
        .link()
        .add(LinkVeth::new(ifname, host_veth_name).mtu(mtu).build())
        .execute()
        .await
        .map_err(netlink_err)?;

    let container = get_link(&ns_handle, ifname)
        .await?
        .ok_or_else(|| DatapathError::LinkNotFound(ifname.to_string()))?;

    // Move the host-side end out to the host namespace.
    let host_ns = File::open("/proc/self/ns/net")
        .map_err(|e| DatapathError::Netns(format!("opening host netns: {e}")))?;
    ns_handle
        .link()
        .set(
            LinkUnspec::new_with_name(host_veth_name)
                .setns_by_fd(host_ns.as_raw_fd())
                .build(),
        )
        .execute()
        .await
        .map_err(netlink_err)?;

    let host = get_link(host_handle, host_veth_name)
        .await?
        .ok_or_else(|| DatapathError::LinkNotFound(host_veth_name.to_string()))?;
    set_link_up(host_handle, host.index).await?;

    debug!(
        host = %host.name,
        container = %container.name,
        netns = %netns.path().display(),
        "Created veth pair"
    );
    Ok(VethPair { host, container })
}

/// Delete a link inside a netns, tolerating its absence.
pub async fn delete_interface(netns: &Netns, ifname: &str) -> Result<()> {
    let ns_handle = netns.rtnetlink_handle().await?;
    match get_link(&ns_handle, ifname).await? {
        Some(link) => ns_handle
            .link()
            .del(link.index)
            .execute()
            .await
            .map_err(netlink_err),
        None => {
            debug!(link = %ifname, netns = %netns.path().display(), "Link already gone");
            Ok(())
        }
    }
}

// ============================================================================
// Container address configuration
// ============================================================================

/// One address from the CNI result, ready to program.
#[derive(Debug, Clone, Copy)]
pub struct AssignedAddress {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

/// One route from the CNI result.
#[derive(Debug, Clone, Copy)]
pub struct AssignedRoute {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
}

/// Bring the container-side veth up, assign its addresses, install the
/// result routes, and announce each IPv4 address with a gratuitous ARP.
pub async fn configure_container_addr(
    netns: &Netns,
    ifname: &str,
    addresses: &[AssignedAddress],
    routes: &[AssignedRoute],
) -> Result<()> {
    let ns_handle = netns.rtnetlink_handle().await?;
    let link = get_link(&ns_handle, ifname)
        .await?
        .ok_or_else(|| DatapathError::LinkNotFound(ifname.to_string()))?;

    set_link_up(&ns_handle, link.index).await?;

    for addr in addresses {
        let add = ns_handle
            .address()
            .add(link.index, std::net::IpAddr::V4(addr.address), addr.prefix_len)
            .execute()
            .await;
        match add {
            Ok(()) => {}
            Err(e) if is_exist(&e) => {}
            Err(e) => return Err(netlink_err(e)),
        }
    }

    for route in routes {
        let mut builder = RouteMessageBuilder::<Ipv4Addr>::new();
        if route.destination.prefix_len() > 0 {
            builder = builder
                .destination_prefix(route.destination.network(), route.destination.prefix_len())
                .output_interface(link.index);
        }
        if let Some(gateway) = route.gateway {
            builder = builder.gateway(gateway);
        }
        let add = ns_handle.route().add(builder.build()).execute().await;
        match add {
            Ok(()) => {}
            Err(e) if is_exist(&e) => {}
            Err(e) => return Err(netlink_err(e)),
        }
    }

    // Gratuitous ARP is best-effort: peers re-learn on their own eventually.
    for addr in addresses {
        let ifname = ifname.to_string();
        let mac: [u8; 6] = match link.mac.as_slice().try_into() {
            Ok(mac) => mac,
            Err(_) => break,
        };
        let index = link.index as i32;
        let address = addr.address;
        if let Err(e) = netns
            .run_sync(move || gratuitous_arp(index, &mac, address))
            .await
        {
            warn!(link = %ifname, %address, error = %e, "Gratuitous ARP failed");
        }
    }

    Ok(())
}

/// Broadcast one gratuitous ARP request for `ip` out of the interface.
fn gratuitous_arp(ifindex: i32, mac: &[u8; 6], ip: Ipv4Addr) -> Result<()> {
    const ETH_P_ARP: u16 = 0x0806;

    let mut frame = [0u8; 42];
    frame[0..6].fill(0xff); // broadcast
    frame[6..12].copy_from_slice(mac);
    frame[12..14].copy_from_slice(&ETH_P_ARP.to_be_bytes());
    frame[14..16].copy_from_slice(&1u16.to_be_bytes()); // htype: ethernet
    frame[16..18].copy_from_slice(&0x0800u16.to_be_bytes()); // ptype: ipv4
    frame[18] = 6; // hlen
    frame[19] = 4; // plen
    frame[20..22].copy_from_slice(&1u16.to_be_bytes()); // op: request
    frame[22..28].copy_from_slice(mac); // sender hw
    frame[28..32].copy_from_slice(&ip.octets()); // sender ip
    // target hw stays zero
    frame[38..42].copy_from_slice(&ip.octets()); // target ip

    // Safety: raw AF_PACKET socket, closed below on every path.
    unsafe {
        let fd = libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            i32::from(ETH_P_ARP.to_be()),
        );
        if fd < 0 {
            return Err(DatapathError::Io(std::io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_ll = std::mem::zeroed();
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = ETH_P_ARP.to_be();
        addr.sll_ifindex = ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].fill(0xff);

        let sent = libc::sendto(
            fd,
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        );
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if sent < 0 {
            return Err(DatapathError::Io(err));
        }
    }
    Ok(())
}

// ============================================================================
// Default route discovery
// ============================================================================

/// Name of the interface the kernel's default IPv4 route leaves through.
pub async fn default_route_interface(handle: &Handle) -> Result<String> {
    let mut routes = handle
        .route()
        .get(RouteMessageBuilder::<Ipv4Addr>::new().build())
        .execute();

    while let Some(route) = routes.try_next().await.map_err(netlink_err)? {
        if route.header.destination_prefix_length != 0 {
            continue;
        }
        let has_gateway = route
            .attributes
            .iter()
            .any(|attr| matches!(attr, RouteAttribute::Gateway(_)));
        let oif = route.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Oif(index) => Some(*index),
            _ => None,
        });
        if let (true, Some(index)) = (has_gateway, oif) {
            let mut links = handle.link().get().match_index(index).execute();
            if let Some(msg) = links.try_next().await.map_err(netlink_err)? {
                if let Some(name) = msg.attributes.iter().find_map(|attr| match attr {
                    LinkAttribute::IfName(name) => Some(name.clone()),
                    _ => None,
                }) {
                    return Ok(name);
                }
            }
        }
    }
    Err(DatapathError::Netlink(
        "no default IPv4 route found".to_string(),
    ))
}

// ============================================================================
// rtnetlink error mapping
// ============================================================================

fn netlink_err(e: rtnetlink::Error) -> DatapathError {
    DatapathError::Netlink(e.to_string())
}

fn is_not_found(e: &rtnetlink::Error) -> bool {
    matches!(e, rtnetlink::Error::NetlinkError(err)
        if err.raw_code() == -libc::ENODEV || err.raw_code() == -libc::ENOENT)
}

fn is_exist(e: &rtnetlink::Error) -> bool {
    matches!(e, rtnetlink::Error::NetlinkError(err) if err.raw_code() == -libc::EEXIST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_has_fixed_length() {
        let name = generate_container_interface_name("nginx", "default");
        assert_eq!(name.len(), INTERFACE_NAME_LENGTH);
        assert!(name.starts_with("nginx-"));
    }

    #[test]
    fn interface_name_is_deterministic() {
        let a = generate_container_interface_name("web-0", "default");
        let b = generate_container_interface_name("web-0", "default");
        assert_eq!(a, b);
    }

    #[test]
    fn interface_name_distinguishes_namespaces() {
        let a = generate_container_interface_name("web-0", "default");
        let b = generate_container_interface_name("web-0", "staging");
        assert_ne!(a, b);
    }

    #[test]
    fn long_pod_names_are_truncated() {
        let name =
            generate_container_interface_name("a-very-long-deployment-name-0", "default");
        assert_eq!(name.len(), INTERFACE_NAME_LENGTH);
        // dashes removed, prefix capped at 8
        assert!(name.starts_with("averylon-"));
    }

    #[test]
    fn short_names_get_longer_hash_suffixes() {
        let name = generate_container_interface_name("db", "default");
        assert_eq!(name.len(), INTERFACE_NAME_LENGTH);
        assert!(name.starts_with("db-"));
    }

    #[test]
    fn mac_string_formats_colon_separated() {
        let link = LinkInfo {
            name: "veth0".to_string(),
            index: 3,
            mac: vec![0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22],
        };
        assert_eq!(link.mac_string(), "aa:bb:cc:00:11:22");
    }
}
