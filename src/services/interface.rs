use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::{debug, info, warn};
use pcap::Device;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::ResolveError;

// Any routable address works; the socket is only connected, never written to.
const PROBE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 10002);

/// What the resolver needs to know about a capture device.
pub trait CaptureDevice {
    fn name(&self) -> &str;
    fn owns(&self, ip: IpAddr) -> bool;
}

impl CaptureDevice for Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn owns(&self, ip: IpAddr) -> bool {
        self.addresses.iter().any(|a| a.addr == ip)
    }
}

/// Learns which local IP the OS would route outbound traffic from.
pub fn probe_local_ip() -> Result<IpAddr, ResolveError> {
    match probe_with_socket() {
        Ok(ip) => Ok(ip),
        Err(e) => {
            debug!("[Interface] UDP probe failed ({}). Asking the OS for the default interface.", e);
            local_ip_address::local_ip().map_err(|_| ResolveError::NoLocalAddress(e))
        }
    }
}

fn probe_with_socket() -> io::Result<IpAddr> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.connect(&PROBE_TARGET.into())?;

    let local = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::other("socket has no inet address"))?;

    if local.ip().is_unspecified() {
        return Err(io::Error::other("socket is not bound to an address"));
    }
    Ok(local.ip())
}

/// Picks the device that owns `ip`, falling back to a device named `fallback`.
pub fn select_device<D: CaptureDevice>(ip: Option<IpAddr>, devices: Vec<D>, fallback: Option<&str>) -> Option<D> {
    let mut by_name = None;

    for device in devices {
        if ip.is_some_and(|ip| device.owns(ip)) {
            return Some(device);
        }
        if by_name.is_none() && fallback.is_some_and(|name| device.name().contains(name)) {
            by_name = Some(device);
        }
    }
    by_name
}

/// Turns the local address lookup into a device or a typed error.
///
/// A failed lookup is only fatal when there is no configured device name to fall back on.
pub fn choose_device<D: CaptureDevice>(
    local_ip: Result<IpAddr, ResolveError>,
    devices: Vec<D>,
    fallback: Option<&str>,
) -> Result<D, ResolveError> {
    let ip = match local_ip {
        Ok(ip) => {
            info!("[Interface] Local address: {}", ip);
            Some(ip)
        }
        Err(e) if fallback.is_some() => {
            warn!("[Interface] {}. Trying configured device name.", e);
            None
        }
        Err(e) => return Err(e),
    };

    select_device(ip, devices, fallback).ok_or_else(|| match ip {
        Some(ip) => ResolveError::NoMatchingDevice { ip },
        None => ResolveError::NoLocalAddress(io::Error::other("no configured device matched")),
    })
}

/// Finds the capture device carrying this machine's outbound traffic.
pub fn resolve(fallback: Option<&str>) -> Result<Device, ResolveError> {
    let devices = Device::list()?;

    debug!("--- [Interface] Scanning Network Interfaces ---");
    for device in &devices {
        let addrs: Vec<IpAddr> = device.addresses.iter().map(|a| a.addr).collect();
        debug!("Found: {} | {:?} | IPs: {:?}", device.name, device.desc, addrs);
    }

    let device = choose_device(probe_local_ip(), devices, fallback)?;
    info!("[Interface] Selected Interface: {} ({:?})", device.name, device.desc);
    Ok(device)
}
