use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, TrySendError};
use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
use log::{debug, error, info, trace, warn};
use pcap::{Active, Capture, Device};
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::CaptureInitError;
use crate::protocol::types::{RawPayload, StreamKey};

/// Counters for the producer side. `dropped` is the only place payloads are lost.
#[derive(Debug, Default)]
pub struct CaptureStats {
    offered: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureCounters {
    pub offered: u64,
    pub enqueued: u64,
    pub dropped: u64,
    /// Frames without a TCP payload.
    pub skipped: u64,
}

impl CaptureStats {
    pub fn counters(&self) -> CaptureCounters {
        CaptureCounters {
            offered: self.offered.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// How captured frames are wrapped on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    RawIp,
    /// BSD loopback: 4-byte address family header, then IP.
    Loopback,
}

impl LinkKind {
    pub fn from_linktype(linktype: pcap::Linktype) -> Option<LinkKind> {
        match linktype.0 {
            1 => Some(LinkKind::Ethernet),
            0 | 108 => Some(LinkKind::Loopback),
            12 | 14 | 101 | 228 | 229 => Some(LinkKind::RawIp),
            _ => None,
        }
    }
}

/// `src net <ip> and port <port>`; a zero port leaves the port clause out.
pub fn build_filter(server_ip: &str, server_port: u16) -> String {
    if server_port == 0 {
        format!("tcp and src net {}", server_ip)
    } else {
        format!("src net {} and port {}", server_ip, server_port)
    }
}

/// Pulls the stream key and TCP payload out of one captured frame.
/// `None` for anything that isn't TCP over IP.
pub fn extract_tcp_payload(frame: &[u8], link: LinkKind) -> Option<(StreamKey, &[u8])> {
    let headers = match link {
        LinkKind::Ethernet => PacketHeaders::from_ethernet_slice(frame).ok()?,
        LinkKind::RawIp => PacketHeaders::from_ip_slice(frame).ok()?,
        LinkKind::Loopback => PacketHeaders::from_ip_slice(frame.get(4..)?).ok()?,
    };

    let tcp = match headers.transport {
        Some(TransportHeader::Tcp(tcp)) => tcp,
        _ => return None,
    };

    let (source, destination): (IpAddr, IpAddr) = match headers.net {
        Some(NetHeaders::Ipv4(ipv4, _extensions)) => (ipv4.source.into(), ipv4.destination.into()),
        Some(NetHeaders::Ipv6(ipv6, _extensions)) => (ipv6.source.into(), ipv6.destination.into()),
        _ => return None,
    };

    let stream = StreamKey {
        source: SocketAddr::new(source, tcp.source_port),
        destination: SocketAddr::new(destination, tcp.destination_port),
    };
    Some((stream, headers.payload.slice()))
}

/// Non-blocking hand-off to the decoder. A full channel drops the payload.
pub fn offer(tx: &Sender<RawPayload>, payload: RawPayload, stats: &CaptureStats) -> bool {
    stats.offered.fetch_add(1, Ordering::Relaxed);

    match tx.try_send(payload) {
        Ok(()) => {
            stats.enqueued.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(TrySendError::Full(p)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("[Sniffer] Channel full, dropped payload #{} ({} bytes)", p.seq, p.data.len());
            false
        }
        Err(TrySendError::Disconnected(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// Live capture running on its own thread.
pub struct Sniffer {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sniffer {
    /// Opens `device` and starts pushing server payloads into `tx`.
    pub fn start(
        device: Device,
        config: &AppConfig,
        tx: Sender<RawPayload>,
        stats: Arc<CaptureStats>,
    ) -> Result<Self, CaptureInitError> {
        let name = device.name.clone();
        let mut cap = open_capture(device, config)?;

        let filter = build_filter(&config.server_ip, config.server_port);
        cap.filter(&filter, true).map_err(|source| CaptureInitError::Filter {
            filter: filter.clone(),
            source,
        })?;
        info!("[Sniffer] Capture filter set \"{}\" on {}", filter, name);

        let datalink = cap.get_datalink();
        let link = LinkKind::from_linktype(datalink).unwrap_or_else(|| {
            warn!("[Sniffer] Unknown link type {:?}, assuming Ethernet", datalink);
            LinkKind::Ethernet
        });

        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let stop = stop.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    capture_loop(cap, link, &tx, &stop, &stats);
                    running.store(false, Ordering::SeqCst);
                })
                .map_err(CaptureInitError::Spawn)?
        };

        Ok(Self { stop, running, handle: Some(handle) })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals the loop and waits for it. Returns within one read timeout.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[Sniffer] Capture thread panicked");
            }
        }
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_capture(device: Device, config: &AppConfig) -> Result<Capture<Active>, CaptureInitError> {
    let name = device.name.clone();
    Capture::from_device(device)
        .and_then(|c| {
            c.promisc(true)
                .snaplen(config.snapshot_size)
                .timeout(config.read_timeout_ms())
                .open()
        })
        .map_err(|source| CaptureInitError::Open { device: name, source })
}

fn capture_loop(
    mut cap: Capture<Active>,
    link: LinkKind,
    tx: &Sender<RawPayload>,
    stop: &AtomicBool,
    stats: &CaptureStats,
) {
    info!("[Sniffer] Capture active. Listening for game traffic...");
    let mut seq = 0u64;

    // COOPERATIVE SHUTDOWN: the flag is checked at least once per read timeout
    while !stop.load(Ordering::Relaxed) {
        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                warn!("[Sniffer] Read Error: {}. Stopping capture.", e);
                break;
            }
        };

        match extract_tcp_payload(packet.data, link) {
            // Ignore empty ACK packets
            Some((stream, payload)) if !payload.is_empty() => {
                seq += 1;
                let raw = RawPayload { seq, stream, data: payload.to_vec() };
                offer(tx, raw, stats);
            }
            _ => {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    drop(cap);
    debug!("[Sniffer] Capture handle released after {} payloads.", seq);
}
