use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while working out which capture device carries game traffic.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("could not learn the locally bound IP address")]
    NoLocalAddress(#[source] std::io::Error),

    #[error("no capture device owns local address {ip}")]
    NoMatchingDevice { ip: IpAddr },

    #[error("failed to enumerate capture devices: {0}")]
    DeviceList(#[from] pcap::Error),
}

/// The capture subsystem could not be brought up. Always fatal for capture.
#[derive(Debug, Error)]
pub enum CaptureInitError {
    #[error("failed to open live capture on {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: pcap::Error,
    },

    #[error("failed to install capture filter \"{filter}\": {source}")]
    Filter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything that can stop the meter from starting.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Capture(#[from] CaptureInitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("the capture pipeline is already running")]
    AlreadyRunning,
}

pub type Result<T, E = MeterError> = std::result::Result<T, E>;
