//! Retrieval of the feed file over SFTP
//!
//! Two transports are known: the `ssh2` library and the system `curl`
//! binary. Which ones are usable is probed once at startup, the fetcher then
//! tries them in order until one succeeds.

mod curl;
#[cfg(feature = "libssh2")]
mod ssh;

pub use curl::CurlTransport;
#[cfg(feature = "libssh2")]
pub use ssh::Ssh2Transport;

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT: u16 = 22;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the feed lives and how to log in
#[derive(Clone)]
pub struct SftpTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub path: String,
}

impl fmt::Debug for SftpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Connect, auth and transfer failures all end up here
    #[error("{0}")]
    Failed(String),
    #[error("no SFTP transport available")]
    NoTransport,
}

pub trait RemoteTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capability probe, must not touch the network
    fn is_available(&self) -> bool;

    fn download(&self, target: &SftpTarget) -> Result<Vec<u8>, FetchError>;
}

pub struct RemoteFetcher {
    transports: Vec<Box<dyn RemoteTransport>>,
}

impl fmt::Debug for RemoteFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.transports.iter().map(|t| t.name()))
            .finish()
    }
}

impl RemoteFetcher {
    /// Every transport usable on this machine, preferred first
    pub fn detect() -> Self {
        let mut candidates: Vec<Box<dyn RemoteTransport>> = vec![];
        #[cfg(feature = "libssh2")]
        candidates.push(Box::new(Ssh2Transport::new(CONNECT_TIMEOUT)));
        candidates.push(Box::new(CurlTransport::new(CONNECT_TIMEOUT)));

        Self::with_transports(candidates)
    }

    /// Keeps the given order, drops transports that report unavailable
    pub fn with_transports(candidates: Vec<Box<dyn RemoteTransport>>) -> Self {
        let transports: Vec<Box<dyn RemoteTransport>> = candidates
            .into_iter()
            .filter(|transport| {
                let available = transport.is_available();
                debug!(transport = transport.name(), available, "probed SFTP transport");
                available
            })
            .collect();

        Self { transports }
    }

    pub fn transport_names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    pub fn fetch(&self, target: &SftpTarget) -> Result<Vec<u8>, FetchError> {
        if self.transports.is_empty() {
            return Err(FetchError::NoTransport);
        }

        let mut failures = vec![];
        for transport in &self.transports {
            info!(
                transport = transport.name(),
                host = %target.host,
                port = target.port,
                path = %target.path,
                "downloading feed"
            );
            match transport.download(target) {
                Ok(bytes) => {
                    info!(transport = transport.name(), bytes = bytes.len(), "feed downloaded");
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!(transport = transport.name(), error = %e, "transport failed");
                    failures.push(format!("{}: {}", transport.name(), e));
                }
            }
        }

        Err(FetchError::Failed(failures.join(" | ")))
    }
}
