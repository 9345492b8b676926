use crate::fetch::{FetchError, RemoteTransport, SftpTarget};
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// SFTP through libssh2
#[derive(Debug, Clone)]
pub struct Ssh2Transport {
    timeout: Duration,
}

impl Ssh2Transport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn connect(&self, target: &SftpTarget) -> Result<Session, FetchError> {
        let address = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| FetchError::Failed(format!("could not resolve {}: {e}", target.host)))?
            .next()
            .ok_or_else(|| FetchError::Failed(format!("no address found for {}", target.host)))?;

        let tcp = TcpStream::connect_timeout(&address, self.timeout)
            .map_err(|e| FetchError::Failed(format!("could not connect to {address}: {e}")))?;

        let mut session = Session::new().map_err(failed("could not create session"))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(failed("SSH handshake failed"))?;
        session
            .userauth_password(&target.username, &target.password)
            .map_err(failed("authentication failed"))?;
        if !session.authenticated() {
            return Err(FetchError::Failed("authentication failed".to_string()));
        }

        Ok(session)
    }
}

fn failed(context: &'static str) -> impl Fn(ssh2::Error) -> FetchError {
    move |e| FetchError::Failed(format!("{context}: {e}"))
}

impl RemoteTransport for Ssh2Transport {
    fn name(&self) -> &'static str {
        "ssh2"
    }

    fn is_available(&self) -> bool {
        // linked in at compile time
        true
    }

    fn download(&self, target: &SftpTarget) -> Result<Vec<u8>, FetchError> {
        let session = self.connect(target)?;
        let sftp = session.sftp().map_err(failed("could not start SFTP subsystem"))?;

        let mut file = sftp
            .open(Path::new(&target.path))
            .map_err(|e| FetchError::Failed(format!("could not open {}: {e}", target.path)))?;
        let mut bytes = vec![];
        file.read_to_end(&mut bytes)
            .map_err(|e| FetchError::Failed(format!("could not read {}: {e}", target.path)))?;

        Ok(bytes)
    }
}
