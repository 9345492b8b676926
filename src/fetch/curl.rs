use crate::fetch::{FetchError, RemoteTransport, SftpTarget};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// SFTP through the system `curl` binary.
///
/// Credentials are handed over on stdin as a curl config file so they never
/// show up in the process list.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    program: String,
    timeout: Duration,
}

impl CurlTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "curl".to_string(),
            timeout,
        }
    }

    fn url(target: &SftpTarget) -> Result<Url, FetchError> {
        let mut url = Url::parse(&format!("sftp://{}:{}/", target.host, target.port))
            .map_err(|e| FetchError::Failed(format!("invalid host '{}': {e}", target.host)))?;
        // relative paths start in the login directory
        if target.path.starts_with('/') {
            url.set_path(&target.path);
        } else {
            url.set_path(&format!("/~/{}", target.path));
        }
        Ok(url)
    }
}

/// Whether `curl --version` output lists sftp among the protocols
fn supports_sftp(version_output: &str) -> bool {
    version_output
        .lines()
        .find_map(|line| line.strip_prefix("Protocols:"))
        .is_some_and(|protocols| protocols.split_whitespace().any(|p| p == "sftp"))
}

/// Quote a value for a curl config file
fn config_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

impl RemoteTransport for CurlTransport {
    fn name(&self) -> &'static str {
        "curl"
    }

    fn is_available(&self) -> bool {
        match Command::new(&self.program).arg("--version").output() {
            Ok(output) if output.status.success() => {
                supports_sftp(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "curl not found");
                false
            }
        }
    }

    fn download(&self, target: &SftpTarget) -> Result<Vec<u8>, FetchError> {
        let url = Self::url(target)?;
        let mut child = Command::new(&self.program)
            .arg("--silent")
            .arg("--show-error")
            // no known_hosts handling for the vendor host
            .arg("--insecure")
            .arg("--connect-timeout")
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg("--config")
            .arg("-")
            .arg(url.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FetchError::Failed(format!("could not start curl: {e}")))?;

        let config = format!(
            "user = {}\n",
            config_quote(&format!("{}:{}", target.username, target.password))
        );
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(config.as_bytes())
                .map_err(|e| FetchError::Failed(format!("could not pass credentials to curl: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| FetchError::Failed(format!("curl did not finish: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Failed(format!(
                "curl exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sftp_support() {
        let with_sftp = "curl 8.5.0 (x86_64-pc-linux-gnu) libcurl/8.5.0 OpenSSL/3.0.13 libssh/0.10.6\n\
            Release-Date: 2023-12-06\n\
            Protocols: dict file ftp ftps http https scp sftp smtp\n\
            Features: alt-svc AsynchDNS HSTS HTTP2\n";
        let without_sftp = "curl 8.4.0 (x86_64-apple-darwin23.0)\n\
            Protocols: dict file ftp ftps gopher http https\n";

        assert!(supports_sftp(with_sftp));
        assert!(!supports_sftp(without_sftp));
        assert!(!supports_sftp(""));
    }

    #[test]
    fn builds_url_for_absolute_and_relative_paths() {
        let mut target = SftpTarget {
            host: "sftp.example.com".into(),
            port: 2222,
            username: "feed".into(),
            password: "secret".into(),
            path: "/CommonFeed/USD/WHEEL/wheelInvPriceData.csv".into(),
        };
        assert_eq!(
            CurlTransport::url(&target).unwrap().as_str(),
            "sftp://sftp.example.com:2222/CommonFeed/USD/WHEEL/wheelInvPriceData.csv"
        );

        target.path = "exports/feed.csv".into();
        assert_eq!(
            CurlTransport::url(&target).unwrap().as_str(),
            "sftp://sftp.example.com:2222/~/exports/feed.csv"
        );
    }

    #[test]
    fn config_values_are_escaped() {
        assert_eq!(config_quote(r#"feed:pa"ss\word"#), r#""feed:pa\"ss\\word""#);
    }
}
