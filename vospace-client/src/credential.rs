//! Holds a path to a PEM-encoded client certificate and turns it into TLS
//! material and retrying HTTP requests. The file itself is never kept
//! open, only its path is retained.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::ClientConfig;
use crate::error::Error;

/// A validated reference to a client certificate PEM file (private key and
/// certificate concatenated in one file, CADC proxy-certificate style).
#[derive(Debug, Clone)]
pub struct Credential {
    pem_path: PathBuf,
}

impl Credential {
    /// `pem_path` is taken as given; `None` resolves to
    /// `$HOME/.ssl/cadcproxy.pem`, creating `$HOME/.ssl` if it doesn't
    /// already exist.
    pub fn new(pem_path: Option<PathBuf>) -> Result<Self, Error> {
        let pem_path = match pem_path {
            Some(p) => p,
            None => Self::default_path()?,
        };
        if !pem_path.is_file() {
            return Err(Error::PermissionDenied {
                detail: format!(
                    "no certificate file found at {} (perhaps use getCert to pull one)",
                    pem_path.display()
                ),
            });
        }
        validate_pem(&pem_path)?;
        Ok(Self { pem_path })
    }

    fn default_path() -> Result<PathBuf, Error> {
        let home = std::env::var_os("HOME").ok_or_else(|| Error::PermissionDenied {
            detail: "HOME is not defined for your environment".to_string(),
        })?;
        let ssl_dir = Path::new(&home).join(".ssl");
        if !ssl_dir.exists() {
            fs::create_dir(&ssl_dir)?;
        }
        Ok(ssl_dir.join("cadcproxy.pem"))
    }

    pub fn path(&self) -> &Path {
        &self.pem_path
    }

    /// Build the mutual-TLS identity reqwest needs to present this
    /// certificate on the wire.
    pub fn build_identity(&self) -> Result<reqwest::Identity, Error> {
        let bytes = fs::read(&self.pem_path)?;
        reqwest::Identity::from_pem(&bytes).map_err(|e| Error::PermissionDenied {
            detail: format!("invalid certificate at {}: {}", self.pem_path.display(), e),
        })
    }
}

/// Parse-validate the PEM so a malformed certificate fails at construction
/// time rather than on the first request.
fn validate_pem(path: &Path) -> Result<(), Error> {
    let bytes = fs::read(path)?;

    let certs = rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::PermissionDenied {
            detail: format!("malformed certificate in {}: {}", path.display(), e),
        })?;
    if certs.is_empty() {
        return Err(Error::PermissionDenied {
            detail: format!("no certificate found in {}", path.display()),
        });
    }

    let key = rustls_pemfile::private_key(&mut bytes.as_slice()).map_err(|e| Error::PermissionDenied {
        detail: format!("malformed private key in {}: {}", path.display(), e),
    })?;
    if key.is_none() {
        return Err(Error::PermissionDenied {
            detail: format!("no private key found in {}", path.display()),
        });
    }

    Ok(())
}

/// Run `build` (which must construct a fresh request each call, since a
/// sent `RequestBuilder` is consumed) and retry on transport-level connect
/// failures until `config.connect_retry_deadline` elapses. Any other
/// error -- most often an expired or otherwise rejected certificate -- is
/// not retried and is reported as [`Error::ConnectionRefused`] immediately,
/// since it most often means the certificate itself was rejected.
pub fn send_with_connect_retry(
    config: &ClientConfig,
    host: &str,
    build: impl Fn() -> reqwest::blocking::RequestBuilder,
) -> Result<reqwest::blocking::Response, Error> {
    let deadline = Instant::now() + config.connect_retry_deadline;
    loop {
        match build().send() {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_connect() || e.is_timeout() => {
                if Instant::now() >= deadline {
                    tracing::error!(err = ?e, host, "connect retry window exhausted");
                    return Err(Error::Transport(e));
                }
                tracing::warn!(err = ?e, host, "connect failed, retrying");
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => {
                tracing::error!(err = ?e, host, "non-transport error, perhaps your proxy certificate is expired");
                return Err(Error::ConnectionRefused {
                    host: host.to_string(),
                });
            }
        }
    }
}
