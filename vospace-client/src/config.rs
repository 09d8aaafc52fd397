use std::collections::BTreeMap;
use std::time::Duration;

/// The VOSpace server host table and related defaults, injected as
/// configuration rather than hardcoded, so tests can point the client at
/// a `127.0.0.1` mock listener instead of CADC.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Authority token (e.g. `cadc.nrc.ca!vospace`) -> concrete HTTPS host.
    pub authority_hosts: BTreeMap<String, String>,
    /// Host substituted for an authority with no entry in `authority_hosts`.
    pub default_host: String,
    /// Authority token substituted into a URI whose authority is empty
    /// (`fixURI`'s default server substitution).
    pub default_authority: String,
    /// Archive name used in the `PUT .../data/pub/<archive>/...` endpoint.
    pub archive: String,
    /// Prefix prepended to a URI lacking a `vos:` scheme, by `fixURI`.
    pub root_node: String,
    /// `POST` target for `move`'s transfer document.
    pub synctrans_url: String,
    /// Whether requests are made over `https` (`false` only for local test
    /// listeners that don't speak TLS).
    pub use_tls: bool,
    /// Wall-clock deadline for the connect-retry loop (20 minutes).
    pub connect_retry_deadline: Duration,
    /// Per-attempt connect timeout (600 s).
    pub connect_timeout: Duration,
    /// Default `Retry-After` delay used when a 503 response doesn't carry a
    /// parsable header (5 s).
    pub default_retry_after: Duration,
    /// Buffer size for the streaming copy loop (8 MiB).
    pub copy_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let server = "www.cadc.hia.nrc.gc.ca".to_string();
        let mut authority_hosts = BTreeMap::new();
        authority_hosts.insert("cadc.nrc.ca!vospace".to_string(), server.clone());
        authority_hosts.insert("cadc.nrc.ca~vospace".to_string(), server.clone());

        Self {
            synctrans_url: format!("https://{}/vospace/synctrans", server),
            authority_hosts,
            default_host: server,
            default_authority: "cadc.nrc.ca!vospace".to_string(),
            archive: "vospace".to_string(),
            root_node: "vos://cadc.nrc.ca!vospace".to_string(),
            use_tls: true,
            connect_retry_deadline: Duration::from_secs(1200),
            connect_timeout: Duration::from_secs(600),
            default_retry_after: Duration::from_secs(5),
            copy_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// The host a given authority resolves to: a configured mapping, or
    /// `default_host` if the authority is empty or unrecognized.
    pub fn host_for(&self, authority: &str) -> &str {
        if authority.is_empty() {
            return &self.default_host;
        }
        self.authority_hosts
            .get(authority)
            .map(String::as_str)
            .unwrap_or(&self.default_host)
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    /// A config pointed at a local, plaintext test listener, the way the
    /// integration tests bind to a loopback address instead of a live
    /// server.
    pub fn for_test_listener(addr: &str) -> Self {
        let mut cfg = Self::default();
        cfg.use_tls = false;
        cfg.default_host = addr.to_string();
        cfg.authority_hosts.clear();
        cfg.synctrans_url = format!("http://{}/vospace/synctrans", addr);
        cfg.connect_retry_deadline = Duration::from_millis(200);
        cfg.connect_timeout = Duration::from_secs(5);
        cfg.default_retry_after = Duration::from_millis(50);
        cfg
    }
}
