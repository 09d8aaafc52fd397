//! The Client facade: translates node-level operations into transport
//! calls, normalizes URIs, and drives the streaming copy engine. Grounded
//! translates logical node operations into HTTP requests rather than
//! driving sockets directly.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write as _};

use md5::{Digest, Md5};
use vospace_xml::{ChildList, Node, NodeType};

use crate::config::ClientConfig;
use crate::credential::Credential;
use crate::error::Error;
use crate::uri;
use crate::vofile::{OpenMode, VOFile};

/// The MD5 of the empty string, the default expected checksum used when a
/// server-side node carries no `MD5` property of its own.
const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

pub struct Client {
    config: ClientConfig,
    http: reqwest::blocking::Client,
}

impl Client {
    /// Build a client against a live (TLS, client-certificate-authenticated)
    /// VOSpace server.
    pub fn new(config: ClientConfig, credential: &Credential) -> Result<Self, Error> {
        let identity = credential.build_identity()?;
        let http = reqwest::blocking::Client::builder()
            .identity(identity)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    /// Build a client with no client certificate, talking plain HTTP --
    /// only useful against a local test listener (`ClientConfig::use_tls`
    /// must be `false`).
    pub fn new_unauthenticated(config: ClientConfig) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Given a URI, check if the server part is there and if it isn't,
    /// substitute the configured defaults; validate scheme and leaf name.
    pub fn fix_uri(&self, raw: &str) -> Result<String, Error> {
        let candidate = if raw.starts_with("vos:") {
            raw.to_string()
        } else {
            format!("{}{}", self.config.root_node, raw)
        };

        let parts = uri::parse(&candidate);
        if parts.scheme != "vos" {
            return Err(Error::InvalidArgument {
                value: candidate,
            });
        }

        let leaf = parts.path.rsplit('/').next().unwrap_or("");
        if !uri::is_legal_leaf_name(leaf) {
            return Err(Error::InvalidArgument {
                value: leaf.to_string(),
            });
        }

        let authority = if parts.authority.is_empty() {
            self.config.default_authority.clone()
        } else {
            parts.authority
        };
        let path = uri::normalize_path(&parts.path);
        Ok(format!("vos://{}/{}", authority, path))
    }

    /// `GET/POST/DELETE https://<host>/vospace/nodes/<path>` -- the
    /// metadata endpoint used by everything except an actual `PUT` of file
    /// bytes.
    fn metadata_url(
        &self,
        uri: &str,
        view: Option<&str>,
        limit: Option<u32>,
        next_uri: Option<&str>,
    ) -> Result<String, Error> {
        let fixed = self.fix_uri(uri)?;
        let parts = uri::parse(&fixed);
        let path = parts.path.trim_matches('/');
        let host = self.config.host_for(&parts.authority);
        let scheme = self.config.scheme();

        let mut query = Vec::new();
        if let Some(limit) = limit {
            query.push(format!("limit={}", limit));
        }
        if let Some(view) = view {
            query.push(format!("view={}", view));
        }
        if let Some(next) = next_uri {
            query.push(format!("uri={}", next));
        }
        let query = if query.is_empty() {
            String::new()
        } else {
            format!("?{}", query.join("&"))
        };

        Ok(format!("{}://{}/vospace/nodes/{}{}", scheme, host, path, query))
    }

    /// `PUT https://<host>/data/pub/<archive>/<path>` -- the bulk-upload
    /// endpoint, hardcoded to the CADC bulk-upload shape.
    fn data_url(&self, uri: &str) -> Result<String, Error> {
        let fixed = self.fix_uri(uri)?;
        let parts = uri::parse(&fixed);
        let path = parts.path.trim_matches('/');
        let host = self.config.host_for(&parts.authority);
        let scheme = self.config.scheme();
        Ok(format!("{}://{}/data/pub/{}/{}", scheme, host, self.config.archive, path))
    }

    fn fetch_body(&self, url: &str, range: Option<String>) -> Result<Vec<u8>, Error> {
        let mut file = VOFile::open(&self.http, &self.config, url.to_string(), OpenMode::Read, None, range)?;
        file.read(0)
    }

    /// `GET /nodes/<path>`, paginating children by `uri=<lastChildURI>`
    /// continuation when `limit > 0` and the node is a container. Stops
    /// as soon as a page adds no new child, and never emits a duplicate
    /// child URI.
    pub fn get_node(&self, uri: &str, limit: u32) -> Result<Node, Error> {
        let url = self.metadata_url(uri, None, Some(0), None)?;
        let body = self.fetch_body(&url, None)?;
        let mut node = Node::from_xml(&body_to_str(&body, &url)?)?;

        if node.is_container() && limit > 0 {
            let mut children = Vec::new();
            let mut seen = HashSet::new();
            let mut next_uri: Option<String> = None;
            loop {
                let page_url = self.metadata_url(uri, None, Some(limit), next_uri.as_deref())?;
                let page_body = self.fetch_body(&page_url, None)?;
                let page_node = Node::from_xml(&body_to_str(&page_body, &page_url)?)?;
                let page_children = match page_node.children {
                    ChildList::Loaded(v) => v,
                    ChildList::Unloaded => Vec::new(),
                };
                if page_children.is_empty() {
                    break;
                }
                let mut added_any = false;
                for child in page_children {
                    if seen.insert(child.uri.clone()) {
                        next_uri = Some(child.uri.clone());
                        children.push(child);
                        added_any = true;
                    }
                }
                if !added_any {
                    break;
                }
            }
            node.children = ChildList::Loaded(children);
        }

        Ok(node)
    }

    /// `listdir`: wrapper over `getNode` with `limit=1`, returning child
    /// names only.
    pub fn listdir(&self, uri: &str) -> Result<Vec<String>, Error> {
        let node = self.get_node(uri, 1)?;
        let children = match node.children {
            ChildList::Loaded(v) => v,
            ChildList::Unloaded => Vec::new(),
        };
        Ok(children.iter().map(|c| c.name().to_string()).collect())
    }

    /// `PUT /nodes/<path>` with a freshly constructed `ContainerNode` body.
    pub fn mkdir(&self, uri: &str) -> Result<(), Error> {
        let fixed = self.fix_uri(uri)?;
        let node = Node::new(fixed, NodeType::Container);
        let body = node.to_xml();
        let url = self.metadata_url(uri, None, None, None)?;
        let mut file = VOFile::open(
            &self.http,
            &self.config,
            url,
            OpenMode::Write,
            Some(body.len() as u64),
            None,
        )?;
        file.write(body.as_bytes())?;
        file.close()
    }

    /// Open with truncate mode, issue `DELETE`, return the close status.
    pub fn delete(&self, uri: &str) -> Result<(), Error> {
        let url = self.metadata_url(uri, None, None, None)?;
        let mut file = VOFile::open(&self.http, &self.config, url, OpenMode::Delete, None, None)?;
        file.close()
    }

    /// `POST /nodes/<path>`: fetch the stored node, drop properties whose
    /// value is unchanged, post the remainder.
    pub fn add_props(&self, node: &mut Node) -> Result<(), Error> {
        let stored = self.get_node(&node.uri, 0)?;
        let keys: Vec<String> = node.properties.0.keys().cloned().collect();
        for key in keys {
            if let Some(stored_value) = stored.properties.0.get(&key) {
                let new_value = node.properties.0.get(&key).cloned().flatten();
                if new_value.is_some() && stored_value.as_ref() == new_value.as_ref() {
                    node.properties.0.remove(&key);
                }
            }
        }
        self.post_node(node)
    }

    /// `POST /nodes/<path>`: post the node exactly as given.
    pub fn update(&self, node: &Node) -> Result<(), Error> {
        self.post_node(node)
    }

    fn post_node(&self, node: &Node) -> Result<(), Error> {
        let url = self.metadata_url(&node.uri, None, None, None)?;
        let body = node.to_xml();
        let mut file = VOFile::open(
            &self.http,
            &self.config,
            url,
            OpenMode::Append,
            Some(body.len() as u64),
            None,
        )?;
        file.write(body.as_bytes())?;
        file.close()
    }

    /// POST a `<transfer keepBytes="false">` document to the synchronous
    /// transfer endpoint. Returns true iff the response status is exactly
    /// `200` (not merely accepted by `close()`'s broader code list).
    pub fn move_node(&self, src: &str, dst: &str) -> Result<bool, Error> {
        let src_fixed = self.fix_uri(src)?;
        let dst_fixed = self.fix_uri(dst)?;
        let xml = transfer_document(&src_fixed, &dst_fixed);
        let mut file = VOFile::open(
            &self.http,
            &self.config,
            self.config.synctrans_url.clone(),
            OpenMode::Append,
            Some(xml.len() as u64),
            None,
        )?;
        file.write(xml.as_bytes())?;
        file.close_with_codes(&[200, 201, 202, 206, 302, 303, 503])?;
        Ok(file.status() == 200)
    }

    /// Mode -> method dispatch. `Write` targets the
    /// bulk-data endpoint; everything else targets node metadata.
    pub fn open(&self, uri: &str, mode: OpenMode, size: Option<u64>) -> Result<VOFile<'_>, Error> {
        let url = match mode {
            OpenMode::Write => self.data_url(uri)?,
            _ => self.metadata_url(uri, None, None, None)?,
        };
        VOFile::open(&self.http, &self.config, url, mode, size, None)
    }

    /// `HEAD` with `view=data`: an existence/accessibility probe.
    pub fn status(&self, uri: &str) -> Result<(), Error> {
        let url = self.metadata_url(uri, Some("data"), None, None)?;
        let mut file = VOFile::open(&self.http, &self.config, url, OpenMode::Head, None, None)?;
        file.close()
    }

    /// `getNode` and swallow errors.
    pub fn access(&self, uri: &str) -> bool {
        self.get_node(uri, 0).is_ok()
    }

    /// `getNode(uri, limit=0)` then check the node is a container; swallow
    /// all errors to `false`.
    pub fn isdir(&self, uri: &str) -> bool {
        self.get_node(uri, 0)
            .map(|n| n.is_container())
            .unwrap_or(false)
    }

    /// A strict boolean: `status` succeeded and the node is not a
    /// container.
    pub fn isfile(&self, uri: &str) -> bool {
        self.status(uri).is_ok() && !self.isdir(uri)
    }

    /// Stream `src` to `dest` in `copy_buffer_size` chunks, accumulating an
    /// MD5 as it goes. If `src` begins with `vos:` this is a download;
    /// otherwise `dest` is the remote side and this is an upload.
    pub fn copy(&self, src: &str, dest: &str, send_md5: bool) -> Result<String, Error> {
        if src.starts_with("vos:") {
            self.copy_download(src, dest, send_md5)
        } else {
            self.copy_upload(src, dest, send_md5)
        }
    }

    fn copy_download(&self, src: &str, dest: &str, send_md5: bool) -> Result<String, Error> {
        let src_node = self.get_node(src, 0)?;
        let expected_size = src_node
            .properties
            .get("length")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let url = self.metadata_url(src, Some("data"), None, None)?;
        let mut vofile = VOFile::open(&self.http, &self.config, url, OpenMode::Read, None, None)?;
        let mut out = File::create(dest)?;
        let mut hasher = Md5::new();
        let mut written = 0u64;

        loop {
            let chunk = vofile.read(self.config.copy_buffer_size)?;
            if chunk.is_empty() {
                break;
            }
            out.write_all(&chunk)?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
        }

        self.verify_copy(src, written, expected_size, &hasher_hex(hasher), send_md5)
    }

    fn copy_upload(&self, src: &str, dest: &str, send_md5: bool) -> Result<String, Error> {
        let mut input = File::open(src)?;
        let expected_size = input.metadata()?.len();

        let mut vofile = self.open(dest, OpenMode::Write, Some(expected_size))?;
        let mut hasher = Md5::new();
        let mut written = 0u64;
        let mut buf = vec![0u8; self.config.copy_buffer_size];

        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            vofile.write(&buf[..n])?;
            hasher.update(&buf[..n]);
            written += n as u64;
        }
        vofile.close()?;

        self.verify_copy(src, written, expected_size, &hasher_hex(hasher), send_md5)
    }

    fn verify_copy(
        &self,
        check_uri: &str,
        written: u64,
        expected_size: u64,
        local_md5: &str,
        send_md5: bool,
    ) -> Result<String, Error> {
        if send_md5 {
            let node = self.get_node(check_uri, 0)?;
            let remote_md5 = node.properties.get("MD5").unwrap_or(EMPTY_MD5).to_string();
            if remote_md5 != local_md5 {
                return Err(Error::IntegrityError {
                    detail: format!("MD5s don't match ({} -> {})", remote_md5, local_md5),
                });
            }
            Ok(local_md5.to_string())
        } else {
            if written != expected_size {
                return Err(Error::IntegrityError {
                    detail: "sizes don't match".to_string(),
                });
            }
            Ok(written.to_string())
        }
    }
}

/// Build the `<transfer>` document posted to the synctrans endpoint for a
/// move. Goes through `quick_xml::Writer` rather than a raw `format!` string
/// so a URI containing `&` (a legal leaf-name character per the allow-list)
/// comes out properly escaped in the element text, the same way
/// `Node::to_xml` escapes property values.
fn transfer_document(src: &str, dst: &str) -> String {
    let mut buf = Vec::new();
    {
        let mut w = quick_xml::writer::Writer::new(&mut buf);
        write_transfer_xml(&mut w, src, dst).expect("writing XML to an in-memory buffer cannot fail");
    }
    String::from_utf8(buf).expect("quick-xml only emits valid utf-8")
}

fn write_transfer_xml<W: std::io::Write>(
    w: &mut quick_xml::writer::Writer<W>,
    src: &str,
    dst: &str,
) -> quick_xml::Result<()> {
    use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

    let ns = vospace_xml::xml::VOS_NS;
    let mut transfer_el = BytesStart::new("transfer");
    transfer_el.push_attribute(("xmlns", ns));
    transfer_el.push_attribute(("xmlns:vos", ns));
    w.write_event(Event::Start(transfer_el))?;

    w.write_event(Event::Start(BytesStart::new("target")))?;
    w.write_event(Event::Text(BytesText::new(src)))?;
    w.write_event(Event::End(BytesEnd::new("target")))?;

    w.write_event(Event::Start(BytesStart::new("direction")))?;
    w.write_event(Event::Text(BytesText::new(dst)))?;
    w.write_event(Event::End(BytesEnd::new("direction")))?;

    w.write_event(Event::Start(BytesStart::new("keepBytes")))?;
    w.write_event(Event::Text(BytesText::new("false")))?;
    w.write_event(Event::End(BytesEnd::new("keepBytes")))?;

    w.write_event(Event::End(BytesEnd::new("transfer")))
}

fn hasher_hex(hasher: Md5) -> String {
    hex::encode(hasher.finalize())
}

fn body_to_str(body: &[u8], url: &str) -> Result<String, Error> {
    String::from_utf8(body.to_vec()).map_err(|e| Error::Unexpected {
        status: 0,
        reason: e.to_string(),
        url: url.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_root(root: &str) -> Client {
        let mut cfg = ClientConfig::for_test_listener("127.0.0.1:1");
        cfg.root_node = root.to_string();
        Client::new_unauthenticated(cfg).unwrap()
    }

    #[test]
    fn fix_uri_prefixes_missing_scheme_with_root_node() {
        let client = client_with_root("vos://cadc.nrc.ca!vospace");
        let fixed = client.fix_uri("/demo/hello.txt").unwrap();
        assert_eq!(fixed, "vos://cadc.nrc.ca!vospace/demo/hello.txt");
    }

    #[test]
    fn fix_uri_is_idempotent() {
        let client = client_with_root("vos://cadc.nrc.ca!vospace");
        let once = client.fix_uri("/demo/hello.txt").unwrap();
        let twice = client.fix_uri(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn fix_uri_rejects_illegal_leaf_name() {
        let client = client_with_root("vos://cadc.nrc.ca!vospace");
        let err = client.fix_uri("vos://h/has space").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn fix_uri_rejects_non_vos_scheme() {
        let client = client_with_root("vos://cadc.nrc.ca!vospace");
        let err = client.fix_uri("http://example.com/a").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn transfer_document_escapes_ampersand_in_leaf_names() {
        let xml = transfer_document("vos://h/a&b", "vos://h/c&d");
        assert!(xml.contains("<target>vos://h/a&amp;b</target>"));
        assert!(xml.contains("<direction>vos://h/c&amp;d</direction>"));
        assert!(!xml.contains("a&b"));
    }
}
