//! End-to-end coverage driving a real `Client` against the hand-rolled
//! listener in `common/mod.rs`, exercising real sockets instead of mocking
//! at the HTTP layer.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{MockRequest, MockResponse};
use md5::{Digest, Md5};
use vospace_client::{Client, ClientConfig};

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

const NODE_XML_TEMPLATE: &str = concat!(
    r#"<node xmlns="http://www.ivoa.net/xml/VOSpace/v2.0" uri="{uri}" xsi:type="vos:DataNode" busy="false">"#,
    r#"<properties>"#,
    r#"<property uri="ivo://ivoa.net/vospace/core#length" readOnly="false">{len}</property>"#,
    r#"<property uri="ivo://ivoa.net/vospace/core#MD5" readOnly="false">{md5}</property>"#,
    r#"</properties>"#,
    r#"<accepts/><provides/></node>"#,
);

fn data_node_xml(uri: &str, body: &[u8]) -> String {
    NODE_XML_TEMPLATE
        .replace("{uri}", uri)
        .replace("{len}", &body.len().to_string())
        .replace("{md5}", &md5_hex(body))
}

fn client_for(addr: &str) -> Client {
    let mut cfg = ClientConfig::for_test_listener(addr);
    cfg.root_node = format!("vos://{}", "test!vospace");
    cfg.default_authority = "test!vospace".to_string();
    Client::new_unauthenticated(cfg).unwrap()
}

#[test]
fn copy_download_verifies_md5() {
    let body = b"hello world".to_vec();
    let body_for_server = body.clone();
    let addr = common::spawn(move |req: MockRequest| {
        if req.path.contains("limit=0") {
            MockResponse::text(200, "OK", data_node_xml("vos://test!vospace/demo/hello.txt", &body_for_server))
                .header("Content-Type", "text/xml")
        } else if req.path.contains("view=data") {
            MockResponse::text(200, "OK", body_for_server.clone())
        } else {
            MockResponse::text(404, "Not Found", Vec::new())
        }
    });

    let client = client_for(&addr);
    let dest = std::env::temp_dir().join("vospace-client-test-download.bin");
    let _ = std::fs::remove_file(&dest);

    let digest = client
        .copy("vos://test!vospace/demo/hello.txt", dest.to_str().unwrap(), true)
        .unwrap();

    let on_disk = std::fs::read(&dest).unwrap();
    let _ = std::fs::remove_file(&dest);
    assert_eq!(on_disk, body);
    assert_eq!(digest, md5_hex(&body));
}

#[test]
fn copy_upload_checks_size_when_md5_not_requested() {
    let src = std::env::temp_dir().join("vospace-client-test-upload-src.bin");
    std::fs::write(&src, b"upload me").unwrap();

    let addr = common::spawn(move |req: MockRequest| {
        assert_eq!(req.method, "PUT");
        MockResponse::text(200, "OK", Vec::new())
    });

    let client = client_for(&addr);
    let written = client
        .copy(src.to_str().unwrap(), "vos://test!vospace/demo/uploaded.bin", false)
        .unwrap();

    let _ = std::fs::remove_file(&src);
    assert_eq!(written, "9");
}

#[test]
fn status_treats_a_redirecting_head_as_existing() {
    // A HEAD that gets redirected is accepted as-is, not followed --
    // 302/303 are in the default accepted-status set.
    let addr = common::spawn(|req: MockRequest| {
        assert_eq!(req.method, "HEAD");
        MockResponse::text(302, "Found", Vec::new()).header("Location", "http://elsewhere/")
    });

    let client = client_for(&addr);
    client.status("vos://test!vospace/demo/hello.txt").unwrap();
}

#[test]
fn get_node_retries_after_503_using_retry_after_header() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let xml = data_node_xml("vos://test!vospace/demo/hello.txt", b"retried ok");

    let addr = common::spawn(move |req: MockRequest| {
        assert_eq!(req.method, "GET");
        let n = calls_clone.fetch_add(1, Ordering::SeqCst);
        match n {
            0 => MockResponse::text(503, "Service Unavailable", Vec::new()).header("Retry-After", "0"),
            _ => MockResponse::text(200, "OK", xml.clone()).header("Content-Type", "text/xml"),
        }
    });

    let mut cfg = ClientConfig::for_test_listener(&addr);
    cfg.root_node = "vos://test!vospace".to_string();
    cfg.default_authority = "test!vospace".to_string();
    cfg.default_retry_after = std::time::Duration::from_millis(5);
    let client = Client::new_unauthenticated(cfg).unwrap();

    let node = client.get_node("vos://test!vospace/demo/hello.txt", 0).unwrap();
    assert_eq!(node.properties.get("length"), Some("10"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn mkdir_on_existing_container_is_already_exists() {
    let addr = common::spawn(|req: MockRequest| {
        assert_eq!(req.method, "PUT");
        MockResponse::text(409, "Conflict", "DuplicateNode: already there")
    });

    let client = client_for(&addr);
    let err = client.mkdir("vos://test!vospace/demo/existing").unwrap_err();
    assert!(matches!(err, vospace_client::Error::AlreadyExists { .. }));
}

#[test]
fn move_node_succeeds_only_on_exact_status_200() {
    let addr = common::spawn(|req: MockRequest| {
        assert_eq!(req.method, "POST");
        MockResponse::text(200, "OK", Vec::new())
    });

    let client = client_for(&addr);
    let moved = client
        .move_node("vos://test!vospace/demo/a.txt", "vos://test!vospace/demo/b.txt")
        .unwrap();
    assert!(moved);
}

#[test]
fn move_node_propagates_an_unexpected_status_instead_of_returning_false() {
    let addr = common::spawn(|req: MockRequest| {
        assert_eq!(req.method, "POST");
        MockResponse::text(404, "Not Found", Vec::new())
    });

    let client = client_for(&addr);
    let err = client
        .move_node("vos://test!vospace/demo/a.txt", "vos://test!vospace/demo/b.txt")
        .unwrap_err();
    assert!(matches!(err, vospace_client::Error::NotFound { .. }));
}

#[test]
fn get_node_on_duplicate_node_conflict_is_already_exists() {
    let addr = common::spawn(|req: MockRequest| {
        assert_eq!(req.method, "GET");
        MockResponse::text(409, "Conflict", "DuplicateNode: already there")
    });

    let client = client_for(&addr);
    let err = client.get_node("vos://test!vospace/demo/hello.txt", 0).unwrap_err();
    assert!(matches!(err, vospace_client::Error::AlreadyExists { .. }));
}
