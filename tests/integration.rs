//! End-to-end scenarios against a mock HTTP origin, covering the concrete
//! scenarios from the write-and-verify / vector-read / checksum / mkdir /
//! delete testable properties this engine is built against.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use httpfs_core::{ErrorKind, Filesystem, OpenFlags, Runtime, RuntimeConfig};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn test_runtime() -> Arc<Runtime> {
    let mut config = RuntimeConfig::default();
    config.worker_count = 2;
    let runtime = Runtime::new(config).unwrap();
    runtime.start().await;
    runtime
}

#[tokio::test]
async fn serial_write_then_read_back_matches() {
    let server = MockServer::start().await;
    let runtime = test_runtime().await;
    let url = url::Url::parse(&format!("{}/test/write_verify", server.uri())).unwrap();

    Mock::given(method("PUT"))
        .and(path("/test/write_verify"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let mut write_file =
        httpfs_core::File::new(Arc::clone(&runtime), url.clone(), OpenFlags::write_only(), Duration::from_secs(5));
    write_file.open(url.clone()).await.unwrap();

    let mut expected = Vec::new();
    for chunk_ctr in 0..5u8 {
        let piece = vec![b'a' + chunk_ctr; 37];
        expected.extend_from_slice(&piece);
        write_file
            .write((expected.len() - piece.len()) as u64, Bytes::from(piece))
            .await
            .unwrap();
    }
    write_file.close().await.unwrap();

    let body = Bytes::from(expected.clone());
    Mock::given(method("HEAD"))
        .and(path("/test/write_verify"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", expected.len().to_string().as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/test/write_verify"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(&server)
        .await;

    let mut read_file =
        httpfs_core::File::new(Arc::clone(&runtime), url.clone(), OpenFlags::read_only(), Duration::from_secs(5));
    read_file.open(url.clone()).await.unwrap();
    let got = read_file.read(0, expected.len()).await.unwrap();
    assert_eq!(got.as_ref(), expected.as_slice());

    runtime.shutdown().await;
}

#[tokio::test]
async fn write_rejects_non_sequential_offset_without_sending_anything() {
    let server = MockServer::start().await;
    let runtime = test_runtime().await;
    let url = url::Url::parse(&format!("{}/test/no_such_object", server.uri())).unwrap();

    // No PUT mock mounted: the offset check must reject before any request is sent.
    let mut file = httpfs_core::File::new(Arc::clone(&runtime), url.clone(), OpenFlags::write_only(), Duration::from_secs(5));
    file.open(url.clone()).await.unwrap();

    let err = file.write(5, Bytes::from_static(b"abc")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgs);

    runtime.shutdown().await;
}

#[tokio::test]
async fn vector_read_handles_multipart_response_with_skipped_bytes() {
    let server = MockServer::start().await;
    let runtime = test_runtime().await;
    let url = url::Url::parse(&format!("{}/test/vector_skip", server.uri())).unwrap();

    let multipart_body = concat!(
        "--SEP\r\n",
        "Content-Type: text/plain\r\n",
        "Content-Range: bytes 0-3/8\r\n",
        "\r\n",
        "aabb\r\n",
        "--SEP\r\n",
        "Content-Range: bytes 6-7/8\r\n",
        "\r\n",
        "dd\r\n",
        "--SEP--\r\n",
    );

    Mock::given(method("HEAD"))
        .and(path("/test/vector_skip"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "8"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/test/vector_skip"))
        .and(header("Range", "bytes=0-1,2-3,6-7"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Type", "multipart/byteranges; boundary=SEP")
                .set_body_bytes(multipart_body.as_bytes().to_vec()),
        )
        .mount(&server)
        .await;

    let mut file =
        httpfs_core::File::new(Arc::clone(&runtime), url.clone(), OpenFlags::read_only(), Duration::from_secs(5));
    file.open(url.clone()).await.unwrap();
    let info = file.vector_read(&[(0, 2), (2, 2), (6, 2)]).await.unwrap();

    assert_eq!(info.parts.len(), 3);
    assert_eq!(info.parts[0].data, Bytes::from_static(b"aa"));
    assert_eq!(info.parts[1].data, Bytes::from_static(b"bb"));
    assert_eq!(info.parts[2].data, Bytes::from_static(b"dd"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn query_checksum_parses_crc32c_digest() {
    let server = MockServer::start().await;
    let runtime = test_runtime().await;
    let base = url::Url::parse(&server.uri()).unwrap();

    Mock::given(method("HEAD"))
        .and(path("/test/dog"))
        .and(header("Want-Digest", "crc32c"))
        .respond_with(ResponseTemplate::new(200).insert_header("Digest", "crc32c=0a72a4df"))
        .mount(&server)
        .await;

    let fs = Filesystem::new(Arc::clone(&runtime), base, Duration::from_secs(5));
    let result = fs.query_checksum("/test/dog", Some("crc32c")).await.unwrap();
    assert_eq!(result.to_string(), "crc32c 0a72a4df");

    runtime.shutdown().await;
}

#[tokio::test]
async fn mkdir_then_stat_reports_directory() {
    let server = MockServer::start().await;
    let runtime = test_runtime().await;
    let base = url::Url::parse(&server.uri()).unwrap();

    Mock::given(method("MKCOL"))
        .and(path("/test/mkcol_directory"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let propfind_body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/test/mkcol_directory/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/></D:resourcetype>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
    Mock::given(method("PROPFIND"))
        .and(path("/test/mkcol_directory"))
        .and(header("Depth", "0"))
        .respond_with(
            ResponseTemplate::new(207)
                .insert_header("Content-Type", "text/xml")
                .set_body_bytes(propfind_body.as_bytes().to_vec()),
        )
        .mount(&server)
        .await;

    let fs = Filesystem::new(Arc::clone(&runtime), base, Duration::from_secs(5));
    fs.mkdir("/test/mkcol_directory", false).await.unwrap();
    let stat = fs.stat("/test/mkcol_directory").await.unwrap();
    assert!(stat.is_dir);

    runtime.shutdown().await;
}

#[tokio::test]
async fn delete_makes_subsequent_stat_not_found() {
    let server = MockServer::start().await;
    let runtime = test_runtime().await;
    let base = url::Url::parse(&server.uri()).unwrap();

    Mock::given(method("PUT"))
        .and(path("/test/delete_file"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/test/delete_file"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/test/delete_file"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = base.join("/test/delete_file").unwrap();
    let mut write_file =
        httpfs_core::File::new(Arc::clone(&runtime), url.clone(), OpenFlags::write_only(), Duration::from_secs(5));
    write_file.open(url.clone()).await.unwrap();
    write_file.write(0, Bytes::from_static(b"12345678")).await.unwrap();
    write_file.close().await.unwrap();

    let fs = Filesystem::new(Arc::clone(&runtime), base.clone(), Duration::from_secs(5));
    fs.rm("/test/delete_file").await.unwrap();

    let err = fs.stat("/test/delete_file").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    runtime.shutdown().await;
}

#[tokio::test]
async fn put_stall_causes_next_write_to_expire() {
    let server = MockServer::start().await;
    let mut config = RuntimeConfig::default();
    config.worker_count = 1;
    let runtime = Runtime::new(config).unwrap();
    runtime.start().await;
    let url = url::Url::parse(&format!("{}/test/stalled_put", server.uri())).unwrap();

    Mock::given(method("PUT"))
        .and(path("/test/stalled_put"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let mut file = httpfs_core::File::new(
        Arc::clone(&runtime),
        url.clone(),
        OpenFlags::write_only(),
        Duration::from_secs(5),
    );
    file.set_property("XrdClCurlMaintenancePeriod", "1").await.unwrap();
    file.set_property("XrdClCurlStallTimeout", "50ms").await.unwrap();
    file.open(url.clone()).await.unwrap();

    let first = Bytes::from_static(b"first-chunk");
    let first_len = first.len() as u64;
    file.write(0, first).await.unwrap();

    // No further chunk arrives within the stall timeout, so the worker's
    // body stream aborts and drops the receiver out from under us.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = file.write(first_len, Bytes::from_static(b"next")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TimerExpired);

    runtime.shutdown().await;
}
