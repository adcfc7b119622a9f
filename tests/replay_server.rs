use std::{
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use ogcapi_replay::{
    config::Config,
    fixture::{FixtureKey, FixtureStore},
    server::{ReplayHandle, serve},
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
};

const PREFIX: &str = "/fakeogcapi";

fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

async fn send(
    server: &ReplayHandle,
    method: Method,
    path: &str,
) -> Result<(StatusCode, HeaderMap, Bytes), hyper_util::client::legacy::Error> {
    let uri: Uri = format!("{}{path}", server.base_url()).parse().unwrap();
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client().request(req).await?;
    let (parts, body) = res.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Ok((parts.status, parts.headers, body))
}

async fn get(server: &ReplayHandle, path: &str) -> (StatusCode, HeaderMap, Bytes) {
    send(server, Method::GET, path).await.unwrap()
}

fn write_fixture(dir: &Path, request_path: &str, raw: &str) {
    let store = FixtureStore::new(dir);
    store
        .write(&FixtureKey::derive(request_path, PREFIX), raw.as_bytes())
        .unwrap();
}

fn record_config(dir: &Path, upstream: &str, new_only: bool) -> Config {
    let mut config = Config::for_fixtures(dir);
    config.record.enabled = true;
    config.record.new_only = new_only;
    config.record.upstream = upstream.to_owned();
    config
}

#[tokio::test]
async fn replay_points_recorded_links_at_current_port() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "/fakeogcapi/collections?f=json",
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Content-Length: 3\r\n\
         Link: <http://127.0.0.1:8080/fakeogcapi/collections?f=json>; rel=\"self\"\r\n\
         \r\n\
         {\"href\":\"http://127.0.0.1:8080/fakeogcapi/collections/lakes\",\"title\":\"lakes\"}",
    );

    let server = serve(&Config::for_fixtures(dir.path())).await.unwrap();
    assert_eq!(
        server.driver_uri(),
        format!("OGCAPI:{}{PREFIX}", server.base_url())
    );

    let (status, headers, body) = get(&server, "/fakeogcapi/collections?f=json").await;
    assert_eq!(status, StatusCode::OK);
    let expected_body = format!(
        "{{\"href\":\"{}/fakeogcapi/collections/lakes\",\"title\":\"lakes\"}}",
        server.base_url()
    );
    assert_eq!(body, Bytes::from(expected_body.clone()));
    assert_eq!(
        headers.get(header::CONTENT_LENGTH).unwrap(),
        &HeaderValue::from(expected_body.len())
    );
    assert_eq!(
        headers.get(header::LINK).unwrap().to_str().unwrap(),
        format!(
            "<{}/fakeogcapi/collections?f=json>; rel=\"self\"",
            server.base_url()
        )
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn replay_writes_fixture_bytes_with_only_the_port_changed() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Server: GNOSIS\r\n\
         Link: <http://127.0.0.1:8080/fakeogcapi/collections?f=json>; rel=\"self\"\r\n\
         X-Trace: 1\r\n\
         Link: <http://127.0.0.1:8080/fakeogcapi/conformance>; rel=\"conformance\"\r\n\
         Content-Length: 38\r\n\
         \r\n\
         {\"href\":\"http://127.0.0.1:8080/x\"}1234";
    write_fixture(dir.path(), "/fakeogcapi/collections?f=json", recorded);

    let server = serve(&Config::for_fixtures(dir.path())).await.unwrap();
    let mut stream = TcpStream::connect(server.listen_addr).await.unwrap();
    stream
        .write_all(b"GET /fakeogcapi/collections?f=json HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();

    let port = server.listen_addr.port();
    let expected = recorded
        .replace("127.0.0.1:8080", &format!("127.0.0.1:{port}"))
        .replace(
            "Content-Length: 38",
            &format!("Content-Length: {}", 38 + port.to_string().len() - 4),
        );
    assert_eq!(String::from_utf8(received).unwrap(), expected);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn replay_preserves_recorded_error_status() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "/fakeogcapi/collections/NOT_EXISTS",
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: application/json\r\n\
         \r\n\
         {\"detail\":\"Invalid data collection\"}",
    );

    let server = serve(&Config::for_fixtures(dir.path())).await.unwrap();
    let (status, _headers, body) = get(&server, "/fakeogcapi/collections/NOT_EXISTS").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["detail"], "Invalid data collection");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_fixture_is_404_naming_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(&Config::for_fixtures(dir.path())).await.unwrap();

    let (status, _headers, body) = get(&server, "/fakeogcapi/collections/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(
        body.contains("File Not Found: /fakeogcapi/collections/missing"),
        "{body}"
    );

    let (status, _headers, body) = get(&server, "/NOT_FOUND/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(String::from_utf8_lossy(&body).contains("File Not Found: /NOT_FOUND/"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreadable_fixture_is_404() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), "/fakeogcapi/broken", "no header terminator");

    let server = serve(&Config::for_fixtures(dir.path())).await.unwrap();
    let (status, _headers, _body) = get(&server, "/fakeogcapi/broken").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn non_get_requests_are_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let server = serve(&Config::for_fixtures(dir.path())).await.unwrap();

    let (status, _headers, body) = send(&server, Method::POST, "/fakeogcapi/collections")
        .await
        .unwrap();
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(String::from_utf8_lossy(&body).contains("Unsupported method"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn record_rewrites_upstream_links_and_persists_fixture() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let server = serve(&record_config(dir.path(), &upstream.endpoint(), true))
        .await
        .unwrap();

    let (status, headers, body) = get(&server, "/fakeogcapi/collections?f=json").await;
    assert_eq!(status, StatusCode::OK);
    let local = server.synthetic_url();
    let expected_body = format!(
        "{{\"links\":[{{\"href\":\"{local}/collections?f=json\"}},{{\"href\":\"{local}/conformance\"}}]}}"
    );
    assert_eq!(String::from_utf8(body.to_vec()).unwrap(), expected_body);
    assert_eq!(
        headers.get(header::CONTENT_LENGTH).unwrap(),
        &HeaderValue::from(expected_body.len())
    );
    assert_eq!(upstream.paths(), vec!["/ogcapi/collections?f=json".to_owned()]);
    assert_eq!(
        upstream.accept_encodings(),
        vec![Some("identity".to_owned())]
    );

    let key = FixtureKey::derive("/fakeogcapi/collections?f=json", PREFIX);
    assert_eq!(key.file_name(), "request_collections_f_json.http_data");
    let stored = String::from_utf8(server.fixture_store().read(&key).unwrap()).unwrap();
    assert!(stored.starts_with("HTTP/1.1 200 OK\r\n"), "{stored}");
    assert!(stored.ends_with(&expected_body), "{stored}");
    assert!(!stored.to_ascii_lowercase().contains("content-encoding"));

    server.shutdown().await.unwrap();

    // The same fixture replays on a different port with links following it.
    let replay = serve(&Config::for_fixtures(dir.path())).await.unwrap();
    let (status, _headers, body) = get(&replay, "/fakeogcapi/collections?f=json").await;
    assert_eq!(status, StatusCode::OK);
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.contains(&format!("{}/conformance", replay.synthetic_url())));
    replay.shutdown().await.unwrap();
}

#[tokio::test]
async fn record_new_only_keeps_existing_fixtures() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "/fakeogcapi/collections?f=json",
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nalready recorded",
    );

    let server = serve(&record_config(dir.path(), &upstream.endpoint(), true))
        .await
        .unwrap();
    let (status, _headers, body) = get(&server, "/fakeogcapi/collections?f=json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"already recorded");
    assert!(upstream.paths().is_empty());

    let (status, _headers, _body) = get(&server, "/fakeogcapi/conformance").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(upstream.paths(), vec!["/ogcapi/conformance".to_owned()]);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn record_refresh_refetches_existing_fixtures() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "/fakeogcapi/collections?f=json",
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nstale",
    );

    let server = serve(&record_config(dir.path(), &upstream.endpoint(), false))
        .await
        .unwrap();
    let (_status, _headers, body) = get(&server, "/fakeogcapi/collections?f=json").await;
    assert_ne!(&body[..], b"stale");
    assert_eq!(upstream.paths(), vec!["/ogcapi/collections?f=json".to_owned()]);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn record_failure_drops_connection_and_fails_shutdown() {
    // Bind then drop to get a port nothing listens on.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let unused_addr = unused.local_addr().unwrap();
    drop(unused);

    let dir = tempfile::tempdir().unwrap();
    let server = serve(&record_config(
        dir.path(),
        &format!("http://{unused_addr}/ogcapi"),
        true,
    ))
    .await
    .unwrap();

    let result = send(&server, Method::GET, "/fakeogcapi/collections?f=json").await;
    assert!(result.is_err(), "expected the connection to be dropped");

    let key = FixtureKey::derive("/fakeogcapi/collections?f=json", PREFIX);
    assert!(!server.fixture_store().contains(&key));
    assert!(!server.recording_failures().is_empty());

    let err = server.shutdown().await.unwrap_err();
    assert!(err.to_string().contains("recording failed"), "{err}");
}

struct Upstream {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl Upstream {
    fn endpoint(&self) -> String {
        format!("http://{}/ogcapi", self.addr)
    }

    fn paths(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn accept_encodings(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, accept_encoding)| accept_encoding.clone())
            .collect()
    }
}

/// An OGC API lookalike that links to itself both absolutely and by path.
async fn spawn_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let captured = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                return;
            };
            let io = TokioIo::new(stream);
            let captured = Arc::clone(&captured);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let captured = Arc::clone(&captured);
                    async move {
                        let path = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.as_str().to_owned())
                            .unwrap_or_default();
                        let accept_encoding = req
                            .headers()
                            .get(header::ACCEPT_ENCODING)
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_owned);
                        captured.lock().unwrap().push((path, accept_encoding));

                        let body = format!(
                            "{{\"links\":[{{\"href\":\"http://{addr}/ogcapi/collections?f=json\"}},{{\"href\":\"/ogcapi/conformance\"}}]}}"
                        );
                        let mut res = Response::new(Full::new(Bytes::from(body)));
                        res.headers_mut().insert(
                            header::CONTENT_TYPE,
                            HeaderValue::from_static("application/json"),
                        );
                        Ok::<_, hyper::Error>(res)
                    }
                });
                let _ = ConnectionBuilder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    Upstream { addr, requests }
}
