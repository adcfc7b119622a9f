use std::{
    convert::Infallible,
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    ext::ReasonPhrase,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

use crate::{
    config::{Config, FixtureMode},
    fixture::{FixtureError, FixtureKey, FixtureStore, is_synthetic, strip_synthetic_prefix},
    rewrite::RewritePlan,
    wire::{RawResponse, sync_content_length},
};

type UpstreamClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

const NOT_FOUND_EXPLANATION: &str = "The requested URL was not found on this server.";
const MAX_REQUEST_HEAD: usize = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A running replay server. Dropping the handle without calling
/// [`ReplayHandle::shutdown`] leaves the accept loop running until the
/// runtime stops.
#[derive(Debug)]
pub struct ReplayHandle {
    pub listen_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ReplayHandle {
    /// `http://<host>:<port>` as embedded in replayed responses.
    pub fn base_url(&self) -> &str {
        &self.state.base_url
    }

    pub fn synthetic_prefix(&self) -> &str {
        &self.state.synthetic_prefix
    }

    pub fn synthetic_url(&self) -> String {
        format!("{}{}", self.state.base_url, self.state.synthetic_prefix)
    }

    /// The dataset name handed to the driver under test.
    pub fn driver_uri(&self) -> String {
        format!("OGCAPI:{}", self.synthetic_url())
    }

    pub fn mode(&self) -> FixtureMode {
        self.state.mode
    }

    pub fn fixture_store(&self) -> &FixtureStore {
        &self.state.store
    }

    pub fn recording_failures(&self) -> Vec<String> {
        self.state.failures()
    }

    /// Stops accepting connections and waits for the accept loop. Fails if any
    /// recording fetch failed while the server was up.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;

        let failures = self.state.failures();
        match failures.as_slice() {
            [] => Ok(()),
            [first, rest @ ..] => Err(anyhow::anyhow!(
                "recording failed for {} request(s); first failure: {first}",
                rest.len() + 1
            )),
        }
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ReplayHandle> {
    config.validate()?;

    let listener = TcpListener::bind(config.server.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.server.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;
    let base_url = advertised_base_url(listen_addr);
    let synthetic_prefix = config.server.synthetic_prefix.clone();
    let mode = config.fixture_mode();

    let recorder = if mode.is_recording() {
        Some(Recorder::new(
            &config.record.upstream,
            &format!("{base_url}{synthetic_prefix}"),
        )?)
    } else {
        None
    };

    let state = Arc::new(ServerState {
        store: FixtureStore::new(&config.fixtures.dir),
        replay_plan: RewritePlan::for_replay(&base_url)?,
        base_url,
        synthetic_prefix,
        mode,
        recorder,
        failures: Mutex::new(Vec::new()),
    });

    let loop_state = Arc::clone(&state);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Some(stream) = accepted(accept).await else { continue };
                    tokio::spawn(handle_connection(stream, Arc::clone(&loop_state)));
                }
            }
        }
    });

    Ok(ReplayHandle {
        listen_addr,
        state,
        shutdown_tx,
        join,
    })
}

/// The accepted stream, or `None` after [`ACCEPT_BACKOFF`] when accept failed.
/// Errors such as EMFILE persist, so retrying at once would spin.
async fn accepted(accept: io::Result<(TcpStream, SocketAddr)>) -> Option<TcpStream> {
    match accept {
        Ok((stream, _peer)) => Some(stream),
        Err(err) => {
            tracing::debug!("accept failed: {err}");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

fn advertised_base_url(listen_addr: SocketAddr) -> String {
    let ip = if listen_addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        listen_addr.ip()
    };
    format!("http://{}", SocketAddr::new(ip, listen_addr.port()))
}

#[derive(Debug)]
struct ServerState {
    store: FixtureStore,
    base_url: String,
    synthetic_prefix: String,
    mode: FixtureMode,
    replay_plan: RewritePlan,
    recorder: Option<Recorder>,
    failures: Mutex<Vec<String>>,
}

impl ServerState {
    fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }

    fn push_failure(&self, failure: String) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(failure);
        }
    }

    fn should_record(&self, key: &FixtureKey) -> bool {
        match self.mode {
            FixtureMode::Replay => false,
            FixtureMode::Record { refresh_existing } => refresh_existing || !self.store.contains(key),
        }
    }
}

#[derive(Debug)]
pub enum RecordError {
    InvalidUpstreamUri(String),
    Transport(String),
    Body(String),
    Persist(FixtureError),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUpstreamUri(message) => write!(f, "invalid upstream uri: {message}"),
            Self::Transport(message) => write!(f, "upstream request failed: {message}"),
            Self::Body(message) => write!(f, "read upstream response body: {message}"),
            Self::Persist(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persist(err) => Some(err),
            Self::InvalidUpstreamUri(_) | Self::Transport(_) | Self::Body(_) => None,
        }
    }
}

struct Recorder {
    client: UpstreamClient,
    upstream_endpoint: String,
    plan: RewritePlan,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("upstream_endpoint", &self.upstream_endpoint)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    fn new(upstream_endpoint: &str, local_endpoint: &str) -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let upstream_endpoint = upstream_endpoint.trim().trim_end_matches('/').to_owned();
        Ok(Self {
            client: build_upstream_client()?,
            plan: RewritePlan::for_recording(&upstream_endpoint, local_endpoint)?,
            upstream_endpoint,
        })
    }

    /// Fetches the upstream counterpart of `request_path`, rewrites upstream
    /// links to the local endpoint and persists the result under `key`.
    /// Returns the stored bytes.
    async fn record(
        &self,
        store: &FixtureStore,
        key: &FixtureKey,
        upstream_path: &str,
    ) -> Result<Vec<u8>, RecordError> {
        let uri: Uri = format!("{}{upstream_path}", self.upstream_endpoint)
            .parse()
            .map_err(|err| RecordError::InvalidUpstreamUri(format!("{err}")))?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .header(header::ACCEPT_ENCODING, "identity")
            .body(Full::new(Bytes::new()))
            .map_err(|err| RecordError::InvalidUpstreamUri(format!("{uri}: {err}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| RecordError::Transport(format!("GET {uri}: {err}")))?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| RecordError::Body(format!("GET {uri}: {err}")))?
            .to_bytes();

        let mut raw = RawResponse::from_upstream(parts.status, &parts.headers, body);
        self.plan.apply_to_response(&mut raw);
        let encoded = raw.encode();
        store
            .write_async(key, encoded.clone())
            .await
            .map_err(RecordError::Persist)?;
        tracing::debug!(
            fixture = %key,
            upstream = %uri,
            status = raw.status.as_u16(),
            "recorded fixture"
        );
        Ok(encoded)
    }
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_upstream_client() -> anyhow::Result<UpstreamClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

enum Route {
    /// Complete response bytes to write as they are.
    Fixture(Vec<u8>),
    /// Recording failed: close without a response.
    Close,
    /// No fixture applies; hyper answers with 404 or 501.
    Fallback,
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) {
    let head = match read_request_head(&mut stream).await {
        Ok(head) => head,
        Err(err) => {
            tracing::debug!("read request head: {err}");
            return;
        }
    };

    match route(&state, &head).await {
        Route::Fixture(bytes) => {
            if let Err(err) = write_raw_response(&mut stream, &bytes).await {
                tracing::debug!("write fixture response: {err}");
            }
        }
        Route::Close => {}
        Route::Fallback => {
            let io = TokioIo::new(PrefixedStream::new(head, stream));
            let service = service_fn(fallback_handler);
            let mut builder = ConnectionBuilder::new(TokioExecutor::new());
            builder.http1().keep_alive(false);
            if let Err(err) = builder.serve_connection(io, service).await {
                tracing::debug!("connection error: {err}");
            }
        }
    }
}

/// Writes a complete response and closes the write half. Fixtures are served
/// one per connection.
async fn write_raw_response(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes).await?;
    stream.shutdown().await
}

/// Reads until the blank line ending the request head, EOF, or
/// [`MAX_REQUEST_HEAD`] bytes.
async fn read_request_head(stream: &mut TcpStream) -> io::Result<Bytes> {
    let mut head = BytesMut::with_capacity(1024);
    while !has_head_end(&head) && head.len() < MAX_REQUEST_HEAD {
        if stream.read_buf(&mut head).await? == 0 {
            break;
        }
    }
    Ok(head.freeze())
}

fn has_head_end(buf: &[u8]) -> bool {
    buf.windows(4).any(|window| window == b"\r\n\r\n")
        || buf.windows(2).any(|window| window == b"\n\n")
}

/// Method and path-and-query from the request line of `head`.
fn parse_request_line(head: &[u8]) -> Option<(Method, String)> {
    let line_end = head.iter().position(|&byte| byte == b'\n')?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?.trim_end_matches('\r');
    let mut parts = line.split(' ');
    let method = Method::from_bytes(parts.next()?.as_bytes()).ok()?;
    let uri: Uri = parts.next()?.parse().ok()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let path = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    Some((method, path))
}

async fn route(state: &ServerState, head: &[u8]) -> Route {
    let Some((method, path)) = parse_request_line(head) else {
        return Route::Fallback;
    };
    if method != Method::GET || !is_synthetic(&path, &state.synthetic_prefix) {
        return Route::Fallback;
    }

    let key = FixtureKey::derive(&path, &state.synthetic_prefix);
    if state.should_record(&key)
        && let Some(recorder) = state.recorder.as_ref()
    {
        let upstream_path = strip_synthetic_prefix(&path, &state.synthetic_prefix);
        return match recorder.record(&state.store, &key, &upstream_path).await {
            Ok(recorded) => Route::Fixture(recorded),
            Err(err) => {
                tracing::warn!(%path, fixture = %key, "recording failed: {err}");
                state.push_failure(format!("{path}: {err}"));
                Route::Close
            }
        };
    }

    match replay_fixture(state, &key, &path).await {
        Some(bytes) => Route::Fixture(bytes),
        None => Route::Fallback,
    }
}

/// The stored response with loopback links pointed at this server and its
/// `Content-Length` matching the rewritten body. `None` when the fixture is
/// missing or malformed.
async fn replay_fixture(state: &ServerState, key: &FixtureKey, path: &str) -> Option<Vec<u8>> {
    let recorded = match state.store.read_async(key).await {
        Ok(recorded) => recorded,
        Err(err) => {
            tracing::trace!(%path, "{err}");
            return None;
        }
    };
    let replayed = state.replay_plan.apply(&recorded).into_owned();
    match RawResponse::parse(&replayed) {
        Ok(raw) => {
            tracing::trace!(%path, fixture = %key, status = raw.status.as_u16(), "replayed fixture");
            Some(sync_content_length(replayed))
        }
        Err(err) => {
            tracing::trace!(%path, fixture = %key, "unreadable fixture: {err}");
            None
        }
    }
}

async fn fallback_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(simple_response(
            StatusCode::NOT_IMPLEMENTED,
            &format!("Unsupported method ('{}')", req.method()),
        ));
    }
    let path = req
        .uri()
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    tracing::trace!(%path, "no fixture to serve");
    Ok(not_found_response(&path))
}

/// Replays bytes already read from `inner` before reading from it again.
struct PrefixedStream<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> PrefixedStream<T> {
    fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PrefixedStream<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let len = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(len);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// 404 whose reason phrase and body both name the missing path, so drivers
/// that only surface the status line still report it.
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let message = format!("File Not Found: {path}");
    let body = format!(
        "<!DOCTYPE HTML>\n<html>\n<head><title>Error response</title></head>\n<body>\n<h1>Error response</h1>\n<p>Error code: 404</p>\n<p>Message: {message}.</p>\n<p>Error code explanation: 404 - {NOT_FOUND_EXPLANATION}</p>\n</body>\n</html>\n"
    );
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    if let Ok(reason) = ReasonPhrase::try_from(message) {
        response.extensions_mut().insert(reason);
    }
    response
}
