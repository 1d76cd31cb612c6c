//! Server request pipeline.
//!
//! The server accepts TCP connections itself (optionally wrapping them in
//! TLS) and performs the WebSocket upgrade directly, because the pipeline
//! needs the raw socket handle before any traffic flows: the requested
//! congestion-control algorithm is pinned on it and TCP statistics are
//! sampled from it for the whole lifetime of the stream. Cleartext and TLS
//! listeners share the same connection handler.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};

use crate::emit::{Emitter, LogEmitter};
use crate::model::{ConnectionInfo, StreamResult};
use crate::netx::{self, SockFd};
use crate::persistence;
use crate::proto::{
    Error, SubtestKind, DOWNLOAD_PATH, MAX_RUNTIME, MEASUREMENT_CHANNEL_CAPACITY,
    SEC_WEBSOCKET_PROTOCOL, UPLOAD_PATH,
};
use crate::stream;

/// Absolute bound on accepting a connection: TLS plus WebSocket handshake.
/// Prevents clients or middleboxes from holding a connection open idle.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolves a measurement id from a verified access token. The verification
/// itself happens behind this boundary; the pipeline only consumes the id.
pub trait Authorizer: Send + Sync {
    fn measurement_id(&self, request: &Request) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cleartext listen address.
    pub listen: SocketAddr,
    /// Optional TLS listen address; requires `cert_file` and `key_file`.
    pub tls_listen: Option<SocketAddr>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Directory receiving one archival JSON record per stream.
    pub data_dir: PathBuf,
}

pub struct Server {
    config: ServerConfig,
    emitter: Arc<dyn Emitter>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            emitter: Arc::new(LogEmitter),
            authorizer: None,
        }
    }

    pub fn set_emitter(&mut self, emitter: Arc<dyn Emitter>) {
        self.emitter = emitter;
    }

    pub fn set_authorizer(&mut self, authorizer: Arc<dyn Authorizer>) {
        self.authorizer = Some(authorizer);
    }

    /// Binds the configured listeners. Fails synchronously on invalid
    /// configuration, before any connection is served.
    pub async fn bind(self) -> Result<BoundServer, Error> {
        let listener = TcpListener::bind(self.config.listen).await?;
        let tls = match self.config.tls_listen {
            Some(addr) => {
                let (cert, key) = match (&self.config.cert_file, &self.config.key_file) {
                    (Some(cert), Some(key)) => (cert, key),
                    _ => {
                        return Err(Error::Config(
                            "TLS listener requires cert_file and key_file".to_owned(),
                        ))
                    }
                };
                let acceptor = tls_acceptor(cert, key)?;
                Some((TcpListener::bind(addr).await?, acceptor))
            }
            None => None,
        };
        Ok(BoundServer {
            listener,
            tls,
            state: Arc::new(ServerState {
                data_dir: self.config.data_dir,
                emitter: self.emitter,
                authorizer: self.authorizer,
            }),
        })
    }
}

pub struct BoundServer {
    listener: TcpListener,
    tls: Option<(TcpListener, TlsAcceptor)>,
    state: Arc<ServerState>,
}

impl BoundServer {
    /// The bound cleartext address, useful when listening on port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.tls
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    /// Serves until the shutdown signal flips to true. In-flight streams
    /// still finish within their own deadlines.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let cleartext = tokio::spawn(accept_loop(
            self.listener,
            None,
            self.state.clone(),
            shutdown.clone(),
        ));
        if let Some((listener, acceptor)) = self.tls {
            let tls = tokio::spawn(accept_loop(
                listener,
                Some(acceptor),
                self.state.clone(),
                shutdown,
            ));
            let _ = tls.await;
        }
        let _ = cleartext.await;
    }
}

struct ServerState {
    data_dir: PathBuf,
    emitter: Arc<dyn Emitter>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, tls.clone(), state.clone()));
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    state: Arc<ServerState>,
) {
    // The handle stays valid across the TLS wrap; capture it while the
    // TcpStream is still visible.
    #[cfg(unix)]
    let fd: SockFd = {
        use std::os::fd::AsRawFd;
        stream.as_raw_fd()
    };
    #[cfg(not(unix))]
    let fd: SockFd = netx::NO_FD;

    let local = stream.local_addr().ok();

    // One budget for the whole handshake: the TLS accept and the WebSocket
    // upgrade share the same deadline instead of each restarting the clock.
    let handshake_deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

    let outcome = match tls {
        Some(acceptor) => {
            let accepted =
                tokio::time::timeout_at(handshake_deadline, acceptor.accept(stream)).await;
            match accepted {
                Ok(Ok(tls_stream)) => {
                    serve_stream(tls_stream, fd, peer, local, state, handshake_deadline).await
                }
                Ok(Err(err)) => {
                    tracing::warn!(%peer, error = %err, "TLS accept failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(%peer, "TLS handshake timed out");
                    return;
                }
            }
        }
        None => serve_stream(stream, fd, peer, local, state, handshake_deadline).await,
    };

    if let Err(err) = outcome {
        tracing::warn!(%peer, error = %err, "request failed");
    }
}

#[derive(Debug)]
struct RequestMeta {
    kind: SubtestKind,
    mid: String,
    cc: String,
}

async fn serve_stream<S>(
    stream: S,
    fd: SockFd,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    state: Arc<ServerState>,
    handshake_deadline: tokio::time::Instant,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut meta: Option<RequestMeta> = None;
    let authorizer = state.authorizer.clone();
    let callback = |request: &Request, mut response: Response| {
        let validated = validate_request(request, authorizer.as_deref())?;
        response.headers_mut().append(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SEC_WEBSOCKET_PROTOCOL),
        );
        meta = Some(validated);
        Ok(response)
    };

    let upgrade = tokio::time::timeout_at(
        handshake_deadline,
        accept_hdr_async_with_config(stream, callback, Some(stream::websocket_config())),
    )
    .await;
    let ws = match upgrade {
        Ok(Ok(ws)) => ws,
        Ok(Err(err)) => {
            tracing::info!(%peer, error = %err, "websocket upgrade rejected");
            return Ok(());
        }
        Err(_) => {
            tracing::warn!(%peer, "websocket handshake timed out");
            return Ok(());
        }
    };
    let meta = meta.expect("upgrade callback ran");

    // Wake the engine loops when the subtest deadline fires by closing the
    // connection through the shared shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let deadline = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(MAX_RUNTIME) => {
                let _ = shutdown_tx.send(true);
            }
            _ = done_rx => {}
        }
    });

    let outcome = run_measurement(ws, fd, peer, local, &state, meta, shutdown_rx).await;

    let _ = done_tx.send(());
    let _ = deadline.await;
    outcome
}

async fn run_measurement<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    fd: SockFd,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    state: &ServerState,
    meta: RequestMeta,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let kind = meta.kind;

    // Best-effort: a rejected algorithm leaves the active one in place.
    if let Err(err) = netx::set_cc(fd, &meta.cc) {
        tracing::warn!(%peer, cc = %meta.cc, error = %err, "cannot set congestion control");
    }
    // The authoritative algorithm name comes from the socket. Where the
    // platform supports the query at all, a failure means the socket is in
    // an unexpected state and the measurement is aborted.
    let cc = match netx::get_cc(fd) {
        Ok(cc) => cc,
        Err(Error::Unsupported) => String::new(),
        Err(err) => return Err(err),
    };

    let uuid = netx::flow_uuid(fd);
    let conn_info = ConnectionInfo {
        uuid: uuid.clone(),
        client: peer.to_string(),
        server: local.map(|addr| addr.to_string()).unwrap_or_default(),
        cc: cc.clone(),
    };

    let mut result = StreamResult::new(&meta.mid, kind);
    result.uuid = uuid;
    result.congestion_control = cc;
    result.start_time = Utc::now();

    state.emitter.on_start(kind, 0);
    let (tx, rx) = mpsc::channel(MEASUREMENT_CHANNEL_CAPACITY);
    let collector = tokio::spawn(stream::collect_measurements(
        kind,
        0,
        rx,
        state.emitter.clone(),
    ));

    let outcome = match kind {
        SubtestKind::Download => stream::run_sender(ws, fd, conn_info, tx, shutdown).await,
        SubtestKind::Upload => stream::run_receiver(ws, fd, conn_info, tx, shutdown).await,
    };

    let (server_measurements, client_measurements) = collector.await.unwrap_or_default();
    result.server_measurements = server_measurements;
    result.client_measurements = client_measurements;
    result.end_time = Utc::now();

    // Engine failures are recorded failures: visible to the emitter, and the
    // partial record is archived all the same.
    match &outcome {
        Ok(()) => state.emitter.on_complete(kind, 0),
        Err(err) => state.emitter.on_error(kind, err),
    }
    if let Err(err) = persistence::write_result(&state.data_dir, &result) {
        tracing::error!(uuid = %result.uuid, error = %err, "failed to archive result");
    }

    outcome
}

fn validate_request(
    request: &Request,
    authorizer: Option<&dyn Authorizer>,
) -> Result<RequestMeta, ErrorResponse> {
    let kind = match request.uri().path() {
        DOWNLOAD_PATH => SubtestKind::Download,
        UPLOAD_PATH => SubtestKind::Upload,
        _ => return Err(bad_request("unknown path")),
    };

    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !offered
        .split(',')
        .any(|proto| proto.trim() == SEC_WEBSOCKET_PROTOCOL)
    {
        return Err(bad_request("missing websocket subprotocol"));
    }

    let query = request.uri().query().unwrap_or("");
    let mid = authorizer
        .and_then(|authorizer| authorizer.measurement_id(request))
        .or_else(|| query_param(query, "mid"))
        .ok_or_else(|| bad_request("no access token or mid"))?;

    // The algorithm is selected by query parameter only.
    let cc = query_param(query, "cc").unwrap_or_else(|| "bbr".to_owned());

    Ok(RequestMeta { kind, mid, cc })
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_owned())
    })
}

fn bad_request(reason: &'static str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_owned()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
        .headers_mut()
        .append("Connection", HeaderValue::from_static("close"));
    response
}

fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| Error::Config("no private key found in key file".to_owned()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::Config(format!("invalid TLS configuration: {err}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, with_protocol: bool) -> Request {
        let mut builder = Request::builder().uri(uri);
        if with_protocol {
            builder = builder.header("Sec-WebSocket-Protocol", SEC_WEBSOCKET_PROTOCOL);
        }
        builder.body(()).expect("valid request")
    }

    #[test]
    fn accepts_a_complete_download_request() {
        let meta = validate_request(&request("/msak/ndtm/download?mid=m1&cc=cubic", true), None)
            .expect("valid request");
        assert_eq!(meta.kind, SubtestKind::Download);
        assert_eq!(meta.mid, "m1");
        assert_eq!(meta.cc, "cubic");
    }

    #[test]
    fn congestion_control_defaults_to_bbr() {
        let meta = validate_request(&request("/msak/ndtm/upload?mid=m1", true), None)
            .expect("valid request");
        assert_eq!(meta.kind, SubtestKind::Upload);
        assert_eq!(meta.cc, "bbr");
    }

    #[test]
    fn rejects_missing_measurement_id() {
        let response =
            validate_request(&request("/msak/ndtm/upload", true), None).expect_err("rejected");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("Connection").map(|v| v.as_bytes()),
            Some(&b"close"[..])
        );
    }

    #[test]
    fn rejects_missing_subprotocol() {
        let response = validate_request(&request("/msak/ndtm/download?mid=m1", false), None)
            .expect_err("rejected");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rejects_unknown_paths() {
        let response =
            validate_request(&request("/msak/ndtm/sideways?mid=m1", true), None)
                .expect_err("rejected");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    struct FixedAuthorizer(&'static str);

    impl Authorizer for FixedAuthorizer {
        fn measurement_id(&self, _request: &Request) -> Option<String> {
            Some(self.0.to_owned())
        }
    }

    #[test]
    fn token_claim_takes_precedence_over_query() {
        let authorizer = FixedAuthorizer("from-token");
        let meta = validate_request(
            &request("/msak/ndtm/download?mid=from-query", true),
            Some(&authorizer),
        )
        .expect("valid request");
        assert_eq!(meta.mid, "from-token");
    }

    #[test]
    fn query_param_parsing() {
        assert_eq!(query_param("mid=a&cc=bbr", "cc").as_deref(), Some("bbr"));
        assert_eq!(query_param("mid=a&cc=", "cc"), None);
        assert_eq!(query_param("", "mid"), None);
        assert_eq!(query_param("midx=a", "mid"), None);
    }
}
