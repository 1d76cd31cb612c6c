//! Client-side measurement coordinator.
//!
//! [`Client::start_n`] launches N parallel streams against a server, with a
//! configurable delay between launches and a global duration budget. Each
//! stream gets a runner task (dial, socket introspection, stream engine) and
//! a collector task (drain the measurement channel into the archival
//! record). Per-stream failures are reported through the [`Emitter`] and do
//! not abort sibling streams; the global deadline does, deterministically,
//! by closing every stream's connection.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

use crate::emit::{Emitter, LogEmitter};
use crate::model::{ConnectionInfo, Measurement, Origin, StreamResult};
use crate::netx;
use crate::persistence;
use crate::proto::{Error, SubtestKind, MEASUREMENT_CHANNEL_CAPACITY, SEC_WEBSOCKET_PROTOCOL};
use crate::stream;

/// WebSocket scheme used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Ws => write!(f, "ws"),
            Scheme::Wss => write!(f, "wss"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub scheme: Scheme,
    /// Congestion control algorithm requested from the server.
    pub congestion_control: String,
    /// Global duration budget for the whole subtest.
    pub duration: Duration,
    /// Delay between consecutive stream launches.
    pub streams_delay: Duration,
    pub connect_timeout: Duration,
    /// Skip TLS certificate verification (wss against test servers).
    pub insecure: bool,
    /// When set, archive one JSON record per stream under this directory.
    pub output_dir: Option<std::path::PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            scheme: Scheme::Wss,
            congestion_control: "bbr".to_owned(),
            duration: Duration::from_secs(10),
            streams_delay: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            insecure: false,
            output_dir: None,
        }
    }
}

pub struct Client {
    endpoint: String,
    config: ClientConfig,
    emitter: Arc<dyn Emitter>,
}

impl Client {
    /// A client with default configuration talking to `endpoint`
    /// (a `host:port` string).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_config(endpoint, ClientConfig::default())
    }

    pub fn with_config(endpoint: impl Into<String>, config: ClientConfig) -> Self {
        Client {
            endpoint: endpoint.into(),
            config,
            emitter: Arc::new(LogEmitter),
        }
    }

    pub fn set_emitter(&mut self, emitter: Arc<dyn Emitter>) {
        self.emitter = emitter;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Runs `n` parallel streams of the given subtest, grouped under the
    /// measurement id `mid`, and returns the per-stream archival records.
    pub async fn start_n(
        &self,
        kind: SubtestKind,
        n: usize,
        mid: &str,
    ) -> Result<Vec<StreamResult>, Error> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.start_n_with_cancel(kind, n, mid, cancel_rx).await
    }

    /// Like [`Client::start_n`], additionally terminating early when `cancel`
    /// flips to true. Cancellation closes every stream's connection; no task
    /// outlives this call.
    pub async fn start_n_with_cancel(
        &self,
        kind: SubtestKind,
        n: usize,
        mid: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<StreamResult>, Error> {
        validate_config(&self.config, n)?;

        // The deadline task owns the shutdown side: every stream sees the
        // same signal whether the duration elapsed or the caller canceled.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let duration = self.config.duration;
        let deadline = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    let _ = shutdown_tx.send(true);
                }
                _ = cancelled(cancel) => {
                    let _ = shutdown_tx.send(true);
                }
                _ = done_rx => {}
            }
        });

        let started = Instant::now();
        let mut tasks = Vec::with_capacity(n);
        for stream_id in 0..n {
            let (tx, rx) = mpsc::channel(MEASUREMENT_CHANNEL_CAPACITY);
            let collector = tokio::spawn(stream::collect_measurements(
                kind,
                stream_id,
                rx,
                self.emitter.clone(),
            ));
            let runner = tokio::spawn(run_stream(
                self.endpoint.clone(),
                self.config.clone(),
                kind,
                stream_id,
                mid.to_owned(),
                tx,
                shutdown_rx.clone(),
                self.emitter.clone(),
            ));
            tasks.push((runner, collector));
            if stream_id + 1 < n {
                tokio::time::sleep(self.config.streams_delay).await;
            }
        }

        let mut results = Vec::new();
        for (runner, collector) in tasks {
            let shell = runner.await.unwrap_or(None);
            let (server_measurements, client_measurements) =
                collector.await.unwrap_or_default();
            if let Some(mut result) = shell {
                result.server_measurements = server_measurements;
                result.client_measurements = client_measurements;
                results.push(result);
            }
        }

        let _ = done_tx.send(());
        let _ = deadline.await;

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let total: i64 = results.iter().map(final_receiver_bytes).sum();
            tracing::info!(
                %kind,
                streams = results.len(),
                aggregate_mbps = total as f64 * 8.0 / elapsed / 1e6,
                "measurement finished"
            );
        }

        if let Some(dir) = &self.config.output_dir {
            for result in &results {
                if let Err(err) = persistence::write_result(dir, result) {
                    tracing::error!(uuid = %result.uuid, error = %err, "failed to archive result");
                }
            }
        }

        Ok(results)
    }
}

/// Resolves when the cancel signal flips to true; a dropped sender is
/// treated as "never canceled".
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn validate_config(config: &ClientConfig, n: usize) -> Result<(), Error> {
    if n == 0 {
        return Err(Error::Config("at least one stream is required".to_owned()));
    }
    if config.duration.is_zero() {
        return Err(Error::Config("duration must be positive".to_owned()));
    }
    let lead = config
        .streams_delay
        .checked_mul((n - 1) as u32)
        .ok_or_else(|| Error::Config("streams delay overflow".to_owned()))?;
    if lead >= config.duration {
        return Err(Error::Config(format!(
            "{} streams spaced {:?} apart cannot all start within {:?}",
            n, config.streams_delay, config.duration
        )));
    }
    Ok(())
}

/// The last byte count the traffic sink reported for this stream.
fn final_receiver_bytes(result: &StreamResult) -> i64 {
    result
        .server_measurements
        .iter()
        .chain(result.client_measurements.iter())
        .filter(|m| m.origin == Origin::Receiver)
        .map(|m| m.app_info.num_bytes)
        .max()
        .unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    endpoint: String,
    config: ClientConfig,
    kind: SubtestKind,
    stream_id: usize,
    mid: String,
    measurements: mpsc::Sender<Measurement>,
    shutdown: watch::Receiver<bool>,
    emitter: Arc<dyn Emitter>,
) -> Option<StreamResult> {
    emitter.on_start(kind, stream_id);

    let ws = match dial(&endpoint, &config, kind, &mid).await {
        Ok(ws) => ws,
        Err(err) => {
            emitter.on_error(kind, &err);
            return None;
        }
    };

    let fd = netx::client_stream_fd(ws.get_ref());
    let (client_addr, server_addr) = netx::client_stream_addrs(ws.get_ref()).unwrap_or_default();
    // Losing the algorithm name is not fatal; the CC field stays empty.
    let cc = netx::get_cc(fd).unwrap_or_else(|err| {
        tracing::warn!(stream_id, error = %err, "cannot read congestion control algorithm");
        String::new()
    });
    let conn_info = ConnectionInfo {
        uuid: netx::flow_uuid(fd),
        client: client_addr,
        server: server_addr,
        cc: cc.clone(),
    };

    let mut result = StreamResult::new(&mid, kind);
    result.uuid = conn_info.uuid.clone();
    result.congestion_control = cc;
    result.start_time = Utc::now();

    let outcome = match kind {
        SubtestKind::Download => {
            stream::run_receiver(ws, fd, conn_info, measurements, shutdown).await
        }
        SubtestKind::Upload => stream::run_sender(ws, fd, conn_info, measurements, shutdown).await,
    };
    result.end_time = Utc::now();

    match outcome {
        Ok(()) => emitter.on_complete(kind, stream_id),
        Err(err) => emitter.on_error(kind, &err),
    }
    Some(result)
}

async fn dial(
    endpoint: &str,
    config: &ClientConfig,
    kind: SubtestKind,
    mid: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, Error> {
    let url = format!(
        "{}://{}{}?mid={}&cc={}",
        config.scheme,
        endpoint,
        kind.path(),
        mid,
        config.congestion_control
    );
    let mut request = url.into_client_request().map_err(Error::from)?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SEC_WEBSOCKET_PROTOCOL),
    );

    let connector = if config.insecure {
        Some(Connector::Rustls(Arc::new(insecure_tls_config())))
    } else {
        None
    };

    let (ws, _response) = tokio::time::timeout(
        config.connect_timeout,
        connect_async_tls_with_config(request, Some(stream::websocket_config()), false, connector),
    )
    .await
    .map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timeout",
        ))
    })??;
    Ok(ws)
}

fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
        .with_no_client_auth()
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Accepts any server certificate. Signatures are still checked so a
    /// handshake against a malformed peer fails loudly.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            NoVerification(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(duration_ms: u64, delay_ms: u64) -> ClientConfig {
        ClientConfig {
            duration: Duration::from_millis(duration_ms),
            streams_delay: Duration::from_millis(delay_ms),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn rejects_zero_duration() {
        assert!(matches!(
            validate_config(&config(0, 0), 1),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rejects_zero_streams() {
        assert!(matches!(
            validate_config(&config(1000, 0), 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rejects_delays_that_eat_the_whole_duration() {
        // Three streams spaced 500ms apart need a full second of lead time.
        assert!(matches!(
            validate_config(&config(1000, 500), 3),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn accepts_delays_just_under_the_duration() {
        assert!(validate_config(&config(1001, 500), 3).is_ok());
        // A single stream never needs lead time.
        assert!(validate_config(&config(1000, 0), 1).is_ok());
    }

    #[test]
    fn final_receiver_bytes_takes_the_latest_sample() {
        let mut result = StreamResult::new("mid", SubtestKind::Download);
        for bytes in [100, 2000, 50_000] {
            result.client_measurements.push(Measurement {
                app_info: crate::model::AppInfo {
                    num_bytes: bytes,
                    elapsed_time: bytes,
                },
                origin: Origin::Receiver,
                ..Default::default()
            });
        }
        result.server_measurements.push(Measurement {
            app_info: crate::model::AppInfo {
                num_bytes: 999_999,
                elapsed_time: 1,
            },
            origin: Origin::Sender,
            ..Default::default()
        });
        assert_eq!(final_receiver_bytes(&result), 50_000);
    }
}
