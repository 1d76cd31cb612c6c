//! End-to-end loopback scenarios: a real server and a real client exchanging
//! traffic over 127.0.0.1.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mstream::{
    Client, ClientConfig, NullEmitter, Origin, Scheme, Server, ServerConfig, SubtestKind,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mstream-e2e-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

async fn start_server(data_dir: &Path) -> (SocketAddr, watch::Sender<bool>, JoinHandle<()>) {
    let mut server = Server::new(ServerConfig {
        listen: "127.0.0.1:0".parse().expect("loopback addr"),
        tls_listen: None,
        cert_file: None,
        key_file: None,
        data_dir: data_dir.to_path_buf(),
    });
    server.set_emitter(Arc::new(NullEmitter));
    let bound = server.bind().await.expect("bind server");
    let addr = bound.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(bound.run(shutdown_rx));
    (addr, shutdown_tx, handle)
}

fn quiet_client(addr: SocketAddr, config: ClientConfig) -> Client {
    let mut client = Client::with_config(addr.to_string(), config);
    client.set_emitter(Arc::new(NullEmitter));
    client
}

fn loopback_config(duration: Duration) -> ClientConfig {
    ClientConfig {
        scheme: Scheme::Ws,
        duration,
        ..ClientConfig::default()
    }
}

/// Polls the archival directory until one record shows up.
async fn wait_for_record(dir: &Path) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.path().extension().is_some_and(|ext| ext == "json") {
                    let body = std::fs::read_to_string(entry.path()).expect("read record");
                    return serde_json::from_str(&body).expect("valid record JSON");
                }
            }
        }
        assert!(
            Instant::now() < deadline,
            "no archival record appeared in {}",
            dir.display()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn assert_monotonic(measurements: &[serde_json::Value]) {
    let mut prev_bytes = 0i64;
    let mut prev_elapsed = 0i64;
    for m in measurements {
        let bytes = m["AppInfo"]["NumBytes"].as_i64().expect("NumBytes");
        let elapsed = m["AppInfo"]["ElapsedTime"].as_i64().expect("ElapsedTime");
        assert!(bytes >= prev_bytes, "NumBytes regressed");
        assert!(elapsed >= prev_elapsed, "ElapsedTime regressed");
        prev_bytes = bytes;
        prev_elapsed = elapsed;
    }
}

#[tokio::test]
async fn minimum_download_produces_measurements_and_archives() {
    let data_dir = scratch_dir("download");
    let (addr, shutdown_tx, server) = start_server(&data_dir).await;

    let client = quiet_client(addr, loopback_config(Duration::from_secs(1)));
    let results = client
        .start_n(SubtestKind::Download, 1, "mid-download")
        .await
        .expect("download measurement");

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.sub_type, SubtestKind::Download);
    assert_eq!(result.measurement_id, "mid-download");
    assert!(result
        .client_measurements
        .iter()
        .all(|m| m.origin == Origin::Receiver));
    assert!(result
        .server_measurements
        .iter()
        .all(|m| m.origin == Origin::Sender));
    assert!(
        !result.client_measurements.is_empty(),
        "receiver produced no samples"
    );
    assert!(
        !result.server_measurements.is_empty(),
        "no in-band sender samples arrived"
    );

    let received = result
        .client_measurements
        .iter()
        .map(|m| m.app_info.num_bytes)
        .max()
        .unwrap_or(0);
    assert!(received > 0, "receiver observed no bytes");

    // Per-origin counters never regress within a stream.
    let mut prev = 0;
    for m in &result.client_measurements {
        assert!(m.app_info.num_bytes >= prev);
        prev = m.app_info.num_bytes;
    }

    // The server archived the same stream, with the client's counterflow
    // samples routed into ClientMeasurements.
    let record = wait_for_record(&data_dir.join("download")).await;
    assert_eq!(record["MeasurementID"], "mid-download");
    assert_eq!(record["SubType"], "download");
    let server_side = record["ServerMeasurements"].as_array().expect("array");
    let client_side = record["ClientMeasurements"].as_array().expect("array");
    assert!(!server_side.is_empty(), "server archived no own samples");
    assert!(
        !client_side.is_empty(),
        "client counterflow missing from the server record"
    );
    assert!(server_side.iter().all(|m| m["Origin"] == "sender"));
    assert!(client_side.iter().all(|m| m["Origin"] == "receiver"));
    assert_monotonic(server_side);
    assert_monotonic(client_side);

    let _ = shutdown_tx.send(true);
    let _ = server.await;
    let _ = std::fs::remove_dir_all(&data_dir);
}

#[tokio::test]
async fn staggered_upload_starts_every_stream() {
    let data_dir = scratch_dir("upload");
    let (addr, shutdown_tx, server) = start_server(&data_dir).await;

    let config = ClientConfig {
        streams_delay: Duration::from_millis(200),
        ..loopback_config(Duration::from_secs(2))
    };
    let client = quiet_client(addr, config);
    let started = Instant::now();
    let results = client
        .start_n(SubtestKind::Upload, 3, "mid-upload")
        .await
        .expect("upload measurement");
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 3);
    for result in &results {
        assert_eq!(result.sub_type, SubtestKind::Upload);
        // Upload routing: own sender samples are the client's, the peer's
        // counterflow samples are the server's.
        assert!(result
            .client_measurements
            .iter()
            .all(|m| m.origin == Origin::Sender));
        assert!(result
            .server_measurements
            .iter()
            .all(|m| m.origin == Origin::Receiver));
    }

    // Launches are spaced by the configured delay.
    let spread = results[2].start_time - results[0].start_time;
    assert!(
        spread.num_milliseconds() >= 300,
        "streams started only {}ms apart",
        spread.num_milliseconds()
    );

    // The duration budget bounds the whole run, with scheduling slack.
    assert!(elapsed < Duration::from_secs(6), "run took {elapsed:?}");

    let _ = shutdown_tx.send(true);
    let _ = server.await;
    let _ = std::fs::remove_dir_all(&data_dir);
}

#[tokio::test]
async fn hard_timeout_terminates_all_streams() {
    let data_dir = scratch_dir("timeout");
    let (addr, shutdown_tx, server) = start_server(&data_dir).await;

    let client = quiet_client(addr, loopback_config(Duration::from_millis(500)));
    let started = Instant::now();
    let results = client
        .start_n(SubtestKind::Download, 2, "mid-timeout")
        .await
        .expect("bounded measurement");
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 2);
    assert!(elapsed >= Duration::from_millis(400), "ended early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "deadline ignored: {elapsed:?}");
    for result in &results {
        assert!(result.end_time >= result.start_time);
    }

    let _ = shutdown_tx.send(true);
    let _ = server.await;
    let _ = std::fs::remove_dir_all(&data_dir);
}

#[tokio::test]
async fn missing_measurement_id_is_rejected_without_upgrade() {
    let data_dir = scratch_dir("badrequest");
    let (addr, shutdown_tx, server) = start_server(&data_dir).await;

    let mut request = format!("ws://{addr}/msak/ndtm/upload")
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        "net.measurementlab.ndt.m".parse().expect("header value"),
    );

    let err = tokio_tungstenite::connect_async(request)
        .await
        .expect_err("upgrade must be refused");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 400);
            assert_eq!(
                response
                    .headers()
                    .get("Connection")
                    .map(|value| value.as_bytes()),
                Some(&b"close"[..])
            );
        }
        other => panic!("expected an HTTP 400 rejection, got: {other}"),
    }

    let _ = shutdown_tx.send(true);
    let _ = server.await;
    let _ = std::fs::remove_dir_all(&data_dir);
}

#[tokio::test]
async fn invalid_configurations_fail_before_any_io() {
    // Endpoint is unroutable on purpose: validation must reject first.
    let client = quiet_client(
        "0.0.0.0:1".parse().expect("addr"),
        ClientConfig {
            streams_delay: Duration::from_millis(600),
            ..loopback_config(Duration::from_secs(1))
        },
    );
    let started = Instant::now();
    let err = client
        .start_n(SubtestKind::Download, 3, "mid-config")
        .await
        .expect_err("config must be rejected");
    assert!(matches!(err, mstream::Error::Config(_)));
    assert!(started.elapsed() < Duration::from_millis(100));
}
