//! Per-stream sender and receiver engines.
//!
//! A stream is one WebSocket connection carrying one direction's payload.
//! The sender pushes random-filled binary frames whose size doubles while it
//! stays under 1/16 of the bytes sent so far, interleaved with its own JSON
//! measurements; a counterflow reader on the same connection collects the
//! peer's view. The receiver counts everything it reads and reports back
//! in-band on a memoryless cadence.
//!
//! Both engines publish [`Measurement`]s on a bounded channel. The sender
//! side never blocks on it (samples are dropped under back-pressure); the
//! receiver side is the channel's sole producer and may block.

use std::time::Instant;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::model::{AppInfo, ConnectionInfo, Measurement, Origin};
use crate::netx::{self, SockFd};
use crate::proto::{
    is_expected_close_code, Error, SubtestKind, MAX_SCALED_MESSAGE_SIZE, MIN_MESSAGE_SIZE,
    SCALING_FRACTION,
};
use crate::ticker::MemorylessTicker;

/// WebSocket options shared by both endpoints: inbound messages are capped
/// at the largest scaled payload, which bounds peer-induced memory use.
pub(crate) fn websocket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_SCALED_MESSAGE_SIZE),
        max_frame_size: Some(MAX_SCALED_MESSAGE_SIZE),
        ..WebSocketConfig::default()
    }
}

/// Runs the sender role until an error, a clean close by the peer, or the
/// shutdown signal. Two sub-tasks share the connection: the writer drives
/// the payload/measurement loop, the counterflow reader drains the peer's
/// text frames. The first failure (or the shutdown signal) closes the
/// connection, which makes the other sub-task observe an I/O error and exit;
/// both are joined before this function returns and the measurement channel
/// producer goes away.
pub async fn run_sender<S>(
    ws: WebSocketStream<S>,
    fd: SockFd,
    conn_info: ConnectionInfo,
    measurements: mpsc::Sender<Measurement>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let start = Instant::now();
    let (sink, stream) = ws.split();
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(2);
    let (close_tx, _) = watch::channel(false);

    let writer = tokio::spawn(write_loop(
        sink,
        fd,
        conn_info,
        measurements.clone(),
        err_tx.clone(),
        close_tx.subscribe(),
        start,
    ));
    let reader = tokio::spawn(counterflow_loop(
        stream,
        measurements.clone(),
        err_tx,
        close_tx.subscribe(),
    ));

    let outcome = tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => Ok(()),
        err = err_rx.recv() => match err {
            Some(err) if !err.is_clean_close() => Err(err),
            _ => Ok(()),
        },
    };

    let _ = close_tx.send(true);
    let _ = writer.await;
    let _ = reader.await;
    outcome
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    fd: SockFd,
    conn_info: ConnectionInfo,
    measurements: mpsc::Sender<Measurement>,
    err_tx: mpsc::Sender<Error>,
    mut close: watch::Receiver<bool>,
    start: Instant,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let failure = tokio::select! {
        res = drive_sender(&mut sink, fd, &conn_info, &measurements, start) => res.err(),
        _ = close.wait_for(|stop| *stop) => None,
    };
    // Closing the connection is the universal stop signal: it wakes both the
    // peer and the counterflow reader.
    let _ = sink.send(Message::Close(None)).await;
    if let Some(err) = failure {
        let _ = err_tx.try_send(err);
    }
}

async fn drive_sender<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    fd: SockFd,
    conn_info: &ConnectionInfo,
    measurements: &mpsc::Sender<Measurement>,
    start: Instant,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut total: i64 = 0;
    let mut size = MIN_MESSAGE_SIZE;
    let mut payload = prepared_payload(size);
    let mut ticker = MemorylessTicker::new();

    loop {
        sink.send(Message::Binary(payload.clone()))
            .await
            .map_err(Error::from)?;
        total += size as i64;

        if ticker.fire() {
            let elapsed = start.elapsed().as_micros() as i64;
            let m = sample(Origin::Sender, fd, conn_info, total, elapsed)?;
            let text = serde_json::to_string(&m)?;
            sink.send(Message::Text(text)).await.map_err(Error::from)?;
            // Never block the hot path on a slow consumer; the archival
            // record is informational, not authoritative.
            let _ = measurements.try_send(m);
        }

        let next = next_message_size(size, total);
        if next != size {
            size = next;
            payload = prepared_payload(size);
        }
    }
}

async fn counterflow_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    measurements: mpsc::Sender<Measurement>,
    err_tx: mpsc::Sender<Error>,
    mut close: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let failure = tokio::select! {
        res = drive_counterflow(&mut stream, &measurements) => res.err(),
        _ = close.wait_for(|stop| *stop) => None,
    };
    if let Some(err) = failure {
        let _ = err_tx.try_send(err);
    }
}

async fn drive_counterflow<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    measurements: &mpsc::Sender<Measurement>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg.map_err(Error::from)? {
            Message::Text(text) => {
                let m: Measurement = serde_json::from_str(&text)?;
                // The peer set the origin; forward it untouched, dropping
                // the sample if the consumer is behind.
                let _ = measurements.try_send(m);
            }
            Message::Close(frame) => {
                if is_expected_close_code(frame.as_ref()) {
                    return Ok(());
                }
                return Err(Error::Protocol("close with unexpected status code"));
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            Message::Binary(_) => return Err(Error::Protocol("binary counterflow message")),
        }
    }
    Ok(())
}

/// Runs the receiver role until an error, a clean close, or the shutdown
/// signal. A single task reads both frame kinds sequentially; this function
/// owns the sole producer handle of the measurement channel, so the channel
/// closes exactly when it returns.
pub async fn run_receiver<S>(
    mut ws: WebSocketStream<S>,
    fd: SockFd,
    conn_info: ConnectionInfo,
    measurements: mpsc::Sender<Measurement>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = tokio::select! {
        res = drive_receiver(&mut ws, fd, &conn_info, &measurements) => res,
        _ = shutdown.wait_for(|stop| *stop) => Ok(()),
    };
    let _ = ws.close(None).await;
    match outcome {
        Err(err) if !err.is_clean_close() => Err(err),
        _ => Ok(()),
    }
}

async fn drive_receiver<S>(
    ws: &mut WebSocketStream<S>,
    fd: SockFd,
    conn_info: &ConnectionInfo,
    measurements: &mpsc::Sender<Measurement>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let mut total: i64 = 0;
    let mut ticker = MemorylessTicker::new();

    while let Some(msg) = ws.next().await {
        match msg.map_err(Error::from)? {
            Message::Binary(data) => {
                total += data.len() as i64;
                if ticker.fire() {
                    let elapsed = start.elapsed().as_micros() as i64;
                    let m = sample(Origin::Receiver, fd, conn_info, total, elapsed)?;
                    let text = serde_json::to_string(&m)?;
                    // Counterflow message: tell the peer what we observed.
                    ws.send(Message::Text(text)).await.map_err(Error::from)?;
                    if measurements.send(m).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Message::Text(text) => {
                // In-band measurements count as transported bytes too.
                total += text.len() as i64;
                let m: Measurement = serde_json::from_str(&text)?;
                if measurements.send(m).await.is_err() {
                    return Ok(());
                }
            }
            Message::Close(frame) => {
                if is_expected_close_code(frame.as_ref()) {
                    return Ok(());
                }
                return Err(Error::Protocol("close with unexpected status code"));
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(())
}

/// Builds one application+kernel sample. A TCP_INFO read failure is fatal
/// unless the platform reports the capability as missing; BBR telemetry is
/// attached opportunistically and only while BBR is the active algorithm.
fn sample(
    origin: Origin,
    fd: SockFd,
    conn_info: &ConnectionInfo,
    total: i64,
    elapsed: i64,
) -> Result<Measurement, Error> {
    let tcp_info = match netx::tcp_info(fd) {
        Ok(mut info) => {
            info.elapsed_time = elapsed;
            Some(info)
        }
        Err(Error::Unsupported) => None,
        Err(err) => return Err(err),
    };
    let bbr_info = if conn_info.cc == "bbr" {
        netx::bbr_info(fd).ok().map(|mut info| {
            info.elapsed_time = elapsed;
            info
        })
    } else {
        None
    };
    Ok(Measurement {
        app_info: AppInfo {
            num_bytes: total,
            elapsed_time: elapsed,
        },
        connection_info: Some(conn_info.clone()),
        bbr_info,
        tcp_info,
        origin,
    })
}

/// Drains a stream's measurement channel, reporting each sample to the
/// emitter and partitioning it into the archival slices: "sender" always maps
/// to the traffic originator and "receiver" to the sink, so on a download the
/// sender's samples are the server's and on an upload they are the client's.
pub(crate) async fn collect_measurements(
    kind: SubtestKind,
    stream_id: usize,
    mut rx: mpsc::Receiver<Measurement>,
    emitter: std::sync::Arc<dyn crate::emit::Emitter>,
) -> (Vec<Measurement>, Vec<Measurement>) {
    let mut server_measurements = Vec::new();
    let mut client_measurements = Vec::new();
    while let Some(m) = rx.recv().await {
        emitter.on_measurement(kind, stream_id, &m);
        if routes_to_server(kind, m.origin) {
            server_measurements.push(m);
        } else {
            client_measurements.push(m);
        }
    }
    (server_measurements, client_measurements)
}

pub(crate) fn routes_to_server(kind: SubtestKind, origin: Origin) -> bool {
    matches!(
        (kind, origin),
        (SubtestKind::Download, Origin::Sender) | (SubtestKind::Upload, Origin::Receiver)
    )
}

fn prepared_payload(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// The payload scaling rule: double while under the scaled maximum and under
/// 1/16 of the bytes sent so far.
pub(crate) fn next_message_size(current: usize, total_sent: i64) -> usize {
    if current >= MAX_SCALED_MESSAGE_SIZE || current as i64 >= total_sent / SCALING_FRACTION {
        current
    } else {
        current * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_sizes_scale_monotonically() {
        let mut size = MIN_MESSAGE_SIZE;
        let mut total: i64 = 0;
        let mut doublings = 0;

        while total < (1 << 30) {
            total += size as i64;
            let next = next_message_size(size, total);
            assert!(next >= size);
            assert!(next <= MAX_SCALED_MESSAGE_SIZE);
            if next != size {
                assert_eq!(next, size * 2);
                doublings += 1;
            }
            size = next;
        }

        assert_eq!(size, MAX_SCALED_MESSAGE_SIZE);
        assert_eq!(doublings, 10);
    }

    #[test]
    fn payload_grows_only_past_one_sixteenth_of_total() {
        // Sixteen minimum-size writes: exactly 16 KiB sent, still no growth.
        assert_eq!(
            next_message_size(MIN_MESSAGE_SIZE, 16 * MIN_MESSAGE_SIZE as i64),
            MIN_MESSAGE_SIZE
        );
        // One more write tips the ratio and the payload doubles.
        assert_eq!(
            next_message_size(MIN_MESSAGE_SIZE, 17 * MIN_MESSAGE_SIZE as i64),
            2 * MIN_MESSAGE_SIZE
        );
    }

    #[test]
    fn payload_never_exceeds_scaled_maximum() {
        assert_eq!(
            next_message_size(MAX_SCALED_MESSAGE_SIZE, i64::MAX),
            MAX_SCALED_MESSAGE_SIZE
        );
    }

    #[test]
    fn prepared_payload_has_requested_length() {
        assert_eq!(prepared_payload(MIN_MESSAGE_SIZE).len(), MIN_MESSAGE_SIZE);
    }

    #[test]
    fn read_limit_is_the_scaled_maximum() {
        let config = websocket_config();
        assert_eq!(config.max_message_size, Some(MAX_SCALED_MESSAGE_SIZE));
    }

    #[test]
    fn measurement_routing_table() {
        assert!(routes_to_server(SubtestKind::Download, Origin::Sender));
        assert!(!routes_to_server(SubtestKind::Download, Origin::Receiver));
        assert!(!routes_to_server(SubtestKind::Upload, Origin::Sender));
        assert!(routes_to_server(SubtestKind::Upload, Origin::Receiver));
    }
}
