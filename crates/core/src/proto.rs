//! Wire protocol constants and error classification.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// Minimum size of a binary message.
pub const MIN_MESSAGE_SIZE: usize = 1 << 10;

/// Maximum size a scaled binary message may grow to. This also bounds the
/// memory a peer can force us to buffer, so it doubles as the read limit.
pub const MAX_SCALED_MESSAGE_SIZE: usize = 1 << 20;

/// Maximum message size an implementation must accept. Messages below this
/// threshold are never rejected.
pub const MAX_MESSAGE_SIZE: usize = 1 << 24;

/// The binary message size doubles while it is smaller than
/// 1/SCALING_FRACTION of the bytes sent so far.
pub const SCALING_FRACTION: i64 = 16;

/// Minimum interval between subsequent measurements.
pub const MIN_MEASURE_INTERVAL: Duration = Duration::from_millis(100);

/// Average interval between subsequent measurements.
pub const AVG_MEASURE_INTERVAL: Duration = Duration::from_millis(250);

/// Maximum interval between subsequent measurements.
pub const MAX_MEASURE_INTERVAL: Duration = Duration::from_millis(400);

/// Upper bound on the runtime of a single subtest, enforced server-side.
pub const MAX_RUNTIME: Duration = Duration::from_secs(15);

/// URL path selecting the download subtest.
pub const DOWNLOAD_PATH: &str = "/msak/ndtm/download";

/// URL path selecting the upload subtest.
pub const UPLOAD_PATH: &str = "/msak/ndtm/upload";

/// Required value of the Sec-WebSocket-Protocol header, both directions.
pub const SEC_WEBSOCKET_PROTOCOL: &str = "net.measurementlab.ndt.m";

/// Buffer capacity of the per-stream measurement channel. Producers that
/// publish non-blockingly drop samples once this fills up.
pub const MEASUREMENT_CHANNEL_CAPACITY: usize = 64;

/// The direction of a subtest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtestKind {
    Download,
    Upload,
}

impl SubtestKind {
    /// The URL path serving this subtest.
    pub fn path(&self) -> &'static str {
        match self {
            SubtestKind::Download => DOWNLOAD_PATH,
            SubtestKind::Upload => UPLOAD_PATH,
        }
    }
}

impl fmt::Display for SubtestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubtestKind::Download => write!(f, "download"),
            SubtestKind::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform lacks the requested capability. Always recoverable:
    /// callers omit the corresponding data instead of failing.
    #[error("operation not supported on this platform")]
    Unsupported,

    /// The peer violated the framing rules. Fatal to the stream.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The connection failed outside of a clean close. Fatal to the stream.
    #[error("transport error: {0}")]
    Transport(tungstenite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed measurement message: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Capacity(_) => Error::Protocol("message over read limit"),
            tungstenite::Error::Utf8 => Error::Protocol("invalid utf-8 in text message"),
            other => Error::Transport(other),
        }
    }
}

impl Error {
    /// Whether this error only says that the peer shut the pipe down, which
    /// terminates a stream successfully rather than failing it.
    pub fn is_clean_close(&self) -> bool {
        match self {
            Error::Transport(err) => is_expected_close(err),
            Error::Io(err) => is_expected_close_io(err),
            _ => false,
        }
    }
}

/// Close conditions treated as the normal end of a stream: the orderly close
/// variants, the going-away and abnormal-closure status codes, and the I/O
/// errors produced when the other side drops the TCP connection.
pub(crate) fn is_expected_close(err: &tungstenite::Error) -> bool {
    use tungstenite::error::ProtocolError;

    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Protocol(ProtocolError::SendAfterClosing) => true,
        tungstenite::Error::Io(io) => is_expected_close_io(io),
        _ => false,
    }
}

fn is_expected_close_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}

/// Whether a close frame received from the peer ends the stream cleanly.
pub(crate) fn is_expected_close_code(
    frame: Option<&tungstenite::protocol::CloseFrame<'_>>,
) -> bool {
    use tungstenite::protocol::frame::coding::CloseCode;
    match frame {
        None => true,
        Some(frame) => matches!(
            frame.code,
            CloseCode::Normal | CloseCode::Away | CloseCode::Abnormal
        ),
    }
}
