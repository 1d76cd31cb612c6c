//! Measurement observers.
//!
//! The coordinator and the server pipeline report stream lifecycle events
//! through an [`Emitter`] passed by reference, so embedders can plug their
//! own sink. Implementations are called concurrently from different streams
//! and must not assume any serialization.

use crate::model::{Measurement, Origin};
use crate::proto::{Error, SubtestKind};

pub trait Emitter: Send + Sync {
    fn on_start(&self, kind: SubtestKind, stream_id: usize);
    fn on_measurement(&self, kind: SubtestKind, stream_id: usize, m: &Measurement);
    fn on_error(&self, kind: SubtestKind, err: &Error);
    fn on_complete(&self, kind: SubtestKind, stream_id: usize);
}

/// Logs stream events and, for receiver-origin samples, the application
/// goodput in Mb/s.
#[derive(Debug, Default)]
pub struct LogEmitter;

impl Emitter for LogEmitter {
    fn on_start(&self, kind: SubtestKind, stream_id: usize) {
        tracing::info!(%kind, stream_id, "starting stream");
    }

    fn on_measurement(&self, kind: SubtestKind, stream_id: usize, m: &Measurement) {
        if m.origin != Origin::Receiver || m.app_info.elapsed_time == 0 {
            return;
        }
        // NumBytes over microseconds times eight is megabits per second.
        let throughput =
            m.app_info.num_bytes as f64 / m.app_info.elapsed_time as f64 * 8.0;
        tracing::info!(%kind, stream_id, throughput_mbps = throughput, "measurement");
    }

    fn on_error(&self, kind: SubtestKind, err: &Error) {
        tracing::error!(%kind, error = %err, "stream error");
    }

    fn on_complete(&self, kind: SubtestKind, stream_id: usize) {
        tracing::info!(%kind, stream_id, "stream complete");
    }
}

/// Discards every event. Useful for embedders and tests that only care about
/// the returned results.
#[derive(Debug, Default)]
pub struct NullEmitter;

impl Emitter for NullEmitter {
    fn on_start(&self, _kind: SubtestKind, _stream_id: usize) {}
    fn on_measurement(&self, _kind: SubtestKind, _stream_id: usize, _m: &Measurement) {}
    fn on_error(&self, _kind: SubtestKind, _err: &Error) {}
    fn on_complete(&self, _kind: SubtestKind, _stream_id: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppInfo;

    #[test]
    fn emitters_are_object_safe() {
        let emitters: Vec<Box<dyn Emitter>> = vec![Box::new(LogEmitter), Box::new(NullEmitter)];
        let m = Measurement {
            app_info: AppInfo {
                num_bytes: 1_000_000,
                elapsed_time: 1_000_000,
            },
            origin: Origin::Receiver,
            ..Default::default()
        };
        for emitter in &emitters {
            emitter.on_start(SubtestKind::Download, 0);
            emitter.on_measurement(SubtestKind::Download, 0, &m);
            emitter.on_complete(SubtestKind::Download, 0);
        }
    }
}
