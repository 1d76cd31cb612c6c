//! Measurement data model.
//!
//! These structures are serialized as JSON both on the wire (text frames
//! exchanged mid-test) and on disk (archival records). Field names are fixed
//! explicitly so they stay wire-compatible on every platform, including the
//! ones that can never populate the kernel sections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto::SubtestKind;

/// Which side of the stream produced a sample. The producer sets it once;
/// it is never rewritten downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The traffic originator.
    Sender,
    /// The traffic sink.
    Receiver,
}

impl Default for Origin {
    fn default() -> Self {
        Origin::Sender
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Sender => write!(f, "sender"),
            Origin::Receiver => write!(f, "receiver"),
        }
    }
}

/// An application-level byte counter sample. `ElapsedTime` is microseconds
/// since the stream started; both fields are monotonically non-decreasing
/// within a stream and origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(rename = "NumBytes")]
    pub num_bytes: i64,
    #[serde(rename = "ElapsedTime")]
    pub elapsed_time: i64,
}

/// Identity of the TCP flow a sample belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "UUID", default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(rename = "Client")]
    pub client: String,
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "CC", default)]
    pub cc: String,
}

/// Snapshot of the kernel's `struct tcp_info` for one socket.
///
/// The layout mirrors uapi/linux/tcp.h through `tcpi_snd_wnd` so the struct
/// can be handed directly to `getsockopt(TCP_INFO)`; `elapsed_time` sits past
/// the kernel region and is filled in by the sampler. Kernels older than the
/// full layout write a prefix and leave the rest zeroed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct TCPInfo {
    #[serde(rename = "State")]
    pub state: u8,
    #[serde(rename = "CAState")]
    pub ca_state: u8,
    #[serde(rename = "Retransmits")]
    pub retransmits: u8,
    #[serde(rename = "Probes")]
    pub probes: u8,
    #[serde(rename = "Backoff")]
    pub backoff: u8,
    #[serde(rename = "Options")]
    pub options: u8,
    /// snd_wscale:4, rcv_wscale:4
    #[serde(rename = "WScale")]
    pub wscale: u8,
    /// delivery_rate_app_limited:1, fastopen_client_fail:2
    #[serde(rename = "AppLimited")]
    pub app_limited: u8,

    #[serde(rename = "RTO")]
    pub rto: u32,
    #[serde(rename = "ATO")]
    pub ato: u32,
    #[serde(rename = "SndMSS")]
    pub snd_mss: u32,
    #[serde(rename = "RcvMSS")]
    pub rcv_mss: u32,

    #[serde(rename = "Unacked")]
    pub unacked: u32,
    #[serde(rename = "Sacked")]
    pub sacked: u32,
    #[serde(rename = "Lost")]
    pub lost: u32,
    #[serde(rename = "Retrans")]
    pub retrans: u32,
    #[serde(rename = "Fackets")]
    pub fackets: u32,

    #[serde(rename = "LastDataSent")]
    pub last_data_sent: u32,
    #[serde(rename = "LastAckSent")]
    pub last_ack_sent: u32,
    #[serde(rename = "LastDataRecv")]
    pub last_data_recv: u32,
    #[serde(rename = "LastAckRecv")]
    pub last_ack_recv: u32,

    #[serde(rename = "PMTU")]
    pub pmtu: u32,
    #[serde(rename = "RcvSsThresh")]
    pub rcv_ssthresh: u32,
    #[serde(rename = "RTT")]
    pub rtt: u32,
    #[serde(rename = "RTTVar")]
    pub rttvar: u32,
    #[serde(rename = "SndSsThresh")]
    pub snd_ssthresh: u32,
    #[serde(rename = "SndCwnd")]
    pub snd_cwnd: u32,
    #[serde(rename = "AdvMSS")]
    pub advmss: u32,
    #[serde(rename = "Reordering")]
    pub reordering: u32,

    #[serde(rename = "RcvRTT")]
    pub rcv_rtt: u32,
    #[serde(rename = "RcvSpace")]
    pub rcv_space: u32,

    #[serde(rename = "TotalRetrans")]
    pub total_retrans: u32,

    #[serde(rename = "PacingRate")]
    pub pacing_rate: i64,
    #[serde(rename = "MaxPacingRate")]
    pub max_pacing_rate: i64,
    #[serde(rename = "BytesAcked")]
    pub bytes_acked: i64,
    #[serde(rename = "BytesReceived")]
    pub bytes_received: i64,
    #[serde(rename = "SegsOut")]
    pub segs_out: i32,
    #[serde(rename = "SegsIn")]
    pub segs_in: i32,

    #[serde(rename = "NotsentBytes")]
    pub notsent_bytes: u32,
    #[serde(rename = "MinRTT")]
    pub min_rtt: u32,
    #[serde(rename = "DataSegsIn")]
    pub data_segs_in: u32,
    #[serde(rename = "DataSegsOut")]
    pub data_segs_out: u32,

    #[serde(rename = "DeliveryRate")]
    pub delivery_rate: i64,

    #[serde(rename = "BusyTime")]
    pub busy_time: i64,
    #[serde(rename = "RWndLimited")]
    pub rwnd_limited: i64,
    #[serde(rename = "SndBufLimited")]
    pub sndbuf_limited: i64,

    #[serde(rename = "Delivered")]
    pub delivered: u32,
    #[serde(rename = "DeliveredCE")]
    pub delivered_ce: u32,

    #[serde(rename = "BytesSent")]
    pub bytes_sent: i64,
    #[serde(rename = "BytesRetrans")]
    pub bytes_retrans: i64,
    #[serde(rename = "DSackDups")]
    pub dsack_dups: u32,
    #[serde(rename = "ReordSeen")]
    pub reord_seen: u32,

    #[serde(rename = "RcvOooPack")]
    pub rcv_ooopack: u32,
    #[serde(rename = "SndWnd")]
    pub snd_wnd: u32,

    /// Microseconds since stream start at sampling time. Not part of the
    /// kernel layout; must stay the last field.
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time: i64,
}

/// BBR telemetry for one socket, read from `TCP_CC_INFO`. Units are the
/// kernel's: `bw` in bytes per second, `min_rtt` in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBRInfo {
    #[serde(rename = "BW")]
    pub bw: i64,
    #[serde(rename = "MinRTT")]
    pub min_rtt: u32,
    #[serde(rename = "PacingGain")]
    pub pacing_gain: u32,
    #[serde(rename = "CwndGain")]
    pub cwnd_gain: u32,
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time: i64,
}

/// One sample produced on one side of one stream. Exchanged in-band as a
/// text frame and accumulated into the archival record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "AppInfo")]
    pub app_info: AppInfo,
    #[serde(
        rename = "ConnectionInfo",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_info: Option<ConnectionInfo>,
    #[serde(rename = "BBRInfo", default, skip_serializing_if = "Option::is_none")]
    pub bbr_info: Option<BBRInfo>,
    #[serde(rename = "TCPInfo", default, skip_serializing_if = "Option::is_none")]
    pub tcp_info: Option<TCPInfo>,
    #[serde(rename = "Origin")]
    pub origin: Origin,
}

/// Archival record for one stream, written as one JSON file named after the
/// flow UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResult {
    #[serde(rename = "GitShortCommit")]
    pub git_short_commit: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "MeasurementID")]
    pub measurement_id: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "SubType")]
    pub sub_type: SubtestKind,
    #[serde(rename = "CongestionControl")]
    pub congestion_control: String,
    #[serde(rename = "StartTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "EndTime")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "ServerMeasurements")]
    pub server_measurements: Vec<Measurement>,
    #[serde(rename = "ClientMeasurements")]
    pub client_measurements: Vec<Measurement>,
}

impl StreamResult {
    /// A record with identity fields filled in and empty measurement slices;
    /// `end_time` starts equal to `start_time` until the stream finishes.
    pub fn new(measurement_id: &str, sub_type: SubtestKind) -> Self {
        let now = Utc::now();
        StreamResult {
            git_short_commit: crate::GIT_SHORT_COMMIT.to_owned(),
            version: crate::VERSION.to_owned(),
            measurement_id: measurement_id.to_owned(),
            uuid: String::new(),
            sub_type,
            congestion_control: String::new(),
            start_time: now,
            end_time: now,
            server_measurements: Vec::new(),
            client_measurements: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_measurement() -> Measurement {
        Measurement {
            app_info: AppInfo {
                num_bytes: 1 << 20,
                elapsed_time: 250_000,
            },
            connection_info: Some(ConnectionInfo {
                uuid: "mstream-1-0000000000000001".into(),
                client: "127.0.0.1:50000".into(),
                server: "127.0.0.1:8080".into(),
                cc: "bbr".into(),
            }),
            bbr_info: None,
            tcp_info: None,
            origin: Origin::Sender,
        }
    }

    #[test]
    fn measurement_wire_field_names() {
        let value = serde_json::to_value(sample_measurement()).expect("serialize");
        assert_eq!(value["AppInfo"]["NumBytes"], 1 << 20);
        assert_eq!(value["AppInfo"]["ElapsedTime"], 250_000);
        assert_eq!(value["ConnectionInfo"]["CC"], "bbr");
        assert_eq!(value["Origin"], "sender");
        // Optional sections absent from the sample must be absent on the wire.
        assert!(value.get("TCPInfo").is_none());
        assert!(value.get("BBRInfo").is_none());
    }

    #[test]
    fn measurement_round_trip() {
        let m = sample_measurement();
        let json = serde_json::to_string(&m).expect("serialize");
        let back: Measurement = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(m, back);
    }

    #[test]
    fn tcp_info_section_round_trips_with_kernel_names() {
        let tcp = TCPInfo {
            rtt: 1200,
            snd_cwnd: 10,
            bytes_acked: 4096,
            elapsed_time: 99,
            ..Default::default()
        };
        let value = serde_json::to_value(tcp).expect("serialize");
        assert_eq!(value["RTT"], 1200);
        assert_eq!(value["SndCwnd"], 10);
        assert_eq!(value["BytesAcked"], 4096);
        assert_eq!(value["ElapsedTime"], 99);
        let back: TCPInfo = serde_json::from_value(value).expect("deserialize");
        assert_eq!(tcp, back);
    }

    #[test]
    fn peer_origin_survives_decoding() {
        let m: Measurement = serde_json::from_str(
            r#"{"AppInfo":{"NumBytes":10,"ElapsedTime":20},"Origin":"receiver"}"#,
        )
        .expect("deserialize");
        assert_eq!(m.origin, Origin::Receiver);
        assert!(m.connection_info.is_none());
    }

    #[test]
    fn result_json_shape() {
        let result = StreamResult::new("mid-1", SubtestKind::Download);
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["MeasurementID"], "mid-1");
        assert_eq!(value["SubType"], "download");
        assert!(value["ServerMeasurements"].as_array().expect("array").is_empty());
        assert!(value["ClientMeasurements"].as_array().expect("array").is_empty());
    }
}
