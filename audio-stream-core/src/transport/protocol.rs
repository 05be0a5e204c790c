//! Wire protocol for the ingest channel.
//!
//! Text frames are JSON tagged by `type`; audio travels as raw binary
//! PCM16 frames. Outbound control frames use the ASR provider's
//! capitalized names (`KeepAlive`, `Finalize`, `CloseStream`).

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::audio::SourceKind;
use crate::models::error::CaptureError;
use crate::models::events::{TranscriptEvent, TranscriptKind};
use crate::traits::transport::ControlKind;

/// Opening frame declaring the stream parameters. The far end must
/// acknowledge it before any PCM flows. `connection_id` is fresh per
/// attempt so the server can tell a reconnect from a stale socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
    pub device_id: String,
    pub connection_id: String,
}

impl Handshake {
    pub fn new(
        source: SourceKind,
        sample_rate: u32,
        channels: u16,
        language: &str,
        device_id: &str,
        connection_id: &str,
    ) -> Self {
        Self {
            kind: "handshake".into(),
            source: source.wire_name().into(),
            sample_rate,
            channels,
            language: language.into(),
            device_id: device_id.into(),
            connection_id: connection_id.into(),
        }
    }
}

/// Serialize one control signal as its JSON text frame.
pub fn control_frame(kind: ControlKind) -> String {
    let name = match kind {
        ControlKind::KeepAlive => "KeepAlive",
        ControlKind::Finalize => "Finalize",
        ControlKind::CloseStream => "CloseStream",
    };
    format!("{{\"type\":\"{}\"}}", name)
}

/// Everything the server can send back.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "handshake-ack")]
    HandshakeAck {
        #[serde(default)]
        ok: bool,
    },
    #[serde(rename = "transcript.partial")]
    TranscriptPartial(TranscriptPayload),
    #[serde(rename = "transcript.final")]
    TranscriptFinal(TranscriptPayload),
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error_code: String,
        #[serde(default)]
        error_message: String,
    },
    #[serde(rename = "status")]
    Status {
        #[serde(default)]
        status: String,
    },
}

/// Transcript fields shared by partial and final results.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Utterance-closing marker on a final result.
    #[serde(default)]
    pub speech_final: bool,
}

/// Decode an inbound text frame.
///
/// Malformed payloads are an error value, never a panic; the transport
/// reports them as discrete error events and keeps running.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, CaptureError> {
    serde_json::from_str(text).map_err(|e| CaptureError::Protocol(e.to_string()))
}

/// Map a decoded transcript payload onto the event crossing the UI
/// boundary. `fallback_source` applies when the server omits the source.
pub fn into_transcript_event(
    payload: TranscriptPayload,
    final_result: bool,
    fallback_source: SourceKind,
) -> TranscriptEvent {
    let kind = match (final_result, payload.speech_final) {
        (false, _) => TranscriptKind::Live,
        (true, false) => TranscriptKind::Done,
        (true, true) => TranscriptKind::Final,
    };
    let source = match payload.source.as_deref() {
        Some("mic") => SourceKind::Mic,
        Some("sys") | Some("system") => SourceKind::System,
        _ => fallback_source,
    };
    TranscriptEvent {
        kind,
        text: payload.text,
        confidence: payload.confidence,
        speaker: payload.speaker,
        source,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_serializes_wire_shape() {
        let handshake = Handshake::new(SourceKind::System, 16000, 1, "en", "dev-42", "conn-7");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&handshake).unwrap()).unwrap();
        assert_eq!(json["type"], "handshake");
        assert_eq!(json["source"], "sys");
        assert_eq!(json["sample_rate"], 16000);
        assert_eq!(json["channels"], 1);
        assert_eq!(json["language"], "en");
        assert_eq!(json["device_id"], "dev-42");
        assert_eq!(json["connection_id"], "conn-7");
    }

    #[test]
    fn control_frames_use_provider_names() {
        assert_eq!(control_frame(ControlKind::KeepAlive), r#"{"type":"KeepAlive"}"#);
        assert_eq!(control_frame(ControlKind::Finalize), r#"{"type":"Finalize"}"#);
        assert_eq!(
            control_frame(ControlKind::CloseStream),
            r#"{"type":"CloseStream"}"#
        );
    }

    #[test]
    fn decodes_handshake_ack() {
        let frame = decode_inbound(r#"{"type":"handshake-ack","ok":true}"#).unwrap();
        assert!(matches!(frame, InboundFrame::HandshakeAck { ok: true }));
    }

    #[test]
    fn decodes_partial_transcript_as_live() {
        let frame = decode_inbound(
            r#"{"type":"transcript.partial","text":"hello wor","confidence":0.61,"source":"mic"}"#,
        )
        .unwrap();
        let InboundFrame::TranscriptPartial(payload) = frame else {
            panic!("expected partial");
        };
        let event = into_transcript_event(payload, false, SourceKind::System);
        assert_eq!(event.kind, TranscriptKind::Live);
        assert_eq!(event.text, "hello wor");
        assert_eq!(event.source, SourceKind::Mic);
    }

    #[test]
    fn speech_final_promotes_done_to_final() {
        let done = TranscriptPayload {
            text: "hello world".into(),
            confidence: Some(0.93),
            speaker: Some("Speaker 0".into()),
            source: None,
            speech_final: false,
        };
        assert_eq!(
            into_transcript_event(done, true, SourceKind::Mic).kind,
            TranscriptKind::Done
        );

        let closing = TranscriptPayload {
            text: "hello world".into(),
            confidence: Some(0.93),
            speaker: None,
            source: None,
            speech_final: true,
        };
        let event = into_transcript_event(closing, true, SourceKind::Mic);
        assert_eq!(event.kind, TranscriptKind::Final);
        assert_eq!(event.source, SourceKind::Mic); // fallback applied
    }

    #[test]
    fn malformed_payloads_are_errors_not_panics() {
        assert!(decode_inbound("not json").is_err());
        assert!(decode_inbound(r#"{"type":"unknown-frame"}"#).is_err());
        assert!(decode_inbound(r#"{"no_type":1}"#).is_err());
    }
}
