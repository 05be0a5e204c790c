use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::audio::{AudioLevels, SourceKind};

/// Transcript lifecycle stage.
///
/// `Live` is an interim hypothesis that later results may rewrite,
/// `Done` is a completed segment, `Final` closes an utterance. Duplicate
/// suppression across stages is the consumer's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Live,
    Done,
    Final,
}

/// One transcription result, the only artifact crossing into the UI
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    pub confidence: Option<f32>,
    pub speaker: Option<String>,
    pub source: SourceKind,
    pub timestamp: DateTime<Utc>,
}

/// Unified upward event stream delivered to the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SourceConnected(SourceKind),
    SourceDisconnected(SourceKind),
    TransportError { source: SourceKind, message: String },
    Transcript(TranscriptEvent),
    Levels { source: SourceKind, levels: AudioLevels },
}
