use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;

use crate::core::WeightReading;

/// `W`, optional spaces, signed decimal, optional spaces, unit. The unit
/// stops before a `T`/`S` segment marker that is followed by a number.
static LABELED_WEIGHT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"W *([+-]?\d+(?:\.\d+)?) *([A-Za-z]+?)(?:[TS] *[+-]?\d|[^A-Za-z]|$)")
        .expect("labelled weight pattern")
});

/// Any number followed by a unit
static BARE_WEIGHT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([+-]?\d+(?:\.\d+)?) *([A-Za-z]+?)(?:[TS] *[+-]?\d|[^A-Za-z]|$)")
        .expect("bare weight pattern")
});

/// Fixed commands understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Switch the device into continuous weight output
    StartStreaming,
    /// Stop continuous output; also used as the handshake probe
    StopStreaming,
}

impl Command {
    /// Exact bytes put on the wire, markers and CR LF included
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Command::StartStreaming => super::START_STREAMING,
            Command::StopStreaming => super::STOP_STREAMING,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::StartStreaming => "start_streaming",
            Command::StopStreaming => "stop_streaming",
        }
    }
}

/// Classification of a frame by its type character
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Type `r`: a weight report
    Weight { weight: String, unit: String },
    /// Type `e`: a status reply, payload is the whole frame
    Status,
    /// Anything else; the tail of the frame is kept as the value
    Other { value: String },
}

/// One delimited protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Text between the markers
    pub raw: String,
    /// Characters `[0, 2)`
    pub address: String,
    /// Characters `[2, 4)`
    pub command: String,
    pub kind: FrameKind,
}

impl Frame {
    /// Classifies frame text; anything shorter than 4 characters is dropped
    pub fn parse(raw: String) -> Option<Frame> {
        let len = raw.chars().count();
        if len < super::MIN_FRAME_LEN {
            return None;
        }

        let address: String = raw.chars().take(2).collect();
        let command: String = raw.chars().skip(2).take(2).collect();
        let frame_type = raw.chars().nth(4);

        let kind = match frame_type {
            Some(super::TYPE_WEIGHT) => {
                let (weight, unit) = extract_weight(&raw);
                FrameKind::Weight { weight, unit }
            }
            Some(super::TYPE_STATUS) => FrameKind::Status,
            _ => {
                let value = if len > 4 {
                    raw.chars().skip(4).collect()
                } else {
                    raw.clone()
                };
                FrameKind::Other { value }
            }
        };

        Some(Frame {
            raw,
            address,
            command,
            kind,
        })
    }

    /// Converts a weight-bearing frame into a reading; status frames yield `None`
    pub fn into_reading(self, scale_id: &str) -> Option<WeightReading> {
        let (weight, unit) = match self.kind {
            FrameKind::Weight { weight, unit } => (weight, unit),
            FrameKind::Other { value } => (value, String::new()),
            FrameKind::Status => return None,
        };

        Some(WeightReading {
            scale_id: scale_id.to_string(),
            raw: self.raw,
            address: self.address,
            command: self.command,
            weight,
            unit,
            captured_at: SystemTime::now(),
        })
    }

    pub fn is_status(&self) -> bool {
        matches!(self.kind, FrameKind::Status)
    }
}

/// Pulls weight and unit out of a weight frame.
///
/// The `W` labelled segment wins; tare (`T`) and sequence (`S`) segments
/// after it are ignored. Without a label the first number/unit pair after
/// the type character is used. No match yields two empty strings.
pub fn extract_weight(raw: &str) -> (String, String) {
    if let Some(caps) = LABELED_WEIGHT.captures(raw) {
        return (caps[1].to_string(), caps[2].to_string());
    }

    let tail = raw
        .char_indices()
        .nth(5)
        .map(|(offset, _)| &raw[offset..])
        .unwrap_or("");

    match BARE_WEIGHT.captures(tail) {
        Some(caps) => (caps[1].to_string(), caps[2].to_string()),
        None => (String::new(), String::new()),
    }
}
