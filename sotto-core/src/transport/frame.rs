//! Binary wire framing for the streaming recognizer.
//!
//! Every frame is a 4-byte header, a 4-byte big-endian payload length and
//! the payload itself (gzipped). Header layout:
//!
//! ```text
//! byte 0: (protocol_version << 4) | header_size
//! byte 1: (message_type << 4)     | flags
//! byte 2: (serialization << 4)    | compression
//! byte 3: reserved
//! ```
//!
//! Audio frames set flags bit 1 on the final frame. Server responses set
//! flags bit 0 when a 4-byte sequence number precedes the payload length.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;

use crate::config::TransportConfig;
use crate::error::{Result, SottoError};

pub const PROTOCOL_VERSION: u8 = 0b0001;
pub const HEADER_SIZE: u8 = 0b0001;

pub const MSG_FULL_CLIENT_REQUEST: u8 = 0b0001;
pub const MSG_AUDIO_ONLY: u8 = 0b0010;
pub const MSG_FULL_SERVER_RESPONSE: u8 = 0b1001;
pub const MSG_ERROR: u8 = 0b1111;

pub const SERIAL_NONE: u8 = 0b0000;
pub const SERIAL_JSON: u8 = 0b0001;

pub const COMPRESS_NONE: u8 = 0b0000;
pub const COMPRESS_GZIP: u8 = 0b0001;

/// Audio-frame flag: this is the last frame of the session.
pub const FLAG_LAST_AUDIO: u8 = 0b0010;
/// Response flag: a 4-byte sequence number precedes the payload length.
const FLAG_HAS_SEQUENCE: u8 = 0b0001;

/// A transcript fragment decoded from a server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsrResult {
    pub text: String,
    /// Final fragments are appended to the committed transcript; non-final
    /// ones replace the pending partial.
    pub is_final: bool,
}

/// Decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Result(AsrResult),
    /// A response without recognition payload (handshake acknowledgement).
    Ack,
    Error { code: u32, message: String },
}

fn header(msg_type: u8, flags: u8, serial: u8, compress: u8) -> [u8; 4] {
    [
        (PROTOCOL_VERSION << 4) | HEADER_SIZE,
        (msg_type << 4) | flags,
        (serial << 4) | compress,
        0x00,
    ]
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

fn gunzip(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut out)
        .map_err(|e| SottoError::Protocol(format!("gzip payload: {e}")))?;
    Ok(out)
}

fn with_length(header: [u8; 4], payload: Vec<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Session handshake: declares the audio format and recognizer options.
/// Must be the first frame after connect.
pub fn handshake_frame(cfg: &TransportConfig, sample_rate: u32) -> Result<Vec<u8>> {
    let payload = serde_json::json!({
        "user": { "uid": "sotto" },
        "audio": {
            "format": "pcm",
            "rate": sample_rate,
            "bits": 16,
            "channel": 1,
        },
        "request": {
            "model_name": cfg.model_name,
            "enable_itn": true,
            "enable_punc": true,
            "enable_ddc": false,
            "show_utterances": true,
            "result_type": "full",
        },
    });
    let compressed = gzip(payload.to_string().as_bytes())?;
    Ok(with_length(
        header(MSG_FULL_CLIENT_REQUEST, 0, SERIAL_JSON, COMPRESS_GZIP),
        compressed,
    ))
}

/// One PCM frame. An empty `pcm` with `is_last` set is the flush sentinel.
pub fn audio_frame(pcm: &[u8], is_last: bool) -> Result<Vec<u8>> {
    let flags = if is_last { FLAG_LAST_AUDIO } else { 0 };
    let compressed = gzip(pcm)?;
    Ok(with_length(
        header(MSG_AUDIO_ONLY, flags, SERIAL_NONE, COMPRESS_GZIP),
        compressed,
    ))
}

#[derive(Deserialize)]
struct ServerPayload {
    result: Option<RecognitionResult>,
}

#[derive(Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    text: String,
    #[serde(default)]
    utterances: Vec<Utterance>,
}

#[derive(Deserialize)]
struct Utterance {
    #[serde(default)]
    definite: bool,
}

/// Decode one server frame.
///
/// # Errors
/// `SottoError::Protocol` on truncated or malformed frames; `SottoError::Json`
/// when the payload is not the expected JSON shape. Callers surface either as
/// a transport fault — a bad frame never mutates state partially.
pub fn parse_server_frame(data: &[u8]) -> Result<ServerFrame> {
    if data.len() < 4 {
        return Err(SottoError::Protocol(format!(
            "frame shorter than header: {} bytes",
            data.len()
        )));
    }

    let msg_type = data[1] >> 4;
    let flags = data[1] & 0x0F;
    let compress = data[2] & 0x0F;

    if msg_type == MSG_ERROR {
        if data.len() < 12 {
            return Err(SottoError::Protocol("truncated error frame".into()));
        }
        let code = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let len = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if data.len() < 12 + len {
            return Err(SottoError::Protocol("truncated error message".into()));
        }
        let message = String::from_utf8_lossy(&data[12..12 + len]).into_owned();
        return Ok(ServerFrame::Error { code, message });
    }

    if msg_type != MSG_FULL_SERVER_RESPONSE {
        return Err(SottoError::Protocol(format!(
            "unexpected message type {msg_type:#x}"
        )));
    }

    let offset = 4 + if flags & FLAG_HAS_SEQUENCE != 0 { 4 } else { 0 };
    if data.len() < offset + 4 {
        return Err(SottoError::Protocol("missing payload length".into()));
    }
    let payload_len = u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]) as usize;
    let start = offset + 4;
    if data.len() < start + payload_len {
        return Err(SottoError::Protocol(format!(
            "payload truncated: want {payload_len}, have {}",
            data.len() - start
        )));
    }

    let mut payload = data[start..start + payload_len].to_vec();
    if compress == COMPRESS_GZIP {
        payload = gunzip(&payload)?;
    }

    let parsed: ServerPayload = serde_json::from_slice(&payload)?;
    match parsed.result {
        Some(result) => {
            let is_final = result.utterances.last().map(|u| u.definite).unwrap_or(false);
            Ok(ServerFrame::Result(AsrResult {
                text: result.text,
                is_final,
            }))
        }
        None => Ok(ServerFrame::Ack),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_frame(json: &str, with_sequence: bool, compressed: bool) -> Vec<u8> {
        let payload = if compressed {
            gzip(json.as_bytes()).unwrap()
        } else {
            json.as_bytes().to_vec()
        };
        let flags = if with_sequence { FLAG_HAS_SEQUENCE } else { 0 };
        let compress = if compressed { COMPRESS_GZIP } else { COMPRESS_NONE };
        let mut frame = Vec::new();
        frame.extend_from_slice(&header(MSG_FULL_SERVER_RESPONSE, flags, SERIAL_JSON, compress));
        if with_sequence {
            frame.extend_from_slice(&7u32.to_be_bytes());
        }
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn header_packs_version_type_and_compression() {
        let h = header(MSG_AUDIO_ONLY, FLAG_LAST_AUDIO, SERIAL_NONE, COMPRESS_GZIP);
        assert_eq!(h[0], 0x11);
        assert_eq!(h[1], 0x22);
        assert_eq!(h[2], 0x01);
        assert_eq!(h[3], 0x00);
    }

    #[test]
    fn handshake_declares_audio_format() {
        let cfg = TransportConfig::default();
        let frame = handshake_frame(&cfg, 16_000).unwrap();
        assert_eq!(frame[0], (PROTOCOL_VERSION << 4) | HEADER_SIZE);
        assert_eq!(frame[1] >> 4, MSG_FULL_CLIENT_REQUEST);
        assert_eq!(frame[2], (SERIAL_JSON << 4) | COMPRESS_GZIP);

        let len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(frame.len(), 8 + len);

        let payload = gunzip(&frame[8..]).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["audio"]["rate"], 16_000);
        assert_eq!(json["audio"]["bits"], 16);
        assert_eq!(json["audio"]["channel"], 1);
        assert_eq!(json["request"]["show_utterances"], true);
    }

    #[test]
    fn last_audio_frame_sets_flag_bit() {
        let normal = audio_frame(&[0u8; 8], false).unwrap();
        let last = audio_frame(&[], true).unwrap();
        assert_eq!(normal[1] & 0x0F, 0);
        assert_eq!(last[1] & 0x0F, FLAG_LAST_AUDIO);
        assert_eq!(last[1] >> 4, MSG_AUDIO_ONLY);
    }

    #[test]
    fn parses_partial_and_final_results() {
        let partial = response_frame(r#"{"result":{"text":"你","utterances":[{"definite":false}]}}"#, false, true);
        match parse_server_frame(&partial).unwrap() {
            ServerFrame::Result(r) => {
                assert_eq!(r.text, "你");
                assert!(!r.is_final);
            }
            other => panic!("expected result, got {other:?}"),
        }

        let fin = response_frame(r#"{"result":{"text":"你好。","utterances":[{"definite":true}]}}"#, false, true);
        match parse_server_frame(&fin).unwrap() {
            ServerFrame::Result(r) => {
                assert_eq!(r.text, "你好。");
                assert!(r.is_final);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn missing_utterances_means_not_final() {
        let frame = response_frame(r#"{"result":{"text":"hey"}}"#, false, false);
        match parse_server_frame(&frame).unwrap() {
            ServerFrame::Result(r) => assert!(!r.is_final),
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn sequence_flag_shifts_payload_offset() {
        let frame = response_frame(r#"{"result":{"text":"seq","utterances":[{"definite":true}]}}"#, true, true);
        match parse_server_frame(&frame).unwrap() {
            ServerFrame::Result(r) => {
                assert_eq!(r.text, "seq");
                assert!(r.is_final);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn response_without_result_is_an_ack() {
        let frame = response_frame(r#"{"code":0}"#, false, true);
        assert_eq!(parse_server_frame(&frame).unwrap(), ServerFrame::Ack);
    }

    #[test]
    fn decodes_error_frames() {
        let message = b"quota exceeded";
        let mut data = Vec::new();
        data.extend_from_slice(&header(MSG_ERROR, 0, SERIAL_NONE, COMPRESS_NONE));
        data.extend_from_slice(&45_000_000u32.to_be_bytes());
        data.extend_from_slice(&(message.len() as u32).to_be_bytes());
        data.extend_from_slice(message);

        match parse_server_frame(&data).unwrap() {
            ServerFrame::Error { code, message } => {
                assert_eq!(code, 45_000_000);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_frames_are_protocol_errors() {
        assert!(matches!(
            parse_server_frame(&[0x11]),
            Err(SottoError::Protocol(_))
        ));

        let mut short = response_frame(r#"{"result":{"text":"x"}}"#, false, true);
        short.truncate(10);
        assert!(matches!(
            parse_server_frame(&short),
            Err(SottoError::Protocol(_))
        ));
    }
}
