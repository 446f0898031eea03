#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

pub mod audio;
pub mod config;
pub mod error;
pub mod latency;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;

pub use audio::{CaptureBuffer, CaptureDevice, CaptureState, PlaybackSink};
pub use config::{Config, ConnectionConfig, SessionSettings, TurnDetectionConfig};
pub use error::{CloseCause, Error, Result};
pub use latency::LatencyLog;
pub use protocol::client_events::ClientEvent;
pub use protocol::models::{
    AudioFormat, ContentPart, Item, Modality, Response, SessionUpdate, Tool, TurnDetection, Voice,
};
pub use protocol::server_events::ServerEvent;
pub use session::{Dispatcher, Orchestrator, ShutdownHandle};
pub use tools::{ToolCall, ToolRegistry, ToolResult};
pub use transport::{ConnectionState, Connector, Transport, WsConnector};

pub(crate) const TRACE_LOG_MAX_BYTES: usize = 1024;
const MAX_INPUT_AUDIO_CHUNK_BYTES: usize = 15 * 1024 * 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

/// Reject outgoing events the server would refuse anyway.
#[allow(clippy::result_large_err)]
pub(crate) fn validate_client_event(event: &ClientEvent) -> Result<()> {
    match event {
        ClientEvent::InputAudioBufferAppend { audio, .. } => {
            let size = estimate_base64_decoded_len(audio)?;
            if size > MAX_INPUT_AUDIO_CHUNK_BYTES {
                return Err(Error::InvalidClientEvent(format!(
                    "input_audio_buffer.append exceeds 15MB ({size} bytes)",
                )));
            }
        }
        ClientEvent::SessionUpdate { session, .. } => {
            if let Some(TurnDetection::ServerVad { threshold: Some(threshold), .. }) = &session.turn_detection {
                if !(0.0..=1.0).contains(threshold) {
                    return Err(Error::InvalidClientEvent(format!(
                        "session.update turn_detection.threshold out of range ({threshold})"
                    )));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn estimate_base64_decoded_len(s: &str) -> Result<usize> {
    let bytes = s.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidClientEvent(
            "input_audio_buffer.append invalid base64 length".to_string(),
        ));
    }

    let mut padding = 0;
    let mut seen_padding = false;
    for &b in bytes {
        if b == b'=' {
            seen_padding = true;
            padding += 1;
            continue;
        }
        if seen_padding {
            return Err(Error::InvalidClientEvent(
                "input_audio_buffer.append invalid base64 padding".to_string(),
            ));
        }
        let is_valid = matches!(b,
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/'
        );
        if !is_valid {
            return Err(Error::InvalidClientEvent(
                "input_audio_buffer.append invalid base64 character".to_string(),
            ));
        }
    }

    if padding > 2 {
        return Err(Error::InvalidClientEvent(
            "input_audio_buffer.append invalid base64 padding length".to_string(),
        ));
    }

    Ok(bytes.len() / 4 * 3 - padding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = safe_truncate(&s, 5);
        assert!(out.starts_with("éé"));
        assert!(out.contains(TRACE_TRUNCATE_SUFFIX));
        assert_eq!(safe_truncate("short", 1024), "short");
    }

    #[test]
    fn base64_length_estimate() {
        assert_eq!(estimate_base64_decoded_len("").unwrap(), 0);
        assert_eq!(estimate_base64_decoded_len("AAA=").unwrap(), 2);
        assert_eq!(estimate_base64_decoded_len("AAAA").unwrap(), 3);
        assert!(estimate_base64_decoded_len("AAA").is_err());
        assert!(estimate_base64_decoded_len("A=AA").is_err());
        assert!(estimate_base64_decoded_len("AA*A").is_err());
    }

    #[test]
    fn oversized_append_is_rejected() {
        let audio = "A".repeat((MAX_INPUT_AUDIO_CHUNK_BYTES / 3 + 4) * 4);
        let err = validate_client_event(&ClientEvent::append_audio(audio)).unwrap_err();
        assert!(matches!(err, Error::InvalidClientEvent(_)));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let update = SessionUpdate {
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: Some(1.2),
                prefix_padding_ms: None,
                silence_duration_ms: None,
                create_response: None,
            }),
            ..SessionUpdate::default()
        };
        assert!(validate_client_event(&ClientEvent::session_update(update)).is_err());
        assert!(validate_client_event(&ClientEvent::session_update(SessionUpdate::default())).is_ok());
    }
}
