use kubewhisper::error::ApiErrorType;
use kubewhisper::protocol::models::{ContentPart, Role};
use kubewhisper::{ClientEvent, Config, Item, ServerEvent, TurnDetectionConfig};
use serde_json::json;

#[test]
fn test_session_update_from_config() {
    let config = Config::new("k")
        .instructions("Be brief.")
        .turn_detection(TurnDetectionConfig::new(0.5, 200, 500).unwrap());
    let event = ClientEvent::session_update(config.session.to_update(Vec::new()));
    let value = serde_json::to_value(&event).unwrap();

    assert_eq!(
        value,
        json!({
            "type": "session.update",
            "session": {
                "modalities": ["text", "audio"],
                "instructions": "Be brief.",
                "voice": "alloy",
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.5,
                    "prefix_padding_ms": 200,
                    "silence_duration_ms": 500
                },
                "tools": []
            }
        })
    );
}

#[test]
fn test_text_only_session_drops_audio_modality() {
    let config = Config::new("k").text_only();
    let value = serde_json::to_value(config.session.to_update(Vec::new())).unwrap();
    assert_eq!(value["modalities"], json!(["text"]));
}

#[test]
fn test_append_and_commit_shapes() {
    let append = serde_json::to_value(ClientEvent::append_audio("AAAA".to_string())).unwrap();
    assert_eq!(append, json!({"type": "input_audio_buffer.append", "audio": "AAAA"}));

    let commit = serde_json::to_value(ClientEvent::commit_audio()).unwrap();
    assert_eq!(commit, json!({"type": "input_audio_buffer.commit"}));
}

#[test]
fn test_user_prompt_item() {
    let event = ClientEvent::create_item(Item::user_text("How many namespaces?"));
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": "How many namespaces?"}]
            }
        })
    );
}

#[test]
fn test_error_event_deserialization() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "error",
        "event_id": "evt_9",
        "error": {
            "type": "invalid_request_error",
            "code": "input_audio_buffer_commit_empty",
            "message": "Error committing input audio buffer: buffer too small.",
            "param": null,
            "event_id": null
        }
    }))
    .unwrap();

    match event {
        ServerEvent::Error { event_id, error } => {
            assert_eq!(event_id, "evt_9");
            assert_eq!(error.error_type, ApiErrorType::InvalidRequestError);
            assert_eq!(error.code.as_deref(), Some("input_audio_buffer_commit_empty"));
        }
        other => panic!("Wrong event type: {other:?}"),
    }
}

#[test]
fn test_function_call_item_added() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "response.output_item.added",
        "event_id": "evt_3",
        "response_id": "resp_1",
        "output_index": 0,
        "item": {
            "id": "item_1",
            "type": "function_call",
            "status": "in_progress",
            "name": "get_number_of_pods",
            "call_id": "call_abc",
            "arguments": ""
        }
    }))
    .unwrap();

    match event {
        ServerEvent::ResponseOutputItemAdded {
            item: Item::FunctionCall { name, call_id, .. },
            ..
        } => {
            assert_eq!(name, "get_number_of_pods");
            assert_eq!(call_id, "call_abc");
        }
        other => panic!("Wrong event type: {other:?}"),
    }
}

#[test]
fn test_response_done_with_output() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "response.done",
        "event_id": "evt_5",
        "response": {
            "id": "resp_1",
            "object": "realtime.response",
            "status": "completed",
            "output": [{
                "id": "item_2",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "audio", "transcript": "Task complete."}]
            }],
            "usage": {"total_tokens": 42}
        }
    }))
    .unwrap();

    let ServerEvent::ResponseDone { response, .. } = event else {
        panic!("Wrong event type");
    };
    assert_eq!(response.id, "resp_1");
    let output = response.output.unwrap();
    match &output[0] {
        Item::Message { role, content, .. } => {
            assert_eq!(*role, Role::Assistant);
            assert!(matches!(&content[0], ContentPart::Audio { transcript: Some(t), .. } if t == "Task complete."));
        }
        other => panic!("Wrong item: {other:?}"),
    }
}

#[test]
fn test_rate_limits_updated() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "rate_limits.updated",
        "event_id": "evt_7",
        "rate_limits": [
            {"name": "requests", "limit": 1000, "remaining": 999, "reset_seconds": 60.0},
            {"name": "tokens", "limit": 50000, "remaining": 49950, "reset_seconds": 0.5}
        ]
    }))
    .unwrap();

    match event {
        ServerEvent::RateLimitsUpdated { rate_limits, .. } => {
            assert_eq!(rate_limits.len(), 2);
            assert_eq!(rate_limits[1].name, "tokens");
            assert_eq!(rate_limits[1].remaining, 49950);
        }
        other => panic!("Wrong event type: {other:?}"),
    }
}

#[test]
fn test_unknown_event_is_preserved() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "event_id": "evt_11",
        "transcript": "how many pods"
    }))
    .unwrap();

    assert!(matches!(event, ServerEvent::Unknown(_)));
    assert_eq!(event.kind(), "conversation.item.input_audio_transcription.completed");
    assert_eq!(event.event_id(), Some("evt_11"));
}

#[test]
fn test_known_type_with_bad_payload_falls_back_to_unknown() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "response.text.delta",
        "delta": 17
    }))
    .unwrap();
    assert!(matches!(event, ServerEvent::Unknown(_)));
}
