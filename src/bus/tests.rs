use super::*;
use crate::config::ConfigError;

#[test]
fn test_transport_message_json_sets_content_type() {
    let message = TransportMessage::json("id-1", "DeviceDescription", "d1", b"{}".to_vec());

    assert_eq!(message.message_id, "id-1");
    assert_eq!(message.label, "DeviceDescription");
    assert_eq!(message.session_id, "d1");
    assert_eq!(message.content_type, JSON_CONTENT_TYPE);
    assert_eq!(message.body, b"{}");
}

#[test]
fn test_broker_error_maps_to_transport() {
    let err: BusError = BrokerError::Connection("refused".to_string()).into();
    assert!(matches!(err, BusError::Transport(ref msg) if msg.contains("refused")));
}

#[test]
fn test_config_error_maps_to_config() {
    let err: BusError = ConfigError::MissingSection("event_bus").into();
    assert!(matches!(err, BusError::Config(_)));
}

#[test]
fn test_handler_execution_keeps_source() {
    use std::error::Error;

    let err = BusError::HandlerExecution {
        event_type: "DeviceDescription".to_string(),
        message_id: "m-1".to_string(),
        handler: "DeviceDescriptionEventHandler".to_string(),
        source: "database unavailable".into(),
    };

    let text = err.to_string();
    assert!(text.contains("DeviceDescription"));
    assert!(text.contains("m-1"));
    assert_eq!(
        err.source().map(|s| s.to_string()),
        Some("database unavailable".to_string())
    );
}

#[test]
fn test_duplicate_handler_message() {
    let err = BusError::DuplicateHandler {
        event_type: "DeviceDescription".to_string(),
        handler: "DeviceDescriptionEventHandler".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "Handler 'DeviceDescriptionEventHandler' already registered for 'DeviceDescription'"
    );
}
