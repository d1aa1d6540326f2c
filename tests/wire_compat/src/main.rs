fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use arbor_protocol::{
        Block, Frame, FrameId, Message, MessageType, PrepareRequest, RemoteStatus,
        SendFrameRequest, TransferState,
    };
    use arbor_transfer::{TransferConfig, TransferProgress};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// Peers may write `262144` where serde writes `262144.0`.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it, and compares the JSON
    /// values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let data = read_fixture(name);
        let fixture: serde_json::Value = serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"));
        let parsed: T = serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Envelope ---

    #[test]
    fn fixture_send_frame_message() {
        let msg = roundtrip_test::<Message>("send_frame_message.json");
        assert_eq!(msg.msg_type, MessageType::SendFrame);
        assert_eq!(msg.msg_type.reply_type(), Some(MessageType::FrameAck));

        let req: SendFrameRequest = msg.parse_payload().unwrap().unwrap();
        assert_eq!(req.request_id.as_deref(), Some("req-7"));
        assert_eq!(req.frame.id, FrameId(0));
        assert!(req.frame.is_last);
        assert_eq!(req.frame.payload, b"hello");
        assert_eq!(req.frame.blocks.len(), 5);
        assert_eq!(
            req.frame.blocks[3],
            Block::FileEnd {
                checksum: "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
                    .into(),
                last_modified_ms: 1_700_000_000_000,
            }
        );
        assert!(req.frame.check_bounds(1024, 8).is_ok());
    }

    #[test]
    fn fixture_error_reply() {
        let msg = roundtrip_test::<Message>("error_reply.json");
        assert!(msg.is_error());
        let err = msg.error.unwrap();
        assert_eq!(err.code, 400);
        assert!(err.message.contains("checksum mismatch"));
        assert!(msg.payload.is_none());
    }

    // --- Payloads ---

    #[test]
    fn fixture_prepare_request() {
        let req = roundtrip_test::<PrepareRequest>("prepare_request.json");
        let files: Vec<_> = req.manifest.iter().map(|e| e.file.as_str()).collect();
        assert_eq!(files, ["docs/a.txt", "top.bin"]);
    }

    #[test]
    fn fixture_remote_status() {
        let status = roundtrip_test::<RemoteStatus>("remote_status.json");
        assert_eq!(status.state, Some(TransferState::Started));
        assert_eq!(status.last_received_frame_id, Some(FrameId(12)));
    }

    #[test]
    fn fixture_transfer_progress() {
        let progress = roundtrip_test::<TransferProgress>("transfer_progress.json");
        assert_eq!(progress.state, TransferState::Transferred);
        assert_eq!(progress.percentage(), 100.0);
        assert_eq!(progress.elapsed().num_seconds(), 4);
    }

    // --- Shapes every peer relies on ---

    #[test]
    fn block_tags_are_snake_case() {
        let blocks = vec![
            Block::DirBegin { name: "d".into() },
            Block::FileBegin {
                name: "f".into(),
                size: 3,
            },
            Block::FileData {
                offset: 0,
                length: 3,
            },
            Block::FileEnd {
                checksum: "00".into(),
                last_modified_ms: 0,
            },
            Block::DirEnd,
        ];
        let json = serde_json::to_value(&blocks).unwrap();
        let kinds: Vec<_> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            ["dir_begin", "file_begin", "file_data", "file_end", "dir_end"]
        );
        assert_eq!(json[3]["lastModifiedMs"], 0);
    }

    #[test]
    fn frame_payload_is_base64() {
        let frame = Frame {
            id: FrameId(3),
            blocks: vec![Block::FileData {
                offset: 10,
                length: 2,
            }],
            payload: vec![0xff, 0x00],
            is_last: false,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["payload"], "/wA=");
        assert_eq!(json["id"], 3);
        assert_eq!(json["isLast"], false);
    }

    #[test]
    fn missing_is_last_defaults_to_false() {
        let frame: Frame =
            serde_json::from_str(r#"{"id":1,"blocks":[{"kind":"dir_end"}],"payload":""}"#)
                .unwrap();
        assert!(!frame.is_last);
    }

    #[test]
    fn message_types_use_wire_names() {
        let cases = [
            (MessageType::SendFrame, "send_frame"),
            (MessageType::Prepare, "prepare"),
            (MessageType::Commit, "commit"),
            (MessageType::GetStatus, "get_status"),
            (MessageType::CancelTransfer, "cancel_transfer"),
            (MessageType::FrameAck, "frame_ack"),
            (MessageType::Status, "status"),
            (MessageType::Error, "error"),
        ];
        for (msg_type, name) in cases {
            assert_eq!(serde_json::to_value(msg_type).unwrap(), name);
        }
    }

    // --- Configuration ---

    #[test]
    fn fixture_transfer_config() {
        let config = TransferConfig::from_toml_str(&read_fixture("transfer_config.toml")).unwrap();
        assert_eq!(config.max_frame_size, 65_536);
        assert_eq!(config.max_frame_blocks, 128);
        assert_eq!(config.recovery_attempts, 5);
        // Omitted keys keep their defaults.
        assert_eq!(config.max_workers, TransferConfig::default().max_workers);
        assert_eq!(
            config.progress_interval_ms,
            TransferConfig::default().progress_interval_ms
        );
    }
}
