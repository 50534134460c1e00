use chrono::{TimeZone, Utc};
use domain::PayloadValue;
use envelope::{
    DataSetMessage, NetworkMessage, VariantEncoding, encode, format_timestamp,
};

fn sample_timestamp() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
        .single()
        .expect("timestamp")
}

fn keys(value: &serde_json::Value) -> Vec<String> {
    value
        .as_object()
        .expect("object")
        .keys()
        .cloned()
        .collect()
}

#[test]
fn envelope_keeps_fixed_field_order() {
    let text = encode(
        7,
        "Festo",
        "12345",
        sample_timestamp(),
        vec![("Energy".to_string(), PayloadValue::F64(19.5))],
        VariantEncoding::Plain,
    )
    .expect("encode");

    let parsed: serde_json::Value = serde_json::from_str(&text).expect("valid json");
    assert_eq!(
        keys(&parsed),
        vec!["MessageId", "MessageType", "PublisherId", "Messages"]
    );
    assert_eq!(parsed["MessageId"], "7");
    assert_eq!(parsed["MessageType"], "ua-data");
    assert_eq!(parsed["PublisherId"], "Festo");

    let messages = parsed["Messages"].as_array().expect("array");
    assert_eq!(messages.len(), 1);
    assert_eq!(
        keys(&messages[0]),
        vec!["DataSetWriterId", "Timestamp", "Payload"]
    );
    assert_eq!(messages[0]["DataSetWriterId"], "12345");
    assert_eq!(messages[0]["Timestamp"], "2024-03-09 07:05:01Z");
    assert_eq!(messages[0]["Payload"]["Energy"], 19.5);
}

#[test]
fn envelope_text_is_exact() {
    let text = encode(
        0,
        "Festo",
        "12345",
        sample_timestamp(),
        vec![("Energy".to_string(), PayloadValue::F64(12.5))],
        VariantEncoding::Reversible,
    )
    .expect("encode");
    assert_eq!(
        text,
        concat!(
            r#"{"MessageId":"0","MessageType":"ua-data","PublisherId":"Festo","#,
            r#""Messages":[{"DataSetWriterId":"12345","Timestamp":"2024-03-09 07:05:01Z","#,
            r#""Payload":{"Energy":{"Type":11,"Body":12.5}}}]}"#
        )
    );
}

#[test]
fn envelope_carries_multiple_datasets_and_fields_in_order() {
    let message = NetworkMessage {
        message_id: "42".to_string(),
        publisher_id: "line-1".to_string(),
        messages: vec![
            DataSetMessage {
                writer_id: "meter-a".to_string(),
                timestamp: sample_timestamp(),
                payload: vec![
                    ("Voltage".to_string(), PayloadValue::F64(230.1)),
                    ("Status".to_string(), PayloadValue::String("ok \"1\"".to_string())),
                    ("Online".to_string(), PayloadValue::Bool(true)),
                ],
            },
            DataSetMessage {
                writer_id: "meter-b".to_string(),
                timestamp: sample_timestamp(),
                payload: vec![(
                    "Phase".to_string(),
                    PayloadValue::Object(vec![
                        ("L1".to_string(), PayloadValue::I64(1)),
                        ("L2".to_string(), PayloadValue::I64(2)),
                    ]),
                )],
            },
        ],
    };

    let text = message.encode(VariantEncoding::Plain).expect("encode");
    let parsed: serde_json::Value = serde_json::from_str(&text).expect("valid json");
    let messages = parsed["Messages"].as_array().expect("array");
    assert_eq!(messages.len(), 2);
    assert_eq!(
        keys(&messages[0]["Payload"]),
        vec!["Voltage", "Status", "Online"]
    );
    assert_eq!(messages[0]["Payload"]["Status"], "ok \"1\"");
    assert_eq!(messages[1]["DataSetWriterId"], "meter-b");
    assert_eq!(keys(&messages[1]["Payload"]["Phase"]), vec!["L1", "L2"]);
}

#[test]
fn reversible_structured_payload_nests_type_and_body() {
    let text = encode(
        1,
        "p",
        "w",
        sample_timestamp(),
        vec![(
            "Phase".to_string(),
            PayloadValue::Object(vec![("L1".to_string(), PayloadValue::F64(1.5))]),
        )],
        VariantEncoding::Reversible,
    )
    .expect("encode");
    let parsed: serde_json::Value = serde_json::from_str(&text).expect("valid json");
    let phase = &parsed["Messages"][0]["Payload"]["Phase"];
    assert_eq!(phase["Type"], 22);
    assert_eq!(phase["Body"]["L1"]["Type"], 11);
    assert_eq!(phase["Body"]["L1"]["Body"], 1.5);
}

#[test]
fn empty_dataset_list_still_closes_every_scope() {
    let message = NetworkMessage {
        message_id: "1".to_string(),
        publisher_id: "p".to_string(),
        messages: Vec::new(),
    };
    let text = message.encode(VariantEncoding::Plain).expect("encode");
    assert_eq!(
        text,
        r#"{"MessageId":"1","MessageType":"ua-data","PublisherId":"p","Messages":[]}"#
    );
}

#[test]
fn timestamp_format_is_sortable_utc() {
    assert_eq!(format_timestamp(&sample_timestamp()), "2024-03-09 07:05:01Z");
}
