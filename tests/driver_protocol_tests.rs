//! Driver Protocol Tests
//!
//! Wire-level tests for the native protocol, including:
//! - Settings encoding against a mirror decoder
//! - Block encode/decode through compression frames
//! - Nested exception decoding

mod common;

use std::collections::HashMap;

use chwire::block::{read_block, write_data_payload};
use chwire::client::request::write_settings;
use chwire::protocol::{read_exception, Exception, Reader, Writer};
use chwire::{Block, ColumnData, Error, SettingValue, Settings};
use common::{read_settings, SettingKind};

fn kind_of(value: &SettingValue) -> SettingKind {
    match value {
        SettingValue::Text(_) => SettingKind::Text,
        SettingValue::Int(_) => SettingKind::Int,
        SettingValue::UInt(_) => SettingKind::UInt,
        SettingValue::Bool(_) => SettingKind::Bool,
    }
}

async fn settings_roundtrip(settings: &Settings) -> HashMap<String, SettingValue> {
    let kinds: HashMap<String, SettingKind> = settings
        .iter()
        .map(|(name, value)| (name.to_string(), kind_of(value)))
        .collect();

    let mut wr = Writer::new(false);
    write_settings(&mut wr, settings);

    let mut rd = Reader::new(wr.as_bytes());
    read_settings(&mut rd, |name| kinds[name]).await.into_iter().collect()
}

// ============================================================================
// Settings Tests
// ============================================================================

#[tokio::test]
async fn test_settings_roundtrip_ignores_insertion_order() {
    let pairs = vec![
        ("max_threads", SettingValue::UInt(16)),
        ("max_block_size", SettingValue::UInt(65_536)),
        ("priority", SettingValue::Int(-3)),
        ("readonly", SettingValue::Bool(true)),
        ("log_comment", SettingValue::Text("batch job".to_string())),
        ("use_uncompressed_cache", SettingValue::Bool(false)),
    ];

    let mut forward = Settings::new();
    for (name, value) in pairs.iter() {
        forward.set(*name, value.clone());
    }
    let mut backward = Settings::new();
    for (name, value) in pairs.iter().rev() {
        backward.set(*name, value.clone());
    }

    let decoded_forward = settings_roundtrip(&forward).await;
    let decoded_backward = settings_roundtrip(&backward).await;
    let expected: HashMap<String, SettingValue> = pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

    assert_eq!(decoded_forward, expected);
    assert_eq!(decoded_backward, expected);
}

#[tokio::test]
async fn test_empty_settings_is_just_the_sentinel() {
    let mut wr = Writer::new(false);
    write_settings(&mut wr, &Settings::new());
    assert_eq!(wr.as_bytes(), &[0]);
}

#[tokio::test]
async fn test_extreme_integer_settings() {
    let mut settings = Settings::new();
    settings.set("min", i64::MIN);
    settings.set("max", u64::MAX);

    let decoded = settings_roundtrip(&settings).await;
    assert_eq!(decoded["min"], SettingValue::Int(i64::MIN));
    assert_eq!(decoded["max"], SettingValue::UInt(u64::MAX));
}

// ============================================================================
// Block Tests
// ============================================================================

fn events_block() -> Block {
    let mut block = Block::new();
    block
        .push_column("id", "UInt32", ColumnData::UInt32(vec![1, 2, 3, 4]))
        .unwrap();
    block
        .push_column("delta", "Int16", ColumnData::Int16(vec![-1, 0, 1, i16::MAX]))
        .unwrap();
    block
        .push_column("score", "Float64", ColumnData::Float64(vec![0.5, 1.5, -2.25, 1e9]))
        .unwrap();
    block
        .push_column(
            "label",
            "String",
            ColumnData::String(vec!["a".into(), "".into(), "ünïcode".into(), "x".repeat(300)]),
        )
        .unwrap();
    block
        .push_column(
            "code",
            "FixedString(2)",
            ColumnData::FixedString {
                width: 2,
                values: vec![b"US".to_vec(), b"FR".to_vec(), b"DE".to_vec(), b"\0\0".to_vec()],
            },
        )
        .unwrap();
    block
        .push_column("day", "Date", ColumnData::Date(vec![19_000, 19_001, 0, u16::MAX]))
        .unwrap();
    block
        .push_column(
            "at",
            "DateTime('Europe/Paris')",
            ColumnData::DateTime(vec![0, 1_700_000_000, 1, u32::MAX]),
        )
        .unwrap();
    block
}

async fn block_roundtrip(block: &Block, compression: bool) -> Block {
    let mut wr = Writer::new(compression);
    write_data_payload(&mut wr, block);

    let mut rd = Reader::new(wr.as_bytes()).enable_compression(compression);
    let mut decoded = Block::new();
    read_block(&mut rd, &mut decoded).await.unwrap();
    decoded
}

#[tokio::test]
async fn test_block_roundtrip_preserves_layout() {
    let block = events_block();
    for compression in [false, true] {
        let decoded = block_roundtrip(&block, compression).await;
        assert_eq!(decoded.num_rows(), block.num_rows());
        assert_eq!(decoded.num_columns(), block.num_columns());

        let layout: Vec<(&str, &str)> = decoded
            .columns()
            .iter()
            .map(|c| (c.name(), c.type_name()))
            .collect();
        assert_eq!(
            layout,
            vec![
                ("id", "UInt32"),
                ("delta", "Int16"),
                ("score", "Float64"),
                ("label", "String"),
                ("code", "FixedString(2)"),
                ("day", "Date"),
                ("at", "DateTime('Europe/Paris')"),
            ]
        );
        assert_eq!(decoded, block);
    }
}

#[tokio::test]
async fn test_large_block_spans_several_frames() {
    let rows = 300_000u64;
    let mut block = Block::new();
    block
        .push_column("n", "UInt64", ColumnData::UInt64((0..rows).collect()))
        .unwrap();

    let mut wr = Writer::new(true);
    write_data_payload(&mut wr, &block);
    // 2.4 MB of values is cut into 1 MiB chunks.
    assert!(wr.len() > 25 * 3);

    let decoded = block_roundtrip(&block, true).await;
    assert_eq!(decoded.num_rows(), rows as usize);
    assert_eq!(
        decoded.column_by_name("n").and_then(|c| c.data().value(299_999)),
        Some(serde_json::json!(299_999))
    );
}

#[tokio::test]
async fn test_corrupted_frame_is_rejected() {
    let mut wr = Writer::new(true);
    write_data_payload(&mut wr, &events_block());
    let mut bytes = wr.as_bytes().to_vec();
    // Flip a payload byte past the table name and frame header.
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;

    let mut rd = Reader::new(&bytes[..]).enable_compression(true);
    let err = read_block(&mut rd, &mut Block::new()).await.unwrap_err();
    assert!(matches!(err, Error::Compression(_)));
}

// ============================================================================
// Exception Tests
// ============================================================================

#[tokio::test]
async fn test_exception_chain_depth() {
    for depth in [1usize, 2, 5, 64] {
        let mut exc = Exception::new(
            depth as i32,
            "DB::Exception",
            format!("DB::Exception: level {}", depth),
        );
        for level in (1..depth).rev() {
            exc = Exception::new(
                level as i32,
                "DB::Exception",
                format!("DB::Exception: level {}", level),
            )
            .with_nested(exc);
        }

        let mut wr = Writer::new(false);
        exc.write_to(&mut wr);
        let decoded = read_exception(&mut Reader::new(wr.as_bytes()), 64).await.unwrap();

        assert_eq!(decoded.depth(), depth);
        for (i, e) in decoded.chain().enumerate() {
            assert_eq!(e.code, i as i32 + 1);
            assert_eq!(e.message, format!("level {}", i + 1));
            assert!(!e.message.starts_with("DB::Exception"));
        }
    }
}

#[tokio::test]
async fn test_exception_deeper_than_limit_fails_closed() {
    let mut exc = Exception::new(0, "DB::Exception", "leaf");
    for level in 1..=65 {
        exc = Exception::new(level, "DB::Exception", "wrapper").with_nested(exc);
    }
    let mut wr = Writer::new(false);
    exc.write_to(&mut wr);

    let err = read_exception(&mut Reader::new(wr.as_bytes()), 64)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExceptionTooDeep(64)));
    assert!(err.is_bad_conn());
}
