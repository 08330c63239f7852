use bytes::BytesMut;
use mcp_catalog::catalog::descriptors::StaticDescriptors;
use mcp_catalog::catalog::repair::repair;
use mcp_catalog::catalog::routing::{display_name, validate_server_name, RoutingTable};
use mcp_catalog::engine_core::models::{RequestId, ToolDefinition};
use mcp_catalog::mcp::codec::{Frame, McpCodec};
use mcp_catalog::mcp::correlator::Correlator;
use mcp_catalog::CatalogError;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::codec::Decoder;

fn decode_chunked(input: &[u8], cuts: &[usize]) -> Vec<Frame> {
    let mut codec = McpCodec::new();
    let mut buf = BytesMut::new();
    let mut out = Vec::new();
    let mut start = 0;
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (input.len() + 1)).collect();
    points.sort_unstable();
    points.push(input.len());
    for end in points {
        if end < start {
            continue;
        }
        buf.extend_from_slice(&input[start..end]);
        start = end;
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
    }
    if let Some(frame) = codec.decode_eof(&mut buf).unwrap() {
        out.push(frame);
    }
    out
}

proptest! {
    #[test]
    fn test_resolve_completes_exactly_once(ids in prop::collection::hash_set("[a-z0-9]{1,12}", 1..16)) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let correlator = Correlator::new("prop");
            let mut pending = Vec::new();
            for id in &ids {
                pending.push(correlator.register(RequestId::new(id.clone())).unwrap());
            }
            for id in &ids {
                let rid = RequestId::new(id.clone());
                assert!(correlator.resolve(&rid, Ok(json!(id))));
                // Second resolution is a dropped no-op.
                assert!(!correlator.resolve(&rid, Ok(json!("late"))));
            }
            for p in pending {
                let expected = json!(p.id().as_str());
                let value = correlator
                    .await_with_timeout(p, Duration::from_secs(1), || CatalogError::Timeout {
                        server: "prop".into(),
                        operation: "test".into(),
                        timeout_ms: 1000,
                    })
                    .await
                    .unwrap();
                assert_eq!(value, expected);
            }
            assert_eq!(correlator.pending_count(), 0);
        });
    }

    #[test]
    fn test_framing_independent_of_chunking(
        values in prop::collection::vec(prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..4), 1..8),
        cuts in prop::collection::vec(any::<usize>(), 0..12)
    ) {
        let mut input = Vec::new();
        for v in &values {
            input.extend_from_slice(&serde_json::to_vec(v).unwrap());
            input.push(b'\n');
        }
        let whole = decode_chunked(&input, &[]);
        let chunked = decode_chunked(&input, &cuts);
        prop_assert_eq!(&whole, &chunked);
        let expected: Vec<Frame> = values
            .iter()
            .map(|v| Frame::Message(serde_json::to_value(v).unwrap()))
            .collect();
        prop_assert_eq!(whole, expected);
    }

    #[test]
    fn test_display_names_injective(
        pairs in prop::collection::hash_set(
            (
                "[a-z_][a-z0-9_]{0,6}".prop_filter("valid server name", |s| validate_server_name(s).is_ok()),
                "[a-z_][a-z0-9_]{0,6}",
            ),
            1..24,
        )
    ) {
        let mut seen = HashSet::new();
        for (server, tool) in &pairs {
            prop_assert!(seen.insert(display_name(server, tool)));
        }

        let mut table = RoutingTable::new();
        let mut collisions = 0;
        for (server, tool) in &pairs {
            collisions += table
                .insert_server(
                    server,
                    vec![ToolDefinition {
                        name: tool.clone(),
                        description: None,
                        input_schema: Value::Null,
                    }],
                )
                .len();
        }
        prop_assert_eq!(collisions, 0);
        for (server, tool) in &pairs {
            let record = table.resolve(&display_name(server, tool)).unwrap();
            prop_assert_eq!(&record.server, server);
            prop_assert_eq!(&record.name, tool);
        }
    }

    #[test]
    fn test_repair_never_panics_and_keeps_lines(input in "\\PC{0,200}") {
        let repaired = repair(&input);
        prop_assert_eq!(repaired.text.lines().count(), input.lines().count());
        let _ = StaticDescriptors::parse_json("prop", &input);
    }

    #[test]
    fn test_repair_is_identity_on_valid_json(
        map in prop::collection::btree_map("[a-z]{1,6}", "[ -~]{0,10}", 0..6)
    ) {
        let text = serde_json::to_string(&map).unwrap();
        let repaired = repair(&text);
        prop_assert_eq!(repaired.fixes, 0);
        prop_assert_eq!(repaired.text, text);
    }
}
