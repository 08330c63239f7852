// Copyright 2026 BadCompany
// Licensed under the Apache License, Version 2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use mcp_catalog::engine_core::models::{Incoming, JsonRpcRequest, JsonRpcResponse};

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<JsonRpcRequest>(data);
    let _ = serde_json::from_slice::<JsonRpcResponse>(data);

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = Incoming::classify(value);
    }
});
