// Copyright 2026 BadCompany
// Licensed under the Apache License, Version 2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use mcp_catalog::catalog::descriptors::StaticDescriptors;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Any outcome is fine as long as nothing panics.
        let _ = StaticDescriptors::parse_json("fuzz", text);
    }
});
