//! Fuzz target for clause file interpretation.

#![no_main]

use libfuzzer_sys::fuzz_target;

use clause_retriever::corpus::{dedupe_clauses, parse_clauses};

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    if let Ok(clauses) = parse_clauses(&value, "Clause") {
        let count = clauses.len();
        assert!(dedupe_clauses(clauses).len() <= count);
    }
});
