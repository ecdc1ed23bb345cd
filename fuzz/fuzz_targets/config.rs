//! Fuzz target for config.toml parsing and validation.
//!
//! Malformed TOML, wrong types, and out-of-range values must all surface as
//! `ConfigError`, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

use clause_retriever::config::RetrievalConfig;

fuzz_target!(|content: &str| {
    if let Ok(config) = RetrievalConfig::from_toml(content) {
        // Accepted configs yield a usable deadline and pool size.
        let _ = config.task_timeout();
        assert!(config.worker_count() >= 1);
    }
});
