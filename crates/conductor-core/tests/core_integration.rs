#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Duration;
use conductor_core::*;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// 1. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let validation = ConductorError::Validation("bad spec".to_string());
    assert_eq!(validation.to_string(), "Validation error: bad spec");

    let not_found = ConductorError::NotFound("task 42".to_string());
    assert_eq!(not_found.to_string(), "Not found: task 42");

    let config = ConductorError::Config("missing key".to_string());
    assert_eq!(config.to_string(), "Config error: missing key");

    let lock = ConductorError::Lock("timed out".to_string());
    assert_eq!(lock.to_string(), "Lock error: timed out");
    assert!(lock.is_transient());

    let bad_json = serde_json::from_str::<serde_json::Value>("not json");
    let err: ConductorError = bad_json.unwrap_err().into();
    assert!(err.to_string().starts_with("JSON error:"));
    assert!(!err.is_transient());

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: ConductorError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
    assert!(err.is_transient());
}

// ---------------------------------------------------------------------------
// 2. Roster round trip through strings
// ---------------------------------------------------------------------------

#[test]
fn roster_is_closed() {
    assert_eq!(AgentType::ALL.len(), 6);
    for agent in AgentType::ALL {
        let parsed: AgentType = agent.to_string().parse().unwrap();
        assert_eq!(parsed, agent);
    }
    assert!("printer".parse::<AgentType>().is_err());
}

// ---------------------------------------------------------------------------
// 3. Clocks behind a shared handle
// ---------------------------------------------------------------------------

#[test]
fn manual_clock_behind_shared_handle() {
    let manual = ManualClock::starting_now();
    let shared: SharedClock = Arc::new(manual.clone());
    let before = shared.now();
    manual.advance(Duration::seconds(30));
    assert_eq!(shared.now() - before, Duration::seconds(30));
}

#[test]
fn system_clock_moves_forward() {
    let clock = system_clock();
    let a = clock.now();
    let b = clock.now();
    assert!(b >= a);
}
