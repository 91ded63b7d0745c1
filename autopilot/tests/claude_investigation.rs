//! Manual checks against an installed `claude` binary.
//!
//! Run with `cargo test --test claude_investigation -- --ignored --nocapture`.
//! They need a logged-in CLI and network access, so they never run in CI.

use std::sync::Arc;

use autopilot::core::types::{SessionId, SessionState};
use autopilot::io::config::SessionConfig;
use autopilot::io::pty::PtySpawner;
use autopilot::session::SessionController;

fn claude_session() -> SessionController {
    let config = SessionConfig {
        startup_timeout_ms: 60_000,
        response_timeout_ms: 120_000,
        ..SessionConfig::default()
    };
    SessionController::new(SessionId::from("claude"), config, Arc::new(PtySpawner))
}

#[test]
#[ignore = "requires an installed and logged-in claude CLI"]
fn startup_reaches_ready() {
    let mut session = claude_session();
    session.start(true).expect("start");
    assert_eq!(session.state(), SessionState::Ready);
    println!("--- startup screen ---\n{}", session.screen_text());
    session.stop();
}

#[test]
#[ignore = "requires an installed and logged-in claude CLI"]
fn short_prompt_round_trip() {
    let mut session = claude_session();
    session.start(true).expect("start");
    let response = session
        .send("Reply with the single word PONG and nothing else.")
        .expect("send");
    println!("--- response tail ---\n{response}");
    assert!(response.contains("PONG"));
    session.stop();
}
