//! CLI tests for the `autopilot` binary.
//!
//! Spawns the binary and checks exit codes and printed output.

use std::fs;
use std::process::Command;

use autopilot::core::patterns::PatternSet;
use autopilot::exit_codes;

#[test]
fn patterns_prints_the_builtin_set() {
    let output = Command::new(env!("CARGO_BIN_EXE_autopilot"))
        .arg("patterns")
        .output()
        .expect("autopilot patterns");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let printed: PatternSet =
        toml::from_str(&String::from_utf8_lossy(&output.stdout)).expect("parse printed toml");
    assert_eq!(printed, PatternSet::default());
}

#[test]
fn classify_reports_ready_after_quiet_period() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dump = temp.path().join("screen.bin");
    fs::write(&dump, b"\x1b[2J\x1b[H\xe2\x97\x8f done\r\n\r\n? for shortcuts\r\n").expect("write dump");

    let output = Command::new(env!("CARGO_BIN_EXE_autopilot"))
        .current_dir(temp.path())
        .args(["classify", "screen.bin", "--quiet-ms", "5000"])
        .output()
        .expect("autopilot classify");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["state"], "ready");
    assert_eq!(report["permission_match"], serde_json::Value::Null);
}

#[test]
fn classify_reports_busy_before_debounce() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dump = temp.path().join("screen.bin");
    fs::write(&dump, b"? for shortcuts\r\n").expect("write dump");

    let output = Command::new(env!("CARGO_BIN_EXE_autopilot"))
        .current_dir(temp.path())
        .args(["classify", "screen.bin"])
        .output()
        .expect("autopilot classify");

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["state"], "busy");
}

#[test]
fn run_without_tasks_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = Command::new(env!("CARGO_BIN_EXE_autopilot"))
        .current_dir(temp.path())
        .arg("run")
        .status()
        .expect("autopilot run");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("autopilot.toml"), "[session]\nprogram = \"\"\n").expect("write");

    let status = Command::new(env!("CARGO_BIN_EXE_autopilot"))
        .current_dir(temp.path())
        .args(["run", "--task", "hello"])
        .status()
        .expect("autopilot run");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn init_writes_a_loadable_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = Command::new(env!("CARGO_BIN_EXE_autopilot"))
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("autopilot init");

    assert_eq!(status.code(), Some(exit_codes::OK));
    let path = temp.path().join("autopilot.toml");
    autopilot::io::config::load_config(&path).expect("load written config");
}

#[cfg(unix)]
#[test]
fn run_drives_a_shell_through_the_task_file() {
    use autopilot::core::task::TaskStatus;
    use autopilot::io::config::{AutopilotConfig, write_config};
    use autopilot::io::store::load_tasks;

    let script = r#"printf '? for shortcuts\r\n'; while IFS= read -r line; do printf '* done: %s\r\n? for shortcuts\r\n' "$line"; done"#;
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = AutopilotConfig::default();
    config.session.program = "/bin/sh".to_string();
    config.session.args = vec!["-c".to_string(), script.to_string()];
    config.session.skip_permission_prompt = false;
    config.session.startup_timeout_ms = 10_000;
    config.session.response_timeout_ms = 10_000;
    config.session.poll_interval_ms = 20;
    config.session.debounce_ms = 200;
    config.session.stop_grace_ms = 500;
    config.submission.inter_chunk_delay_ms = 10;
    config.submission.settle_delay_ms = 10;
    config.dispatch.iteration_delay_ms = 10;
    write_config(&temp.path().join("autopilot.toml"), &config).expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_autopilot"))
        .current_dir(temp.path())
        .args(["run", "--tasks", "tasks.json", "--task", "one", "--task", "two"])
        .output()
        .expect("autopilot run");

    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("completed 2, failed 0"));
    let tasks = load_tasks(&temp.path().join("tasks.json")).expect("tasks");
    assert!(tasks.iter().all(|task| task.status == TaskStatus::Completed));
}

#[cfg(unix)]
#[test]
fn sigint_during_a_task_exits_interrupted() {
    use std::thread;
    use std::time::{Duration, Instant};

    use autopilot::core::task::TaskStatus;
    use autopilot::io::config::{AutopilotConfig, write_config};
    use autopilot::io::store::load_tasks;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use wait_timeout::ChildExt;

    // Reads tasks but never shows the prompt again.
    let script = r#"printf '? for shortcuts\r\n'; while IFS= read -r line; do :; done"#;
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = AutopilotConfig::default();
    config.session.program = "/bin/sh".to_string();
    config.session.args = vec!["-c".to_string(), script.to_string()];
    config.session.skip_permission_prompt = false;
    config.session.startup_timeout_ms = 10_000;
    config.session.response_timeout_ms = 60_000;
    config.session.poll_interval_ms = 20;
    config.session.debounce_ms = 200;
    config.session.stop_grace_ms = 500;
    config.submission.inter_chunk_delay_ms = 10;
    config.submission.settle_delay_ms = 10;
    write_config(&temp.path().join("autopilot.toml"), &config).expect("write config");

    let mut child = Command::new(env!("CARGO_BIN_EXE_autopilot"))
        .current_dir(temp.path())
        .args(["run", "--tasks", "tasks.json", "--task", "hang"])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("spawn autopilot run");

    let tasks_path = temp.path().join("tasks.json");
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let processing = load_tasks(&tasks_path)
            .map(|tasks| tasks.iter().any(|task| task.status == TaskStatus::Processing))
            .unwrap_or(false);
        if processing {
            break;
        }
        assert!(Instant::now() < deadline, "task never reached processing");
        thread::sleep(Duration::from_millis(50));
    }
    // Let the submission finish before interrupting.
    thread::sleep(Duration::from_millis(300));

    let pid = Pid::from_raw(i32::try_from(child.id()).expect("pid"));
    kill(pid, Signal::SIGINT).expect("send SIGINT");
    let status = match child.wait_timeout(Duration::from_secs(15)).expect("wait") {
        Some(status) => status,
        None => {
            let _ = child.kill();
            panic!("autopilot did not exit after SIGINT");
        }
    };

    assert_eq!(status.code(), Some(exit_codes::INTERRUPTED));
    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        use std::io::Read;
        out.read_to_string(&mut stdout).expect("read stdout");
    }
    assert!(stdout.contains("completed 0, failed 0"), "stdout: {stdout}");
    let tasks = load_tasks(&tasks_path).expect("tasks");
    assert_eq!(tasks[0].status, TaskStatus::Processing);
}
