use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use tempfile::NamedTempFile;

#[test]
fn help_lists_every_public_command() {
    Command::cargo_bin("git2consul")
        .expect("Binary exists")
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("sync")
                .and(predicate::str::contains("resync"))
                .and(predicate::str::contains("operator")),
        );
}

#[test]
fn operator_help_hides_force_actions() {
    Command::cargo_bin("git2consul")
        .expect("Binary exists")
        .args(["operator", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("register")
                .and(predicate::str::contains("unlock"))
                .and(predicate::str::contains("force-lock").not())
                .and(predicate::str::contains("force-unlock").not()),
        );
}

#[test]
fn missing_config_file_exits_non_zero() {
    Command::cargo_bin("git2consul")
        .expect("Binary exists")
        .args(["resync", "--config", "/nonexistent/git2consul.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn invalid_git_settings_fail_before_any_network_call() {
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    write(
        config.path(),
        b"git:\n  url: \"\"\n  pull_dir: /nonexistent/git2consul/data\nconsul:\n  addr: 127.0.0.1:9\n",
    )
    .expect("Writing temp config failed");

    Command::cargo_bin("git2consul")
        .expect("Binary exists")
        .args(["operator", "--config"])
        .arg(config.path())
        .arg("register")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid git configuration"));
}

#[test]
fn register_against_unreachable_agent_exits_non_zero() {
    let pull_dir = tempfile::tempdir().expect("temp dir");
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    write(
        config.path(),
        format!(
            "git:\n  pull_dir: {}\nconsul:\n  addr: 127.0.0.1:9\n",
            pull_dir.path().display()
        ),
    )
    .expect("Writing temp config failed");

    Command::cargo_bin("git2consul")
        .expect("Binary exists")
        .env_remove("CONSUL_ADDR")
        .args(["operator", "--config"])
        .arg(config.path())
        .arg("register")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to register service git2consul"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::Context, Layer, Registry};
use tracing_subscriber::prelude::*; // needed for .with()

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let msg = format!("{:?}", event);
        self.events.lock().unwrap().push(msg);
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector { events: events.clone() };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use git2consul::cli::{run, Cli, Commands, LogFormat};

    // Provide minimum config for the Sync subcommand (using a dummy path).
    let cli = Cli {
        log_level: "info".into(),
        log_format: LogFormat::Text,
        command: Commands::Sync {
            config: std::path::PathBuf::from("dummy.yaml"),
            interval: None,
        },
    };

    let result = run(cli).await;
    assert!(result.is_err(), "dummy.yaml does not exist");

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
