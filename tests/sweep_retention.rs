// Retention behavior observed through the public API: delivered message
// files are bounded in lifetime by the cross-process sweeper.
use std::time::{Duration, Instant};

use filepipe::api::{Pipe, PipeConfig};

fn message_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|entry| {
                    entry.path().extension().and_then(|e| e.to_str()) == Some("fp")
                })
                .count()
        })
        .unwrap_or(0)
}

fn wait_until(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn delivered_messages_expire_after_the_retention_window() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = PipeConfig::new()
        .with_root(temp.path())
        .with_poll_interval(Duration::from_millis(5))
        .with_retention(Duration::from_millis(200));

    let pipe: Pipe<String> = Pipe::new("chat", "app", config).expect("pipe");
    pipe.send("ephemeral".to_string()).expect("send");

    let dir = temp.path().join("app-chat");
    assert_eq!(message_count(&dir), 1);

    // the sweep winner waits one retention window before its pass
    assert!(wait_until(Duration::from_secs(5), || message_count(&dir) == 0));
    // the channel directory itself survives
    assert!(dir.is_dir());
}

#[test]
fn fresh_messages_survive_a_sweep_of_old_ones() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = PipeConfig::new()
        .with_root(temp.path())
        .with_poll_interval(Duration::from_millis(5))
        .with_retention(Duration::from_secs(1));

    let pipe: Pipe<String> = Pipe::new("chat", "app", config).expect("pipe");
    pipe.send("old".to_string()).expect("send");
    let dir = temp.path().join("app-chat");

    // land a second message deep inside the sweeper's wait, so the first
    // pass sees one expired file and one fresh one
    std::thread::sleep(Duration::from_millis(700));
    pipe.send("fresh".to_string()).expect("send");
    assert_eq!(message_count(&dir), 2);

    assert!(wait_until(Duration::from_secs(5), || message_count(&dir) == 1));
    // the survivor expires on a later cycle
    assert!(wait_until(Duration::from_secs(5), || message_count(&dir) == 0));
}
