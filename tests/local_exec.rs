//! Integration tests driving the local backend through the trait objects

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use runcmd::{CommandHandle, ExecError, LocalRunner, Runner};

/// Write an executable shell script and return its path
fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    file.write_all(body.as_bytes()).unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[tokio::test]
async fn known_lines_come_back_in_order() {
    let runner: Box<dyn Runner> = Box::new(LocalRunner::new());

    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        "lines.sh",
        "i=0\nwhile [ $i -lt 100 ]; do echo line$i; i=$((i+1)); done\n",
    );

    let lines = runner
        .command(script.to_str().unwrap())
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(lines.len(), 100);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line, &format!("line{i}"));
    }
}

#[tokio::test]
async fn heavy_output_on_both_streams_does_not_deadlock() {
    let runner = LocalRunner::new();

    // Well past the 64 KiB pipe capacity on each stream
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        "noisy.sh",
        "i=0\nwhile [ $i -lt 20000 ]; do echo out$i; echo err$i >&2; i=$((i+1)); done\n",
    );

    let lines = runner
        .command(script.to_str().unwrap())
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(lines.len(), 20000);
    assert_eq!(lines[0], "out0");
    assert_eq!(lines[19999], "out19999");
    assert!(lines.iter().all(|l| l.starts_with("out")));
}

#[tokio::test]
async fn failed_command_discards_captured_output() {
    let runner = LocalRunner::new();

    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "fail.sh", "echo partial output\nexit 3\n");

    let err = runner
        .command(script.to_str().unwrap())
        .await
        .unwrap()
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::NonZeroExit { status: 3 }));
}

#[tokio::test]
async fn repeated_runs_release_resources() {
    let runner = LocalRunner::new();

    // Exercised repeatedly; a leaked pipe or unreaped child would make this
    // run out of descriptors or hang
    for i in 0..100 {
        let mut cmd = runner.command("true").await.unwrap();
        cmd.run().await.unwrap();

        let mut cmd = runner.command("false").await.unwrap();
        let err = cmd.run().await.unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { status: 1 }), "iteration {i}");
    }
}

#[tokio::test]
async fn host_reports_loopback() {
    let runner: Box<dyn Runner> = Box::new(LocalRunner::new());
    assert_eq!(runner.host(), "127.0.0.1");
}

#[tokio::test]
async fn command_line_survives_execution_outcome() {
    let runner = LocalRunner::new();

    let mut ok = runner.command("true").await.unwrap();
    ok.run().await.unwrap();
    assert_eq!(ok.command_line(), "true");

    let mut failed = runner.command("false").await.unwrap();
    failed.run().await.unwrap_err();
    assert_eq!(failed.command_line(), "false");
}
