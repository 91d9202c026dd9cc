//! Integration tests against a real SSH server.
//!
//! All tests are ignored by default; point them at a throwaway server with
//! `RUNCMD_TEST_HOST`, `RUNCMD_TEST_USER` and `RUNCMD_TEST_PASSWORD` and run
//! with `--ignored`.

use runcmd::{CommandHandle, ExecError, Runner, SshRunner};

async fn connect() -> SshRunner {
    let host = std::env::var("RUNCMD_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let user = std::env::var("RUNCMD_TEST_USER").unwrap_or_else(|_| "test".to_string());
    let password = std::env::var("RUNCMD_TEST_PASSWORD").unwrap_or_else(|_| "test".to_string());

    SshRunner::connect_with_password(user, host, 22, password)
        .await
        .expect("test SSH server unavailable")
}

#[tokio::test]
#[ignore = "requires SSH server"]
async fn remote_run_collects_lines() {
    let runner = connect().await;

    let lines = runner
        .command("printf 'one\\ntwo\\nthree\\n'")
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(lines, vec!["one", "two", "three"]);
    runner.close_connection().await.unwrap();
}

#[tokio::test]
#[ignore = "requires SSH server"]
async fn remote_shell_interprets_command_line() {
    let runner = connect().await;

    // Unlike the local backend, quoting works here: the remote shell parses
    // the command line
    let lines = runner
        .command("echo 'a b'")
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(lines, vec!["a b"]);
    runner.close_connection().await.unwrap();
}

#[tokio::test]
#[ignore = "requires SSH server"]
async fn remote_nonzero_exit() {
    let runner = connect().await;

    let err = runner
        .command("exit 7")
        .await
        .unwrap()
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::NonZeroExit { status: 7 }));
    runner.close_connection().await.unwrap();
}

#[tokio::test]
#[ignore = "requires SSH server"]
async fn remote_setenv_last_duplicate_wins() {
    let runner = connect().await;

    // Requires `AcceptEnv FOO` in the server's sshd_config
    let mut cmd = runner.command("echo $FOO").await.unwrap();
    cmd.setenv(&["FOO=first".to_string(), "FOO=second".to_string()])
        .await
        .unwrap();

    let lines = cmd.run().await.unwrap();
    assert_eq!(lines, vec!["second"]);
    runner.close_connection().await.unwrap();
}

#[tokio::test]
#[ignore = "requires SSH server"]
async fn closed_runner_rejects_new_commands() {
    let runner = connect().await;
    let mut stale = runner.command("echo hello").await.unwrap();

    runner.close_connection().await.unwrap();
    // Second close is a no-op
    runner.close_connection().await.unwrap();
    assert!(!runner.is_connected());

    let err = runner.command("echo hello").await.unwrap_err();
    assert!(matches!(err, ExecError::NotConnected));

    // A handle created before the close fails at start
    assert!(stale.start().await.is_err());
}
