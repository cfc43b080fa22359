//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

fn isolated_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

#[test]
fn cli_without_arguments_prints_help() {
    let mut cmd = cargo_bin_cmd!("olvm-builder");
    cmd.assert().failure().stderr(contains("Usage"));
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("olvm-builder");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(contains("build"))
        .stdout(contains("validate"));
}

#[test]
fn validate_names_missing_environment_variables() {
    let home = isolated_dir();
    let mut cmd = cargo_bin_cmd!("olvm-builder");
    cmd.env_clear()
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .current_dir(home.path())
        .arg("validate");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("OLVM_URL"))
        .stderr(contains("OLVM_PASSWORD"));
}

#[test]
fn validate_summarises_a_valid_configuration() {
    let home = isolated_dir();
    let mut cmd = cargo_bin_cmd!("olvm-builder");
    cmd.env_clear()
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .env("OLVM_URL", "https://engine.example.com/ovirt-engine/api")
        .env("OLVM_USERNAME", "admin@internal")
        .env("OLVM_PASSWORD", "secret")
        .env("OLVM_SOURCE_TEMPLATE_NAME", "ol9-base")
        .env("OLVM_DESTINATION_TEMPLATE_NAME", "golden")
        .env("OLVM_COMMUNICATOR", "none")
        .current_dir(home.path())
        .arg("validate");

    cmd.assert().success().stdout(contains(
        "Configuration is valid: template 'golden' from template 'ol9-base' in cluster 'Default'",
    ));
}
