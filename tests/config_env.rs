//! Configuration loading from files and the environment.

use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use olvm_builder::config::{CommunicatorKind, SourceSpec, TemplateSelector};
use olvm_builder::test_support::EnvGuard;
use olvm_builder::{BuildConfig, ConfigError};
use tempfile::TempDir;

const MANAGED_VARS: [&str; 8] = [
    "OLVM_URL",
    "OLVM_USERNAME",
    "OLVM_PASSWORD",
    "OLVM_SOURCE_TEMPLATE_NAME",
    "OLVM_COMMUNICATOR",
    "OLVM_CLUSTER",
    "OLVM_MAX_RETRIES",
    "OLVM_BUILDER_CONFIG_PATH",
];

fn temp_home() -> (TempDir, Utf8PathBuf) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    (tmp, root)
}

/// Clears every variable this suite touches, then applies `overrides`.
fn env_pairs<'a>(
    home: &'a str,
    overrides: &[(&'a str, &'a str)],
) -> Vec<(&'a str, Option<&'a str>)> {
    let mut pairs = vec![("HOME", Some(home)), ("XDG_CONFIG_HOME", Some(home))];
    for name in MANAGED_VARS {
        let value = overrides
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value);
        pairs.push((name, value));
    }
    pairs
}

#[tokio::test]
async fn environment_alone_yields_valid_settings() {
    let (_tmp, home) = temp_home();
    let _guard = EnvGuard::set_vars(&env_pairs(
        home.as_str(),
        &[
            ("OLVM_URL", "https://engine.example.com/ovirt-engine/api"),
            ("OLVM_USERNAME", "admin@internal"),
            ("OLVM_PASSWORD", "secret"),
            ("OLVM_SOURCE_TEMPLATE_NAME", "ol9-base"),
            ("OLVM_COMMUNICATOR", "none"),
        ],
    ))
    .await;

    let settings = BuildConfig::load_without_cli_args()
        .and_then(BuildConfig::prepare)
        .unwrap_or_else(|err| panic!("environment config should be valid: {err}"));

    assert_eq!(settings.cluster, "Default");
    assert_eq!(
        settings.source,
        SourceSpec::Template(TemplateSelector::Name {
            name: String::from("ol9-base"),
            version: 1,
        })
    );
    assert_eq!(settings.communicator.kind, CommunicatorKind::None);
    assert_eq!(settings.retry.max_retries, 4);
    assert_eq!(settings.retry.retry_interval, Duration::from_secs(2));
}

#[tokio::test]
async fn environment_overrides_the_configuration_file() {
    let (_tmp, home) = temp_home();
    let dir = Dir::open_ambient_dir(&home, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"));
    dir.write(
        "build.toml",
        concat!(
            "url = \"https://engine.example.com/ovirt-engine/api\"\n",
            "username = \"admin@internal\"\n",
            "password = \"secret\"\n",
            "source_template_name = \"ol9-base\"\n",
            "communicator = \"none\"\n",
            "cluster = \"Lab\"\n",
            "max_retries = 7\n",
        ),
    )
    .unwrap_or_else(|err| panic!("write config file: {err}"));
    let config_path = home.join("build.toml");
    let _guard = EnvGuard::set_vars(&env_pairs(
        home.as_str(),
        &[
            ("OLVM_BUILDER_CONFIG_PATH", config_path.as_str()),
            ("OLVM_CLUSTER", "Production"),
        ],
    ))
    .await;

    let settings = BuildConfig::load_without_cli_args()
        .and_then(BuildConfig::prepare)
        .unwrap_or_else(|err| panic!("file config should be valid: {err}"));

    assert_eq!(settings.cluster, "Production");
    assert_eq!(settings.retry.max_retries, 7);
    assert_eq!(settings.access.username, "admin@internal");
}

#[tokio::test]
async fn missing_credentials_are_reported_together() {
    let (_tmp, home) = temp_home();
    let _guard = EnvGuard::set_vars(&env_pairs(
        home.as_str(),
        &[
            ("OLVM_SOURCE_TEMPLATE_NAME", "ol9-base"),
            ("OLVM_COMMUNICATOR", "none"),
        ],
    ))
    .await;

    let result = BuildConfig::load_without_cli_args().and_then(BuildConfig::prepare);

    let problems = match result {
        Err(ConfigError::Invalid(problems)) => problems,
        other => panic!("expected validation failure, got {other:?}"),
    };
    for var in ["OLVM_URL", "OLVM_USERNAME", "OLVM_PASSWORD"] {
        assert!(
            problems.iter().any(|problem| problem.contains(var)),
            "{var} should be named in {problems:?}"
        );
    }
}
