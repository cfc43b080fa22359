//! Unit tests for configuration validation and defaulting.

use rstest::{fixture, rstest};

use super::*;

#[fixture]
fn base_config() -> BuildConfig {
    BuildConfig {
        url: Some(String::from("https://engine.example.com/ovirt-engine/api/")),
        username: Some(String::from("admin@internal")),
        password: Some(String::from("hunter2")),
        tls_insecure: false,
        cluster: String::from("Default"),
        source_template_name: Some(String::from("ol9-base")),
        source_template_version: None,
        source_template_id: None,
        source_disk_name: None,
        source_disk_id: None,
        vm_name: None,
        vm_vcpu_count: None,
        vm_memory_mb: None,
        vm_storage_driver: String::from("virtio-scsi"),
        address: Some(String::from("192.0.2.10")),
        netmask: String::from("255.255.255.0"),
        gateway: Some(String::from("192.0.2.1")),
        dns_servers: Some(String::from("192.0.2.53  192.0.2.54")),
        os_interface_name: String::from("eth0"),
        network_name: String::from("ovirtmgmt"),
        vnic_profile: None,
        destination_template_name: None,
        destination_template_description: None,
        template_seal: true,
        cleanup_vm: true,
        cleanup_interfaces: true,
        export_host: None,
        export_directory: None,
        export_file_name: None,
        max_retries: 4,
        retry_interval_sec: 2,
        state_timeout_sec: None,
        communicator: String::from("ssh"),
        ssh_username: String::from("root"),
        ssh_port: 22,
        ssh_private_key_file: None,
        ssh_timeout_sec: 300,
        ssh_bin: String::from("ssh"),
        ssh_keygen_bin: String::from("ssh-keygen"),
        provision_command: None,
        debug_key_path: None,
    }
}

fn problems(config: BuildConfig) -> Vec<String> {
    match config.prepare() {
        Err(ConfigError::Invalid(problems)) => problems,
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[rstest]
fn prepare_applies_derived_defaults(base_config: BuildConfig) {
    let settings = base_config
        .prepare()
        .unwrap_or_else(|err| panic!("valid config rejected: {err}"));

    assert_eq!(
        settings.access.url,
        "https://engine.example.com/ovirt-engine/api"
    );
    assert_eq!(
        settings.source,
        SourceSpec::Template(TemplateSelector::Name {
            name: String::from("ol9-base"),
            version: 1,
        })
    );
    assert!(settings.vm.name.starts_with("olvm-"));
    assert!(settings.template.name.starts_with("olvm-ol9-base-"));
    assert_eq!(
        settings.template.description,
        format!("Template created from VM {}", settings.vm.name)
    );
    assert_eq!(settings.network.vnic_profile_name(), Some("ovirtmgmt"));
    assert_eq!(settings.network.dns_servers, ["192.0.2.53", "192.0.2.54"]);
    assert_eq!(settings.communicator.host.as_deref(), Some("192.0.2.10"));
    assert!(settings.export.is_none());
}

#[rstest]
fn missing_credentials_name_env_vars(mut base_config: BuildConfig) {
    base_config.url = None;
    base_config.password = Some(String::from("   "));

    let problems = problems(base_config);

    assert!(problems.iter().any(|p| p.contains("OLVM_URL")), "{problems:?}");
    assert!(
        problems.iter().any(|p| p.contains("OLVM_PASSWORD")),
        "{problems:?}"
    );
    assert!(
        problems.iter().all(|p| p.contains("olvm-builder.toml")),
        "{problems:?}"
    );
}

#[rstest]
fn template_and_disk_sources_conflict(mut base_config: BuildConfig) {
    base_config.source_disk_name = Some(String::from("ubuntu-disk"));

    let problems = problems(base_config);

    assert!(problems.iter().any(|p| p.contains("mutually exclusive")));
}

#[rstest]
fn name_and_id_conflict(mut base_config: BuildConfig) {
    base_config.source_template_id = Some(String::from("6c3bd7ad-5c4b-4d97-9a4b-66a3e1d4a0b2"));

    let problems = problems(base_config);

    assert_eq!(
        problems,
        ["source_template_name and source_template_id are mutually exclusive"]
    );
}

#[rstest]
fn source_is_required(mut base_config: BuildConfig) {
    base_config.source_template_name = None;

    let problems = problems(base_config);

    assert_eq!(problems.len(), 1, "{problems:?}");
}

#[rstest]
#[case::template(Some("not-a-uuid"), None)]
#[case::disk(None, Some("also-bad"))]
fn ids_must_be_uuids(
    mut base_config: BuildConfig,
    #[case] template_id: Option<&str>,
    #[case] disk_id: Option<&str>,
) {
    base_config.source_template_name = None;
    base_config.source_template_id = template_id.map(str::to_owned);
    base_config.source_disk_id = disk_id.map(str::to_owned);

    let problems = problems(base_config);

    assert!(problems.iter().any(|p| p.contains("not a valid UUID")), "{problems:?}");
}

#[rstest]
fn disk_source_by_id_is_accepted(mut base_config: BuildConfig) {
    base_config.source_template_name = None;
    base_config.source_disk_id = Some(String::from("0d9a5b8e-6a43-4c57-8f0c-2b2a1f0c9d11"));

    let settings = base_config
        .prepare()
        .unwrap_or_else(|err| panic!("valid config rejected: {err}"));

    assert_eq!(
        settings.source,
        SourceSpec::Disk(DiskSelector::Id(String::from(
            "0d9a5b8e-6a43-4c57-8f0c-2b2a1f0c9d11"
        )))
    );
}

#[rstest]
fn unknown_storage_driver_is_rejected(mut base_config: BuildConfig) {
    base_config.vm_storage_driver = String::from("ide");

    let problems = problems(base_config);

    assert!(problems.iter().any(|p| p.contains("virtio-scsi")));
}

#[rstest]
fn export_options_require_host(mut base_config: BuildConfig) {
    base_config.export_directory = Some(String::from("/exports"));

    let problems = problems(base_config);

    assert!(problems.iter().any(|p| p.contains("export_host")));
}

#[rstest]
fn export_defaults_follow_template_name(mut base_config: BuildConfig) {
    base_config.export_host = Some(String::from("kvm01"));
    base_config.destination_template_name = Some(String::from("golden"));

    let settings = base_config
        .prepare()
        .unwrap_or_else(|err| panic!("valid config rejected: {err}"));

    assert_eq!(
        settings.export,
        Some(ExportSettings {
            host: String::from("kvm01"),
            directory: String::from("/tmp"),
            file_name: String::from("golden.ova"),
        })
    );
}

#[rstest]
fn zero_retry_values_select_defaults(mut base_config: BuildConfig) {
    base_config.max_retries = 0;
    base_config.retry_interval_sec = 0;

    let settings = base_config
        .prepare()
        .unwrap_or_else(|err| panic!("valid config rejected: {err}"));

    assert_eq!(settings.retry, RetryPolicy::default());
}

#[rstest]
fn ssh_communicator_needs_address(mut base_config: BuildConfig) {
    base_config.address = None;

    let problems = problems(base_config);

    assert!(problems.iter().any(|p| p.contains("address")));
}

#[rstest]
fn none_communicator_runs_without_address(mut base_config: BuildConfig) {
    base_config.address = None;
    base_config.communicator = String::from("none");

    let settings = base_config
        .prepare()
        .unwrap_or_else(|err| panic!("valid config rejected: {err}"));

    assert!(!settings.communicator.enabled());
}

#[rstest]
fn debug_output_redacts_password(base_config: BuildConfig) {
    let settings = base_config
        .prepare()
        .unwrap_or_else(|err| panic!("valid config rejected: {err}"));

    let rendered = format!("{settings:?}");

    assert!(!rendered.contains("hunter2"));
    assert!(rendered.contains("<redacted>"));
}
