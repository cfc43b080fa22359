//! Tests for the steps after VM creation and for the standard step list.

use rstest::{fixture, rstest};

use super::initial_run::initialization;
use super::*;
use crate::api::Search;
use crate::communicator::CommunicatorError;
use crate::config::{BuildSettings, CommunicatorKind, ExportSettings};
use crate::error::BuildError;
use crate::export::ExportRequest;
use crate::pipeline::{PipelineContext, Step, StepAction};
use crate::test_support::{
    FakeConnector, FakeOlvm, Harness, ScriptedCommunicator, sample_settings,
};

const GUEST: &str = "192.0.2.10";

#[fixture]
fn harness() -> Harness {
    Harness::new(FakeOlvm::with_standard_inventory())
}

fn ssh_settings() -> BuildSettings {
    let mut settings = sample_settings();
    settings.communicator.kind = CommunicatorKind::Ssh;
    settings.communicator.host = Some(String::from(GUEST));
    settings.communicator.provision_command = Some(String::from("dnf -y update"));
    settings
}

fn export_settings(host: &str) -> BuildSettings {
    let mut settings = sample_settings();
    settings.export = Some(ExportSettings {
        host: host.to_owned(),
        directory: String::from("/tmp"),
        file_name: String::from("golden.ova"),
    });
    settings
}

async fn context(harness: &Harness, settings: BuildSettings) -> PipelineContext<FakeConnector> {
    harness
        .context(settings)
        .await
        .unwrap_or_else(|err| panic!("fake connect should succeed: {err}"))
}

async fn run_ok(ctx: &mut PipelineContext<FakeConnector>, mut step: impl Step<FakeConnector>) {
    let name = step.name();
    let action = step.run(ctx).await;
    assert_eq!(
        action,
        StepAction::Continue,
        "{name} failed: {:?}",
        ctx.failure()
    );
}

#[test]
fn standard_pipeline_orders_steps() {
    let pipeline = standard_pipeline::<FakeConnector>();
    assert_eq!(
        pipeline.step_names(),
        vec![
            "prepare_key_pair",
            "create_vm",
            "setup_initial_run",
            "connect_guest",
            "provision",
            "cleanup_temp_keys",
            "stop_vm",
            "cleanup_interfaces",
            "create_template",
            "export_template",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn key_pair_is_skipped_without_communicator(harness: Harness) {
    let mut ctx = context(&harness, sample_settings()).await;

    run_ok(&mut ctx, PrepareKeyPair).await;

    assert!(ctx.state().key_pair.is_none());
    assert!(harness.communicator.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn temporary_key_pair_is_recorded_and_discarded(harness: Harness) {
    let mut ctx = context(&harness, ssh_settings()).await;
    let mut step = PrepareKeyPair;

    run_ok(&mut ctx, step).await;
    assert_eq!(
        ctx.state().key_pair.as_ref(),
        Some(&ScriptedCommunicator::key_pair())
    );

    step.cleanup(&mut ctx)
        .await
        .unwrap_or_else(|err| panic!("cleanup should succeed: {err}"));
    assert_eq!(
        harness.communicator.calls(),
        vec![
            String::from("prepare_key_pair"),
            String::from("discard_key_pair /tmp/olvm-builder-test/id_ed25519"),
        ]
    );
    assert!(harness.progress.contains("Deleted temporary SSH key pair"));
}

#[test]
fn initialization_configures_static_address_and_dns() {
    let mut settings = ssh_settings();
    settings.network.address = Some(String::from("192.0.2.10"));
    settings.network.gateway = Some(String::from("192.0.2.1"));
    settings.network.dns_servers = vec![String::from("1.1.1.1"), String::from("8.8.8.8")];

    let payload = initialization(&settings, Some("ssh-ed25519 AAAA test\n"));

    assert_eq!(payload.user_name.as_deref(), Some("root"));
    assert_eq!(payload.authorized_ssh_keys.as_deref(), Some("ssh-ed25519 AAAA test"));
    assert_eq!(payload.host_name, "olvm-build");
    let nic = payload
        .nic_configuration
        .unwrap_or_else(|| panic!("static address should produce a NIC configuration"));
    assert_eq!(nic.name, "eth0");
    assert_eq!(nic.address, "192.0.2.10");
    assert_eq!(nic.netmask, "255.255.255.0");
    assert_eq!(nic.gateway.as_deref(), Some("192.0.2.1"));
    assert_eq!(payload.dns_servers.as_deref(), Some("1.1.1.1 8.8.8.8"));
}

#[test]
fn initialization_without_address_or_communicator_is_minimal() {
    let mut settings = sample_settings();
    settings.network.dns_servers = vec![String::from("1.1.1.1")];

    let payload = initialization(&settings, None);

    assert_eq!(payload.user_name, None);
    assert_eq!(payload.authorized_ssh_keys, None);
    assert_eq!(payload.nic_configuration, None);
    assert_eq!(payload.dns_servers, None);
    assert_eq!(payload.host_name, "olvm-build");
}

#[rstest]
#[tokio::test]
async fn initial_run_starts_with_cloud_init_and_waits_for_up(harness: Harness) {
    let mut ctx = context(&harness, ssh_settings()).await;
    run_ok(&mut ctx, PrepareKeyPair).await;
    run_ok(&mut ctx, CreateVm).await;
    let polls_before = harness.olvm.call_count("get_vm");
    harness
        .olvm
        .script_vm_statuses(&["wait_for_launch", "powering_up", "up"]);

    run_ok(&mut ctx, SetupInitialRun).await;

    assert_eq!(harness.olvm.starts(), vec![(String::from("vm-1"), true)]);
    let initializations = harness.olvm.initializations();
    let [(vm_id, payload)] = initializations.as_slice() else {
        panic!("expected one initialization, got {initializations:?}");
    };
    assert_eq!(vm_id, "vm-1");
    assert_eq!(
        payload.authorized_ssh_keys.as_deref(),
        Some(ScriptedCommunicator::key_pair().public_key.as_str())
    );
    assert_eq!(harness.olvm.call_count("get_vm") - polls_before, 3);
    assert!(harness.progress.contains("VM successfully started!"));
}

#[rstest]
#[tokio::test]
async fn guest_steps_connect_provision_and_remove_key(harness: Harness) {
    let mut ctx = context(&harness, ssh_settings()).await;

    run_ok(&mut ctx, PrepareKeyPair).await;
    run_ok(&mut ctx, ConnectGuest).await;
    run_ok(&mut ctx, Provision).await;
    run_ok(&mut ctx, CleanupTempKeys).await;

    assert_eq!(
        harness.communicator.calls(),
        vec![
            String::from("prepare_key_pair"),
            format!("wait_for_connection {GUEST}"),
            format!("run {GUEST} dnf -y update"),
            format!("remove_temporary_key {GUEST}"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn guest_steps_do_nothing_without_communicator(harness: Harness) {
    let mut ctx = context(&harness, sample_settings()).await;

    run_ok(&mut ctx, ConnectGuest).await;
    run_ok(&mut ctx, Provision).await;
    run_ok(&mut ctx, CleanupTempKeys).await;

    assert!(harness.communicator.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn missing_guest_host_halts(harness: Harness) {
    let mut settings = ssh_settings();
    settings.communicator.host = None;
    let mut ctx = context(&harness, settings).await;
    run_ok(&mut ctx, PrepareKeyPair).await;

    let action = ConnectGuest.run(&mut ctx).await;

    assert_eq!(action, StepAction::Halt);
    assert_eq!(
        ctx.failure(),
        Some(&BuildError::MissingState("communicator host"))
    );
}

#[rstest]
#[tokio::test]
async fn interrupted_connect_halts(harness: Harness) {
    let mut ctx = context(&harness, ssh_settings()).await;
    run_ok(&mut ctx, PrepareKeyPair).await;
    harness.cancellation.cancel();

    let action = ConnectGuest.run(&mut ctx).await;

    assert_eq!(action, StepAction::Halt);
    assert_eq!(ctx.failure(), Some(&BuildError::Interrupted));
}

#[rstest]
#[tokio::test]
async fn failed_provisioning_halts(harness: Harness) {
    let failure = CommunicatorError::CommandFailed {
        command: String::from("dnf -y update"),
        status: String::from("1"),
        stderr: String::from("no network"),
    };
    harness.communicator.fail_on("run", failure.clone());
    let mut ctx = context(&harness, ssh_settings()).await;
    run_ok(&mut ctx, PrepareKeyPair).await;

    let action = Provision.run(&mut ctx).await;

    assert_eq!(action, StepAction::Halt);
    assert_eq!(ctx.failure(), Some(&BuildError::Communicator(failure)));
}

#[rstest]
#[tokio::test]
async fn temporary_key_removal_failure_does_not_halt(harness: Harness) {
    harness.communicator.fail_on(
        "remove_temporary_key",
        CommunicatorError::CommandFailed {
            command: String::from("sed"),
            status: String::from("255"),
            stderr: String::from("connection reset"),
        },
    );
    let mut ctx = context(&harness, ssh_settings()).await;
    run_ok(&mut ctx, PrepareKeyPair).await;

    run_ok(&mut ctx, CleanupTempKeys).await;

    assert!(!ctx.is_failed());
    let errors = harness.progress.errors();
    assert!(
        errors
            .iter()
            .any(|line| line.starts_with("Error removing temporary SSH key")),
        "errors: {errors:?}"
    );
}

#[rstest]
#[tokio::test]
async fn stop_vm_skips_a_stopped_vm(harness: Harness) {
    let mut ctx = context(&harness, sample_settings()).await;
    run_ok(&mut ctx, CreateVm).await;

    run_ok(&mut ctx, StopVm).await;

    assert_eq!(harness.olvm.call_count("stop_vm"), 0);
    assert!(harness.progress.contains("VM vm-1 is already stopped"));
}

#[rstest]
#[tokio::test]
async fn stop_vm_stops_and_waits_for_down(harness: Harness) {
    let mut ctx = context(&harness, sample_settings()).await;
    run_ok(&mut ctx, CreateVm).await;
    run_ok(&mut ctx, SetupInitialRun).await;
    let polls_before = harness.olvm.call_count("get_vm");
    harness
        .olvm
        .script_vm_statuses(&["up", "powering_down", "powering_down", "down"]);

    run_ok(&mut ctx, StopVm).await;

    assert_eq!(harness.olvm.call_count("stop_vm"), 1);
    assert_eq!(harness.olvm.call_count("get_vm") - polls_before, 4);
    let vm = harness
        .olvm
        .vm("vm-1")
        .unwrap_or_else(|| panic!("VM should still exist"));
    assert_eq!(vm.status.as_deref(), Some("down"));
}

#[rstest]
#[tokio::test]
async fn stop_vm_requires_a_vm(harness: Harness) {
    let mut ctx = context(&harness, sample_settings()).await;

    let action = StopVm.run(&mut ctx).await;

    assert_eq!(action, StepAction::Halt);
    assert_eq!(ctx.failure(), Some(&BuildError::MissingState("vm_id")));
}

#[rstest]
#[tokio::test]
async fn cleanup_interfaces_removes_every_nic(harness: Harness) {
    harness
        .olvm
        .set_template_nics("t1", &[("nic-a", "nic1"), ("nic-b", "nic2")]);
    let mut ctx = context(&harness, sample_settings()).await;
    run_ok(&mut ctx, CreateVm).await;

    run_ok(&mut ctx, CleanupInterfaces).await;

    assert_eq!(
        harness.olvm.removed_nics(),
        vec![
            (String::from("vm-1"), String::from("nic-a")),
            (String::from("vm-1"), String::from("nic-b")),
        ]
    );
    assert!(harness.olvm.nics("vm-1").is_empty());
    assert!(
        harness
            .progress
            .contains("Removing network interface: nic2 (ID: nic-b)")
    );
}

#[rstest]
#[tokio::test]
async fn cleanup_interfaces_respects_setting(harness: Harness) {
    let mut settings = sample_settings();
    settings.cleanup.interfaces = false;
    let mut ctx = context(&harness, settings).await;
    run_ok(&mut ctx, CreateVm).await;
    let listings_before = harness.olvm.call_count("list_nics");

    run_ok(&mut ctx, CleanupInterfaces).await;

    assert_eq!(harness.olvm.call_count("list_nics"), listings_before);
    assert!(harness.olvm.removed_nics().is_empty());
    assert_eq!(harness.olvm.nics("vm-1").len(), 1);
}

#[rstest]
#[tokio::test]
async fn create_template_submits_request_and_waits(harness: Harness) {
    let mut ctx = context(&harness, sample_settings()).await;
    run_ok(&mut ctx, CreateVm).await;
    harness
        .olvm
        .script_template_statuses(&["locked", "image_locked", "ok"]);
    let lookups_before = harness.olvm.call_count("get_template");

    run_ok(&mut ctx, CreateTemplate).await;

    let requests = harness.olvm.template_requests();
    let [request] = requests.as_slice() else {
        panic!("expected one template request, got {requests:?}");
    };
    assert_eq!(request.name, "golden");
    assert_eq!(request.cluster_name, "Default");
    assert_eq!(request.vm_id, "vm-1");
    assert!(request.seal);
    let template_id = ctx
        .state()
        .template_id
        .clone()
        .unwrap_or_else(|| panic!("template id should be recorded"));
    assert!(template_id.starts_with("tpl-"), "template id: {template_id}");
    assert_eq!(
        harness.olvm.call_count("get_template") - lookups_before,
        3,
        "one poll per scripted template status"
    );
    assert!(harness.progress.contains(&format!(
        "Successfully created template 'golden' (ID: {template_id})"
    )));
}

#[rstest]
#[tokio::test]
async fn create_template_rejects_running_vm(harness: Harness) {
    let mut ctx = context(&harness, sample_settings()).await;
    run_ok(&mut ctx, CreateVm).await;
    run_ok(&mut ctx, SetupInitialRun).await;

    let action = CreateTemplate.run(&mut ctx).await;

    assert_eq!(action, StepAction::Halt);
    assert_eq!(
        ctx.failure(),
        Some(&BuildError::VmNotStopped(String::from("up")))
    );
    assert_eq!(harness.olvm.call_count("add_template"), 0);
    assert_eq!(ctx.state().template_id, None);
}

#[rstest]
#[tokio::test]
async fn export_is_skipped_without_export_host(harness: Harness) {
    let mut ctx = context(&harness, sample_settings()).await;

    run_ok(&mut ctx, ExportTemplate).await;

    assert_eq!(harness.olvm.call_count("list_hosts"), 0);
    assert!(harness.exporter.requests().is_empty());
    assert_eq!(ctx.state().export, None);
}

#[rstest]
#[tokio::test]
async fn export_posts_request_for_resolved_host(harness: Harness) {
    let mut ctx = context(&harness, export_settings("kvm01")).await;
    run_ok(&mut ctx, CreateVm).await;
    run_ok(&mut ctx, CreateTemplate).await;
    let template_id = ctx
        .state()
        .template_id
        .clone()
        .unwrap_or_else(|| panic!("template id should be recorded"));
    harness
        .olvm
        .script_template_statuses(&["ok", "locked", "locked", "ok"]);

    run_ok(&mut ctx, ExportTemplate).await;

    let expected = ExportRequest {
        host_name: String::from("kvm01"),
        directory: String::from("/tmp"),
        file_name: String::from("golden.ova"),
    };
    assert_eq!(harness.olvm.host_searches(), vec![Search::name("kvm01")]);
    assert_eq!(
        harness.exporter.requests(),
        vec![(template_id, expected.clone())]
    );
    assert_eq!(ctx.state().export, Some(expected));
    assert!(harness.progress.contains(
        "Successfully initiated template export to OVA: /tmp/golden.ova on host kvm01"
    ));
}

#[rstest]
#[tokio::test]
async fn export_fails_for_unknown_host(harness: Harness) {
    let mut ctx = context(&harness, export_settings("kvm99")).await;
    run_ok(&mut ctx, CreateVm).await;
    run_ok(&mut ctx, CreateTemplate).await;

    let action = ExportTemplate.run(&mut ctx).await;

    assert_eq!(action, StepAction::Halt);
    assert_eq!(
        ctx.failure(),
        Some(&BuildError::HostNotFound(String::from("kvm99")))
    );
    assert!(harness.exporter.requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn rejected_export_halts(harness: Harness) {
    let rejection = BuildError::ExportRejected {
        status: 409,
        body: String::from("template is locked"),
    };
    harness.exporter.fail_with(rejection.clone());
    let mut ctx = context(&harness, export_settings("kvm01")).await;
    run_ok(&mut ctx, CreateVm).await;
    run_ok(&mut ctx, CreateTemplate).await;

    let action = ExportTemplate.run(&mut ctx).await;

    assert_eq!(action, StepAction::Halt);
    assert_eq!(ctx.failure(), Some(&rejection));
    assert_eq!(ctx.state().export, None);
}
