//! Tests for URL handling, status mapping and the JSON wire format.

use rstest::rstest;
use serde_json::json;

use super::*;
use crate::api::{NicConfiguration, TemplateRef};
use crate::connection::is_retryable;

#[rstest]
#[case("https://engine.example.com/ovirt-engine/api", "https://engine.example.com/ovirt-engine/sso/oauth/token")]
#[case("https://engine.example.com/ovirt-engine/api/", "https://engine.example.com/ovirt-engine/sso/oauth/token")]
#[case("https://engine.example.com/custom", "https://engine.example.com/custom/sso/oauth/token")]
fn sso_url_strips_api_segment(#[case] api: &str, #[case] expected: &str) {
    assert_eq!(sso_url(api), expected);
}

#[test]
fn success_statuses_are_not_errors() {
    assert_eq!(status_error(StatusCode::OK, "{}"), None);
    assert_eq!(status_error(StatusCode::CREATED, "{}"), None);
    assert_eq!(status_error(StatusCode::FOUND, ""), None);
}

#[test]
fn unauthorized_maps_to_auth_and_is_retryable() {
    let err = status_error(StatusCode::UNAUTHORIZED, "")
        .unwrap_or_else(|| panic!("401 should be an error"));
    assert!(matches!(err, ApiError::Auth(_)));
    assert!(is_retryable(&err));
}

#[test]
fn not_found_uses_fault_detail() {
    let body = json!({"reason": "Operation Failed", "detail": "Entity not found: vm-1"}).to_string();
    let err = status_error(StatusCode::NOT_FOUND, &body)
        .unwrap_or_else(|| panic!("404 should be an error"));
    assert_eq!(
        err,
        ApiError::NotFound(String::from("Operation Failed: Entity not found: vm-1"))
    );
    assert!(!is_retryable(&err));
}

#[rstest]
#[case(StatusCode::SERVICE_UNAVAILABLE, true)]
#[case(StatusCode::TOO_MANY_REQUESTS, true)]
#[case(StatusCode::BAD_REQUEST, false)]
#[case(StatusCode::CONFLICT, false)]
fn server_statuses_carry_http_prefix(#[case] status: StatusCode, #[case] retryable: bool) {
    let err = status_error(status, "busy").unwrap_or_else(|| panic!("{status} should fail"));
    assert_eq!(
        err,
        ApiError::Remote(format!("HTTP {}: busy", status.as_u16()))
    );
    assert_eq!(is_retryable(&err), retryable);
}

#[test]
fn malformed_body_is_a_retryable_parse_error() {
    let err = parse::<ClusterList>("<html>login</html>")
        .err()
        .unwrap_or_else(|| panic!("HTML should not parse"));
    assert!(err.message().starts_with("parse error"));
    assert!(is_retryable(&err));
}

#[test]
fn search_is_rendered_as_query_parameter() {
    let search = Search::name("ol9-base");
    assert_eq!(
        search_query(Some(&search)),
        vec![("search", String::from("name=ol9-base"))]
    );
    assert!(search_query(None).is_empty());
}

#[test]
fn empty_collection_may_be_omitted() {
    let list: NicList = parse("{}").unwrap_or_else(|err| panic!("parse: {err}"));
    assert!(list.nic.is_empty());
}

#[test]
fn template_numbers_accept_string_encoding() {
    let body = json!({
        "template": [{
            "id": "t1",
            "name": "ol9-base",
            "status": "ok",
            "version": {"version_number": "2"},
            "cpu": {"topology": {"cores": "4", "sockets": "1"}},
            "memory": "4294967296"
        }]
    })
    .to_string();
    let list: TemplateList = parse(&body).unwrap_or_else(|err| panic!("parse: {err}"));
    let templates: Vec<TemplateRecord> = convert(list.template);

    assert_eq!(
        templates,
        vec![TemplateRecord {
            id: Some(String::from("t1")),
            name: Some(String::from("ol9-base")),
            status: Some(String::from("ok")),
            version_number: Some(2),
            cpu_cores: Some(4),
            memory_bytes: Some(4_294_967_296),
        }]
    );
}

#[test]
fn disk_collects_storage_domains() {
    let body = json!({
        "id": "d1",
        "alias": "ubuntu-disk",
        "status": "ok",
        "provisioned_size": 10_737_418_240_u64,
        "storage_domains": {"storage_domain": [{"id": "sd1"}, {"id": "sd2"}]}
    })
    .to_string();
    let disk: Disk = parse::<WireDisk>(&body)
        .unwrap_or_else(|err| panic!("parse: {err}"))
        .into();

    assert_eq!(disk.label(), "ubuntu-disk");
    assert_eq!(disk.provisioned_size, Some(10_737_418_240));
    assert_eq!(disk.storage_domain_ids, vec!["sd1", "sd2"]);
}

#[test]
fn attachments_and_profiles_flatten_links() {
    let attachments: AttachmentList = parse(
        &json!({"disk_attachment": [{"disk": {"id": "d2"}, "interface": "virtio_scsi", "bootable": "true"}]})
            .to_string(),
    )
    .unwrap_or_else(|err| panic!("parse: {err}"));
    let profiles: VnicProfileList = parse(
        &json!({"vnic_profile": [{"id": "p1", "name": "ovirtmgmt", "network": {"id": "n1"}}]})
            .to_string(),
    )
    .unwrap_or_else(|err| panic!("parse: {err}"));

    let attachment: Vec<DiskAttachment> = convert(attachments.disk_attachment);
    let profile: Vec<VnicProfile> = convert(profiles.vnic_profile);
    assert_eq!(
        attachment,
        vec![DiskAttachment {
            disk_id: Some(String::from("d2")),
            interface: Some(String::from("virtio_scsi")),
            bootable: Some(true),
        }]
    );
    assert_eq!(
        profile.first().and_then(|entry| entry.network_id.as_deref()),
        Some("n1")
    );
}

#[test]
fn vm_body_from_template_enables_virtio_scsi() {
    let body = wire::vm_body(&VmCreateRequest {
        name: String::from("olvm-build"),
        cluster_id: String::from("c1"),
        template: TemplateRef::Id(String::from("t1")),
        cpu_cores: 2,
        memory_mb: 2048,
        virtio_scsi: Some(true),
    });

    assert_eq!(
        body,
        json!({
            "name": "olvm-build",
            "cluster": {"id": "c1"},
            "template": {"id": "t1"},
            "cpu": {"topology": {"cores": 2, "sockets": 1, "threads": 1}},
            "memory": 2_147_483_648_u64,
            "virtio_scsi": {"enabled": true},
        })
    );
}

#[test]
fn vm_body_from_blank_omits_virtio_scsi() {
    let body = wire::vm_body(&VmCreateRequest {
        name: String::from("olvm-build"),
        cluster_id: String::from("c1"),
        template: TemplateRef::Name(String::from("Blank")),
        cpu_cores: 1,
        memory_mb: 1024,
        virtio_scsi: None,
    });

    assert_eq!(body.get("template"), Some(&json!({"name": "Blank"})));
    assert_eq!(body.get("virtio_scsi"), None);
}

#[test]
fn initialization_body_includes_static_nic() {
    let body = wire::initialization_body(&VmInitialization {
        user_name: Some(String::from("root")),
        authorized_ssh_keys: Some(String::from("ssh-ed25519 AAAA")),
        host_name: String::from("olvm-build"),
        nic_configuration: Some(NicConfiguration {
            name: String::from("eth0"),
            address: String::from("192.0.2.10"),
            netmask: String::from("255.255.255.0"),
            gateway: Some(String::from("192.0.2.1")),
        }),
        dns_servers: Some(String::from("1.1.1.1 8.8.8.8")),
    });

    assert_eq!(
        body,
        json!({
            "initialization": {
                "host_name": "olvm-build",
                "user_name": "root",
                "authorized_ssh_keys": "ssh-ed25519 AAAA",
                "nic_configurations": {
                    "nic_configuration": [{
                        "name": "eth0",
                        "boot_protocol": "static",
                        "on_boot": true,
                        "ip": {
                            "address": "192.0.2.10",
                            "netmask": "255.255.255.0",
                            "gateway": "192.0.2.1"
                        }
                    }]
                },
                "dns_servers": "1.1.1.1 8.8.8.8"
            }
        })
    );
}

#[test]
fn template_body_names_cluster_and_vm() {
    let body = wire::template_body(&TemplateCreateRequest {
        name: String::from("golden"),
        description: String::from("built"),
        cluster_name: String::from("Default"),
        vm_id: String::from("vm-1"),
        seal: true,
    });

    assert_eq!(
        body,
        json!({
            "name": "golden",
            "description": "built",
            "cluster": {"name": "Default"},
            "vm": {"id": "vm-1"},
        })
    );
}

#[test]
fn nic_body_links_network_and_profile() {
    let body = wire::nic_body(&NicRequest {
        name: String::from("nic1"),
        network_id: String::from("n1"),
        vnic_profile_id: String::from("p1"),
        on_boot: true,
        linked: true,
    });

    assert_eq!(body.pointer("/network/id"), Some(&json!("n1")));
    assert_eq!(body.pointer("/vnic_profile/id"), Some(&json!("p1")));
    assert_eq!(body.get("plugged"), Some(&json!(true)));
}

#[tokio::test]
async fn closed_session_reports_lost_connection() {
    let connector = RestConnector::new(AccessSettings {
        url: String::from("https://engine.invalid/ovirt-engine/api"),
        username: String::from("admin@internal"),
        password: String::from("secret"),
        tls_insecure: true,
    })
    .unwrap_or_else(|err| panic!("client should build: {err}"));
    let connection = RestConnection {
        inner: Arc::new(Session {
            client: connector.client.clone(),
            base_url: String::from("https://engine.invalid/ovirt-engine/api"),
            token: String::from("token"),
            closed: AtomicBool::new(false),
        }),
    };

    connection.close();
    let result = connection.test().await;

    assert_eq!(
        result,
        Err(ApiError::Remote(String::from(
            "connection lost: session closed"
        )))
    );
    assert_eq!(connection.url("vms/vm-1"), "https://engine.invalid/ovirt-engine/api/vms/vm-1");
}
