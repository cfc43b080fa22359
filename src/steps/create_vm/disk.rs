//! Disk cloning and attachment for disk-sourced builds.

use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::api::{Connector, DiskAttachmentRequest, DiskCopyRequest, OlvmConnection, Search};
use crate::config::StorageDriver;
use crate::connection::ConnectionManager;
use crate::error::BuildError;
use crate::wait::Cancellation;

use super::super::refresh::status;
use super::source::SourceResourceInfo;

/// Name given to a clone of `source_name`: the source name plus the
/// current Unix time.
pub(crate) fn clone_name(source_name: &str) -> String {
    format!("{source_name}-{}", Utc::now().timestamp())
}

/// Pacing of the cloned-disk poll.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ClonePoll<'a> {
    pub(crate) attempts: u32,
    pub(crate) interval: Duration,
    pub(crate) cancellation: &'a Cancellation,
}

/// Copies the source disk into its first storage domain and waits for the
/// copy to become usable. Returns the clone's id.
pub(crate) async fn clone_disk<K: Connector>(
    connection: &ConnectionManager<K>,
    source: &SourceResourceInfo,
    poll: ClonePoll<'_>,
) -> Result<String, BuildError> {
    let source_id = source.id.as_str();
    let disk = connection
        .execute(|conn| async move { conn.get_disk(source_id).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to read source disk {source_id}"
        )))?;
    let storage_domain_id = disk
        .storage_domain_ids
        .first()
        .cloned()
        .ok_or_else(|| BuildError::NoStorageDomain(source.id.clone()))?;
    debug!(
        size = disk.provisioned_size.unwrap_or_default(),
        storage_domain = %storage_domain_id,
        "source disk located"
    );

    let request = DiskCopyRequest {
        name: clone_name(&source.name),
        storage_domain_id,
    };
    let request_ref = &request;
    info!(clone = %request.name, source = source_id, "copying disk");
    connection
        .execute(|conn| async move { conn.copy_disk(source_id, request_ref).await })
        .await
        .map_err(BuildError::remote(format!("failed to copy disk {source_id}")))?;

    let clone_id = wait_for_clone(connection, &request.name, poll).await?;
    info!(clone = %request.name, id = %clone_id, "disk clone ready");
    Ok(clone_id)
}

/// Polls the disk list by name until the first match reports `ok`.
///
/// Each listing counts as one attempt whether or not the clone is visible
/// yet; the loop gives up after `poll.attempts` listings.
pub(crate) async fn wait_for_clone<K: Connector>(
    connection: &ConnectionManager<K>,
    clone_name: &str,
    poll: ClonePoll<'_>,
) -> Result<String, BuildError> {
    let search = Search::name(clone_name);
    let search_ref = &search;
    for attempt in 1..=poll.attempts {
        if poll.cancellation.is_cancelled() {
            return Err(BuildError::Interrupted);
        }
        let disks = connection
            .execute(|conn| async move { conn.list_disks(Some(search_ref)).await })
            .await
            .map_err(BuildError::remote("failed to list disks"))?;
        if let Some(disk) = disks.first()
            && disk.status().is_ok_and(|current| current == status::OK)
        {
            return Ok(disk.id()?.to_owned());
        }
        debug!(attempt, clone = clone_name, "cloned disk not ready");
        if attempt < poll.attempts {
            sleep(poll.interval).await;
        }
    }
    Err(BuildError::DiskCloneTimeout {
        name: clone_name.to_owned(),
        attempts: poll.attempts,
    })
}

/// Attaches the clone as the VM's bootable, active disk.
pub(crate) async fn attach_disk<K: Connector>(
    connection: &ConnectionManager<K>,
    vm_id: &str,
    disk_id: &str,
    driver: StorageDriver,
) -> Result<(), BuildError> {
    let request = DiskAttachmentRequest {
        disk_id: disk_id.to_owned(),
        interface: driver.api_interface().to_owned(),
        bootable: true,
        active: true,
    };
    let request_ref = &request;
    connection
        .execute(|conn| async move { conn.add_disk_attachment(vm_id, request_ref).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to attach disk {disk_id} to VM {vm_id}"
        )))?;
    info!(disk = disk_id, vm = vm_id, interface = %request.interface, "attached disk");

    match connection
        .execute(|conn| async move { conn.list_disk_attachments(vm_id).await })
        .await
    {
        Ok(attachments) => debug!(count = attachments.len(), vm = vm_id, "verified disk attachments"),
        Err(err) => warn!(error = %err, vm = vm_id, "could not verify disk attachment"),
    }
    Ok(())
}
