//! Network, vNIC profile and NIC placement for the build VM.

use tracing::{debug, info, warn};

use crate::api::{Connector, Network, NicRequest, OlvmConnection, Search, VnicProfile};
use crate::connection::ConnectionManager;
use crate::error::BuildError;

const NEW_NIC_NAME: &str = "nic1";

/// Where a network lookup falls back to.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ClusterScope<'a> {
    pub(crate) id: &'a str,
    pub(crate) name: &'a str,
}

/// Finds the network by a global name search, falling back to the
/// cluster's network list when the search finds nothing or fails.
pub(crate) async fn resolve_network<K: Connector>(
    connection: &ConnectionManager<K>,
    network_name: &str,
    cluster: ClusterScope<'_>,
) -> Result<Network, BuildError> {
    let search = Search::name(network_name);
    let search_ref = &search;
    match connection
        .execute(|conn| async move { conn.list_networks(Some(search_ref)).await })
        .await
    {
        Ok(networks) => {
            if let Some(network) = networks
                .into_iter()
                .find(|network| network.name() == network_name)
            {
                return Ok(network);
            }
            debug!(network = network_name, "network not found globally, checking cluster");
        }
        Err(err) => warn!(
            error = %err,
            network = network_name,
            "global network search failed, checking cluster"
        ),
    }

    let cluster_id = cluster.id;
    connection
        .execute(|conn| async move { conn.list_cluster_networks(cluster_id).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to list networks of cluster '{}'",
            cluster.name
        )))?
        .into_iter()
        .find(|network| network.name() == network_name)
        .ok_or_else(|| BuildError::NetworkNotFound {
            name: network_name.to_owned(),
            cluster: cluster.name.to_owned(),
        })
}

/// Finds the vNIC profile by name, preferring one that belongs to
/// `network_id`.
pub(crate) async fn resolve_vnic_profile<K: Connector>(
    connection: &ConnectionManager<K>,
    profile_name: &str,
    network_id: &str,
) -> Result<VnicProfile, BuildError> {
    let profiles = connection
        .execute(|conn| async move { conn.list_vnic_profiles().await })
        .await
        .map_err(BuildError::remote("failed to list vNIC profiles"))?;
    profiles
        .iter()
        .find(|profile| {
            profile.name() == profile_name && profile.network_id.as_deref() == Some(network_id)
        })
        .or_else(|| profiles.iter().find(|profile| profile.name() == profile_name))
        .cloned()
        .ok_or_else(|| BuildError::VnicProfileNotFound(profile_name.to_owned()))
}

/// What the NIC step should do with the VM's interfaces.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NicPlacement<'a> {
    pub(crate) network_name: &'a str,
    pub(crate) profile_name: &'a str,
    pub(crate) reuse_existing: bool,
}

/// Puts the VM on the network: reconfigures its first NIC in place when
/// `reuse_existing` is set and one exists, otherwise adds `nic1`.
pub(crate) async fn configure_nic<K: Connector>(
    connection: &ConnectionManager<K>,
    vm_id: &str,
    cluster: ClusterScope<'_>,
    placement: NicPlacement<'_>,
) -> Result<(), BuildError> {
    let network = resolve_network(connection, placement.network_name, cluster).await?;
    let network_id = network.id()?;
    info!(network = network.name(), id = network_id, "found network");

    let profile = resolve_vnic_profile(connection, placement.profile_name, network_id).await?;
    info!(profile = profile.name(), id = profile.id()?, "found vNIC profile");

    let existing = connection
        .execute(|conn| async move { conn.list_nics(vm_id).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to list network interfaces of VM {vm_id}"
        )))?;

    let mut request = NicRequest {
        name: NEW_NIC_NAME.to_owned(),
        network_id: network_id.to_owned(),
        vnic_profile_id: profile.id()?.to_owned(),
        on_boot: true,
        linked: true,
    };

    if placement.reuse_existing
        && let Some(first) = existing.first()
    {
        let nic_id = first.id()?;
        first.name().clone_into(&mut request.name);
        debug!(
            existing = existing.len(),
            nic = %request.name,
            "reconfiguring existing network interface"
        );
        let request_ref = &request;
        connection
            .execute(|conn| async move { conn.update_nic(vm_id, nic_id, request_ref).await })
            .await
            .map_err(BuildError::remote(format!(
                "failed to update network interface {nic_id}"
            )))?;
        info!(nic = %request.name, network = placement.network_name, "configured existing network interface");
        return Ok(());
    }

    let request_ref = &request;
    connection
        .execute(|conn| async move { conn.add_nic(vm_id, request_ref).await })
        .await
        .map_err(BuildError::remote(format!(
            "failed to add network interface to VM {vm_id}"
        )))?;
    info!(nic = NEW_NIC_NAME, network = placement.network_name, "added network interface");
    Ok(())
}
