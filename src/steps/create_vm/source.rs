//! Cluster and source resolution.

use tracing::{debug, info};

use crate::api::{Connector, Disk, OlvmConnection, Search};
use crate::config::{DiskSelector, SourceSpec, TemplateSelector, VmSettings};
use crate::connection::ConnectionManager;
use crate::error::BuildError;

const DEFAULT_CPU_COUNT: u32 = 1;
const DEFAULT_MEMORY_MB: u64 = 1024;

/// The template or disk the build VM is created from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SourceResourceInfo {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) cpu_count: u32,
    pub(crate) memory_mb: u64,
}

impl SourceResourceInfo {
    /// CPU and memory for the VM: a nonzero override wins over the source
    /// default.
    pub(crate) fn effective_resources(&self, vm: &VmSettings) -> (u32, u64) {
        let cpu = vm
            .vcpu_count
            .filter(|count| *count != 0)
            .unwrap_or(self.cpu_count);
        let memory = vm
            .memory_mb
            .filter(|size| *size != 0)
            .unwrap_or(self.memory_mb);
        (cpu, memory)
    }
}

pub(crate) async fn resolve_cluster_id<K: Connector>(
    connection: &ConnectionManager<K>,
    cluster_name: &str,
) -> Result<String, BuildError> {
    let clusters = connection
        .execute(|conn| async move { conn.list_clusters().await })
        .await
        .map_err(BuildError::remote("failed to list clusters"))?;
    let cluster = clusters
        .iter()
        .find(|cluster| cluster.name() == cluster_name)
        .ok_or_else(|| BuildError::ClusterNotFound(cluster_name.to_owned()))?;
    let id = cluster.id()?.to_owned();
    info!(cluster = cluster_name, %id, "using cluster");
    Ok(id)
}

pub(crate) async fn resolve_source<K: Connector>(
    connection: &ConnectionManager<K>,
    source: &SourceSpec,
) -> Result<SourceResourceInfo, BuildError> {
    match source {
        SourceSpec::Template(selector) => resolve_template(connection, selector).await,
        SourceSpec::Disk(selector) => resolve_disk(connection, selector).await,
    }
}

async fn resolve_template<K: Connector>(
    connection: &ConnectionManager<K>,
    selector: &TemplateSelector,
) -> Result<SourceResourceInfo, BuildError> {
    let template_id = match selector {
        TemplateSelector::Id(id) => id.clone(),
        TemplateSelector::Name { name, version } => {
            debug!(template = %name, version, "searching for template");
            let search = Search::name(name.clone());
            let search_ref = &search;
            let candidates = connection
                .execute(|conn| async move { conn.list_templates(Some(search_ref)).await })
                .await
                .map_err(BuildError::remote(format!(
                    "failed to search templates named '{name}'"
                )))?;
            candidates
                .iter()
                .find(|template| template.version_number == Some(*version))
                .ok_or_else(|| BuildError::TemplateVersionNotFound {
                    name: name.clone(),
                    version: *version,
                })?
                .id()?
                .to_owned()
        }
    };

    let id_ref = template_id.as_str();
    let template = connection
        .execute(|conn| async move { conn.get_template(id_ref).await })
        .await
        .map_err(|err| {
            if err.is_not_found() {
                BuildError::TemplateNotFound(template_id.clone())
            } else {
                BuildError::remote(format!("failed to read template {template_id}"))(err)
            }
        })?;
    info!(template = %template_id, "using template");

    let name = match selector {
        TemplateSelector::Name { name, .. } => name.clone(),
        TemplateSelector::Id(_) if template.name().is_empty() => template_id.clone(),
        TemplateSelector::Id(_) => template.name().to_owned(),
    };
    let cpu_count = template
        .cpu_cores
        .filter(|cores| *cores != 0)
        .unwrap_or(DEFAULT_CPU_COUNT);
    let memory_mb = template
        .memory_bytes
        .map(|bytes| bytes >> 20)
        .filter(|size| *size != 0)
        .unwrap_or(DEFAULT_MEMORY_MB);

    Ok(SourceResourceInfo {
        id: template_id,
        name,
        cpu_count,
        memory_mb,
    })
}

async fn search_disks<K: Connector>(
    connection: &ConnectionManager<K>,
    search: &Search,
) -> Result<Vec<Disk>, BuildError> {
    connection
        .execute(|conn| async move { conn.list_disks(Some(search)).await })
        .await
        .map_err(BuildError::remote(format!("failed to search disks by {search}")))
}

async fn resolve_disk<K: Connector>(
    connection: &ConnectionManager<K>,
    selector: &DiskSelector,
) -> Result<SourceResourceInfo, BuildError> {
    let disk_id = match selector {
        DiskSelector::Id(id) => id.clone(),
        DiskSelector::Name(name) => {
            let mut found = search_disks(connection, &Search::alias(name.clone())).await?;
            if found.is_empty() {
                debug!(disk = %name, "no disk with that alias, trying name search");
                found = search_disks(connection, &Search::name(name.clone())).await?;
            }
            found
                .first()
                .ok_or_else(|| BuildError::DiskNotFound(name.clone()))?
                .id()?
                .to_owned()
        }
    };

    let id_ref = disk_id.as_str();
    let disk = connection
        .execute(|conn| async move { conn.get_disk(id_ref).await })
        .await
        .map_err(|err| {
            if err.is_not_found() {
                BuildError::DiskNotFound(disk_id.clone())
            } else {
                BuildError::remote(format!("failed to read disk {disk_id}"))(err)
            }
        })?;
    info!(
        disk = disk.label(),
        size = disk.provisioned_size.unwrap_or_default(),
        "found source disk"
    );

    let name = match selector {
        DiskSelector::Name(name) => name.clone(),
        DiskSelector::Id(_) => disk.label().to_owned(),
    };
    Ok(SourceResourceInfo {
        id: disk_id,
        name,
        cpu_count: DEFAULT_CPU_COUNT,
        memory_mb: DEFAULT_MEMORY_MB,
    })
}
