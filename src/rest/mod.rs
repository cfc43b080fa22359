//! REST implementation of the engine API.
//!
//! [`RestConnector`] obtains an SSO bearer token and produces
//! [`RestConnection`] sessions that speak the engine's JSON dialect
//! (`Accept: application/json`, `Version: 4`).
//!
//! Transport failures are rendered with the phrases the connection manager
//! recognises as transient: timeouts as `request timeout`, refused or reset
//! sockets as `connection lost`, undecodable bodies as `parse error`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::api::{
    ApiError, ApiFuture, Cluster, Connector, Disk, DiskAttachment, DiskAttachmentRequest,
    DiskCopyRequest, Host, Network, Nic, NicRequest, OlvmConnection, Search,
    TemplateCreateRequest, TemplateRecord, Vm, VmCreateRequest, VmInitialization, VnicProfile,
};
use crate::config::AccessSettings;

mod wire;

use wire::{
    AttachmentList, ClusterList, DiskList, Fault, HostList, NetworkList, NicList, TemplateList,
    TokenResponse, VnicProfileList, WireAttachment, WireDisk, WireNic, WireTemplate, WireVm,
    convert, parse,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SSO_SCOPE: &str = "ovirt-app-api";

/// Builds the SSO token URL from the API URL by dropping the trailing
/// `/api` segment.
fn sso_url(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    let engine = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    format!("{engine}/sso/oauth/token")
}

/// Maps an HTTP status and body to an API error, or `None` on success.
fn status_error(status: StatusCode, body: &str) -> Option<ApiError> {
    if !status.is_client_error() && !status.is_server_error() {
        return None;
    }
    let detail = serde_json::from_str::<Fault>(body)
        .ok()
        .and_then(|fault| fault.message())
        .unwrap_or_else(|| body.trim().to_owned());
    Some(match status {
        StatusCode::UNAUTHORIZED => ApiError::Auth(detail),
        StatusCode::NOT_FOUND => ApiError::NotFound(detail),
        other => ApiError::Remote(format!("HTTP {}: {detail}", other.as_u16())),
    })
}

fn transport_error(err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Remote(format!("request timeout: {err}"))
    } else if err.is_connect() {
        ApiError::Remote(format!("connection lost: {err}"))
    } else if err.is_decode() {
        ApiError::Remote(format!("parse error: {err}"))
    } else {
        ApiError::Remote(err.to_string())
    }
}

fn search_query(search: Option<&Search>) -> Vec<(&'static str, String)> {
    search
        .map(|expression| vec![("search", expression.to_string())])
        .unwrap_or_default()
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(HeaderName::from_static("version"), HeaderValue::from_static("4"));
    headers
}

/// Opens authenticated sessions against the configured engine.
#[derive(Clone, Debug)]
pub struct RestConnector {
    client: Client,
    access: AccessSettings,
}

impl RestConnector {
    /// Creates a connector for `access`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Remote`] when the HTTP client cannot be built.
    pub fn new(access: AccessSettings) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(access.tls_insecure)
            .default_headers(default_headers())
            .build()
            .map_err(|err| ApiError::Remote(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, access })
    }

    async fn token(&self) -> Result<String, ApiError> {
        let url = sso_url(&self.access.url);
        debug!(%url, user = %self.access.username, "requesting SSO token");
        let form = [
            ("grant_type", "password"),
            ("scope", SSO_SCOPE),
            ("username", self.access.username.as_str()),
            ("password", self.access.password.as_str()),
        ];
        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|err| transport_error(&err))?;
        let status = response.status();
        let body = response.text().await.map_err(|err| transport_error(&err))?;
        let token: TokenResponse = parse(&body)?;

        if let Some(access_token) = token.access_token.filter(|value| !value.is_empty()) {
            return Ok(access_token);
        }
        let reason = token
            .error_description
            .or(token.error)
            .unwrap_or_else(|| format!("SSO returned HTTP {}", status.as_u16()));
        Err(ApiError::Auth(reason))
    }
}

impl Connector for RestConnector {
    type Connection = RestConnection;

    fn connect(&self) -> ApiFuture<'_, Self::Connection> {
        Box::pin(async move {
            let token = self.token().await?;
            info!(url = %self.access.url, "authenticated against OLVM");
            Ok(RestConnection {
                inner: Arc::new(Session {
                    client: self.client.clone(),
                    base_url: self.access.url.trim_end_matches('/').to_owned(),
                    token,
                    closed: AtomicBool::new(false),
                }),
            })
        })
    }
}

#[derive(Debug)]
struct Session {
    client: Client,
    base_url: String,
    token: String,
    closed: AtomicBool,
}

/// One authenticated session. Clones share the session.
#[derive(Clone, Debug)]
pub struct RestConnection {
    inner: Arc<Session>,
}

impl RestConnection {
    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.inner.base_url.clone()
        } else {
            format!("{}/{path}", self.inner.base_url)
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<String, ApiError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ApiError::Remote(String::from(
                "connection lost: session closed",
            )));
        }
        let url = self.url(path);
        debug!(%method, %url, "OLVM request");
        let mut request = self
            .inner
            .client
            .request(method, &url)
            .bearer_auth(&self.inner.token)
            .query(query);
        if let Some(payload) = body {
            request = request.json(&payload);
        }
        let response = request.send().await.map_err(|err| transport_error(&err))?;
        let status = response.status();
        let text = response.text().await.map_err(|err| transport_error(&err))?;
        status_error(status, &text).map_or(Ok(text), Err)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let body = self.send(Method::GET, path, query, None).await?;
        parse(&body)
    }

    async fn submit<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Value,
    ) -> Result<T, ApiError> {
        let text = self.send(method, path, query, Some(body)).await?;
        parse(&text)
    }

    async fn act(&self, method: Method, path: &str, body: Option<Value>) -> Result<(), ApiError> {
        self.send(method, path, &[], body).await.map(drop)
    }
}

impl OlvmConnection for RestConnection {
    fn test(&self) -> ApiFuture<'_, ()> {
        Box::pin(async move { self.send(Method::GET, "", &[], None).await.map(drop) })
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(url = %self.inner.base_url, "closed OLVM session");
        }
    }

    fn list_clusters(&self) -> ApiFuture<'_, Vec<Cluster>> {
        Box::pin(async move {
            let list: ClusterList = self.fetch("clusters", &[]).await?;
            Ok(convert(list.cluster))
        })
    }

    fn list_cluster_networks<'a>(&'a self, cluster_id: &'a str) -> ApiFuture<'a, Vec<Network>> {
        Box::pin(async move {
            let list: NetworkList = self
                .fetch(&format!("clusters/{cluster_id}/networks"), &[])
                .await?;
            Ok(convert(list.network))
        })
    }

    fn list_templates<'a>(
        &'a self,
        search: Option<&'a Search>,
    ) -> ApiFuture<'a, Vec<TemplateRecord>> {
        Box::pin(async move {
            let list: TemplateList = self.fetch("templates", &search_query(search)).await?;
            Ok(convert(list.template))
        })
    }

    fn get_template<'a>(&'a self, template_id: &'a str) -> ApiFuture<'a, TemplateRecord> {
        Box::pin(async move {
            let template: WireTemplate = self.fetch(&format!("templates/{template_id}"), &[]).await?;
            Ok(template.into())
        })
    }

    fn add_template<'a>(
        &'a self,
        request: &'a TemplateCreateRequest,
    ) -> ApiFuture<'a, TemplateRecord> {
        Box::pin(async move {
            let query = [("seal", request.seal.to_string())];
            let template: WireTemplate = self
                .submit(Method::POST, "templates", &query, wire::template_body(request))
                .await?;
            Ok(template.into())
        })
    }

    fn get_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, Vm> {
        Box::pin(async move {
            let vm: WireVm = self.fetch(&format!("vms/{vm_id}"), &[]).await?;
            Ok(vm.into())
        })
    }

    fn add_vm<'a>(&'a self, request: &'a VmCreateRequest) -> ApiFuture<'a, Vm> {
        Box::pin(async move {
            let vm: WireVm = self
                .submit(Method::POST, "vms", &[], wire::vm_body(request))
                .await?;
            Ok(vm.into())
        })
    }

    fn update_vm_initialization<'a>(
        &'a self,
        vm_id: &'a str,
        initialization: &'a VmInitialization,
    ) -> ApiFuture<'a, Vm> {
        Box::pin(async move {
            let vm: WireVm = self
                .submit(
                    Method::PUT,
                    &format!("vms/{vm_id}"),
                    &[],
                    wire::initialization_body(initialization),
                )
                .await?;
            Ok(vm.into())
        })
    }

    fn start_vm<'a>(&'a self, vm_id: &'a str, use_cloud_init: bool) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let body = serde_json::json!({ "use_cloud_init": use_cloud_init });
            self.act(Method::POST, &format!("vms/{vm_id}/start"), Some(body))
                .await
        })
    }

    fn stop_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.act(
                Method::POST,
                &format!("vms/{vm_id}/stop"),
                Some(serde_json::json!({})),
            )
            .await
        })
    }

    fn remove_vm<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move { self.act(Method::DELETE, &format!("vms/{vm_id}"), None).await })
    }

    fn list_disks<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Disk>> {
        Box::pin(async move {
            let list: DiskList = self.fetch("disks", &search_query(search)).await?;
            Ok(convert(list.disk))
        })
    }

    fn get_disk<'a>(&'a self, disk_id: &'a str) -> ApiFuture<'a, Disk> {
        Box::pin(async move {
            let disk: WireDisk = self.fetch(&format!("disks/{disk_id}"), &[]).await?;
            Ok(disk.into())
        })
    }

    fn copy_disk<'a>(
        &'a self,
        disk_id: &'a str,
        request: &'a DiskCopyRequest,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.act(
                Method::POST,
                &format!("disks/{disk_id}/copy"),
                Some(wire::disk_copy_body(request)),
            )
            .await
        })
    }

    fn remove_disk<'a>(&'a self, disk_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move { self.act(Method::DELETE, &format!("disks/{disk_id}"), None).await })
    }

    fn list_disk_attachments<'a>(
        &'a self,
        vm_id: &'a str,
    ) -> ApiFuture<'a, Vec<DiskAttachment>> {
        Box::pin(async move {
            let list: AttachmentList = self
                .fetch(&format!("vms/{vm_id}/diskattachments"), &[])
                .await?;
            Ok(convert(list.disk_attachment))
        })
    }

    fn add_disk_attachment<'a>(
        &'a self,
        vm_id: &'a str,
        request: &'a DiskAttachmentRequest,
    ) -> ApiFuture<'a, DiskAttachment> {
        Box::pin(async move {
            let attachment: WireAttachment = self
                .submit(
                    Method::POST,
                    &format!("vms/{vm_id}/diskattachments"),
                    &[],
                    wire::attachment_body(request),
                )
                .await?;
            Ok(attachment.into())
        })
    }

    fn list_networks<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Network>> {
        Box::pin(async move {
            let list: NetworkList = self.fetch("networks", &search_query(search)).await?;
            Ok(convert(list.network))
        })
    }

    fn list_vnic_profiles(&self) -> ApiFuture<'_, Vec<VnicProfile>> {
        Box::pin(async move {
            let list: VnicProfileList = self.fetch("vnicprofiles", &[]).await?;
            Ok(convert(list.vnic_profile))
        })
    }

    fn list_nics<'a>(&'a self, vm_id: &'a str) -> ApiFuture<'a, Vec<Nic>> {
        Box::pin(async move {
            let list: NicList = self.fetch(&format!("vms/{vm_id}/nics"), &[]).await?;
            Ok(convert(list.nic))
        })
    }

    fn add_nic<'a>(&'a self, vm_id: &'a str, request: &'a NicRequest) -> ApiFuture<'a, Nic> {
        Box::pin(async move {
            let nic: WireNic = self
                .submit(
                    Method::POST,
                    &format!("vms/{vm_id}/nics"),
                    &[],
                    wire::nic_body(request),
                )
                .await?;
            Ok(nic.into())
        })
    }

    fn update_nic<'a>(
        &'a self,
        vm_id: &'a str,
        nic_id: &'a str,
        request: &'a NicRequest,
    ) -> ApiFuture<'a, Nic> {
        Box::pin(async move {
            let nic: WireNic = self
                .submit(
                    Method::PUT,
                    &format!("vms/{vm_id}/nics/{nic_id}"),
                    &[],
                    wire::nic_body(request),
                )
                .await?;
            Ok(nic.into())
        })
    }

    fn remove_nic<'a>(&'a self, vm_id: &'a str, nic_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.act(Method::DELETE, &format!("vms/{vm_id}/nics/{nic_id}"), None)
                .await
        })
    }

    fn list_hosts<'a>(&'a self, search: Option<&'a Search>) -> ApiFuture<'a, Vec<Host>> {
        Box::pin(async move {
            let list: HostList = self.fetch("hosts", &search_query(search)).await?;
            Ok(convert(list.host))
        })
    }
}

#[cfg(test)]
mod tests;
