//! Transport speaking to a hypervisor management gateway over HTTP.
//!
//! Routes (relative to the configured base URL):
//! - `POST   /api/session`
//! - `GET    /api/objects/{kind}/{value}/properties/{name}`
//! - `GET    /api/snapshots/{snapshot}/disks/{key}/blocks?offset=&length=`
//! - `GET    /api/snapshots/{snapshot}/disks/{key}/changed-areas?since=&changeId=&startOffset=`
//! - `POST   /api/vms/{vm}/snapshots`
//! - `DELETE /api/snapshots/{snapshot}`
//!
//! Error bodies are `{"error": "...", "code": "..."}`. A `409` with code
//! `tracking_unavailable` means change tracking is off for the disk.

use super::{ChangedAreas, Session, Transport};
use crate::cbt::checkpoint::Checkpoint;
use crate::cbt::extent::BlockExtent;
use crate::inventory::disk::VirtualDisk;
use crate::inventory::entity::ManagedRef;
use crate::utils::{AgentError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: Option<String>,
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
    session_id: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            session_id: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request;
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        let session = self.session_id.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| classify_request_error(e, what))?;

        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response, what).await)
    }
}

fn classify_request_error(err: reqwest::Error, what: &str) -> AgentError {
    if err.is_connect() {
        AgentError::Connection(format!("{}: {}", what, err))
    } else if err.is_timeout() || err.is_request() || err.is_body() {
        AgentError::RemoteUnavailable(format!("{}: {}", what, err))
    } else if err.is_decode() {
        AgentError::RemoteProtocol(format!("{}: {}", what, err))
    } else {
        AgentError::Http(err)
    }
}

async fn error_from_response(response: Response, what: &str) -> AgentError {
    let status = response.status();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    let message = if body.error.is_empty() {
        format!("{} returned {}", what, status)
    } else {
        format!("{}: {}", what, body.error)
    };

    match status {
        StatusCode::NOT_FOUND => AgentError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::AccessDenied(message),
        StatusCode::CONFLICT if body.code.as_deref() == Some("tracking_unavailable") => {
            AgentError::TrackingUnavailable(message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => AgentError::RemoteUnavailable(message),
        s if s.is_server_error() => AgentError::RemoteUnavailable(message),
        _ => AgentError::RemoteProtocol(message),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<Session> {
        let request = self.client.post(self.url("/api/session"));
        let response = self.send(request, "session login").await?;
        let session: Session = response
            .json()
            .await
            .map_err(|e| AgentError::RemoteProtocol(format!("session login: {}", e)))?;

        *self.session_id.write().unwrap_or_else(|e| e.into_inner()) = Some(session.session_id.clone());
        info!(
            endpoint = %self.base_url,
            instance = %session.instance_uuid,
            "Connected to management endpoint"
        );
        Ok(session)
    }

    async fn read_property(&self, object: &ManagedRef, property: &str) -> Result<serde_json::Value> {
        let path = format!(
            "/api/objects/{}/{}/properties/{}",
            object.kind, object.value, property
        );
        let what = format!("read {} of {}", property, object);
        let response = self.send(self.client.get(self.url(&path)), &what).await?;
        response
            .json()
            .await
            .map_err(|e| AgentError::RemoteProtocol(format!("{}: {}", what, e)))
    }

    async fn read_blocks(
        &self,
        snapshot: &ManagedRef,
        disk: &VirtualDisk,
        extent: BlockExtent,
    ) -> Result<Bytes> {
        let path = format!("/api/snapshots/{}/disks/{}/blocks", snapshot.value, disk.key);
        let request = self.client.get(self.url(&path)).query(&[
            ("offset", extent.offset),
            ("length", extent.length),
        ]);
        let what = format!("read {} of {}", extent, disk.label);
        let response = self.send(request, &what).await?;
        let data = response
            .bytes()
            .await
            .map_err(|e| AgentError::RemoteUnavailable(format!("{}: {}", what, e)))?;
        debug!(disk = %disk.label, %extent, bytes = data.len(), "Read blocks");
        Ok(data)
    }

    async fn query_changed_areas(
        &self,
        snapshot: &ManagedRef,
        disk: &VirtualDisk,
        since: &Checkpoint,
        start_offset: u64,
    ) -> Result<ChangedAreas> {
        let path = format!("/api/snapshots/{}/disks/{}/changed-areas", snapshot.value, disk.key);
        let mut query = vec![
            ("since", since.snapshot.value.clone()),
            ("startOffset", start_offset.to_string()),
        ];
        if let Some(change_id) = &since.change_id {
            query.push(("changeId", change_id.clone()));
        }

        let what = format!("changed areas of {}", disk.label);
        let response = self
            .send(self.client.get(self.url(&path)).query(&query), &what)
            .await?;
        response
            .json()
            .await
            .map_err(|e| AgentError::RemoteProtocol(format!("{}: {}", what, e)))
    }

    async fn create_snapshot(&self, vm: &ManagedRef, name: &str, description: &str) -> Result<ManagedRef> {
        let path = format!("/api/vms/{}/snapshots", vm.value);
        let body = serde_json::json!({
            "name": name,
            "description": description,
            "memory": false,
            "quiesce": true,
        });
        let what = format!("create snapshot of {}", vm);
        let response = self.send(self.client.post(self.url(&path)).json(&body), &what).await?;
        response
            .json()
            .await
            .map_err(|e| AgentError::RemoteProtocol(format!("{}: {}", what, e)))
    }

    async fn remove_snapshot(&self, snapshot: &ManagedRef) -> Result<()> {
        let path = format!("/api/snapshots/{}", snapshot.value);
        self.send(self.client.delete(self.url(&path)), &format!("remove {}", snapshot))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    async fn session() -> impl IntoResponse {
        Json(json!({"sessionId": "sess-1", "instanceUuid": "vc-http"}))
    }

    async fn property(
        headers: HeaderMap,
        Path((kind, value, name)): Path<(String, String, String)>,
    ) -> axum::response::Response {
        if headers.get(SESSION_HEADER).is_none() {
            return (AxumStatus::UNAUTHORIZED, Json(json!({"error": "no session"}))).into_response();
        }
        match (kind.as_str(), value.as_str(), name.as_str()) {
            ("VirtualMachine", "vm-1", "name") => Json(json!("web-01")).into_response(),
            ("VirtualMachine", "vm-1", "guest") => {
                (AxumStatus::FORBIDDEN, Json(json!({"error": "no privilege"}))).into_response()
            }
            ("VirtualMachine", "vm-busy", _) => AxumStatus::SERVICE_UNAVAILABLE.into_response(),
            _ => (AxumStatus::NOT_FOUND, Json(json!({"error": "no such object"}))).into_response(),
        }
    }

    async fn blocks(Query(params): Query<HashMap<String, u64>>) -> impl IntoResponse {
        let length = params.get("length").copied().unwrap_or(0) as usize;
        vec![0xabu8; length]
    }

    async fn changed_areas(
        Path((_snapshot, key)): Path<(String, i32)>,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        if key == 2001 {
            return (
                AxumStatus::CONFLICT,
                Json(json!({"error": "cbt off", "code": "tracking_unavailable"})),
            )
                .into_response();
        }
        let start: u64 = params.get("startOffset").and_then(|s| s.parse().ok()).unwrap_or(0);
        Json(json!({
            "startOffset": start,
            "length": 100 - start,
            "changedArea": [{"offset": 10, "length": 10}]
        }))
        .into_response()
    }

    async fn spawn_gateway() -> String {
        let app = Router::new()
            .route("/api/session", post(session))
            .route("/api/objects/{kind}/{value}/properties/{name}", get(property))
            .route("/api/snapshots/{snapshot}/disks/{key}/blocks", get(blocks))
            .route("/api/snapshots/{snapshot}/disks/{key}/changed-areas", get(changed_areas));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn disk(key: i32) -> VirtualDisk {
        VirtualDisk {
            key,
            label: format!("disk-{}", key),
            uuid: format!("uuid-{}", key),
            capacity_bytes: 100,
            backing_path: "[ds] d.vmdk".into(),
            change_tracking_enabled: true,
            change_id: None,
        }
    }

    #[tokio::test]
    async fn test_session_and_property_read() {
        let url = spawn_gateway().await;
        let transport = HttpTransport::new(&url, "secret", Duration::from_secs(5)).unwrap();

        let session = transport.connect().await.unwrap();
        assert_eq!(session.instance_uuid, "vc-http");

        let name = transport.read_property(&ManagedRef::vm("vm-1"), "name").await.unwrap();
        assert_eq!(name, json!("web-01"));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_error_taxonomy() {
        let url = spawn_gateway().await;
        let transport = HttpTransport::new(&url, "", Duration::from_secs(5)).unwrap();
        transport.connect().await.unwrap();

        let denied = transport.read_property(&ManagedRef::vm("vm-1"), "guest").await.unwrap_err();
        assert!(matches!(denied, AgentError::AccessDenied(_)));

        let missing = transport.read_property(&ManagedRef::vm("vm-2"), "name").await.unwrap_err();
        assert!(matches!(missing, AgentError::NotFound(_)));

        let busy = transport.read_property(&ManagedRef::vm("vm-busy"), "name").await.unwrap_err();
        assert!(busy.is_transient());
    }

    #[tokio::test]
    async fn test_read_blocks_and_changed_areas() {
        let url = spawn_gateway().await;
        let transport = HttpTransport::new(&url, "", Duration::from_secs(5)).unwrap();
        transport.connect().await.unwrap();
        let snapshot = ManagedRef::snapshot("snapshot-2");

        let data = transport
            .read_blocks(&snapshot, &disk(2000), BlockExtent::new(0, 16))
            .await
            .unwrap();
        assert_eq!(data.len(), 16);

        let since = Checkpoint {
            snapshot: ManagedRef::snapshot("snapshot-1"),
            change_id: Some("52/1".into()),
            capacity_bytes: 100,
            operation_id: uuid::Uuid::new_v4(),
            completed_at: chrono::Utc::now(),
        };
        let areas = transport
            .query_changed_areas(&snapshot, &disk(2000), &since, 0)
            .await
            .unwrap();
        assert_eq!(areas.length, 100);
        assert_eq!(areas.changed_area, vec![BlockExtent::new(10, 10)]);

        let err = transport
            .query_changed_areas(&snapshot, &disk(2001), &since, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TrackingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::new(&format!("http://{}", addr), "", Duration::from_secs(2)).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_transient());
    }
}
