//! Local HTTP API over the control plane.
//!
//! Serves workflow listing and creation plus template listing on a
//! loopback port; port 0 auto-assigns and the chosen port is observable
//! via [`ApiServer::port`] after start.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{Registry, WorkflowRecord};
use crate::headless::client::ProviderKind;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub workdir: String,
    #[serde(default)]
    pub remote: Option<String>,
    pub provider: ProviderKind,
}

/// Collaborator that actually creates workflows; the server only routes.
#[async_trait]
pub trait WorkflowCreator: Send + Sync {
    async fn create(&self, request: CreateWorkflowRequest) -> eyre::Result<WorkflowRecord>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    pub name: String,
    pub description: String,
}

pub trait TemplateSource: Send + Sync {
    fn templates(&self) -> Vec<TemplateInfo>;
}

/// Built-in template registry.
pub struct StaticTemplates {
    templates: Vec<TemplateInfo>,
}

impl StaticTemplates {
    pub fn new(templates: Vec<TemplateInfo>) -> Self {
        Self { templates }
    }
}

impl Default for StaticTemplates {
    fn default() -> Self {
        Self::new(vec![
            TemplateInfo {
                name: "solo".to_string(),
                description: "One worker, no review loop".to_string(),
            },
            TemplateInfo {
                name: "review-loop".to_string(),
                description: "Implementer plus reviewer trading phases".to_string(),
            },
            TemplateInfo {
                name: "swarm".to_string(),
                description: "Several workers pulling from the task channel".to_string(),
            },
        ])
    }
}

impl TemplateSource for StaticTemplates {
    fn templates(&self) -> Vec<TemplateInfo> {
        self.templates.clone()
    }
}

#[derive(Clone)]
struct ApiContext {
    registry: Arc<dyn Registry>,
    creator: Arc<dyn WorkflowCreator>,
    templates: Arc<dyn TemplateSource>,
}

pub struct ApiServer {
    port: u16,
    cancel: CancellationToken,
}

impl ApiServer {
    pub async fn start(
        port: u16,
        registry: Arc<dyn Registry>,
        creator: Arc<dyn WorkflowCreator>,
        templates: Arc<dyn TemplateSource>,
    ) -> Result<Self, ApiError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let cancel = CancellationToken::new();
        let context = ApiContext {
            registry,
            creator,
            templates,
        };

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, peer) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                warn!(%err, "accept failed");
                                continue;
                            },
                        },
                    };
                    debug!(%peer, "api connection");
                    let context = context.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let context = context.clone();
                            async move {
                                Ok::<_, std::convert::Infallible>(handle(context, req).await)
                            }
                        });
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(%err, "api connection error");
                        }
                    });
                }
            });
        }

        info!(port, "api server listening");
        Ok(Self { port, cancel })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle(context: ApiContext, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::GET && path == "/workflows" {
        return match context.registry.list() {
            Ok(workflows) => {
                json_response(StatusCode::OK, &serde_json::json!({ "workflows": workflows }))
            },
            Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        };
    }

    if method == Method::POST && path == "/workflows" {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        };
        let request: CreateWorkflowRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        };
        return match context.creator.create(request).await {
            Ok(record) => {
                json_response(StatusCode::CREATED, &serde_json::json!({ "workflow": record }))
            },
            Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        };
    }

    if method == Method::GET && path == "/templates" {
        return json_response(
            StatusCode::OK,
            &serde_json::json!({ "templates": context.templates.templates() }),
        );
    }

    error_response(StatusCode::NOT_FOUND, "no such route")
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}
