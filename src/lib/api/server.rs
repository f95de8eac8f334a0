use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State as AxumState, rejection::JsonRejection},
    http::StatusCode,
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::types::{
    AccessRequest, CreateTaskRequest, CreateTaskResponse, HealthResponse, MessageResponse,
    ResizeTaskRequest, ResourcesResponse, TaskListResponse, TaskNamesResponse, TaskServer,
    ValidateTokenRequest, ValidateTokenResponse,
};
use crate::lib::access::types::AccessLink;
use crate::lib::error::{ControllerError, ControllerResult};
use crate::lib::manager::types::Manager;
use crate::lib::tasks::types::Task;

type ServerState = AxumState<Arc<TaskServer>>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ControllerResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ControllerError::InvalidInput(rejection.body_text()))
}

impl TaskServer {
    pub fn new(manager: Arc<Manager>, address: SocketAddr, cors_origins: Vec<String>) -> Self {
        Self {
            manager,
            address,
            cors_origins,
        }
    }

    async fn health() -> Json<HealthResponse> {
        Json(HealthResponse { status: "ok" })
    }

    async fn available_resources(AxumState(server): ServerState) -> Json<ResourcesResponse> {
        Json(server.manager.available_resources().into())
    }

    async fn task_names(AxumState(server): ServerState) -> Json<TaskNamesResponse> {
        Json(TaskNamesResponse {
            tasks: server.manager.task_names(),
        })
    }

    async fn list_tasks(AxumState(server): ServerState) -> Json<TaskListResponse> {
        let tasks = server.manager.list_tasks().into_iter().map(Into::into).collect();
        Json(TaskListResponse { tasks })
    }

    async fn get_task(
        AxumState(server): ServerState,
        Path(task_name): Path<String>,
    ) -> ControllerResult<Json<Task>> {
        server.manager.get_task(&task_name).map(Json)
    }

    async fn create_pod(
        AxumState(server): ServerState,
        payload: Result<Json<CreateTaskRequest>, JsonRejection>,
    ) -> ControllerResult<(StatusCode, Json<CreateTaskResponse>)> {
        let request = body(payload)?;
        let created = server
            .manager
            .create_task(&request.task_name, &request.image_name, request.cpus, request.gpus)
            .await?;

        let message = match &created.service_url {
            Some(url) => format!("Task {} created and exposed at {url}", created.task.name),
            None => format!("Task {} created but is not exposed yet", created.task.name),
        };
        Ok((
            StatusCode::CREATED,
            Json(CreateTaskResponse {
                message,
                pod_name: created.task.name,
                service_url: created.service_url,
            }),
        ))
    }

    async fn add_resources(
        AxumState(server): ServerState,
        payload: Result<Json<ResizeTaskRequest>, JsonRejection>,
    ) -> ControllerResult<Json<MessageResponse>> {
        let request = body(payload)?;
        let task = server
            .manager
            .resize_task(&request.task_name, request.cpus, request.gpus)
            .await?;
        Ok(Json(MessageResponse {
            message: format!("Task {} now holds {}", task.name, task.resources()),
        }))
    }

    async fn delete_task(
        AxumState(server): ServerState,
        Path(task_name): Path<String>,
    ) -> ControllerResult<Json<MessageResponse>> {
        let task = server.manager.delete_task(&task_name).await?;
        Ok(Json(MessageResponse {
            message: format!("Task {} deleted", task.name),
        }))
    }

    async fn access_jupyter(
        AxumState(server): ServerState,
        payload: Result<Json<AccessRequest>, JsonRejection>,
    ) -> ControllerResult<Json<AccessLink>> {
        let request = body(payload)?;
        server
            .manager
            .access_link(&request.service_name, request.port)
            .await
            .map(Json)
    }

    async fn validate_token(
        AxumState(server): ServerState,
        payload: Result<Json<ValidateTokenRequest>, JsonRejection>,
    ) -> ControllerResult<Json<ValidateTokenResponse>> {
        let request = body(payload)?;
        let valid = server
            .manager
            .validate_token(&request.service_name, request.port, &request.token);
        Ok(Json(ValidateTokenResponse { valid }))
    }

    fn cors_layer(&self) -> CorsLayer {
        if self.cors_origins.is_empty() {
            return CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
        }
        let origins: Vec<_> = self
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }

    pub fn router(self) -> Router {
        let cors = self.cors_layer();
        Router::new()
            .route("/health", get(TaskServer::health))
            .route("/available-resources", get(TaskServer::available_resources))
            .route("/tasks", get(TaskServer::task_names))
            .route("/tasks/{taskName}", get(TaskServer::get_task))
            .route("/list-tasks", get(TaskServer::list_tasks))
            .route("/create-pod", post(TaskServer::create_pod))
            .route("/add-resources", post(TaskServer::add_resources))
            .route("/delete-task/{taskName}", delete(TaskServer::delete_task))
            .route("/access-jupyter", post(TaskServer::access_jupyter))
            .route("/validate-token", post(TaskServer::validate_token))
            .with_state(Arc::new(self))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    pub async fn start_server(self) -> anyhow::Result<()> {
        let address = self.address;
        let app = self.router();

        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        info!(%address, "task server listening");

        axum::serve(listener, app).await.context("task server stopped")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::config::ControllerConfig;
    use crate::lib::ledger::types::Resources;
    use crate::lib::substrate::memory::{MemorySubstrate, Operation};
    use crate::lib::substrate::types::SubstrateError;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemorySubstrate>) {
        let substrate = Arc::new(MemorySubstrate::new(Resources::new(8, 2)));
        let manager = Manager::new(
            &ControllerConfig::default(),
            substrate.clone(),
            Resources::new(8, 2),
        );
        let server = TaskServer::new(
            Arc::new(manager),
            "127.0.0.1:0".parse().unwrap(),
            Vec::new(),
        );
        (server.router(), substrate)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(app: &Router, name: &str, cpus: Value, gpus: Value) -> (StatusCode, Value) {
        send(
            app,
            Method::POST,
            "/create-pod",
            Some(json!({
                "taskName": name,
                "imageName": "jupyter/base-notebook",
                "cpus": cpus,
                "gpus": gpus,
            })),
        )
        .await
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = app();
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (app, _) = app();
        let (status, body) = create(&app, "My Notebook", json!("4"), json!("1")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["podName"], "my-notebook");
        assert_eq!(body["serviceURL"], "http://localhost:30000");

        let (_, body) = send(&app, Method::GET, "/available-resources", None).await;
        assert_eq!(
            body,
            json!({"totalAllocatableGPUs": 2, "freeGPUs": 1, "totalAllocatableCPUs": 8, "freeCPUs": 4})
        );

        let (_, body) = send(&app, Method::GET, "/tasks", None).await;
        assert_eq!(body, json!({"tasks": ["my-notebook"]}));

        let (_, body) = send(&app, Method::GET, "/list-tasks", None).await;
        assert_eq!(
            body,
            json!({"tasks": [{
                "name": "my-notebook",
                "imageName": "jupyter/base-notebook",
                "cpus": 4,
                "gpus": 1,
                "nodePort": 30000
            }]})
        );

        let (status, body) = send(&app, Method::GET, "/tasks/my-notebook", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "EXPOSED");
        assert_eq!(body["serviceName"], "my-notebook-service");
    }

    #[tokio::test]
    async fn test_error_kinds_and_statuses() {
        let (app, substrate) = app();
        create(&app, "t1", json!(4), json!(1)).await;

        let (status, body) = create(&app, "t2", json!(6), json!(1)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "insufficient_capacity");

        let (status, body) = create(&app, "t1", json!(1), json!(0)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_exists");

        let (status, body) = create(&app, "t3", json!("lots"), json!(0)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");

        substrate.fail_next(Operation::Launch, SubstrateError::Unavailable("daemon down".into()));
        let (status, body) = create(&app, "t4", json!(1), json!(0)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "substrate_unavailable");
        assert_eq!(body["retryable"], true);

        let (status, body) = send(&app, Method::DELETE, "/delete-task/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_add_resources() {
        let (app, _) = app();
        create(&app, "t1", json!(4), json!(1)).await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/add-resources",
            Some(json!({"taskName": "t1", "cpus": "6", "gpus": "1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, Method::GET, "/available-resources", None).await;
        assert_eq!(body["freeCPUs"], 2);
        assert_eq!(body["freeGPUs"], 1);
    }

    #[tokio::test]
    async fn test_access_jupyter_and_validate() {
        let (app, _) = app();
        create(&app, "nb", json!(1), json!(0)).await;

        let (status, link) = send(
            &app,
            Method::POST,
            "/access-jupyter",
            Some(json!({"serviceName": "nb-service", "port": "30080"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = link["token"].as_str().unwrap().to_string();
        assert_eq!(link["url"], format!("http://localhost:30080/?token={token}"));
        assert!(link["expiresAt"].is_string());

        let (_, body) = send(
            &app,
            Method::POST,
            "/validate-token",
            Some(json!({"serviceName": "nb-service", "port": 30080, "token": token})),
        )
        .await;
        assert_eq!(body, json!({"valid": true}));

        let (status, body) = send(
            &app,
            Method::POST,
            "/access-jupyter",
            Some(json!({"serviceName": "nb-service", "port": 80})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }

    #[tokio::test]
    async fn test_add_resources_requires_gpus() {
        let (app, _) = app();
        create(&app, "t1", json!(4), json!(1)).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/add-resources",
            Some(json!({"taskName": "t1", "cpus": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");

        let (_, body) = send(&app, Method::GET, "/available-resources", None).await;
        assert_eq!(body["freeGPUs"], 1);
    }

    #[tokio::test]
    async fn test_delete_returns_capacity() {
        let (app, _) = app();
        create(&app, "t1", json!(4), json!(1)).await;

        let (status, _) = send(&app, Method::DELETE, "/delete-task/t1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, Method::GET, "/tasks", None).await;
        assert_eq!(body, json!({"tasks": []}));
        let (_, body) = send(&app, Method::GET, "/available-resources", None).await;
        assert_eq!(body["freeCPUs"], 8);
        assert_eq!(body["freeGPUs"], 2);
    }
}
