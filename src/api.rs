use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};

use crate::session::SessionStore;
use crate::task::{NewTask, NewTaskBody, Task, TaskId, TaskPatch, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Unauthorized,
    Validation,
    NotFound,
    Server,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("task API error ({status}): {}", .message.as_deref().unwrap_or("no message"))]
    Status {
        status: u16,
        message: Option<String>,
    },

    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(Url),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err)
        } else {
            Self::Transport(err)
        }
    }
}

impl ApiError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) => FailureKind::Network,
            Self::Decode(_) | Self::InvalidBaseUrl(_) => FailureKind::Server,
            Self::Status { status, .. } => match status {
                401 | 403 => FailureKind::Unauthorized,
                400 | 422 => FailureKind::Validation,
                404 => FailureKind::NotFound,
                _ => FailureKind::Server,
            },
        }
    }

    /// Message fit for the status line: the server's own words when it gave
    /// some, otherwise a generic description of the failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Status {
                message: Some(message),
                ..
            } if !message.trim().is_empty() => message.clone(),
            Self::Status { status, .. } => match self.kind() {
                FailureKind::Unauthorized => "Your session has expired, please log in again".into(),
                FailureKind::NotFound => "The task no longer exists".into(),
                _ => format!("The server responded with status {status}"),
            },
            Self::Transport(_) => "Network error: could not reach the task server".into(),
            Self::Decode(_) => "The server sent a response that could not be read".into(),
            Self::InvalidBaseUrl(url) => format!("Invalid API address: {url}"),
        }
    }
}

#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ApiError>;

    async fn create_task(&self, task: &NewTask) -> Result<Task, ApiError>;

    async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), ApiError>;

    async fn delete_task(&self, id: &TaskId) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    /// Full name, sent when registering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Login,
    Register,
}

impl AuthMode {
    fn path(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpTaskApi {
    client: reqwest::Client,
    api_url: Url,
    session: SessionStore,
}

impl HttpTaskApi {
    /// * `api_url` - Base URL, e.g. `http://host:5000/api/v1`.
    pub fn new(api_url: Url, session: SessionStore) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, session)
    }

    pub fn with_client(client: reqwest::Client, api_url: Url, session: SessionStore) -> Self {
        Self {
            client,
            api_url,
            session,
        }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// The token is returned rather than stored so the caller decides when the
    /// session begins.
    pub async fn authenticate(
        &self,
        mode: AuthMode,
        credentials: &Credentials,
    ) -> Result<String, ApiError> {
        let request = self.auth_request(mode, credentials)?;
        let response: AuthResponse = self.fetch_json(request).await?;
        tracing::info!(mode = ?mode, email = %credentials.email, "Authenticated");
        Ok(response.token)
    }

    // ---- request builders ----

    pub(crate) fn auth_request(
        &self,
        mode: AuthMode,
        credentials: &Credentials,
    ) -> Result<reqwest::Request, ApiError> {
        let url = self.endpoint(&["auth", mode.path()])?;
        Ok(self.client.post(url).json(credentials).build()?)
    }

    pub(crate) fn list_request(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<reqwest::Request, ApiError> {
        let url = self.endpoint(&["task"])?;
        let mut builder = self.authorized(Method::GET, url);
        if let Some(status) = status {
            builder = builder.query(&[("status", status.as_str())]);
        }
        Ok(builder.build()?)
    }

    pub(crate) fn create_request(&self, task: &NewTask) -> Result<reqwest::Request, ApiError> {
        let url = self.endpoint(&["task"])?;
        let builder = self.authorized(Method::POST, url);
        let builder = match &task.image {
            None => builder.json(&NewTaskBody::from(task)),
            Some(image) => {
                let part = Part::bytes(image.bytes.clone())
                    .file_name(image.file_name.clone())
                    .mime_str(&image.mime_type)?;
                let form = Form::new()
                    .text("title", task.title.clone())
                    .text("description", task.description.clone())
                    .text("status", task.status.as_str())
                    .text("deadline", task.deadline.format("%Y-%m-%d").to_string())
                    .part("image", part);
                builder.multipart(form)
            }
        };
        Ok(builder.build()?)
    }

    pub(crate) fn update_request(
        &self,
        id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<reqwest::Request, ApiError> {
        let url = self.endpoint(&["task", id.as_str()])?;
        Ok(self.authorized(Method::PUT, url).json(patch).build()?)
    }

    pub(crate) fn delete_request(&self, id: &TaskId) -> Result<reqwest::Request, ApiError> {
        let url = self.endpoint(&["task", id.as_str()])?;
        Ok(self.authorized(Method::DELETE, url).build()?)
    }

    // ---- private helpers ----

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidBaseUrl(self.api_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match self.session.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response, ApiError> {
        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(%method, %url, "Sending task API request");

        let result = match self.client.execute(request).await {
            Ok(response) => Self::ensure_success(response).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = &result {
            tracing::warn!(%method, %url, error = %err, "Task API request failed");
        }
        result
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::Request,
    ) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }

    /// Ensure the response has a success status code. On failure the body is
    /// read for a server-provided `message`.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            message: server_message(&body),
        })
    }
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ApiError> {
        let request = self.list_request(status)?;
        self.fetch_json(request).await
    }

    async fn create_task(&self, task: &NewTask) -> Result<Task, ApiError> {
        let request = self.create_request(task)?;
        self.fetch_json(request).await
    }

    async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<(), ApiError> {
        let request = self.update_request(id, patch)?;
        self.send(request).await?;
        Ok(())
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), ApiError> {
        let request = self.delete_request(id)?;
        self.send(request).await?;
        Ok(())
    }
}

fn server_message(body: &str) -> Option<String> {
    let body = serde_json::from_str::<ErrorBody>(body).ok()?;
    [body.message, body.error]
        .into_iter()
        .flatten()
        .find(|message| !message.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::NaiveDate;
    use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

    use super::*;
    use crate::task::ImageUpload;

    fn api(token: Option<&str>) -> HttpTaskApi {
        let session = SessionStore::in_memory();
        if let Some(token) = token {
            session.set_token(token).unwrap();
        }
        HttpTaskApi::new(Url::parse("http://tasks.test/api/v1").unwrap(), session)
    }

    fn body_json(request: &reqwest::Request) -> serde_json::Value {
        let bytes = request.body().and_then(|b| b.as_bytes()).unwrap();
        serde_json::from_slice(bytes).unwrap()
    }

    fn new_task() -> NewTask {
        NewTask::new(
            "Ship release",
            "tag and publish",
            TaskStatus::Pending,
            NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
        )
    }

    #[test]
    fn list_request_carries_bearer_token_and_filter() {
        let request = api(Some("tok-1"))
            .list_request(Some(TaskStatus::InProgress))
            .unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(
            request.url().as_str(),
            "http://tasks.test/api/v1/task?status=in-progress"
        );
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer tok-1");
    }

    #[test]
    fn register_posts_name_and_credentials_without_token() {
        let credentials = Credentials {
            name: Some("Ada Lovelace".into()),
            email: "ada@example.com".into(),
            password: "hunter2".into(),
        };
        let request = api(None)
            .auth_request(AuthMode::Register, &credentials)
            .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/api/v1/auth/register");
        assert!(request.headers().get(AUTHORIZATION).is_none());
        assert_eq!(
            body_json(&request),
            serde_json::json!({
                "name": "Ada Lovelace",
                "email": "ada@example.com",
                "password": "hunter2",
            })
        );
    }

    #[test]
    fn login_body_leaves_out_name() {
        let credentials = Credentials {
            name: None,
            email: "ada@example.com".into(),
            password: "hunter2".into(),
        };
        let request = api(None).auth_request(AuthMode::Login, &credentials).unwrap();
        assert_eq!(request.url().path(), "/api/v1/auth/login");
        assert_eq!(
            body_json(&request),
            serde_json::json!({ "email": "ada@example.com", "password": "hunter2" })
        );
    }

    #[test]
    fn requests_without_token_are_still_built() {
        let request = api(None).list_request(None).unwrap();
        assert_eq!(request.url().as_str(), "http://tasks.test/api/v1/task");
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn update_request_sends_partial_fields() {
        let request = api(Some("t"))
            .update_request(&TaskId::new("abc"), &TaskPatch::status(TaskStatus::Completed))
            .unwrap();
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.url().path(), "/api/v1/task/abc");
        assert_eq!(body_json(&request), serde_json::json!({ "status": "completed" }));
    }

    #[test]
    fn task_ids_are_path_escaped() {
        let request = api(None).delete_request(&TaskId::new("a/b")).unwrap();
        assert_eq!(request.method(), Method::DELETE);
        assert_eq!(request.url().path(), "/api/v1/task/a%2Fb");
    }

    #[test]
    fn create_request_is_json_without_image() {
        let request = api(Some("t")).create_request(&new_task()).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(
            body_json(&request),
            serde_json::json!({
                "title": "Ship release",
                "description": "tag and publish",
                "status": "pending",
                "deadline": "2025-05-01",
            })
        );
    }

    #[test]
    fn create_request_is_multipart_with_image() {
        let task = new_task().with_image(ImageUpload {
            file_name: "cover.png".into(),
            mime_type: "image/png".into(),
            bytes: vec![0x89, b'P', b'N', b'G'],
        });
        let request = api(Some("t")).create_request(&task).unwrap();
        let content_type = request.headers()[CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer t");
    }

    #[test]
    fn server_message_prefers_message_field() {
        assert_eq!(
            server_message(r#"{"message":"Title is required"}"#).as_deref(),
            Some("Title is required")
        );
        assert_eq!(
            server_message(r#"{"error":"jwt expired"}"#).as_deref(),
            Some("jwt expired")
        );
        assert_eq!(server_message("<html>502</html>"), None);
        assert_eq!(server_message(r#"{"message":"  "}"#), None);
        assert_eq!(
            server_message(r#"{"error":"Bad Request","message":"Deadline is invalid"}"#)
                .as_deref(),
            Some("Deadline is invalid")
        );
        assert_eq!(
            server_message(r#"{"message":"","error":"Forbidden"}"#).as_deref(),
            Some("Forbidden")
        );
    }

    #[test]
    fn status_codes_map_to_failure_kinds() {
        let kind = |status| ApiError::Status { status, message: None }.kind();
        assert_eq!(kind(401), FailureKind::Unauthorized);
        assert_eq!(kind(403), FailureKind::Unauthorized);
        assert_eq!(kind(400), FailureKind::Validation);
        assert_eq!(kind(422), FailureKind::Validation);
        assert_eq!(kind(404), FailureKind::NotFound);
        assert_eq!(kind(500), FailureKind::Server);
    }

    #[test]
    fn user_message_falls_back_when_server_is_silent() {
        let err = ApiError::Status { status: 503, message: None };
        assert_eq!(err.user_message(), "The server responded with status 503");
        assert_eq!(
            ApiError::status(400, "Deadline is required").user_message(),
            "Deadline is required"
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_failure() {
        let api = HttpTaskApi::new(
            Url::parse("http://127.0.0.1:9/api/v1").unwrap(),
            SessionStore::in_memory(),
        );
        let err = api.list_tasks(None).await.unwrap_err();
        assert_matches!(err, ApiError::Transport(_));
        assert_eq!(err.kind(), FailureKind::Network);
        assert!(!err.user_message().is_empty());
    }
}
