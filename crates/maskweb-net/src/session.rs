//! Authenticated request/response client for one server.
//!
//! Every call carries the current credential in the `Authorization` header
//! and adopts any `X-Refreshed-Token` the server hands back. The credential
//! lives in a `watch` channel so the messaging channel (and whoever persists
//! the registry) observe refreshes without polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maskweb_shared::constants::{AUTHORIZATION_HEADER, REFRESHED_TOKEN_HEADER};
use maskweb_shared::secret::hash_secret;
use maskweb_shared::{ApiError, ApiResponse, ChatMessage, MessageId, ServerVersion};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use crate::channel::HistorySource;

/// Payload of a successful login or registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub token: Option<String>,
    /// Everything else the server returned (user id, name, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    base_url: String,
    http: Client,
    credential: watch::Sender<Option<String>>,
}

impl SessionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let (credential, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(SessionInner {
                base_url: base_url.trim_end_matches('/').to_string(),
                http,
                credential,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn credential(&self) -> Option<String> {
        self.inner.credential.borrow().clone()
    }

    /// Replace the credential. Empty strings clear it. Observers are only
    /// woken when the value actually changes.
    pub fn set_credential(&self, token: Option<String>) {
        let token = token.filter(|t| !t.is_empty());
        self.inner.credential.send_if_modified(|current| {
            if *current == token {
                return false;
            }
            *current = token;
            true
        });
    }

    /// Receiver that sees every credential change, including refreshes.
    pub fn subscribe_credential(&self) -> watch::Receiver<Option<String>> {
        self.inner.credential.subscribe()
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.inner.base_url, endpoint)
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        self.inner.http.request(method, self.url(endpoint))
    }

    /// `{base}{prefix}/{segment}` with `segment` percent-encoded.
    fn segment_url(&self, prefix: &str, segment: &str) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.url(prefix))
            .map_err(|e| ApiError::Transport(format!("invalid server address: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Transport("server address cannot carry a path".into()))?
            .push(segment);
        Ok(url)
    }

    /// Attach the credential, send, adopt a refreshed credential and map
    /// non-2xx answers to errors.
    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let request = match self.credential() {
            Some(token) => request.header(AUTHORIZATION_HEADER, token),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "request failed before reaching the server");
            ApiError::Transport(e.to_string())
        })?;

        if let Some(refreshed) = response
            .headers()
            .get(REFRESHED_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            debug!(url = %response.url(), "server refreshed the credential");
            self.set_credential(Some(refreshed.to_string()));
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.ok();
            debug!(status = status.as_u16(), "request rejected");
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        Ok(response)
    }

    /// Send and decode the `{success, data, message}` envelope.
    async fn envelope<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.execute(request).await?;
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let envelope: ApiResponse<T> =
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?;

        if !envelope.success {
            return Err(ApiError::Refused(envelope.message.unwrap_or_default()));
        }

        match envelope.data {
            Some(data) => Ok(data),
            None => serde_json::from_value(Value::Null).map_err(|e| ApiError::Decode(e.to_string())),
        }
    }

    /// Generic call: `body`, when present, is sent as JSON.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        let request = self.request(method, endpoint);
        let request = match body {
            Some(body) => request.json(body),
            None => request,
        };
        self.envelope(request).await
    }

    async fn bytes(&self, request: RequestBuilder) -> Result<Vec<u8>, ApiError> {
        let response = self.execute(request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn adopt(&self, session: &Session) {
        if let Some(token) = session.token.as_deref().filter(|t| !t.is_empty()) {
            self.set_credential(Some(token.to_string()));
        }
    }

    // -- auth --------------------------------------------------------------

    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let digest = hash_secret(password);
        let request = self
            .request(Method::POST, "/unauth/login")
            .query(&[("email", email), ("password", digest.as_str())]);
        let session: Session = self.envelope(request).await?;
        self.adopt(&session);
        Ok(session)
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<Session, ApiError> {
        let digest = hash_secret(password);
        let request = self.request(Method::POST, "/unauth/register").query(&[
            ("username", username),
            ("password", digest.as_str()),
            ("email", email),
        ]);
        let session: Session = self.envelope(request).await?;
        self.adopt(&session);
        Ok(session)
    }

    pub async fn get_version(&self) -> Result<ServerVersion, ApiError> {
        self.call(Method::GET, "/unauth/version", None).await
    }

    // -- user --------------------------------------------------------------

    pub async fn get_self(&self) -> Result<Value, ApiError> {
        self.call(Method::GET, "/user/getSelf", None).await
    }

    pub async fn send_email_code(&self) -> Result<Value, ApiError> {
        self.call(Method::GET, "/user/sendEmailCode", None).await
    }

    pub async fn verify_email_code(&self, code: &str) -> Result<Value, ApiError> {
        let request = self
            .request(Method::POST, "/user/verifyEmailCode")
            .query(&[("code", code)]);
        self.envelope(request).await
    }

    pub async fn update_self(&self, user: &Value) -> Result<Value, ApiError> {
        self.call(Method::POST, "/user/updateSelf", Some(user)).await
    }

    // -- config ------------------------------------------------------------

    pub async fn get_all_config(&self) -> Result<Value, ApiError> {
        self.call(Method::GET, "/config/all", None).await
    }

    pub async fn save_config(&self, config: &Value) -> Result<Value, ApiError> {
        self.call(Method::POST, "/config/save", Some(config)).await
    }

    pub async fn delete_config(&self, key: &str) -> Result<Value, ApiError> {
        let url = self.segment_url("/config/delete", key)?;
        self.envelope(self.inner.http.delete(url)).await
    }

    // -- server & messages -------------------------------------------------

    pub async fn get_server_info(&self) -> Result<Value, ApiError> {
        self.call(Method::GET, "/server/info", None).await
    }

    /// Messages with id strictly less than `id`.
    pub async fn messages_before(&self, id: MessageId) -> Result<Vec<ChatMessage>, ApiError> {
        let request = self
            .request(Method::GET, "/api/messages/before")
            .query(&[("id", id)]);
        let batch: Option<Vec<ChatMessage>> = self.envelope(request).await?;
        Ok(batch.unwrap_or_default())
    }

    /// Messages with id strictly greater than `id`.
    pub async fn messages_after(&self, id: MessageId) -> Result<Vec<ChatMessage>, ApiError> {
        let request = self
            .request(Method::GET, "/api/messages/after")
            .query(&[("id", id)]);
        let batch: Option<Vec<ChatMessage>> = self.envelope(request).await?;
        Ok(batch.unwrap_or_default())
    }

    // -- files -------------------------------------------------------------

    pub async fn upload_file(&self, file_name: &str, data: Vec<u8>) -> Result<Value, ApiError> {
        let part = Part::bytes(data).file_name(file_name.to_string());
        let form = Form::new().part("file", part);
        self.envelope(self.request(Method::POST, "/file/upload").multipart(form))
            .await
    }

    pub async fn set_file_public(&self, id: i64, is_public: bool) -> Result<Value, ApiError> {
        let request = self
            .request(Method::POST, &format!("/file/{id}/public"))
            .query(&[("isPublic", is_public)]);
        self.envelope(request).await
    }

    pub async fn download_public_file(&self, id: i64) -> Result<Vec<u8>, ApiError> {
        self.bytes(self.request(Method::GET, &format!("/file/public/{id}")))
            .await
    }

    pub async fn private_file(&self, id: i64) -> Result<Vec<u8>, ApiError> {
        self.bytes(self.request(Method::GET, &format!("/file/private/{id}")))
            .await
    }

    pub async fn my_files(&self) -> Result<Value, ApiError> {
        self.call(Method::GET, "/file/my-files", None).await
    }
}

#[async_trait]
impl HistorySource for SessionClient {
    async fn messages_after(&self, id: MessageId) -> Result<Vec<ChatMessage>, ApiError> {
        SessionClient::messages_after(self, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": data }))
    }

    fn client(server: &MockServer) -> SessionClient {
        SessionClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn refreshed_credential_is_adopted_and_observed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/getSelf"))
            .and(header("Authorization", "old"))
            .respond_with(ok(json!({ "name": "ann" })).insert_header("X-Refreshed-Token", "new"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/config/all"))
            .and(header("Authorization", "new"))
            .respond_with(ok(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        client.set_credential(Some("old".into()));
        let mut observer = client.subscribe_credential();
        observer.borrow_and_update();

        let me = client.get_self().await.unwrap();
        assert_eq!(me["name"], "ann");
        assert!(observer.has_changed().unwrap());
        assert_eq!(observer.borrow_and_update().as_deref(), Some("new"));

        client.get_all_config().await.unwrap();
        assert_eq!(client.credential().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn unchanged_credential_does_not_wake_observers() {
        let client = SessionClient::new("http://localhost:1", Duration::from_secs(1)).unwrap();
        client.set_credential(Some("t".into()));
        let mut observer = client.subscribe_credential();
        observer.borrow_and_update();

        client.set_credential(Some("t".into()));
        assert!(!observer.has_changed().unwrap());

        client.set_credential(Some(String::new()));
        assert!(observer.has_changed().unwrap());
        assert_eq!(client.credential(), None);
    }

    #[tokio::test]
    async fn unauthorized_and_rejected_statuses_carry_the_body() {
        let server = MockServer::start().await;
        Mock::given(path("/user/getSelf"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "expired" })))
            .mount(&server)
            .await;
        Mock::given(path("/server/info"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client(&server);

        let err = client.get_self().await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(err.status(), 401);
        assert_eq!(err.body(), Some(&json!({ "error": "expired" })));

        let err = client.get_server_info().await.unwrap_err();
        assert!(matches!(err, ApiError::Rejected { status: 500, body: None }));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let client = SessionClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = client.get_version().await.unwrap_err();
        assert_eq!(err.status(), -1);
        assert!(!err.reached_server());
    }

    #[tokio::test]
    async fn envelope_refusal_is_reported() {
        let server = MockServer::start().await;
        Mock::given(path("/user/verifyEmailCode"))
            .and(query_param("code", "123456"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "success": false, "message": "wrong code" })),
            )
            .mount(&server)
            .await;

        let err = client(&server).verify_email_code("123456").await.unwrap_err();
        assert_eq!(err, ApiError::Refused("wrong code".into()));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(path("/unauth/version"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client(&server).get_version().await.unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn login_sends_password_digest_and_stores_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/unauth/login"))
            .and(query_param("email", "a@b.c"))
            .and(query_param("password", hash_secret("hunter2")))
            .respond_with(ok(json!({ "token": "tok-1", "userId": 7 })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let session = client.authenticate("a@b.c", "hunter2").await.unwrap();

        assert_eq!(session.token.as_deref(), Some("tok-1"));
        assert_eq!(session.extra["userId"], 7);
        assert_eq!(client.credential().as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn history_queries_pass_the_anchor_id() {
        let server = MockServer::start().await;
        Mock::given(path("/api/messages/after"))
            .and(query_param("id", "41"))
            .respond_with(ok(json!([
                { "id": 42, "fromName": "ann", "content": "hi", "timestamp": 1 }
            ])))
            .mount(&server)
            .await;
        Mock::given(path("/api/messages/before"))
            .and(query_param("id", "10"))
            .respond_with(ok(Value::Null))
            .mount(&server)
            .await;

        let client = client(&server);
        let after = client.messages_after(41).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, 42);
        assert_eq!(after[0].from_name, "ann");

        assert!(client.messages_before(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn config_key_is_percent_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/config/delete/site%20name"))
            .respond_with(ok(Value::Null))
            .expect(1)
            .mount(&server)
            .await;

        let deleted = client(&server).delete_config("site name").await.unwrap();
        assert_eq!(deleted, Value::Null);
    }

    #[tokio::test]
    async fn files_come_back_as_raw_bytes() {
        let server = MockServer::start().await;
        Mock::given(path("/file/private/9"))
            .and(header("Authorization", "t"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let client = client(&server);
        client.set_credential(Some("t".into()));
        assert_eq!(client.private_file(9).await.unwrap(), vec![1, 2, 3]);
    }
}
