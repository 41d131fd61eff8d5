//! HTTP client for the durable message backend.

use async_trait::async_trait;
use chatline_shared::{
    ApiError, CreateMessageRequest, EditMessageRequest, Message, MessageId, MessageRecord,
    UserProfile,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Durable REST collaborator consumed by the sync engine.
#[async_trait]
pub trait MessageApi: Send + Sync + 'static {
    async fn create_message(&self, request: &CreateMessageRequest) -> Result<Message, ApiError>;

    async fn edit_message(
        &self,
        id: MessageId,
        request: &EditMessageRequest,
    ) -> Result<Message, ApiError>;

    /// `None` when the backend answers without a body.
    async fn delete_message(
        &self,
        id: MessageId,
        acting_user_id: &str,
    ) -> Result<Option<Message>, ApiError>;

    /// Conversation history visible to the current user.
    async fn list_messages(&self) -> Result<Vec<Message>, ApiError>;

    async fn get_user(&self, id: &str) -> Result<UserProfile, ApiError>;
}

/// reqwest-backed [`MessageApi`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    /// Send a request and return the body of a successful response.
    async fn execute(&self, rb: RequestBuilder) -> Result<String, ApiError> {
        let resp = self
            .authorize(rb)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }
        Ok(text)
    }

    fn decode<TRes: DeserializeOwned>(text: &str) -> Result<TRes, ApiError> {
        let text = if text.trim().is_empty() { "null" } else { text };
        serde_json::from_str(text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.get(self.url(path))).await?;
        Self::decode(&text)
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.post(self.url(path)).json(body)).await?;
        Self::decode(&text)
    }

    pub async fn put_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.put(self.url(path)).json(body)).await?;
        Self::decode(&text)
    }

    pub async fn delete_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.delete(self.url(path))).await?;
        Self::decode(&text)
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageApi for ApiClient {
    async fn create_message(&self, request: &CreateMessageRequest) -> Result<Message, ApiError> {
        let record: MessageRecord = self.post_json("/api/messages", request).await?;
        Ok(record.into())
    }

    async fn edit_message(
        &self,
        id: MessageId,
        request: &EditMessageRequest,
    ) -> Result<Message, ApiError> {
        let record: MessageRecord = self.put_json(&format!("/api/messages/{id}"), request).await?;
        Ok(record.into())
    }

    async fn delete_message(
        &self,
        id: MessageId,
        acting_user_id: &str,
    ) -> Result<Option<Message>, ApiError> {
        let path = format!(
            "/api/messages/{}?actingUserId={}",
            id,
            urlencoding::encode(acting_user_id)
        );
        let record: Option<MessageRecord> = self.delete_json(&path).await?;
        Ok(record.map(Message::from))
    }

    async fn list_messages(&self) -> Result<Vec<Message>, ApiError> {
        let records: Vec<MessageRecord> = self.get_json("/api/messages").await?;
        Ok(records.into_iter().map(Message::from).collect())
    }

    async fn get_user(&self, id: &str) -> Result<UserProfile, ApiError> {
        self.get_json(&format!("/api/users/{}", urlencoding::encode(id)))
            .await
    }
}
