//! `Backend` over HTTP with reqwest.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, ApiResult, Backend, UserIdentity};
use crate::config::RealtimeConfig;
use crate::sync::protocol::{ChatMessage, Notification, OutgoingMessage, ReadRequest};
use crate::sync::{ConversationId, MessageId, NotificationId};

#[derive(Debug, Deserialize)]
struct UnreadCount {
    count: i64,
}

/// HTTP client for the backend REST API
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &RealtimeConfig) -> ApiResult<Self> {
        let mut base = Url::parse(&config.api_base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.api_base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            base,
            token: config.api_token.clone(),
        })
    }

    fn url(&self, path: &str) -> ApiResult<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", path, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get(&self, path: &str) -> ApiResult<Response> {
        let url = self.url(path)?;
        debug!("GET {}", url);
        let response = self.authorize(self.client.get(url)).send().await?;
        check_status(response).await
    }

    async fn post<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> ApiResult<Response> {
        let url = self.url(path)?;
        debug!("POST {}", url);
        let mut request = self.authorize(self.client.post(url));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized);
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn current_user(&self) -> ApiResult<UserIdentity> {
        Ok(self.get("/api/users/me").await?.json().await?)
    }

    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> ApiResult<Vec<ChatMessage>> {
        let path = format!("/api/conversations/{}/messages", conversation_id);
        Ok(self.get(&path).await?.json().await?)
    }

    async fn send_message(&self, message: &OutgoingMessage) -> ApiResult<ChatMessage> {
        let path = format!("/api/conversations/{}/messages", message.conversation_id);
        Ok(self.post(&path, Some(message)).await?.json().await?)
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        last_read_message_id: MessageId,
    ) -> ApiResult<()> {
        let path = format!("/api/conversations/{}/read", conversation_id);
        let body = ReadRequest {
            conversation_id,
            last_read_message_id,
        };
        self.post(&path, Some(&body)).await?;
        Ok(())
    }

    async fn notifications(&self) -> ApiResult<Vec<Notification>> {
        Ok(self.get("/api/notifications").await?.json().await?)
    }

    async fn unread_notification_count(&self) -> ApiResult<u32> {
        let body: UnreadCount = self
            .get("/api/notifications/unread-count")
            .await?
            .json()
            .await?;
        Ok(u32::try_from(body.count.max(0)).unwrap_or(u32::MAX))
    }

    async fn mark_notification_read(&self, notification_id: NotificationId) -> ApiResult<()> {
        let path = format!("/api/notifications/{}/read", notification_id);
        self.post::<()>(&path, None).await?;
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> ApiResult<()> {
        self.post::<()>("/api/notifications/read-all", None).await?;
        Ok(())
    }
}
