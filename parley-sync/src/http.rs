//! Request/response collaborator: sending, polling, counters, headers.
//!
//! [`HttpApi`] is the seam the session drives; [`ReqwestApi`] is the
//! production implementation against the messaging endpoints. Tests
//! substitute an in-memory implementation.

use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Endpoints, SyncConfig};
use crate::error::ErrorCategory;
use crate::protocol::{InboundEvent, MessageId};
use crate::thread::{read_ids, ThreadContext, ThreadKey};

/// Failure of a poll, counter, mark-read or header request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("Access denied, redirect to {redirect}")]
    Forbidden { redirect: String },
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Malformed response: {0}")]
    Decode(String),
    #[error("Not available for this thread: {0}")]
    Unsupported(&'static str),
}

impl HttpError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Forbidden { .. } => ErrorCategory::AuthorizationLost,
            Self::Status { .. } | Self::Network(_) => ErrorCategory::TransientRequest,
            Self::Decode(_) | Self::Unsupported(_) => ErrorCategory::PermanentLocal,
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Failure of a message send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// 403: the thread is no longer accessible
    #[error("Access denied, redirect to {redirect}")]
    Forbidden { redirect: String },
    #[error("Send rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Malformed send response: {0}")]
    Malformed(String),
    #[error("Nothing to send")]
    Empty,
    #[error("Too many attachments: {count} (max {max})")]
    TooManyAttachments { count: usize, max: usize },
}

impl SendError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Forbidden { .. } => ErrorCategory::AuthorizationLost,
            Self::Network(_) => ErrorCategory::TransientRequest,
            Self::Rejected { status, .. } if *status >= 500 => ErrorCategory::TransientRequest,
            Self::Rejected { .. }
            | Self::Malformed(_)
            | Self::Empty
            | Self::TooManyAttachments { .. } => ErrorCategory::PermanentLocal,
        }
    }

    /// Whether resubmitting the same draft may succeed.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::TransientRequest
    }
}

impl From<HttpError> for SendError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Forbidden { redirect } => Self::Forbidden { redirect },
            HttpError::Status { status, body } => Self::Rejected {
                status,
                detail: error_detail(&body),
            },
            HttpError::Network(msg) => Self::Network(msg),
            HttpError::Decode(msg) => Self::Malformed(msg),
            HttpError::Unsupported(what) => Self::Malformed(what.to_string()),
        }
    }
}

/// A file attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            bytes,
        }
    }
}

/// A message composed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Correlates log lines of one send attempt
    pub client_id: Uuid,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Blank text and no attachments.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }

    /// Local checks done before any request is made.
    pub fn validate(&self, max_attachments: usize) -> Result<(), SendError> {
        if self.is_empty() {
            return Err(SendError::Empty);
        }
        if self.attachments.len() > max_attachments {
            return Err(SendError::TooManyAttachments {
                count: self.attachments.len(),
                max: max_attachments,
            });
        }
        Ok(())
    }
}

/// Successful send response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: MessageId,
    pub html: String,
    #[serde(default)]
    pub chat_id: Option<u64>,
}

/// One message returned by a thread poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolledMessage {
    pub id: MessageId,
    pub html: String,
    #[serde(default)]
    pub incoming: bool,
}

impl PolledMessage {
    /// Normalize into the event the push channel would have delivered.
    pub fn into_event(self, ctx: &ThreadContext) -> InboundEvent {
        InboundEvent::MessageNew {
            chat_id: ctx.thread_id(),
            other_username: ctx.peer_identifier().map(str::to_owned),
            message_id: Some(self.id),
            html: self.html,
            incoming: self.incoming,
            inbox_html: None,
            unread_total: None,
        }
    }
}

/// Thread poll response: messages after the requested id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDelta {
    #[serde(default)]
    pub messages: Vec<PolledMessage>,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub has_more: bool,
}

/// The request/response collaborator.
pub trait HttpApi: Send + Sync + 'static {
    fn send_message(
        &self,
        thread: &ThreadKey,
        message: &OutgoingMessage,
    ) -> impl Future<Output = Result<SentMessage, SendError>> + Send;

    /// Messages of `thread` with an id greater than `after`.
    fn poll_thread(
        &self,
        thread: &ThreadKey,
        after: Option<MessageId>,
    ) -> impl Future<Output = Result<ThreadDelta, HttpError>> + Send;

    fn unread_total(&self) -> impl Future<Output = Result<u64, HttpError>> + Send;

    /// Mark `thread` read up to `last_id`. Peer-addressed endpoints mark
    /// exactly the listed ids, so `unread` carries the incoming ids the
    /// boundary covers.
    fn mark_read(
        &self,
        thread: &ThreadKey,
        last_id: MessageId,
        unread: &[MessageId],
    ) -> impl Future<Output = Result<(), HttpError>> + Send;

    /// Re-rendered thread header fragment.
    fn fetch_header(
        &self,
        thread: &ThreadKey,
    ) -> impl Future<Output = Result<String, HttpError>> + Send;
}

fn mark_read_body(
    thread: &ThreadKey,
    last_id: MessageId,
    unread: &[MessageId],
) -> serde_json::Value {
    match thread {
        ThreadKey::Chat(_) => serde_json::json!({ "last_id": last_id }),
        ThreadKey::Peer(_) => serde_json::json!({ "ids": read_ids(last_id, unread) }),
    }
}

#[derive(Deserialize)]
struct RedirectBody {
    #[serde(default)]
    redirect: Option<String>,
}

#[derive(Deserialize)]
struct CountBody {
    count: u64,
}

/// Pull `error` out of a `{"error": ...}` body, else return it as is.
fn error_detail(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.to_string())
}

/// [`HttpApi`] over reqwest.
#[derive(Clone)]
pub struct ReqwestApi {
    http: Client,
    endpoints: Endpoints,
    max_attachments: usize,
}

impl ReqwestApi {
    pub fn new(config: &SyncConfig) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        let http = Client::builder().default_headers(headers).build()?;
        Ok(Self::with_client(http, config))
    }

    /// Use a preconfigured client (cookies, proxies, timeouts).
    pub fn with_client(http: Client, config: &SyncConfig) -> Self {
        Self {
            http,
            endpoints: config.endpoints.clone(),
            max_attachments: config.max_attachments,
        }
    }

    fn url(&self, template: &str, thread: Option<&ThreadKey>) -> String {
        let path = match thread {
            Some(ThreadKey::Chat(id)) => template.replace("{chat_id}", &id.to_string()),
            Some(ThreadKey::Peer(name)) => template.replace("{username}", name),
            None => template.to_string(),
        };
        format!("{}{}", self.endpoints.base_url.trim_end_matches('/'), path)
    }

    fn thread_url(&self, chat: &str, peer: &str, thread: &ThreadKey) -> String {
        match thread {
            ThreadKey::Chat(_) => self.url(chat, Some(thread)),
            ThreadKey::Peer(_) => self.url(peer, Some(thread)),
        }
    }

    /// Turn a non-2xx response into an error; 403 carries the redirect.
    async fn check(&self, res: Response) -> Result<Response, HttpError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        if status == StatusCode::FORBIDDEN {
            let redirect = res
                .json::<RedirectBody>()
                .await
                .ok()
                .and_then(|b| b.redirect)
                .unwrap_or_else(|| self.endpoints.inbox.clone());
            return Err(HttpError::Forbidden { redirect });
        }
        let body = res.text().await.unwrap_or_default();
        Err(HttpError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn build_form(message: &OutgoingMessage) -> Result<Form, SendError> {
        let mut form = Form::new().text("text", message.text.clone());
        for attachment in &message.attachments {
            let mut part =
                Part::bytes(attachment.bytes.clone()).file_name(attachment.filename.clone());
            if let Some(ct) = &attachment.content_type {
                part = part
                    .mime_str(ct)
                    .map_err(|e| SendError::Malformed(format!("{}: {e}", attachment.filename)))?;
            }
            form = form.part("attachments", part);
        }
        Ok(form)
    }
}

impl HttpApi for ReqwestApi {
    async fn send_message(
        &self,
        thread: &ThreadKey,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, SendError> {
        message.validate(self.max_attachments)?;
        let form = Self::build_form(message)?;
        let url = self.thread_url(&self.endpoints.chat_send, &self.endpoints.peer_send, thread);
        log::debug!("Sending message {} to {thread}", message.client_id);

        let res = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;
        let res = self.check(res).await?;
        res.json::<SentMessage>()
            .await
            .map_err(|e| SendError::Malformed(e.to_string()))
    }

    async fn poll_thread(
        &self,
        thread: &ThreadKey,
        after: Option<MessageId>,
    ) -> Result<ThreadDelta, HttpError> {
        let url = self.thread_url(&self.endpoints.chat_poll, &self.endpoints.peer_poll, thread);
        let mut req = self.http.get(url).header(CACHE_CONTROL, "no-store");
        if let Some(after) = after {
            req = req.query(&[("after", after.0)]);
        }
        let res = self.check(req.send().await?).await?;
        Ok(res.json::<ThreadDelta>().await?)
    }

    async fn unread_total(&self) -> Result<u64, HttpError> {
        let url = self.url(&self.endpoints.unread_count, None);
        let res = self
            .http
            .get(url)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await?;
        let res = self.check(res).await?;
        Ok(res.json::<CountBody>().await?.count)
    }

    async fn mark_read(
        &self,
        thread: &ThreadKey,
        last_id: MessageId,
        unread: &[MessageId],
    ) -> Result<(), HttpError> {
        let url = self.thread_url(
            &self.endpoints.chat_mark_read,
            &self.endpoints.peer_mark_read,
            thread,
        );
        let body = mark_read_body(thread, last_id, unread);
        let res = self.http.post(url).json(&body).send().await?;
        self.check(res).await?;
        Ok(())
    }

    async fn fetch_header(&self, thread: &ThreadKey) -> Result<String, HttpError> {
        let ThreadKey::Chat(_) = thread else {
            return Err(HttpError::Unsupported("header refresh needs a chat id"));
        };
        let url = self.url(&self.endpoints.chat_header, Some(thread));
        let res = self.check(self.http.get(url).send().await?).await?;
        Ok(res.text().await?)
    }
}
