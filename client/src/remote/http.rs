//! JSON-over-HTTP remote.
//!
//! Routes, relative to the base URL:
//!
//! - `GET /v1/{collection}` lists a collection
//! - `GET /v1/{collection}?after={id}` lists append-only records after `id`
//! - `GET /v1/{collection}/{id}` reads one record, 404 when absent
//! - `PUT /v1/{collection}/{id}` creates or replaces one record
//! - `POST /v1/{collection}` appends, answering `{"key": "..."}`

use super::{RemoteError, RemoteStore, Result};
use async_trait::async_trait;
use hearth_engine::{Collection, HistoryId, Record, RecordKey};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct PushResponse {
    key: String,
}

/// A [`RemoteStore`] speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!("{}/v1/{}", self.base_url, collection)
    }

    fn record_url(&self, key: &RecordKey) -> String {
        format!("{}/v1/{}/{}", self.base_url, key.collection, key.id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch_list(&self, request: RequestBuilder) -> Result<Vec<Record>> {
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn read(&self, key: &RecordKey) -> Result<Option<Record>> {
        let response = self.send(self.client.get(self.record_url(key))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    async fn write(&self, record: &Record) -> Result<()> {
        let response = self
            .send(self.client.put(self.record_url(&record.key())).json(record))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::Status {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: format!("no route for {}", record.key()),
            });
        }
        Ok(())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Record>> {
        self.fetch_list(self.client.get(self.collection_url(collection)))
            .await
    }

    async fn push(&self, record: &Record) -> Result<String> {
        let response = self
            .send(
                self.client
                    .post(self.collection_url(record.collection()))
                    .json(record),
            )
            .await?;
        let body: PushResponse = response.json().await?;
        Ok(body.key)
    }

    async fn list_since(&self, collection: Collection, after: HistoryId) -> Result<Vec<Record>> {
        self.fetch_list(
            self.client
                .get(self.collection_url(collection))
                .query(&[("after", after)]),
        )
        .await
    }
}
