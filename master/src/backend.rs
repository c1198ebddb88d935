//! Contratos con el backend de cómputo y de logs, más su cliente HTTP.

use async_trait::async_trait;
use ecco_common::api::{
    CreateFunctionRequest, FilterEventsRequest, FilterEventsResponse, FunctionConfiguration,
    ImageInfo, InvokeResponse, ListStreamsResponse, UpdateFunctionRequest,
};
use ecco_common::Batch;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("error HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no encontrado: {0}")]
    NotFound(String),
    #[error("el backend respondió {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn list_functions(&self) -> Result<Vec<FunctionConfiguration>, BackendError>;

    async fn get_function(&self, name: &str) -> Result<FunctionConfiguration, BackendError>;

    async fn create_function(
        &self,
        req: &CreateFunctionRequest,
    ) -> Result<FunctionConfiguration, BackendError>;

    async fn update_function(
        &self,
        name: &str,
        req: &UpdateFunctionRequest,
    ) -> Result<FunctionConfiguration, BackendError>;

    /// Invocación asíncrona: vuelve con el id sin esperar al worker.
    async fn invoke_async(&self, name: &str, batch: &Batch) -> Result<String, BackendError>;
}

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn describe_image(&self, image_ref: &str) -> Result<ImageInfo, BackendError>;
}

#[async_trait]
pub trait LogBackend: Send + Sync {
    async fn list_streams(
        &self,
        group: &str,
        next_token: Option<String>,
    ) -> Result<ListStreamsResponse, BackendError>;

    async fn filter_events(
        &self,
        req: &FilterEventsRequest,
    ) -> Result<FilterEventsResponse, BackendError>;
}

/// Cliente del host de funciones (crate `ecco-worker`).
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T, BackendError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl ComputeBackend for HttpBackend {
    async fn list_functions(&self) -> Result<Vec<FunctionConfiguration>, BackendError> {
        let resp = self.client.get(self.url("/functions")).send().await?;
        Self::decode(resp, "functions").await
    }

    async fn get_function(&self, name: &str) -> Result<FunctionConfiguration, BackendError> {
        let resp = self
            .client
            .get(self.url(&format!("/functions/{}", name)))
            .send()
            .await?;
        Self::decode(resp, name).await
    }

    async fn create_function(
        &self,
        req: &CreateFunctionRequest,
    ) -> Result<FunctionConfiguration, BackendError> {
        let resp = self
            .client
            .post(self.url("/functions"))
            .json(req)
            .send()
            .await?;
        Self::decode(resp, &req.name).await
    }

    async fn update_function(
        &self,
        name: &str,
        req: &UpdateFunctionRequest,
    ) -> Result<FunctionConfiguration, BackendError> {
        let resp = self
            .client
            .put(self.url(&format!("/functions/{}", name)))
            .json(req)
            .send()
            .await?;
        Self::decode(resp, name).await
    }

    async fn invoke_async(&self, name: &str, batch: &Batch) -> Result<String, BackendError> {
        let resp = self
            .client
            .post(self.url(&format!("/functions/{}/invocations", name)))
            .json(batch)
            .send()
            .await?;
        let body: InvokeResponse = Self::decode(resp, name).await?;
        Ok(body.invocation_id)
    }
}

#[async_trait]
impl ImageRegistry for HttpBackend {
    async fn describe_image(&self, image_ref: &str) -> Result<ImageInfo, BackendError> {
        let resp = self
            .client
            .get(self.url("/images"))
            .query(&[("image_ref", image_ref)])
            .send()
            .await?;
        Self::decode(resp, image_ref).await
    }
}

#[async_trait]
impl LogBackend for HttpBackend {
    async fn list_streams(
        &self,
        group: &str,
        next_token: Option<String>,
    ) -> Result<ListStreamsResponse, BackendError> {
        let mut query = vec![("group", group.to_string())];
        if let Some(token) = next_token {
            query.push(("next_token", token));
        }
        let resp = self
            .client
            .get(self.url("/logs/streams"))
            .query(&query)
            .send()
            .await?;
        Self::decode(resp, group).await
    }

    async fn filter_events(
        &self,
        req: &FilterEventsRequest,
    ) -> Result<FilterEventsResponse, BackendError> {
        let resp = self
            .client
            .post(self.url("/logs/events"))
            .json(req)
            .send()
            .await?;
        Self::decode(resp, &req.group).await
    }
}
