use super::client::{build_client, ensure_success, ApiCredentials};
use super::models::{
    CreateSessionRequest, CreateSessionResponse, InitiatePhotoRequest, MarkUploadedRequest,
    SessionSnapshot, UploadDescriptor,
};
use crate::error::{Result, UploadError};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// 上传相关的后端 REST 接口。引擎与编排器只依赖这个接口，测试里可以换成内存实现。
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn create_session(
        &self,
        creds: &ApiCredentials,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse>;

    async fn initiate_photo(
        &self,
        creds: &ApiCredentials,
        session_id: &str,
        request: &InitiatePhotoRequest,
    ) -> Result<UploadDescriptor>;

    async fn mark_uploaded(
        &self,
        creds: &ApiCredentials,
        photo_id: &str,
        request: &MarkUploadedRequest,
    ) -> Result<()>;

    async fn session_snapshot(
        &self,
        creds: &ApiCredentials,
        session_id: &str,
    ) -> Result<SessionSnapshot>;
}

/// 基于 reqwest 的默认实现。请求统一使用较保守的超时，本层不做自动重试。
#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: Client,
}

impl HttpUploadApi {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(Some(timeout))?,
        })
    }

    async fn post_json<B, T>(
        &self,
        creds: &ApiCredentials,
        segments: &[&str],
        body: &B,
        context: &str,
    ) -> Result<T>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let url = creds.endpoint(segments)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(creds.token())
            .json(body)
            .send()
            .await
            .map_err(|e| UploadError::transport(context, e))?;
        let response = ensure_success(response, context).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| UploadError::transport(format!("parsing {context} response"), e))
    }
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn create_session(
        &self,
        creds: &ApiCredentials,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        self.post_json(creds, &["api", "upload", "sessions"], request, "creating upload session")
            .await
    }

    async fn initiate_photo(
        &self,
        creds: &ApiCredentials,
        session_id: &str,
        request: &InitiatePhotoRequest,
    ) -> Result<UploadDescriptor> {
        self.post_json(
            creds,
            &["api", "upload", "sessions", session_id, "photos", "initiate"],
            request,
            "initiating photo upload",
        )
        .await
    }

    async fn mark_uploaded(
        &self,
        creds: &ApiCredentials,
        photo_id: &str,
        request: &MarkUploadedRequest,
    ) -> Result<()> {
        let context = "notifying photo upload";
        let url = creds.endpoint(&["api", "photos", photo_id, "uploaded"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(creds.token())
            .json(request)
            .send()
            .await
            .map_err(|e| UploadError::transport(context, e))?;
        ensure_success(response, context).await?;
        Ok(())
    }

    async fn session_snapshot(
        &self,
        creds: &ApiCredentials,
        session_id: &str,
    ) -> Result<SessionSnapshot> {
        let context = "fetching session snapshot";
        let url = creds.endpoint(&["api", "upload", "sessions", session_id])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(creds.token())
            .send()
            .await
            .map_err(|e| UploadError::transport(context, e))?;
        let response = ensure_success(response, context).await?;
        response
            .json::<SessionSnapshot>()
            .await
            .map_err(|e| UploadError::transport(format!("parsing {context} response"), e))
    }
}
