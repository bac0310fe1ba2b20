use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::retry::{retry_transient, RetryPolicy};
use super::{ServiceError, ServiceResult};

/// One field of a multipart upload. Files are read once and re-sent on retry.
#[derive(Debug, Clone)]
pub enum MultipartField {
    Text { name: String, value: String },
    File { name: String, path: PathBuf },
}

impl MultipartField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        MultipartField::Text {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        MultipartField::File {
            name: name.into(),
            path: path.into(),
        }
    }
}

enum LoadedField {
    Text(String, String),
    File(String, String, Vec<u8>),
}

/// Base URL, timeout and retry policy shared by every call to one service.
#[derive(Clone)]
pub struct HttpService {
    client: Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl fmt::Debug for HttpService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpService")
            .field("base_url", &self.base_url.as_str())
            .field("retry", &self.retry)
            .finish()
    }
}

impl HttpService {
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> ServiceResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| ServiceError::Malformed(format!("invalid base url {base_url}: {err}")))?;
        let client = Client::builder()
            .user_agent("Reelsmith/1.0")
            .timeout(timeout)
            .build()
            .map_err(|err| ServiceError::Malformed(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            retry,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> ServiceResult<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|err| ServiceError::Malformed(format!("{joined}: {err}")))
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> ServiceResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        retry_transient(&self.retry, path, || async {
            debug!(url = %url, "POST json");
            let response = self.client.post(url.clone()).json(body).send().await?;
            decode(response).await
        })
        .await
    }

    pub async fn post_form<R>(&self, path: &str, fields: &[(&str, String)]) -> ServiceResult<R>
    where
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        retry_transient(&self.retry, path, || async {
            debug!(url = %url, "POST form");
            let response = self.client.post(url.clone()).form(fields).send().await?;
            decode(response).await
        })
        .await
    }

    pub async fn post_multipart<R>(&self, path: &str, fields: &[MultipartField]) -> ServiceResult<R>
    where
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let mut loaded = Vec::with_capacity(fields.len());
        for field in fields {
            match field {
                MultipartField::Text { name, value } => {
                    loaded.push(LoadedField::Text(name.clone(), value.clone()))
                }
                MultipartField::File { name, path } => {
                    let bytes = tokio::fs::read(path).await.map_err(ServiceError::io(path))?;
                    let file_name = path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .unwrap_or_else(|| "upload".into());
                    loaded.push(LoadedField::File(name.clone(), file_name, bytes));
                }
            }
        }
        let loaded = &loaded;
        retry_transient(&self.retry, path, || async {
            debug!(url = %url, "POST multipart");
            let mut form = Form::new();
            for field in loaded {
                form = match field {
                    LoadedField::Text(name, value) => form.text(name.clone(), value.clone()),
                    LoadedField::File(name, file_name, bytes) => form.part(
                        name.clone(),
                        Part::bytes(bytes.clone()).file_name(file_name.clone()),
                    ),
                };
            }
            let response = self.client.post(url.clone()).multipart(form).send().await?;
            decode(response).await
        })
        .await
    }

    pub async fn get_json<R>(&self, path: &str) -> ServiceResult<R>
    where
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        retry_transient(&self.retry, path, || async {
            debug!(url = %url, "GET");
            let response = self.client.get(url.clone()).send().await?;
            decode(response).await
        })
        .await
    }
}

async fn decode<R: DeserializeOwned>(response: Response) -> ServiceResult<R> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ServiceError::Http {
            status: status.as_u16(),
            body,
        });
    }
    parse_body(&body)
}

fn parse_body<R: DeserializeOwned>(body: &str) -> ServiceResult<R> {
    serde_json::from_str(body).map_err(|err| ServiceError::Malformed(format!("{err}: {body}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_base_path() {
        let service = HttpService::new(
            "http://render.local:8000/",
            Duration::from_secs(5),
            RetryPolicy::no_retry(),
        )
        .unwrap();
        assert_eq!(
            service
                .endpoint("/api/v1/api/process/status/abc")
                .unwrap()
                .as_str(),
            "http://render.local:8000/api/v1/api/process/status/abc"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let result = HttpService::new("not a url", Duration::from_secs(5), RetryPolicy::no_retry());
        assert!(matches!(result, Err(ServiceError::Malformed(_))));
    }
}
