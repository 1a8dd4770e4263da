use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::client::{TaskClient, TaskQuery};
use crate::config::Settings;
use crate::error::{CancelerError, Result};
use crate::runtime::task::TaskId;

/// JSON-over-HTTP client for the remote task API.
///
/// Built once at startup and passed down; holds a pooled connection.
#[derive(Debug, Clone)]
pub struct HttpTaskClient {
    client: Client,
    base: Url,
    namespace: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    executions: Vec<ExecutionRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutionRef {
    id: TaskId,
}

#[derive(Debug, Serialize)]
struct TerminateRequest<'a> {
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    job_id: &'a str,
    visibility_query: String,
    reason: &'a str,
    operation: &'static str,
}

impl HttpTaskClient {
    pub fn connect(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| CancelerError::MissingCredentials("CANCELER_API_KEY is not set".into()))?;
        let base = Url::parse(&settings.api_address)
            .map_err(|e| CancelerError::Config(format!("invalid api address {:?}: {e}", settings.api_address)))?;
        if base.cannot_be_a_base() {
            return Err(CancelerError::Config(format!("api address {base} cannot carry a path")));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| CancelerError::Config(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            base,
            namespace: settings.namespace.clone(),
            api_key,
        })
    }

    /// Appends `segments` under the namespace root, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| CancelerError::Config(format!("api address {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(["api", "v1", "namespaces", self.namespace.as_str()])
            .extend(segments);
        Ok(url)
    }

    async fn list_page(&self, visibility: &str, page_size: Option<usize>, token: Option<&str>) -> Result<ListResponse> {
        let mut params = vec![("query", visibility.to_string())];
        if let Some(size) = page_size {
            params.push(("page_size", size.to_string()));
        }
        if let Some(token) = token {
            params.push(("next_page_token", token.to_string()));
        }
        let response = self
            .client
            .get(self.url(&["tasks"])?)
            .bearer_auth(&self.api_key)
            .query(&params)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CancelerError::MissingCredentials(message),
            _ => CancelerError::Remote {
                status: status.as_u16(),
                message,
            },
        })
    }
}

#[async_trait]
impl TaskClient for HttpTaskClient {
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskId>> {
        let visibility = query.to_string();
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.list_page(&visibility, None, page_token.as_deref()).await?;
            ids.extend(page.executions.into_iter().map(|e| e.id));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(query = %visibility, found = ids.len(), "listed tasks");
        Ok(ids)
    }

    /// One single-entry page is enough to tell.
    async fn any_task(&self, query: &TaskQuery) -> Result<bool> {
        let page = self.list_page(&query.to_string(), Some(1), None).await?;
        Ok(!page.executions.is_empty())
    }

    async fn terminate(&self, id: &TaskId, reason: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&["tasks", id.as_str(), "terminate"])?)
            .bearer_auth(&self.api_key)
            .json(&TerminateRequest { reason })
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(CancelerError::TaskNotFound(id.clone())),
            // Already terminal.
            StatusCode::CONFLICT => Ok(()),
            _ => Self::check(response).await.map(|_| ()),
        }
    }

    async fn start_batch_termination(&self, query: &TaskQuery, reason: &str) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let response = self
            .client
            .post(self.url(&["batch-operations"])?)
            .bearer_auth(&self.api_key)
            .json(&BatchRequest {
                job_id: &job_id,
                visibility_query: query.to_string(),
                reason,
                operation: "terminate",
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::WorkloadTag;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn connect_requires_an_api_key() {
        let err = HttpTaskClient::connect(&Settings::default()).unwrap_err();
        assert!(matches!(err, CancelerError::MissingCredentials(_)));
    }

    #[test]
    fn urls_are_namespaced() {
        let settings = Settings {
            api_address: "https://tasks.example.com/".into(),
            namespace: "prod".into(),
            api_key: Some("k".into()),
            ..Settings::default()
        };
        let client = HttpTaskClient::connect(&settings).unwrap();
        assert_eq!(
            client.url(&["batch-operations"]).unwrap().as_str(),
            "https://tasks.example.com/api/v1/namespaces/prod/batch-operations"
        );
    }

    #[test]
    fn task_ids_are_escaped_as_one_segment() {
        let settings = Settings {
            api_address: "https://tasks.example.com/gateway".into(),
            namespace: "prod".into(),
            api_key: Some("k".into()),
            ..Settings::default()
        };
        let client = HttpTaskClient::connect(&settings).unwrap();
        assert_eq!(
            client.url(&["tasks", "a/b c?x", "terminate"]).unwrap().as_str(),
            "https://tasks.example.com/gateway/api/v1/namespaces/prod/tasks/a%2Fb%20c%3Fx/terminate"
        );
    }

    #[test]
    fn connect_rejects_a_malformed_address() {
        let settings = Settings {
            api_address: "not a url".into(),
            api_key: Some("k".into()),
            ..Settings::default()
        };
        assert!(matches!(HttpTaskClient::connect(&settings), Err(CancelerError::Config(_))));
    }

    /// Serves `body` to every request on a local socket and records the
    /// request lines it saw.
    async fn serve_json(body: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&request);
                log.lock().unwrap().push(text.lines().next().unwrap_or_default().to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn any_task_stops_after_one_single_entry_page() {
        let (address, seen) = serve_json(r#"{"executions":[{"id":"a"}],"next_page_token":"more"}"#).await;
        let settings = Settings {
            api_address: address,
            namespace: "prod".into(),
            api_key: Some("k".into()),
            ..Settings::default()
        };
        let client = HttpTaskClient {
            client: Client::builder().no_proxy().build().unwrap(),
            ..HttpTaskClient::connect(&settings).unwrap()
        };
        let query = TaskQuery::running("WorkloadId", WorkloadTag::from("1"));

        assert!(client.any_task(&query).await.unwrap());
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("GET /api/v1/namespaces/prod/tasks?"), "{}", seen[0]);
        assert!(seen[0].contains("page_size=1"), "{}", seen[0]);
    }

    #[test]
    fn list_page_decodes_without_token() {
        let page: ListResponse = serde_json::from_str(r#"{"executions":[{"id":"a"},{"id":"b"}]}"#).unwrap();
        assert_eq!(page.executions.len(), 2);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    #[ignore = "needs a task API at CANCELER_API_ADDRESS"]
    async fn lists_against_a_live_api() {
        let settings = Settings::from_env().unwrap();
        let client = HttpTaskClient::connect(&settings).unwrap();
        let query = TaskQuery::running(settings.workload_attribute.clone(), WorkloadTag::from("1"));
        client.list_tasks(&query).await.unwrap();
    }
}
