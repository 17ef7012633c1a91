/// Batch-HTTP sink: one JSON POST per flush
use super::record::LogRecord;
use super::LogSink;
use crate::config::types::{HttpSinkConfig, Result, SandboxError};
use crate::config::validator::validate_http_sink;
use crate::observability::audit::Correlation;
use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use serde_json::{Map, Value};
use std::time::Duration;

pub struct BatchHttpSink {
    client: Client,
    config: HttpSinkConfig,
    job_id: String,
    parent_id: Option<String>,
}

impl BatchHttpSink {
    pub fn new(config: HttpSinkConfig, job_id: &str, parent_id: Option<&str>) -> Result<Self> {
        validate_http_sink(&config)?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            config,
            job_id: job_id.to_string(),
            parent_id: parent_id.map(str::to_string),
        })
    }

    /// Request body: `{"<scope_key>": parent, "job_id": job, "logs": [...]}`
    pub fn body(&self, records: &[LogRecord]) -> Result<Value> {
        let mut body = Map::new();
        body.insert(
            self.config.scope_key.clone(),
            self.parent_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        body.insert("job_id".to_string(), Value::String(self.job_id.clone()));
        body.insert("logs".to_string(), serde_json::to_value(records)?);
        Ok(Value::Object(body))
    }
}

impl LogSink for BatchHttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn deliver(&self, records: &[LogRecord]) -> Result<()> {
        let mut request = self.client.post(&self.config.url).json(&self.body(records)?);
        if let Some(key) = &self.config.api_key {
            request = request.header(AUTHORIZATION, key);
        }
        if let Some(workspace) = &self.config.workspace {
            request = request.header(self.config.workspace_header.as_str(), workspace);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "{} answered {}: {}",
                self.config.url,
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }
        Ok(())
    }

    fn correlation(&self) -> Correlation {
        Correlation::job(&self.job_id).with_parent(self.parent_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::record::LogLevel;
    use serde_json::json;
    use tokio::runtime::Runtime;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> HttpSinkConfig {
        HttpSinkConfig {
            url: format!("{}/logs", server.uri()),
            api_key: Some("secret-key".to_string()),
            workspace: Some("team-a".to_string()),
            ..HttpSinkConfig::default()
        }
    }

    #[test]
    fn posts_batch_with_auth_and_workspace_headers() {
        let rt = Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        rt.block_on(
            Mock::given(method("POST"))
                .and(path("/logs"))
                .and(header("authorization", "secret-key"))
                .and(header("x-workspace", "team-a"))
                .and(body_json(json!({
                    "parent_id": "exp-1",
                    "job_id": "job-7",
                    "logs": [{
                        "timestamp": 1_700_000_000_000i64,
                        "level": "WARNING",
                        "logger_name": "scorer",
                        "message": "careful",
                        "attributes": {"step": 2}
                    }]
                })))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server),
        );

        let sink = BatchHttpSink::new(config(&server), "job-7", Some("exp-1")).unwrap();
        let mut record = LogRecord::new(LogLevel::Warning, "scorer", "careful");
        record.timestamp = 1_700_000_000_000;
        record.attributes.insert("step".to_string(), Value::from(2));

        sink.deliver(&[record]).unwrap();
        rt.block_on(server.verify());
    }

    #[test]
    fn missing_parent_is_sent_as_null() {
        let rt = Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        rt.block_on(
            Mock::given(method("POST"))
                .and(path("/logs"))
                .respond_with(ResponseTemplate::new(202))
                .expect(1)
                .mount(&server),
        );

        let sink = BatchHttpSink::new(config(&server), "job-8", None).unwrap();
        sink.deliver(&[LogRecord::new(LogLevel::Info, "t", "x")]).unwrap();

        let requests = rt.block_on(server.received_requests()).unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body["parent_id"].is_null());
        assert_eq!(body["job_id"], "job-8");
        assert_eq!(body["logs"][0]["level"], "INFO");
    }

    #[test]
    fn non_success_status_is_a_failure() {
        let rt = Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        rt.block_on(
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
                .expect(1)
                .mount(&server),
        );

        let sink = BatchHttpSink::new(config(&server), "job-7", None).unwrap();
        let err = sink
            .deliver(&[LogRecord::new(LogLevel::Info, "t", "x")])
            .unwrap_err();
        match err {
            SandboxError::Transport(detail) => {
                assert!(detail.contains("503"), "{}", detail);
                assert!(detail.contains("overloaded"), "{}", detail);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn custom_scope_key_is_used() {
        let sink = BatchHttpSink::new(
            HttpSinkConfig {
                url: "http://127.0.0.1:9/".to_string(),
                scope_key: "experiment_id".to_string(),
                ..HttpSinkConfig::default()
            },
            "job-1",
            None,
        )
        .unwrap();
        let body = sink.body(&[]).unwrap();
        assert!(body["experiment_id"].is_null());
        assert!(body.get("parent_id").is_none());
    }

    #[test]
    fn missing_url_is_rejected() {
        assert!(BatchHttpSink::new(HttpSinkConfig::default(), "job", None).is_err());
    }
}
