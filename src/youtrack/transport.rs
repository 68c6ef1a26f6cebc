//! Single-attempt HTTP transport for the YouTrack REST API.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::error::{classify, classify_reqwest, error_message, ClassifiedFailure};

/// Everything needed to issue one request. Built once per attempt.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
  pub method: Method,
  /// Path below `/api`, e.g. `/issues/2-17`
  pub path: String,
  /// Ordered query parameters, keys unique
  pub query: Vec<(String, String)>,
  pub headers: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl RequestDescriptor {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::POST, path).with_body(body)
  }

  pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
    self.query = query;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// A successful response: status, headers and decoded JSON body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: HeaderMap,
  /// `{}` when the server sent no JSON
  pub body: Value,
}

/// reqwest-backed transport. Performs exactly one attempt per call.
#[derive(Clone)]
pub struct Transport {
  client: reqwest::Client,
  base_url: String,
  token: String,
}

impl Transport {
  pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ClassifiedFailure> {
    let client = reqwest::Client::builder()
      .gzip(true)
      .deflate(true)
      .build()
      .map_err(|e| ClassifiedFailure::Unknown {
        message: format!("Failed to create HTTP client: {}", e),
      })?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      token: token.into(),
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  /// Resolve `{base}/api{path}` with the descriptor's query parameters.
  pub fn url_for(&self, request: &RequestDescriptor) -> Result<Url, ClassifiedFailure> {
    let raw = format!("{}/api{}", self.base_url, request.path);
    let mut url = Url::parse(&raw).map_err(|e| ClassifiedFailure::Unknown {
      message: format!("Invalid request URL {}: {}", raw, e),
    })?;

    if !request.query.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (key, value) in &request.query {
        pairs.append_pair(key, value);
      }
    }

    Ok(url)
  }

  fn headers_for(&self, request: &RequestDescriptor) -> Result<HeaderMap, ClassifiedFailure> {
    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token)).map_err(|e| {
      ClassifiedFailure::Unknown {
        message: format!("Invalid API token: {}", e),
      }
    })?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (name, value) in &request.headers {
      let name = reqwest::header::HeaderName::from_bytes(name.as_bytes());
      let value = HeaderValue::from_str(value);
      if let (Ok(name), Ok(value)) = (name, value) {
        headers.insert(name, value);
      }
    }

    Ok(headers)
  }

  /// Perform one attempt. If the deadline passes before the body has been
  /// read, the in-flight request is dropped and reported as transient.
  pub async fn execute(
    &self,
    request: &RequestDescriptor,
    deadline: Duration,
  ) -> Result<HttpResponse, ClassifiedFailure> {
    let url = self.url_for(request)?;
    let headers = self.headers_for(request)?;

    tracing::debug!(method = %request.method, %url, "youtrack request");

    let mut builder = self
      .client
      .request(request.method.clone(), url)
      .headers(headers);
    if let Some(body) = &request.body {
      builder = builder.body(body.to_string());
    }

    match tokio::time::timeout(deadline, Self::send(builder)).await {
      Ok(result) => result,
      Err(_) => Err(ClassifiedFailure::timeout(format!(
        "Request timed out after {}ms",
        deadline.as_millis()
      ))),
    }
  }

  async fn send(builder: reqwest::RequestBuilder) -> Result<HttpResponse, ClassifiedFailure> {
    let response = builder.send().await.map_err(|e| classify_reqwest(&e))?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let is_json = headers
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|ct| ct.contains("application/json"));
    let text = response.text().await.map_err(|e| classify_reqwest(&e))?;

    if !(200..300).contains(&status) {
      return Err(classify(Some(status), error_message(status, is_json, &text)));
    }

    // Mutating endpoints may answer with an empty, untyped body.
    if !is_json || text.trim().is_empty() {
      return Ok(HttpResponse {
        status,
        headers,
        body: Value::Object(Default::default()),
      });
    }

    let body = serde_json::from_str(&text)
      .map_err(|e| ClassifiedFailure::decode(format!("Failed to decode response: {}", e)))?;

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  const DEADLINE: Duration = Duration::from_secs(5);

  #[test]
  fn test_trailing_slash_is_normalized() {
    let transport = Transport::new("https://x.example/", "t").unwrap();
    let url = transport
      .url_for(&RequestDescriptor::get("/issues/1"))
      .unwrap();
    assert_eq!(url.as_str(), "https://x.example/api/issues/1");
  }

  #[test]
  fn test_query_parameters_keep_order() {
    let transport = Transport::new("https://x.example", "t").unwrap();
    let request = RequestDescriptor::get("/issues").with_query(vec![
      ("query".to_string(), "#Unresolved".to_string()),
      ("fields".to_string(), "id,summary".to_string()),
      ("$top".to_string(), "50".to_string()),
    ]);
    let url = transport.url_for(&request).unwrap();
    assert_eq!(
      url.as_str(),
      "https://x.example/api/issues?query=%23Unresolved&fields=id%2Csummary&%24top=50"
    );
  }

  #[tokio::test]
  async fn test_hits_api_path_once_with_auth_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/issues/1"))
      .and(header("authorization", "Bearer secret"))
      .and(header("accept", "application/json"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
      .expect(1)
      .mount(&server)
      .await;

    let transport = Transport::new(&format!("{}/", server.uri()), "secret").unwrap();
    let response = transport
      .execute(&RequestDescriptor::get("/issues/1"), DEADLINE)
      .await
      .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({"id": "1"}));
  }

  #[tokio::test]
  async fn test_non_json_success_is_empty_object() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/issues/1/customFields/State"))
      .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
      .mount(&server)
      .await;

    let transport = Transport::new(&server.uri(), "t").unwrap();
    let response = transport
      .execute(
        &RequestDescriptor::post("/issues/1/customFields/State", json!({"value": {"id": "s1"}})),
        DEADLINE,
      )
      .await
      .unwrap();

    assert_eq!(response.body, json!({}));
  }

  #[tokio::test]
  async fn test_client_error_carries_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/issues"))
      .and(query_param("query", "bogus"))
      .respond_with(
        ResponseTemplate::new(400)
          .set_body_json(json!({"error": "bad_request", "error_description": "Unknown field"})),
      )
      .mount(&server)
      .await;

    let transport = Transport::new(&server.uri(), "t").unwrap();
    let request = RequestDescriptor::get("/issues")
      .with_query(vec![("query".to_string(), "bogus".to_string())]);
    let err = transport.execute(&request, DEADLINE).await.unwrap_err();

    assert_eq!(
      err,
      ClassifiedFailure::Client {
        status: 400,
        message: "Unknown field".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
      .mount(&server)
      .await;

    let transport = Transport::new(&server.uri(), "t").unwrap();
    let err = transport
      .execute(&RequestDescriptor::get("/users/me"), DEADLINE)
      .await
      .unwrap_err();

    assert_eq!(
      err,
      ClassifiedFailure::Transient {
        status: Some(503),
        message: "maintenance".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_deadline_exceeded_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({}))
          .set_delay(Duration::from_millis(500)),
      )
      .mount(&server)
      .await;

    let transport = Transport::new(&server.uri(), "t").unwrap();
    let err = transport
      .execute(
        &RequestDescriptor::get("/users/me"),
        Duration::from_millis(50),
      )
      .await
      .unwrap_err();

    assert!(matches!(
      err,
      ClassifiedFailure::Transient { status: None, .. }
    ));
  }
}
