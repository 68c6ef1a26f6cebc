use crate::config::Config;
use crate::youtrack::error::ClassifiedFailure;
use crate::youtrack::params::{paginate, Fields, QueryBuilder, SearchOptions};
use crate::youtrack::retry::RetryPolicy;
use crate::youtrack::transport::{HttpResponse, RequestDescriptor, Transport};
use crate::youtrack::types::{
  Activity, AgileBoard, Comment, Entity, FieldValue, Issue, PaginatedResponse, Project,
  ProjectCustomField, Sprint, User,
};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

pub type ApiResult<T> = std::result::Result<T, ClassifiedFailure>;

/// YouTrack API client: transport plus retry policy plus per-attempt deadline.
#[derive(Clone)]
pub struct YouTrackClient {
  transport: Transport,
  retry: RetryPolicy,
  timeout: Duration,
}

impl YouTrackClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    let transport = Transport::new(&config.youtrack.url, token)
      .map_err(|e| eyre!("Failed to create YouTrack client: {}", e))?;

    Ok(Self::with_transport(
      transport,
      config.youtrack.retry_policy(),
      config.youtrack.timeout(),
    ))
  }

  pub fn with_transport(transport: Transport, retry: RetryPolicy, timeout: Duration) -> Self {
    Self {
      transport,
      retry,
      timeout,
    }
  }

  /// Execute a request under the retry policy, returning the raw response.
  pub async fn execute(&self, request: RequestDescriptor) -> ApiResult<HttpResponse> {
    let operation = format!("{} {}", request.method, request.path);
    self
      .retry
      .run(&operation, || self.transport.execute(&request, self.timeout))
      .await
  }

  async fn request<T: DeserializeOwned>(&self, request: RequestDescriptor) -> ApiResult<T> {
    let path = request.path.clone();
    let response = self.execute(request).await?;
    serde_json::from_value(response.body)
      .map_err(|e| ClassifiedFailure::decode(format!("Failed to parse {}: {}", path, e)))
  }

  async fn get<E: Entity>(&self, path: String, fields: &Fields) -> ApiResult<E> {
    let query = QueryBuilder::new().fields::<E>(fields).build();
    self
      .request(RequestDescriptor::get(path).with_query(query))
      .await
  }

  async fn list<E: Entity>(&self, path: String, fields: &Fields) -> ApiResult<Vec<E>> {
    let query = QueryBuilder::new().fields::<E>(fields).build();
    self
      .request(RequestDescriptor::get(path).with_query(query))
      .await
  }

  /// The API answers list endpoints with a bare array; the page metadata is
  /// rebuilt from `X-Total-Count` and the request's `top`/`skip`.
  async fn page<E: Entity>(
    &self,
    path: String,
    query: Option<&str>,
    options: &SearchOptions,
  ) -> ApiResult<PaginatedResponse<E>> {
    let params = QueryBuilder::for_entity::<E>(query, options).build();
    let response = self
      .execute(RequestDescriptor::get(path).with_query(params))
      .await?;
    Ok(paginate(response.body, &response.headers, options))
  }

  // Issues

  pub async fn search_issues(
    &self,
    query: &str,
    options: &SearchOptions,
  ) -> ApiResult<PaginatedResponse<Issue>> {
    self.page("/issues".to_string(), Some(query), options).await
  }

  /// Search issues within one project, combining the project filter with
  /// the user's query.
  pub async fn search_project_issues(
    &self,
    project: &str,
    query: &str,
    options: &SearchOptions,
  ) -> ApiResult<PaginatedResponse<Issue>> {
    self
      .search_issues(&project_query(project, query), options)
      .await
  }

  pub async fn get_issue(&self, id: &str, fields: &Fields) -> ApiResult<Issue> {
    self.get(format!("/issues/{}", id), fields).await
  }

  pub async fn create_issue(&self, draft: Value) -> ApiResult<Issue> {
    self.request(RequestDescriptor::post("/issues", draft)).await
  }

  pub async fn update_issue(&self, id: &str, updates: Value) -> ApiResult<Issue> {
    self
      .request(RequestDescriptor::post(format!("/issues/{}", id), updates))
      .await
  }

  pub async fn add_comment(&self, id: &str, text: &str) -> ApiResult<Comment> {
    let query = QueryBuilder::new()
      .fields::<Comment>(&Fields::Default)
      .build();
    self
      .request(
        RequestDescriptor::post(format!("/issues/{}/comments", id), json!({ "text": text }))
          .with_query(query),
      )
      .await
  }

  /// Change history of an issue. `categories` is a comma-separated filter
  /// such as `CustomFieldCategory,CommentsCategory`.
  pub async fn issue_activities(
    &self,
    id: &str,
    categories: Option<&str>,
    fields: &Fields,
  ) -> ApiResult<Vec<Activity>> {
    let query = QueryBuilder::new()
      .fields::<Activity>(fields)
      .set("categories", categories.map(String::from))
      .build();
    self
      .request(RequestDescriptor::get(format!("/issues/{}/activities", id)).with_query(query))
      .await
  }

  /// Set one custom field. `field` is the field's id or name.
  pub async fn update_custom_field(
    &self,
    id: &str,
    field: &str,
    value: &FieldValue,
  ) -> ApiResult<()> {
    let request = RequestDescriptor::post(
      format!("/issues/{}/customFields/{}", id, field),
      json!({ "value": value }),
    );
    self.execute(request).await.map(|_| ())
  }

  // Projects

  pub async fn list_projects(&self, fields: &Fields) -> ApiResult<Vec<Project>> {
    self.list("/admin/projects".to_string(), fields).await
  }

  pub async fn get_project(&self, id: &str, fields: &Fields) -> ApiResult<Project> {
    self.get(format!("/admin/projects/{}", id), fields).await
  }

  pub async fn project_custom_fields(&self, id: &str) -> ApiResult<Vec<ProjectCustomField>> {
    self
      .list(
        format!("/admin/projects/{}/customFields", id),
        &Fields::Default,
      )
      .await
  }

  // Users

  pub async fn me(&self) -> ApiResult<User> {
    self.get("/users/me".to_string(), &Fields::Default).await
  }

  pub async fn get_user(&self, id: &str, fields: &Fields) -> ApiResult<User> {
    self.get(format!("/users/{}", id), fields).await
  }

  // Agile boards

  pub async fn list_boards(&self) -> ApiResult<Vec<AgileBoard>> {
    self.list("/agiles".to_string(), &Fields::Default).await
  }

  pub async fn get_board(&self, id: &str, fields: &Fields) -> ApiResult<AgileBoard> {
    self.get(format!("/agiles/{}", id), fields).await
  }

  pub async fn get_sprint(
    &self,
    board_id: &str,
    sprint_id: &str,
    fields: &Fields,
  ) -> ApiResult<Sprint> {
    self
      .get(format!("/agiles/{}/sprints/{}", board_id, sprint_id), fields)
      .await
  }

  /// Issues on a sprint, optionally narrowed by a search query.
  pub async fn sprint_issues(
    &self,
    board_id: &str,
    sprint_id: &str,
    query: Option<&str>,
    options: &SearchOptions,
  ) -> ApiResult<PaginatedResponse<Issue>> {
    self
      .page(
        format!("/agiles/{}/sprints/{}/issues", board_id, sprint_id),
        query,
        options,
      )
      .await
  }

  /// The board's current sprint, or `None` if the board has none.
  pub async fn current_sprint(&self, board_id: &str) -> ApiResult<Option<Sprint>> {
    match self
      .get::<Sprint>(
        format!("/agiles/{}/sprints/current", board_id),
        &Fields::Default,
      )
      .await
    {
      Ok(sprint) => Ok(Some(sprint)),
      Err(ClassifiedFailure::Client { status: 404, .. }) => Ok(None),
      Err(e) => Err(e),
    }
  }
}

/// `project: {SHORT} <query>`, or just the project filter for an empty query.
pub fn project_query(project: &str, query: &str) -> String {
  let scope = format!("project: {{{}}}", project);
  match query.trim() {
    "" => scope,
    q => format!("{} {}", scope, q),
  }
}
