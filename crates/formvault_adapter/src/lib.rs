#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use formvault_contracts::access::{AuthContext, PermissionMatrix, RoleName, UserId};
use formvault_contracts::form::{FieldDefinition, FormDefinition, FormId, SubFormDefinition, SubFormId};
use formvault_contracts::submission::SubmissionId;
use formvault_contracts::SchemaVersion;
use formvault_engines::field_codec::KeyRing;
use formvault_engines::payload::{FieldViolation, Payload};
use formvault_os::config::{EngineConfig, PermissionMatrixHandle};
use formvault_os::error::{EngineError, Outcome};
use formvault_os::service::FormService;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const ENV_HTTP_BIND: &str = "FORMVAULT_HTTP_BIND";
pub const ENV_PERMISSIONS_PATH: &str = "FORMVAULT_PERMISSIONS_PATH";
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_ROLE: &str = "x-role";

/// Body of `POST /v1/forms` and `PUT /v1/forms/:form_id`. Author and version are
/// assigned by the engine, so they are not part of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDefinitionRequest {
    pub form_id: String,
    pub title: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub sub_forms: Vec<SubFormDefinition>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl FormDefinitionRequest {
    fn into_definition(self, author: &UserId) -> Result<FormDefinition, EngineError> {
        Ok(FormDefinition {
            form_id: FormId::new(self.form_id)?,
            title: self.title,
            fields: self.fields,
            sub_forms: self.sub_forms,
            tags: self.tags.into_iter().map(|t| t.trim().to_string()).collect(),
            version: SchemaVersion::INITIAL,
            created_by: author.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterResponse {
    pub status: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<AdapterViolation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterViolation {
    pub field: String,
    pub reason: String,
}

impl From<&FieldViolation> for AdapterViolation {
    fn from(v: &FieldViolation) -> Self {
        Self {
            field: v.field.clone(),
            reason: v.reason.clone(),
        }
    }
}

impl AdapterResponse {
    fn ok(outcome: &str, data: Option<Value>) -> Self {
        Self {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            reason: None,
            correlation_id: None,
            violations: Vec::new(),
            data,
        }
    }

    fn error(outcome: &str, reason: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            outcome: outcome.to_string(),
            reason: Some(reason.into()),
            correlation_id: None,
            violations: Vec::new(),
            data: None,
        }
    }
}

pub type AdapterReply = (StatusCode, AdapterResponse);

fn engine_error_reply(err: EngineError) -> AdapterReply {
    let status = match &err {
        EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::SchemaConflict { .. }
        | EngineError::FormAlreadyExists(_)
        | EngineError::HasDependents => StatusCode::CONFLICT,
        EngineError::FormNotFound(_) | EngineError::ParentNotFound => StatusCode::NOT_FOUND,
        EngineError::AccessDenied => StatusCode::FORBIDDEN,
        EngineError::TableCreation { .. }
        | EngineError::Storage { .. }
        | EngineError::Encryption { .. }
        | EngineError::IdSyncViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let outcome = match &err {
        EngineError::Validation(_) | EngineError::InvalidRequest(_) => "REJECTED",
        EngineError::AccessDenied => "ACCESS_DENIED",
        EngineError::FormNotFound(_) | EngineError::ParentNotFound => "NOT_FOUND",
        EngineError::SchemaConflict { .. }
        | EngineError::FormAlreadyExists(_)
        | EngineError::HasDependents => "CONFLICT",
        _ => "FAILED",
    };
    let mut body = AdapterResponse::error(outcome, err.to_string());
    body.correlation_id = err.correlation_id().map(|c| c.to_string());
    if let EngineError::Validation(v) = &err {
        body.violations = v.violations.iter().map(AdapterViolation::from).collect();
    }
    (status, body)
}

fn outcome_reply<T: Serialize>(outcome: Outcome<T>, done: &str) -> AdapterReply {
    match outcome {
        Outcome::Done(v) => data_reply(StatusCode::OK, done, &v),
        Outcome::AccessDenied => (
            StatusCode::FORBIDDEN,
            AdapterResponse::error("ACCESS_DENIED", "access denied"),
        ),
        Outcome::NotFound => (
            StatusCode::NOT_FOUND,
            AdapterResponse::error("NOT_FOUND", "submission not found"),
        ),
    }
}

fn data_reply<T: Serialize>(status: StatusCode, outcome: &str, data: &T) -> AdapterReply {
    match serde_json::to_value(data) {
        Ok(v) => (status, AdapterResponse::ok(outcome, Some(v))),
        Err(err) => {
            warn!(error = %err, "response serialization failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                AdapterResponse::error("FAILED", "response could not be encoded"),
            )
        }
    }
}

fn bad_request(reason: impl Into<String>) -> AdapterReply {
    (StatusCode::BAD_REQUEST, AdapterResponse::error("REJECTED", reason))
}

/// Reads the already-verified caller identity forwarded by the gateway.
pub fn auth_from_headers(headers: &HeaderMap) -> Result<AuthContext, String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| format!("missing {name} header"))
    };
    let user_id = UserId::new(header(HEADER_USER_ID)?).map_err(|e| e.to_string())?;
    let role = RoleName::new(header(HEADER_ROLE)?).map_err(|e| e.to_string())?;
    Ok(AuthContext::new(user_id, role))
}

fn parse_submission_id(raw: &str) -> Result<SubmissionId, AdapterReply> {
    SubmissionId::parse(raw).map_err(|e| bad_request(e.to_string()))
}

pub struct AdapterRuntime {
    service: FormService,
}

impl AdapterRuntime {
    pub fn new(service: FormService) -> Self {
        Self { service }
    }

    pub fn default_from_env() -> Result<Self, String> {
        Self::from_env_map(|key| std::env::var(key).ok())
    }

    /// Engine config, key ring and permission matrix, all taken from `get`.
    /// Without a permissions file every role resolves to the all-false rule.
    pub fn from_env_map<F>(get: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = EngineConfig::from_env_map(&get).map_err(|e| e.to_string())?;
        let keys = KeyRing::from_env_map(&get).map_err(|e| format!("field keys: {e}"))?;
        let matrix = match get(ENV_PERMISSIONS_PATH).filter(|p| !p.trim().is_empty()) {
            Some(path) => load_permissions(Path::new(path.trim()))?,
            None => PermissionMatrix::default(),
        };
        let permissions = PermissionMatrixHandle::new(matrix).map_err(|e| e.to_string())?;
        Ok(Self::new(FormService::new(
            config,
            Arc::new(keys),
            Arc::new(permissions),
        )))
    }

    pub fn service(&self) -> &FormService {
        &self.service
    }

    pub fn health(&self) -> AdapterReply {
        let data = serde_json::json!({
            "permissions_version": self.service.permissions().version(),
        });
        (StatusCode::OK, AdapterResponse::ok("HEALTHY", Some(data)))
    }

    pub fn create_form(&self, ctx: &AuthContext, request: FormDefinitionRequest) -> AdapterReply {
        let result = request
            .into_definition(&ctx.user_id)
            .and_then(|d| self.service.create_form(ctx, d));
        match result {
            Ok(form_id) => data_reply(
                StatusCode::CREATED,
                "CREATED",
                &serde_json::json!({ "form_id": form_id }),
            ),
            Err(err) => engine_error_reply(err),
        }
    }

    pub fn evolve_form(
        &self,
        ctx: &AuthContext,
        form_id: &str,
        request: FormDefinitionRequest,
    ) -> AdapterReply {
        if request.form_id != form_id {
            return bad_request("form_id in body does not match the path");
        }
        let result = request
            .into_definition(&ctx.user_id)
            .and_then(|d| self.service.evolve_form(ctx, d));
        match result {
            Ok(version) => data_reply(
                StatusCode::OK,
                "EVOLVED",
                &serde_json::json!({ "form_id": form_id, "version": version.0 }),
            ),
            Err(err) => engine_error_reply(err),
        }
    }

    pub fn submit(&self, ctx: &AuthContext, form_id: &str, payload: &Payload) -> AdapterReply {
        let result = FormId::new(form_id)
            .map_err(EngineError::from)
            .and_then(|id| self.service.submit(ctx, &id, payload));
        match result {
            Ok(id) => data_reply(
                StatusCode::CREATED,
                "SUBMITTED",
                &serde_json::json!({ "submission_id": id }),
            ),
            Err(err) => engine_error_reply(err),
        }
    }

    pub fn list_submissions(&self, ctx: &AuthContext, form_id: &str) -> AdapterReply {
        let result = FormId::new(form_id)
            .map_err(EngineError::from)
            .and_then(|id| self.service.list_submissions(ctx, &id));
        match result {
            Ok(rows) => data_reply(StatusCode::OK, "LISTED", &rows),
            Err(err) => engine_error_reply(err),
        }
    }

    pub fn get_submission(&self, ctx: &AuthContext, submission_id: &str) -> AdapterReply {
        let id = match parse_submission_id(submission_id) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        match self.service.get_submission(ctx, &id) {
            Ok(outcome) => outcome_reply(outcome, "FOUND"),
            Err(err) => engine_error_reply(err),
        }
    }

    pub fn update_submission(
        &self,
        ctx: &AuthContext,
        submission_id: &str,
        payload: &Payload,
    ) -> AdapterReply {
        let id = match parse_submission_id(submission_id) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        match self.service.update_submission(ctx, &id, payload) {
            Ok(outcome) => outcome_reply(outcome, "UPDATED"),
            Err(err) => engine_error_reply(err),
        }
    }

    pub fn delete_submission(&self, ctx: &AuthContext, submission_id: &str) -> AdapterReply {
        let id = match parse_submission_id(submission_id) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        match self.service.delete_submission(ctx, &id) {
            Ok(outcome) => outcome_reply(outcome.map(|()| Value::Null), "DELETED"),
            Err(err) => engine_error_reply(err),
        }
    }

    pub fn submit_subform(
        &self,
        ctx: &AuthContext,
        submission_id: &str,
        sub_form_id: &str,
        payload: &Payload,
    ) -> AdapterReply {
        let id = match parse_submission_id(submission_id) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        let result = SubFormId::new(sub_form_id)
            .map_err(EngineError::from)
            .and_then(|sub| self.service.submit_subform(ctx, &id, &sub, payload));
        match result {
            Ok(sub_record_id) => data_reply(
                StatusCode::CREATED,
                "SUBMITTED",
                &serde_json::json!({ "sub_record_id": sub_record_id }),
            ),
            Err(err) => engine_error_reply(err),
        }
    }

    pub fn list_subforms(&self, ctx: &AuthContext, submission_id: &str) -> AdapterReply {
        let id = match parse_submission_id(submission_id) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        match self.service.list_subforms(ctx, &id) {
            Ok(rows) => data_reply(StatusCode::OK, "LISTED", &rows),
            Err(err) => engine_error_reply(err),
        }
    }
}

fn load_permissions(path: &Path) -> Result<PermissionMatrix, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read permissions file {}: {e}", path.display()))?;
    let parsed = if path.extension().is_some_and(|ext| ext == "json") {
        PermissionMatrixHandle::parse_json(&raw)
    } else {
        PermissionMatrixHandle::parse_toml(&raw)
    };
    parsed.map_err(|e| e.to_string())
}

type Shared = State<Arc<AdapterRuntime>>;
type Reply = (StatusCode, Json<AdapterResponse>);

fn respond(reply: AdapterReply) -> Reply {
    (reply.0, Json(reply.1))
}

/// Authenticates the caller, then runs `f` on the blocking pool. Service calls
/// may wait on schema locks and sleep between commit retries, so they stay off
/// the async workers.
async fn with_caller<F>(rt: Arc<AdapterRuntime>, headers: &HeaderMap, f: F) -> Reply
where
    F: FnOnce(&AdapterRuntime, &AuthContext) -> AdapterReply + Send + 'static,
{
    let ctx = match auth_from_headers(headers) {
        Ok(ctx) => ctx,
        Err(reason) => {
            return respond((
                StatusCode::UNAUTHORIZED,
                AdapterResponse::error("UNAUTHENTICATED", reason),
            ))
        }
    };
    match tokio::task::spawn_blocking(move || f(&rt, &ctx)).await {
        Ok(reply) => respond(reply),
        Err(err) => {
            warn!(error = %err, "request task failed");
            respond((
                StatusCode::INTERNAL_SERVER_ERROR,
                AdapterResponse::error("FAILED", "request could not be completed"),
            ))
        }
    }
}

pub fn router(runtime: Arc<AdapterRuntime>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/forms", post(create_form))
        .route("/v1/forms/:form_id", put(evolve_form))
        .route(
            "/v1/forms/:form_id/submissions",
            post(submit).get(list_submissions),
        )
        .route(
            "/v1/submissions/:submission_id",
            get(get_submission)
                .put(update_submission)
                .delete(delete_submission),
        )
        .route(
            "/v1/submissions/:submission_id/subforms/:sub_form_id",
            post(submit_subform),
        )
        .route("/v1/submissions/:submission_id/subforms", get(list_subforms))
        .with_state(runtime)
}

async fn healthz(State(rt): Shared) -> Reply {
    respond(rt.health())
}

async fn create_form(
    State(rt): Shared,
    headers: HeaderMap,
    Json(request): Json<FormDefinitionRequest>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| rt.create_form(ctx, request)).await
}

async fn evolve_form(
    State(rt): Shared,
    headers: HeaderMap,
    UrlPath(form_id): UrlPath<String>,
    Json(request): Json<FormDefinitionRequest>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| {
        rt.evolve_form(ctx, &form_id, request)
    })
    .await
}

async fn submit(
    State(rt): Shared,
    headers: HeaderMap,
    UrlPath(form_id): UrlPath<String>,
    Json(payload): Json<Payload>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| rt.submit(ctx, &form_id, &payload)).await
}

async fn list_submissions(
    State(rt): Shared,
    headers: HeaderMap,
    UrlPath(form_id): UrlPath<String>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| rt.list_submissions(ctx, &form_id)).await
}

async fn get_submission(
    State(rt): Shared,
    headers: HeaderMap,
    UrlPath(submission_id): UrlPath<String>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| {
        rt.get_submission(ctx, &submission_id)
    })
    .await
}

async fn update_submission(
    State(rt): Shared,
    headers: HeaderMap,
    UrlPath(submission_id): UrlPath<String>,
    Json(payload): Json<Payload>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| {
        rt.update_submission(ctx, &submission_id, &payload)
    })
    .await
}

async fn delete_submission(
    State(rt): Shared,
    headers: HeaderMap,
    UrlPath(submission_id): UrlPath<String>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| {
        rt.delete_submission(ctx, &submission_id)
    })
    .await
}

async fn submit_subform(
    State(rt): Shared,
    headers: HeaderMap,
    UrlPath((submission_id, sub_form_id)): UrlPath<(String, String)>,
    Json(payload): Json<Payload>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| {
        rt.submit_subform(ctx, &submission_id, &sub_form_id, &payload)
    })
    .await
}

async fn list_subforms(
    State(rt): Shared,
    headers: HeaderMap,
    UrlPath(submission_id): UrlPath<String>,
) -> Reply {
    with_caller(rt, &headers, move |rt, ctx| rt.list_subforms(ctx, &submission_id)).await
}
