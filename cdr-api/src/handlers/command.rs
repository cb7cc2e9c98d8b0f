use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Form, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use cdr_common::call::{parse_cel_time, CallRecord};
use cdr_common::cel::{CelService, CLOSING_EVENTS_HEADER, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use cdr_common::store::StoreError;

use crate::originate::{OriginateError, Originator};

const DEFAULT_SINCE: &str = "2000-01-01";

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    error: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("Not Authenticated")]
    NotAuthenticated,
    #[error("{0}")]
    BadRequest(String),
    #[error("failed to read call events: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to originate call: {0}")]
    OriginateError(#[from] OriginateError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownCommand(_) => StatusCode::NOT_FOUND,
            ApiError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::OriginateError(_) => StatusCode::BAD_GATEWAY,
        };

        if status.is_server_error() {
            error!("internal error: {}", self);
        } else {
            warn!("rejected request: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

fn bad_request(msg: &str) -> ApiError {
    ApiError::BadRequest(msg.to_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    GetCelData,
    Originate,
}

impl FromStr for Command {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "getCelData" => Ok(Command::GetCelData),
            "originate" => Ok(Command::Originate),
            _ => Err(ApiError::UnknownCommand(s.to_owned())),
        }
    }
}

/// Everything a command may read, from the query string or a urlencoded body.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CommandParams {
    pub username: Option<String>,
    pub password: Option<String>,
    pub date: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub callerid: Option<String>,
}

impl CommandParams {
    /// Overlay `body` on top of these parameters, body values winning.
    fn merge(self, body: CommandParams) -> CommandParams {
        CommandParams {
            username: body.username.or(self.username),
            password: body.password.or(self.password),
            date: body.date.or(self.date),
            page: body.page.or(self.page),
            limit: body.limit.or(self.limit),
            from: body.from.or(self.from),
            to: body.to.or(self.to),
            callerid: body.callerid.or(self.callerid),
        }
    }

    fn integer(value: &Option<String>, name: &str, default: i64) -> Result<i64, ApiError> {
        match value.as_deref().map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| bad_request(&format!("'{}' must be an integer", name))),
        }
    }

    fn required<'a>(value: &'a Option<String>, msg: &str) -> Result<&'a str, ApiError> {
        value.as_deref().ok_or_else(|| bad_request(msg))
    }
}

/// The one account allowed to use the API. An empty username disables every command.
#[derive(Clone)]
pub struct ApiCredentials {
    username: String,
    password: String,
}

impl ApiCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        !self.username.is_empty() && self.username == username && self.password == password
    }
}

type CommandFuture = BoxFuture<'static, Result<Response, ApiError>>;
type CommandHandler = fn(Arc<AppState>, CommandParams) -> CommandFuture;

pub struct AppState {
    credentials: ApiCredentials,
    cel: CelService,
    originator: Arc<dyn Originator>,
    handlers: HashMap<Command, CommandHandler>,
}

impl AppState {
    pub fn new(
        credentials: ApiCredentials,
        cel: CelService,
        originator: Arc<dyn Originator>,
    ) -> Self {
        let handlers: [(Command, CommandHandler); 2] = [
            (Command::GetCelData, get_cel_data),
            (Command::Originate, originate),
        ];

        Self {
            credentials,
            cel,
            originator,
            handlers: HashMap::from(handlers),
        }
    }
}

pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<CommandParams>,
    body: Option<Form<CommandParams>>,
) -> Result<Response, ApiError> {
    let command = Command::from_str(&name)?;
    let handler = *state
        .handlers
        .get(&command)
        .ok_or(ApiError::UnknownCommand(name))?;

    let params = match body {
        Some(Form(body)) => query.merge(body),
        None => query,
    };

    let authenticated = state.credentials.verify(
        params.username.as_deref().unwrap_or_default(),
        params.password.as_deref().unwrap_or_default(),
    );
    if !authenticated {
        return Err(ApiError::NotAuthenticated);
    }

    debug!(?command, "dispatching command");
    handler(state, params).await
}

fn get_cel_data(state: Arc<AppState>, params: CommandParams) -> CommandFuture {
    async move {
        let limit = CommandParams::integer(&params.limit, "limit", DEFAULT_PAGE_LIMIT)?
            .min(MAX_PAGE_LIMIT);
        let page = CommandParams::integer(&params.page, "page", 1)?;
        let date = params.date.as_deref().unwrap_or(DEFAULT_SINCE);
        let since = parse_cel_time(date).ok_or_else(|| {
            bad_request("'date' must be formatted YYYY-MM-DD or YYYY-MM-DD HH:MM:SS")
        })?;

        let start_time = Instant::now();
        let page_result = state.cel.get_cel_data(since, page, limit).await?;

        metrics::histogram!("cel_page_duration_seconds").record(start_time.elapsed().as_secs_f64());
        metrics::counter!("cel_records_served_total").increment(page_result.records.len() as u64);
        debug!(
            page,
            limit,
            records = page_result.records.len(),
            gaps = page_result.gaps.len(),
            closing_events = page_result.closing_events,
            "served CEL page"
        );

        // An empty array alone can't tell the end of the log from a page of gaps.
        let closing_events = page_result.closing_events.to_string();
        let records: Vec<CallRecord> = page_result.records;
        Ok(([(CLOSING_EVENTS_HEADER, closing_events)], Json(records)).into_response())
    }
    .boxed()
}

fn originate(state: Arc<AppState>, params: CommandParams) -> CommandFuture {
    async move {
        let from = CommandParams::required(&params.from, "Must specify the caller number")?;
        let to = CommandParams::required(&params.to, "Must specify the called number")?;
        let caller_id = CommandParams::required(&params.callerid, "Must specify the caller id")?;

        let status = state.originator.originate(from, to, caller_id).await?;

        Ok(Json(status).into_response())
    }
    .boxed()
}
