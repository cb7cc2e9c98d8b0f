use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::limit::ConcurrencyLimitLayer;
use tracing::{error, warn};

use cdr_common::call::OriginateStatus;

use crate::directory::PersonRef;
use crate::error::SyncError;
use crate::origination::PersonOriginator;

// Each originate rings a real phone, one at a time is plenty.
const ORIGINATE_CONCURRENCY: usize = 1;

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    error: String,
}

/// Query string or urlencoded body of an `/originate` request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct OriginateParams {
    pub person: Option<String>,
    pub to: Option<String>,
    pub callerid: Option<String>,
}

impl OriginateParams {
    fn merge(self, body: OriginateParams) -> OriginateParams {
        OriginateParams {
            person: body.person.or(self.person),
            to: body.to.or(self.to),
            callerid: body.callerid.or(self.callerid),
        }
    }
}

struct OriginateError(SyncError);

impl IntoResponse for OriginateError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::OriginateRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::InvalidRule(_) => StatusCode::BAD_REQUEST,
            SyncError::AuthenticationFailure | SyncError::TransportFailure(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("failed to originate call: {}", self.0);
        } else {
            warn!("rejected originate request: {}", self.0);
        }

        let error = match self.0 {
            SyncError::OriginateRejected(message) => message,
            other => other.to_string(),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
        .into_response()
}

pub fn add_routes(router: Router, originator: Option<Arc<PersonOriginator>>) -> Router {
    let router = router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index));

    // Calls can only be placed through a PBX client.
    match originator {
        Some(originator) => router.route(
            "/originate",
            routing::get(originate)
                .post(originate)
                .with_state(originator)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(ORIGINATE_CONCURRENCY)),
        ),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "cdr sync"
}

async fn originate(
    State(originator): State<Arc<PersonOriginator>>,
    Query(query): Query<OriginateParams>,
    body: Option<Form<OriginateParams>>,
) -> Response {
    let params = match body {
        Some(Form(body)) => query.merge(body),
        None => query,
    };

    let Some(person) = params
        .person
        .as_deref()
        .and_then(|p| p.trim().parse::<PersonRef>().ok())
    else {
        return bad_request("person must be a person id");
    };
    let to = params.to.unwrap_or_default();
    if to.trim().is_empty() {
        return bad_request("to is required");
    }
    let caller_id = params.callerid.unwrap_or_default();

    match originator.originate(person, &to, &caller_id).await {
        Ok(status) => Json::<OriginateStatus>(status).into_response(),
        Err(e) => OriginateError(e).into_response(),
    }
}
