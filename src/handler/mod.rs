mod mutate;

pub use mutate::{ca_volume_patch, is_opted_in, mutate, OPT_IN_LABEL_KEY, OPT_IN_LABEL_VALUE};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{self, IntoResponse},
    routing, Router,
};
use kube::core::{
    admission::{
        AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError,
        SerializePatchError,
    },
    DynamicObject, TypeMeta,
};
use serde_json::Value;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::controller::ControllerState;

const JSON_CONTENT_TYPE: &str = "application/json";
const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";

#[derive(Clone)]
pub struct AppState {
    controller_state: watch::Receiver<ControllerState>,
}

pub fn create_app(controller_state: watch::Receiver<ControllerState>) -> Router {
    Router::new()
        .route("/ping", routing::get(ping))
        .route("/healthz", routing::get(healthz))
        .route("/mutate", routing::post(mutate_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { controller_state })
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to decode admission review: {0}")]
    DecodeReview(#[source] serde_json::Error),
    #[error("invalid admission review: {0}")]
    InvalidReview(#[source] ConvertAdmissionReviewError),
    #[error("admission request does not contain an object")]
    MissingObject,
    #[error("failed to decode pod: {0}")]
    DecodePod(#[source] serde_json::Error),
    #[error("failed to serialize Patch object: {0}")]
    SerializePatch(#[source] SerializePatchError),
    #[error("failed to encode admission review: {0}")]
    SerializeReview(#[source] serde_json::Error),
}

impl response::IntoResponse for Error {
    fn into_response(self) -> response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

type ResultResponse<T> = Result<T, Error>;

async fn ping() -> &'static str {
    "ok"
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match *state.controller_state.borrow() {
        ControllerState::Failed => (
            StatusCode::SERVICE_UNAVAILABLE,
            "namespace controller is not running",
        ),
        _ => (StatusCode::OK, "ok"),
    }
}

fn decode_request(body: &[u8]) -> Result<AdmissionRequest<DynamicObject>, Error> {
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(body).map_err(Error::DecodeReview)?;
    review.try_into().map_err(Error::InvalidReview)
}

/// Response for a review that could not be decoded far enough to build a request.
///
/// The object is decoded strictly along with the envelope, so a malformed pod
/// fails here too. The UID and API version are still echoed whenever the body
/// is JSON carrying them.
fn invalid_response(error: Error, body: &[u8]) -> AdmissionResponse {
    let envelope = serde_json::from_slice::<Value>(body).ok();
    let field = |pointer: &str| {
        envelope
            .as_ref()
            .and_then(|review| review.pointer(pointer))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let mut resp = AdmissionResponse::invalid(error);
    resp.uid = field("/request/uid").unwrap_or_default();
    resp.types = TypeMeta {
        api_version: field("/apiVersion")
            .unwrap_or_else(|| ADMISSION_API_VERSION.to_string()),
        kind: ADMISSION_REVIEW_KIND.to_string(),
    };
    resp
}

async fn mutate_handler(headers: HeaderMap, body: Bytes) -> ResultResponse<response::Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if content_type != Some(JSON_CONTENT_TYPE) {
        tracing::error!(?content_type, "invalid Content-Type, want application/json");
        return Ok((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "invalid Content-Type, want application/json",
        )
            .into_response());
    }

    let resp = match decode_request(&body) {
        Ok(req) => mutate(&req),
        Err(error) => {
            tracing::error!(%error, "invalid request");
            invalid_response(error, &body)
        }
    };

    let review = serde_json::to_vec(&resp.into_review()).map_err(|error| {
        tracing::error!(%error, "failed to encode response");
        Error::SerializeReview(error)
    })?;

    Ok(([(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], review).into_response())
}
