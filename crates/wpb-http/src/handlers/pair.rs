use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use wpb_core::{errors::Error, service::PairOutcome};

use crate::router::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PairQuery {
    #[serde(default)]
    phone: Option<String>,
    /// Alias accepted for older clients.
    #[serde(default)]
    number: Option<String>,
}

impl PairQuery {
    fn raw_phone(&self) -> Option<&str> {
        self.phone
            .as_deref()
            .or(self.number.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

pub async fn pair(State(state): State<AppState>, Query(q): Query<PairQuery>) -> Response {
    let Some(raw) = q.raw_phone() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Phone number required"})),
        )
            .into_response();
    };

    match state.service.pair(raw).await {
        Ok(PairOutcome::Code(code)) => Json(json!({ "code": code })).into_response(),
        Ok(PairOutcome::Running { phone, registered }) => Json(json!({
            "status": "Bot connected & running",
            "phone": phone,
            "registered": registered,
        }))
        .into_response(),
        Err(e) => {
            let (status, body) = error_response(&e);
            let mut resp = (status, Json(body)).into_response();
            if let Error::RateLimited { retry_after } = &e {
                let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                resp.headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            resp
        }
    }
}

/// Map a pairing failure to the status code and JSON body the caller sees.
pub fn error_response(e: &Error) -> (StatusCode, Value) {
    match e {
        Error::InvalidPhoneFormat { digits } => {
            info!(digits, "rejected phone number");
            (
                StatusCode::BAD_REQUEST,
                json!({"error": "Invalid phone number format"}),
            )
        }
        Error::Busy => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "Pairing already in progress. Please wait a few seconds and retry."}),
        ),
        Error::RateLimited { .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "Too many requests. Please wait a bit before requesting a new code."}),
        ),
        Error::ConnectionClosedEarly { details } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "error": "Connection closed before pairing code could be generated",
                "details": details,
            }),
        ),
        Error::PairingRejected(details) | Error::PairingExhausted { details, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "Failed to generate pairing code", "details": details}),
        ),
        Error::TimedOut(_) => {
            warn!("pairing timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                json!({"error": "Pairing timeout. Try again."}),
            )
        }
        other => {
            error!(error = %other, "pair handler error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Internal server error", "details": other.to_string()}),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn phone_and_number_aliases() {
        let q = PairQuery {
            phone: None,
            number: Some(" 15551234567 ".to_string()),
        };
        assert_eq!(q.raw_phone(), Some("15551234567"));

        let q = PairQuery {
            phone: Some("   ".to_string()),
            number: None,
        };
        assert_eq!(q.raw_phone(), None);
        assert_eq!(PairQuery::default().raw_phone(), None);
    }

    #[test]
    fn terminal_errors_map_to_documented_statuses() {
        let cases = [
            (Error::InvalidPhoneFormat { digits: 3 }, 400),
            (Error::Busy, 429),
            (
                Error::RateLimited {
                    retry_after: Duration::from_secs(5),
                },
                429,
            ),
            (
                Error::ConnectionClosedEarly {
                    details: "conflict".to_string(),
                },
                500,
            ),
            (Error::PairingRejected("bad".to_string()), 500),
            (
                Error::PairingExhausted {
                    attempts: 5,
                    details: "503".to_string(),
                },
                500,
            ),
            (Error::TimedOut(Duration::from_secs(25)), 504),
            (Error::External("boom".to_string()), 500),
        ];
        for (err, status) in cases {
            let (got, body) = error_response(&err);
            assert_eq!(got.as_u16(), status, "{err}");
            assert!(body["error"].is_string(), "{err}");
        }
    }

    #[test]
    fn closed_early_carries_details() {
        let (_, body) = error_response(&Error::ConnectionClosedEarly {
            details: "stream errored".to_string(),
        });
        assert_eq!(
            body,
            json!({
                "error": "Connection closed before pairing code could be generated",
                "details": "stream errored",
            })
        );

        let (_, body) = error_response(&Error::External("disk full".to_string()));
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["details"], "external error: disk full");
    }
}
