use super::GatewayState;
use crate::proxy::context::full_body;
use crate::proxy::BoxBody;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use hyper::Response;
use serde::Serialize;

/// Route an admin request by path. Every answer is built in-process, so this
/// never fails.
pub fn handle_admin(path: &str, state: &GatewayState) -> Response<BoxBody> {
    match path {
        "/health" | "/healthz" => json(StatusCode::OK, &serde_json::json!({ "status": "ok" })),

        "/ready" | "/readyz" => {
            let table = state.route_table();
            let ready = state.is_ready();
            let status = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(
                status,
                &serde_json::json!({
                    "status": if ready { "ready" } else { "starting" },
                    "registry": state.registry_kind(),
                    "routes": table.len(),
                    "unresolved": table.unresolved_count(),
                }),
            )
        }

        "/metrics" => match &state.metrics {
            Some(m) => {
                let mut resp = Response::new(full_body(m.render()));
                resp.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                resp
            }
            None => not_found(),
        },

        "/routes" => json(StatusCode::OK, &state.route_table().status()),

        "/breakers" => json(StatusCode::OK, &state.breakers().snapshots()),

        _ => not_found(),
    }
}

fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_string_pretty(value).unwrap_or_default();
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn not_found() -> Response<BoxBody> {
    json(StatusCode::NOT_FOUND, &serde_json::json!({ "error": "not found" }))
}
