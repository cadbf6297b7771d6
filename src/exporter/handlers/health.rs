use crate::exporter::GIT_COMMIT_HASH;
use crate::gg::DatabaseService;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
    name: String,
    version: String,
    database: String,
}

fn create_health_response(database_up: bool) -> Health {
    Health {
        commit: GIT_COMMIT_HASH.map(ToString::to_string),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if database_up {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    }
}

fn create_response_body(method: &Method, health: &Health) -> Body {
    if method == Method::GET {
        Json(health).into_response().into_body()
    } else {
        Body::empty()
    }
}

// X-App: name:version[:shorthash]
fn create_app_headers(health: &Health) -> HeaderMap {
    let short_hash = health
        .commit
        .as_deref()
        .filter(|s| s.len() > 7)
        .map(|s| &s[0..7])
        .unwrap_or("");

    let header_value = if short_hash.is_empty() {
        format!("{}:{}", health.name, health.version)
    } else {
        format!("{}:{}:{}", health.name, health.version, short_hash)
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) = header_value.parse::<HeaderValue>() {
        headers.insert("X-App", value);
    }
    headers
}

/// Liveness/readiness probe: pings the coordinator through the pooled
/// connection and reports build info.
pub async fn health(
    method: Method,
    Extension(service): Extension<Arc<DatabaseService>>,
) -> impl IntoResponse {
    let database_up = service.test_connection().await;
    let health = create_health_response(database_up);
    let body = create_response_body(&method, &health);
    let headers = create_app_headers(&health);

    if database_up {
        debug!("Database connection is healthy");
        (StatusCode::OK, headers, body)
    } else {
        debug!("Database connection is unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_serialization_with_commit() {
        let health = Health {
            commit: Some("abc123".to_string()),
            name: "gg_exporter".to_string(),
            version: "1.0.0".to_string(),
            database: "ok".to_string(),
        };

        let json = serde_json::to_string(&health).unwrap();
        assert!(json.contains("abc123"));
        assert!(json.contains("gg_exporter"));
        assert!(json.contains("ok"));
    }

    #[test]
    fn test_health_serialization_omits_missing_commit() {
        let health = Health {
            commit: None,
            name: "gg_exporter".to_string(),
            version: "1.0.0".to_string(),
            database: "error".to_string(),
        };

        let json = serde_json::to_string(&health).unwrap();
        assert!(!json.contains("commit"));
        assert!(json.contains("error"));
    }

    #[test]
    fn test_create_health_response_states() {
        assert_eq!(create_health_response(true).database, "ok");
        assert_eq!(create_health_response(false).database, "error");
    }

    #[test]
    fn test_app_header_with_full_hash() {
        let health = Health {
            commit: Some("abc123def456".to_string()),
            name: "gg_exporter".to_string(),
            version: "1.2.3".to_string(),
            database: "ok".to_string(),
        };

        let headers = create_app_headers(&health);
        assert_eq!(
            headers.get("X-App").unwrap().to_str().unwrap(),
            "gg_exporter:1.2.3:abc123d"
        );
    }

    #[test]
    fn test_app_header_without_commit() {
        let health = Health {
            commit: None,
            name: "gg_exporter".to_string(),
            version: "1.0.0".to_string(),
            database: "ok".to_string(),
        };

        let headers = create_app_headers(&health);
        assert_eq!(
            headers.get("X-App").unwrap().to_str().unwrap(),
            "gg_exporter:1.0.0"
        );
    }
}
