//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Enforce the all-or-nothing TLS rule across vhosts
//! - Check host patterns, paths, methods and backend URL templates
//! - Detect conflicting routes inside a vhost, using the same matcher the
//!   router is built on
//! - Reject TLS host patterns that can never match a server name
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::{HashMap, HashSet};

use url::Url;

use crate::config::schema::{CorsPolicy, Endpoint, GatewayConfig, PATH_PLACEHOLDER};
use crate::routing::endpoint::{check_path, method_filter, route_shape};
use crate::routing::pattern::HostPattern;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("TLS must be configured on every vhost or none (missing on: {})", .missing.join(", "))]
    MixedTls { missing: Vec<String> },

    #[error("vhost {pattern:?}: invalid host pattern: {reason}")]
    InvalidHostPattern { pattern: String, reason: String },

    #[error("vhost {vhost:?}: invalid path {path:?}: {reason}")]
    InvalidPath {
        vhost: String,
        path: String,
        reason: String,
    },

    #[error("vhost {vhost:?}: endpoint {path:?} declares no methods")]
    NoMethods { vhost: String, path: String },

    #[error("vhost {vhost:?}: endpoint {path:?} has unknown method {method:?}")]
    UnknownMethod {
        vhost: String,
        path: String,
        method: String,
    },

    #[error("vhost {vhost:?}: {method} {path} is declared twice")]
    DuplicateRoute {
        vhost: String,
        path: String,
        method: String,
    },

    #[error("vhost {vhost:?}: path {path:?} conflicts with {existing:?}")]
    RouteConflict {
        vhost: String,
        path: String,
        existing: String,
    },

    #[error("vhost {vhost:?}: websocket endpoint {path:?} shares its path with another endpoint")]
    WebSocketPathConflict { vhost: String, path: String },

    #[error("vhost {vhost:?}: endpoints on {path:?} declare different CORS policies")]
    CorsConflict { vhost: String, path: String },

    #[error("vhost {pattern:?}: TLS host patterns must be lowercase, server names always are")]
    UppercaseTlsPattern { pattern: String },

    #[error("vhost {vhost:?}: endpoint {path:?} has invalid backend url {url:?}: {reason}")]
    InvalidBackendUrl {
        vhost: String,
        path: String,
        url: String,
        reason: String,
    },

    #[error("vhost {vhost:?}: TLS {kind} file {path:?} not found")]
    MissingTlsFile {
        vhost: String,
        kind: &'static str,
        path: String,
    },
}

/// Validate a complete configuration, collecting every error.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let (any_tls, all_tls) = config.tls_coverage();
    if any_tls && !all_tls {
        let missing = config
            .vhosts
            .iter()
            .filter(|(_, v)| v.tls.is_none())
            .map(|(pattern, _)| pattern.clone())
            .collect();
        errors.push(ValidationError::MixedTls { missing });
    }

    for (pattern, vhost) in &config.vhosts {
        if let Err(e) = HostPattern::parse(pattern) {
            errors.push(ValidationError::InvalidHostPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            });
        }

        if let Some(tls) = &vhost.tls {
            if pattern.chars().any(|c| c.is_ascii_uppercase()) {
                errors.push(ValidationError::UppercaseTlsPattern {
                    pattern: pattern.clone(),
                });
            }
            for (kind, path) in [("certificate", &tls.cert), ("key", &tls.key)] {
                if !path.is_file() {
                    errors.push(ValidationError::MissingTlsFile {
                        vhost: pattern.clone(),
                        kind,
                        path: path.display().to_string(),
                    });
                }
            }
        }

        validate_endpoints(pattern, &vhost.endpoints, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// First endpoint seen for a route shape.
struct Claim<'a> {
    path: &'a str,
    websocket: bool,
    cors: Option<&'a CorsPolicy>,
}

fn validate_endpoints(vhost: &str, endpoints: &[Endpoint], errors: &mut Vec<ValidationError>) {
    let mut shapes: HashMap<String, Claim<'_>> = HashMap::new();
    let mut routes: HashSet<(String, String)> = HashSet::new();
    let mut matcher = matchit::Router::new();

    for endpoint in endpoints {
        let path = endpoint.path.as_str();
        if let Err(reason) = check_path(path) {
            errors.push(ValidationError::InvalidPath {
                vhost: vhost.to_string(),
                path: path.to_string(),
                reason: reason.to_string(),
            });
            continue;
        }

        check_backend(vhost, endpoint, errors);

        let shape = route_shape(path);
        match shapes.get(&shape) {
            Some(claim) => {
                if endpoint.is_websocket() || claim.websocket {
                    errors.push(ValidationError::WebSocketPathConflict {
                        vhost: vhost.to_string(),
                        path: path.to_string(),
                    });
                    continue;
                }
                if claim.path != path {
                    errors.push(ValidationError::RouteConflict {
                        vhost: vhost.to_string(),
                        path: path.to_string(),
                        existing: claim.path.to_string(),
                    });
                    continue;
                }
                // Preflights on a shared path are answered by one policy only.
                if claim.cors != endpoint.cors.as_ref() {
                    errors.push(ValidationError::CorsConflict {
                        vhost: vhost.to_string(),
                        path: path.to_string(),
                    });
                    continue;
                }
            }
            None => {
                match matcher.insert(path, ()) {
                    Ok(()) => {}
                    Err(matchit::InsertError::Conflict { with }) => {
                        errors.push(ValidationError::RouteConflict {
                            vhost: vhost.to_string(),
                            path: path.to_string(),
                            existing: with,
                        });
                        continue;
                    }
                    Err(e) => {
                        errors.push(ValidationError::InvalidPath {
                            vhost: vhost.to_string(),
                            path: path.to_string(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                }
                shapes.insert(
                    shape.clone(),
                    Claim {
                        path,
                        websocket: endpoint.is_websocket(),
                        cors: endpoint.cors.as_ref(),
                    },
                );
            }
        }

        if endpoint.is_websocket() {
            continue;
        }

        if endpoint.methods.is_empty() {
            errors.push(ValidationError::NoMethods {
                vhost: vhost.to_string(),
                path: path.to_string(),
            });
        }
        for method in &endpoint.methods {
            if method_filter(method).is_none() {
                errors.push(ValidationError::UnknownMethod {
                    vhost: vhost.to_string(),
                    path: path.to_string(),
                    method: method.clone(),
                });
                continue;
            }
            let method = method.trim().to_ascii_uppercase();
            if !routes.insert((shape.clone(), method.clone())) {
                errors.push(ValidationError::DuplicateRoute {
                    vhost: vhost.to_string(),
                    path: path.to_string(),
                    method,
                });
            }
        }
    }
}

fn check_backend(vhost: &str, endpoint: &Endpoint, errors: &mut Vec<ValidationError>) {
    let template = &endpoint.backend.url;
    let schemes: &[&str] = if endpoint.is_websocket() {
        &["ws", "wss"]
    } else {
        &["http", "https"]
    };

    let reason = match Url::parse(&template.replace(PATH_PLACEHOLDER, "/")) {
        Err(e) => Some(e.to_string()),
        Ok(url) if !schemes.contains(&url.scheme()) => Some(format!(
            "scheme must be one of {}",
            schemes.join(", ")
        )),
        Ok(url) if url.host_str().is_none() => Some("missing host".to_string()),
        Ok(_) => None,
    };

    if let Some(reason) = reason {
        errors.push(ValidationError::InvalidBackendUrl {
            vhost: vhost.to_string(),
            path: endpoint.path.clone(),
            url: template.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{Backend, TlsMaterial, Vhost, WebSocketPolicy};

    fn http(path: &str, methods: &[&str]) -> Endpoint {
        Endpoint {
            path: path.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            backend: Backend {
                url: "http://127.0.0.1:9000${path}".to_string(),
                timeout: 30,
            },
            cors: None,
            websocket: None,
        }
    }

    fn ws(path: &str) -> Endpoint {
        Endpoint {
            path: path.to_string(),
            methods: Vec::new(),
            backend: Backend {
                url: "ws://127.0.0.1:9001${path}".to_string(),
                timeout: 30,
            },
            cors: None,
            websocket: Some(WebSocketPolicy {
                allowed_origins: vec!["*".into()],
                ..Default::default()
            }),
        }
    }

    fn config(endpoints: Vec<Endpoint>) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.vhosts.insert(
            "api.example.com".into(),
            Vhost {
                endpoints,
                ..Default::default()
            },
        );
        config
    }

    #[test]
    fn valid_config_passes() {
        let config = config(vec![
            http("/users", &["GET", "POST"]),
            http("/users", &["DELETE"]),
            http("/users/{id}", &["GET"]),
            ws("/ws"),
        ]);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn duplicate_route_detected() {
        let config = config(vec![http("/users", &["GET"]), http("/users", &["get"])]);
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateRoute {
                vhost: "api.example.com".into(),
                path: "/users".into(),
                method: "GET".into(),
            }]
        );
    }

    #[test]
    fn capture_name_conflict_detected() {
        let config = config(vec![http("/users/{id}", &["GET"]), http("/users/{name}", &["POST"])]);
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::RouteConflict { .. }));
    }

    #[test]
    fn bare_wildcard_segments_rejected() {
        for path in ["/files/*", "/x/*rest"] {
            let errors = validate_config(&config(vec![http(path, &["GET"])])).unwrap_err();
            assert!(
                matches!(&errors[0], ValidationError::InvalidPath { path: p, .. } if p == path),
                "{path}: {errors:?}"
            );
        }
    }

    #[test]
    fn capture_and_catch_all_at_same_position_conflict() {
        for (first, second) in [("/users/{id}", "/users/{*rest}"), ("/{id}", "/{*rest}")] {
            let errors =
                validate_config(&config(vec![http(first, &["GET"]), http(second, &["POST"])]))
                    .unwrap_err();
            assert_eq!(errors.len(), 1, "{first} + {second}: {errors:?}");
            assert!(matches!(
                &errors[0],
                ValidationError::RouteConflict { path, .. } if path == second
            ));
        }

        // A static segment next to a capture is fine.
        let config = config(vec![http("/users/me", &["GET"]), http("/users/{id}", &["GET"])]);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn shared_path_needs_one_cors_policy() {
        let mut open = http("/users", &["POST"]);
        open.cors = Some(CorsPolicy {
            allowed_origins: vec!["*".into()],
            ..Default::default()
        });
        let errors = validate_config(&config(vec![http("/users", &["GET"]), open.clone()]))
            .unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::CorsConflict {
                vhost: "api.example.com".into(),
                path: "/users".into(),
            }]
        );

        let mut same = open.clone();
        same.methods = vec!["DELETE".into()];
        assert!(validate_config(&config(vec![open, same])).is_ok());
    }

    #[test]
    fn uppercase_tls_pattern_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();

        let mut config = GatewayConfig::default();
        config.vhosts.insert(
            "API.example.com".into(),
            Vhost {
                endpoints: vec![http("/a", &["GET"])],
                tls: Some(TlsMaterial { cert, key }),
                ..Default::default()
            },
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::UppercaseTlsPattern {
                pattern: "API.example.com".into()
            }]
        );
    }

    #[test]
    fn websocket_path_must_be_exclusive() {
        let config = config(vec![http("/live", &["GET"]), ws("/live")]);
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::WebSocketPathConflict { .. }));
    }

    #[test]
    fn all_errors_are_reported() {
        let mut bad_backend = http("/c", &["GET"]);
        bad_backend.backend.url = "ws://wrong-scheme".into();
        let config = config(vec![
            http("nope", &["GET"]),
            http("/a", &[]),
            http("/b", &["BREW"]),
            bad_backend,
        ]);
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(matches!(errors[0], ValidationError::InvalidPath { .. }));
        assert!(matches!(errors[1], ValidationError::NoMethods { .. }));
        assert!(matches!(errors[2], ValidationError::UnknownMethod { .. }));
        assert!(matches!(errors[3], ValidationError::InvalidBackendUrl { .. }));
    }

    #[test]
    fn mixed_tls_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();

        let mut config = config(vec![http("/a", &["GET"])]);
        config.vhosts["api.example.com"].tls = Some(TlsMaterial {
            cert: cert.clone(),
            key: key.clone(),
        });
        assert!(validate_config(&config).is_ok());

        config.vhosts.insert("plain.example.com".into(), Vhost::default());
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::MixedTls {
                missing: vec!["plain.example.com".into()]
            }]
        );
    }

    #[test]
    fn missing_tls_files_rejected() {
        let mut config = config(vec![http("/a", &["GET"])]);
        config.vhosts["api.example.com"].tls = Some(TlsMaterial {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ValidationError::MissingTlsFile { .. })));
    }

    #[test]
    fn invalid_host_pattern_rejected() {
        let mut config = GatewayConfig::default();
        config.vhosts.insert("node[0-9".into(), Vhost::default());
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::InvalidHostPattern { .. }));
    }
}
