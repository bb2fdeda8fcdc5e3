//! Static route matching
//!
//! Routes are evaluated in declaration order and the first fully matching one
//! wins. A route matches when its service-name matcher, its `:authority`
//! matcher and all of its required metadata pairs match; a miss across the
//! whole table is an unknown-route rejection.

use tonic::metadata::MetadataMap;

use crate::config::RouterConfig;
use crate::error::RelayError;

struct CompiledRoute {
    backend_name: String,
    service: String,
    authority: String,
    /// Required pairs, keys lowercased once at build time.
    metadata: Vec<(String, String)>,
}

/// Immutable first-match router over a route table.
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let routes = config
            .routes
            .into_iter()
            .map(|route| CompiledRoute {
                backend_name: route.backend_name,
                service: route.service_name_matcher,
                authority: route.authority_matcher,
                metadata: route
                    .metadata_matcher
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v))
                    .collect(),
            })
            .collect();
        Self { routes }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Return the backend name for a call, or a route-not-found rejection.
    ///
    /// `full_method` is the full method name, with or without its leading
    /// slash (`pkg.Service/Method`).
    pub fn route(
        &self,
        full_method: &str,
        authority: Option<&str>,
        metadata: &MetadataMap,
    ) -> Result<&str, RelayError> {
        let method = full_method.strip_prefix('/').unwrap_or(full_method);
        for route in &self.routes {
            if !service_matches(method, &route.service) {
                continue;
            }
            if !authority_matches(authority, &route.authority) {
                continue;
            }
            if !metadata_matches(metadata, &route.metadata) {
                continue;
            }
            return Ok(&route.backend_name);
        }
        Err(RelayError::RouteNotFound {
            method: method.to_string(),
        })
    }
}

fn service_matches(full_method: &str, matcher: &str) -> bool {
    if matcher.is_empty() || matcher == "*" {
        return true;
    }
    if let Some(prefix) = matcher.strip_suffix('*') {
        return full_method.starts_with(prefix);
    }
    full_method == matcher
}

fn authority_matches(authority: Option<&str>, matcher: &str) -> bool {
    if matcher.is_empty() {
        return true;
    }
    // An authority was required and the call carried none.
    authority.is_some_and(|a| a == matcher)
}

fn metadata_matches(metadata: &MetadataMap, expected: &[(String, String)]) -> bool {
    expected.iter().all(|(key, value)| {
        metadata
            .get_all(key.as_str())
            .iter()
            .any(|v| v.to_str().is_ok_and(|v| v == value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use std::collections::HashMap;

    fn route(backend: &str, service: &str) -> RouteConfig {
        RouteConfig {
            backend_name: backend.to_string(),
            service_name_matcher: service.to_string(),
            ..RouteConfig::default()
        }
    }

    /// The reference route table the original router ships with.
    fn test_router() -> Router {
        Router::new(RouterConfig {
            routes: vec![
                route("backendA", "com.example.a.*"),
                RouteConfig {
                    authority_matcher: "authority_a.service.local".to_string(),
                    ..route("backendB_authorityA", "com.*")
                },
                RouteConfig {
                    authority_matcher: "authority_b.service.local".to_string(),
                    ..route("backendB_authorityB", "*")
                },
                RouteConfig {
                    metadata_matcher: HashMap::from([
                        ("keyOne".to_string(), "valueOne".to_string()),
                        ("keyTwo".to_string(), "valueTwo".to_string()),
                    ]),
                    ..route("backendD", "com.example.")
                },
                route("backendCatchAllCom", "com.*"),
            ],
        })
    }

    fn md(pairs: &[(&str, &str)]) -> MetadataMap {
        let mut md = MetadataMap::new();
        for (k, v) in pairs {
            md.append(k.parse::<tonic::metadata::AsciiMetadataKey>().unwrap(), v.parse().unwrap());
        }
        md
    }

    #[test]
    fn test_matches_no_authority_just_service() {
        let router = test_router();
        let backend = router
            .route("com.example.a.MyService", None, &md(&[]))
            .unwrap();
        assert_eq!(backend, "backendA");
    }

    #[test]
    fn test_matches_authority_and_service() {
        let router = test_router();
        let backend = router
            .route(
                "com.example.blah.MyService",
                Some("authority_a.service.local"),
                &md(&[]),
            )
            .unwrap();
        assert_eq!(backend, "backendB_authorityA");
    }

    #[test]
    fn test_matches_authority_and_service_take_two() {
        let router = test_router();
        let backend = router
            .route(
                "something.else.MyService",
                Some("authority_b.service.local"),
                &md(&[]),
            )
            .unwrap();
        assert_eq!(backend, "backendB_authorityB");
    }

    #[test]
    fn test_metadata_call_falls_to_catch_all() {
        // The "com.example." matcher on backendD is literal equality (no
        // trailing `*`), so it never matches a real method name and the
        // metadata-bearing call falls through to the com.* catch-all. This
        // mirrors the original table, ambiguity included.
        let router = test_router();
        let backend = router
            .route(
                "com.example.whatever.MyService",
                None,
                &md(&[
                    ("keyone", "valueOne"),
                    ("keytwo", "valueTwo"),
                    ("keythree", "somethingUnmatched"),
                ]),
            )
            .unwrap();
        assert_eq!(backend, "backendCatchAllCom");
    }

    #[test]
    fn test_falls_back_to_catch_all_on_partial_metadata() {
        let router = test_router();
        let backend = router
            .route(
                "com.example.whatever.MyService",
                None,
                &md(&[("keytwo", "valueTwo")]),
            )
            .unwrap();
        assert_eq!(backend, "backendCatchAllCom");
    }

    #[test]
    fn test_falls_back_to_catch_all_on_bad_authority() {
        let router = test_router();
        let backend = router
            .route(
                "com.example.blah.MyService",
                Some("authority_else.service.local"),
                &md(&[]),
            )
            .unwrap();
        assert_eq!(backend, "backendCatchAllCom");
    }

    #[test]
    fn test_no_backend_at_all() {
        let router = test_router();
        let err = router
            .route(
                "noncom.else.MyService",
                Some("authority_else.service.local"),
                &md(&[]),
            )
            .unwrap_err();
        assert!(matches!(err, RelayError::RouteNotFound { .. }));
    }

    #[test]
    fn test_first_match_wins() {
        let router = Router::new(RouterConfig {
            routes: vec![route("first", "com.*"), route("second", "com.*")],
        });
        let backend = router.route("com.thing.Service", None, &md(&[])).unwrap();
        assert_eq!(backend, "first");
    }

    #[test]
    fn test_literal_matcher_with_trailing_dot_never_matches_methods() {
        let router = Router::new(RouterConfig {
            routes: vec![route("literal", "com.example.")],
        });
        // Only exact equality matches a trailing-dot matcher; any real
        // service/method name misses.
        assert!(router
            .route("com.example.Svc/Method", None, &md(&[]))
            .is_err());
        assert_eq!(
            router.route("com.example.", None, &md(&[])).unwrap(),
            "literal"
        );
    }

    #[test]
    fn test_leading_slash_is_stripped() {
        let router = test_router();
        let backend = router
            .route("/com.example.a.MyService/Method", None, &md(&[]))
            .unwrap();
        assert_eq!(backend, "backendA");
    }

    #[test]
    fn test_metadata_keys_case_insensitive() {
        // Config uses mixed case, wire metadata is lowercase.
        let router = Router::new(RouterConfig {
            routes: vec![RouteConfig {
                metadata_matcher: HashMap::from([("Tenant-Id".to_string(), "t1".to_string())]),
                ..route("tenant", "*")
            }],
        });
        assert_eq!(
            router
                .route("any.Service/Do", None, &md(&[("tenant-id", "t1")]))
                .unwrap(),
            "tenant"
        );
        assert!(router
            .route("any.Service/Do", None, &md(&[("tenant-id", "t2")]))
            .is_err());
    }

    #[test]
    fn test_metadata_any_value_matches() {
        let router = Router::new(RouterConfig {
            routes: vec![RouteConfig {
                metadata_matcher: HashMap::from([("env".to_string(), "prod".to_string())]),
                ..route("prod", "*")
            }],
        });
        // Repeated key: one matching value is enough.
        assert_eq!(
            router
                .route(
                    "any.Service/Do",
                    None,
                    &md(&[("env", "staging"), ("env", "prod")])
                )
                .unwrap(),
            "prod"
        );
    }

    #[test]
    fn test_empty_and_star_match_everything() {
        assert!(service_matches("a.B/C", ""));
        assert!(service_matches("a.B/C", "*"));
        assert!(service_matches("a.B/C", "a.*"));
        assert!(!service_matches("a.B/C", "b.*"));
        assert!(service_matches("a.B/C", "a.B/C"));
    }
}
