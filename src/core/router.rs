//! Longest-prefix path routing onto upstream services.
use std::{collections::BTreeMap, sync::Arc};

use crate::{
    config::RouteConfig,
    core::{
        error::GatewayError,
        upstream::{UpstreamError, UpstreamService},
    },
};

#[derive(Debug, Clone)]
struct RouteEntry {
    prefix: String,
    service: Arc<UpstreamService>,
    strip_prefix: bool,
}

/// Result of resolving a request path.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub prefix: String,
    pub service: Arc<UpstreamService>,
    /// Path to request on the upstream, after any prefix stripping
    pub upstream_path: String,
}

impl ResolvedRoute {
    pub fn service_name(&self) -> &str {
        self.service.name()
    }
}

/// Static routing table, sorted by descending prefix length.
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<RouteEntry>,
}

impl Router {
    /// Build the table. Every route must name a service from `services`.
    pub fn new(
        routes: &[RouteConfig],
        services: &BTreeMap<String, Arc<UpstreamService>>,
    ) -> Result<Self, UpstreamError> {
        let mut entries = routes
            .iter()
            .map(|route| {
                let service = services.get(&route.service).cloned().ok_or_else(|| {
                    UpstreamError::UnknownService {
                        prefix: route.prefix.clone(),
                        service: route.service.clone(),
                    }
                })?;
                Ok(RouteEntry {
                    prefix: route.prefix.clone(),
                    service,
                    strip_prefix: route.strip_prefix,
                })
            })
            .collect::<Result<Vec<_>, UpstreamError>>()?;

        // longest first; ties broken lexically so ordering is deterministic
        entries.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });

        Ok(Self { routes: entries })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolve `path` to the service owning the longest matching prefix.
    pub fn resolve(&self, path: &str) -> Result<ResolvedRoute, GatewayError> {
        let entry = self
            .routes
            .iter()
            .find(|entry| path.starts_with(&entry.prefix))
            .ok_or_else(|| GatewayError::RouteNotFound {
                path: path.to_string(),
            })?;

        let upstream_path = if entry.strip_prefix {
            let rest = &path[entry.prefix.len()..];
            if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            }
        } else {
            path.to_string()
        };

        Ok(ResolvedRoute {
            prefix: entry.prefix.clone(),
            service: entry.service.clone(),
            upstream_path,
        })
    }

    /// `(prefix, service)` pairs in match order.
    pub fn table(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes
            .iter()
            .map(|entry| (entry.prefix.as_str(), entry.service.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamServiceConfig;

    fn services(names: &[&str]) -> BTreeMap<String, Arc<UpstreamService>> {
        names
            .iter()
            .map(|name| {
                let config = UpstreamServiceConfig::new(format!("http://{name}:8080"));
                (
                    name.to_string(),
                    Arc::new(UpstreamService::from_config(name, &config).unwrap()),
                )
            })
            .collect()
    }

    fn route(prefix: &str, service: &str, strip_prefix: bool) -> RouteConfig {
        RouteConfig {
            prefix: prefix.to_string(),
            service: service.to_string(),
            strip_prefix,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let services = services(&["auth", "accounts"]);
        let router = Router::new(
            &[
                route("/auth", "auth", false),
                route("/authentication", "accounts", false),
            ],
            &services,
        )
        .unwrap();

        let resolved = router.resolve("/authentication/x").unwrap();
        assert_eq!(resolved.service_name(), "accounts");
        assert_eq!(resolved.prefix, "/authentication");

        assert_eq!(router.resolve("/auth/login").unwrap().service_name(), "auth");
        // plain prefix semantics: no segment boundary is required
        assert_eq!(router.resolve("/authx").unwrap().service_name(), "auth");
    }

    #[test]
    fn unmatched_path_is_not_found() {
        let services = services(&["combat"]);
        let router = Router::new(&[route("/api/v1/combat", "combat", false)], &services).unwrap();

        let err = router.resolve("/api/v1/chat/rooms").unwrap_err();
        assert!(matches!(err, GatewayError::RouteNotFound { .. }));
        assert_eq!(err.status(), http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn strip_prefix_rewrites_upstream_path() {
        let services = services(&["chat", "combat"]);
        let router = Router::new(
            &[
                route("/api/v1/chat", "chat", true),
                route("/api/v1/combat", "combat", false),
            ],
            &services,
        )
        .unwrap();

        assert_eq!(
            router.resolve("/api/v1/chat/rooms/7").unwrap().upstream_path,
            "/rooms/7"
        );
        assert_eq!(router.resolve("/api/v1/chat").unwrap().upstream_path, "/");
        assert_eq!(
            router
                .resolve("/api/v1/combat/initiate")
                .unwrap()
                .upstream_path,
            "/api/v1/combat/initiate"
        );
    }

    #[test]
    fn unknown_service_is_rejected() {
        let services = services(&["chat"]);
        let err = Router::new(&[route("/api/v1/trading", "trading", false)], &services).unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::UnknownService { ref prefix, ref service }
                if prefix == "/api/v1/trading" && service == "trading"
        ));
    }

    #[test]
    fn table_is_in_match_order() {
        let services = services(&["a", "b", "c"]);
        let router = Router::new(
            &[
                route("/api", "a", false),
                route("/api/v1/items", "c", false),
                route("/api/v1", "b", false),
            ],
            &services,
        )
        .unwrap();

        let prefixes: Vec<_> = router.table().map(|(prefix, _)| prefix).collect();
        assert_eq!(prefixes, ["/api/v1/items", "/api/v1", "/api"]);
    }
}
