//! Prefix routing from request paths to backend services.
//!
//! The table is built once from the service list and never changes, so it is
//! shared between connections behind an `Arc` without locking.
//!
//! Matching is a literal string-prefix test evaluated longest prefix first,
//! with the service that owns no prefix acting as the fallback. A request for
//! exactly a prefix (no trailing slash) is answered with a redirect to the
//! canonical `prefix/` form instead of being proxied.

use crate::config::ServiceSpec;

/// A backend a request can be forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub service: String,
    pub port: u16,
}

/// One prefix rule; the fallback has an empty prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub target: RouteTarget,
}

/// Outcome of routing one request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision<'a> {
    /// Answer with 301 to `location` without contacting a backend
    Redirect { location: String },
    /// Proxy the request, path unchanged, to this backend
    Forward(&'a RouteTarget),
}

/// Immutable routing table
#[derive(Debug, Clone)]
pub struct RouteTable {
    /// Prefixed rules, most specific first
    rules: Vec<RouteRule>,
    fallback: RouteTarget,
}

impl RouteTable {
    /// Build from validated service specs.
    ///
    /// Returns `None` when no service is marked as the fallback.
    pub fn from_services(services: &[ServiceSpec]) -> Option<Self> {
        let fallback = services.iter().find(|s| s.is_fallback()).map(|s| RouteTarget {
            service: s.name.clone(),
            port: s.port,
        })?;

        let mut rules: Vec<RouteRule> = services
            .iter()
            .filter(|s| !s.is_fallback())
            .map(|s| RouteRule {
                prefix: s.prefix.clone(),
                target: RouteTarget {
                    service: s.name.clone(),
                    port: s.port,
                },
            })
            .collect();
        // Stable sort keeps configuration order between equal lengths
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Some(Self { rules, fallback })
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn fallback(&self) -> &RouteTarget {
        &self.fallback
    }

    /// Route a request path. `query` is carried over into redirects.
    pub fn resolve(&self, path: &str, query: Option<&str>) -> RouteDecision<'_> {
        if let Some(rule) = self.rules.iter().find(|r| r.prefix == path) {
            let location = match query {
                Some(q) if !q.is_empty() => format!("{}/?{}", rule.prefix, q),
                _ => format!("{}/", rule.prefix),
            };
            return RouteDecision::Redirect { location };
        }

        self.rules
            .iter()
            .find(|r| path.starts_with(r.prefix.as_str()))
            .map(|r| RouteDecision::Forward(&r.target))
            .unwrap_or(RouteDecision::Forward(&self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::from_services(&[
            ServiceSpec::new("admin", "node", 3001).with_prefix("/admin"),
            ServiceSpec::new("agency", "node", 3002).with_prefix("/agency"),
            ServiceSpec::new("client", "node", 3003),
        ])
        .unwrap()
    }

    fn forwarded_to(table: &RouteTable, path: &str) -> String {
        match table.resolve(path, None) {
            RouteDecision::Forward(target) => target.service.clone(),
            other => panic!("expected forward for {}, got {:?}", path, other),
        }
    }

    #[test]
    fn test_bare_prefix_redirects_with_trailing_slash() {
        let table = table();
        assert_eq!(
            table.resolve("/admin", None),
            RouteDecision::Redirect {
                location: "/admin/".to_string()
            }
        );
        assert_eq!(
            table.resolve("/agency", None),
            RouteDecision::Redirect {
                location: "/agency/".to_string()
            }
        );
    }

    #[test]
    fn test_redirect_keeps_query_string() {
        let table = table();
        assert_eq!(
            table.resolve("/admin", Some("tab=users&page=2")),
            RouteDecision::Redirect {
                location: "/admin/?tab=users&page=2".to_string()
            }
        );
        assert_eq!(
            table.resolve("/admin", Some("")),
            RouteDecision::Redirect {
                location: "/admin/".to_string()
            }
        );
    }

    #[test]
    fn test_prefixed_paths_go_to_owner() {
        let table = table();
        assert_eq!(forwarded_to(&table, "/admin/"), "admin");
        assert_eq!(forwarded_to(&table, "/admin/dashboard"), "admin");
        assert_eq!(forwarded_to(&table, "/admin/_next/static/app.js"), "admin");
        assert_eq!(forwarded_to(&table, "/agency/clients/42"), "agency");
    }

    #[test]
    fn test_prefix_match_is_literal() {
        let table = table();
        assert_eq!(forwarded_to(&table, "/administrator"), "admin");
        assert_eq!(forwarded_to(&table, "/agencyx"), "agency");
        assert_eq!(forwarded_to(&table, "/Admin/dashboard"), "client");
    }

    #[test]
    fn test_unmatched_paths_use_fallback() {
        let table = table();
        assert_eq!(forwarded_to(&table, "/"), "client");
        assert_eq!(forwarded_to(&table, "/photo.png"), "client");
        assert_eq!(forwarded_to(&table, "/adm"), "client");
        assert_eq!(forwarded_to(&table, ""), "client");
    }

    #[test]
    fn test_longest_prefix_wins_regardless_of_order() {
        let table = RouteTable::from_services(&[
            ServiceSpec::new("admin", "node", 3001).with_prefix("/admin"),
            ServiceSpec::new("reports", "node", 3004).with_prefix("/admin/reports"),
            ServiceSpec::new("client", "node", 3003),
        ])
        .unwrap();

        assert_eq!(table.rules()[0].prefix, "/admin/reports");
        assert_eq!(forwarded_to(&table, "/admin/reports/q3"), "reports");
        assert_eq!(forwarded_to(&table, "/admin/users"), "admin");
        assert_eq!(
            table.resolve("/admin/reports", None),
            RouteDecision::Redirect {
                location: "/admin/reports/".to_string()
            }
        );
    }

    #[test]
    fn test_target_carries_port() {
        let table = table();
        match table.resolve("/agency/x", None) {
            RouteDecision::Forward(target) => assert_eq!(target.port, 3002),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.fallback().port, 3003);
    }

    #[test]
    fn test_requires_fallback() {
        let services = [ServiceSpec::new("admin", "node", 3001).with_prefix("/admin")];
        assert!(RouteTable::from_services(&services).is_none());
    }
}
