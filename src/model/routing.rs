use regex::Regex;
use serde::{Deserialize, Serialize};

use super::RequestMeta;
use crate::error::{GatewayError, Result};

/// Routing definition as stored in the registry. The cfg predicate has the
/// form `<place>:<name>=<regex>` with place one of `qs`, `header`, `cookie`;
/// a request whose named value matches the regex is rerouted to
/// `clusterName`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingSpec {
    pub id: String,
    pub cluster_name: String,
    pub cfg: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    QueryString,
    Header,
    Cookie,
}

/// Runtime routing rule with the predicate compiled
pub struct Routing {
    pub spec: RoutingSpec,
    place: Place,
    name: String,
    rule: Regex,
}

impl Routing {
    pub fn parse(spec: RoutingSpec) -> Result<Self> {
        if spec.id.is_empty() {
            return Err(GatewayError::ConfigInvalid("routing id is empty".to_string()));
        }
        if spec.cluster_name.is_empty() {
            return Err(GatewayError::ConfigInvalid(format!(
                "routing <{}> has no target cluster",
                spec.id
            )));
        }

        let (place_raw, rest) = spec.cfg.split_once(':').ok_or_else(|| {
            GatewayError::ConfigInvalid(format!("routing <{}> cfg <{}>", spec.id, spec.cfg))
        })?;
        let (name, pattern) = rest.split_once('=').ok_or_else(|| {
            GatewayError::ConfigInvalid(format!("routing <{}> cfg <{}>", spec.id, spec.cfg))
        })?;

        let place = match place_raw {
            "qs" => Place::QueryString,
            "header" => Place::Header,
            "cookie" => Place::Cookie,
            other => {
                return Err(GatewayError::ConfigInvalid(format!(
                    "routing <{}> unknown place <{}>",
                    spec.id, other
                )))
            }
        };

        let rule = Regex::new(pattern).map_err(|e| {
            GatewayError::ConfigInvalid(format!("routing <{}> pattern: {}", spec.id, e))
        })?;

        Ok(Self {
            name: name.to_string(),
            place,
            rule,
            spec,
        })
    }

    pub fn matches(&self, req: &RequestMeta) -> bool {
        let value = match self.place {
            Place::QueryString => req.query_value(&self.name),
            Place::Header => req.header_value(&self.name),
            Place::Cookie => req.cookie_value(&self.name),
        };

        match value {
            Some(value) => self.rule.is_match(value),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn routing(cfg: &str) -> Routing {
        Routing::parse(RoutingSpec {
            id: "r1".to_string(),
            cluster_name: "beta".to_string(),
            cfg: cfg.to_string(),
        })
        .unwrap()
    }

    fn meta(query: Option<&str>, header: Option<(&str, &str)>) -> RequestMeta {
        let mut headers = HeaderMap::new();
        if let Some((k, v)) = header {
            headers.insert(axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(), v.parse().unwrap());
        }
        RequestMeta::new("GET".into(), "/".into(), String::new(), query, headers, None)
    }

    #[test]
    fn test_query_predicate() {
        let r = routing("qs:uid=^1\\d+$");
        assert!(r.matches(&meta(Some("uid=1234"), None)));
        assert!(!r.matches(&meta(Some("uid=234"), None)));
        assert!(!r.matches(&meta(None, None)));
    }

    #[test]
    fn test_header_predicate() {
        let r = routing("header:X-Canary=^on$");
        assert!(r.matches(&meta(None, Some(("X-Canary", "on")))));
        assert!(!r.matches(&meta(None, Some(("X-Canary", "off")))));
    }

    #[test]
    fn test_bad_cfg_rejected() {
        assert!(Routing::parse(RoutingSpec {
            id: "r1".to_string(),
            cluster_name: "beta".to_string(),
            cfg: "nonsense".to_string(),
        })
        .is_err());

        assert!(Routing::parse(RoutingSpec {
            id: "r1".to_string(),
            cluster_name: String::new(),
            cfg: "qs:uid=1".to_string(),
        })
        .is_err());
    }
}
