pub mod analysis;
pub mod api;
pub mod cluster;
pub mod route_table;
pub mod routing;
pub mod server;
pub mod timer;

pub use analysis::Analysis;
pub use api::{Api, ApiSpec, MatchRule, Node};
pub use cluster::{Cluster, ClusterSpec, LoadBalance};
pub use route_table::{RouteResult, RouteTable};
pub use routing::{Routing, RoutingSpec};
pub use server::{Circuit, Server, ServerSpec, Status};

use axum::http::HeaderMap;
use std::net::IpAddr;

/// Request attributes used for matching and selection, extracted once per
/// request so the route table never touches the request body.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: String,
    pub path: String,
    pub host: String,
    pub raw_query: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
}

impl RequestMeta {
    pub fn new(
        method: String,
        path: String,
        host: String,
        raw_query: Option<&str>,
        headers: HeaderMap,
        client_ip: Option<IpAddr>,
    ) -> Self {
        let raw_query = raw_query.unwrap_or("").to_string();
        Self {
            method,
            path,
            host,
            query: parse_query(&raw_query),
            raw_query,
            headers,
            client_ip,
        }
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of a cookie from the Cookie header, if present
    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        let raw = self.header_value("cookie")?;
        raw.split(';').map(str::trim).find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            if k == name {
                Some(v)
            } else {
                None
            }
        })
    }
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(raw_query: &str, cookie: Option<&str>) -> RequestMeta {
        let mut headers = HeaderMap::new();
        if let Some(c) = cookie {
            headers.insert("cookie", c.parse().unwrap());
        }
        RequestMeta::new(
            "GET".into(),
            "/hello".into(),
            "example.com".into(),
            Some(raw_query),
            headers,
            None,
        )
    }

    #[test]
    fn test_query_parsing() {
        let meta = meta_with("uid=42&flag&name=a%20b", None);
        assert_eq!(meta.query_value("uid"), Some("42"));
        assert_eq!(meta.query_value("flag"), Some(""));
        assert_eq!(meta.query_value("missing"), None);
    }

    #[test]
    fn test_cookie_value() {
        let meta = meta_with("", Some("sid=abc; theme=dark"));
        assert_eq!(meta.cookie_value("sid"), Some("abc"));
        assert_eq!(meta.cookie_value("theme"), Some("dark"));
        assert_eq!(meta.cookie_value("missing"), None);
    }
}
