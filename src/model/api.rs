use regex::Regex;
use serde::{Deserialize, Serialize};

use super::RequestMeta;
use crate::error::{GatewayError, Result};

/// How url and domain matches combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchRule {
    #[default]
    All,
    Any,
}

/// Where a validated or matched value is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValuePlace {
    #[serde(rename = "qs")]
    QueryString,
    Header,
    Cookie,
}

/// One dispatch target of an API. Multiple nodes make the API a merge API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    pub cluster_name: String,
    /// Rewrite template expanded with the url pattern's capture groups
    pub rewrite: String,
    /// Key of this node's body in a merged response
    pub attr_name: String,
    pub validations: Vec<Validation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Validation {
    pub place: ValuePlace,
    pub name: String,
    /// Regex the value must match; empty means presence-only
    pub rule: String,
    pub required: bool,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            place: ValuePlace::QueryString,
            name: String::new(),
            rule: String::new(),
            required: false,
        }
    }
}

/// Canned response returned when a backend fails
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mock {
    pub value: String,
    pub content_type: String,
    pub headers: Vec<HeaderPair>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

/// IP / CIDR lists consulted by the BLACKLIST and WHITELIST filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessControl {
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
}

/// Header rewrite operations applied by the HEAD filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadOps {
    pub add: Vec<HeaderPair>,
    pub remove: Vec<String>,
    pub rename: Vec<RenamePair>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenamePair {
    pub from: String,
    pub to: String,
}

/// API definition as stored in the registry. Key = (url, method).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSpec {
    pub name: String,
    /// Path pattern (regex); capture groups feed node rewrites
    pub url: String,
    /// HTTP method, "*" matches any
    pub method: String,
    pub domain: String,
    pub match_rule: MatchRule,
    pub nodes: Vec<Node>,
    pub mock: Option<Mock>,
    pub access_control: Option<AccessControl>,
    pub head_ops: Option<HeadOps>,
}

pub fn api_key(url: &str, method: &str) -> String {
    format!("{}-{}", url, method)
}

struct CompiledValidation {
    place: ValuePlace,
    name: String,
    required: bool,
    rule: Option<Regex>,
}

/// Runtime API with the url pattern and node validations compiled
pub struct Api {
    pub spec: ApiSpec,
    pattern: Regex,
    validations: Vec<Vec<CompiledValidation>>,
}

impl Api {
    pub fn parse(spec: ApiSpec) -> Result<Self> {
        let pattern = Regex::new(&format!("^(?:{})$", spec.url)).map_err(|e| {
            GatewayError::ConfigInvalid(format!("api <{}> url pattern: {}", spec.url, e))
        })?;

        let mut validations = Vec::with_capacity(spec.nodes.len());
        for node in &spec.nodes {
            let mut compiled = Vec::with_capacity(node.validations.len());
            for v in &node.validations {
                let rule = if v.rule.is_empty() {
                    None
                } else {
                    Some(Regex::new(&v.rule).map_err(|e| {
                        GatewayError::ConfigInvalid(format!(
                            "api <{}> validation <{}>: {}",
                            spec.url, v.name, e
                        ))
                    })?)
                };
                compiled.push(CompiledValidation {
                    place: v.place,
                    name: v.name.clone(),
                    required: v.required,
                    rule,
                });
            }
            validations.push(compiled);
        }

        Ok(Self {
            spec,
            pattern,
            validations,
        })
    }

    pub fn key(&self) -> String {
        api_key(&self.spec.url, &self.spec.method)
    }

    pub fn is_merge(&self) -> bool {
        self.spec.nodes.len() > 1
    }

    pub fn matches(&self, req: &RequestMeta) -> bool {
        if self.spec.method != "*" && !self.spec.method.eq_ignore_ascii_case(&req.method) {
            return false;
        }

        let url_ok = self.pattern.is_match(&req.path);
        let domain_ok = !self.spec.domain.is_empty() && self.spec.domain == req.host;

        match self.spec.match_rule {
            MatchRule::All => url_ok && (self.spec.domain.is_empty() || domain_ok),
            MatchRule::Any => url_ok || domain_ok,
        }
    }

    /// Expand a node's rewrite template with the url pattern's capture
    /// groups. None when the pattern does not capture the request path.
    pub fn rewrite_path(&self, node: &Node, req: &RequestMeta) -> Option<String> {
        let caps = self.pattern.captures(&req.path)?;
        let mut out = String::new();
        caps.expand(&node.rewrite, &mut out);
        Some(out)
    }

    /// Check one node's declared validations against the request
    pub fn validate_node(&self, index: usize, req: &RequestMeta) -> std::result::Result<(), String> {
        let Some(rules) = self.validations.get(index) else {
            return Ok(());
        };

        for v in rules {
            let value = match v.place {
                ValuePlace::QueryString => req.query_value(&v.name),
                ValuePlace::Header => req.header_value(&v.name),
                ValuePlace::Cookie => req.cookie_value(&v.name),
            };

            match value {
                None => {
                    if v.required {
                        return Err(format!("missing required value: {}", v.name));
                    }
                }
                Some(value) => {
                    if let Some(rule) = &v.rule {
                        if !rule.is_match(value) {
                            return Err(format!("value of {} does not match rule", v.name));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
