//! Convention-based mapping from operation names to HTTP routes.
//!
//! A convention is a pure function from an ordered operation set plus
//! options to a route map. Conventions are registered by name in the
//! registry's convention table; `"rest"` ships built in. Explicit
//! overrides in the options replace generated entries wholesale.

use std::collections::BTreeMap;

use http::Method;

/// Route metadata for a single operation. Paths are relative; the
/// descriptor's `path_prefix` is prepended identically on the server side
/// (router generator) and the client side (remote proxy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMeta {
    pub method: Method,
    pub path: String,
    pub auth_required: bool,
    pub middleware: Vec<String>,
}

impl RouteMeta {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            auth_required: false,
            middleware: Vec::new(),
        }
    }

    pub fn with_auth(mut self) -> Self {
        self.auth_required = true;
        self
    }

    pub fn with_middleware(mut self, names: &[&str]) -> Self {
        self.middleware = names.iter().map(|n| n.to_string()).collect();
        self
    }
}

/// Options bag handed to a convention.
#[derive(Debug, Clone, Default)]
pub struct ConventionOptions {
    pub path_prefix: String,
    pub resource_singular: Option<String>,
    pub resource_plural: Option<String>,
    pub overrides: BTreeMap<String, RouteMeta>,
}

pub trait Convention: Send + Sync {
    /// Must be pure: identical inputs produce an identical route map.
    fn routes(&self, operations: &[String], opts: &ConventionOptions)
        -> BTreeMap<String, RouteMeta>;
}

/// The built-in REST convention.
///
/// `Get`/`List`/`Create`/`Update`/`Delete` prefixes are matched
/// case-sensitively; the remainder of the name is the resource token and is
/// ignored when explicit resource names are configured. Anything else maps
/// to `POST /<plural>/<kebab-cased-operation>`, where `<plural>` is the
/// same configured resource plural the CRUD rows use; without configured
/// resource names there is no collection to anchor on and the operation
/// mounts at `POST /<kebab-cased-operation>`.
pub struct RestConvention;

impl Convention for RestConvention {
    fn routes(
        &self,
        operations: &[String],
        opts: &ConventionOptions,
    ) -> BTreeMap<String, RouteMeta> {
        let mut out = BTreeMap::new();
        for op in operations {
            let meta = match opts.overrides.get(op) {
                Some(explicit) => {
                    let mut meta = explicit.clone();
                    meta.path = strip_query(&meta.path).to_string();
                    meta
                }
                None => generate_rest_route(op, opts),
            };
            out.insert(op.clone(), meta);
        }
        out
    }
}

fn generate_rest_route(op: &str, opts: &ConventionOptions) -> RouteMeta {
    if let Some(rest) = op.strip_prefix("Get") {
        let plural = plural_for(rest, opts);
        return RouteMeta::new(Method::GET, format!("/{plural}/{{id}}"));
    }
    if let Some(rest) = op.strip_prefix("List") {
        // the remainder of a List operation is already the plural token
        let plural = opts
            .resource_plural
            .clone()
            .unwrap_or_else(|| kebab_case(rest));
        return RouteMeta::new(Method::GET, format!("/{plural}"));
    }
    if let Some(rest) = op.strip_prefix("Create") {
        let plural = plural_for(rest, opts);
        return RouteMeta::new(Method::POST, format!("/{plural}"));
    }
    if let Some(rest) = op.strip_prefix("Update") {
        let plural = plural_for(rest, opts);
        return RouteMeta::new(Method::PUT, format!("/{plural}/{{id}}"));
    }
    if let Some(rest) = op.strip_prefix("Delete") {
        let plural = plural_for(rest, opts);
        return RouteMeta::new(Method::DELETE, format!("/{plural}/{{id}}"));
    }
    // no prefix to strip, so the only usable resource token is the
    // configured one; the operation name itself is not a collection
    match configured_plural(opts) {
        Some(plural) => RouteMeta::new(Method::POST, format!("/{plural}/{}", kebab_case(op))),
        None => RouteMeta::new(Method::POST, format!("/{}", kebab_case(op))),
    }
}

fn configured_plural(opts: &ConventionOptions) -> Option<String> {
    if let Some(plural) = &opts.resource_plural {
        return Some(plural.clone());
    }
    opts.resource_singular.as_deref().map(pluralize)
}

fn plural_for(resource_token: &str, opts: &ConventionOptions) -> String {
    configured_plural(opts).unwrap_or_else(|| pluralize(&kebab_case(resource_token)))
}

pub(crate) fn strip_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

/// `CamelCase` / `camelCase` to `kebab-case`.
pub fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Naive English pluralization, enough for resource tokens.
pub fn pluralize(singular: &str) -> String {
    if singular.is_empty() {
        return String::new();
    }
    if let Some(stem) = singular.strip_suffix('y') {
        let before = stem.chars().last();
        if !matches!(before, Some('a' | 'e' | 'i' | 'o' | 'u')) {
            return format!("{stem}ies");
        }
    }
    for suffix in ["s", "x", "z", "ch", "sh"] {
        if singular.ends_with(suffix) {
            return format!("{singular}es");
        }
    }
    format!("{singular}s")
}

/// Join a path prefix and a relative route path.
pub fn join_prefix(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.to_string();
    }
    if path == "/" || path.is_empty() {
        return prefix.to_string();
    }
    format!("{prefix}{path}")
}
