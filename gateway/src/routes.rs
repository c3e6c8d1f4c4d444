//! Path-template routing table.
//!
//! Templates use `matchit` syntax: `{name}` matches one segment and a final `{*name}` matches
//! the rest of the path. Static segments take priority over parameters, so
//! `/api/unstable/batch` wins over `/api/unstable/{owner}`.

use std::collections::HashMap;

use http::Method;
use matchit::Router;

struct Route<H> {
    template: String,
    handlers: HashMap<Method, H>,
}

/// A routing table mapping `(method, path)` to handlers of type `H`.
pub struct RouteTable<H> {
    router: Router<usize>,
    routes: Vec<Route<H>>,
    by_template: HashMap<String, usize>,
}

#[derive(Debug)]
/// Outcome of matching a request against the table.
pub enum RouteMatch<'a, H> {
    /// No template matched the path.
    NotFound,
    /// The path matched but not for this method.
    MethodNotAllowed { allowed: Vec<Method> },
    /// Path and method matched.
    Matched {
        handler: &'a H,
        template: &'a str,
        /// Percent-decoded path parameters.
        params: HashMap<String, String>,
    },
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self {
            router: Router::new(),
            routes: Vec::new(),
            by_template: HashMap::new(),
        }
    }
}

impl<H> RouteTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `method` on `template`. Binding an existing pair replaces its handler.
    pub fn insert(&mut self, template: &str, method: Method, handler: H) -> anyhow::Result<()> {
        if let Some(&idx) = self.by_template.get(template) {
            self.routes[idx].handlers.insert(method, handler);
            return Ok(());
        }

        validate_template(template)?;
        let idx = self.routes.len();
        self.router.insert(template, idx)?;
        self.routes.push(Route {
            template: template.to_string(),
            handlers: HashMap::from([(method, handler)]),
        });
        self.by_template.insert(template.to_string(), idx);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Match an `(HTTP method, path)` pair. `path` must not include the query string.
    pub fn match_request(&self, method: &Method, path: &str) -> RouteMatch<'_, H> {
        let Ok(matched) = self.router.at(path) else {
            return RouteMatch::NotFound;
        };
        let route = &self.routes[*matched.value];

        match route.handlers.get(method) {
            Some(handler) => RouteMatch::Matched {
                handler,
                template: &route.template,
                params: matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), decode_param(v)))
                    .collect(),
            },
            None => RouteMatch::MethodNotAllowed {
                allowed: {
                    let mut methods: Vec<Method> = route.handlers.keys().cloned().collect();
                    methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                    methods
                },
            },
        }
    }
}

fn decode_param(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |v| v.into_owned())
}

fn validate_template(path: &str) -> anyhow::Result<()> {
    if !path.starts_with('/') {
        anyhow::bail!("path templates must start with '/': {path}");
    }

    let mut in_param = false;
    let mut param_name = String::new();
    for (pos, ch) in path.char_indices() {
        match ch {
            '{' => {
                if in_param {
                    anyhow::bail!("nested '{{' in path template: {path}");
                }
                in_param = true;
                param_name.clear();
            }
            '}' => {
                if !in_param {
                    anyhow::bail!("unmatched '}}' in path template: {path}");
                }
                let name = param_name.strip_prefix('*').unwrap_or(&param_name);
                if name.is_empty() {
                    anyhow::bail!("empty '{{}}' param in path template: {path}");
                }
                if param_name.starts_with('*') && pos + 1 != path.len() {
                    anyhow::bail!("catch-all param must end the path template: {path}");
                }
                in_param = false;
            }
            _ => {
                if in_param {
                    param_name.push(ch);
                }
            }
        }
    }

    if in_param {
        anyhow::bail!("unclosed '{{' in path template: {path}");
    }
    Ok(())
}
