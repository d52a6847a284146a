//! Radix-tree request router.
//!
//! Paths are indexed segment-by-segment into a compressed prefix tree.
//! A node is either a literal prefix, a named parameter (`:id`, matches
//! one segment), or a terminal wildcard (`*`, captures the remaining
//! suffix). Children are tried literals first, then parameters, then
//! wildcards, with depth-first backtracking when a preferred branch has
//! no handler. Each node keeps a per-method handler table with a
//! method-agnostic fallback; ties at one leaf resolve to the exact
//! method first, then the higher priority.

use crate::models::http::Method;

/// A configured route to be inserted into the router.
#[derive(Debug, Clone)]
pub struct Route {
    /// Path pattern, e.g. `/users/:id` or `/static/*`.
    pub path: String,
    /// Restricting method; `None` matches any method.
    pub method: Option<Method>,
    pub handler_id: String,
    pub upstream_name: String,
    pub priority: u32,
    /// Index of this route in the owning config snapshot, used to find
    /// per-route overrides (rewrites, timeouts, middleware chain).
    pub route_index: usize,
}

/// Result of a successful route lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteMatch {
    pub handler_id: String,
    pub upstream_name: String,
    /// Extracted path parameters in pattern order.
    pub params: Vec<(String, String)>,
    /// Suffix captured by a trailing wildcard.
    pub wildcard: Option<String>,
    pub route_index: usize,
}

impl RouteMatch {
    pub fn matched(&self) -> bool {
        !self.handler_id.is_empty()
    }

    /// Looks up an extracted parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeKind {
    Literal,
    Param(String),
    Wildcard,
}

impl NodeKind {
    fn rank(&self) -> u8 {
        match self {
            NodeKind::Literal => 0,
            NodeKind::Param(_) => 1,
            NodeKind::Wildcard => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct HandlerEntry {
    method: Option<Method>,
    handler_id: String,
    upstream_name: String,
    priority: u32,
    route_index: usize,
}

#[derive(Debug)]
struct RadixNode {
    prefix: String,
    kind: NodeKind,
    handlers: Vec<HandlerEntry>,
    children: Vec<RadixNode>,
}

impl RadixNode {
    fn new(prefix: String, kind: NodeKind) -> Self {
        RadixNode {
            prefix,
            kind,
            handlers: Vec::new(),
            children: Vec::new(),
        }
    }

    fn set_handler(&mut self, route: &Route) {
        let entry = HandlerEntry {
            method: route.method,
            handler_id: route.handler_id.clone(),
            upstream_name: route.upstream_name.clone(),
            priority: route.priority,
            route_index: route.route_index,
        };
        for existing in &mut self.handlers {
            if existing.method == entry.method {
                // Equal specificity: the higher priority wins.
                if entry.priority > existing.priority {
                    *existing = entry;
                }
                return;
            }
        }
        self.handlers.push(entry);
    }

    fn lookup(&self, method: Method) -> Option<&HandlerEntry> {
        self.handlers
            .iter()
            .find(|e| e.method == Some(method))
            .or_else(|| self.handlers.iter().find(|e| e.method.is_none()))
    }

    fn sort_children(&mut self) {
        self.children.sort_by_key(|c| c.kind.rank());
    }
}

/// The router: a radix tree over all configured routes.
#[derive(Debug)]
pub struct Router {
    root: RadixNode,
    route_count: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            root: RadixNode::new(String::new(), NodeKind::Literal),
            route_count: 0,
        }
    }

    pub fn route_count(&self) -> usize {
        self.route_count
    }

    /// Inserts a route, splitting literal nodes where patterns share a
    /// partial prefix.
    pub fn add_route(&mut self, route: Route) {
        self.route_count += 1;
        let pattern = route.path.clone();
        let mut rest = pattern.as_str();

        if rest == "/" {
            self.root.set_handler(&route);
            return;
        }

        let mut node = &mut self.root;
        loop {
            if let Some(stripped) = rest.strip_prefix('/') {
                rest = stripped;
            }
            if rest.is_empty() {
                break;
            }
            let seg_end = rest.find('/').unwrap_or(rest.len());
            let segment = &rest[..seg_end];
            let after = &rest[seg_end..];

            if let Some(param_name) = segment.strip_prefix(':') {
                let position = node
                    .children
                    .iter()
                    .position(|c| matches!(c.kind, NodeKind::Param(_)));
                let index = match position {
                    Some(i) => i,
                    None => {
                        node.children.push(RadixNode::new(
                            String::new(),
                            NodeKind::Param(param_name.to_string()),
                        ));
                        node.sort_children();
                        node.children
                            .iter()
                            .position(|c| matches!(c.kind, NodeKind::Param(_)))
                            .unwrap()
                    }
                };
                node = &mut node.children[index];
                rest = after;
                continue;
            }

            if segment.starts_with('*') {
                let position = node
                    .children
                    .iter()
                    .position(|c| c.kind == NodeKind::Wildcard);
                let index = match position {
                    Some(i) => i,
                    None => {
                        node.children
                            .push(RadixNode::new(String::new(), NodeKind::Wildcard));
                        node.sort_children();
                        node.children
                            .iter()
                            .position(|c| c.kind == NodeKind::Wildcard)
                            .unwrap()
                    }
                };
                node = &mut node.children[index];
                // A wildcard consumes the rest of the pattern.
                rest = "";
                break;
            }

            // Literal segment, possibly across several partial nodes.
            let mut seg = segment;
            while !seg.is_empty() {
                let matched = node.children.iter().position(|c| {
                    c.kind == NodeKind::Literal
                        && !c.prefix.is_empty()
                        && common_prefix_len(seg, &c.prefix) > 0
                });
                match matched {
                    Some(index) => {
                        let common = common_prefix_len(seg, &node.children[index].prefix);
                        if common < node.children[index].prefix.len() {
                            split_node(&mut node.children[index], common);
                        }
                        node = &mut node.children[index];
                        seg = &seg[common..];
                    }
                    None => {
                        node.children
                            .push(RadixNode::new(seg.to_string(), NodeKind::Literal));
                        node.sort_children();
                        let index = node
                            .children
                            .iter()
                            .position(|c| c.kind == NodeKind::Literal && c.prefix == seg)
                            .unwrap();
                        node = &mut node.children[index];
                        seg = "";
                    }
                }
            }
            rest = after;
        }

        node.set_handler(&route);
    }

    /// Matches a request path, returning the best route or an empty
    /// (unmatched) result.
    pub fn find(&self, method: Method, path: &str) -> RouteMatch {
        let mut params = Vec::new();
        search(&self.root, path, method, &mut params).unwrap_or_default()
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

/// Splits a literal node so the first `at` bytes become a new parent.
fn split_node(node: &mut RadixNode, at: usize) {
    let tail_prefix = node.prefix[at..].to_string();
    node.prefix.truncate(at);

    let mut tail = RadixNode::new(tail_prefix, NodeKind::Literal);
    tail.handlers = std::mem::take(&mut node.handlers);
    tail.children = std::mem::take(&mut node.children);
    node.children.push(tail);
}

fn search(
    node: &RadixNode,
    path: &str,
    method: Method,
    params: &mut Vec<(String, String)>,
) -> Option<RouteMatch> {
    if path.is_empty() {
        return make_match(node, method, params, None);
    }

    let (at_boundary, rest) = match path.strip_prefix('/') {
        Some(stripped) => (true, stripped),
        None => (false, path),
    };
    if rest.is_empty() {
        // Trailing slash resolves to the same node.
        return make_match(node, method, params, None);
    }

    let seg_end = rest.find('/').unwrap_or(rest.len());
    let segment = &rest[..seg_end];
    let remaining = &rest[seg_end..];

    for child in &node.children {
        match &child.kind {
            NodeKind::Literal => {
                if !child.prefix.is_empty() && rest.starts_with(child.prefix.as_str()) {
                    if let Some(found) = search(child, &rest[child.prefix.len()..], method, params)
                    {
                        return Some(found);
                    }
                }
            }
            NodeKind::Param(name) => {
                if at_boundary && !segment.is_empty() {
                    params.push((name.clone(), segment.to_string()));
                    if let Some(found) = search(child, remaining, method, params) {
                        return Some(found);
                    }
                    params.pop();
                }
            }
            NodeKind::Wildcard => {
                if at_boundary {
                    if let Some(found) = make_match(child, method, params, Some(rest.to_string()))
                    {
                        return Some(found);
                    }
                }
            }
        }
    }

    None
}

fn make_match(
    node: &RadixNode,
    method: Method,
    params: &[(String, String)],
    wildcard: Option<String>,
) -> Option<RouteMatch> {
    node.lookup(method).map(|entry| RouteMatch {
        handler_id: entry.handler_id.clone(),
        upstream_name: entry.upstream_name.clone(),
        params: params.to_vec(),
        wildcard,
        route_index: entry.route_index,
    })
}
