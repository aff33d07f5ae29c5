//! Element resolution: mapping a human-meaningful query onto exactly one
//! node of the current hierarchy, with deterministic tie-breaks.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hierarchy::{Bounds, ViewHierarchyNode};
use crate::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementQuery {
    /// Absolute traversal index within the current observation.
    Index(usize),
    Text {
        text: String,
        exact: bool,
        case_sensitive: bool,
    },
    ContentDesc {
        text: String,
        exact: bool,
        case_sensitive: bool,
    },
    ResourceId(String),
    /// Text query restricted to descendants of the container whose
    /// resource-id matches `container_id`.
    ScopedText {
        container_id: String,
        text: String,
        exact: bool,
        case_sensitive: bool,
    },
}

impl ElementQuery {
    pub fn text(text: impl Into<String>) -> Self {
        ElementQuery::Text {
            text: text.into(),
            exact: false,
            case_sensitive: false,
        }
    }

    pub fn exact_text(text: impl Into<String>) -> Self {
        ElementQuery::Text {
            text: text.into(),
            exact: true,
            case_sensitive: true,
        }
    }

    /// Build a query from a tool-call target object. Exactly one of `index`,
    /// `text`, `content_desc`, `resource_id` selects the query kind;
    /// `container_id` scopes a text query; `exact` and `case_sensitive`
    /// default to false.
    pub fn from_json(target: &Value) -> Result<Self> {
        let obj = target
            .as_object()
            .ok_or_else(|| EngineError::Validation("target must be an object".into()))?;
        let exact = obj.get("exact").and_then(Value::as_bool).unwrap_or(false);
        let case_sensitive = obj
            .get("case_sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if let Some(index) = obj.get("index").and_then(Value::as_u64) {
            return Ok(ElementQuery::Index(index as usize));
        }
        if let Some(text) = obj.get("text").and_then(Value::as_str) {
            if let Some(container) = obj.get("container_id").and_then(Value::as_str) {
                return Ok(ElementQuery::ScopedText {
                    container_id: container.to_string(),
                    text: text.to_string(),
                    exact,
                    case_sensitive,
                });
            }
            return Ok(ElementQuery::Text {
                text: text.to_string(),
                exact,
                case_sensitive,
            });
        }
        if let Some(desc) = obj.get("content_desc").and_then(Value::as_str) {
            return Ok(ElementQuery::ContentDesc {
                text: desc.to_string(),
                exact,
                case_sensitive,
            });
        }
        if let Some(id) = obj.get("resource_id").and_then(Value::as_str) {
            return Ok(ElementQuery::ResourceId(id.to_string()));
        }
        Err(EngineError::Validation(
            "target needs one of: index, text, content_desc, resource_id".into(),
        ))
    }
}

impl fmt::Display for ElementQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementQuery::Index(i) => write!(f, "index {i}"),
            ElementQuery::Text { text, exact, .. } => {
                write!(f, "text \"{text}\" ({})", if *exact { "exact" } else { "fuzzy" })
            }
            ElementQuery::ContentDesc { text, .. } => write!(f, "content-desc \"{text}\""),
            ElementQuery::ResourceId(id) => write!(f, "resource-id \"{id}\""),
            ElementQuery::ScopedText {
                container_id, text, ..
            } => write!(f, "text \"{text}\" within container \"{container_id}\""),
        }
    }
}

/// A resolved node: the action target handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub index: usize,
    pub bounds: Bounds,
    pub center: (i32, i32),
    pub text: Option<String>,
    pub content_desc: Option<String>,
    pub resource_id: Option<String>,
    pub class: Option<String>,
    pub clickable: bool,
}

impl Element {
    fn from_node(index: usize, node: &ViewHierarchyNode) -> Self {
        Self {
            index,
            bounds: node.bounds,
            center: node.bounds.center(),
            text: node.text().map(String::from),
            content_desc: node.content_desc().map(String::from),
            resource_id: node.resource_id().map(String::from),
            class: node.class_name().map(String::from),
            clickable: node.is_clickable(),
        }
    }
}

/// Resolve a query against a hierarchy. `Ok(None)` means no match; a named
/// container that does not exist is an error (scoped queries never fall back
/// to a global search, since a false positive is worse than an explicit
/// failure in automation).
pub fn resolve(query: &ElementQuery, root: &ViewHierarchyNode) -> Result<Option<Element>> {
    match query {
        ElementQuery::Index(index) => Ok(root
            .flatten()
            .into_iter()
            .find(|entry| entry.index == *index)
            .map(|entry| Element::from_node(entry.index, entry.node))),

        ElementQuery::Text {
            text,
            exact,
            case_sensitive,
        } => Ok(best_text_match(root, None, text, *exact, *case_sensitive)),

        ElementQuery::ContentDesc {
            text,
            exact,
            case_sensitive,
        } => {
            let mut best: Option<(i64, usize, Element)> = None;
            for entry in root.flatten() {
                let Some(desc) = entry.node.content_desc() else {
                    continue;
                };
                if text_matches(desc, text, *exact, *case_sensitive) {
                    consider(&mut best, entry.index, entry.node);
                }
            }
            Ok(best.map(|(_, _, e)| e))
        }

        ElementQuery::ResourceId(id) => Ok(root
            .flatten()
            .into_iter()
            .find(|entry| entry.node.resource_id() == Some(id.as_str()))
            .map(|entry| Element::from_node(entry.index, entry.node))),

        ElementQuery::ScopedText {
            container_id,
            text,
            exact,
            case_sensitive,
        } => {
            let flat = root.flatten();
            let container = flat
                .iter()
                .find(|entry| entry.node.resource_id() == Some(container_id.as_str()))
                .ok_or_else(|| EngineError::ContainerNotFound(container_id.clone()))?;
            Ok(best_text_match(
                container.node,
                Some(container.index),
                text,
                *exact,
                *case_sensitive,
            ))
        }
    }
}

/// Resolve, turning a miss into [`EngineError::ElementNotFound`] with nearby
/// candidates attached so an agent can self-correct.
pub fn resolve_required(query: &ElementQuery, root: &ViewHierarchyNode) -> Result<Element> {
    match resolve(query, root)? {
        Some(element) => Ok(element),
        None => Err(EngineError::ElementNotFound {
            query: query.to_string(),
            nearby: nearby_candidates(root, 8),
        }),
    }
}

/// Labels of addressable nodes, for actionable miss errors.
pub fn nearby_candidates(root: &ViewHierarchyNode, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    for entry in root.flatten() {
        if out.len() >= limit {
            break;
        }
        if let Some(text) = entry.node.text() {
            out.push(format!("text \"{text}\""));
        } else if let Some(desc) = entry.node.content_desc() {
            out.push(format!("content-desc \"{desc}\""));
        } else if let Some(id) = entry.node.resource_id() {
            out.push(format!("resource-id \"{id}\""));
        }
    }
    out
}

/// Best text match under `scope_root`. Tie-break: smallest bounds area wins
/// (UI frameworks duplicate accessible text on a leaf and its container; the
/// leaf is the specific target), then the lowest traversal index for exactly
/// equal areas.
fn best_text_match(
    scope_root: &ViewHierarchyNode,
    scope_base_index: Option<usize>,
    text: &str,
    exact: bool,
    case_sensitive: bool,
) -> Option<Element> {
    let base = scope_base_index.unwrap_or(0);
    let mut best: Option<(i64, usize, Element)> = None;
    for entry in scope_root.flatten() {
        // Text is preferred over content-desc when both exist.
        let candidate = entry.node.text().or_else(|| entry.node.content_desc());
        let Some(candidate) = candidate else {
            continue;
        };
        if text_matches(candidate, text, exact, case_sensitive) {
            // Indexes inside a scope are offset by the container's own index
            // so they stay valid against the full observation.
            consider(&mut best, base + entry.index, entry.node);
        }
    }
    best.map(|(_, _, e)| e)
}

fn consider(best: &mut Option<(i64, usize, Element)>, index: usize, node: &ViewHierarchyNode) {
    let area = node.bounds.area();
    let better = match best {
        None => true,
        Some((best_area, best_index, _)) => {
            area < *best_area || (area == *best_area && index < *best_index)
        }
    };
    if better {
        *best = Some((area, index, Element::from_node(index, node)));
    }
}

fn text_matches(candidate: &str, wanted: &str, exact: bool, case_sensitive: bool) -> bool {
    if case_sensitive {
        if exact {
            candidate == wanted
        } else {
            candidate.contains(wanted)
        }
    } else {
        let candidate = candidate.to_lowercase();
        let wanted = wanted.to_lowercase();
        if exact {
            candidate == wanted
        } else {
            candidate.contains(&wanted)
        }
    }
}
