//! View hierarchy tree: the structured form of a raw uiautomator dump.
//!
//! Every observation produces a fresh tree; nodes are never mutated in
//! place. Child order is meaningful (paint/traversal order) and backs
//! index-based addressing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.left + self.width() / 2,
            self.top + self.height() / 2,
        )
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    /// Parse the uiautomator form `[left,top][right,bottom]`.
    pub fn parse(s: &str) -> Result<Self> {
        let inner = s
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .ok_or_else(|| EngineError::Structural(format!("bad bounds string: {s:?}")))?;
        let mut coords = inner
            .split("][")
            .flat_map(|pair| pair.split(','))
            .map(|n| n.trim().parse::<i32>());
        let mut next = || {
            coords
                .next()
                .ok_or_else(|| EngineError::Structural(format!("bad bounds string: {s:?}")))?
                .map_err(|_| EngineError::Structural(format!("bad bounds string: {s:?}")))
        };
        let bounds = Bounds::new(next()?, next()?, next()?, next()?);
        Ok(bounds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewHierarchyNode {
    pub attributes: HashMap<String, String>,
    pub bounds: Bounds,
    pub children: Vec<ViewHierarchyNode>,
}

impl ViewHierarchyNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn flag(&self, name: &str) -> bool {
        self.attr(name) == Some("true")
    }

    pub fn text(&self) -> Option<&str> {
        self.attr("text").filter(|t| !t.is_empty())
    }

    pub fn content_desc(&self) -> Option<&str> {
        self.attr("content-desc").filter(|t| !t.is_empty())
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.attr("resource-id").filter(|t| !t.is_empty())
    }

    pub fn class_name(&self) -> Option<&str> {
        self.attr("class")
    }

    pub fn package(&self) -> Option<&str> {
        self.attr("package")
    }

    pub fn is_clickable(&self) -> bool {
        self.flag("clickable")
    }

    pub fn is_long_clickable(&self) -> bool {
        self.flag("long-clickable")
    }

    pub fn is_enabled(&self) -> bool {
        self.flag("enabled")
    }

    pub fn is_focusable(&self) -> bool {
        self.flag("focusable")
    }

    pub fn is_focused(&self) -> bool {
        self.flag("focused")
    }

    pub fn is_scrollable(&self) -> bool {
        self.flag("scrollable")
    }

    pub fn is_checkable(&self) -> bool {
        self.flag("checkable")
    }

    pub fn is_checked(&self) -> bool {
        self.flag("checked")
    }

    pub fn is_selected(&self) -> bool {
        self.flag("selected")
    }

    pub fn is_password(&self) -> bool {
        self.flag("password")
    }

    /// Depth-first flatten in traversal order. Indexes are stable for this
    /// observation only and are never persisted across observations.
    pub fn flatten(&self) -> Vec<IndexedNode<'_>> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(IndexedNode {
                index: out.len(),
                node,
            });
            // Preserve child order under the LIFO stack.
            for child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(ViewHierarchyNode::count).sum::<usize>()
    }
}

/// A node paired with its traversal index within one observation.
#[derive(Debug, Clone, Copy)]
pub struct IndexedNode<'a> {
    pub index: usize,
    pub node: &'a ViewHierarchyNode,
}

/// Parse the XML document produced by `uiautomator dump`.
///
/// The format is fixed and flat: an optional `<?xml?>` prolog, one
/// `<hierarchy rotation="..">` wrapper, and nested `<node attr=".." ...>`
/// elements with quoted attributes and no text content. A dedicated scanner
/// is enough; the document never contains namespaces, CDATA, or comments.
pub fn parse_dump(xml: &str) -> Result<ParsedDump> {
    let mut scanner = Scanner::new(xml);
    let mut rotation = None;
    let mut root: Option<ViewHierarchyNode> = None;
    // Stack of partially-built nodes awaiting their closing tag.
    let mut open: Vec<ViewHierarchyNode> = Vec::new();

    while let Some(tag) = scanner.next_tag()? {
        match tag {
            Tag::Prolog => {}
            Tag::Open { name, attributes, self_closing } => match name.as_str() {
                "hierarchy" => {
                    rotation = attributes.get("rotation").and_then(|r| r.parse().ok());
                }
                "node" => {
                    let bounds = match attributes.get("bounds") {
                        Some(b) => Bounds::parse(b)?,
                        None => Bounds::default(),
                    };
                    let node = ViewHierarchyNode {
                        attributes,
                        bounds,
                        children: Vec::new(),
                    };
                    if self_closing {
                        attach(&mut open, &mut root, node)?;
                    } else {
                        open.push(node);
                    }
                }
                other => {
                    return Err(EngineError::Structural(format!(
                        "unexpected element <{other}> in hierarchy dump"
                    )));
                }
            },
            Tag::Close { name } => match name.as_str() {
                "hierarchy" => {}
                "node" => {
                    let node = open.pop().ok_or_else(|| {
                        EngineError::Structural("unbalanced </node> in hierarchy dump".into())
                    })?;
                    attach(&mut open, &mut root, node)?;
                }
                other => {
                    return Err(EngineError::Structural(format!(
                        "unexpected closing tag </{other}> in hierarchy dump"
                    )));
                }
            },
        }
    }

    if !open.is_empty() {
        return Err(EngineError::Structural(
            "hierarchy dump ended with unclosed <node>".into(),
        ));
    }
    let root =
        root.ok_or_else(|| EngineError::Structural("hierarchy dump has no root node".into()))?;
    Ok(ParsedDump { rotation, root })
}

#[derive(Debug, Clone)]
pub struct ParsedDump {
    pub rotation: Option<u32>,
    pub root: ViewHierarchyNode,
}

fn attach(
    open: &mut [ViewHierarchyNode],
    root: &mut Option<ViewHierarchyNode>,
    node: ViewHierarchyNode,
) -> Result<()> {
    if let Some(parent) = open.last_mut() {
        parent.children.push(node);
    } else if root.is_none() {
        *root = Some(node);
    } else {
        return Err(EngineError::Structural(
            "hierarchy dump has multiple root nodes".into(),
        ));
    }
    Ok(())
}

enum Tag {
    Prolog,
    Open {
        name: String,
        attributes: HashMap<String, String>,
        self_closing: bool,
    },
    Close {
        name: String,
    },
}

struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn next_tag(&mut self) -> Result<Option<Tag>> {
        let start = match self.rest.find('<') {
            Some(i) => i,
            None => return Ok(None),
        };
        self.rest = &self.rest[start..];
        let end = self
            .rest
            .find('>')
            .ok_or_else(|| EngineError::Structural("unterminated tag in hierarchy dump".into()))?;
        let body = &self.rest[1..end];
        self.rest = &self.rest[end + 1..];

        if body.starts_with('?') {
            return Ok(Some(Tag::Prolog));
        }
        if let Some(name) = body.strip_prefix('/') {
            return Ok(Some(Tag::Close {
                name: name.trim().to_string(),
            }));
        }

        let (body, self_closing) = match body.strip_suffix('/') {
            Some(b) => (b, true),
            None => (body, false),
        };
        let name_end = body
            .find(|c: char| c.is_whitespace())
            .unwrap_or(body.len());
        let name = body[..name_end].to_string();
        let attributes = parse_attributes(&body[name_end..])?;
        Ok(Some(Tag::Open {
            name,
            attributes,
            self_closing,
        }))
    }
}

fn parse_attributes(mut s: &str) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    loop {
        s = s.trim_start();
        if s.is_empty() {
            return Ok(attrs);
        }
        let eq = s
            .find('=')
            .ok_or_else(|| EngineError::Structural(format!("bad attribute near {s:?}")))?;
        let key = s[..eq].trim().to_string();
        s = s[eq + 1..].trim_start();
        if !s.starts_with('"') {
            return Err(EngineError::Structural(format!(
                "unquoted attribute value near {s:?}"
            )));
        }
        let close = s[1..]
            .find('"')
            .ok_or_else(|| EngineError::Structural(format!("unterminated attribute near {s:?}")))?;
        let value = unescape(&s[1..1 + close]);
        s = &s[close + 2..];
        attrs.insert(key, value);
    }
}

fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let semi = match rest.find(';') {
            Some(i) => i,
            None => break,
        };
        match &rest[1..semi] {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            entity => {
                if let Some(code) = entity.strip_prefix('#') {
                    let parsed = if let Some(hex) = code.strip_prefix('x') {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        code.parse().ok()
                    };
                    match parsed.and_then(char::from_u32) {
                        Some(c) => out.push(c),
                        None => out.push_str(&rest[..semi + 1]),
                    }
                } else {
                    out.push_str(&rest[..semi + 1]);
                }
            }
        }
        rest = &rest[semi + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example.app" content-desc="" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" checkable="false" checked="false" selected="false" long-clickable="false" password="false" bounds="[0,0][1080,2400]">
    <node index="0" text="Submit" resource-id="com.example.app:id/submit" class="android.widget.Button" package="com.example.app" content-desc="" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" checkable="false" checked="false" selected="false" long-clickable="false" password="false" bounds="[10,10][50,50]" />
    <node index="1" text="Tom &amp; Jerry" resource-id="" class="android.widget.TextView" package="com.example.app" content-desc="cartoon" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" checkable="false" checked="false" selected="false" long-clickable="false" password="false" bounds="[0,60][1080,120]" />
  </node>
</hierarchy>
"#;

    #[test]
    fn parses_sample_dump() {
        let parsed = parse_dump(SAMPLE).unwrap();
        assert_eq!(parsed.rotation, Some(0));
        let root = &parsed.root;
        assert_eq!(root.class_name(), Some("android.widget.FrameLayout"));
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.bounds, Bounds::new(0, 0, 1080, 2400));

        let button = &root.children[0];
        assert_eq!(button.text(), Some("Submit"));
        assert!(button.is_clickable());
        assert_eq!(button.resource_id(), Some("com.example.app:id/submit"));
        assert_eq!(button.bounds.center(), (30, 30));

        let label = &root.children[1];
        assert_eq!(label.text(), Some("Tom & Jerry"));
        assert_eq!(label.content_desc(), Some("cartoon"));
    }

    #[test]
    fn flatten_preserves_traversal_order() {
        let parsed = parse_dump(SAMPLE).unwrap();
        let flat = parsed.root.flatten();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0].index, 0);
        assert_eq!(flat[1].node.text(), Some("Submit"));
        assert_eq!(flat[2].node.text(), Some("Tom & Jerry"));
    }

    #[test]
    fn bounds_parse_and_area() {
        let b = Bounds::parse("[10,20][110,220]").unwrap();
        assert_eq!(b.width(), 100);
        assert_eq!(b.height(), 200);
        assert_eq!(b.area(), 20_000);
        assert!(b.contains_point(10, 20));
        assert!(!b.contains_point(110, 220));

        assert!(Bounds::parse("10,20,110,220").is_err());
        assert!(Bounds::parse("[a,b][c,d]").is_err());
    }

    #[test]
    fn rejects_truncated_dump() {
        let truncated = &SAMPLE[..SAMPLE.len() - 30];
        assert!(parse_dump(truncated).is_err());
    }

    #[test]
    fn rejects_empty_dump() {
        assert!(parse_dump("").is_err());
        assert!(parse_dump("<?xml version='1.0'?>\n<hierarchy rotation=\"0\">\n</hierarchy>").is_err());
    }

    #[test]
    fn unescapes_numeric_entities() {
        assert_eq!(unescape("a&#10;b"), "a\nb");
        assert_eq!(unescape("a&#x41;b"), "aAb");
        assert_eq!(unescape("a&bogus;b"), "a&bogus;b");
    }
}
