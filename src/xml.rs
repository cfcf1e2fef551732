//! Owned XML tree for grammar documents.
//!
//! Grammar subtrees get stored in the rule registry and re-entered long
//! after the source document is gone, so the borrowing roxmltree DOM is
//! converted into an owned tree up front. Directive comments are kept as
//! children in document order; everything else about the markup is dropped.

use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct XNode {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub kids: Vec<XKid>,
    /// Concatenated direct text content, trimmed (used by `value`/`name`).
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum XKid {
    Node(XNode),
    Comment(String),
}

impl XNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &XNode> {
        self.kids.iter().filter_map(|kid| match kid {
            XKid::Node(node) => Some(node),
            XKid::Comment(_) => None,
        })
    }
}

fn convert(node: roxmltree::Node) -> XNode {
    let mut out = XNode {
        tag: node.tag_name().name().to_string(),
        attrs: node
            .attributes()
            .map(|a| (a.name().to_string(), a.value().to_string()))
            .collect(),
        ..XNode::default()
    };

    let mut text = String::new();
    for child in node.children() {
        if child.is_element() {
            out.kids.push(XKid::Node(convert(child)));
        } else if child.is_comment() {
            if let Some(comment) = child.text() {
                out.kids.push(XKid::Comment(comment.to_string()));
            }
        } else if child.is_text() {
            if let Some(t) = child.text() {
                text.push_str(t);
            }
        }
    }
    out.text = text.trim().to_string();
    out
}

/// Parse a grammar document and return its root element.
pub fn parse(source: &str) -> Result<XNode> {
    let doc = roxmltree::Document::parse(source)?;
    Ok(convert(doc.root_element()))
}

pub fn load(path: &Path) -> Result<XNode> {
    let source = std::fs::read_to_string(path)?;
    parse(&source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_comments_in_document_order() {
        let root = parse(
            r#"<grammar>
                 <!-- VIRT:DIRECTIVE { "opt": true } -->
                 <element name="a"><text/></element>
               </grammar>"#,
        )
        .unwrap();
        assert_eq!(root.tag, "grammar");
        assert!(matches!(&root.kids[0], XKid::Comment(c) if c.contains("VIRT:DIRECTIVE")));
        assert!(matches!(&root.kids[1], XKid::Node(n) if n.attr("name") == Some("a")));
    }

    #[test]
    fn collects_direct_text() {
        let root = parse("<value> up </value>").unwrap();
        assert_eq!(root.text, "up");
    }
}
