//! XPath over HTML.
//!
//! HTML is parsed leniently with `scraper` (html5ever) and mirrored into an
//! `sxd_document` tree, which `sxd_xpath` evaluates. The tree is built once
//! and shared by every expression in a batch.

use scraper::{Html, Node};
use snowcrawl_core::error::AppError;
use sxd_document::Package;
use sxd_document::dom::{Document, Element};
use sxd_xpath::{Context, Factory, Value};

/// A parsed HTML page ready for XPath queries.
pub struct XPathDocument {
    package: Package,
}

impl XPathDocument {
    pub fn parse(html: &str) -> Self {
        let parsed = Html::parse_document(html);
        let package = Package::new();
        mirror(&parsed, &package.as_document());
        Self { package }
    }

    /// Evaluate one expression, stringifying every result.
    ///
    /// Node sets yield the string value of each node in document order;
    /// scalar results yield a single string.
    pub fn evaluate(&self, expression: &str) -> Result<Vec<String>, AppError> {
        let doc = self.package.as_document();
        let xpath = Factory::new()
            .build(expression)
            .map_err(|e| AppError::Extraction(format!("invalid XPath: {e}")))?
            .ok_or_else(|| AppError::Extraction("empty XPath".into()))?;

        let value = xpath
            .evaluate(&Context::new(), doc.root())
            .map_err(|e| AppError::Extraction(format!("XPath evaluation failed: {e}")))?;

        Ok(match value {
            Value::Nodeset(nodes) => nodes
                .document_order()
                .iter()
                .map(|n| n.string_value())
                .collect(),
            Value::String(s) => vec![s],
            Value::Boolean(b) => vec![b.to_string()],
            Value::Number(n) => vec![format_number(n)],
        })
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Copy the html5ever tree into `doc`, iteratively so deep pages cannot
/// overflow the stack.
fn mirror<'d>(html: &Html, doc: &Document<'d>) {
    let root = doc.root();
    let mut stack = vec![(html.tree.root(), None::<Element<'d>>)];

    while let Some((node, parent)) = stack.pop() {
        let children_parent = match node.value() {
            Node::Element(e) => {
                let el = doc.create_element(e.name());
                for (name, value) in e.attrs() {
                    el.set_attribute_value(name, value);
                }
                match parent {
                    Some(p) => p.append_child(el),
                    None => root.append_child(el),
                }
                Some(el)
            }
            Node::Text(t) => {
                if let Some(p) = parent {
                    p.append_child(doc.create_text(t));
                }
                continue;
            }
            Node::Comment(c) => {
                let comment = doc.create_comment(c);
                match parent {
                    Some(p) => p.append_child(comment),
                    None => root.append_child(comment),
                }
                continue;
            }
            Node::Document | Node::Fragment => parent,
            _ => continue,
        };

        for child in node.children().rev() {
            stack.push((child, children_parent));
        }
    }
}
