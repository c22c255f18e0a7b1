//! ProseMirror / TipTap JSON to CRDT update.
//!
//! Produces the same shape the y-prosemirror binding keeps in the `default`
//! fragment: one XML element per block node (node attrs become element
//! attributes), and runs of adjacent text nodes merged into one XML text
//! whose formatting attributes are the marks.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use yrs::types::Attrs;
use yrs::{
    Any, Doc, ReadTxn, StateVector, Text, Transact, TransactionMut, Xml, XmlElementPrelim,
    XmlFragment, XmlTextPrelim,
};

use super::ContentConverter;
use crate::engine::DEFAULT_FRAGMENT;
use crate::error::ConvertError;

/// Converts ProseMirror JSON (`{"type": "doc", "content": [...]}`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProseMirrorConverter;

impl ContentConverter for ProseMirrorConverter {
    fn to_crdt_update(&self, content: &Value) -> Result<Vec<u8>, ConvertError> {
        let root = content.as_object().ok_or_else(|| invalid("content must be an object"))?;
        match root.get("type").and_then(Value::as_str) {
            Some("doc") => {}
            Some(other) => return Err(invalid(format!("root node must be doc, got {other}"))),
            None => return Err(invalid("root node has no type")),
        }

        let doc = Doc::new();
        let fragment = doc.get_or_insert_xml_fragment(DEFAULT_FRAGMENT);
        {
            let mut txn = doc.transact_mut();
            write_children(&mut txn, &fragment, children(root)?)?;
        }
        let update = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        Ok(update)
    }
}

fn invalid(reason: impl Into<String>) -> ConvertError {
    ConvertError::InvalidContent {
        reason: reason.into(),
    }
}

fn children(node: &Map<String, Value>) -> Result<&[Value], ConvertError> {
    match node.get("content") {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(nodes)) => Ok(nodes),
        Some(_) => Err(invalid("content must be an array")),
    }
}

fn write_children<P: XmlFragment>(
    txn: &mut TransactionMut<'_>,
    parent: &P,
    nodes: &[Value],
) -> Result<(), ConvertError> {
    let mut run: Vec<&Map<String, Value>> = Vec::new();
    for node in nodes {
        let node = node.as_object().ok_or_else(|| invalid("node must be an object"))?;
        let kind = node
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("node has no type"))?;
        if kind == "text" {
            run.push(node);
            continue;
        }
        write_text_run(txn, parent, &run)?;
        run.clear();

        let element = parent.push_back(txn, XmlElementPrelim::empty(kind));
        if let Some(attrs) = node.get("attrs").and_then(Value::as_object) {
            for (name, value) in attrs {
                if !value.is_null() {
                    element.insert_attribute(txn, name.as_str(), to_any(value));
                }
            }
        }
        write_children(txn, &element, children(node)?)?;
    }
    write_text_run(txn, parent, &run)
}

/// Adjacent text nodes become one XML text.
fn write_text_run<P: XmlFragment>(
    txn: &mut TransactionMut<'_>,
    parent: &P,
    run: &[&Map<String, Value>],
) -> Result<(), ConvertError> {
    if run.is_empty() {
        return Ok(());
    }
    let text = parent.push_back(txn, XmlTextPrelim::new(""));
    let mut active: HashSet<Arc<str>> = HashSet::new();
    for node in run {
        let chunk = node
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("text node has no text"))?;
        if chunk.is_empty() {
            continue;
        }
        let marks = marks(node)?;
        let mut attrs: Attrs = HashMap::new();
        // Formatting carries over to following inserts unless cleared.
        for name in active.drain() {
            attrs.insert(name, Any::Null);
        }
        for (name, value) in marks {
            active.insert(Arc::clone(&name));
            attrs.insert(name, value);
        }
        let index = Text::len(&text, &*txn);
        text.insert_with_attributes(txn, index, chunk, attrs);
    }
    Ok(())
}

fn marks(node: &Map<String, Value>) -> Result<Vec<(Arc<str>, Any)>, ConvertError> {
    let Some(marks) = node.get("marks") else {
        return Ok(Vec::new());
    };
    let marks = marks.as_array().ok_or_else(|| invalid("marks must be an array"))?;
    marks
        .iter()
        .map(|mark| {
            let name = mark
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("mark has no type"))?;
            let attrs = match mark.get("attrs") {
                Some(attrs @ Value::Object(_)) => to_any(attrs),
                _ => Any::Map(Arc::new(HashMap::new())),
            };
            Ok((Arc::from(name), attrs))
        })
        .collect()
}

fn to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => Any::Number(n.as_f64().unwrap_or_default()),
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => Any::Array(items.iter().map(to_any).collect()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(key, value)| (key.clone(), to_any(value)))
                .collect(),
        )),
    }
}
