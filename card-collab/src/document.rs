//! Collaborative rich-text document backed by a Yrs `Doc`.
//!
//! Layout mirrors the editor schema used by card descriptions:
//!
//! ```text
//! Doc
//!  └── XmlFragment "default"
//!       ├── <paragraph> ── XmlText "Hello"
//!       ├── <heading>   ── XmlText "Notes"
//!       └── <bulletList> ── <listItem> ── <paragraph> ── XmlText "…"
//! ```
//!
//! The structured projection produced by [`CollabDocument::to_structured`]
//! is the ProseMirror JSON shape (`{"type":"doc","content":[…]}`) that the
//! card entity stores as its description. It is a denormalized copy; the
//! CRDT state is the source of truth.

use serde_json::{json, Value};
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, XmlElementPrelim, XmlFragment,
    XmlFragmentRef, XmlOut, XmlTextPrelim,
};

use crate::error::{CollabError, Result};

/// Name of the root XML fragment bound to the editor.
pub const ROOT_FRAGMENT: &str = "default";

/// Block element used when plain text is appended to an empty document.
const DEFAULT_BLOCK: &str = "paragraph";

/// A v1 update carrying no structs and an empty delete set.
const EMPTY_UPDATE_V1: &[u8] = &[0, 0];

/// Live CRDT document plus a handle to its editor root.
pub struct CollabDocument {
    doc: Doc,
    root: XmlFragmentRef,
}

impl CollabDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Wrap an existing Yrs document.
    ///
    /// The root fragment is resolved before any transaction is opened.
    pub fn from_doc(doc: Doc) -> Self {
        let root = doc.get_or_insert_xml_fragment(ROOT_FRAGMENT);
        Self { doc, root }
    }

    /// Rebuild a document from a full-state snapshot.
    pub fn from_state(state: &[u8]) -> Result<Self> {
        let document = Self::new();
        document.apply_update(state)?;
        Ok(document)
    }

    /// Underlying Yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Merge a v1-encoded update (full state or increment).
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::Crdt(e.to_string()))
    }

    /// Encode the full document state.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Current state vector.
    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Encode everything this document has that `remote` is missing.
    pub fn diff_since(&self, remote: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(remote)
    }

    /// ProseMirror-shaped JSON projection of the editor root.
    pub fn to_structured(&self) -> Value {
        let txn = self.doc.transact();
        let content = children_to_json(&self.root, &txn);
        if content.is_empty() {
            json!({ "type": "doc" })
        } else {
            json!({ "type": "doc", "content": content })
        }
    }

    /// Text content with one line per top-level block.
    pub fn plain_text(&self) -> String {
        let txn = self.doc.transact();
        let mut lines = Vec::new();
        for i in 0..self.root.len(&txn) {
            if let Some(node) = self.root.get(&txn, i) {
                let mut line = String::new();
                collect_text(node, &txn, &mut line);
                lines.push(line);
            }
        }
        lines.join("\n")
    }

    /// Append text to the last block, creating a paragraph if needed.
    pub fn append_text(&self, text: &str) {
        let mut txn = self.doc.transact_mut();
        let len = self.root.len(&txn);
        let last = if len > 0 { self.root.get(&txn, len - 1) } else { None };
        match last {
            Some(XmlOut::Element(block)) => {
                let children = block.len(&txn);
                match block.get(&txn, children.saturating_sub(1)) {
                    Some(XmlOut::Text(existing)) if children > 0 => existing.push(&mut txn, text),
                    _ => {
                        block.push_back(&mut txn, XmlTextPrelim::new(text));
                    }
                }
            }
            _ => {
                let block = self
                    .root
                    .push_back(&mut txn, XmlElementPrelim::empty(DEFAULT_BLOCK));
                block.push_back(&mut txn, XmlTextPrelim::new(text));
            }
        }
    }

    /// Append a new paragraph holding `text`.
    pub fn push_paragraph(&self, text: &str) {
        let mut txn = self.doc.transact_mut();
        let block = self
            .root
            .push_back(&mut txn, XmlElementPrelim::empty(DEFAULT_BLOCK));
        block.push_back(&mut txn, XmlTextPrelim::new(text));
    }
}

impl Default for CollabDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a v1 update carries no changes at all.
pub fn is_empty_update(update: &[u8]) -> bool {
    update == EMPTY_UPDATE_V1
}

/// State vector described by a full-state update.
pub fn state_vector_of(update: &[u8]) -> Result<StateVector> {
    let scratch = Doc::new();
    {
        let update = Update::decode_v1(update)?;
        let mut txn = scratch.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::Crdt(e.to_string()))?;
    }
    let sv = scratch.transact().state_vector();
    Ok(sv)
}

fn children_to_json<F: XmlFragment, T: ReadTxn>(node: &F, txn: &T) -> Vec<Value> {
    let mut out = Vec::new();
    for i in 0..node.len(txn) {
        if let Some(child) = node.get(txn, i) {
            node_to_json(child, txn, &mut out);
        }
    }
    out
}

fn node_to_json<T: ReadTxn>(node: XmlOut, txn: &T, out: &mut Vec<Value>) {
    match node {
        XmlOut::Element(element) => {
            let content = children_to_json(&element, txn);
            let tag = element.tag().to_string();
            if content.is_empty() {
                out.push(json!({ "type": tag }));
            } else {
                out.push(json!({ "type": tag, "content": content }));
            }
        }
        XmlOut::Text(text) => {
            let value = text.get_string(txn);
            // ProseMirror rejects empty text nodes.
            if !value.is_empty() {
                out.push(json!({ "type": "text", "text": value }));
            }
        }
        XmlOut::Fragment(fragment) => out.extend(children_to_json(&fragment, txn)),
    }
}

fn collect_text<T: ReadTxn>(node: XmlOut, txn: &T, buf: &mut String) {
    match node {
        XmlOut::Text(text) => buf.push_str(&text.get_string(txn)),
        XmlOut::Element(element) => {
            for i in 0..element.len(txn) {
                if let Some(child) = element.get(txn, i) {
                    collect_text(child, txn, buf);
                }
            }
        }
        XmlOut::Fragment(fragment) => {
            for i in 0..fragment.len(txn) {
                if let Some(child) = fragment.get(txn, i) {
                    collect_text(child, txn, buf);
                }
            }
        }
    }
}
