/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Firehose XML document building and response parsing.
//!
//! Every host command is `<?xml ...?><data><cmd attr=.../></data>`
//! terminated by a NUL. The device answers with `<log>` and `<response>`
//! elements, possibly several documents per bulk transfer.

use xmltree::{Element, XMLNode};

use crate::error::{Error, Result};

/// Builds one command document. Attribute order is preserved; some
/// programmer builds parse positionally.
pub fn build_command(name: &str, attrs: &[(&str, String)]) -> Result<Vec<u8>> {
    let mut cmd = Element::new(name);
    for (key, value) in attrs {
        cmd.attributes.insert((*key).to_string(), value.clone());
    }

    let mut data = Element::new("data");
    data.children.push(XMLNode::Element(cmd));

    let mut out = Vec::with_capacity(256);
    data.write(&mut out)
        .map_err(|e| Error::internal(format!("XML serialization failed: {e}")))?;
    out.push(0);

    Ok(out)
}

/// One `<response>` or `<log>` element from the device.
#[derive(Debug, Clone)]
pub enum DeviceElement {
    Response(ResponseAttrs),
    Log(String),
}

#[derive(Debug, Clone)]
pub struct ResponseAttrs {
    pub ack: bool,
    pub rawmode: Option<bool>,
    pub attrs: Vec<(String, String)>,
}

impl ResponseAttrs {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

/// Splits a receive buffer into complete XML documents and the unconsumed
/// tail. Documents are NUL- or next-declaration-delimited.
pub fn split_documents(buffer: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    const DECL: &[u8] = b"<?xml";

    let mut docs = Vec::new();
    let mut rest = buffer;

    loop {
        // Drop leading NULs and noise before a declaration.
        let start = match rest.windows(DECL.len()).position(|w| w == DECL) {
            Some(p) => p,
            None => break,
        };
        let doc = &rest[start..];

        // A document is complete at its closing `</data>` tag.
        let end_tag = b"</data>";
        match doc.windows(end_tag.len()).position(|w| w == end_tag) {
            Some(p) => {
                let end = p + end_tag.len();
                docs.push(&doc[..end]);
                rest = &doc[end..];
            }
            None => {
                rest = doc;
                break;
            }
        }
    }

    (docs, rest)
}

/// Parses one device document into its elements.
pub fn parse_document(doc: &[u8]) -> Result<Vec<DeviceElement>> {
    let root = Element::parse(doc)
        .map_err(|e| Error::proto(format!("malformed Firehose XML: {e}")))?;

    if root.name != "data" {
        return Err(Error::proto(format!("unexpected Firehose root element <{}>", root.name)));
    }

    let mut elements = Vec::new();
    for node in &root.children {
        let XMLNode::Element(elem) = node else { continue };

        match elem.name.as_str() {
            "log" => {
                let value = elem.attributes.get("value").cloned().unwrap_or_default();
                elements.push(DeviceElement::Log(value));
            }
            "response" => {
                let value = elem
                    .attributes
                    .get("value")
                    .ok_or_else(|| Error::proto("<response> without value attribute"))?;
                let ack = match value.as_str() {
                    "ACK" => true,
                    "NAK" => false,
                    other => {
                        return Err(Error::proto(format!("<response> value '{other}'")));
                    }
                };

                let rawmode = elem.attributes.get("rawmode").map(|v| v == "true");
                let attrs = elem
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();

                elements.push(DeviceElement::Response(ResponseAttrs { ack, rawmode, attrs }));
            }
            _ => {}
        }
    }

    Ok(elements)
}
