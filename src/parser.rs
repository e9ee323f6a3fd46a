//! SOAP XML parsing utilities.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand entities).
//! Header blocks are read into [`XmlElement`] trees; the body content is sliced
//! out of the input verbatim.

use crate::config::SoapVersion;
use crate::document::{SoapDocument, XmlElement};
use crate::error::As4Error;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Parse raw bytes as a SOAP envelope.
pub fn parse_soap_document(data: &[u8]) -> Result<SoapDocument, As4Error> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| As4Error::malformed(format!("Invalid UTF-8: {}", e)))?;

    let (root, body_span) = build_tree(xml_str)?;

    let version = root
        .namespace
        .as_deref()
        .filter(|_| root.local_name == "Envelope")
        .and_then(SoapVersion::from_namespace_uri)
        .ok_or_else(|| As4Error::malformed("No valid SOAP Envelope found with recognized namespace"))?;

    if root.children_named("Body").count() != 1 {
        return Err(As4Error::malformed("SOAP Envelope must contain exactly one Body"));
    }
    if root.children_named("Header").count() > 1 {
        return Err(As4Error::malformed("SOAP Envelope contains more than one Header"));
    }

    let headers = root
        .child("Header")
        .map(|h| h.children.clone())
        .unwrap_or_default();

    let body = match body_span {
        Some((start, end)) => xml_str[start..end].to_string(),
        None => String::new(),
    };

    Ok(SoapDocument {
        version,
        headers,
        body,
    })
}

/// Parse a standalone XML fragment with a single root element.
pub fn parse_element(xml: &str) -> Result<XmlElement, As4Error> {
    build_tree(xml).map(|(root, _)| root)
}

/// Check that `data` is a well-formed XML document.
pub fn check_well_formed(data: &[u8]) -> Result<(), As4Error> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| As4Error::malformed(format!("Invalid UTF-8: {}", e)))?;
    build_tree(xml_str).map(|_| ())
}

/// Build an element tree, returning the byte span of the inner content of a
/// `Body` element directly below the root, if any.
fn build_tree(xml: &str) -> Result<(XmlElement, Option<(usize, usize)>), As4Error> {
    check_xxe_patterns(xml)?;

    let mut reader = Reader::from_str(xml);

    let mut scopes: Vec<Vec<(String, String)>> = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let mut body_start: Option<usize> = None;
    let mut body_span: Option<(usize, usize)> = None;

    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if root.is_some() {
                    return Err(As4Error::malformed("content after the document element"));
                }
                let element = open_element(e, &mut scopes)?;
                if stack.len() == 1 && element.local_name == "Body" {
                    body_start = Some(reader.buffer_position() as usize);
                }
                stack.push(element);
            }

            Ok(Event::Empty(ref e)) => {
                if root.is_some() {
                    return Err(As4Error::malformed("content after the document element"));
                }
                let element = open_element(e, &mut scopes)?;
                scopes.pop();
                if stack.len() == 1 && element.local_name == "Body" {
                    let pos = reader.buffer_position() as usize;
                    body_span = Some((pos, pos));
                }
                close_element(element, &mut stack, &mut root);
            }

            Ok(Event::End(_)) => {
                scopes.pop();
                let element = stack
                    .pop()
                    .ok_or_else(|| As4Error::malformed("unexpected closing tag"))?;
                if stack.len() == 1 && element.local_name == "Body" {
                    if let Some(start) = body_start.take() {
                        body_span = Some((start, before));
                    }
                }
                close_element(element, &mut stack, &mut root);
            }

            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| As4Error::malformed(format!("XML parse error: {}", e)))?;
                append_text(&mut stack, &text)?;
            }

            Ok(Event::CData(ref e)) => {
                append_text(&mut stack, &String::from_utf8_lossy(e))?;
            }

            Ok(Event::DocType(_)) => {
                return Err(As4Error::malformed("DOCTYPE declarations are not allowed"));
            }

            Ok(Event::Eof) => break,

            Err(e) => {
                return Err(As4Error::malformed(format!("XML parse error: {}", e)));
            }

            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(As4Error::malformed("unexpected end of document"));
    }
    let root = root.ok_or_else(|| As4Error::malformed("document has no root element"))?;
    Ok((root, body_span))
}

fn open_element(e: &BytesStart, scopes: &mut Vec<Vec<(String, String)>>) -> Result<XmlElement, As4Error> {
    let qname = utf8(e.name().as_ref())?.to_string();

    let mut attributes = Vec::new();
    let mut declared = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| As4Error::malformed(format!("invalid attribute: {}", e)))?;
        let key = utf8(attr.key.as_ref())?.to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| As4Error::malformed(format!("invalid attribute value: {}", e)))?
            .into_owned();
        if key == "xmlns" {
            declared.push((String::new(), value.clone()));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.push((prefix.to_string(), value.clone()));
        }
        attributes.push((key, value));
    }
    scopes.push(declared);

    let (prefix, local_name) = match qname.split_once(':') {
        Some((p, l)) => (Some(p.to_string()), l.to_string()),
        None => (None, qname),
    };
    let namespace = resolve_prefix(scopes, prefix.as_deref().unwrap_or(""));
    if prefix.is_some() && namespace.is_none() {
        return Err(As4Error::malformed(format!(
            "unbound namespace prefix '{}'",
            prefix.as_deref().unwrap_or_default()
        )));
    }

    Ok(XmlElement {
        prefix,
        local_name,
        namespace,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn close_element(element: XmlElement, stack: &mut [XmlElement], root: &mut Option<XmlElement>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => *root = Some(element),
    }
}

fn append_text(stack: &mut [XmlElement], text: &str) -> Result<(), As4Error> {
    match stack.last_mut() {
        Some(current) => {
            if !text.trim().is_empty() {
                current.text.push_str(text);
            }
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(As4Error::malformed("text outside of the document element")),
    }
}

fn resolve_prefix(scopes: &[Vec<(String, String)>], prefix: &str) -> Option<String> {
    if prefix == "xml" {
        return Some("http://www.w3.org/XML/1998/namespace".to_string());
    }
    scopes
        .iter()
        .rev()
        .flat_map(|scope| scope.iter())
        .find(|(p, _)| p == prefix)
        .map(|(_, uri)| uri.clone())
        .filter(|uri| !uri.is_empty())
}

fn utf8(bytes: &[u8]) -> Result<&str, As4Error> {
    std::str::from_utf8(bytes).map_err(|e| As4Error::malformed(format!("Invalid UTF-8 in name: {}", e)))
}

/// Check for XXE attack patterns.
fn check_xxe_patterns(xml: &str) -> Result<(), As4Error> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(As4Error::malformed("DOCTYPE declarations are not allowed"));
    }

    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(As4Error::malformed("Entity declarations are not allowed"));
    }

    Ok(())
}
