//! SOAP document representation.
//!
//! Header blocks are kept as element trees; the body content is kept verbatim
//! so a payload passes through the pipeline byte-for-byte unchanged.

use crate::config::SoapVersion;
use crate::error::xml_escape;

/// WS-Security utility namespace (carries `wsu:Id`).
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";

/// `wsu:Id` of the SOAP body.
pub const BODY_ID: &str = "_body";

/// A parsed or constructed XML element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    /// Namespace prefix as written
    pub prefix: Option<String>,
    /// Local name
    pub local_name: String,
    /// Resolved namespace URI
    pub namespace: Option<String>,
    /// Attributes in document order, keyed by qualified name
    pub attributes: Vec<(String, String)>,
    /// Child elements
    pub children: Vec<XmlElement>,
    /// Concatenated text content
    pub text: String,
}

impl XmlElement {
    /// New element in the namespace bound to `prefix`.
    pub fn new(prefix: &str, local_name: &str, namespace: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
            local_name: local_name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    /// Child element in the same namespace and prefix as `self`.
    pub fn sibling_ns(&self, local_name: &str) -> Self {
        Self {
            prefix: self.prefix.clone(),
            local_name: local_name.to_string(),
            namespace: self.namespace.clone(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.push((name.to_string(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    pub fn push(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(p) if !p.is_empty() => format!("{}:{}", p, self.local_name),
            _ => self.local_name.clone(),
        }
    }

    /// Attribute value by local name, ignoring any prefix.
    pub fn attr(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.rsplit(':').next() == Some(local_name) && !k.starts_with("xmlns"))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn child(&self, local_name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name == local_name)
    }

    pub fn children_named<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.local_name == local_name)
    }

    pub fn text_trimmed(&self) -> &str {
        self.text.trim()
    }

    /// Every element in this subtree whose `Id` attribute equals `id`, in document order.
    pub fn find_all_by_id<'a>(&'a self, id: &str) -> Vec<&'a XmlElement> {
        let mut found = Vec::new();
        self.collect_by_id(id, &mut found);
        found
    }

    fn collect_by_id<'a>(&'a self, id: &str, found: &mut Vec<&'a XmlElement>) {
        if self.attr("Id") == Some(id) {
            found.push(self);
        }
        for child in &self.children {
            child.collect_by_id(id, found);
        }
    }

    /// Serialize as written.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, false);
        out
    }

    /// Canonical form used for digests: attributes sorted by qualified name,
    /// namespace declarations dropped, text trimmed.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        self.write(&mut out, true);
        out.into_bytes()
    }

    fn write(&self, out: &mut String, canonical: bool) {
        let name = self.qualified_name();
        out.push('<');
        out.push_str(&name);

        let mut attributes: Vec<&(String, String)> = self
            .attributes
            .iter()
            .filter(|(k, _)| !canonical || !(k == "xmlns" || k.starts_with("xmlns:")))
            .collect();
        if canonical {
            attributes.sort_by(|a, b| a.0.cmp(&b.0));
        }
        for (k, v) in attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&xml_escape(v));
            out.push('"');
        }

        let text = if canonical { self.text.trim() } else { self.text.as_str() };
        if self.children.is_empty() && text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&xml_escape(text));
        for child in &self.children {
            child.write(out, canonical);
        }
        out.push_str("</");
        out.push_str(&name);
        out.push('>');
    }
}

/// A SOAP envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapDocument {
    pub version: SoapVersion,
    /// Header blocks in document order
    pub headers: Vec<XmlElement>,
    /// Inner XML of the SOAP body, verbatim
    pub body: String,
}

impl SoapDocument {
    pub fn new(version: SoapVersion) -> Self {
        Self {
            version,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// First header block with the given local name.
    pub fn header(&self, local_name: &str) -> Option<&XmlElement> {
        self.headers.iter().find(|h| h.local_name == local_name)
    }

    pub fn header_mut(&mut self, local_name: &str) -> Option<&mut XmlElement> {
        self.headers.iter_mut().find(|h| h.local_name == local_name)
    }

    /// All header blocks with the given local name.
    pub fn headers_named<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.headers.iter().filter(move |h| h.local_name == local_name)
    }

    /// Replace the header block with the same local name, or append it.
    pub fn set_header(&mut self, element: XmlElement) {
        match self.headers.iter_mut().find(|h| h.local_name == element.local_name) {
            Some(existing) => *existing = element,
            None => self.headers.push(element),
        }
    }

    pub fn remove_header(&mut self, local_name: &str) -> Option<XmlElement> {
        let pos = self.headers.iter().position(|h| h.local_name == local_name)?;
        Some(self.headers.remove(pos))
    }

    /// Whether the body carries any content.
    pub fn has_body_payload(&self) -> bool {
        !self.body.trim().is_empty()
    }

    /// Serialize the envelope.
    pub fn to_xml(&self) -> String {
        let soap = self.version.prefix();
        let mut out = String::with_capacity(512 + self.body.len());
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        out.push_str(&format!(
            r#"<{soap}:Envelope xmlns:{soap}="{}" xmlns:wsu="{}">"#,
            self.version.namespace_uri(),
            WSU_NS
        ));
        if !self.headers.is_empty() {
            out.push_str(&format!("<{soap}:Header>"));
            for header in &self.headers {
                out.push_str(&header.to_xml());
            }
            out.push_str(&format!("</{soap}:Header>"));
        }
        out.push_str(&format!(r#"<{soap}:Body wsu:Id="{}">"#, BODY_ID));
        out.push_str(&self.body);
        out.push_str(&format!("</{soap}:Body>"));
        out.push_str(&format!("</{soap}:Envelope>"));
        out
    }
}
