//! MIME multipart/related packaging of an envelope and its attachments.

use crate::attachment::{Attachment, ID_DOMAIN};
use crate::config::SoapVersion;
use crate::document::SoapDocument;
use crate::error::As4Error;
use crate::model::CID_PREFIX;
use crate::parser::{check_well_formed, parse_soap_document};
use base64::Engine;
use tracing::debug;

const CRLF: &[u8] = b"\r\n";

/// One MIME body part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MimePart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content id without angle brackets or `cid:` prefix.
    pub fn content_id(&self) -> Option<&str> {
        self.header("Content-ID").map(normalize_content_id)
    }
}

/// A multipart/related transport unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeMessage {
    pub boundary: String,
    /// Content id of the root (envelope) part
    pub start: String,
    pub root_type: String,
    pub parts: Vec<MimePart>,
}

impl MimeMessage {
    /// Value of the HTTP `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!(
            "multipart/related; boundary=\"{}\"; type=\"{}\"; start=\"<{}>\"",
            self.boundary, self.root_type, self.start
        )
    }

    /// Headers the transport must send along with [`to_bytes`](Self::to_bytes).
    pub fn http_headers(&self) -> Vec<(String, String)> {
        vec![
            ("MIME-Version".to_string(), "1.0".to_string()),
            ("Content-Type".to_string(), self.content_type()),
        ]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(b"--");
            out.extend_from_slice(self.boundary.as_bytes());
            out.extend_from_slice(CRLF);
            for (name, value) in &part.headers {
                out.extend_from_slice(format!("{}: {}", name, value).as_bytes());
                out.extend_from_slice(CRLF);
            }
            out.extend_from_slice(CRLF);
            out.extend_from_slice(&part.body);
            out.extend_from_slice(CRLF);
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--");
        out.extend_from_slice(CRLF);
        out
    }

    /// Parse a multipart/related body given its `Content-Type` header.
    pub fn parse(content_type: &str, body: &[u8]) -> Result<Self, As4Error> {
        let params = ContentTypeParams::parse(content_type);
        if !params.media_type.eq_ignore_ascii_case("multipart/related") {
            return Err(As4Error::malformed(format!(
                "expected multipart/related, got '{}'",
                params.media_type
            )));
        }
        let boundary = params
            .get("boundary")
            .filter(|b| !b.is_empty())
            .ok_or_else(|| As4Error::malformed("multipart Content-Type without boundary"))?
            .to_string();

        let parts = split_parts(body, &boundary)?;
        if parts.is_empty() {
            return Err(As4Error::malformed("multipart message without parts"));
        }

        let start = match params.get("start") {
            Some(start) => normalize_content_id(start).to_string(),
            None => parts[0]
                .content_id()
                .ok_or_else(|| As4Error::malformed("root part without Content-ID"))?
                .to_string(),
        };

        Ok(Self {
            boundary,
            start,
            root_type: params.get("type").unwrap_or("application/soap+xml").to_string(),
            parts,
        })
    }
}

/// Content id of the envelope part.
pub fn root_content_id() -> String {
    format!("soapPart@{}", ID_DOMAIN)
}

/// Fold an envelope and its attachments into one multipart unit.
pub fn pack(document: &SoapDocument, attachments: &[Attachment]) -> Result<MimeMessage, As4Error> {
    if attachments.is_empty() {
        return Err(As4Error::precondition("MIME packaging requires at least one attachment"));
    }

    let root_type = root_type(document.version);
    let start = root_content_id();
    let mut parts = Vec::with_capacity(attachments.len() + 1);
    parts.push(MimePart {
        headers: vec![
            ("Content-Type".to_string(), format!("{}; charset=UTF-8", root_type)),
            ("Content-Transfer-Encoding".to_string(), "binary".to_string()),
            ("Content-ID".to_string(), format!("<{}>", start)),
        ],
        body: document.to_xml().into_bytes(),
    });

    for attachment in attachments {
        let mut headers = vec![
            ("Content-Type".to_string(), attachment.mime_type().to_string()),
            ("Content-Transfer-Encoding".to_string(), "binary".to_string()),
            ("Content-ID".to_string(), format!("<{}>", attachment.content_id())),
        ];
        headers.extend(attachment.headers().iter().cloned());
        parts.push(MimePart {
            headers,
            body: attachment.read_bytes()?,
        });
    }

    let message = MimeMessage {
        boundary: format!("----=_Part_{}", uuid::Uuid::new_v4().simple()),
        start,
        root_type: root_type.to_string(),
        parts,
    };
    debug!(parts = message.parts.len(), boundary = %message.boundary, "MIME message packed");
    Ok(message)
}

/// Split a multipart unit back into the envelope and its attachments.
pub fn unpack(message: &MimeMessage) -> Result<(SoapDocument, Vec<Attachment>), As4Error> {
    let mut seen = std::collections::HashSet::new();
    for (idx, part) in message.parts.iter().enumerate() {
        let content_id = part
            .content_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| As4Error::malformed(format!("MIME part {} has no Content-ID", idx)))?;
        if !seen.insert(content_id) {
            return Err(As4Error::malformed(format!("duplicate Content-ID '{}'", content_id)));
        }
    }

    let root_idx = message
        .parts
        .iter()
        .position(|p| p.content_id() == Some(message.start.as_str()))
        .ok_or_else(|| As4Error::malformed(format!("root part <{}> not found", message.start)))?;

    let root_body = decode_transfer_encoding(&message.parts[root_idx])?;
    check_well_formed(&root_body)?;
    let document = parse_soap_document(&root_body)?;

    let mut attachments = Vec::with_capacity(message.parts.len() - 1);
    for (idx, part) in message.parts.iter().enumerate() {
        if idx == root_idx {
            continue;
        }
        let mut attachment = Attachment::from_bytes(
            part.content_id().unwrap_or_default(),
            part.header("Content-Type").unwrap_or("application/octet-stream"),
            decode_transfer_encoding(part)?,
        );
        for (name, value) in &part.headers {
            if !["Content-Type", "Content-ID", "Content-Transfer-Encoding"]
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
            {
                attachment = attachment.with_header(name.as_str(), value.as_str());
            }
        }
        attachments.push(attachment);
    }

    debug!(attachments = attachments.len(), "MIME message unpacked");
    Ok((document, attachments))
}

fn root_type(version: SoapVersion) -> &'static str {
    version.mime_type()
}

fn normalize_content_id(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed);
    trimmed.strip_prefix(CID_PREFIX).unwrap_or(trimmed)
}

fn decode_transfer_encoding(part: &MimePart) -> Result<Vec<u8>, As4Error> {
    match part.header("Content-Transfer-Encoding").map(|e| e.trim().to_ascii_lowercase()) {
        None => Ok(part.body.clone()),
        Some(enc) if enc == "binary" || enc == "8bit" || enc == "7bit" => Ok(part.body.clone()),
        Some(enc) if enc == "base64" => {
            let compact: Vec<u8> = part.body.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map_err(|e| As4Error::malformed(format!("invalid base64 part: {}", e)))
        }
        Some(enc) => Err(As4Error::malformed(format!("unsupported Content-Transfer-Encoding '{}'", enc))),
    }
}

struct ContentTypeParams {
    media_type: String,
    params: Vec<(String, String)>,
}

impl ContentTypeParams {
    fn parse(value: &str) -> Self {
        let mut pieces = value.split(';');
        let media_type = pieces.next().unwrap_or_default().trim().to_string();
        let params = pieces
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().trim_matches('"').to_string()))
            .collect();
        Self { media_type, params }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn split_parts(body: &[u8], boundary: &str) -> Result<Vec<MimePart>, As4Error> {
    let dash_boundary = format!("--{}", boundary).into_bytes();
    let delimiter = [CRLF, dash_boundary.as_slice()].concat();

    let first = find(body, &dash_boundary, 0)
        .ok_or_else(|| As4Error::malformed("opening boundary not found"))?;
    if first != 0 && !body[..first].ends_with(CRLF) {
        return Err(As4Error::malformed("opening boundary not at line start"));
    }

    let mut parts = Vec::new();
    let mut pos = first + dash_boundary.len();
    loop {
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        while pos < body.len() && (body[pos] == b' ' || body[pos] == b'\t') {
            pos += 1;
        }
        if !body[pos..].starts_with(CRLF) {
            return Err(As4Error::malformed("boundary line not terminated by CRLF"));
        }
        pos += CRLF.len();

        let end = find(body, &delimiter, pos)
            .ok_or_else(|| As4Error::malformed("closing boundary not found"))?;
        parts.push(parse_part(&body[pos..end])?);
        pos = end + delimiter.len();
    }
}

fn parse_part(raw: &[u8]) -> Result<MimePart, As4Error> {
    let (header_bytes, body) = if raw.starts_with(CRLF) {
        (&raw[..0], &raw[CRLF.len()..])
    } else {
        let split = find(raw, b"\r\n\r\n", 0)
            .ok_or_else(|| As4Error::malformed("MIME part without header terminator"))?;
        (&raw[..split], &raw[split + 4..])
    };

    let header_text = std::str::from_utf8(header_bytes)
        .map_err(|e| As4Error::malformed(format!("MIME headers are not UTF-8: {}", e)))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in header_text.split("\r\n").filter(|l| !l.is_empty()) {
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.last_mut() {
                Some(last) => {
                    last.1.push(' ');
                    last.1.push_str(line.trim());
                }
                None => return Err(As4Error::malformed("MIME header continuation without header")),
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| As4Error::malformed(format!("invalid MIME header line '{}'", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(MimePart {
        headers,
        body: body.to_vec(),
    })
}
