/// Minimal `multipart/form-data` splitter
///
/// Walks a fully buffered request body and reports each part to a
/// [`FormHandler`]: start, parsed headers, body, end. Only the headers the
/// form endpoints look at are parsed (Content-Disposition and Content-Type).
use crate::send_message::FormError;

/// Parsed `Content-Type` of a part. Type, subtype and charset are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MimeType {
    pub kind: String,
    pub subtype: String,
    pub charset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MimePartHeaders {
    pub disposition_type: String,
    pub disposition_name: String,
    pub content_type: Option<MimeType>,
}

/// Receives the parts of a form as they are split out.
pub trait FormHandler {
    fn part_start(&mut self) -> Result<(), FormError>;
    fn part_header(&mut self, headers: &MimePartHeaders) -> Result<(), FormError>;
    fn part_body(&mut self, body: &[u8]) -> Result<(), FormError>;
    fn part_end(&mut self) -> Result<(), FormError>;
}

/// Split a header value such as `form-data; name="message"` into its main
/// value and its `key=value` parameters (keys lower-cased, quotes removed).
fn split_params(value: &str) -> (String, Vec<(String, String)>) {
    let mut pieces = value.split(';');
    let main = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
    let params = pieces
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            (k.trim().to_ascii_lowercase(), v.to_string())
        })
        .collect();
    (main, params)
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parse a `Content-Type` value.
pub fn parse_content_type(value: &str) -> MimeType {
    let (main, params) = split_params(value);
    let (kind, subtype) = main.split_once('/').unwrap_or((main.as_str(), ""));
    MimeType {
        kind: kind.trim().to_string(),
        subtype: subtype.trim().to_string(),
        charset: param(&params, "charset").map(|cs| cs.to_ascii_lowercase()),
    }
}

/// Boundary of a `multipart/form-data` request Content-Type, if it is one.
pub fn boundary(content_type: &str) -> Option<String> {
    let (main, params) = split_params(content_type);
    if main != "multipart/form-data" {
        return None;
    }
    param(&params, "boundary")
        .filter(|b| !b.is_empty())
        .map(String::from)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_part_headers(block: &[u8]) -> MimePartHeaders {
    let mut headers = MimePartHeaders::default();
    for line in String::from_utf8_lossy(block).split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "content-disposition" => {
                let (kind, params) = split_params(value);
                headers.disposition_type = kind;
                headers.disposition_name = param(&params, "name").unwrap_or("").to_string();
            }
            "content-type" => headers.content_type = Some(parse_content_type(value)),
            _ => {}
        }
    }
    headers
}

fn malformed(what: &str) -> FormError {
    FormError::Malformed(what.to_string())
}

/// Split `body` on `boundary` and feed every part to `handler`. Stops at the
/// first rejection.
pub fn parse_form_data<H: FormHandler + ?Sized>(
    boundary: &str,
    body: &[u8],
    handler: &mut H,
) -> Result<(), FormError> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let start = find(body, &delimiter).ok_or_else(|| malformed("missing boundary"))?;
    let mut rest = &body[start + delimiter.len()..];

    // a part ends at CRLF followed by the delimiter
    let mut part_end = Vec::with_capacity(delimiter.len() + 2);
    part_end.extend_from_slice(b"\r\n");
    part_end.extend_from_slice(&delimiter);

    loop {
        if rest.starts_with(b"--") {
            return Ok(());
        }
        // transport padding after the delimiter
        let line_end = find(rest, b"\r\n").ok_or_else(|| malformed("truncated delimiter"))?;
        if !rest[..line_end].iter().all(|b| *b == b' ' || *b == b'\t') {
            return Err(malformed("garbage after boundary"));
        }
        rest = &rest[line_end + 2..];

        let (header_block, part) = if rest.starts_with(b"\r\n") {
            (&rest[..0], &rest[2..])
        } else {
            let end = find(rest, b"\r\n\r\n").ok_or_else(|| malformed("truncated part headers"))?;
            (&rest[..end], &rest[end + 4..])
        };
        let body_len = find(part, &part_end).ok_or_else(|| malformed("missing closing boundary"))?;

        handler.part_start()?;
        handler.part_header(&parse_part_headers(header_block))?;
        handler.part_body(&part[..body_len])?;
        handler.part_end()?;

        rest = &part[body_len + part_end.len()..];
    }
}
