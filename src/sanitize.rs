//! HTML sanitizer
//!
//! Defense in depth for rendered Things, not a security boundary on its
//! own (the gateway also sends CSP headers). The pass walks tags and
//! rewrites them: script/object/embed/applet are removed outright,
//! iframes are neutralized with an empty `sandbox` attribute, `on*`
//! handlers and `javascript:` URLs are dropped, `data:` URLs survive only
//! on `<img src>`, and stylesheet text loses `expression()`,
//! `behavior:url()`, and `@import`.

/// One parsed attribute: name plus optional value
#[derive(Debug, Clone)]
struct Attribute {
    name: String,
    value: Option<String>,
}

/// Tags removed together with their entire content
const CONTENT_STRIPPED_TAGS: [&str; 3] = ["script", "object", "applet"];
/// Tags removed as single elements
const ELEMENT_STRIPPED_TAGS: [&str; 1] = ["embed"];

/// Case-insensitive substring search
fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .to_ascii_lowercase()
        .find(&needle.to_ascii_lowercase())
        .map(|i| i + from)
}

/// Remove `<tag ...> ... </tag>` blocks; an unclosed opener removes the
/// rest of the document
fn strip_tag_blocks(html: &str, tag: &str) -> String {
    let mut out = html.to_string();
    let opener = format!("<{tag}");
    let closer = format!("</{tag}>");
    loop {
        let Some(start) = find_ci(&out, &opener, 0) else {
            return out;
        };
        match find_ci(&out, &closer, start) {
            Some(end) => out.replace_range(start..end + closer.len(), ""),
            None => out.truncate(start),
        }
    }
}

/// Remove single `<tag ...>` elements
fn strip_elements(html: &str, tag: &str) -> String {
    let mut out = html.to_string();
    let opener = format!("<{tag}");
    loop {
        let Some(start) = find_ci(&out, &opener, 0) else {
            return out;
        };
        match out[start..].find('>') {
            Some(close) => out.replace_range(start..start + close + 1, ""),
            None => out.truncate(start),
        }
    }
}

/// Strip hostile constructs out of CSS text
fn sanitize_css(css: &str) -> String {
    let mut out = css.to_string();
    for needle in ["expression(", "behavior:url(", "behavior: url(", "@import"] {
        while let Some(start) = find_ci(&out, needle, 0) {
            // Drop through the end of the statement (or the rest on no
            // terminator)
            let end = out[start..]
                .find(|c| c == ';' || c == ')')
                .map(|i| start + i + 1)
                .unwrap_or(out.len());
            out.replace_range(start..end, "");
        }
    }
    out
}

/// Is this URL value safe for the given tag/attribute?
fn url_allowed(tag: &str, attr: &str, value: &str) -> bool {
    let trimmed = value.trim().to_ascii_lowercase();
    if trimmed.starts_with("javascript:") {
        return false;
    }
    if trimmed.starts_with("data:") {
        // data: URLs only survive on <img src>
        return tag == "img" && attr == "src";
    }
    true
}

/// Parse the inside of a tag (`name attr="v" ...`) into name + attributes
fn parse_tag(inner: &str) -> (String, Vec<Attribute>, bool, bool) {
    let inner = inner.trim();
    let is_closing = inner.starts_with('/');
    let body = inner.trim_start_matches('/');
    let self_closing = body.ends_with('/');
    let body = body.trim_end_matches('/').trim();

    let name_end = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    let name = body[..name_end].to_ascii_lowercase();
    let mut attributes = Vec::new();

    let mut rest = body[name_end..].trim_start();
    while !rest.is_empty() {
        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(rest.len());
        let attr_name = rest[..name_len].to_ascii_lowercase();
        rest = rest[name_len..].trim_start();

        let mut value = None;
        if let Some(stripped) = rest.strip_prefix('=') {
            let stripped = stripped.trim_start();
            if let Some(quote) = stripped.chars().next().filter(|&c| c == '"' || c == '\'') {
                let after = &stripped[1..];
                let end = after.find(quote).unwrap_or(after.len());
                value = Some(after[..end].to_string());
                rest = after[end..].trim_start_matches(quote).trim_start();
            } else {
                let end = stripped
                    .find(|c: char| c.is_whitespace())
                    .unwrap_or(stripped.len());
                value = Some(stripped[..end].to_string());
                rest = stripped[end..].trim_start();
            }
        }
        let value_is_none = value.is_none();
        if !attr_name.is_empty() {
            attributes.push(Attribute {
                name: attr_name,
                value,
            });
        }
        if name_len == 0 && value_is_none {
            // Malformed input that makes no progress
            break;
        }
    }
    (name, attributes, is_closing, self_closing)
}

/// Rewrite one tag according to the filter rules
fn rewrite_tag(inner: &str) -> String {
    let (name, attributes, is_closing, self_closing) = parse_tag(inner);
    if is_closing {
        return format!("</{name}>");
    }

    let mut kept: Vec<Attribute> = Vec::new();
    let mut has_sandbox = false;
    for attr in attributes {
        // Event handlers never survive
        if attr.name.starts_with("on") {
            continue;
        }
        if attr.name == "sandbox" {
            has_sandbox = true;
        }
        // URL-bearing attributes are scheme-checked
        if matches!(attr.name.as_str(), "href" | "src" | "action" | "formaction") {
            match &attr.value {
                Some(value) if !url_allowed(&name, &attr.name, value) => continue,
                _ => {}
            }
        }
        // Inline style loses hostile CSS
        if attr.name == "style" {
            if let Some(value) = &attr.value {
                kept.push(Attribute {
                    name: attr.name,
                    value: Some(sanitize_css(value)),
                });
                continue;
            }
        }
        kept.push(attr);
    }

    // Surviving iframes are sandboxed
    if name == "iframe" && !has_sandbox {
        kept.push(Attribute {
            name: "sandbox".into(),
            value: Some(String::new()),
        });
    }

    let mut out = format!("<{name}");
    for attr in kept {
        match attr.value {
            Some(value) => out.push_str(&format!(" {}=\"{}\"", attr.name, value)),
            None => out.push_str(&format!(" {}", attr.name)),
        }
    }
    if self_closing {
        out.push_str(" /");
    }
    out.push('>');
    out
}

/// Sanitize an HTML document
pub fn sanitize_html(html: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(html);

    // Pass 1: remove elements whose content is dangerous wholesale
    let mut cleaned = text.into_owned();
    for tag in CONTENT_STRIPPED_TAGS {
        cleaned = strip_tag_blocks(&cleaned, tag);
    }
    for tag in ELEMENT_STRIPPED_TAGS {
        cleaned = strip_elements(&cleaned, tag);
    }

    // Pass 2: walk remaining tags and rewrite attributes; <style> content
    // is CSS-sanitized in place
    let mut out = String::with_capacity(cleaned.len());
    let mut rest = cleaned.as_str();
    let mut in_style = false;
    while let Some(open) = rest.find('<') {
        let text_part = &rest[..open];
        if in_style {
            out.push_str(&sanitize_css(text_part));
        } else {
            out.push_str(text_part);
        }
        let Some(close) = rest[open..].find('>') else {
            // Dangling '<': keep the tail as text
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let inner = &rest[open + 1..open + close];
        let rewritten = rewrite_tag(inner);
        if rewritten == "<style>" || rewritten.starts_with("<style ") {
            in_style = true;
        } else if rewritten == "</style>" {
            in_style = false;
        }
        out.push_str(&rewritten);
        rest = &rest[open + close + 1..];
    }
    if in_style {
        out.push_str(&sanitize_css(rest));
    } else {
        out.push_str(rest);
    }

    out.into_bytes()
}
