//! Stateless field transforms shared by every source builder.
//!
//! None of these functions fail: unusable input maps to `None`, an empty
//! string or the vocabulary's `unknown` value, with a debug log naming the
//! offending field.

use chrono::{NaiveDate, NaiveDateTime};
use ego_tree::NodeRef;
use harvest_core::{FieldChoice, Tag};
use scraper::{Html, Node, Selector};
use tracing::debug;

pub const UNKNOWN_FREQUENCY: &str = "unknown";
pub const MAX_NAME_LEN: usize = 99;

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d"];
const OUTPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Normalize a loosely formatted timestamp to `YYYY-MM-DDTHH:MM:SS`.
///
/// Sub-second precision is always dropped. With `strip_tz` the time part is
/// dropped too, leaving midnight of the given date; otherwise only a trailing
/// `Z` or UTC offset is removed and the wall-clock time is kept.
pub fn normalize_date(
    value: Option<&str>,
    key: &str,
    dataset: &str,
    strip_tz: bool,
) -> Option<String> {
    let raw = value.map(str::trim).filter(|v| !v.is_empty());
    let Some(raw) = raw else {
        debug!(dataset, key, "missing date");
        return None;
    };

    let value = raw.split('.').next().unwrap_or_default();
    let value = if strip_tz {
        value
            .to_lowercase()
            .split(['t', ' '])
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()
    } else {
        strip_offset(&value.to_uppercase())
    };

    match parse_loose(&value) {
        Some(parsed) => Some(parsed.format(OUTPUT_FORMAT).to_string()),
        None => {
            debug!(dataset, key, value = %raw, "date format incorrect");
            None
        }
    }
}

fn strip_offset(value: &str) -> String {
    let value = value.trim().trim_end_matches('Z');
    let Some(time_start) = value.find(['T', ' ']) else {
        return value.to_string();
    };
    let (date, time) = value.split_at(time_start);
    match time.rfind(['+', '-']) {
        Some(offset_at) => format!("{date}{}", &time[..offset_at]),
        None => value.to_string(),
    }
}

fn parse_loose(value: &str) -> Option<NaiveDateTime> {
    DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Split `a;b,c` style tag strings. Ampersands are left alone here; builders
/// call [`replace_ampersands`] once the final tag list is known.
pub fn split_tags(value: &str) -> Vec<Tag> {
    value
        .split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(Tag::new)
        .collect()
}

/// Catalog tag names disallow `&`.
pub fn replace_ampersands(tags: &mut [Tag]) {
    for tag in tags.iter_mut().filter(|t| t.name.contains('&')) {
        tag.name = tag.name.replace('&', "and");
    }
}

/// Map a free-text frequency label onto the catalog vocabulary by
/// case-insensitive label match.
pub fn map_update_frequency(choices: &[FieldChoice], label: &str) -> String {
    let wanted = label.trim().to_lowercase();
    choices
        .iter()
        .find(|choice| choice.label.to_lowercase() == wanted)
        .map(|choice| choice.value.clone())
        .unwrap_or_else(|| UNKNOWN_FREQUENCY.to_string())
}

/// URL-safe package name from a free-text title.
pub fn munge_title_to_name(value: &str) -> String {
    let filtered: String = value
        .chars()
        .map(|c| match c {
            ' ' | '.' | ':' | '/' | ',' => '-',
            other => other,
        })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    let mut name = String::with_capacity(filtered.len());
    for c in filtered.chars() {
        if c == '-' && name.ends_with('-') {
            continue;
        }
        name.push(c);
    }

    let trimmed = name.trim_matches('-');
    let truncated = &trimmed[..trimmed.len().min(MAX_NAME_LEN)];
    truncated.trim_end_matches('-').to_string()
}

/// 1-based inclusive record range for page-numbered APIs.
pub fn get_from_to(page: usize, per_page: usize) -> (usize, usize) {
    let page = page.max(1);
    ((page - 1) * per_page + 1, page * per_page)
}

/// 0-based `start` offset for offset-paginated APIs.
pub fn page_offset(page: usize, per_page: usize) -> usize {
    page.saturating_sub(1) * per_page
}

/// Reduce HTML to text plus `<a href target>` and `<br/>`.
///
/// Every other tag is unwrapped (its children kept in place) and every other
/// attribute dropped. Text is re-escaped so the output parses back to itself.
pub fn sanitize_html(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    write_sanitized(*fragment.root_element(), &mut out);
    out
}

fn write_sanitized(node: NodeRef<'_, Node>, out: &mut String) {
    for child in node.children() {
        match child.value() {
            Node::Text(text) => escape_text(text, out),
            Node::Element(el) if el.name() == "a" => {
                out.push_str("<a");
                for attr in ["href", "target"] {
                    if let Some(value) = el.attr(attr) {
                        out.push(' ');
                        out.push_str(attr);
                        out.push_str("=\"");
                        escape_attr(value, out);
                        out.push('"');
                    }
                }
                out.push('>');
                write_sanitized(child, out);
                out.push_str("</a>");
            }
            Node::Element(el) if el.name() == "br" => out.push_str("<br/>"),
            Node::Element(_) => write_sanitized(child, out),
            _ => {}
        }
    }
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
}

fn escape_attr(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
}

/// Plain-text rendering of an HTML fragment.
pub fn html_text(html: &str) -> String {
    Html::parse_fragment(html)
        .root_element()
        .text()
        .collect::<String>()
}

/// First sentence of the notes: text up to and including the first period,
/// or an empty string when there is none.
pub fn generate_extract(html: &str) -> String {
    let text = html_text(html);
    let text = text.trim_start();
    match text.find('.') {
        Some(idx) => text[..=idx].to_string(),
        None => {
            debug!("no sentence terminator for extract");
            String::new()
        }
    }
}

/// Leading sentence fragment followed by an ellipsis, used by the geospatial
/// sources whose abstracts are plain text.
pub fn truncated_extract(notes: &str) -> String {
    format!("{}...", notes.split('.').next().unwrap_or_default())
}

/// `href` of the first anchor whose target contains `pattern`.
pub fn extract_metadata_url(html: &str, pattern: &str) -> Option<String> {
    let selector = Selector::parse("a[href]").ok()?;
    Html::parse_fragment(html)
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| href.contains(pattern))
        .map(str::to_string)
}

const FREQUENCY_KEYWORDS: &[(&str, &str)] = &[
    ("deemed", "asNeeded"),
    ("week", "weekly"),
    ("twice", "biannually"),
    ("year", "annually"),
    ("month", "monthly"),
    ("quarter", "quarterly"),
];

/// Update frequency advertised by a full-metadata page in its
/// `tpx_ExternalView_Frequency_of_Updates` script block.
pub fn scrape_update_frequency(page_html: &str) -> String {
    let Ok(selector) = Selector::parse("script#tpx_ExternalView_Frequency_of_Updates") else {
        return UNKNOWN_FREQUENCY.to_string();
    };
    let document = Html::parse_document(page_html);
    for script in document.select(&selector) {
        let body: String = script.text().collect();
        if let Some((_, value)) = FREQUENCY_KEYWORDS.iter().find(|(k, _)| body.contains(k)) {
            return (*value).to_string();
        }
    }
    UNKNOWN_FREQUENCY.to_string()
}

/// Replace every non-ASCII character with an XML numeric character reference.
pub fn xml_char_refs(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            out.push_str(&format!("&#{};", c as u32));
        }
    }
    out
}

/// Convert an HTML description to Markdown.
pub fn html_to_markdown(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();
    write_markdown(*fragment.root_element(), &mut out, None);

    let mut tidy = String::with_capacity(out.len());
    let mut newlines = 0;
    for c in out.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines > 2 {
                continue;
            }
        } else {
            newlines = 0;
        }
        tidy.push(c);
    }
    tidy.trim().to_string()
}

fn markdown_children(node: NodeRef<'_, Node>, list: Option<bool>) -> String {
    let mut inner = String::new();
    write_markdown(node, &mut inner, list);
    inner
}

fn write_markdown(node: NodeRef<'_, Node>, out: &mut String, list: Option<bool>) {
    let mut ordinal = 0;
    for child in node.children() {
        match child.value() {
            Node::Text(text) => escape_markdown(text, out),
            Node::Element(el) => match el.name() {
                "b" | "strong" => wrap_inline(&markdown_children(child, list), "**", out),
                "i" | "em" => wrap_inline(&markdown_children(child, list), "*", out),
                "code" => wrap_inline(&markdown_children(child, list), "`", out),
                "a" => {
                    let text = markdown_children(child, list);
                    match el.attr("href") {
                        Some(href) if text.trim() == href => {
                            out.push('<');
                            out.push_str(href);
                            out.push('>');
                        }
                        Some(href) if !text.trim().is_empty() => {
                            out.push('[');
                            out.push_str(text.trim());
                            out.push_str("](");
                            out.push_str(href);
                            out.push(')');
                        }
                        _ => out.push_str(&text),
                    }
                }
                "br" => out.push_str("  \n"),
                "hr" => out.push_str("\n\n---\n\n"),
                "p" | "div" => {
                    out.push_str("\n\n");
                    out.push_str(markdown_children(child, list).trim());
                    out.push_str("\n\n");
                }
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    let level = el.name()[1..].parse::<usize>().unwrap_or(1);
                    out.push_str("\n\n");
                    out.push_str(&"#".repeat(level));
                    out.push(' ');
                    out.push_str(markdown_children(child, list).trim());
                    out.push_str("\n\n");
                }
                "ul" => {
                    out.push_str("\n\n");
                    out.push_str(markdown_children(child, Some(false)).trim_matches('\n'));
                    out.push_str("\n\n");
                }
                "ol" => {
                    out.push_str("\n\n");
                    out.push_str(markdown_children(child, Some(true)).trim_matches('\n'));
                    out.push_str("\n\n");
                }
                "li" => {
                    ordinal += 1;
                    let bullet = match list {
                        Some(true) => format!("{ordinal}. "),
                        _ => "* ".to_string(),
                    };
                    out.push('\n');
                    out.push_str(&bullet);
                    out.push_str(markdown_children(child, list).trim());
                }
                "blockquote" => {
                    let inner = markdown_children(child, list);
                    out.push_str("\n\n");
                    for line in inner.trim().lines() {
                        out.push_str("> ");
                        out.push_str(line);
                        out.push('\n');
                    }
                    out.push('\n');
                }
                "script" | "style" => {}
                _ => write_markdown(child, out, list),
            },
            _ => {}
        }
    }
}

fn wrap_inline(inner: &str, marker: &str, out: &mut String) {
    if inner.trim().is_empty() {
        out.push_str(inner);
        return;
    }
    let leading = &inner[..inner.len() - inner.trim_start().len()];
    let trailing = &inner[inner.trim_end().len()..];
    out.push_str(leading);
    out.push_str(marker);
    out.push_str(inner.trim());
    out.push_str(marker);
    out.push_str(trailing);
}

fn escape_markdown(text: &str, out: &mut String) {
    let mut last_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
            continue;
        }
        last_space = false;
        if c == '*' || c == '_' {
            out.push('\\');
        }
        out.push(c);
    }
}
