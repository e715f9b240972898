//! Structured CSS rule parser.
//!
//! Only the parts of CSS syntax that matter for font selection are modeled:
//! style rules, `@font-face`, `@import`, and conditional group rules whose
//! nested rules are flattened. Anything malformed is skipped with a warning;
//! parsing never fails.

/// One `name: value [!important]` declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Declaration {
    /// Property name in ASCII lowercase.
    pub name: String,
    /// Raw value with the `!important` marker removed.
    pub value: String,
    /// Whether the declaration carried `!important`.
    pub important: bool,
}

/// A rule relevant to font selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CssRule {
    /// Ordinary style rule.
    Style {
        /// Selector list text as written.
        selectors: String,
        /// Declarations in source order.
        declarations: Vec<Declaration>,
    },
    /// `@font-face` block.
    FontFace {
        /// Descriptors in source order.
        declarations: Vec<Declaration>,
    },
    /// `@import` statement.
    Import {
        /// Imported URL as written.
        href: String,
    },
}

/// Parsed stylesheet with a count of skipped malformed constructs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedStylesheet {
    /// Rules in source order (conditional groups flattened).
    pub rules: Vec<CssRule>,
    /// Number of malformed rules that were dropped.
    pub skipped: usize,
}

/// Parse stylesheet text into rules.
pub fn parse_stylesheet(css: &str) -> ParsedStylesheet {
    let cleaned = strip_comments(css);
    let mut out = ParsedStylesheet::default();
    parse_rule_list(&cleaned, &mut out);
    out
}

/// Parse the body of a declaration block or a `style` attribute.
pub fn parse_declarations(block: &str) -> Vec<Declaration> {
    let cleaned = strip_comments(block);
    let mut out = Vec::with_capacity(8);
    for (idx, raw) in split_top_level(&cleaned, b';').into_iter().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let Some(colon) = raw.find(':') else {
            log::debug!("ignoring declaration {} without colon: {:?}", idx, raw);
            continue;
        };
        let name = raw[..colon].trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        let (value, important) = split_important(raw[colon + 1..].trim());
        out.push(Declaration {
            name,
            value: value.to_string(),
            important,
        });
    }
    out
}

/// Last declaration named `name`, honoring `!important` precedence within
/// one block.
pub fn find_declaration<'a>(declarations: &'a [Declaration], name: &str) -> Option<&'a Declaration> {
    declarations
        .iter()
        .filter(|decl| decl.name == name)
        .max_by_key(|decl| decl.important)
}

/// Split a `font-family` value into normalized family names.
///
/// Quotes are removed, runs of whitespace inside unquoted names collapse,
/// and names are lowercased since family matching is case-insensitive.
pub fn parse_family_list(value: &str) -> Vec<String> {
    split_top_level(value, b',')
        .into_iter()
        .map(normalize_family)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Normalize one family name for comparison.
pub fn normalize_family(family: &str) -> String {
    let trimmed = family
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .trim();
    trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn split_important(value: &str) -> (&str, bool) {
    if let Some(bang) = value.rfind('!') {
        let marker = value[bang + 1..].trim();
        if marker.eq_ignore_ascii_case("important") {
            return (value[..bang].trim_end(), true);
        }
    }
    (value, false)
}

fn parse_rule_list(css: &str, out: &mut ParsedStylesheet) {
    let bytes = css.as_bytes();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let ch = bytes[pos];
        if ch.is_ascii_whitespace() || ch == b';' {
            pos += 1;
            continue;
        }
        if ch == b'}' {
            log::warn!("stray '}}' at byte {} in stylesheet", pos);
            out.skipped += 1;
            pos += 1;
            continue;
        }
        if css[pos..].starts_with("<!--") || css[pos..].starts_with("-->") {
            pos += if ch == b'<' { 4 } else { 3 };
            continue;
        }
        let Some(stop) = find_top_level(css, pos, &[b'{', b';', b'}']) else {
            log::warn!("unterminated rule at byte {} in stylesheet", pos);
            out.skipped += 1;
            break;
        };
        let prelude = css[pos..stop].trim();
        match bytes[stop] {
            b';' => {
                if prelude.starts_with('@') {
                    push_at_statement(prelude, out);
                } else {
                    log::warn!("dropping rule without block: {:?}", prelude);
                    out.skipped += 1;
                }
                pos = stop + 1;
            }
            b'}' => {
                log::warn!("dropping rule without block: {:?}", prelude);
                out.skipped += 1;
                pos = stop + 1;
            }
            _ => {
                let Some(end) = find_block_end(css, stop) else {
                    log::warn!("unterminated block after {:?}", prelude);
                    out.skipped += 1;
                    break;
                };
                let block = &css[stop + 1..end];
                push_block_rule(prelude, block, out);
                pos = end + 1;
            }
        }
    }
}

fn push_at_statement(prelude: &str, out: &mut ParsedStylesheet) {
    let (name, rest) = split_at_keyword(prelude);
    if name == "import" {
        match extract_import_href(rest) {
            Some(href) => out.rules.push(CssRule::Import { href }),
            None => {
                log::warn!("malformed @import: {:?}", prelude);
                out.skipped += 1;
            }
        }
    }
}

fn push_block_rule(prelude: &str, block: &str, out: &mut ParsedStylesheet) {
    if prelude.starts_with('@') {
        let (name, _) = split_at_keyword(prelude);
        match name.as_str() {
            "font-face" => out.rules.push(CssRule::FontFace {
                declarations: parse_declarations(block),
            }),
            "media" | "supports" | "document" | "-moz-document" | "layer" | "container"
            | "scope" => parse_rule_list(block, out),
            _ => log::debug!("skipping @{} block", name),
        }
        return;
    }
    if prelude.is_empty() {
        log::warn!("dropping style rule with empty selector");
        out.skipped += 1;
        return;
    }
    out.rules.push(CssRule::Style {
        selectors: prelude.to_string(),
        declarations: parse_declarations(block),
    });
}

fn split_at_keyword(prelude: &str) -> (String, &str) {
    let body = prelude.trim_start_matches('@');
    let end = body
        .find(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == '(')
        .unwrap_or(body.len());
    (body[..end].to_ascii_lowercase(), body[end..].trim())
}

fn extract_import_href(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let lower = rest.to_ascii_lowercase();
    let raw = if lower.starts_with("url(") {
        let end = rest.find(')')?;
        &rest[4..end]
    } else {
        let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let end = rest[1..].find(quote)? + 1;
        &rest[1..end]
    };
    let href = raw.trim().trim_matches('"').trim_matches('\'').trim();
    (!href.is_empty()).then(|| href.to_string())
}

/// Index of the first top-level byte in `needles` at or after `from`,
/// skipping quoted strings and parenthesized groups.
fn find_top_level(css: &str, from: usize, needles: &[u8]) -> Option<usize> {
    let bytes = css.as_bytes();
    let mut pos = from;
    let mut paren = 0usize;
    while pos < bytes.len() {
        let ch = bytes[pos];
        match ch {
            b'"' | b'\'' => {
                pos = skip_string(bytes, pos);
                continue;
            }
            b'\\' => {
                pos += 2;
                continue;
            }
            b'(' => paren += 1,
            b')' => paren = paren.saturating_sub(1),
            _ if paren == 0 && needles.contains(&ch) => return Some(pos),
            _ => {}
        }
        pos += 1;
    }
    None
}

/// Index of the `}` closing the block opened at `open`.
fn find_block_end(css: &str, open: usize) -> Option<usize> {
    let bytes = css.as_bytes();
    let mut depth = 0usize;
    let mut pos = open;
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' | b'\'' => {
                pos = skip_string(bytes, pos);
                continue;
            }
            b'\\' => {
                pos += 2;
                continue;
            }
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(pos);
                }
            }
            _ => {}
        }
        pos += 1;
    }
    None
}

/// Position just past the string starting at `start`. An unterminated
/// string ends at the next newline, as in CSS error recovery.
fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'\n' => return pos,
            ch if ch == quote => return pos + 1,
            _ => pos += 1,
        }
    }
    bytes.len()
}

fn split_top_level(text: &str, sep: u8) -> Vec<&str> {
    let mut parts = Vec::with_capacity(8);
    let mut start = 0usize;
    while let Some(idx) = find_top_level(text, start, &[sep]) {
        parts.push(&text[start..idx]);
        start = idx + 1;
    }
    parts.push(&text[start.min(text.len())..]);
    parts
}

fn strip_comments(css: &str) -> String {
    let bytes = css.as_bytes();
    let mut out = String::with_capacity(css.len());
    let mut pos = 0usize;
    let mut copied = 0usize;
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' | b'\'' => pos = skip_string(bytes, pos),
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                out.push_str(&css[copied..pos]);
                let end = css[pos + 2..]
                    .find("*/")
                    .map(|idx| pos + 2 + idx + 2)
                    .unwrap_or(bytes.len());
                out.push(' ');
                pos = end;
                copied = end;
            }
            _ => pos += 1,
        }
    }
    out.push_str(&css[copied.min(css.len())..]);
    out
}
