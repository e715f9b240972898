//! XHTML element tree with stable integer handles.
//!
//! Documents are tokenized with `quick-xml` and stored as a flat arena in
//! document (pre-)order, so a parent always precedes its descendants. Each
//! element keeps only its own text; descendant text lives on the
//! descendants.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::selector::ElementAdapter;

/// Handle of an element inside one [`Document`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId(pub u32);

impl ElementId {
    /// Arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Limits applied while building the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkupLimits {
    /// Max bytes of one markup document.
    pub max_document_bytes: usize,
    /// Deeper elements are attached to the deepest allowed ancestor.
    pub max_nesting: usize,
}

impl Default for MarkupLimits {
    fn default() -> Self {
        Self {
            max_document_bytes: 16 * 1024 * 1024,
            max_nesting: 256,
        }
    }
}

/// One markup element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    /// Local tag name, ASCII lowercase.
    pub tag: String,
    /// Parent element.
    pub parent: Option<ElementId>,
    /// Previous element sibling.
    pub prev_sibling: Option<ElementId>,
    /// Next element sibling.
    pub next_sibling: Option<ElementId>,
    /// Child elements in order.
    pub children: Vec<ElementId>,
    /// Distance from the root element.
    pub depth: usize,
    /// Attributes by lowercase local name, values entity-decoded.
    pub attrs: Vec<(String, String)>,
    /// Decoded text of the element's own text nodes.
    pub text: String,
}

impl Element {
    /// Attribute value by lowercase local name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Parsed markup document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Document {
    elements: Vec<Element>,
    /// `href` values of `<link rel="stylesheet">`, in document order.
    pub stylesheet_links: Vec<String>,
    /// Contents of inline `<style>` blocks, in document order.
    pub style_blocks: Vec<String>,
}

struct OpenElement {
    id: ElementId,
    suppress_text: bool,
    collect_style: bool,
}

impl Document {
    /// Build the tree for `text`. Tokenizer errors stop parsing with a
    /// warning; whatever was parsed before the error is kept.
    pub fn parse(href: &str, text: &str, limits: MarkupLimits) -> Self {
        let mut doc = Document::default();
        let mut reader = Reader::from_reader(text.as_bytes());
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = false;
        let mut buf = Vec::with_capacity(256);
        let mut stack: Vec<OpenElement> = Vec::with_capacity(32);
        let mut overflow = 0usize;
        let mut entity_buf = String::with_capacity(16);

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    if stack.len() >= limits.max_nesting {
                        overflow += 1;
                        log::warn!(
                            "{}: nesting deeper than {} flattened",
                            href,
                            limits.max_nesting
                        );
                    } else {
                        let open = doc.open_element(&reader, &e, &stack);
                        stack.push(open);
                    }
                }
                Ok(Event::Empty(e)) => {
                    doc.open_element(&reader, &e, &stack);
                }
                Ok(Event::End(e)) => {
                    let tag = decode_local_name(&reader, e.name().as_ref());
                    if overflow > 0 {
                        overflow -= 1;
                    } else if let Some(pos) = stack
                        .iter()
                        .rposition(|open| doc.elements[open.id.index()].tag == tag)
                    {
                        stack.truncate(pos);
                    }
                }
                Ok(Event::Text(e)) => match e.decode() {
                    Ok(decoded) => doc.push_text(&stack, &decoded),
                    Err(err) => log::warn!("{}: undecodable text: {:?}", href, err),
                },
                Ok(Event::CData(e)) => match reader.decoder().decode(&e) {
                    Ok(decoded) => doc.push_text(&stack, &decoded),
                    Err(err) => log::warn!("{}: undecodable CDATA: {:?}", href, err),
                },
                Ok(Event::GeneralRef(e)) => {
                    let name = match e.decode() {
                        Ok(name) => name,
                        Err(err) => {
                            log::warn!("{}: undecodable entity: {:?}", href, err);
                            buf.clear();
                            continue;
                        }
                    };
                    entity_buf.clear();
                    entity_buf.push('&');
                    entity_buf.push_str(&name);
                    entity_buf.push(';');
                    match unescape(&entity_buf) {
                        Some(resolved) => doc.push_text(&stack, &resolved),
                        None => log::debug!("{}: unknown entity {}", href, entity_buf),
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => {
                    log::warn!(
                        "{}: markup error at byte {}: {}; keeping {} parsed elements",
                        href,
                        reader.buffer_position(),
                        err,
                        doc.elements.len()
                    );
                    break;
                }
            }
            buf.clear();
        }
        doc
    }

    fn open_element(
        &mut self,
        reader: &Reader<&[u8]>,
        start: &BytesStart<'_>,
        stack: &[OpenElement],
    ) -> OpenElement {
        let tag = decode_local_name(reader, start.name().as_ref());
        let mut attrs = Vec::with_capacity(4);
        for attr in start.attributes().with_checks(false).flatten() {
            let key = decode_local_name(reader, attr.key.as_ref());
            let raw = match reader.decoder().decode(&attr.value) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let value = unescape(&raw).unwrap_or(Cow::Borrowed(raw.as_ref()));
            attrs.push((key, value.into_owned()));
        }

        let id = ElementId(self.elements.len() as u32);
        let parent = stack.last().map(|open| open.id);
        let prev_sibling = match parent {
            Some(parent_id) => {
                let parent_el = &mut self.elements[parent_id.index()];
                let prev = parent_el.children.last().copied();
                parent_el.children.push(id);
                prev
            }
            None => self
                .elements
                .iter()
                .rposition(|el| el.parent.is_none())
                .map(|idx| ElementId(idx as u32)),
        };
        if let Some(prev) = prev_sibling {
            self.elements[prev.index()].next_sibling = Some(id);
        }

        let parent_suppressed = stack.last().is_some_and(|open| open.suppress_text);
        let collect_style = tag == "style";
        if collect_style {
            self.style_blocks.push(String::new());
        }
        if tag == "link" {
            let is_stylesheet = attrs.iter().any(|(key, value)| {
                key == "rel"
                    && value
                        .split_whitespace()
                        .any(|v| v.eq_ignore_ascii_case("stylesheet"))
            });
            if let Some((_, href)) = attrs.iter().find(|(key, _)| key == "href") {
                if is_stylesheet {
                    self.stylesheet_links.push(href.clone());
                }
            }
        }
        let suppress_text = parent_suppressed || suppresses_text(&tag);

        self.elements.push(Element {
            depth: stack.len(),
            tag,
            parent,
            prev_sibling,
            next_sibling: None,
            children: Vec::new(),
            attrs,
            text: String::new(),
        });
        OpenElement {
            id,
            suppress_text,
            collect_style,
        }
    }

    fn push_text(&mut self, stack: &[OpenElement], text: &str) {
        let Some(open) = stack.last() else {
            return;
        };
        if open.collect_style {
            if let Some(block) = self.style_blocks.last_mut() {
                block.push_str(text);
            }
            return;
        }
        if open.suppress_text {
            return;
        }
        self.elements[open.id.index()].text.push_str(text);
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the document has no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element by handle.
    pub fn element(&self, id: ElementId) -> &Element {
        &self.elements[id.index()]
    }

    /// Handles in document order (parents before children).
    pub fn ids(&self) -> impl Iterator<Item = ElementId> + '_ {
        (0..self.elements.len()).map(|idx| ElementId(idx as u32))
    }

    /// Elements in document order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }
}

impl ElementAdapter for Document {
    type Handle = ElementId;

    fn parent(&self, element: ElementId) -> Option<ElementId> {
        self.element(element).parent
    }

    fn previous_sibling_element(&self, element: ElementId) -> Option<ElementId> {
        self.element(element).prev_sibling
    }

    fn next_sibling_element(&self, element: ElementId) -> Option<ElementId> {
        self.element(element).next_sibling
    }

    fn tag_name(&self, element: ElementId) -> &str {
        &self.element(element).tag
    }

    fn element_id(&self, element: ElementId) -> Option<&str> {
        self.element(element).attr("id")
    }

    fn has_class(&self, element: ElementId, class: &str) -> bool {
        self.element(element)
            .attr("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    fn attr(&self, element: ElementId, name: &str) -> Option<&str> {
        self.element(element).attr(name)
    }

    fn is_empty(&self, element: ElementId) -> bool {
        let el = self.element(element);
        el.children.is_empty() && el.text.is_empty()
    }
}

fn suppresses_text(tag: &str) -> bool {
    matches!(tag, "head" | "script" | "style" | "noscript" | "template")
}

fn decode_local_name(reader: &Reader<&[u8]>, raw: &[u8]) -> String {
    let decoded = reader
        .decoder()
        .decode(raw)
        .unwrap_or(Cow::Borrowed(""));
    let local = decoded.rsplit(':').next().unwrap_or(decoded.as_ref());
    local.to_ascii_lowercase()
}

/// Decode XML and common HTML character references in `raw`.
pub fn unescape(raw: &str) -> Option<Cow<'_, str>> {
    quick_xml::escape::unescape_with(raw, |name| {
        quick_xml::escape::resolve_predefined_entity(name).or_else(|| html_entity(name))
    })
    .ok()
}

fn html_entity(name: &str) -> Option<&'static str> {
    let value = match name {
        "nbsp" => "\u{a0}",
        "ensp" => "\u{2002}",
        "emsp" => "\u{2003}",
        "thinsp" => "\u{2009}",
        "zwnj" => "\u{200c}",
        "zwj" => "\u{200d}",
        "shy" => "\u{ad}",
        "ndash" => "\u{2013}",
        "mdash" => "\u{2014}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "sbquo" => "\u{201a}",
        "ldquo" => "\u{201c}",
        "rdquo" => "\u{201d}",
        "bdquo" => "\u{201e}",
        "hellip" => "\u{2026}",
        "middot" => "\u{b7}",
        "bull" => "\u{2022}",
        "laquo" => "\u{ab}",
        "raquo" => "\u{bb}",
        "lsaquo" => "\u{2039}",
        "rsaquo" => "\u{203a}",
        "copy" => "\u{a9}",
        "reg" => "\u{ae}",
        "trade" => "\u{2122}",
        "deg" => "\u{b0}",
        "times" => "\u{d7}",
        "divide" => "\u{f7}",
        "para" => "\u{b6}",
        "sect" => "\u{a7}",
        "dagger" => "\u{2020}",
        "Dagger" => "\u{2021}",
        "prime" => "\u{2032}",
        "Prime" => "\u{2033}",
        "euro" => "\u{20ac}",
        "pound" => "\u{a3}",
        "yen" => "\u{a5}",
        "cent" => "\u{a2}",
        "iexcl" => "\u{a1}",
        "iquest" => "\u{bf}",
        "frac12" => "\u{bd}",
        "frac14" => "\u{bc}",
        "frac34" => "\u{be}",
        _ => return None,
    };
    Some(value)
}
