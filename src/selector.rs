//! Selector parsing, priority scoring and element matching.
//!
//! Priorities use flat tiers rather than CSS specificity triples. A compound
//! selector scores [`TAG_WEIGHT`] when it starts with a type or universal
//! selector, [`CLASS_WEIGHT`] when it contains any class, attribute or
//! pseudo-class selector and [`ID_WEIGHT`] when it contains an id selector;
//! a complex selector scores its subject (rightmost) compound only.
//! `!important` adds [`IMPORTANT_BONUS`].

use smallvec::SmallVec;

/// Score for a compound starting with a type or universal selector.
pub const TAG_WEIGHT: i32 = 1;
/// Score for a compound containing class, attribute or pseudo-class selectors.
pub const CLASS_WEIGHT: i32 = 10;
/// Score for a compound containing an id selector.
pub const ID_WEIGHT: i32 = 100;
/// Added to any `!important` declaration.
pub const IMPORTANT_BONUS: i32 = 10_000;
/// Score of an inline `style` attribute declaration.
pub const INLINE_STYLE_WEIGHT: i32 = ID_WEIGHT;

/// DOM access needed for selector matching.
pub trait ElementAdapter {
    /// Element handle.
    type Handle: Copy + Eq;

    /// Parent element, if any.
    fn parent(&self, element: Self::Handle) -> Option<Self::Handle>;
    /// Previous element sibling.
    fn previous_sibling_element(&self, element: Self::Handle) -> Option<Self::Handle>;
    /// Next element sibling.
    fn next_sibling_element(&self, element: Self::Handle) -> Option<Self::Handle>;
    /// Local tag name in ASCII lowercase.
    fn tag_name(&self, element: Self::Handle) -> &str;
    /// Value of the `id` attribute.
    fn element_id(&self, element: Self::Handle) -> Option<&str>;
    /// Whether the `class` attribute contains `class`.
    fn has_class(&self, element: Self::Handle, class: &str) -> bool;
    /// Attribute value by lowercase local name.
    fn attr(&self, element: Self::Handle, name: &str) -> Option<&str>;
    /// Whether the element has neither element children nor text.
    fn is_empty(&self, element: Self::Handle) -> bool;
}

/// Attribute selector operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrOp {
    /// `[a]`
    Exists,
    /// `[a=v]`
    Equals,
    /// `[a~=v]`
    Includes,
    /// `[a|=v]`
    DashMatch,
    /// `[a^=v]`
    Prefix,
    /// `[a$=v]`
    Suffix,
    /// `[a*=v]`
    Substring,
}

/// Pseudo-class selectors with matching support.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PseudoClass {
    /// `:first-child`
    FirstChild,
    /// `:last-child`
    LastChild,
    /// `:only-child`
    OnlyChild,
    /// `:root`
    Root,
    /// `:empty`
    Empty,
    /// `:not(compound)`
    Not(Box<CompoundSelector>),
    /// Any other pseudo-class; state-dependent ones like `:hover` may apply
    /// at some point, so they always match.
    Other(String),
}

/// A simple selector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimpleSelector {
    /// `*`
    Universal,
    /// `p`
    Type(String),
    /// `.note`
    Class(String),
    /// `#main`
    Id(String),
    /// `[lang|=zh]`
    Attribute {
        /// Lowercase attribute name.
        name: String,
        /// Operator.
        op: AttrOp,
        /// Comparison value.
        value: String,
        /// `i` flag.
        case_insensitive: bool,
    },
    /// `:first-child` and friends.
    PseudoClass(PseudoClass),
    /// `::before` and the legacy single-colon forms.
    PseudoElement(String),
}

/// Sequence of simple selectors without combinators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompoundSelector {
    /// Simple selectors in source order.
    pub simples: SmallVec<[SimpleSelector; 4]>,
}

/// Relationship between two compounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Combinator {
    /// Whitespace.
    Descendant,
    /// `>`
    Child,
    /// `+`
    AdjacentSibling,
    /// `~`
    GeneralSibling,
}

/// Compounds joined by combinators; `combinators[i]` sits between
/// `compounds[i]` and `compounds[i + 1]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComplexSelector {
    /// Source text, trimmed.
    pub text: String,
    /// Compounds from left to right.
    pub compounds: Vec<CompoundSelector>,
    /// Combinators between adjacent compounds.
    pub combinators: Vec<Combinator>,
}

impl ComplexSelector {
    /// Priority score of this selector (without the important bonus).
    ///
    /// Only the subject compound is scored; ancestor and sibling compounds
    /// narrow the match but add nothing.
    pub fn priority(&self) -> i32 {
        self.compounds.last().map_or(0, compound_priority)
    }

    /// Whether the subject targets a pseudo-element rather than an element.
    pub fn targets_pseudo_element(&self) -> bool {
        self.compounds.last().is_some_and(|compound| {
            compound
                .simples
                .iter()
                .any(|simple| matches!(simple, SimpleSelector::PseudoElement(_)))
        })
    }

    /// Whether `element` is matched by this selector.
    pub fn matches<A: ElementAdapter>(&self, adapter: &A, element: A::Handle) -> bool {
        match self.compounds.len() {
            0 => false,
            len => match_at(adapter, self, len - 1, element),
        }
    }
}

/// Tier score of one compound selector.
pub fn compound_priority(compound: &CompoundSelector) -> i32 {
    let mut score = 0;
    if matches!(
        compound.simples.first(),
        Some(SimpleSelector::Type(_) | SimpleSelector::Universal)
    ) {
        score += TAG_WEIGHT;
    }
    if compound.simples.iter().any(|simple| {
        matches!(
            simple,
            SimpleSelector::Class(_)
                | SimpleSelector::Attribute { .. }
                | SimpleSelector::PseudoClass(_)
        )
    }) {
        score += CLASS_WEIGHT;
    }
    if compound
        .simples
        .iter()
        .any(|simple| matches!(simple, SimpleSelector::Id(_)))
    {
        score += ID_WEIGHT;
    }
    score
}

/// Parse a comma-separated selector list. Invalid members are dropped with
/// a warning; the others are kept.
pub fn parse_selector_list(text: &str) -> Vec<ComplexSelector> {
    split_selector_list(text)
        .into_iter()
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let parsed = parse_complex_selector(part);
            if parsed.is_none() {
                log::warn!("unsupported selector skipped: {:?}", part);
            }
            parsed
        })
        .collect()
}

/// Parse one complex selector.
pub fn parse_complex_selector(text: &str) -> Option<ComplexSelector> {
    let mut cursor = Cursor::new(text);
    let mut compounds = Vec::with_capacity(4);
    let mut combinators = Vec::with_capacity(4);
    let mut pending: Option<Combinator> = None;
    loop {
        let had_space = cursor.skip_whitespace();
        let Some(ch) = cursor.peek() else {
            break;
        };
        let explicit = match ch {
            '>' => Some(Combinator::Child),
            '+' => Some(Combinator::AdjacentSibling),
            '~' => Some(Combinator::GeneralSibling),
            _ => None,
        };
        if let Some(comb) = explicit {
            if compounds.is_empty() || pending.is_some() {
                return None;
            }
            cursor.bump();
            pending = Some(comb);
            continue;
        }
        if !compounds.is_empty() {
            match pending.take() {
                Some(comb) => combinators.push(comb),
                None if had_space => combinators.push(Combinator::Descendant),
                None => return None,
            }
        }
        let compound = parse_compound(&mut cursor)?;
        compounds.push(compound);
    }
    if compounds.is_empty() || pending.is_some() {
        return None;
    }
    Some(ComplexSelector {
        text: text.trim().to_string(),
        compounds,
        combinators,
    })
}

fn match_at<A: ElementAdapter>(
    adapter: &A,
    sel: &ComplexSelector,
    idx: usize,
    element: A::Handle,
) -> bool {
    if !matches_compound(adapter, element, &sel.compounds[idx]) {
        return false;
    }
    if idx == 0 {
        return true;
    }
    match sel.combinators[idx - 1] {
        Combinator::Child => adapter
            .parent(element)
            .is_some_and(|parent| match_at(adapter, sel, idx - 1, parent)),
        Combinator::Descendant => {
            let mut current = adapter.parent(element);
            while let Some(ancestor) = current {
                if match_at(adapter, sel, idx - 1, ancestor) {
                    return true;
                }
                current = adapter.parent(ancestor);
            }
            false
        }
        Combinator::AdjacentSibling => adapter
            .previous_sibling_element(element)
            .is_some_and(|sibling| match_at(adapter, sel, idx - 1, sibling)),
        Combinator::GeneralSibling => {
            let mut current = adapter.previous_sibling_element(element);
            while let Some(sibling) = current {
                if match_at(adapter, sel, idx - 1, sibling) {
                    return true;
                }
                current = adapter.previous_sibling_element(sibling);
            }
            false
        }
    }
}

/// Whether `element` satisfies every simple selector of `compound`.
pub fn matches_compound<A: ElementAdapter>(
    adapter: &A,
    element: A::Handle,
    compound: &CompoundSelector,
) -> bool {
    compound
        .simples
        .iter()
        .all(|simple| matches_simple(adapter, element, simple))
}

fn matches_simple<A: ElementAdapter>(
    adapter: &A,
    element: A::Handle,
    simple: &SimpleSelector,
) -> bool {
    match simple {
        SimpleSelector::Universal | SimpleSelector::PseudoElement(_) => true,
        SimpleSelector::Type(name) => adapter.tag_name(element) == name,
        SimpleSelector::Class(class) => adapter.has_class(element, class),
        SimpleSelector::Id(id) => adapter.element_id(element) == Some(id.as_str()),
        SimpleSelector::Attribute {
            name,
            op,
            value,
            case_insensitive,
        } => adapter
            .attr(element, name)
            .is_some_and(|actual| attr_matches(actual, *op, value, *case_insensitive)),
        SimpleSelector::PseudoClass(pseudo) => match pseudo {
            PseudoClass::FirstChild => adapter.previous_sibling_element(element).is_none(),
            PseudoClass::LastChild => adapter.next_sibling_element(element).is_none(),
            PseudoClass::OnlyChild => {
                adapter.previous_sibling_element(element).is_none()
                    && adapter.next_sibling_element(element).is_none()
            }
            PseudoClass::Root => adapter.parent(element).is_none(),
            PseudoClass::Empty => adapter.is_empty(element),
            PseudoClass::Not(inner) => !matches_compound(adapter, element, inner),
            PseudoClass::Other(_) => true,
        },
    }
}

fn attr_matches(actual: &str, op: AttrOp, expected: &str, case_insensitive: bool) -> bool {
    let (actual, expected) = if case_insensitive {
        (actual.to_lowercase(), expected.to_lowercase())
    } else {
        (actual.to_string(), expected.to_string())
    };
    match op {
        AttrOp::Exists => true,
        AttrOp::Equals => actual == expected,
        AttrOp::Includes => actual.split_whitespace().any(|word| word == expected),
        AttrOp::DashMatch => {
            actual == expected || actual.starts_with(&format!("{}-", expected))
        }
        AttrOp::Prefix => !expected.is_empty() && actual.starts_with(&expected),
        AttrOp::Suffix => !expected.is_empty() && actual.ends_with(&expected),
        AttrOp::Substring => !expected.is_empty() && actual.contains(&expected),
    }
}

fn parse_compound(cursor: &mut Cursor<'_>) -> Option<CompoundSelector> {
    let mut simples = SmallVec::new();
    match cursor.peek()? {
        '*' => {
            cursor.bump();
            if cursor.eat('|') {
                simples.push(type_or_universal(cursor)?);
            } else {
                simples.push(SimpleSelector::Universal);
            }
        }
        '|' => {
            cursor.bump();
            simples.push(type_or_universal(cursor)?);
        }
        ch if is_ident_start(ch) => {
            let name = cursor.ident()?;
            if cursor.eat('|') {
                simples.push(type_or_universal(cursor)?);
            } else {
                simples.push(SimpleSelector::Type(name.to_ascii_lowercase()));
            }
        }
        _ => {}
    }
    while let Some(ch) = cursor.peek() {
        match ch {
            '.' => {
                cursor.bump();
                simples.push(SimpleSelector::Class(cursor.ident()?));
            }
            '#' => {
                cursor.bump();
                simples.push(SimpleSelector::Id(cursor.ident()?));
            }
            '[' => {
                cursor.bump();
                simples.push(parse_attribute(cursor)?);
            }
            ':' => {
                cursor.bump();
                simples.push(parse_pseudo(cursor)?);
            }
            _ => break,
        }
    }
    (!simples.is_empty()).then_some(CompoundSelector { simples })
}

fn type_or_universal(cursor: &mut Cursor<'_>) -> Option<SimpleSelector> {
    if cursor.eat('*') {
        return Some(SimpleSelector::Universal);
    }
    Some(SimpleSelector::Type(cursor.ident()?.to_ascii_lowercase()))
}

fn parse_attribute(cursor: &mut Cursor<'_>) -> Option<SimpleSelector> {
    cursor.skip_whitespace();
    let mut name = cursor.ident()?;
    if cursor.peek() == Some('|') && cursor.peek_nth(1) != Some('=') {
        cursor.bump();
        name = cursor.ident()?;
    }
    let name = name.to_ascii_lowercase();
    cursor.skip_whitespace();
    let op = match cursor.peek()? {
        ']' => {
            cursor.bump();
            return Some(SimpleSelector::Attribute {
                name,
                op: AttrOp::Exists,
                value: String::new(),
                case_insensitive: false,
            });
        }
        '=' => AttrOp::Equals,
        '~' => AttrOp::Includes,
        '|' => AttrOp::DashMatch,
        '^' => AttrOp::Prefix,
        '$' => AttrOp::Suffix,
        '*' => AttrOp::Substring,
        _ => return None,
    };
    cursor.bump();
    if op != AttrOp::Equals && !cursor.eat('=') {
        return None;
    }
    cursor.skip_whitespace();
    let value = match cursor.peek()? {
        quote @ ('"' | '\'') => cursor.quoted(quote)?,
        _ => cursor.ident()?,
    };
    cursor.skip_whitespace();
    let case_insensitive = matches!(cursor.peek(), Some('i' | 'I'));
    if case_insensitive {
        cursor.bump();
        cursor.skip_whitespace();
    } else if matches!(cursor.peek(), Some('s' | 'S')) {
        cursor.bump();
        cursor.skip_whitespace();
    }
    if !cursor.eat(']') {
        return None;
    }
    Some(SimpleSelector::Attribute {
        name,
        op,
        value,
        case_insensitive,
    })
}

fn parse_pseudo(cursor: &mut Cursor<'_>) -> Option<SimpleSelector> {
    if cursor.eat(':') {
        let name = cursor.ident()?.to_ascii_lowercase();
        if cursor.peek() == Some('(') {
            cursor.balanced_parens()?;
        }
        return Some(SimpleSelector::PseudoElement(name));
    }
    let name = cursor.ident()?.to_ascii_lowercase();
    if matches!(
        name.as_str(),
        "before" | "after" | "first-line" | "first-letter"
    ) {
        return Some(SimpleSelector::PseudoElement(name));
    }
    if cursor.peek() == Some('(') {
        let args = cursor.balanced_parens()?;
        if name == "not" {
            let mut inner_cursor = Cursor::new(args.trim());
            let inner = parse_compound(&mut inner_cursor)?;
            inner_cursor.skip_whitespace();
            if inner_cursor.peek().is_some() {
                return None;
            }
            return Some(SimpleSelector::PseudoClass(PseudoClass::Not(Box::new(
                inner,
            ))));
        }
        return Some(SimpleSelector::PseudoClass(PseudoClass::Other(name)));
    }
    let pseudo = match name.as_str() {
        "first-child" => PseudoClass::FirstChild,
        "last-child" => PseudoClass::LastChild,
        "only-child" => PseudoClass::OnlyChild,
        "root" => PseudoClass::Root,
        "empty" => PseudoClass::Empty,
        _ => PseudoClass::Other(name),
    };
    Some(SimpleSelector::PseudoClass(pseudo))
}

fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_' || ch == '-' || ch == '\\' || !ch.is_ascii()
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '-' || !ch.is_ascii()
}

fn split_selector_list(text: &str) -> Vec<&str> {
    let mut parts = Vec::with_capacity(4);
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (_, '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.text[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
        self.pos != start
    }

    fn ident(&mut self) -> Option<String> {
        let mut out = String::new();
        while let Some(ch) = self.peek() {
            if ch == '\\' {
                self.bump();
                out.push(self.escape()?);
            } else if is_ident_char(ch) {
                out.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        (!out.is_empty()).then_some(out)
    }

    fn escape(&mut self) -> Option<char> {
        let mut hex = String::new();
        while hex.len() < 6 && self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
            hex.extend(self.bump());
        }
        if hex.is_empty() {
            return self.bump();
        }
        if self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .or(Some(char::REPLACEMENT_CHARACTER))
    }

    fn quoted(&mut self, quote: char) -> Option<String> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump()? {
                '\\' => out.push(self.escape()?),
                ch if ch == quote => return Some(out),
                ch => out.push(ch),
            }
        }
    }

    fn balanced_parens(&mut self) -> Option<&'a str> {
        if !self.eat('(') {
            return None;
        }
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(ch) = self.bump() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&self.text[start..self.pos - 1]);
                    }
                }
                _ => {}
            }
        }
        None
    }
}
