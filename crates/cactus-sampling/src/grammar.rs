//! GBNF grammar parsing and incremental matching.
//!
//! Supported syntax:
//! - Rules `name ::= alternatives`, alternatives separated by `|`
//! - Quoted literals with escapes (`\n`, `\t`, `\r`, `\\`, `\"`, `\xHH`, `\uHHHH`)
//! - Character classes `[a-z_]`, negated classes `[^"\\]`, and `.`
//! - Groups `( ... )` and the postfix operators `*`, `+`, `?`
//! - `#` comments
//!
//! Groups and repetitions are desugared into generated rules. The matcher keeps
//! a set of parse stacks and advances them one code point at a time, holding
//! back a partial UTF-8 tail between tokens.

use std::collections::HashMap;
use std::str::FromStr;

pub type GrammarResult<T> = std::result::Result<T, GrammarError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrammarError {
    #[error("Grammar syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("Undefined rule: {0}")]
    UndefinedRule(String),
    #[error("Duplicate rule: {0}")]
    DuplicateRule(String),
    #[error("Grammar has no root rule")]
    MissingRoot,
    #[error("Left recursion in rule: {0}")]
    LeftRecursion(String),
}

/// Set of code points matched by one grammar position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharSet {
    ranges: Vec<(u32, u32)>,
    negated: bool,
}

impl CharSet {
    fn single(c: char) -> Self {
        Self {
            ranges: vec![(c as u32, c as u32)],
            negated: false,
        }
    }

    fn any() -> Self {
        Self {
            ranges: Vec::new(),
            negated: true,
        }
    }

    pub fn contains(&self, c: char) -> bool {
        let cp = c as u32;
        self.ranges.iter().any(|&(lo, hi)| lo <= cp && cp <= hi) != self.negated
    }

    /// Whether any code point in `lo..=hi` is matched.
    fn intersects(&self, lo: u32, hi: u32) -> bool {
        if !self.negated {
            return self.ranges.iter().any(|&(a, b)| a <= hi && lo <= b);
        }
        let mut sorted = self.ranges.clone();
        sorted.sort_unstable();
        let mut cur = lo;
        for (a, b) in sorted {
            if a > cur {
                break;
            }
            if b >= cur {
                if b >= hi {
                    return false;
                }
                cur = b + 1;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Element {
    Chars(CharSet),
    Rule(usize),
}

type Alternative = Vec<Element>;

/// A parsed, validated grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct Grammar {
    names: Vec<String>,
    rules: Vec<Vec<Alternative>>,
    root: usize,
}

impl Grammar {
    pub fn parse(src: &str) -> GrammarResult<Self> {
        Parser::new(src).parse()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    fn element(&self, pos: Pos) -> Option<&Element> {
        self.rules[pos.rule][pos.alt].get(pos.idx)
    }

    fn alt_len(&self, pos: Pos) -> usize {
        self.rules[pos.rule][pos.alt].len()
    }

    fn check_left_recursion(&self) -> GrammarResult<()> {
        let n = self.rules.len();

        let mut nullable = vec![false; n];
        let mut changed = true;
        while changed {
            changed = false;
            for (r, alts) in self.rules.iter().enumerate() {
                if nullable[r] {
                    continue;
                }
                let empty = alts.iter().any(|alt| {
                    alt.iter()
                        .all(|el| matches!(el, Element::Rule(id) if nullable[*id]))
                });
                if empty {
                    nullable[r] = true;
                    changed = true;
                }
            }
        }

        // Edge r -> s when s can be the first thing r expands to.
        let mut edges = vec![Vec::new(); n];
        for (r, alts) in self.rules.iter().enumerate() {
            for alt in alts {
                for el in alt {
                    match el {
                        Element::Rule(s) => {
                            edges[r].push(*s);
                            if !nullable[*s] {
                                break;
                            }
                        }
                        Element::Chars(_) => break,
                    }
                }
            }
        }

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state = vec![0u8; n];
        for start in 0..n {
            if state[start] != 0 {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            state[start] = 1;
            while let Some(&(node, next)) = stack.last() {
                if let Some(&succ) = edges[node].get(next) {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match state[succ] {
                        0 => {
                            state[succ] = 1;
                            stack.push((succ, 0));
                        }
                        1 => return Err(GrammarError::LeftRecursion(self.names[succ].clone())),
                        _ => {}
                    }
                } else {
                    state[node] = 2;
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}

impl FromStr for Grammar {
    type Err = GrammarError;

    fn from_str(s: &str) -> GrammarResult<Self> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    src: Vec<char>,
    pos: usize,
    names: Vec<String>,
    index: HashMap<String, usize>,
    rules: Vec<Option<Vec<Alternative>>>,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            src: src.chars().collect(),
            pos: 0,
            names: Vec::new(),
            index: HashMap::new(),
            rules: Vec::new(),
        }
    }

    fn parse(mut self) -> GrammarResult<Grammar> {
        self.skip_ws();
        while self.peek().is_some() {
            let name = self.parse_name()?;
            self.skip_ws();
            self.expect_str("::=")?;
            let alts = self.parse_alternatives(&name, false)?;
            let id = self.rule_id(&name);
            if self.rules[id].is_some() {
                return Err(GrammarError::DuplicateRule(name));
            }
            self.rules[id] = Some(alts);
            self.skip_ws();
        }

        let root = *self.index.get("root").ok_or(GrammarError::MissingRoot)?;
        let mut rules = Vec::with_capacity(self.rules.len());
        for (id, rule) in self.rules.into_iter().enumerate() {
            match rule {
                Some(alts) => rules.push(alts),
                None if id == root => return Err(GrammarError::MissingRoot),
                None => return Err(GrammarError::UndefinedRule(self.names[id].clone())),
            }
        }

        let grammar = Grammar {
            names: self.names,
            rules,
            root,
        };
        grammar.check_left_recursion()?;
        Ok(grammar)
    }

    fn error<T>(&self, message: impl Into<String>) -> GrammarResult<T> {
        Err(GrammarError::Syntax {
            offset: self.pos,
            message: message.into(),
        })
    }

    fn peek(&self) -> Option<char> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if c.is_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn expect_str(&mut self, s: &str) -> GrammarResult<()> {
        for expected in s.chars() {
            if self.peek() != Some(expected) {
                return self.error(format!("expected '{}'", s));
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn parse_name(&mut self) -> GrammarResult<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if start == self.pos {
            return self.error("expected rule name");
        }
        Ok(self.src[start..self.pos].iter().collect())
    }

    /// Lookahead: `ident ws* ::=` starts the next rule.
    fn at_rule_start(&self) -> bool {
        let mut i = self.pos;
        while self.src.get(i).copied().is_some_and(is_ident_char) {
            i += 1;
        }
        if i == self.pos {
            return false;
        }
        while self.src.get(i).is_some_and(|c| *c == ' ' || *c == '\t') {
            i += 1;
        }
        self.src.get(i..i + 3) == Some(&[':', ':', '='][..])
    }

    fn rule_id(&mut self, name: &str) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        self.rules.push(None);
        id
    }

    fn generated_rule(&mut self, base: &str, alts: Vec<Alternative>) -> usize {
        let mut n = self.names.len();
        let mut name = format!("{}_{}", base, n);
        while self.index.contains_key(&name) {
            n += 1;
            name = format!("{}_{}", base, n);
        }
        let id = self.rule_id(&name);
        self.rules[id] = Some(alts);
        id
    }

    fn parse_alternatives(&mut self, rule: &str, nested: bool) -> GrammarResult<Vec<Alternative>> {
        let mut alts = vec![self.parse_sequence(rule, nested)?];
        loop {
            self.skip_ws();
            if self.peek() == Some('|') {
                self.pos += 1;
                alts.push(self.parse_sequence(rule, nested)?);
            } else {
                break;
            }
        }
        Ok(alts)
    }

    fn parse_sequence(&mut self, rule: &str, nested: bool) -> GrammarResult<Alternative> {
        let mut seq = Vec::new();
        loop {
            self.skip_ws();
            let term_start = seq.len();
            match self.peek() {
                None | Some('|') | Some(')') => break,
                Some(_) if !nested && self.at_rule_start() => break,
                Some('"') => {
                    self.pos += 1;
                    loop {
                        match self.peek() {
                            None => return self.error("unterminated literal"),
                            Some('"') => {
                                self.pos += 1;
                                break;
                            }
                            Some(_) => {
                                let c = self.parse_char()?;
                                seq.push(Element::Chars(CharSet::single(c)));
                            }
                        }
                    }
                }
                Some('[') => {
                    self.pos += 1;
                    seq.push(Element::Chars(self.parse_class()?));
                }
                Some('.') => {
                    self.pos += 1;
                    seq.push(Element::Chars(CharSet::any()));
                }
                Some('(') => {
                    self.pos += 1;
                    let alts = self.parse_alternatives(rule, true)?;
                    self.skip_ws();
                    self.expect_str(")")?;
                    let id = self.generated_rule(rule, alts);
                    seq.push(Element::Rule(id));
                }
                Some(c) if is_ident_char(c) => {
                    let name = self.parse_name()?;
                    let id = self.rule_id(&name);
                    seq.push(Element::Rule(id));
                }
                Some(c) => return self.error(format!("unexpected character '{}'", c)),
            }

            // Postfix operators bind to the term just parsed.
            let op = match self.peek() {
                Some(c @ ('*' | '+' | '?')) => c,
                _ => continue,
            };
            self.pos += 1;
            if seq.len() == term_start {
                return self.error(format!("'{}' without a preceding term", op));
            }
            let term = seq.split_off(term_start);
            let id = self.generated_rule(rule, Vec::new());
            let alts = match op {
                '*' => {
                    let mut again = term;
                    again.push(Element::Rule(id));
                    vec![again, Vec::new()]
                }
                '+' => {
                    let mut again = term.clone();
                    again.push(Element::Rule(id));
                    vec![again, term]
                }
                _ => vec![term, Vec::new()],
            };
            self.rules[id] = Some(alts);
            seq.push(Element::Rule(id));
        }
        Ok(seq)
    }

    fn parse_class(&mut self) -> GrammarResult<CharSet> {
        let negated = if self.peek() == Some('^') {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut ranges = Vec::new();
        loop {
            match self.peek() {
                None => return self.error("unterminated character class"),
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let lo = self.parse_char()?;
                    let hi = if self.peek() == Some('-') && self.peek_at(1) != Some(']') {
                        self.pos += 1;
                        self.parse_char()?
                    } else {
                        lo
                    };
                    if hi < lo {
                        return self.error("inverted character range");
                    }
                    ranges.push((lo as u32, hi as u32));
                }
            }
        }
        Ok(CharSet { ranges, negated })
    }

    fn parse_char(&mut self) -> GrammarResult<char> {
        let Some(c) = self.bump() else {
            return self.error("unexpected end of input");
        };
        if c != '\\' {
            return Ok(c);
        }
        let Some(esc) = self.bump() else {
            return self.error("unterminated escape");
        };
        match esc {
            'n' => Ok('\n'),
            't' => Ok('\t'),
            'r' => Ok('\r'),
            '\\' | '"' | '[' | ']' | '-' | '^' | '/' => Ok(esc),
            'x' => self.parse_hex(2),
            'u' => self.parse_hex(4),
            'U' => self.parse_hex(8),
            other => self.error(format!("unknown escape '\\{}'", other)),
        }
    }

    fn parse_hex(&mut self, digits: usize) -> GrammarResult<char> {
        let mut value = 0u32;
        for _ in 0..digits {
            let Some(d) = self.peek().and_then(|c| c.to_digit(16)) else {
                return self.error("invalid hex escape");
            };
            self.pos += 1;
            value = value * 16 + d;
        }
        match char::from_u32(value) {
            Some(c) => Ok(c),
            None => self.error("escape is not a valid code point"),
        }
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    rule: usize,
    alt: usize,
    idx: usize,
}

type Stack = Vec<Pos>;

/// Incremental matcher over a [`Grammar`].
///
/// An empty stack means the input so far is a complete sentence.
#[derive(Debug, Clone)]
pub struct GrammarMatcher {
    grammar: Grammar,
    stacks: Vec<Stack>,
    partial: Vec<u8>,
}

impl GrammarMatcher {
    pub fn new(grammar: Grammar) -> Self {
        let mut matcher = Self {
            grammar,
            stacks: Vec::new(),
            partial: Vec::new(),
        };
        matcher.reset();
        matcher
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// Back to the start symbol.
    pub fn reset(&mut self) {
        let root = self.grammar.root;
        let mut stacks = Vec::new();
        for alt in 0..self.grammar.rules[root].len() {
            self.expand(
                vec![Pos {
                    rule: root,
                    alt,
                    idx: 0,
                }],
                &mut stacks,
            );
        }
        self.stacks = stacks;
        self.partial.clear();
    }

    /// Whether the input consumed so far forms a complete sentence.
    pub fn is_accepting(&self) -> bool {
        self.partial.is_empty() && self.stacks.iter().any(Vec::is_empty)
    }

    /// Whether `bytes` could be consumed next, without changing state.
    pub fn accepts_bytes(&self, bytes: &[u8]) -> bool {
        self.advance(bytes).is_some()
    }

    /// Consume `bytes`. Returns false and leaves state unchanged if rejected.
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> bool {
        match self.advance(bytes) {
            Some((stacks, partial)) => {
                self.stacks = stacks;
                self.partial = partial;
                true
            }
            None => false,
        }
    }

    pub fn accept_str(&mut self, text: &str) -> bool {
        self.accept_bytes(text.as_bytes())
    }

    fn advance(&self, bytes: &[u8]) -> Option<(Vec<Stack>, Vec<u8>)> {
        let mut pending = self.partial.clone();
        pending.extend_from_slice(bytes);

        let (text, tail) = match std::str::from_utf8(&pending) {
            Ok(text) => (text, &[][..]),
            Err(err) => {
                if err.error_len().is_some() {
                    return None;
                }
                let (valid, tail) = pending.split_at(err.valid_up_to());
                // valid_up_to marks a UTF-8 boundary
                (std::str::from_utf8(valid).ok()?, tail)
            }
        };

        let mut stacks = self.stacks.clone();
        for c in text.chars() {
            stacks = self.step(&stacks, c);
            if stacks.is_empty() {
                return None;
            }
        }

        if !tail.is_empty() {
            let (lo, hi) = partial_range(tail)?;
            let feasible = stacks.iter().any(|stack| {
                matches!(
                    stack.last().and_then(|top| self.grammar.element(*top)),
                    Some(Element::Chars(set)) if set.intersects(lo, hi)
                )
            });
            if !feasible {
                return None;
            }
        }

        Some((stacks, tail.to_vec()))
    }

    fn step(&self, stacks: &[Stack], c: char) -> Vec<Stack> {
        let mut out = Vec::new();
        for stack in stacks {
            let Some(&top) = stack.last() else {
                continue;
            };
            if let Some(Element::Chars(set)) = self.grammar.element(top) {
                if set.contains(c) {
                    let mut next = stack.clone();
                    if let Some(last) = next.last_mut() {
                        last.idx += 1;
                    }
                    self.expand(next, &mut out);
                }
            }
        }
        out
    }

    /// Normalise a stack until its top is a character position (or it is empty).
    fn expand(&self, mut stack: Stack, out: &mut Vec<Stack>) {
        loop {
            let Some(&top) = stack.last() else {
                push_unique(out, stack);
                return;
            };
            match self.grammar.element(top) {
                None => {
                    stack.pop();
                }
                Some(Element::Chars(_)) => {
                    push_unique(out, stack);
                    return;
                }
                Some(Element::Rule(rule)) => {
                    let rule = *rule;
                    stack.pop();
                    let cont = Pos {
                        idx: top.idx + 1,
                        ..top
                    };
                    if cont.idx < self.grammar.alt_len(cont) {
                        stack.push(cont);
                    }
                    for alt in 0..self.grammar.rules[rule].len() {
                        let mut next = stack.clone();
                        next.push(Pos { rule, alt, idx: 0 });
                        self.expand(next, out);
                    }
                    return;
                }
            }
        }
    }
}

fn push_unique(out: &mut Vec<Stack>, stack: Stack) {
    if !out.contains(&stack) {
        out.push(stack);
    }
}

/// Code point range a partial UTF-8 sequence can still complete to.
fn partial_range(tail: &[u8]) -> Option<(u32, u32)> {
    let lead = *tail.first()?;
    let (len, mask) = match lead {
        0xC0..=0xDF => (2, 0x1F),
        0xE0..=0xEF => (3, 0x0F),
        0xF0..=0xF7 => (4, 0x07),
        _ => return None,
    };
    let decode = |fill: u8| {
        let mut cp = u32::from(lead & mask);
        for i in 1..len {
            let b = tail.get(i).copied().unwrap_or(fill);
            cp = (cp << 6) | u32::from(b & 0x3F);
        }
        cp
    };
    Some((decode(0x80), decode(0xBF)))
}
