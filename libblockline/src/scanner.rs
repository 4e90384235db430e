//! Line classifier.
//!
//! Splits one raw line into:
//! - indentation depth (leading spaces; tabs are rejected)
//! - the control character that decides how the line is read
//! - the payload, trimmed, with its position inside the line
//! - an optional inline comment introduced by an unescaped `#`
//!
//! Also hosts the small splitters shared by the parser and by streaming
//! re-reads, so both read a line the same way.

use crate::error::{Error, ParseContext, Result, StructuralFault};

/// Half-open byte range `[start, end)` in the source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Grow the span so it covers `other` as well.
    pub fn cover(&mut self, other: Span) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }

    pub fn contains(&self, other: Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Line-initial control character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// `=` key-value pair.
    Pair,
    /// `@` section header, named or unnamed.
    Section,
    /// `:` key-value inside a section.
    Entry,
    /// `,` multi-field row.
    Row,
    /// `-` single item.
    Item,
    /// `&` bare reference item.
    Reference,
    /// `>` block open.
    Open,
    /// `<` block close.
    Close,
    /// Full-line `#` comment.
    Comment,
    /// Whitespace only.
    Blank,
}

impl Control {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '=' => Some(Control::Pair),
            '@' => Some(Control::Section),
            ':' => Some(Control::Entry),
            ',' => Some(Control::Row),
            '-' => Some(Control::Item),
            '&' => Some(Control::Reference),
            '>' => Some(Control::Open),
            '<' => Some(Control::Close),
            '#' => Some(Control::Comment),
            _ => None,
        }
    }

    /// Lines that may continue a section at the section header's own indent.
    pub fn is_section_body(self) -> bool {
        matches!(
            self,
            Control::Entry | Control::Row | Control::Item | Control::Reference
        )
    }
}

/// A slice of a line together with its byte position in that line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece<'a> {
    pub text: &'a str,
    pub start: usize,
}

impl<'a> Piece<'a> {
    pub fn new(text: &'a str, start: usize) -> Self {
        Self { text, start }
    }

    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Trim whitespace from both ends, keeping the position in step.
    pub fn trimmed(self) -> Self {
        let lead = self.text.len() - self.text.trim_start().len();
        Self {
            text: self.text[lead..].trim_end(),
            start: self.start + lead,
        }
    }

    fn slice(self, from: usize, to: usize) -> Self {
        Self {
            text: &self.text[from..to],
            start: self.start + from,
        }
    }
}

/// A classified line.
#[derive(Debug, Clone)]
pub struct ScanLine<'a> {
    /// Full line text, without the line terminator.
    pub text: &'a str,
    /// Number of leading spaces.
    pub indent: usize,
    pub control: Control,
    /// Content after the control character, comment removed, trimmed.
    pub payload: Piece<'a>,
    /// Inline comment text after `#`, trimmed.
    pub comment: Option<&'a str>,
    /// One-based line number.
    pub line_num: usize,
    /// Byte offset of the line start in the stream.
    pub offset: u64,
}

impl<'a> ScanLine<'a> {
    /// Span of the whole line, terminator excluded.
    pub fn span(&self) -> Span {
        Span::new(self.offset, self.offset + self.text.len() as u64)
    }

    /// Stream span of a piece of this line.
    pub fn span_of(&self, piece: Piece<'_>) -> Span {
        Span::new(
            self.offset + piece.start as u64,
            self.offset + piece.end() as u64,
        )
    }

    /// Comment as an owned string, for storage on a node.
    pub fn comment_owned(&self) -> Option<String> {
        self.comment.map(String::from)
    }
}

/// Classify one line.
pub fn classify<'a>(
    text: &'a str,
    line_num: usize,
    offset: u64,
    ctx: &ParseContext,
) -> Result<ScanLine<'a>> {
    let indent = count_indent(text);
    let rest = &text[indent..];

    if rest.trim().is_empty() {
        return Ok(blank(text, indent, Control::Blank, line_num, offset));
    }
    if rest.starts_with('\t') {
        return Err(Error::structural(
            StructuralFault::TabIndent,
            ctx,
            line_num,
            offset,
        ));
    }

    // Safe: rest is non-blank
    let first = rest.chars().next().unwrap_or(' ');
    let control = Control::from_char(first).ok_or_else(|| {
        Error::structural(StructuralFault::BadControl(first), ctx, line_num, offset)
    })?;

    if control == Control::Comment {
        let mut line = blank(text, indent, Control::Comment, line_num, offset);
        line.comment = Some(rest[1..].trim());
        return Ok(line);
    }

    let after = &rest[1..];
    if !after.is_empty() && !after.starts_with(' ') {
        return Err(Error::structural(
            StructuralFault::ExpectedSpaceAfter(first),
            ctx,
            line_num,
            offset,
        ));
    }

    let body = Piece::new(after, indent + 1);
    let (payload, comment) = match find_unescaped(body.text, '#') {
        Some(hash) => (
            body.slice(0, hash),
            Some(body.text[hash + 1..].trim()),
        ),
        None => (body, None),
    };

    Ok(ScanLine {
        text,
        indent,
        control,
        payload: payload.trimmed(),
        comment,
        line_num,
        offset,
    })
}

fn blank(text: &str, indent: usize, control: Control, line_num: usize, offset: u64) -> ScanLine<'_> {
    ScanLine {
        text,
        indent,
        control,
        payload: Piece::new("", text.len()),
        comment: None,
        line_num,
        offset,
    }
}

/// Count the number of leading spaces in a line.
fn count_indent(line: &str) -> usize {
    line.bytes().take_while(|&b| b == b' ').count()
}

/// Find the first occurrence of `ch` not preceded by a backslash escape.
fn find_unescaped(s: &str, ch: char) -> Option<usize> {
    let mut escape = false;
    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' {
            escape = true;
            continue;
        }
        if c == ch {
            return Some(i);
        }
    }
    None
}

/// Drop an inline `# comment` from a line read outside the structural
/// grammar, such as a type declaration.
pub fn strip_comment(text: &str) -> &str {
    match find_unescaped(text, '#') {
        Some(hash) => text[..hash].trim(),
        None => text.trim(),
    }
}

/// Split `key = value` at the first unescaped `=`.
/// Returns `None` when there is no `=`.
pub fn split_pair(payload: Piece<'_>) -> Option<(Piece<'_>, Piece<'_>)> {
    let eq = find_unescaped(payload.text, '=')?;
    let key = payload.slice(0, eq).trimmed();
    let value = payload.slice(eq + 1, payload.text.len()).trimmed();
    Some((key, value))
}

/// Split a row payload at unescaped commas.
pub fn split_fields(payload: Piece<'_>) -> Vec<Piece<'_>> {
    let mut fields = Vec::new();
    if payload.is_empty() {
        return fields;
    }
    let mut rest = payload;
    while let Some(comma) = find_unescaped(rest.text, ',') {
        fields.push(rest.slice(0, comma).trimmed());
        rest = rest.slice(comma + 1, rest.text.len());
    }
    fields.push(rest.trimmed());
    fields
}

/// Separate a leading `(type)` hint from a value.
///
/// A value starting with `\(` has no hint; the escape is removed later by
/// [`unescape`].
pub fn split_hint(value: Piece<'_>) -> (Option<&str>, Piece<'_>) {
    if !value.text.starts_with('(') {
        return (None, value);
    }
    let Some(close) = value.text.find(')') else {
        return (None, value);
    };
    let name = value.text[1..close].trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return (None, value);
    }
    let rest = value.slice(close + 1, value.text.len()).trimmed();
    (Some(name), rest)
}

/// Target id of a `& id` value, if the value is a reference.
pub fn reference_target(value: &str) -> Option<&str> {
    if value == "&" {
        return Some("");
    }
    value.strip_prefix("& ").map(str::trim)
}

/// Resolve backslash escapes in a value or key.
pub fn unescape(s: &str) -> String {
    if !s.contains('\\') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(e @ ('\\' | '#' | '(' | ',' | '=')) => out.push(e),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> ScanLine<'_> {
        classify(text, 1, 0, &ParseContext::new(None)).unwrap()
    }

    #[test]
    fn test_count_indent() {
        assert_eq!(count_indent(""), 0);
        assert_eq!(count_indent("= a = b"), 0);
        assert_eq!(count_indent("  : a = b"), 2);
    }

    #[test]
    fn test_classify_pair() {
        let l = line("= version = 0.2");
        assert_eq!(l.control, Control::Pair);
        assert_eq!(l.indent, 0);
        assert_eq!(l.payload.text, "version = 0.2");
        assert_eq!(l.payload.start, 2);
        assert!(l.comment.is_none());
    }

    #[test]
    fn test_classify_comment_and_positions() {
        let l = line("    : H1 = Exclude  # header one");
        assert_eq!(l.control, Control::Entry);
        assert_eq!(l.indent, 4);
        assert_eq!(l.payload.text, "H1 = Exclude");
        assert_eq!(&l.text[l.payload.start..l.payload.end()], "H1 = Exclude");
        assert_eq!(l.comment, Some("header one"));
    }

    #[test]
    fn test_escaped_hash_is_not_a_comment() {
        let l = line("- issue \\#12");
        assert_eq!(l.payload.text, "issue \\#12");
        assert!(l.comment.is_none());
        assert_eq!(unescape(l.payload.text), "issue #12");
    }

    #[test]
    fn test_unnamed_section() {
        let l = line("@");
        assert_eq!(l.control, Control::Section);
        assert!(l.payload.is_empty());
    }

    #[test]
    fn test_full_line_comment_and_blank() {
        assert_eq!(line("# note").control, Control::Comment);
        assert_eq!(line("#note").control, Control::Comment);
        assert_eq!(line("   ").control, Control::Blank);
    }

    #[test]
    fn test_bad_control() {
        let err = classify("  key = value", 4, 30, &ParseContext::new(None)).unwrap_err();
        assert!(matches!(
            err,
            Error::Structural {
                fault: StructuralFault::BadControl('k'),
                line: 4,
                offset: 30,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_space() {
        let err = classify("-1", 1, 0, &ParseContext::new(None)).unwrap_err();
        assert!(matches!(
            err,
            Error::Structural {
                fault: StructuralFault::ExpectedSpaceAfter('-'),
                ..
            }
        ));
    }

    #[test]
    fn test_tab_indent() {
        assert!(classify("\t= a = b", 1, 0, &ParseContext::new(None)).is_err());
    }

    #[test]
    fn test_split_pair_and_escapes() {
        let l = line("= a\\=b = c = d");
        let (k, v) = split_pair(l.payload).unwrap();
        assert_eq!(unescape(k.text), "a=b");
        assert_eq!(v.text, "c = d");
        assert_eq!(&l.text[v.start..v.end()], "c = d");
        assert!(split_pair(line("= lonely").payload).is_none());
    }

    #[test]
    fn test_split_fields() {
        let l = line(", H1 ,mouse, a\\,b");
        let fields: Vec<&str> = split_fields(l.payload).iter().map(|p| p.text).collect();
        assert_eq!(fields, vec!["H1", "mouse", "a\\,b"]);
        let third = split_fields(l.payload)[2];
        assert_eq!(&l.text[third.start..third.end()], "a\\,b");
    }

    #[test]
    fn test_split_hint() {
        let (hint, rest) = split_hint(Piece::new("(int) 1", 2));
        assert_eq!(hint, Some("int"));
        assert_eq!(rest, Piece::new("1", 8));
        let (hint, rest) = split_hint(Piece::new("\\(int) 1", 0));
        assert_eq!(hint, None);
        assert_eq!(unescape(rest.text), "(int) 1");
        assert_eq!(split_hint(Piece::new("(not a hint) x", 0)).0, None);
    }

    #[test]
    fn test_unescape_newlines() {
        assert_eq!(unescape("a\\nb"), "a\nb");
        assert_eq!(unescape("a\\\\nb"), "a\\nb");
        assert_eq!(unescape("c:\\dir"), "c:\\dir");
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("  (p) = (int)  # point"), "(p) = (int)");
        assert_eq!(strip_comment("(p) = (string) \\# x"), "(p) = (string) \\# x");
    }

    #[test]
    fn test_reference_target() {
        assert_eq!(reference_target("& id2"), Some("id2"));
        assert_eq!(reference_target("&"), Some(""));
        assert_eq!(reference_target("&id2"), None);
    }
}
