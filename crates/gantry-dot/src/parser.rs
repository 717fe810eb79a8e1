use std::time::Duration;

use indexmap::IndexMap;
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;

/// Strip `//` line comments and `/* */` block comments from the input.
///
/// Newlines inside block comments are preserved so error line numbers keep
/// pointing at the original source. String literals are copied verbatim,
/// including escape sequences.
pub(crate) fn strip_comments(input: &str) -> String {
    #[derive(PartialEq)]
    enum Mode {
        Code,
        Line,
        Block,
        Str,
    }

    let mut out = String::with_capacity(input.len());
    let mut mode = Mode::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match mode {
            Mode::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    mode = Mode::Line;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    mode = Mode::Block;
                }
                '"' => {
                    out.push('"');
                    mode = Mode::Str;
                }
                other => out.push(other),
            },
            Mode::Line => {
                if c == '\n' {
                    out.push('\n');
                    mode = Mode::Code;
                }
            }
            Mode::Block => {
                if c == '\n' {
                    out.push('\n');
                } else if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    mode = Mode::Code;
                }
            }
            Mode::Str => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == '"' {
                    mode = Mode::Code;
                }
            }
        }
    }
    out
}

/// Whitespace consumer (including newlines).
fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse a bare identifier: [A-Za-z_][A-Za-z0-9_]*
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Parse a double-quoted string with escape support.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any
            .context(StrContext::Expected(StrContextValue::Description(
                "closing '\"' (unterminated string)",
            )))
            .parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Parse a node id: a quoted string or a bare identifier.
fn node_id(input: &mut &str) -> ModalResult<String> {
    alt((quoted_string, identifier.map(String::from))).parse_next(input)
}

/// Parse a dotted attribute key: identifier ( '.' identifier )*.
fn attr_key(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    if rest.is_empty() {
        return Ok(first.to_string());
    }
    let mut s = first.to_string();
    for part in rest {
        s.push('.');
        s.push_str(part);
    }
    Ok(s)
}

/// Parse a duration value: integer + suffix (ms, s, m, h, d).
fn duration_value(input: &mut &str) -> ModalResult<Duration> {
    let digits: &str = digit1.parse_next(input)?;
    let val: u64 = digits
        .parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))?;
    let suffix = alt(("ms", "s", "m", "h", "d")).parse_next(input)?;
    Ok(match suffix {
        "ms" => Duration::from_millis(val),
        "s" => Duration::from_secs(val),
        "m" => Duration::from_secs(val * 60),
        "h" => Duration::from_secs(val * 3600),
        "d" => Duration::from_secs(val * 86400),
        _ => unreachable!(),
    })
}

fn boolean_value(input: &mut &str) -> ModalResult<bool> {
    alt((literal("true").value(true), literal("false").value(false))).parse_next(input)
}

fn float_value(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt(alt(('-', '+'))), digit1, '.', digit1)
        .take()
        .parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn integer_value(input: &mut &str) -> ModalResult<i64> {
    let s: &str = (opt(alt(('-', '+'))), digit1).take().parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

/// Parse an attribute value. Order matters: durations and floats must be
/// tried before plain integers so their suffixes are not left dangling.
fn attr_value(input: &mut &str) -> ModalResult<AttrValue> {
    alt((
        quoted_string.map(AttrValue::Str),
        boolean_value.map(AttrValue::Bool),
        duration_value.map(AttrValue::Duration),
        float_value.map(AttrValue::Float),
        integer_value.map(AttrValue::Int),
    ))
    .parse_next(input)
}

/// Parse a single attribute: key '=' value.
fn attr(input: &mut &str) -> ModalResult<(String, AttrValue)> {
    let key = attr_key.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = attr_value
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute value",
        )))
        .parse_next(input)?;
    Ok((key, value))
}

/// Parse an attribute block: '[' attr ( (','|';')? attr )* ']'
fn attr_block(input: &mut &str) -> ModalResult<IndexMap<String, AttrValue>> {
    let _ = '['.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let mut attrs = IndexMap::new();
    if let Some((key, value)) = opt(attr).parse_next(input)? {
        attrs.insert(key, value);
        loop {
            let _ = ws.parse_next(input)?;
            let _ = opt(alt((',', ';'))).parse_next(input)?;
            let _ = ws.parse_next(input)?;
            match opt(attr).parse_next(input)? {
                Some((k, v)) => {
                    attrs.insert(k, v);
                }
                None => break,
            }
        }
    }

    let _ = ws.parse_next(input)?;
    let _ = ']'
        .context(StrContext::Expected(StrContextValue::CharLiteral(']')))
        .parse_next(input)?;
    Ok(attrs)
}

/// Intermediate representation of a parsed statement.
enum Statement {
    GraphAttrs(IndexMap<String, AttrValue>),
    NodeDefaults(IndexMap<String, AttrValue>),
    EdgeDefaults(IndexMap<String, AttrValue>),
    Node(String, IndexMap<String, AttrValue>),
    Edge(Vec<String>, IndexMap<String, AttrValue>),
    Subgraph(Option<String>, Vec<Statement>),
    GraphAttrDecl(String, AttrValue),
}

fn keyword_attr_stmt<'i>(
    keyword: &'static str,
) -> impl FnMut(&mut &'i str) -> ModalResult<IndexMap<String, AttrValue>> {
    move |input: &mut &'i str| {
        let _ = literal(keyword).parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let attrs = attr_block.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        Ok(attrs)
    }
}

/// Parse 'subgraph' identifier? '{' statement* '}'
fn subgraph_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("subgraph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = opt(identifier).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'
        .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Subgraph(name.map(String::from), stmts))
}

/// Edge operator: '->' in digraphs, '--' in graphs. The parser accepts
/// either form; the graph-level `directed` flag records the declaration.
fn edge_op<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    alt((literal("->"), literal("--"))).parse_next(input)
}

/// Parse a node statement, an edge chain, or a bare `key = value` graph
/// attribute. All three begin with an identifier, so dispatch happens on
/// what follows.
fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Statement> {
    let first = node_id.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if opt(edge_op).parse_next(input)?.is_some() {
        let mut chain = vec![first];
        loop {
            let _ = ws.parse_next(input)?;
            let next = node_id
                .context(StrContext::Expected(StrContextValue::Description(
                    "edge target identifier",
                )))
                .parse_next(input)?;
            chain.push(next);
            let _ = ws.parse_next(input)?;
            if opt(edge_op).parse_next(input)?.is_none() {
                break;
            }
        }

        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Edge(chain, attrs));
    }

    let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
    let _ = ws.parse_next(input)?;

    if !attrs.is_empty() {
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Node(first, attrs));
    }

    // Bare `key = value` graph attribute declaration.
    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let val = attr_value.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::GraphAttrDecl(first, val));
    }

    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Node(first, attrs))
}

fn statement(input: &mut &str) -> ModalResult<Statement> {
    let _ = ws.parse_next(input)?;
    alt((
        keyword_attr_stmt("graph").map(Statement::GraphAttrs),
        keyword_attr_stmt("node").map(Statement::NodeDefaults),
        keyword_attr_stmt("edge").map(Statement::EdgeDefaults),
        subgraph_stmt,
        node_or_edge_stmt,
    ))
    .parse_next(input)
}

fn statements(input: &mut &str) -> ModalResult<Vec<Statement>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        stmts.push(statement.parse_next(input)?);
    }
    Ok(stmts)
}

struct Merged {
    graph_attrs: IndexMap<String, AttrValue>,
    nodes: IndexMap<String, NodeDef>,
    edges: Vec<EdgeDef>,
    subgraphs: Vec<SubgraphDef>,
    node_defaults: IndexMap<String, AttrValue>,
    edge_defaults: IndexMap<String, AttrValue>,
}

/// Merge parsed statements into graph structure, layering node and edge
/// defaults onto each statement that follows them.
fn merge_statements(
    stmts: Vec<Statement>,
    parent_node_defaults: &IndexMap<String, AttrValue>,
    parent_edge_defaults: &IndexMap<String, AttrValue>,
) -> Merged {
    let mut merged = Merged {
        graph_attrs: IndexMap::new(),
        nodes: IndexMap::new(),
        edges: Vec::new(),
        subgraphs: Vec::new(),
        node_defaults: parent_node_defaults.clone(),
        edge_defaults: parent_edge_defaults.clone(),
    };

    for stmt in stmts {
        match stmt {
            Statement::GraphAttrs(attrs) => merged.graph_attrs.extend(attrs),
            Statement::NodeDefaults(attrs) => merged.node_defaults.extend(attrs),
            Statement::EdgeDefaults(attrs) => merged.edge_defaults.extend(attrs),
            Statement::GraphAttrDecl(key, val) => {
                merged.graph_attrs.insert(key, val);
            }
            Statement::Node(id, mut attrs) => {
                for (k, v) in &merged.node_defaults {
                    attrs.entry(k.clone()).or_insert_with(|| v.clone());
                }
                merged.nodes.insert(id.clone(), NodeDef { id, attrs });
            }
            Statement::Edge(chain, attrs) => {
                // Expand chained edges: A -> B -> C becomes (A,B), (B,C).
                for pair in chain.windows(2) {
                    let mut edge_attrs = merged.edge_defaults.clone();
                    edge_attrs.extend(attrs.clone());
                    merged.edges.push(EdgeDef {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs: edge_attrs,
                    });
                }
                // Edge endpoints without a node statement become implicit nodes.
                for node_id in &chain {
                    if !merged.nodes.contains_key(node_id) {
                        let mut attrs = IndexMap::new();
                        for (k, v) in &merged.node_defaults {
                            attrs.insert(k.clone(), v.clone());
                        }
                        merged.nodes.insert(
                            node_id.clone(),
                            NodeDef {
                                id: node_id.clone(),
                                attrs,
                            },
                        );
                    }
                }
            }
            Statement::Subgraph(name, inner) => {
                let sub = merge_statements(inner, &merged.node_defaults, &merged.edge_defaults);
                merged.subgraphs.push(SubgraphDef {
                    name,
                    attrs: sub.graph_attrs,
                    nodes: sub.nodes,
                    edges: sub.edges,
                    node_defaults: sub.node_defaults,
                    edge_defaults: sub.edge_defaults,
                });
                // Nested subgraphs flatten into the parent's list.
                merged.subgraphs.extend(sub.subgraphs);
            }
        }
    }

    merged
}

/// Top-level parser: ['strict'] ('digraph' | 'graph') name? '{' statements '}'.
fn parse_document(input: &mut &str) -> ModalResult<DotGraph> {
    let _ = ws.parse_next(input)?;

    let strict = opt((literal("strict"), ws)).parse_next(input)?.is_some();

    let directed = alt((
        literal("digraph").value(true),
        literal("graph").value(false),
    ))
    .context(StrContext::Expected(StrContextValue::Description(
        "'digraph' or 'graph' keyword",
    )))
    .parse_next(input)?;

    let _ = ws.parse_next(input)?;
    let name = opt(node_id).parse_next(input)?.unwrap_or_default();
    let _ = ws.parse_next(input)?;
    let _ = '{'
        .context(StrContext::Expected(StrContextValue::CharLiteral('{')))
        .parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'
        .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let empty = IndexMap::new();
    let merged = merge_statements(stmts, &empty, &empty);

    Ok(DotGraph {
        name,
        directed,
        strict,
        attrs: merged.graph_attrs,
        nodes: merged.nodes,
        edges: merged.edges,
        subgraphs: merged.subgraphs,
        node_defaults: merged.node_defaults,
        edge_defaults: merged.edge_defaults,
    })
}

/// Compute (line, col) from how much of the stripped input was consumed.
/// Comment stripping preserves newlines, so line numbers map back to the
/// original source.
fn offset_to_line_col(stripped: &str, remaining_len: usize) -> (usize, usize) {
    let consumed = stripped.len() - remaining_len;
    let prefix = &stripped[..consumed.min(stripped.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

/// Public entry point.
pub fn parse(input: &str) -> gantry_types::Result<DotGraph> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();

    parse_document.parse_next(&mut remaining).map_err(|e| {
        let (line, col) = offset_to_line_col(&stripped, remaining.len());
        let snippet: String = remaining.chars().take(40).collect();
        gantry_types::GantryError::ParseError {
            line,
            col,
            message: format!("{e}"),
            source_snippet: if snippet.is_empty() {
                None
            } else {
                Some(snippet)
            },
        }
    })
}
