//! Condition expression language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! expr       ::= or_expr
//! or_expr    ::= and_expr ( '||' and_expr )*
//! and_expr   ::= not_expr ( '&&' not_expr )*
//! not_expr   ::= '!'? atom
//! atom       ::= comparison | '(' expr ')' | bool_literal
//! comparison ::= key op value
//! key        ::= identifier ( '.' identifier )*
//! op         ::= '=' | '!=' | '<' | '<=' | '>' | '>='
//! value      ::= quoted_string | number | bareword
//! ```
//!
//! Identifiers resolve through a caller-supplied resolver (the outcome of the
//! just-completed node first, then the run context). Unknown identifiers
//! resolve to the empty string, never an error. Comparisons promote to
//! numeric when both sides parse as numbers; otherwise they compare
//! lexically. Evaluation is total and side-effect free.

use gantry_types::GantryError;

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        key: String,
        op: CmpOp,
        value: String,
    },
    Literal(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Value(String),
    Op(CmpOp),
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    True,
    False,
}

fn lex(input: &str) -> Result<Vec<Token>, GantryError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'&' {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(make_error("expected '&&'"));
                }
            }
            '|' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'|' {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(make_error("expected '||'"));
                }
            }
            '!' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    tokens.push(Token::Op(CmpOp::NotEq));
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                // Accept both `=` and `==`.
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    i += 2;
                } else {
                    i += 1;
                }
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '<' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = bytes[i];
                let mut s = String::new();
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    s.push(bytes[i] as char);
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(make_error("unterminated string literal"));
                }
                i += 1;
                tokens.push(Token::Value(s));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                tokens.push(Token::Value(input[start..i].to_string()));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'.')
                {
                    i += 1;
                }
                let word = &input[start..i];
                tokens.push(match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => {
                return Err(make_error(&format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenStream {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

/// Parse a condition string into an [`Expr`].
///
/// An empty or whitespace-only input parses to `Literal(true)`, which
/// [`evaluate`] treats as an unconditional match.
pub fn parse_condition(input: &str) -> Result<Expr, GantryError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Expr::Literal(true));
    }

    let mut stream = TokenStream {
        tokens: lex(trimmed)?,
        pos: 0,
    };
    let expr = parse_or(&mut stream)?;
    if stream.peek().is_some() {
        return Err(make_error("trailing tokens after expression"));
    }
    Ok(expr)
}

fn parse_or(s: &mut TokenStream) -> Result<Expr, GantryError> {
    let first = parse_and(s)?;
    let mut parts = vec![first];
    while s.eat(&Token::OrOr) {
        parts.push(parse_and(s)?);
    }
    Ok(if parts.len() == 1 {
        parts.pop().unwrap()
    } else {
        Expr::Or(parts)
    })
}

fn parse_and(s: &mut TokenStream) -> Result<Expr, GantryError> {
    let first = parse_not(s)?;
    let mut parts = vec![first];
    while s.eat(&Token::AndAnd) {
        parts.push(parse_not(s)?);
    }
    Ok(if parts.len() == 1 {
        parts.pop().unwrap()
    } else {
        Expr::And(parts)
    })
}

fn parse_not(s: &mut TokenStream) -> Result<Expr, GantryError> {
    if s.eat(&Token::Bang) {
        let inner = parse_atom(s)?;
        return Ok(Expr::Not(Box::new(inner)));
    }
    parse_atom(s)
}

fn parse_atom(s: &mut TokenStream) -> Result<Expr, GantryError> {
    match s.next() {
        Some(Token::LParen) => {
            let inner = parse_or(s)?;
            if !s.eat(&Token::RParen) {
                return Err(make_error("missing closing ')'"));
            }
            Ok(inner)
        }
        Some(Token::True) => Ok(Expr::Literal(true)),
        Some(Token::False) => Ok(Expr::Literal(false)),
        Some(Token::Ident(key)) => {
            let op = match s.next() {
                Some(Token::Op(op)) => op,
                _ => return Err(make_error(&format!("expected operator after '{key}'"))),
            };
            let value = match s.next() {
                Some(Token::Value(v)) => v,
                Some(Token::Ident(v)) => v,
                Some(Token::True) => "true".to_string(),
                Some(Token::False) => "false".to_string(),
                _ => return Err(make_error("expected value after operator")),
            };
            Ok(Expr::Compare { key, op, value })
        }
        other => Err(make_error(&format!("unexpected token: {other:?}"))),
    }
}

fn make_error(msg: &str) -> GantryError {
    GantryError::ValidationError(format!("condition parse error: {msg}"))
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluate a condition expression against values provided by a resolver.
///
/// The resolver maps a key (e.g. `"outcome"`, `"tests_passed"`) to its
/// string value; keys it does not know should resolve to the empty string.
pub fn evaluate(expr: &Expr, resolve: &dyn Fn(&str) -> String) -> bool {
    match expr {
        Expr::Literal(b) => *b,
        Expr::Not(inner) => !evaluate(inner, resolve),
        Expr::And(parts) => parts.iter().all(|p| evaluate(p, resolve)),
        Expr::Or(parts) => parts.iter().any(|p| evaluate(p, resolve)),
        Expr::Compare { key, op, value } => {
            let actual = resolve(key);
            // Status comparisons tolerate the conventional uppercase
            // spelling (`outcome=FAIL`).
            if key == "outcome" {
                compare(&actual.to_lowercase(), *op, &value.to_lowercase())
            } else {
                compare(&actual, *op, value)
            }
        }
    }
}

fn compare(actual: &str, op: CmpOp, expected: &str) -> bool {
    // Numeric promotion when both sides parse as numbers.
    if let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) {
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::NotEq => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        };
    }
    match op {
        CmpOp::Eq => actual == expected,
        CmpOp::NotEq => actual != expected,
        CmpOp::Lt => actual < expected,
        CmpOp::Le => actual <= expected,
        CmpOp::Gt => actual > expected,
        CmpOp::Ge => actual >= expected,
    }
}
