use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{DateTime, NaiveDate};
use thiserror::Error;
use vx_types::{Color, TypeError, Value};

use crate::{
    AggregateOp, BinaryOp, Channel, CompareOp, Cubic, EaseOut, ExprArena, ExprId, ExprKind,
    Interpolator, Linear, UnaryOp,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },
    #[error("parse error at token {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },
    #[error("`{function}` expects {expected} argument(s), found {found}")]
    Arity {
        function: String,
        expected: &'static str,
        found: usize,
    },
    #[error("unknown style property `{0}`")]
    UnknownChannel(String),
    #[error("`{0}` is declared more than once")]
    Duplicate(String),
    #[error("undefined variable `@{0}`")]
    UndefinedVariable(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result of parsing a viz string: one root per declared channel plus named variables.
#[derive(Debug)]
pub struct ParsedViz {
    pub arena: ExprArena,
    pub roots: BTreeMap<Channel, ExprId>,
    pub variables: BTreeMap<String, ExprId>,
}

/// Parses a viz string into a fresh arena.
///
/// ```text
///   viz        → ( statement? NEWLINE )*
///   statement  → ( IDENT | "@" IDENT ) ":" or_expr
///   or_expr    → and_expr ( "or" and_expr )*
///   and_expr   → not_expr ( "and" not_expr )*
///   not_expr   → "not" not_expr | comparison
///   comparison → add_expr ( ("==" | "!=" | ">" | ">=" | "<" | "<=") add_expr )?
///   add_expr   → mul_expr ( ("+" | "-") mul_expr )*
///   mul_expr   → unary ( ("*" | "/" | "%") unary )*
///   unary      → "-" unary | power
///   power      → atom ( "^" unary )?
///   atom       → NUMBER | STRING | COLOR | "$" IDENT | "@" IDENT | IDENT | call | "(" or_expr ")"
/// ```
pub fn parse_viz(input: &str) -> Result<ParsedViz, ParseError> {
    parse_viz_in(ExprArena::new(), input)
}

/// Like [`parse_viz`], building into a caller-supplied arena (for a custom clock or config).
pub fn parse_viz_in(mut arena: ExprArena, input: &str) -> Result<ParsedViz, ParseError> {
    let tokens = tokenize(input)?;
    let mut roots = BTreeMap::new();
    let mut variables = BTreeMap::new();

    for line in tokens.split(|t| *t == Token::Newline) {
        if line.is_empty() {
            continue;
        }
        let (target, rest) = match line {
            [target @ (Token::Ident(_) | Token::Variable(_)), Token::Colon, rest @ ..] => {
                (target, rest)
            }
            _ => {
                return Err(ParseError::Syntax {
                    position: 0,
                    message: "expected `name: expression`".to_owned(),
                });
            }
        };
        let mut parser = Parser {
            tokens: rest,
            pos: 0,
            arena: &mut arena,
            variables: &variables,
        };
        let expr = parser.parse_complete()?;
        match target {
            Token::Variable(name) => {
                if variables.insert(name.clone(), expr).is_some() {
                    return Err(ParseError::Duplicate(format!("@{name}")));
                }
            }
            Token::Ident(name) => {
                let channel = Channel::from_name(name)
                    .ok_or_else(|| ParseError::UnknownChannel(name.clone()))?;
                if roots.contains_key(&channel) {
                    return Err(ParseError::Duplicate(name.clone()));
                }
                let root = arena.root(channel, expr);
                roots.insert(channel, root);
            }
            _ => {}
        }
    }

    Ok(ParsedViz {
        arena,
        roots,
        variables,
    })
}

/// Parses a single expression into `arena`.
pub fn parse_expr(arena: &mut ExprArena, input: &str) -> Result<ExprId, ParseError> {
    let tokens = tokenize(input)?;
    let variables = BTreeMap::new();
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        arena,
        variables: &variables,
    };
    parser.parse_complete()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Hex(String),
    Property(String),
    Variable(String),
    // Comparison
    EqEq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    // Grouping
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Newline,
    // Logical (keywords)
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;
    let word_end = |mut j: usize| {
        while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
            j += 1;
        }
        j
    };
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' | ';' => {
                // Line breaks inside calls and lists continue the expression.
                if depth == 0 {
                    tokens.push(Token::Newline);
                }
                i += 1;
            }
            _ if c.is_whitespace() => i += 1,
            '+' | '-' | '*' | '/' | '%' | '^' | ',' | ':' => {
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '^' => Token::Caret,
                    ',' => Token::Comma,
                    _ => Token::Colon,
                });
                i += 1;
            }
            '(' | '[' => {
                depth += 1;
                tokens.push(if c == '(' { Token::LParen } else { Token::LBracket });
                i += 1;
            }
            ')' | ']' => {
                depth = depth.saturating_sub(1);
                tokens.push(if c == ')' { Token::RParen } else { Token::RBracket });
                i += 1;
            }
            '=' | '!' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(ParseError::UnexpectedChar {
                        found: c,
                        offset: i,
                    });
                }
                tokens.push(if c == '=' { Token::EqEq } else { Token::NotEq });
                i += 2;
            }
            '>' | '<' => {
                let or_equal = chars.get(i + 1) == Some(&'=');
                tokens.push(match (c, or_equal) {
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    ('<', true) => Token::Le,
                    _ => Token::Lt,
                });
                i += if or_equal { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ParseError::UnterminatedString { offset: start });
                }
                tokens.push(Token::Str(chars[start + 1..i].iter().collect()));
                i += 1;
            }
            '#' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_hexdigit() {
                    i += 1;
                }
                tokens.push(Token::Hex(chars[start..i].iter().collect()));
            }
            '$' | '@' => {
                let end = word_end(i + 1);
                if end == i + 1 {
                    return Err(ParseError::UnexpectedChar {
                        found: c,
                        offset: i,
                    });
                }
                let name: String = chars[i + 1..end].iter().collect();
                tokens.push(if c == '$' {
                    Token::Property(name)
                } else {
                    Token::Variable(name)
                });
                i = end;
            }
            _ if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| ParseError::Syntax {
                    position: tokens.len(),
                    message: format!("invalid number: {text}"),
                })?;
                tokens.push(Token::Number(value));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let end = word_end(i);
                let word: String = chars[i..end].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
                i = end;
            }
            _ => {
                return Err(ParseError::UnexpectedChar {
                    found: c,
                    offset: i,
                });
            }
        }
    }
    Ok(tokens)
}

fn named_color(name: &str) -> Option<Color> {
    let hex = match name {
        "transparent" => return Some(Color::TRANSPARENT),
        "black" => "#000000",
        "white" => "#ffffff",
        "red" => "#ff0000",
        "green" => "#008000",
        "blue" => "#0000ff",
        "yellow" => "#ffff00",
        "orange" => "#ffa500",
        "purple" => "#800080",
        "gray" | "grey" => "#808080",
        _ => return None,
    };
    Color::from_hex(hex).ok()
}

/// Epoch milliseconds for an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (UTC midnight).
fn parse_date_ms(text: &str) -> Option<f64> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
        return Some(timestamp.timestamp_millis() as f64);
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis() as f64)
}

struct Parser<'t, 'a> {
    tokens: &'t [Token],
    pos: usize,
    arena: &'a mut ExprArena,
    variables: &'a BTreeMap<String, ExprId>,
}

impl Parser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            position: self.pos,
            message: message.into(),
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}, found {:?}", self.peek())))
        }
    }

    fn parse_complete(&mut self) -> Result<ExprId, ParseError> {
        let expr = self.parse_or()?;
        if let Some(token) = self.peek() {
            return Err(self.error(format!("unexpected token {token:?}")));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = self.arena.or(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = self.arena.and(left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<ExprId, ParseError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_not()?;
            return Ok(self.arena.not(inner));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<ExprId, ParseError> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::EqEq) => CompareOp::Eq,
            Some(Token::NotEq) => CompareOp::Ne,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_add()?;
        Ok(self.arena.compare(op, left, right))
    }

    fn parse_add(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = self.arena.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = self.arena.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<ExprId, ParseError> {
        if !self.eat(&Token::Minus) {
            return self.parse_power();
        }
        let inner = self.parse_unary()?;
        // Fold negative literals instead of wrapping them.
        if let ExprKind::Constant(Value::Number(v)) = self.arena.kind_mut(inner) {
            *v = -*v;
            return Ok(inner);
        }
        Ok(self.arena.unary(UnaryOp::Neg, inner))
    }

    fn parse_power(&mut self) -> Result<ExprId, ParseError> {
        let base = self.parse_atom()?;
        if self.eat(&Token::Caret) {
            let exponent = self.parse_unary()?;
            return Ok(self.arena.binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<ExprId, ParseError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of expression"));
        };
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(self.arena.number(n)),
            Token::Str(s) => Ok(self.arena.category(s)),
            Token::Hex(hex) => Ok(self.arena.color(Color::from_hex(&hex)?)),
            Token::Property(name) => Ok(self.arena.property(name)),
            Token::Variable(name) => {
                let source = *self
                    .variables
                    .get(&name)
                    .ok_or(ParseError::UndefinedVariable(name))?;
                Ok(self.arena.duplicate(source))
            }
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    return self.parse_call(&name);
                }
                match name.as_str() {
                    "true" => Ok(self.arena.truthy()),
                    "false" => Ok(self.arena.falsy()),
                    _ => match named_color(&name) {
                        Some(color) => Ok(self.arena.color(color)),
                        None => Err(self.error(format!("unknown identifier `{name}`"))),
                    },
                }
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    /// Comma-separated expressions up to `close`; the opening token is already consumed.
    fn parse_list(&mut self, close: &Token) -> Result<Vec<ExprId>, ParseError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(&Token::Comma)?;
        }
    }

    /// A literal palette or rank: numbers, strings, colors, `rgba(...)`.
    fn parse_literal(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        let id = self.parse_unary()?;
        match self.arena.kind(id) {
            ExprKind::Constant(value) => Ok(value.clone()),
            _ => {
                self.pos = start;
                Err(self.error("expected a literal value"))
            }
        }
    }

    fn parse_literal_list(&mut self) -> Result<Vec<Value>, ParseError> {
        self.expect(&Token::LBracket)?;
        let mut values = Vec::new();
        if self.eat(&Token::RBracket) {
            return Ok(values);
        }
        loop {
            values.push(self.parse_literal()?);
            if self.eat(&Token::RBracket) {
                return Ok(values);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn parse_number_literal(&mut self) -> Result<f64, ParseError> {
        match self.parse_literal()? {
            Value::Number(n) => Ok(n),
            other => Err(self.error(format!("expected a number, found {other:?}"))),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<ExprId, ParseError> {
        self.expect(&Token::LParen)?;
        match name {
            "ramp" => {
                let input = self.parse_or()?;
                self.expect(&Token::Comma)?;
                let palette = self.parse_literal_list()?;
                self.expect(&Token::RParen)?;
                return Ok(self.arena.ramp(input, palette));
            }
            "animate" => {
                let duration = self.parse_number_literal()?;
                self.expect(&Token::RParen)?;
                return Ok(self.arena.animate(duration));
            }
            "globalPercentile" | "viewportPercentile" => {
                let input = self.parse_or()?;
                self.expect(&Token::Comma)?;
                let rank = self.parse_number_literal()?;
                self.expect(&Token::RParen)?;
                let op = AggregateOp::Percentile(rank);
                return Ok(if name.starts_with("global") {
                    self.arena.global(op, input)
                } else {
                    self.arena.viewport(op, input)
                });
            }
            "date" => {
                let Value::Category(text) = self.parse_literal()? else {
                    return Err(self.error("date() expects a string literal"));
                };
                self.expect(&Token::RParen)?;
                let ms = parse_date_ms(&text)
                    .ok_or_else(|| self.error(format!("invalid date literal {text:?}")))?;
                return Ok(self.arena.date_ms(ms));
            }
            "rgba" | "rgb" => {
                let mut channels = Vec::new();
                loop {
                    channels.push(self.parse_number_literal()?);
                    if self.eat(&Token::RParen) {
                        break;
                    }
                    self.expect(&Token::Comma)?;
                }
                let color = match channels.as_slice() {
                    [r, g, b] if name == "rgb" => Color::from_rgba8(*r, *g, *b, 1.0),
                    [r, g, b, a] if name == "rgba" => Color::from_rgba8(*r, *g, *b, *a),
                    _ => {
                        return Err(ParseError::Arity {
                            function: name.to_owned(),
                            expected: if name == "rgb" { "3" } else { "4" },
                            found: channels.len(),
                        });
                    }
                };
                return Ok(self.arena.color(color));
            }
            _ => {}
        }

        let args = self.parse_call_args()?;
        let arity = |expected: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ParseError::Arity {
                    function: name.to_owned(),
                    expected,
                    found: args.len(),
                })
            }
        };

        let aggregate = |suffix: &str| match suffix {
            "Min" => Some(AggregateOp::Min),
            "Max" => Some(AggregateOp::Max),
            "Avg" => Some(AggregateOp::Avg),
            "Sum" => Some(AggregateOp::Sum),
            "Count" => Some(AggregateOp::Count),
            _ => None,
        };
        if let Some(op) = name.strip_prefix("global").and_then(aggregate) {
            arity("1", args.len() == 1)?;
            return Ok(self.arena.global(op, args[0]));
        }
        if let Some(op) = name.strip_prefix("viewport").and_then(aggregate) {
            arity("1", args.len() == 1)?;
            return Ok(self.arena.viewport(op, args[0]));
        }

        let unary = match name {
            "abs" => Some(UnaryOp::Abs),
            "floor" => Some(UnaryOp::Floor),
            "ceil" => Some(UnaryOp::Ceil),
            "sqrt" => Some(UnaryOp::Sqrt),
            _ => None,
        };
        if let Some(op) = unary {
            arity("1", args.len() == 1)?;
            return Ok(self.arena.unary(op, args[0]));
        }

        let easing: Option<Rc<dyn Interpolator>> = match name {
            "ilinear" => Some(Rc::new(Linear)),
            "cubic" => Some(Rc::new(Cubic)),
            "easeOut" => Some(Rc::new(EaseOut)),
            _ => None,
        };
        if let Some(interpolator) = easing {
            arity("1", args.len() == 1)?;
            return Ok(self.arena.ease(interpolator, args[0]));
        }

        match name {
            "now" => {
                arity("0", args.is_empty())?;
                Ok(self.arena.now())
            }
            "between" => {
                arity("3", args.len() == 3)?;
                Ok(self.arena.between(args[0], args[1], args[2]))
            }
            "blend" => {
                arity("3", args.len() == 3)?;
                Ok(self.arena.blend(args[0], args[1], args[2]))
            }
            "in" | "nin" => {
                arity("at least 2", args.len() >= 2)?;
                let values = args[1..].to_vec();
                Ok(if name == "in" {
                    self.arena.in_values(args[0], values)
                } else {
                    self.arena.not_in_values(args[0], values)
                })
            }
            "buckets" => {
                arity("at least 2", args.len() >= 2)?;
                Ok(self.arena.buckets(args[0], args[1..].to_vec()))
            }
            "linear" => match args.as_slice() {
                [input, min, max] => Ok(self.arena.linear(*input, *min, *max)),
                [input] => {
                    // Normalize by the dataset range of the property.
                    let min_source = self.arena.duplicate(*input);
                    let max_source = self.arena.duplicate(*input);
                    let min = self.arena.global(AggregateOp::Min, min_source);
                    let max = self.arena.global(AggregateOp::Max, max_source);
                    Ok(self.arena.linear(*input, min, max))
                }
                _ => Err(ParseError::Arity {
                    function: name.to_owned(),
                    expected: "1 or 3",
                    found: args.len(),
                }),
            },
            _ => Err(ParseError::UnknownFunction {
                name: name.to_owned(),
            }),
        }
    }

    /// Call arguments after `(`. A bracketed list argument is flattened in place.
    fn parse_call_args(&mut self) -> Result<Vec<ExprId>, ParseError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            if self.eat(&Token::LBracket) {
                args.extend(self.parse_list(&Token::RBracket)?);
            } else {
                args.push(self.parse_or()?);
            }
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vx_metadata::{ColumnStats, Feature, Metadata};
    use vx_types::{Color, Value};

    use super::{ParseError, parse_expr, parse_viz};
    use crate::{AggregateOp, Channel, ExprArena, ExprKind};

    fn metadata() -> Arc<Metadata> {
        Arc::new(
            Metadata::new(
                vec![
                    ColumnStats::numeric("price", 0.0, 100.0, 50.0, 500.0, 10.0),
                    ColumnStats::categorical("kind", &["red", "blue"]),
                ],
                Vec::new(),
            )
            .expect("metadata"),
        )
    }

    #[test]
    fn parse_precedence_matches_arithmetic() {
        let mut arena = ExprArena::new();
        let id = parse_expr(&mut arena, "1 + 2 * 3 - -4").expect("parse");
        arena.compile(id, &metadata()).expect("compile");
        assert_eq!(arena.evaluate(id).expect("eval"), Value::Number(11.0));
    }

    #[test]
    fn parse_power_and_modulo() {
        let mut arena = ExprArena::new();
        let id = parse_expr(&mut arena, "2 ^ 3 % 5").expect("parse");
        arena.compile(id, &metadata()).expect("compile");
        assert_eq!(arena.evaluate(id).expect("eval"), Value::Number(3.0));
    }

    #[test]
    fn parse_viz_builds_one_root_per_channel() {
        let viz = parse_viz(
            "color: ramp(linear($price, 0, 100), [#000, #fff])\n\
             width: 3\n\
             filter: $price > 10 and in($kind, ['red', 'blue'])",
        )
        .expect("parse");
        assert_eq!(viz.roots.len(), 3);
        let mut arena = viz.arena;
        let filter = viz.roots[&Channel::Filter];
        arena.compile(filter, &metadata()).expect("compile");
        let f = Feature::new().with("price", 20.0).with("kind", "blue");
        assert!(arena.evaluate_feature(filter, &f).expect("eval").is_truthy());
    }

    #[test]
    fn variables_are_copied_where_referenced() {
        let viz = parse_viz("@big: $price > 50\nfilter: @big or @big").expect("parse");
        let filter = viz.roots[&Channel::Filter];
        assert_eq!(viz.variables.len(), 1);
        let names = viz.arena.property_names(filter);
        assert!(names.contains("price"));
        assert_eq!(
            viz.arena
                .descendants(filter)
                .into_iter()
                .filter(|id| matches!(viz.arena.kind(*id), ExprKind::Property { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn multi_line_calls_continue_the_statement() {
        let viz = parse_viz("filter: between(\n  $price,\n  10,\n  20\n)\n").expect("parse");
        assert_eq!(viz.roots.len(), 1);
    }

    #[test]
    fn parse_aggregates_and_literals() {
        let mut arena = ExprArena::new();
        let id = parse_expr(&mut arena, "globalPercentile($price, 25)").expect("parse");
        assert!(matches!(
            arena.kind(id),
            ExprKind::GlobalAggregate {
                op: AggregateOp::Percentile(p),
                ..
            } if *p == 25.0
        ));

        let color = parse_expr(&mut arena, "rgba(255, 0, 0, 0.5)").expect("parse");
        assert!(matches!(
            arena.kind(color),
            ExprKind::Constant(Value::Color(c)) if *c == Color::new(1.0, 0.0, 0.0, 0.5)
        ));
    }

    #[test]
    fn unknown_channel_and_function_are_reported() {
        assert_eq!(
            parse_viz("symbol: 1").expect_err("must fail"),
            ParseError::UnknownChannel("symbol".to_owned())
        );
        assert!(matches!(
            parse_viz("width: wiggle(1)").expect_err("must fail"),
            ParseError::UnknownFunction { .. }
        ));
        assert!(matches!(
            parse_viz("width: between(1, 2)").expect_err("must fail"),
            ParseError::Arity { .. }
        ));
        assert!(matches!(
            parse_viz("width: 1\nwidth: 2").expect_err("must fail"),
            ParseError::Duplicate(_)
        ));
    }

    #[test]
    fn parse_error_single_equals() {
        let mut arena = ExprArena::new();
        assert!(matches!(
            parse_expr(&mut arena, "$price = 3"),
            Err(ParseError::UnexpectedChar { found: '=', .. })
        ));
    }

    #[test]
    fn date_literals_parse_to_epoch_milliseconds() {
        let mut arena = ExprArena::new();
        let day = parse_expr(&mut arena, "date('1970-01-02')").expect("parse");
        let stamp = parse_expr(&mut arena, "date('1970-01-01T00:00:01Z')").expect("parse");
        assert!(matches!(arena.kind(day), ExprKind::Constant(Value::Date(ms)) if *ms == 86_400_000.0));
        assert!(matches!(arena.kind(stamp), ExprKind::Constant(Value::Date(ms)) if *ms == 1_000.0));
        assert!(parse_expr(&mut arena, "date('yesterday')").is_err());
    }

    #[test]
    fn linear_with_one_argument_normalizes_by_dataset_range() {
        let mut arena = ExprArena::new();
        let id = parse_expr(&mut arena, "linear($price)").expect("parse");
        arena.compile(id, &metadata()).expect("compile");
        let f = Feature::new().with("price", 25.0);
        assert_eq!(arena.evaluate_feature(id, &f).expect("eval"), Value::Number(0.25));
    }
}
