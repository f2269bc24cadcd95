//! Restricted expression language.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := compare ( "&&" compare )*
//! compare := unary ( ("==" | "!=" | "===" | "!==" | "<" | "<=" | ">" | ">=") unary )?
//! unary   := "!" unary | "-" unary | postfix
//! postfix := primary ( "." ident | "[" or "]" | "(" args ")" )*
//! primary := number | string | ident | "(" or ")"
//! ```
//!
//! Only builtin functions can be called. There is no assignment and no way to
//! reach anything outside the bound context.

use std::borrow::Cow;
use std::net::IpAddr;

use serde_json::Value;

use super::{Context, TemplateError};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Not,
    Minus,
    Or,
    And,
    Cmp(CmpOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    IsIp,
    IsIpv4,
    IsIpv6,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "is_ip" => Some(Self::IsIp),
            "is_ipv4" => Some(Self::IsIpv4),
            "is_ipv6" => Some(Self::IsIpv6),
            _ => None,
        }
    }

    fn apply(self, args: &[Value]) -> Result<Value, String> {
        let [arg] = args else {
            return Err(format!("{self:?} takes exactly one argument"));
        };
        let text = display(arg);
        let parsed = text.trim().parse::<IpAddr>().ok();
        let ok = match self {
            Self::IsIp => parsed.is_some(),
            Self::IsIpv4 => parsed.is_some_and(|ip| ip.is_ipv4()),
            Self::IsIpv6 => parsed.is_some_and(|ip| ip.is_ipv6()),
        };
        Ok(Value::Bool(ok))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse a full expression; trailing tokens are an error.
    pub(crate) fn parse(source: &str) -> Result<Self, TemplateError> {
        let tokens = tokenize(source).map_err(|(position, message)| TemplateError::Parse {
            expr: source.to_string(),
            position,
            message,
        })?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end: source.len(),
        };
        let parsed = parser.or().and_then(|expr| match parser.peek() {
            None => Ok(expr),
            Some((at, tok)) => Err((*at, format!("unexpected {tok:?}"))),
        });
        parsed.map_err(|(position, message)| TemplateError::Parse {
            expr: source.to_string(),
            position,
            message,
        })
    }

    pub(crate) fn eval<'v>(&self, ctx: &Context<'v>) -> Result<Cow<'v, Value>, String> {
        match self {
            Self::Literal(v) => Ok(Cow::Owned(v.clone())),
            Self::Ident(name) => Ok(ctx
                .get(name)
                .or_else(|| ctx.fallback(name))
                .map(Cow::Borrowed)
                .unwrap_or(Cow::Owned(Value::Null))),
            Self::Member(base, name) => Ok(member(base.eval(ctx)?, name)),
            Self::Index(base, key) => {
                let base = base.eval(ctx)?;
                let key = key.eval(ctx)?;
                if base.is_object() {
                    return Ok(member(base, &display(&key)));
                }
                let position = match key.as_ref() {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) if base.is_array() => s.parse::<u64>().ok().map(|i| i as f64),
                    _ => None,
                };
                Ok(match (position, key.as_ref()) {
                    (Some(f), _) => match index_of(f) {
                        Some(i) => element(base, i),
                        None => Cow::Owned(Value::Null),
                    },
                    (None, Value::Number(_)) => Cow::Owned(Value::Null),
                    (None, other) => member(base, &display(other)),
                })
            }
            Self::Call(builtin, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(ctx).map(Cow::into_owned))
                    .collect::<Result<Vec<_>, _>>()?;
                builtin.apply(&values).map(Cow::Owned)
            }
            Self::Not(inner) => Ok(Cow::Owned(Value::Bool(!truthy(inner.eval(ctx)?.as_ref())))),
            Self::Neg(inner) => Ok(Cow::Owned(number(-to_number(inner.eval(ctx)?.as_ref())))),
            Self::Or(lhs, rhs) => {
                let left = lhs.eval(ctx)?;
                if truthy(&left) {
                    Ok(left)
                } else {
                    rhs.eval(ctx)
                }
            }
            Self::And(lhs, rhs) => {
                let left = lhs.eval(ctx)?;
                if truthy(&left) {
                    rhs.eval(ctx)
                } else {
                    Ok(left)
                }
            }
            Self::Compare(op, lhs, rhs) => {
                let left = lhs.eval(ctx)?;
                let right = rhs.eval(ctx)?;
                Ok(Cow::Owned(Value::Bool(compare(*op, &left, &right))))
            }
        }
    }
}

fn member<'v>(base: Cow<'v, Value>, name: &str) -> Cow<'v, Value> {
    if name == "length" {
        match base.as_ref() {
            Value::String(s) => return Cow::Owned(Value::from(s.chars().count())),
            Value::Array(a) => return Cow::Owned(Value::from(a.len())),
            _ => {}
        }
    }
    match base {
        Cow::Borrowed(v) => v.get(name).map(Cow::Borrowed).unwrap_or(Cow::Owned(Value::Null)),
        Cow::Owned(v) => Cow::Owned(v.get(name).cloned().unwrap_or(Value::Null)),
    }
}

/// Array position for a numeric key; negative, fractional and non-finite
/// keys select nothing.
fn index_of(f: f64) -> Option<usize> {
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64).then(|| f as usize)
}

fn element(base: Cow<'_, Value>, index: usize) -> Cow<'_, Value> {
    match base {
        Cow::Borrowed(v) => v.get(index).map(Cow::Borrowed).unwrap_or(Cow::Owned(Value::Null)),
        Cow::Owned(v) => Cow::Owned(v.get(index).cloned().unwrap_or(Value::Null)),
    }
}

/// JavaScript-style truthiness.
pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form of a value as it appears in a rendered label.
pub(crate) fn display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Array(_) | Value::Object(_) => v.to_string(),
    }
}

fn number(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn to_number(v: &Value) -> f64 {
    match v {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_) | Value::Bool(_), Value::String(_) | Value::Bool(_) | Value::Number(_))
        | (Value::String(_), Value::Number(_) | Value::Bool(_)) => to_number(a) == to_number(b),
        _ => strict_eq(a, b),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    match op {
        CmpOp::StrictEq => strict_eq(a, b),
        CmpOp::StrictNe => !strict_eq(a, b),
        CmpOp::Eq => loose_eq(a, b),
        CmpOp::Ne => !loose_eq(a, b),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (a, b) {
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => to_number(a).partial_cmp(&to_number(b)),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
    }
}

type Spanned = (usize, Token);
type ParseResult<T> = Result<T, (usize, String)>;

fn tokenize(src: &str) -> ParseResult<Vec<Spanned>> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let at = |i: usize| chars.get(i).map(|(_, c)| *c);
    let mut out = Vec::new();
    let mut i = 0;

    while let Some(&(pos, c)) = chars.get(i) {
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = (c, at(i + 1));
        let (token, width) = match two {
            ('|', Some('|')) => (Token::Or, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('=', Some('=')) if at(i + 2) == Some('=') => (Token::Cmp(CmpOp::StrictEq), 3),
            ('=', Some('=')) => (Token::Cmp(CmpOp::Eq), 2),
            ('!', Some('=')) if at(i + 2) == Some('=') => (Token::Cmp(CmpOp::StrictNe), 3),
            ('!', Some('=')) => (Token::Cmp(CmpOp::Ne), 2),
            ('<', Some('=')) => (Token::Cmp(CmpOp::Le), 2),
            ('>', Some('=')) => (Token::Cmp(CmpOp::Ge), 2),
            ('<', _) => (Token::Cmp(CmpOp::Lt), 1),
            ('>', _) => (Token::Cmp(CmpOp::Gt), 1),
            ('!', _) => (Token::Not, 1),
            ('-', _) => (Token::Minus, 1),
            ('.', _) => (Token::Dot, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('"' | '\'', _) => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match at(j) {
                        None => return Err((pos, "unterminated string".to_string())),
                        Some('\\') => {
                            match at(j + 1) {
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                Some(other) => text.push(other),
                                None => return Err((pos, "unterminated string".to_string())),
                            }
                            j += 2;
                        }
                        Some(ch) if ch == quote => break,
                        Some(ch) => {
                            text.push(ch);
                            j += 1;
                        }
                    }
                }
                (Token::Str(text), j + 1 - i)
            }
            (d, _) if d.is_ascii_digit() => {
                let mut j = i;
                while at(j).is_some_and(|ch| ch.is_ascii_digit()) {
                    j += 1;
                }
                if at(j) == Some('.') && at(j + 1).is_some_and(|ch| ch.is_ascii_digit()) {
                    j += 1;
                    while at(j).is_some_and(|ch| ch.is_ascii_digit()) {
                        j += 1;
                    }
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(src.len());
                let value = src[pos..end]
                    .parse::<f64>()
                    .map_err(|e| (pos, format!("bad number: {e}")))?;
                (Token::Num(value), j - i)
            }
            (a, _) if a.is_alphabetic() || a == '_' || a == '$' => {
                let mut j = i;
                while at(j).is_some_and(|ch| ch.is_alphanumeric() || ch == '_' || ch == '$') {
                    j += 1;
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(src.len());
                (Token::Ident(src[pos..end].to_string()), j - i)
            }
            (other, _) => return Err((pos, format!("unexpected character '{other}'"))),
        };

        out.push((pos, token));
        i += width;
    }

    Ok(out)
}

struct Parser<'t> {
    tokens: &'t [Spanned],
    pos: usize,
    end: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn here(&self) -> usize {
        self.peek().map(|(at, _)| *at).unwrap_or(self.end)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().is_some_and(|(_, t)| t == token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> ParseResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err((self.here(), format!("expected {token:?}")))
        }
    }

    fn or(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.compare()?;
        while self.eat(&Token::And) {
            let rhs = self.compare()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn compare(&mut self) -> ParseResult<Expr> {
        let lhs = self.unary()?;
        if let Some((_, Token::Cmp(op))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.unary()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.tokens.get(self.pos) {
                    Some((_, Token::Ident(name))) => {
                        self.pos += 1;
                        expr = Expr::Member(Box::new(expr), name.clone());
                    }
                    _ => return Err((self.here(), "expected property name".to_string())),
                }
            } else if self.eat(&Token::LBracket) {
                let key = self.or()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(key));
            } else if self.peek().is_some_and(|(_, t)| *t == Token::LParen) {
                let at = self.here();
                let builtin = match &expr {
                    Expr::Ident(name) => Builtin::lookup(name),
                    _ => None,
                }
                .ok_or_else(|| (at, "only builtin functions can be called".to_string()))?;
                self.pos += 1;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.or()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                expr = Expr::Call(builtin, args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let at = self.here();
        let Some((_, token)) = self.tokens.get(self.pos) else {
            return Err((at, "unexpected end of expression".to_string()));
        };
        self.pos += 1;
        match token {
            Token::Num(n) => Ok(Expr::Literal(number(*n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s.clone()))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Ident(name.clone()),
            }),
            Token::LParen => {
                let inner = self.or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err((at, format!("unexpected {other:?}"))),
        }
    }
}
