//! A small evaluator for the filter language, enough to back the in-memory
//! store: `*[filter] | order(a asc, b desc) [0...10] {a, b}` or a bare filter.
//!
//! Supported in filters: attribute paths (`a.b`), string/number/boolean/null
//! literals, `$params`, `== != < <= > >=`, `in [..]`, `defined(path)`,
//! `&& || !` and parentheses.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::protocol::{Params, ServerError, ServerErrorKind};

#[derive(Debug, Clone, PartialEq)]
enum Token {
  Star,
  LBracket,
  RBracket,
  LParen,
  RParen,
  LBrace,
  RBrace,
  Pipe,
  Comma,
  Dot,
  /// `..` (inclusive) or `...` (exclusive)
  Range(bool),
  Cmp(CmpOp),
  And,
  Or,
  Not,
  Ident(String),
  Param(String),
  Str(String),
  Num(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
  Literal(Value),
  Param(String),
  Attr(Vec<String>),
  Array(Vec<Expr>),
  Compare(CmpOp, Box<Expr>, Box<Expr>),
  In(Box<Expr>, Box<Expr>),
  Defined(Box<Expr>),
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
  Not(Box<Expr>),
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
  filter: Option<Expr>,
  order: Vec<(Vec<String>, bool)>,
  slice: Option<(usize, Option<usize>)>,
  projection: Option<Vec<String>>,
}

fn syntax(position: usize, message: impl Into<String>) -> ServerError {
  ServerError::new(ServerErrorKind::Syntax, message).at(position)
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ServerError> {
  let chars: Vec<char> = input.chars().collect();
  let mut tokens = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    let start = i;
    let next = chars.get(i + 1).copied();
    let token = match c {
      c if c.is_whitespace() => {
        i += 1;
        continue;
      }
      '*' => Token::Star,
      '[' => Token::LBracket,
      ']' => Token::RBracket,
      '(' => Token::LParen,
      ')' => Token::RParen,
      '{' => Token::LBrace,
      '}' => Token::RBrace,
      ',' => Token::Comma,
      '.' if next == Some('.') => {
        if chars.get(i + 2) == Some(&'.') {
          i += 3;
          tokens.push((Token::Range(false), start));
        } else {
          i += 2;
          tokens.push((Token::Range(true), start));
        }
        continue;
      }
      '.' => Token::Dot,
      '|' if next == Some('|') => {
        i += 1;
        Token::Or
      }
      '|' => Token::Pipe,
      '&' if next == Some('&') => {
        i += 1;
        Token::And
      }
      '=' if next == Some('=') => {
        i += 1;
        Token::Cmp(CmpOp::Eq)
      }
      '!' if next == Some('=') => {
        i += 1;
        Token::Cmp(CmpOp::Ne)
      }
      '!' => Token::Not,
      '<' if next == Some('=') => {
        i += 1;
        Token::Cmp(CmpOp::Le)
      }
      '<' => Token::Cmp(CmpOp::Lt),
      '>' if next == Some('=') => {
        i += 1;
        Token::Cmp(CmpOp::Ge)
      }
      '>' => Token::Cmp(CmpOp::Gt),
      '"' | '\'' => {
        let quote = c;
        let mut value = String::new();
        i += 1;
        loop {
          match chars.get(i) {
            None => return Err(syntax(start, "unterminated string literal")),
            Some('\\') => {
              match chars.get(i + 1) {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(other) => value.push(*other),
                None => return Err(syntax(start, "unterminated string literal")),
              }
              i += 2;
            }
            Some(ch) if *ch == quote => break,
            Some(ch) => {
              value.push(*ch);
              i += 1;
            }
          }
        }
        Token::Str(value)
      }
      '$' => {
        i += 1;
        let name_start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_') {
          i += 1;
        }
        if i == name_start {
          return Err(syntax(start, "expected parameter name after $"));
        }
        tokens.push((Token::Param(chars[name_start..i].iter().collect()), start));
        continue;
      }
      c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
        i += 1;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
          i += 1;
        }
        // A single dot followed by a digit is a decimal point; `..` is a range.
        if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
          i += 1;
          while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
          }
        }
        let text: String = chars[start..i].iter().collect();
        let number = text
          .parse::<f64>()
          .map_err(|_| syntax(start, format!("invalid number {}", text)))?;
        tokens.push((Token::Num(number), start));
        continue;
      }
      c if c.is_alphabetic() || c == '_' => {
        while chars.get(i).is_some_and(|c| c.is_alphanumeric() || *c == '_') {
          i += 1;
        }
        tokens.push((Token::Ident(chars[start..i].iter().collect()), start));
        continue;
      }
      other => return Err(syntax(start, format!("unexpected character {:?}", other))),
    };
    tokens.push((token, start));
    i += 1;
  }
  Ok(tokens)
}

struct Parser {
  tokens: Vec<(Token, usize)>,
  pos: usize,
  end: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos).map(|(t, _)| t)
  }

  fn peek_at(&self, offset: usize) -> Option<&Token> {
    self.tokens.get(self.pos + offset).map(|(t, _)| t)
  }

  fn position(&self) -> usize {
    self.tokens.get(self.pos).map_or(self.end, |(_, p)| *p)
  }

  fn advance(&mut self) -> Option<Token> {
    let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
    self.pos += 1;
    token
  }

  fn eat(&mut self, expected: &Token) -> bool {
    if self.peek() == Some(expected) {
      self.pos += 1;
      true
    } else {
      false
    }
  }

  fn expect(&mut self, expected: Token, what: &str) -> Result<(), ServerError> {
    if self.eat(&expected) {
      Ok(())
    } else {
      Err(syntax(self.position(), format!("expected {}", what)))
    }
  }

  fn query(&mut self) -> Result<Query, ServerError> {
    let mut query = Query {
      filter: None,
      order: Vec::new(),
      slice: None,
      projection: None,
    };

    if self.eat(&Token::Star) {
      if self.peek() == Some(&Token::LBracket) && !self.at_slice() {
        self.advance();
        query.filter = Some(self.or()?);
        self.expect(Token::RBracket, "]")?;
      }
    } else {
      query.filter = Some(self.or()?);
    }

    while let Some(token) = self.peek().cloned() {
      match token {
        Token::Pipe => {
          self.advance();
          match self.advance() {
            Some(Token::Ident(name)) if name == "order" => {}
            _ => return Err(syntax(self.position(), "expected order(...) after |")),
          }
          self.expect(Token::LParen, "(")?;
          loop {
            let path = self.path()?;
            let desc = match self.peek() {
              Some(Token::Ident(dir)) if dir == "desc" => true,
              Some(Token::Ident(dir)) if dir == "asc" => false,
              _ => {
                query.order.push((path, false));
                if self.eat(&Token::Comma) {
                  continue;
                }
                break;
              }
            };
            self.advance();
            query.order.push((path, desc));
            if !self.eat(&Token::Comma) {
              break;
            }
          }
          self.expect(Token::RParen, ")")?;
        }
        Token::LBracket if self.at_slice() => {
          self.advance();
          let start = self.index()?;
          let inclusive = match self.advance() {
            Some(Token::Range(inclusive)) => inclusive,
            _ => return Err(syntax(self.position(), "expected .. or ...")),
          };
          let end = match self.peek() {
            Some(Token::RBracket) => None,
            _ => {
              let end = self.index()?;
              Some(if inclusive { end.saturating_add(1) } else { end })
            }
          };
          self.expect(Token::RBracket, "]")?;
          query.slice = Some((start, end));
        }
        Token::LBrace => {
          self.advance();
          let mut fields = Vec::new();
          while let Some(Token::Ident(name)) = self.peek().cloned() {
            self.advance();
            fields.push(name);
            if !self.eat(&Token::Comma) {
              break;
            }
          }
          self.expect(Token::RBrace, "}")?;
          query.projection = Some(fields);
        }
        _ => return Err(syntax(self.position(), "unexpected token")),
      }
    }
    Ok(query)
  }

  fn at_slice(&self) -> bool {
    matches!(
      (self.peek(), self.peek_at(1), self.peek_at(2)),
      (Some(Token::LBracket), Some(Token::Num(_)), Some(Token::Range(_)))
    )
  }

  fn index(&mut self) -> Result<usize, ServerError> {
    let position = self.position();
    match self.advance() {
      Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
      _ => Err(syntax(position, "expected a non-negative integer")),
    }
  }

  fn path(&mut self) -> Result<Vec<String>, ServerError> {
    let mut path = Vec::new();
    loop {
      let position = self.position();
      match self.advance() {
        Some(Token::Ident(name)) => path.push(name),
        _ => return Err(syntax(position, "expected attribute name")),
      }
      if !self.eat(&Token::Dot) {
        return Ok(path);
      }
    }
  }

  fn or(&mut self) -> Result<Expr, ServerError> {
    let mut left = self.and()?;
    while self.eat(&Token::Or) {
      let right = self.and()?;
      left = Expr::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn and(&mut self) -> Result<Expr, ServerError> {
    let mut left = self.unary()?;
    while self.eat(&Token::And) {
      let right = self.unary()?;
      left = Expr::And(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn unary(&mut self) -> Result<Expr, ServerError> {
    if self.eat(&Token::Not) {
      return Ok(Expr::Not(Box::new(self.unary()?)));
    }
    self.comparison()
  }

  fn comparison(&mut self) -> Result<Expr, ServerError> {
    let left = self.primary()?;
    match self.peek().cloned() {
      Some(Token::Cmp(op)) => {
        self.advance();
        let right = self.primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
      }
      Some(Token::Ident(word)) if word == "in" => {
        self.advance();
        let right = self.primary()?;
        Ok(Expr::In(Box::new(left), Box::new(right)))
      }
      _ => Ok(left),
    }
  }

  fn primary(&mut self) -> Result<Expr, ServerError> {
    let position = self.position();
    match self.peek().cloned() {
      Some(Token::LParen) => {
        self.advance();
        let inner = self.or()?;
        self.expect(Token::RParen, ")")?;
        Ok(inner)
      }
      Some(Token::LBracket) => {
        self.advance();
        let mut items = Vec::new();
        if !self.eat(&Token::RBracket) {
          loop {
            items.push(self.primary()?);
            if !self.eat(&Token::Comma) {
              break;
            }
          }
          self.expect(Token::RBracket, "]")?;
        }
        Ok(Expr::Array(items))
      }
      Some(Token::Str(s)) => {
        self.advance();
        Ok(Expr::Literal(Value::String(s)))
      }
      Some(Token::Num(n)) => {
        self.advance();
        Ok(Expr::Literal(number(n)))
      }
      Some(Token::Param(name)) => {
        self.advance();
        Ok(Expr::Param(name))
      }
      Some(Token::Ident(word)) => match word.as_str() {
        "true" | "false" => {
          self.advance();
          Ok(Expr::Literal(Value::Bool(word == "true")))
        }
        "null" => {
          self.advance();
          Ok(Expr::Literal(Value::Null))
        }
        "defined" if self.peek_at(1) == Some(&Token::LParen) => {
          self.advance();
          self.advance();
          let path = self.path()?;
          self.expect(Token::RParen, ")")?;
          Ok(Expr::Defined(Box::new(Expr::Attr(path))))
        }
        _ => Ok(Expr::Attr(self.path()?)),
      },
      _ => Err(syntax(position, "expected an expression")),
    }
  }
}

/// Whole numbers stay integers so `1 + 1` stores as `2`, not `2.0`.
pub(super) fn number(n: f64) -> Value {
  if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
    Value::from(n as i64)
  } else {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
  }
}

impl Query {
  pub fn parse(input: &str) -> Result<Self, ServerError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
      tokens,
      pos: 0,
      end: input.chars().count(),
    };
    parser.query()
  }

  /// Whether `doc` passes the filter. A query without one matches everything.
  pub fn matches(&self, doc: &Value, params: &Params) -> Result<bool, ServerError> {
    match &self.filter {
      None => Ok(true),
      Some(expr) => Ok(eval(expr, doc, params)? == Value::Bool(true)),
    }
  }

  /// Filter, order, slice and project `docs`.
  pub fn run<'a, I>(&self, docs: I, params: &Params) -> Result<Vec<Value>, ServerError>
  where
    I: IntoIterator<Item = &'a Value>,
  {
    let mut rows = Vec::new();
    for doc in docs {
      if self.matches(doc, params)? {
        rows.push(doc);
      }
    }

    if !self.order.is_empty() {
      rows.sort_by(|a, b| {
        for (path, desc) in &self.order {
          let ord = compare_total(lookup(a, path), lookup(b, path));
          let ord = if *desc { ord.reverse() } else { ord };
          if ord != Ordering::Equal {
            return ord;
          }
        }
        Ordering::Equal
      });
    }

    let rows: Vec<&Value> = match self.slice {
      Some((start, end)) => {
        let end = end.unwrap_or(rows.len()).min(rows.len());
        rows.get(start.min(end)..end).unwrap_or_default().to_vec()
      }
      None => rows,
    };

    Ok(rows
      .into_iter()
      .map(|doc| match &self.projection {
        Some(fields) => {
          let projected: Map<String, Value> = fields
            .iter()
            .map(|f| (f.clone(), doc.get(f).cloned().unwrap_or(Value::Null)))
            .collect();
          Value::Object(projected)
        }
        None => doc.clone(),
      })
      .collect())
  }
}

fn lookup<'a>(doc: &'a Value, path: &[String]) -> &'a Value {
  let mut current = doc;
  for segment in path {
    match current.get(segment) {
      Some(next) => current = next,
      None => return &Value::Null,
    }
  }
  current
}

fn eval(expr: &Expr, doc: &Value, params: &Params) -> Result<Value, ServerError> {
  Ok(match expr {
    Expr::Literal(v) => v.clone(),
    Expr::Param(name) => params.get(name).cloned().ok_or_else(|| {
      ServerError::new(ServerErrorKind::UnknownParameter, name.clone())
    })?,
    Expr::Attr(path) => lookup(doc, path).clone(),
    Expr::Array(items) => Value::Array(
      items
        .iter()
        .map(|item| eval(item, doc, params))
        .collect::<Result<_, _>>()?,
    ),
    Expr::Compare(op, left, right) => {
      let left = eval(left, doc, params)?;
      let right = eval(right, doc, params)?;
      compare(*op, &left, &right)
    }
    Expr::In(needle, haystack) => {
      let needle = eval(needle, doc, params)?;
      match eval(haystack, doc, params)? {
        Value::Array(items) => Value::Bool(items.iter().any(|item| equal(item, &needle))),
        _ => Value::Null,
      }
    }
    Expr::Defined(inner) => Value::Bool(!eval(inner, doc, params)?.is_null()),
    Expr::And(left, right) => {
      match (eval(left, doc, params)?, eval(right, doc, params)?) {
        (Value::Bool(false), _) | (_, Value::Bool(false)) => Value::Bool(false),
        (Value::Bool(true), Value::Bool(true)) => Value::Bool(true),
        _ => Value::Null,
      }
    }
    Expr::Or(left, right) => {
      match (eval(left, doc, params)?, eval(right, doc, params)?) {
        (Value::Bool(true), _) | (_, Value::Bool(true)) => Value::Bool(true),
        (Value::Bool(false), Value::Bool(false)) => Value::Bool(false),
        _ => Value::Null,
      }
    }
    Expr::Not(inner) => match eval(inner, doc, params)? {
      Value::Bool(b) => Value::Bool(!b),
      _ => Value::Null,
    },
  })
}

fn equal(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
    _ => a == b,
  }
}

/// Partial ordering between values of the same scalar kind.
fn order(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    _ => None,
  }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Value {
  match op {
    CmpOp::Eq => Value::Bool(equal(a, b)),
    CmpOp::Ne => Value::Bool(!equal(a, b)),
    _ => match order(a, b) {
      None => Value::Null,
      Some(ord) => Value::Bool(match op {
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        _ => ord != Ordering::Less,
      }),
    },
  }
}

/// Total order for sorting: null < bool < number < string < everything else.
fn compare_total(a: &Value, b: &Value) -> Ordering {
  fn rank(v: &Value) -> u8 {
    match v {
      Value::Null => 0,
      Value::Bool(_) => 1,
      Value::Number(_) => 2,
      Value::String(_) => 3,
      _ => 4,
    }
  }
  order(a, b).unwrap_or_else(|| rank(a).cmp(&rank(b)))
}
