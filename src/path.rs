//! Attribute paths such as `reviews[_key=="abc"].stars` or `tags[-1]`.
//!
//! The client only checks that a path is well formed. Resolving selectors
//! against actual array contents is the store's job.

use std::fmt;

use crate::error::Error;

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Object attribute.
  Field(String),
  /// Array position; negative values count from the end.
  Index(i64),
  /// Array element whose `_key` equals the value.
  Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
  segments: Vec<Segment>,
}

impl Path {
  pub fn parse(input: &str) -> Result<Self, Error> {
    Parser::new(input).parse()
  }

  pub fn segments(&self) -> &[Segment] {
    &self.segments
  }

  /// The top-level attribute the path starts with.
  pub fn root(&self) -> &str {
    match self.segments.first() {
      Some(Segment::Field(name)) => name,
      _ => "",
    }
  }

  /// Split off the last segment. `None` for single-segment paths.
  pub fn split_last(&self) -> Option<(Path, &Segment)> {
    let (last, rest) = self.segments.split_last()?;
    if rest.is_empty() {
      return None;
    }
    Some((
      Path {
        segments: rest.to_vec(),
      },
      last,
    ))
  }

  pub fn last(&self) -> Option<&Segment> {
    self.segments.last()
  }
}

impl fmt::Display for Path {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, segment) in self.segments.iter().enumerate() {
      match segment {
        Segment::Field(name) if i == 0 => write!(f, "{}", name)?,
        Segment::Field(name) => write!(f, ".{}", name)?,
        Segment::Index(index) => write!(f, "[{}]", index)?,
        Segment::Key(key) => write!(f, "[_key=={:?}]", key)?,
      }
    }
    Ok(())
  }
}

struct Parser<'a> {
  input: &'a str,
  chars: Vec<char>,
  pos: usize,
}

impl<'a> Parser<'a> {
  fn new(input: &'a str) -> Self {
    Self {
      input,
      chars: input.chars().collect(),
      pos: 0,
    }
  }

  fn error(&self, reason: impl Into<String>) -> Error {
    Error::InvalidPath {
      path: self.input.to_string(),
      reason: format!("{} at position {}", reason.into(), self.pos),
    }
  }

  fn peek(&self) -> Option<char> {
    self.chars.get(self.pos).copied()
  }

  fn skip_spaces(&mut self) {
    while self.peek() == Some(' ') {
      self.pos += 1;
    }
  }

  fn parse(mut self) -> Result<Path, Error> {
    if self.chars.is_empty() {
      return Err(self.error("empty path"));
    }
    let mut segments = vec![Segment::Field(self.identifier()?)];
    while let Some(c) = self.peek() {
      match c {
        '.' => {
          self.pos += 1;
          segments.push(Segment::Field(self.identifier()?));
        }
        '[' => {
          self.pos += 1;
          segments.push(self.selector()?);
        }
        other => return Err(self.error(format!("unexpected character {:?}", other))),
      }
    }
    Ok(Path { segments })
  }

  fn identifier(&mut self) -> Result<String, Error> {
    let start = self.pos;
    match self.peek() {
      Some(c) if c.is_ascii_alphabetic() || c == '_' => self.pos += 1,
      _ => return Err(self.error("expected attribute name")),
    }
    while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
      self.pos += 1;
    }
    Ok(self.chars[start..self.pos].iter().collect())
  }

  fn selector(&mut self) -> Result<Segment, Error> {
    self.skip_spaces();
    let segment = match self.peek() {
      Some(c) if c == '-' || c.is_ascii_digit() => {
        let start = self.pos;
        self.pos += 1;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
          self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let index = text
          .parse::<i64>()
          .map_err(|_| self.error(format!("invalid index {:?}", text)))?;
        Segment::Index(index)
      }
      Some('_') => {
        let name = self.identifier()?;
        if name != "_key" {
          return Err(self.error("only _key selectors are supported"));
        }
        self.skip_spaces();
        if self.chars.get(self.pos..self.pos + 2) != Some(&['=', '='][..]) {
          return Err(self.error("expected =="));
        }
        self.pos += 2;
        self.skip_spaces();
        Segment::Key(self.string_literal()?)
      }
      _ => return Err(self.error("expected index or _key selector")),
    };
    self.skip_spaces();
    if self.peek() != Some(']') {
      return Err(self.error("expected ]"));
    }
    self.pos += 1;
    Ok(segment)
  }

  fn string_literal(&mut self) -> Result<String, Error> {
    let quote = match self.peek() {
      Some(q @ ('"' | '\'')) => q,
      _ => return Err(self.error("expected quoted key")),
    };
    self.pos += 1;
    let start = self.pos;
    while let Some(c) = self.peek() {
      if c == quote {
        let value = self.chars[start..self.pos].iter().collect();
        self.pos += 1;
        return Ok(value);
      }
      self.pos += 1;
    }
    Err(self.error("unterminated key"))
  }
}
