use crate::arena::{Term, TermArena, TermChildren, TermId, Value};
use crate::error::{EvalError, EvalResult};
use num_bigint::BigInt;
use std::iter::Peekable;
use std::str::Chars;
use std::str::FromStr;

#[derive(Debug, PartialEq)]
pub enum Token {
    LParen,
    RParen,
    Symbol(String),
    String(String),
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { chars: input.chars().peekable() }
    }

    fn next_token(&mut self) -> Option<Token> {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            match c {
                '(' => {
                    self.chars.next();
                    return Some(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    return Some(Token::RParen);
                }
                ';' => {
                    while let Some(&x) = self.chars.peek() {
                        if x == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                    continue;
                }
                '"' => {
                    self.chars.next();
                    let mut s = String::new();
                    while let Some(&x) = self.chars.peek() {
                        if x == '"' {
                            self.chars.next();
                            return Some(Token::String(s));
                        }
                        if x == '\\' {
                            self.chars.next();
                            if let Some(&escaped) = self.chars.peek() {
                                s.push(escaped);
                                self.chars.next();
                            }
                        } else {
                            s.push(x);
                            self.chars.next();
                        }
                    }
                    return Some(Token::String(s));
                }
                _ => {
                    let mut s = String::new();
                    while let Some(&x) = self.chars.peek() {
                        if x.is_whitespace() || x == '(' || x == ')' || x == ';' {
                            break;
                        }
                        s.push(x);
                        self.chars.next();
                    }
                    return Some(Token::Symbol(s));
                }
            }
        }
        None
    }
}

/// Whether `id` is usable as a symbol: lexed as one token, not a literal.
pub fn is_symbol(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        None => false,
        Some(c) if c == '#' || c.is_ascii_digit() => false,
        Some(_) => !id
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';')),
    }
}

fn classify_symbol(s: &str) -> Value {
    match s {
        "#t" => Value::Bool(true),
        "#f" => Value::Bool(false),
        "#inert" => Value::Unspecified,
        _ => {
            let leader = s.chars().next();
            let numeric_shape = match leader {
                Some(c) if c.is_ascii_digit() => true,
                Some('+') | Some('-') => s.len() > 1,
                _ => false,
            };
            if numeric_shape {
                if let Ok(n) = BigInt::from_str(s) {
                    return Value::Int(n);
                }
            }
            // Unrecognized literal shapes stay tokens; the leaf reducer
            // rejects them with the precise error.
            Value::Token(s.to_string())
        }
    }
}

pub struct Parser<'a> {
    undo: Option<Token>,
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { undo: None, lexer: Lexer::new(input) }
    }

    fn peek(&mut self) -> Option<&Token> {
        if self.undo.is_none() {
            self.undo = self.lexer.next_token();
        }
        self.undo.as_ref()
    }

    fn consume(&mut self) -> Option<Token> {
        if let Some(t) = self.undo.take() {
            Some(t)
        } else {
            self.lexer.next_token()
        }
    }

    pub fn has_more(&mut self) -> bool {
        self.peek().is_some()
    }

    /// Parse the next complete term into the arena. List nesting is
    /// tracked with an explicit stack, so input depth never grows the
    /// host stack.
    pub fn parse_term(&mut self, arena: &mut TermArena) -> EvalResult<TermId> {
        let mut stack: Vec<TermChildren> = Vec::new();
        loop {
            let token = self
                .consume()
                .ok_or_else(|| EvalError::invalid_syntax("Unexpected end of input."))?;
            let completed = match token {
                Token::LParen => {
                    stack.push(TermChildren::new());
                    continue;
                }
                Token::RParen => {
                    let children = stack
                        .pop()
                        .ok_or_else(|| EvalError::invalid_syntax("Unexpected ')' found."))?;
                    arena.add(Term::list(children))
                }
                Token::Symbol(s) => arena.add(Term::leaf(classify_symbol(&s))),
                Token::String(s) => arena.add(Term::leaf(Value::Str(s))),
            };
            match stack.last_mut() {
                Some(top) => top.push(completed),
                None => return Ok(completed),
            }
        }
    }
}

/// Parse exactly one term from `input`.
pub fn parse_one(arena: &mut TermArena, input: &str) -> EvalResult<TermId> {
    Parser::new(input).parse_term(arena)
}
