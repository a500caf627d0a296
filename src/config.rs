//! Startup configuration language.
//!
//! A deliberately tiny s-expression dialect, evaluated exactly once at
//! device-open time to produce a flat set of named bindings. The engine
//! reads the bindings and never re-parses configuration after the device is
//! open; nothing here touches the mixer.
//!
//! ```text
//! ; pick backends in preference order
//! (define devices '(cpal null))
//! (define sampling-rate 48000)
//! (define speaker-channels 2)
//! ```

use crate::error::{ResonaError, Result};
use std::collections::HashMap;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Sym(String),
    Bool(bool),
    Quote(Box<Expr>),
    List(Vec<Expr>),
}

/// An evaluated value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Str(String),
    Sym(String),
    Bool(bool),
    List(Vec<Value>),
}

/// The flat key/value binding set produced by evaluation.
#[derive(Debug, Default, Clone)]
pub struct Bindings {
    map: HashMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and evaluates `source`, collecting every `define`.
    pub fn eval_source(source: &str) -> Result<Self> {
        let exprs = parse(source)?;
        let mut bindings = Self::new();
        for expr in exprs {
            bindings.eval_toplevel(&expr)?;
        }
        Ok(bindings)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.map.get(key) {
            Some(Value::Num(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn boolean(&self, key: &str) -> Option<bool> {
        match self.map.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.map.insert(key.into(), value);
    }

    fn eval_toplevel(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::List(items) => match items.as_slice() {
                [Expr::Sym(head), Expr::Sym(name), value] if head == "define" => {
                    let value = self.eval(value)?;
                    log::debug!("config: {} = {:?}", name, value);
                    self.map.insert(name.clone(), value);
                    Ok(())
                }
                _ => Err(ResonaError::Configuration(format!(
                    "only (define name value) forms are allowed at top level, got {:?}",
                    expr
                ))),
            },
            _ => Err(ResonaError::Configuration(format!(
                "stray expression at top level: {:?}",
                expr
            ))),
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Sym(name) => self
                .map
                .get(name)
                .cloned()
                .ok_or_else(|| ResonaError::Configuration(format!("unbound symbol {:?}", name))),
            Expr::Quote(inner) => Ok(quote_value(inner)),
            Expr::List(_) => Err(ResonaError::Configuration(format!(
                "unquoted list is not a value: {:?}",
                expr
            ))),
        }
    }
}

/// A quoted expression evaluates to itself, with symbols left as symbols.
fn quote_value(expr: &Expr) -> Value {
    match expr {
        Expr::Num(n) => Value::Num(*n),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::Sym(s) => Value::Sym(s.clone()),
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Quote(inner) => quote_value(inner),
        Expr::List(items) => Value::List(items.iter().map(quote_value).collect()),
    }
}

/// Parses a whole source text into top-level expressions.
pub fn parse(source: &str) -> Result<Vec<Expr>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, index: 0 };
    let mut exprs = Vec::new();
    while !parser.at_end() {
        exprs.push(parser.expr()?);
    }
    Ok(exprs)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Quote,
    Str(String),
    Atom(String),
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ';' => {
                // Comment to end of line.
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '\'' => {
                chars.next();
                tokens.push(Token::Quote);
            }
            '"' => {
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    literal.push(c);
                }
                if !closed {
                    return Err(ResonaError::Configuration(
                        "unterminated string literal".into(),
                    ));
                }
                tokens.push(Token::Str(literal));
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == ';' || c == '\'' {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.index >= self.tokens.len()
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.index)
            .cloned()
            .ok_or_else(|| ResonaError::Configuration("unexpected end of input".into()))?;
        self.index += 1;
        Ok(token)
    }

    fn expr(&mut self) -> Result<Expr> {
        match self.next()? {
            Token::Open => {
                let mut items = Vec::new();
                loop {
                    match self.tokens.get(self.index) {
                        Some(Token::Close) => {
                            self.index += 1;
                            return Ok(Expr::List(items));
                        }
                        Some(_) => items.push(self.expr()?),
                        None => {
                            return Err(ResonaError::Configuration(
                                "unterminated list".into(),
                            ));
                        }
                    }
                }
            }
            Token::Close => Err(ResonaError::Configuration("unexpected )".into())),
            Token::Quote => Ok(Expr::Quote(Box::new(self.expr()?))),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Atom(atom) => Ok(atom_expr(&atom)),
        }
    }
}

fn atom_expr(atom: &str) -> Expr {
    match atom {
        "#t" => Expr::Bool(true),
        "#f" => Expr::Bool(false),
        _ => {
            if let Ok(n) = atom.parse::<f64>() {
                Expr::Num(n)
            } else {
                Expr::Sym(atom.to_string())
            }
        }
    }
}
