//! Recursive-descent parser for fit expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('+' | '-') unary | power
//! power   := primary (('^' | '**') unary)?
//! primary := number | name | name '(' expr ')' | '(' expr ')'
//! ```
//!
//! Power is right associative and binds tighter than unary minus, so
//! `-x^2` is `-(x^2)`.

use std::f64::consts;

use crate::error::ExpressionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
}

impl Function {
    /// Resolves a function name, including the spelled-out inverse trig
    /// names and the `sen` abbreviation for sine.
    fn lookup(name: &str) -> Option<Self> {
        let function = match name {
            "sin" | "sen" => Function::Sin,
            "cos" => Function::Cos,
            "tan" | "tg" => Function::Tan,
            "asin" | "arcsin" => Function::Asin,
            "acos" | "arccos" => Function::Acos,
            "atan" | "arctan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "log" | "ln" => Function::Ln,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            _ => return None,
        };
        Some(function)
    }

    fn apply(self, value: f64) -> f64 {
        match self {
            Function::Sin => value.sin(),
            Function::Cos => value.cos(),
            Function::Tan => value.tan(),
            Function::Asin => value.asin(),
            Function::Acos => value.acos(),
            Function::Atan => value.atan(),
            Function::Sinh => value.sinh(),
            Function::Cosh => value.cosh(),
            Function::Tanh => value.tanh(),
            Function::Exp => value.exp(),
            Function::Ln => value.ln(),
            Function::Log10 => value.log10(),
            Function::Sqrt => value.sqrt(),
            Function::Abs => value.abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Compiled expression tree. Names are already resolved to the independent
/// variable or to a parameter slot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Number(f64),
    Variable,
    Parameter(usize),
    Neg(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Function, Box<Node>),
}

impl Node {
    pub(crate) fn eval(&self, x: f64, params: &[f64]) -> f64 {
        match self {
            Node::Number(value) => *value,
            Node::Variable => x,
            Node::Parameter(idx) => params.get(*idx).copied().unwrap_or(f64::NAN),
            Node::Neg(inner) => -inner.eval(x, params),
            Node::Binary(op, lhs, rhs) => {
                let a = lhs.eval(x, params);
                let b = rhs.eval(x, params);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                }
            }
            Node::Call(function, arg) => function.apply(arg.eval(x, params)),
        }
    }

    pub(crate) fn uses_variable(&self) -> bool {
        match self {
            Node::Variable => true,
            Node::Number(_) | Node::Parameter(_) => false,
            Node::Neg(inner) | Node::Call(_, inner) => inner.uses_variable(),
            Node::Binary(_, lhs, rhs) => lhs.uses_variable() || rhs.uses_variable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(value) => format!("number {}", value),
            Token::Name(name) => format!("name '{}'", name),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::Caret => "power operator".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                pos += 1;
            }
            if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
                let mut look = pos + 1;
                if look < chars.len() && (chars[look] == '+' || chars[look] == '-') {
                    look += 1;
                }
                if look < chars.len() && chars[look].is_ascii_digit() {
                    pos = look;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
            }
            let text: String = chars[start..pos].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ExpressionError::syntax(start, format!("invalid number '{}'", text)))?;
            tokens.push((start, Token::Number(value)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            tokens.push((start, Token::Name(chars[start..pos].iter().collect())));
            continue;
        }

        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '*' if chars.get(pos + 1) == Some(&'*') => {
                pos += 1;
                Token::Caret
            }
            '*' => Token::Star,
            other => {
                return Err(ExpressionError::syntax(
                    start,
                    format!("unexpected character '{}'", other),
                ))
            }
        };
        pos += 1;
        tokens.push((start, token));
    }

    Ok(tokens)
}

pub(crate) struct Parsed {
    pub(crate) root: Node,
    pub(crate) parameters: Vec<String>,
}

pub(crate) struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    end: usize,
    variable: &'a str,
    parameters: Vec<String>,
}

impl<'a> Parser<'a> {
    pub(crate) fn parse(input: &str, variable: &'a str) -> Result<Parsed, ExpressionError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ExpressionError::syntax(0, "empty expression"));
        }

        let mut parser = Parser {
            tokens,
            cursor: 0,
            end: input.chars().count(),
            variable,
            parameters: Vec::new(),
        };

        let root = parser.expr()?;
        if let Some((position, token)) = parser.tokens.get(parser.cursor) {
            return Err(ExpressionError::syntax(
                *position,
                format!("unexpected {}", token.describe()),
            ));
        }

        Ok(Parsed {
            root,
            parameters: parser.parameters,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, token)| token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|(position, _)| *position)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|(_, token)| token.clone());
        self.cursor += 1;
        token
    }

    fn expr(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(node),
            };
            self.advance();
            let rhs = self.term()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(node),
            };
            self.advance();
            let rhs = self.unary()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Node, ExpressionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Node, ExpressionError> {
        let base = self.primary()?;
        if self.peek() == Some(&Token::Caret) {
            self.advance();
            let exponent = self.unary()?;
            return Ok(Node::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Node, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(value)) => Ok(Node::Number(value)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect_close()?;
                Ok(inner)
            }
            Some(Token::Name(name)) => self.name(name, position),
            Some(other) => Err(ExpressionError::syntax(
                position,
                format!("expected a number, name or '(' but found {}", other.describe()),
            )),
            None => Err(ExpressionError::syntax(
                position,
                "unexpected end of expression",
            )),
        }
    }

    fn name(&mut self, name: String, position: usize) -> Result<Node, ExpressionError> {
        if self.peek() == Some(&Token::LParen) {
            let function =
                Function::lookup(&name).ok_or(ExpressionError::UnknownFunction { name })?;
            self.advance();
            let arg = self.expr()?;
            self.expect_close()?;
            return Ok(Node::Call(function, Box::new(arg)));
        }

        if name == self.variable {
            return Ok(Node::Variable);
        }
        if Function::lookup(&name).is_some() {
            return Err(ExpressionError::syntax(
                position,
                format!("function '{}' needs an argument in parentheses", name),
            ));
        }

        match name.as_str() {
            "pi" => Ok(Node::Number(consts::PI)),
            "e" => Ok(Node::Number(consts::E)),
            _ => {
                let idx = match self.parameters.iter().position(|p| *p == name) {
                    Some(idx) => idx,
                    None => {
                        self.parameters.push(name);
                        self.parameters.len() - 1
                    }
                };
                Ok(Node::Parameter(idx))
            }
        }
    }

    fn expect_close(&mut self) -> Result<(), ExpressionError> {
        let position = self.position();
        match self.advance() {
            Some(Token::RParen) => Ok(()),
            Some(other) => Err(ExpressionError::syntax(
                position,
                format!("expected ')' but found {}", other.describe()),
            )),
            None => Err(ExpressionError::syntax(position, "missing ')'")),
        }
    }
}
