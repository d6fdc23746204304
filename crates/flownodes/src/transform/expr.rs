//! A small expression language for transform nodes.
//!
//! Expressions see only the names bound by the caller (`item`, plus `acc`
//! inside `reduce`) and the builtin functions below. There is no access to
//! the host: no I/O, no environment, no loops.
//!
//! ```text
//! item.price * item.qty > 100 && contains(lower(item.tags), "sale")
//! len(item.name) > 3 ? upper(item.name) : "short"
//! ```

use flowcore::value::{as_number, compare_values, is_truthy, loose_eq, number_value, to_text, type_name};
use flowcore::Value;
use regex::Regex;
use serde_json::Map;
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown name '{0}'")]
    UnknownName(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), got {actual}")]
    Arity {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

pub const BUILTINS: &[&str] = &[
    "len", "lower", "upper", "trim", "str", "num", "int", "bool", "abs", "round", "floor", "ceil",
    "min", "max", "sum", "contains", "starts_with", "ends_with", "keys", "values", "split", "join",
    "concat", "default", "is_null", "type_of", "matches",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Question,
}

const OPERATORS: &[&str] = &["==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!"];

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || (chars[i] == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)))
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let number = text.parse::<f64>().map_err(|_| ExpressionError::Syntax {
                position: start,
                message: format!("bad number '{}'", text),
            })?;
            tokens.push((start, Token::Number(number)));
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => {
                        return Err(ExpressionError::Syntax {
                            position: start,
                            message: "unterminated string".into(),
                        })
                    }
                    Some('\\') => {
                        let escaped = chars.get(i + 1).copied().unwrap_or('\\');
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    }
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push((start, Token::Str(text)));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let token = match word.as_str() {
                "and" => Token::Op("&&"),
                "or" => Token::Op("||"),
                "not" => Token::Op("!"),
                _ => Token::Ident(word),
            };
            tokens.push((start, token));
            continue;
        }
        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            ':' => Some(Token::Colon),
            '?' => Some(Token::Question),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push((start, token));
            i += 1;
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            return Err(ExpressionError::Syntax {
                position: start,
                message: format!("unexpected character '{}'", c),
            });
        };
        tokens.push((start, Token::Op(*op)));
        i += op.len();
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Name(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// Combined limit on bracket nesting, unary operators and chained binary
/// operators, so evaluation recursion stays bounded.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, ExpressionError> {
        Err(ExpressionError::Syntax {
            position: self.position(),
            message: message.into(),
        })
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            self.error(format!("expected {:?}", expected))
        }
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        if let Some(Token::Op(op)) = self.peek() {
            if let Some(found) = ops.iter().find(|o| *o == op) {
                self.pos += 1;
                return Some(*found);
            }
        }
        None
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return self.error("expression nested too deeply");
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let expr = self.conditional();
        self.depth -= 1;
        expr
    }

    fn conditional(&mut self) -> Result<Expr, ExpressionError> {
        let condition = self.binary(0)?;
        if self.peek() == Some(&Token::Question) {
            self.pos += 1;
            let then = self.expression()?;
            self.expect(Token::Colon)?;
            let otherwise = self.expression()?;
            return Ok(Expr::Conditional(Box::new(condition), Box::new(then), Box::new(otherwise)));
        }
        Ok(condition)
    }

    /// Precedence climbing over the binary operator levels.
    fn binary(&mut self, level: usize) -> Result<Expr, ExpressionError> {
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["==", "!="],
            &["<", "<=", ">", ">="],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut left = self.binary(level + 1)?;
        let mut chained = 0;
        while let Some(op) = self.eat_op(LEVELS[level]) {
            self.enter()?;
            chained += 1;
            let right = self.binary(level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth -= chained;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let expr = match self.eat_op(&["!", "-"]) {
            Some(op) => self.unary().map(|operand| Expr::Unary(op, Box::new(operand))),
            None => self.postfix(),
        };
        self.depth -= 1;
        expr
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        let mut chained = 0;
        loop {
            if matches!(self.peek(), Some(Token::Dot) | Some(Token::LBracket)) {
                self.enter()?;
                chained += 1;
            }
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                        Some(Token::Number(n)) if n.fract() == 0.0 => {
                            expr = Expr::Index(Box::new(expr), Box::new(Expr::Literal(number_value(n))))
                        }
                        _ => return self.error("expected a field name after '.'"),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => {
                    self.depth -= chained;
                    return Ok(expr);
                }
            }
        }
    }

    fn list(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(token) if token == close => return Ok(items),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return self.error(format!("expected ',' or {:?}", close));
                }
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let args = self.list(Token::RParen)?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Name(name)),
            },
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => Ok(Expr::Array(self.list(Token::RBracket)?)),
            Some(Token::LBrace) => {
                let mut fields = Vec::new();
                if self.peek() == Some(&Token::RBrace) {
                    self.pos += 1;
                    return Ok(Expr::Object(fields));
                }
                loop {
                    let key = match self.next() {
                        Some(Token::Ident(key)) | Some(Token::Str(key)) => key,
                        _ => {
                            self.pos = self.pos.saturating_sub(1);
                            return self.error("expected an object key");
                        }
                    };
                    self.expect(Token::Colon)?;
                    fields.push((key, self.expression()?));
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBrace) => return Ok(Expr::Object(fields)),
                        _ => {
                            self.pos = self.pos.saturating_sub(1);
                            return self.error("expected ',' or '}'");
                        }
                    }
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                self.error("expected a value")
            }
        }
    }
}

/// A parsed expression, checked against the names it may use.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parse `source`, rejecting names outside `bindings` and unknown functions.
    pub fn compile(source: &str, bindings: &[&str]) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            end: source.len(),
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expression()?;
        if parser.pos < parser.tokens.len() {
            return parser.error("unexpected trailing input");
        }
        check_names(&root, bindings)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, scope: &HashMap<&str, Value>) -> Result<Value, ExpressionError> {
        eval(&self.root, scope)
    }
}

fn check_names(expr: &Expr, bindings: &[&str]) -> Result<(), ExpressionError> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::Name(name) if bindings.contains(&name.as_str()) => Ok(()),
        Expr::Name(name) => Err(ExpressionError::UnknownName(name.clone())),
        Expr::Array(items) => items.iter().try_for_each(|e| check_names(e, bindings)),
        Expr::Object(fields) => fields.iter().try_for_each(|(_, e)| check_names(e, bindings)),
        Expr::Member(target, _) | Expr::Unary(_, target) => check_names(target, bindings),
        Expr::Index(a, b) | Expr::Binary(_, a, b) => {
            check_names(a, bindings)?;
            check_names(b, bindings)
        }
        Expr::Call(name, args) => {
            if !BUILTINS.contains(&name.as_str()) {
                return Err(ExpressionError::UnknownFunction(name.clone()));
            }
            args.iter().try_for_each(|e| check_names(e, bindings))
        }
        Expr::Conditional(a, b, c) => {
            check_names(a, bindings)?;
            check_names(b, bindings)?;
            check_names(c, bindings)
        }
    }
}

fn eval(expr: &Expr, scope: &HashMap<&str, Value>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => scope
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownName(name.clone())),
        Expr::Array(items) => Ok(Value::Array(
            items.iter().map(|e| eval(e, scope)).collect::<Result<_, _>>()?,
        )),
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (key, e) in fields {
                map.insert(key.clone(), eval(e, scope)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Member(target, field) => Ok(eval(target, scope)?.get(field).cloned().unwrap_or(Value::Null)),
        Expr::Index(target, index) => {
            let target = eval(target, scope)?;
            let index = eval(index, scope)?;
            Ok(index_value(&target, &index))
        }
        Expr::Call(name, args) => {
            let args = args.iter().map(|e| eval(e, scope)).collect::<Result<Vec<_>, _>>()?;
            call(name, args)
        }
        Expr::Unary(op, operand) => {
            let value = eval(operand, scope)?;
            match *op {
                "!" => Ok(Value::Bool(!is_truthy(&value))),
                _ => {
                    let n = as_number(&value).ok_or_else(|| {
                        ExpressionError::Type(format!("cannot negate {}", type_name(&value)))
                    })?;
                    Ok(number_value(-n))
                }
            }
        }
        Expr::Binary("&&", left, right) => {
            let left = eval(left, scope)?;
            if !is_truthy(&left) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(right, scope)?)))
        }
        Expr::Binary("||", left, right) => {
            let left = eval(left, scope)?;
            if is_truthy(&left) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(right, scope)?)))
        }
        Expr::Binary(op, left, right) => binary(op, eval(left, scope)?, eval(right, scope)?),
        Expr::Conditional(condition, then, otherwise) => {
            if is_truthy(&eval(condition, scope)?) {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            let Some(i) = n.as_i64() else {
                return Value::Null;
            };
            let i = if i < 0 { items.len() as i64 + i } else { i };
            usize::try_from(i)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null)
        }
        (Value::Object(map), key) => map.get(&to_text(key)).cloned().unwrap_or(Value::Null),
        (Value::String(s), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn numbers(op: &str, left: &Value, right: &Value) -> Result<(f64, f64), ExpressionError> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ExpressionError::Type(format!(
            "'{}' needs numbers, got {} and {}",
            op,
            type_name(left),
            type_name(right)
        ))),
    }
}

fn binary(op: &str, left: Value, right: Value) -> Result<Value, ExpressionError> {
    match op {
        "==" => Ok(Value::Bool(loose_eq(&left, &right))),
        "!=" => Ok(Value::Bool(!loose_eq(&left, &right))),
        "<" | "<=" | ">" | ">=" => {
            let ordering = compare_values(&left, &right);
            Ok(Value::Bool(match (op, ordering) {
                (_, None) => false,
                ("<", Some(o)) => o == Ordering::Less,
                ("<=", Some(o)) => o != Ordering::Greater,
                (">", Some(o)) => o == Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            }))
        }
        "+" => match (&left, &right) {
            (Value::Number(_), Value::Number(_)) => {
                let (a, b) = numbers(op, &left, &right)?;
                Ok(number_value(a + b))
            }
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", to_text(&left), to_text(&right))))
            }
            _ => {
                let (a, b) = numbers(op, &left, &right)?;
                Ok(number_value(a + b))
            }
        },
        _ => {
            let (a, b) = numbers(op, &left, &right)?;
            match op {
                "-" => Ok(number_value(a - b)),
                "*" => Ok(number_value(a * b)),
                "/" if b == 0.0 => Err(ExpressionError::DivisionByZero),
                "/" => Ok(number_value(a / b)),
                "%" if b == 0.0 => Err(ExpressionError::DivisionByZero),
                _ => Ok(number_value(a % b)),
            }
        }
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExpressionError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}-{}", min, max)
        };
        return Err(ExpressionError::Arity {
            function: name.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn number_arg(name: &str, value: &Value) -> Result<f64, ExpressionError> {
    as_number(value)
        .ok_or_else(|| ExpressionError::Type(format!("{}() needs a number, got {}", name, type_name(value))))
}

/// Numbers from either a single list argument or the argument list itself.
fn numeric_args(args: &[Value]) -> Vec<f64> {
    let values: Vec<&Value> = match args {
        [Value::Array(items)] => items.iter().collect(),
        _ => args.iter().collect(),
    };
    values.into_iter().filter_map(as_number).collect()
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
    let text = |i: usize| args.get(i).map(to_text).unwrap_or_default();
    match name {
        "len" => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => to_text(other).chars().count(),
            };
            Ok(Value::from(len))
        }
        "lower" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(text(0).to_lowercase()))
        }
        "upper" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(text(0).to_uppercase()))
        }
        "trim" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(text(0).trim().to_string()))
        }
        "str" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(text(0)))
        }
        "num" => {
            arity(name, &args, 1, 1)?;
            Ok(as_number(&args[0]).map(number_value).unwrap_or(Value::Null))
        }
        "int" => {
            arity(name, &args, 1, 1)?;
            Ok(as_number(&args[0])
                .map(|n| Value::from(n.trunc() as i64))
                .unwrap_or(Value::Null))
        }
        "bool" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(is_truthy(&args[0])))
        }
        "abs" | "floor" | "ceil" => {
            arity(name, &args, 1, 1)?;
            let n = number_arg(name, &args[0])?;
            Ok(number_value(match name {
                "abs" => n.abs(),
                "floor" => n.floor(),
                _ => n.ceil(),
            }))
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let n = number_arg(name, &args[0])?;
            let digits = match args.get(1) {
                Some(d) => number_arg(name, d)?.clamp(0.0, 12.0) as i32,
                None => 0,
            };
            let factor = 10f64.powi(digits);
            Ok(number_value((n * factor).round() / factor))
        }
        "min" | "max" => {
            let values = numeric_args(&args);
            let folded = values.into_iter().reduce(|a, b| if name == "min" { a.min(b) } else { a.max(b) });
            Ok(folded.map(number_value).unwrap_or(Value::Null))
        }
        "sum" => Ok(number_value(numeric_args(&args).into_iter().sum())),
        "contains" => {
            arity(name, &args, 2, 2)?;
            Ok(Value::Bool(match &args[0] {
                Value::Array(items) => items.iter().any(|v| loose_eq(v, &args[1])),
                Value::Object(map) => map.contains_key(&text(1)),
                other => to_text(other).contains(&text(1)),
            }))
        }
        "starts_with" => {
            arity(name, &args, 2, 2)?;
            Ok(Value::Bool(text(0).starts_with(&text(1))))
        }
        "ends_with" => {
            arity(name, &args, 2, 2)?;
            Ok(Value::Bool(text(0).ends_with(&text(1))))
        }
        "keys" => {
            arity(name, &args, 1, 1)?;
            Ok(match &args[0] {
                Value::Object(map) => Value::Array(map.keys().cloned().map(Value::String).collect()),
                _ => Value::Array(Vec::new()),
            })
        }
        "values" => {
            arity(name, &args, 1, 1)?;
            Ok(match &args[0] {
                Value::Object(map) => Value::Array(map.values().cloned().collect()),
                _ => Value::Array(Vec::new()),
            })
        }
        "split" => {
            arity(name, &args, 2, 2)?;
            let separator = text(1);
            let source = text(0);
            let parts: Vec<Value> = if separator.is_empty() {
                source.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                source.split(separator.as_str()).map(|p| Value::String(p.to_string())).collect()
            };
            Ok(Value::Array(parts))
        }
        "join" => {
            arity(name, &args, 1, 2)?;
            let separator = if args.len() > 1 { text(1) } else { String::new() };
            let Value::Array(items) = &args[0] else {
                return Ok(Value::String(text(0)));
            };
            Ok(Value::String(items.iter().map(to_text).collect::<Vec<_>>().join(&separator)))
        }
        "concat" => {
            if args.iter().all(Value::is_array) {
                Ok(Value::Array(args.into_iter().flat_map(flowcore::value::into_list).collect()))
            } else {
                Ok(Value::String(args.iter().map(to_text).collect()))
            }
        }
        "default" => {
            arity(name, &args, 2, 2)?;
            Ok(if args[0].is_null() { args[1].clone() } else { args[0].clone() })
        }
        "is_null" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(args[0].is_null()))
        }
        "type_of" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(type_name(&args[0]).to_string()))
        }
        "matches" => {
            arity(name, &args, 2, 2)?;
            let pattern = Regex::new(&text(1))
                .map_err(|e| ExpressionError::Type(format!("invalid pattern: {}", e)))?;
            Ok(Value::Bool(pattern.is_match(&text(0))))
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(source: &str, item: Value) -> Result<Value, ExpressionError> {
        let expr = Expression::compile(source, &["item"])?;
        let scope = HashMap::from([("item", item)]);
        expr.evaluate(&scope)
    }

    #[test]
    fn arithmetic_follows_precedence() {
        assert_eq!(run("1 + 2 * 3", Value::Null).unwrap(), json!(7));
        assert_eq!(run("(1 + 2) * 3", Value::Null).unwrap(), json!(9));
        assert_eq!(run("-item.n + 10", json!({"n": 4})).unwrap(), json!(6));
        assert_eq!(run("7 / 2", Value::Null).unwrap(), json!(3.5));
    }

    #[test]
    fn member_index_and_conditional() {
        let item = json!({"tags": ["a", "b"], "price": 12, "name": "widget"});
        assert_eq!(run("item.tags[1]", item.clone()).unwrap(), json!("b"));
        assert_eq!(run("item.tags[-1]", item.clone()).unwrap(), json!("b"));
        assert_eq!(run("item['name']", item.clone()).unwrap(), json!("widget"));
        assert_eq!(
            run("item.price > 10 ? upper(item.name) : 'cheap'", item.clone()).unwrap(),
            json!("WIDGET")
        );
        assert_eq!(run("item.missing.deeper", item).unwrap(), Value::Null);
    }

    #[test]
    fn logic_short_circuits() {
        assert_eq!(run("false && (1 / 0)", Value::Null).unwrap(), json!(false));
        assert_eq!(run("true or (1 / 0)", Value::Null).unwrap(), json!(true));
        assert_eq!(run("not item", json!(0)).unwrap(), json!(true));
    }

    #[test]
    fn builtins() {
        assert_eq!(run("len(item)", json!([1, 2, 3])).unwrap(), json!(3));
        assert_eq!(run("sum(item)", json!([1, 2, "x", 3.5])).unwrap(), json!(6.5));
        assert_eq!(run("max(3, 9, 4)", Value::Null).unwrap(), json!(9));
        assert_eq!(run("join(split('a-b-c', '-'), '+')", Value::Null).unwrap(), json!("a+b+c"));
        assert_eq!(run("default(item.x, 5)", json!({})).unwrap(), json!(5));
        assert_eq!(run("matches(item, '^[a-z]+$')", json!("abc")).unwrap(), json!(true));
        assert_eq!(run("round(3.14159, 2)", Value::Null).unwrap(), json!(3.14));
        assert_eq!(run("{total: item.a + item.b}", json!({"a": 1, "b": 2})).unwrap(), json!({"total": 3}));
    }

    #[test]
    fn host_names_are_rejected_at_compile_time() {
        assert_eq!(
            Expression::compile("env.HOME", &["item"]).unwrap_err(),
            ExpressionError::UnknownName("env".into())
        );
        assert_eq!(
            Expression::compile("exec('ls')", &["item"]).unwrap_err(),
            ExpressionError::UnknownFunction("exec".into())
        );
        assert!(Expression::compile("acc + item", &["item", "acc"]).is_ok());
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(
            Expression::compile("item +", &["item"]),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(matches!(
            Expression::compile("item.a item.b", &["item"]),
            Err(ExpressionError::Syntax { .. })
        ));
        assert_eq!(run("1 / 0", Value::Null).unwrap_err(), ExpressionError::DivisionByZero);
    }

    #[test]
    fn deep_nesting_is_rejected() {
        // Small stack, as on a runtime worker thread.
        let handle = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let parens = format!("{}1{}", "(".repeat(3000), ")".repeat(3000));
                let negations = format!("{}true", "!".repeat(20_000));
                let sums = format!("1{}", " + 1".repeat(20_000));
                let members = format!("item{}", ".a".repeat(20_000));
                [parens, negations, sums, members]
                    .iter()
                    .map(|source| Expression::compile(source, &["item"]))
                    .collect::<Vec<_>>()
            })
            .unwrap();
        for result in handle.join().unwrap() {
            match result {
                Err(ExpressionError::Syntax { message, .. }) => {
                    assert_eq!(message, "expression nested too deeply")
                }
                other => panic!("expected a nesting error, got {:?}", other),
            }
        }

        let nested = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(run(&nested, Value::Null).unwrap(), json!(1));
    }
}
