//! Sandboxed formula language used by `expression` transforms.
//!
//! Formulas are parsed into a small AST and evaluated against the remote
//! record. Only literals, field references, the operators below and a fixed
//! set of pure functions are available, so evaluation has no side effects and
//! its cost is bounded by the size of the formula.
//!
//! ```text
//! ternary  := or ('?' ternary ':' ternary)?
//! or       := and ('||' and)*
//! and      := equality ('&&' equality)*
//! equality := compare (('==' | '!=') compare)*
//! compare  := additive (('<' | '<=' | '>' | '>=') additive)*
//! additive := term (('+' | '-') term)*
//! term     := unary (('*' | '/' | '%') unary)*
//! unary    := ('!' | '-') unary | primary
//! primary  := number | string | true | false | null | path | call | '(' ternary ')'
//! ```

use serde_json::{Number, Value};

use crate::errors::ExpressionError;

pub const MAX_DEPTH: usize = 64;

/// Allowed functions with their minimum and maximum argument counts.
const FUNCTIONS: &[(&str, usize, Option<usize>)] = &[
    ("upper", 1, Some(1)),
    ("lower", 1, Some(1)),
    ("trim", 1, Some(1)),
    ("concat", 0, None),
    ("len", 1, Some(1)),
    ("round", 1, Some(2)),
    ("floor", 1, Some(1)),
    ("ceil", 1, Some(1)),
    ("abs", 1, Some(1)),
    ("min", 1, None),
    ("max", 1, None),
    ("coalesce", 1, None),
    ("if", 3, Some(3)),
    ("number", 1, Some(1)),
    ("string", 1, Some(1)),
];

pub fn is_allowed_function(name: &str) -> bool {
    FUNCTIONS.iter().any(|(candidate, _, _)| *candidate == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted field path; `value` refers to the mapping's own source value
    Field(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Dot,
    Question,
    Colon,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let number = text.parse::<f64>().map_err(|_| ExpressionError::Syntax {
                position: pos,
                message: format!("invalid number '{}'", text),
            })?;
            tokens.push((pos, Token::Number(number)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            tokens.push((pos, Token::Ident(text)));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i].1;
                if ch == '\\' {
                    let escaped = chars.get(i + 1).map(|(_, c)| *c).ok_or_else(|| {
                        ExpressionError::Syntax {
                            position: chars[i].0,
                            message: "dangling escape".to_string(),
                        }
                    })?;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    i += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                text.push(ch);
                i += 1;
            }
            if !closed {
                return Err(ExpressionError::Syntax {
                    position: pos,
                    message: "unterminated string".to_string(),
                });
            }
            tokens.push((pos, Token::Str(text)));
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let two = match (c, next) {
            ('=', Some('=')) => Some("=="),
            ('!', Some('=')) => Some("!="),
            ('<', Some('=')) => Some("<="),
            ('>', Some('=')) => Some(">="),
            ('&', Some('&')) => Some("&&"),
            ('|', Some('|')) => Some("||"),
            _ => None,
        };
        if let Some(op) = two {
            tokens.push((pos, Token::Op(op)));
            i += 2;
            continue;
        }

        let token = match c {
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '%' => Token::Op("%"),
            '<' => Token::Op("<"),
            '>' => Token::Op(">"),
            '!' => Token::Op("!"),
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '.' => Token::Dot,
            '?' => Token::Question,
            ':' => Token::Colon,
            other => {
                return Err(ExpressionError::Syntax {
                    position: pos,
                    message: format!("unexpected character '{}'", other),
                })
            }
        };
        tokens.push((pos, token));
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(candidate)) if *candidate == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, label: &str) -> Result<(), ExpressionError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", label)))
        }
    }

    fn error(&self, message: String) -> ExpressionError {
        ExpressionError::Syntax {
            position: self.position(),
            message,
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let condition = self.binary_level(0)?;
        let expr = if self.peek() == Some(&Token::Question) {
            self.pos += 1;
            let then = self.ternary()?;
            self.expect(Token::Colon, "':' in conditional")?;
            let otherwise = self.ternary()?;
            Expr::Ternary(Box::new(condition), Box::new(then), Box::new(otherwise))
        } else {
            condition
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn binary_level(&mut self, level: usize) -> Result<Expr, ExpressionError> {
        const LEVELS: &[&[(&str, BinaryOp)]] = &[
            &[("||", BinaryOp::Or)],
            &[("&&", BinaryOp::And)],
            &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
        ];

        if level == LEVELS.len() {
            return self.unary();
        }

        let mut left = self.binary_level(level + 1)?;
        'outer: loop {
            for (symbol, op) in LEVELS[level] {
                if self.eat_op(symbol) {
                    let right = self.binary_level(level + 1)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_op("!") {
            self.enter()?;
            let operand = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        if self.eat_op("-") {
            self.enter()?;
            let operand = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => self.call(name),
                _ => self.path(name),
            },
            Some(other) => Err(ExpressionError::Syntax {
                position,
                message: format!("unexpected token {:?}", other),
            }),
            None => Err(ExpressionError::Syntax {
                position,
                message: "unexpected end of formula".to_string(),
            }),
        }
    }

    fn path(&mut self, first: String) -> Result<Expr, ExpressionError> {
        let mut path = first;
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            match self.advance() {
                Some(Token::Ident(segment)) => {
                    path.push('.');
                    path.push_str(&segment);
                }
                _ => return Err(self.error("expected field name after '.'".to_string())),
            }
        }
        Ok(Expr::Field(path))
    }

    fn call(&mut self, name: String) -> Result<Expr, ExpressionError> {
        let (_, min, max) = FUNCTIONS
            .iter()
            .find(|(candidate, _, _)| *candidate == name)
            .copied()
            .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;

        self.enter()?;
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.ternary()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    continue;
                }
                break;
            }
        }
        self.expect(Token::RParen, "')' after arguments")?;
        self.depth -= 1;

        let too_many = max.map(|max| args.len() > max).unwrap_or(false);
        if args.len() < min || too_many {
            let expected = match max {
                Some(max) if max == min => min.to_string(),
                Some(max) => format!("{}-{}", min, max),
                None => format!("at least {}", min),
            };
            return Err(ExpressionError::Arity {
                function: name,
                expected,
                found: args.len(),
            });
        }

        Ok(Expr::Call(name, args))
    }
}

/// A parsed, validated formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            end: source.len(),
        };
        let ast = parser.ternary()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input".to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Field paths referenced by the formula, excluding `value`.
    pub fn field_references(&self) -> Vec<String> {
        fn walk(expr: &Expr, out: &mut Vec<String>) {
            match expr {
                Expr::Field(path) if path != "value" => {
                    if !out.contains(path) {
                        out.push(path.clone());
                    }
                }
                Expr::Field(_) | Expr::Literal(_) => {}
                Expr::Unary(_, inner) => walk(inner, out),
                Expr::Binary(_, left, right) => {
                    walk(left, out);
                    walk(right, out);
                }
                Expr::Ternary(a, b, c) => {
                    walk(a, out);
                    walk(b, out);
                    walk(c, out);
                }
                Expr::Call(_, args) => args.iter().for_each(|arg| walk(arg, out)),
            }
        }
        let mut out = Vec::new();
        walk(&self.ast, &mut out);
        out
    }

    /// Evaluates against `record`; `value` resolves to `current`.
    pub fn evaluate(&self, record: &Value, current: &Value) -> Result<Value, ExpressionError> {
        eval(&self.ast, record, current)
    }
}

/// Resolves a dotted path inside a JSON document; missing segments yield `Null`.
pub fn lookup_path(record: &Value, path: &str) -> Value {
    let mut node = record;
    for segment in path.split('.') {
        match node.get(segment) {
            Some(next) => node = next,
            None => return Value::Null,
        }
    }
    node.clone()
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn to_number(value: &Value) -> Result<Option<f64>, ExpressionError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ExpressionError::Type(format!("'{}' is not a number", s))),
        other => Err(ExpressionError::Type(format!("{} is not a number", other))),
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let a = to_number(left)?;
            let b = to_number(right)?;
            match (a, b) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or_else(|| ExpressionError::Type("values are not comparable".to_string())),
                _ => Err(ExpressionError::Type("cannot compare null".to_string())),
            }
        }
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn eval(expr: &Expr, record: &Value, current: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(path) if path == "value" => Ok(current.clone()),
        Expr::Field(path) => Ok(lookup_path(record, path)),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&eval(inner, record, current)?))),
        Expr::Unary(UnaryOp::Neg, inner) => match to_number(&eval(inner, record, current)?)? {
            Some(n) => Ok(number_value(-n)),
            None => Ok(Value::Null),
        },
        Expr::Ternary(condition, then, otherwise) => {
            if truthy(&eval(condition, record, current)?) {
                eval(then, record, current)
            } else {
                eval(otherwise, record, current)
            }
        }
        Expr::Binary(BinaryOp::And, left, right) => {
            let l = eval(left, record, current)?;
            Ok(Value::Bool(truthy(&l) && truthy(&eval(right, record, current)?)))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            let l = eval(left, record, current)?;
            Ok(Value::Bool(truthy(&l) || truthy(&eval(right, record, current)?)))
        }
        Expr::Binary(op, left, right) => {
            let l = eval(left, record, current)?;
            let r = eval(right, record, current)?;
            binary(*op, &l, &r)
        }
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|arg| eval(arg, record, current))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, values)
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(loosely_equal(l, r))),
        BinaryOp::Ne => return Ok(Value::Bool(!loosely_equal(l, r))),
        BinaryOp::Lt => return Ok(Value::Bool(compare(l, r)?.is_lt())),
        BinaryOp::Le => return Ok(Value::Bool(compare(l, r)?.is_le())),
        BinaryOp::Gt => return Ok(Value::Bool(compare(l, r)?.is_gt())),
        BinaryOp::Ge => return Ok(Value::Bool(compare(l, r)?.is_ge())),
        _ => {}
    }

    if op == BinaryOp::Add && (l.is_string() || r.is_string()) {
        return Ok(Value::String(format!("{}{}", display(l), display(r))));
    }

    let (a, b) = match (to_number(l)?, to_number(r)?) {
        (Some(a), Some(b)) => (a, b),
        _ => return Ok(Value::Null),
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem if b == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Rem => a % b,
        other => {
            return Err(ExpressionError::Type(format!(
                "{:?} is not an arithmetic operator",
                other
            )))
        }
    };
    Ok(number_value(result))
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
    let first = args.first().cloned().unwrap_or(Value::Null);
    let value = match name {
        "upper" => match first {
            Value::Null => Value::Null,
            other => Value::String(display(&other).to_uppercase()),
        },
        "lower" => match first {
            Value::Null => Value::Null,
            other => Value::String(display(&other).to_lowercase()),
        },
        "trim" => match first {
            Value::Null => Value::Null,
            other => Value::String(display(&other).trim().to_string()),
        },
        "concat" => Value::String(args.iter().map(display).collect()),
        "len" => match &first {
            Value::Null => Value::Null,
            Value::Array(items) => Value::from(items.len()),
            other => Value::from(display(other).chars().count()),
        },
        "round" => {
            let digits = match args.get(1) {
                Some(d) => to_number(d)?.unwrap_or(0.0) as i32,
                None => 0,
            };
            match to_number(&first)? {
                Some(n) => {
                    let factor = 10f64.powi(digits);
                    number_value((n * factor).round() / factor)
                }
                None => Value::Null,
            }
        }
        "floor" => to_number(&first)?.map(|n| number_value(n.floor())).unwrap_or(Value::Null),
        "ceil" => to_number(&first)?.map(|n| number_value(n.ceil())).unwrap_or(Value::Null),
        "abs" => to_number(&first)?.map(|n| number_value(n.abs())).unwrap_or(Value::Null),
        "min" | "max" => {
            let mut best: Option<f64> = None;
            for arg in &args {
                if let Some(n) = to_number(arg)? {
                    best = Some(match best {
                        Some(current) if name == "min" => current.min(n),
                        Some(current) => current.max(n),
                        None => n,
                    });
                }
            }
            best.map(number_value).unwrap_or(Value::Null)
        }
        "coalesce" => args
            .into_iter()
            .find(|arg| !arg.is_null())
            .unwrap_or(Value::Null),
        "if" => {
            if truthy(&first) {
                args.get(1).cloned().unwrap_or(Value::Null)
            } else {
                args.get(2).cloned().unwrap_or(Value::Null)
            }
        }
        "number" => to_number(&first)?.map(number_value).unwrap_or(Value::Null),
        "string" => match first {
            Value::Null => Value::Null,
            other => Value::String(display(&other)),
        },
        other => return Err(ExpressionError::UnknownFunction(other.to_string())),
    };
    Ok(value)
}
