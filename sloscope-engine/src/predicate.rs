//! Conditional-task predicates.
//!
//! A task's `if` clause is a boolean expression evaluated against the
//! experiment before the task runs. The language supports boolean
//! connectives, comparisons, number/string/boolean literals, zero-argument
//! method calls on the experiment (`SLOs()`, `Completed()`, `NoFailure()`),
//! and dotted field paths using the artifact's serialized names, e.g.
//! `result.numLoops < 3 && SLOs()`.
//!
//! Compilation and evaluation failures are fatal for the experiment.

use std::fmt;

use crate::error::EngineError;
use crate::experiment::{Experiment, ExperimentResult};

/// A value produced while evaluating a predicate.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    And,
    Or,
    Not,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    LParen,
    RParen,
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

/// One segment of a dotted reference; `call` marks a `()` invocation.
#[derive(Debug, Clone, PartialEq)]
struct PathSegment {
    name: String,
    call: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Reference(Vec<PathSegment>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// A compiled `if` clause.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    /// Compile a predicate source string.
    pub fn compile(source: &str) -> Result<Predicate, EngineError> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EngineError::Predicate(format!(
                "unexpected trailing input in predicate {source:?}"
            )));
        }
        Ok(Predicate {
            source: source.to_string(),
            expr,
        })
    }

    /// Evaluate the predicate against an experiment. The result must be
    /// boolean; anything else is an evaluation failure.
    pub fn eval(&self, experiment: &Experiment) -> Result<bool, EngineError> {
        match eval_expr(&self.expr, experiment)? {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::Predicate(format!(
                "predicate {:?} evaluated to a {} instead of a bool",
                self.source,
                other.type_name()
            ))),
        }
    }

    /// The source string this predicate was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

fn lex(source: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_none() {
                    return Err(EngineError::Predicate(format!(
                        "single '&' in predicate {source:?}"
                    )));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_none() {
                    return Err(EngineError::Predicate(format!(
                        "single '|' in predicate {source:?}"
                    )));
                }
                tokens.push(Token::Or);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(EngineError::Predicate(format!(
                        "single '=' in predicate {source:?}; use '==' for comparison"
                    )));
                }
                tokens.push(Token::Eq);
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => literal.push(ch),
                        None => {
                            return Err(EngineError::Predicate(format!(
                                "unterminated string literal in predicate {source:?}"
                            )))
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() => {
                let mut number = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f64 = number.parse().map_err(|_| {
                    EngineError::Predicate(format!("invalid number {number:?} in predicate"))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(EngineError::Predicate(format!(
                    "unexpected character {other:?} in predicate {source:?}"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), EngineError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(EngineError::Predicate(format!(
                "expected {token:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EngineError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EngineError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Ge) => CompareOp::Ge,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Gt) => CompareOp::Gt,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, EngineError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Ident(name)) if name == "true" => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::Ident(name)) if name == "false" => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Ident(name)) => self.parse_reference(name),
            other => Err(EngineError::Predicate(format!(
                "unexpected token {other:?} in predicate"
            ))),
        }
    }

    fn parse_reference(&mut self, first: String) -> Result<Expr, EngineError> {
        let mut path = vec![self.parse_segment(first)?];
        while self.peek() == Some(&Token::Dot) {
            self.next();
            match self.next() {
                Some(Token::Ident(name)) => path.push(self.parse_segment(name)?),
                other => {
                    return Err(EngineError::Predicate(format!(
                        "expected identifier after '.', found {other:?}"
                    )))
                }
            }
        }
        Ok(Expr::Reference(path))
    }

    fn parse_segment(&mut self, name: String) -> Result<PathSegment, EngineError> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            self.expect(Token::RParen)
                .map_err(|_| EngineError::Predicate(format!("{name}() takes no arguments")))?;
            return Ok(PathSegment { name, call: true });
        }
        Ok(PathSegment { name, call: false })
    }
}

fn eval_expr(expr: &Expr, experiment: &Experiment) -> Result<Value, EngineError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Reference(path) => resolve(experiment, path),
        Expr::Not(inner) => match eval_expr(inner, experiment)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(EngineError::Predicate(format!(
                "'!' applied to a {}",
                other.type_name()
            ))),
        },
        Expr::And(left, right) => {
            let l = eval_bool(left, experiment)?;
            if !l {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool(right, experiment)?))
        }
        Expr::Or(left, right) => {
            let l = eval_bool(left, experiment)?;
            if l {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool(right, experiment)?))
        }
        Expr::Compare(op, left, right) => {
            let l = eval_expr(left, experiment)?;
            let r = eval_expr(right, experiment)?;
            compare(*op, &l, &r)
        }
    }
}

fn eval_bool(expr: &Expr, experiment: &Experiment) -> Result<bool, EngineError> {
    match eval_expr(expr, experiment)? {
        Value::Bool(b) => Ok(b),
        other => Err(EngineError::Predicate(format!(
            "boolean operator applied to a {}",
            other.type_name()
        ))),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<Value, EngineError> {
    let result = match (left, right) {
        (Value::Number(l), Value::Number(r)) => match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            CompareOp::Lt => l < r,
            CompareOp::Le => l <= r,
            CompareOp::Gt => l > r,
            CompareOp::Ge => l >= r,
        },
        (Value::Str(l), Value::Str(r)) => match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            _ => {
                return Err(EngineError::Predicate(format!(
                    "operator {op} is not defined for strings"
                )))
            }
        },
        (Value::Bool(l), Value::Bool(r)) => match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            _ => {
                return Err(EngineError::Predicate(format!(
                    "operator {op} is not defined for bools"
                )))
            }
        },
        (l, r) => {
            return Err(EngineError::Predicate(format!(
                "cannot compare {} with {}",
                l.type_name(),
                r.type_name()
            )))
        }
    };
    Ok(Value::Bool(result))
}

fn render_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(|s| {
            if s.call {
                format!("{}()", s.name)
            } else {
                s.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn resolve(experiment: &Experiment, path: &[PathSegment]) -> Result<Value, EngineError> {
    let first = &path[0];
    match (first.name.as_str(), first.call) {
        ("SLOs", true) => {
            ensure_terminal(path, 1)?;
            Ok(Value::Bool(experiment.slos()))
        }
        ("Completed", true) => {
            ensure_terminal(path, 1)?;
            Ok(Value::Bool(experiment.completed()))
        }
        ("NoFailure", true) => {
            ensure_terminal(path, 1)?;
            Ok(Value::Bool(experiment.no_failure()))
        }
        ("result", false) => resolve_result(experiment.result.as_ref(), &path[1..], path),
        _ => Err(EngineError::Predicate(format!(
            "unknown reference {} in predicate",
            render_path(path)
        ))),
    }
}

fn resolve_result(
    result: Option<&ExperimentResult>,
    rest: &[PathSegment],
    full: &[PathSegment],
) -> Result<Value, EngineError> {
    let result = result.ok_or_else(|| {
        EngineError::Predicate("predicate references result, but the experiment has none".to_string())
    })?;
    let segment = rest.first().ok_or_else(|| {
        EngineError::Predicate("predicate reference 'result' is not a value".to_string())
    })?;
    if segment.call {
        return Err(EngineError::Predicate(format!(
            "{} is a field, not a method",
            render_path(full)
        )));
    }
    match segment.name.as_str() {
        "numLoops" => {
            ensure_terminal(full, 2)?;
            Ok(Value::Number(result.num_loops as f64))
        }
        "numCompletedTasks" => {
            ensure_terminal(full, 2)?;
            Ok(Value::Number(result.num_completed_tasks as f64))
        }
        "failure" => {
            ensure_terminal(full, 2)?;
            Ok(Value::Bool(result.failure))
        }
        "insights" => {
            let insights = result.insights.as_ref().ok_or_else(|| {
                EngineError::Predicate(
                    "predicate references insights, but the experiment has none".to_string(),
                )
            })?;
            let next = rest.get(1).ok_or_else(|| {
                EngineError::Predicate(
                    "predicate reference 'result.insights' is not a value".to_string(),
                )
            })?;
            match next.name.as_str() {
                "numVersions" if !next.call => {
                    ensure_terminal(full, 3)?;
                    Ok(Value::Number(insights.num_versions as f64))
                }
                _ => Err(EngineError::Predicate(format!(
                    "unknown reference {} in predicate",
                    render_path(full)
                ))),
            }
        }
        _ => Err(EngineError::Predicate(format!(
            "unknown reference {} in predicate",
            render_path(full)
        ))),
    }
}

fn ensure_terminal(path: &[PathSegment], len: usize) -> Result<(), EngineError> {
    if path.len() != len {
        return Err(EngineError::Predicate(format!(
            "reference {} has trailing segments",
            render_path(path)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Experiment;

    fn experiment_with_result() -> Experiment {
        let mut exp = Experiment::default();
        exp.init_results(1);
        exp
    }

    #[test]
    fn test_slos_reference() {
        let exp = experiment_with_result();
        let predicate = Predicate::compile("SLOs()").unwrap();
        // no insights yet, so SLOs() is false
        assert!(!predicate.eval(&exp).unwrap());
    }

    #[test]
    fn test_field_access_and_comparison() {
        let mut exp = experiment_with_result();
        exp.result.as_mut().unwrap().num_loops = 2;
        let predicate = Predicate::compile("result.numLoops < 3").unwrap();
        assert!(predicate.eval(&exp).unwrap());
        let predicate = Predicate::compile("result.numLoops >= 3").unwrap();
        assert!(!predicate.eval(&exp).unwrap());
    }

    #[test]
    fn test_connectives_and_negation() {
        let exp = experiment_with_result();
        let predicate = Predicate::compile("!result.failure && NoFailure()").unwrap();
        assert!(predicate.eval(&exp).unwrap());
        let predicate = Predicate::compile("result.failure || Completed()").unwrap();
        assert!(predicate.eval(&exp).unwrap()); // empty spec counts as completed
    }

    #[test]
    fn test_string_literals() {
        let exp = experiment_with_result();
        let predicate = Predicate::compile("'ok' == \"ok\"").unwrap();
        assert!(predicate.eval(&exp).unwrap());
        let predicate = Predicate::compile("'ok' != 'down'").unwrap();
        assert!(predicate.eval(&exp).unwrap());
    }

    #[test]
    fn test_compile_errors() {
        assert!(Predicate::compile("SLOs(").is_err());
        assert!(Predicate::compile("result.numLoops <").is_err());
        assert!(Predicate::compile("a = b").is_err());
        assert!(Predicate::compile("SLOs() extra").is_err());
    }

    #[test]
    fn test_eval_errors() {
        let exp = experiment_with_result();
        // unknown reference
        let predicate = Predicate::compile("Frobnicate()").unwrap();
        assert!(predicate.eval(&exp).is_err());
        // non-boolean result
        let predicate = Predicate::compile("result.numLoops").unwrap();
        assert!(predicate.eval(&exp).is_err());
        // type mismatch in comparison
        let predicate = Predicate::compile("result.failure == 3").unwrap();
        assert!(predicate.eval(&exp).is_err());
    }

    #[test]
    fn test_missing_result_is_an_eval_error() {
        let exp = Experiment::default();
        let predicate = Predicate::compile("result.numLoops == 0").unwrap();
        assert!(predicate.eval(&exp).is_err());
    }
}
