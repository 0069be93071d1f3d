// src/gcode/expr.rs - Bracketed expressions and numeric variables
//
// Pratt parser with binding powers. Grouping uses square brackets because
// parentheses are comments in program text.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' in expression")]
    UnexpectedChar(char),
    #[error("unexpected token '{0}' in expression")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unclosed '[' in expression")]
    Unclosed,
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("malformed number '{0}'")]
    MalformedNumber(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("variable #{0} is undefined")]
    UndefinedVariable(u32),
    #[error("division by zero")]
    DivisionByZero,
    #[error("{0} argument out of domain")]
    Domain(&'static str),
    #[error("result is not a finite number")]
    NotFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn binding_power(&self) -> (u8, u8) {
        match self {
            BinaryOp::Or => (1, 2),
            BinaryOp::And => (3, 4),
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => (5, 6),
            BinaryOp::Add | BinaryOp::Sub => (7, 8),
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => (9, 10),
            // right associative
            BinaryOp::Pow => (12, 11),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Atan,
    Sqrt,
    Abs,
    Round,
    Fix,
    Fup,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "SIN" => Func::Sin,
            "COS" => Func::Cos,
            "TAN" => Func::Tan,
            "ATAN" => Func::Atan,
            "SQRT" => Func::Sqrt,
            "ABS" => Func::Abs,
            "ROUND" => Func::Round,
            "FIX" => Func::Fix,
            "FUP" => Func::Fup,
            _ => return None,
        })
    }

    fn apply(&self, v: f64) -> Result<f64, EvalError> {
        Ok(match self {
            Func::Sin => v.to_radians().sin(),
            Func::Cos => v.to_radians().cos(),
            Func::Tan => v.to_radians().tan(),
            Func::Atan => v.atan().to_degrees(),
            Func::Sqrt if v < 0.0 => return Err(EvalError::Domain("SQRT")),
            Func::Sqrt => v.sqrt(),
            Func::Abs => v.abs(),
            Func::Round => v.round(),
            Func::Fix => v.floor(),
            Func::Fup => v.ceil(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Var(u32),
    Neg(Box<Expr>),
    Binary { lhs: Box<Expr>, op: BinaryOp, rhs: Box<Expr> },
    Call { func: Func, arg: Box<Expr> },
}

/// Read access to numeric variables during evaluation.
pub trait VariableSource {
    fn get(&self, number: u32) -> Option<f64>;
}

impl Expr {
    /// The value of a plain literal, if this is one.
    pub fn as_literal(&self) -> Option<f64> {
        match self {
            Expr::Number(n) => Some(*n),
            Expr::Neg(inner) => inner.as_literal().map(|v| -v),
            _ => None,
        }
    }

    /// Evaluates the expression. Every intermediate result must be finite.
    pub fn eval(&self, vars: &dyn VariableSource) -> Result<f64, EvalError> {
        let value = self.eval_node(vars)?;
        if value.is_finite() { Ok(value) } else { Err(EvalError::NotFinite) }
    }

    fn eval_node(&self, vars: &dyn VariableSource) -> Result<f64, EvalError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Var(n) => vars.get(*n).ok_or(EvalError::UndefinedVariable(*n)),
            Expr::Neg(rhs) => Ok(-rhs.eval(vars)?),
            Expr::Call { func, arg } => func.apply(arg.eval(vars)?),
            Expr::Binary { lhs, op, rhs } => {
                let l = lhs.eval(vars)?;
                let r = rhs.eval(vars)?;
                let truth = |b: bool| if b { 1.0 } else { 0.0 };
                Ok(match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div if r == 0.0 => return Err(EvalError::DivisionByZero),
                    BinaryOp::Div => l / r,
                    BinaryOp::Mod if r == 0.0 => return Err(EvalError::DivisionByZero),
                    BinaryOp::Mod => l % r,
                    BinaryOp::Pow => l.powf(r),
                    BinaryOp::Eq => truth(l == r),
                    BinaryOp::Ne => truth(l != r),
                    BinaryOp::Lt => truth(l < r),
                    BinaryOp::Le => truth(l <= r),
                    BinaryOp::Gt => truth(l > r),
                    BinaryOp::Ge => truth(l >= r),
                    BinaryOp::And => truth(l != 0.0 && r != 0.0),
                    BinaryOp::Or => truth(l != 0.0 || r != 0.0),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Var(u32),
    Ident(String),
    Op(char),
    Open,
    Close,
}

/// Parse an expression from upper-cased text (without the outer brackets).
pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize_expr(input)?;
    let (expr, rest) = parse_expr_bp(&tokens, 0)?;
    if let Some(tok) = rest.first() {
        return Err(ExprError::UnexpectedToken(describe(tok)));
    }
    Ok(expr)
}

fn describe(tok: &Token) -> String {
    match tok {
        Token::Number(n) => n.to_string(),
        Token::Var(n) => format!("#{n}"),
        Token::Ident(s) => s.clone(),
        Token::Op(c) => c.to_string(),
        Token::Open => "[".into(),
        Token::Close => "]".into(),
    }
}

fn tokenize_expr(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ExprError::MalformedNumber(num.clone()))?;
            tokens.push(Token::Number(value));
        } else if c == '#' {
            chars.next();
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let n = digits.parse().map_err(|_| ExprError::MalformedNumber(format!("#{digits}")))?;
            tokens.push(Token::Var(n));
        } else if c.is_ascii_alphabetic() {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_alphabetic() {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(ident));
        } else if "+-*/^".contains(c) {
            tokens.push(Token::Op(c));
            chars.next();
        } else if c == '[' {
            tokens.push(Token::Open);
            chars.next();
        } else if c == ']' {
            tokens.push(Token::Close);
            chars.next();
        } else {
            return Err(ExprError::UnexpectedChar(c));
        }
    }
    Ok(tokens)
}

fn infix_op(tok: &Token) -> Option<BinaryOp> {
    match tok {
        Token::Op('+') => Some(BinaryOp::Add),
        Token::Op('-') => Some(BinaryOp::Sub),
        Token::Op('*') => Some(BinaryOp::Mul),
        Token::Op('/') => Some(BinaryOp::Div),
        Token::Op('^') => Some(BinaryOp::Pow),
        Token::Ident(name) => match name.as_str() {
            "MOD" => Some(BinaryOp::Mod),
            "EQ" => Some(BinaryOp::Eq),
            "NE" => Some(BinaryOp::Ne),
            "LT" => Some(BinaryOp::Lt),
            "LE" => Some(BinaryOp::Le),
            "GT" => Some(BinaryOp::Gt),
            "GE" => Some(BinaryOp::Ge),
            "AND" => Some(BinaryOp::And),
            "OR" => Some(BinaryOp::Or),
            _ => None,
        },
        _ => None,
    }
}

fn expect_close(rest: &[Token]) -> Result<&[Token], ExprError> {
    match rest.split_first() {
        Some((Token::Close, rest)) => Ok(rest),
        Some((tok, _)) => Err(ExprError::UnexpectedToken(describe(tok))),
        None => Err(ExprError::Unclosed),
    }
}

// Pratt parser with binding power
fn parse_expr_bp(tokens: &[Token], min_bp: u8) -> Result<(Expr, &[Token]), ExprError> {
    let (mut lhs, mut rest) = match tokens.split_first() {
        Some((Token::Number(n), rest)) => (Expr::Number(*n), rest),
        Some((Token::Var(n), rest)) => (Expr::Var(*n), rest),
        Some((Token::Op('-'), rest)) => {
            let (rhs, rest) = parse_expr_bp(rest, 100)?;
            (Expr::Neg(Box::new(rhs)), rest)
        }
        Some((Token::Op('+'), rest)) => parse_expr_bp(rest, 100)?,
        Some((Token::Open, rest)) => {
            let (expr, rest) = parse_expr_bp(rest, 0)?;
            (expr, expect_close(rest)?)
        }
        Some((Token::Ident(name), rest)) => {
            let func =
                Func::from_name(name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
            let rest = match rest.split_first() {
                Some((Token::Open, rest)) => rest,
                Some((tok, _)) => return Err(ExprError::UnexpectedToken(describe(tok))),
                None => return Err(ExprError::UnexpectedEnd),
            };
            let (arg, rest) = parse_expr_bp(rest, 0)?;
            (Expr::Call { func, arg: Box::new(arg) }, expect_close(rest)?)
        }
        Some((tok, _)) => return Err(ExprError::UnexpectedToken(describe(tok))),
        None => return Err(ExprError::UnexpectedEnd),
    };
    loop {
        let op = match rest.first().and_then(infix_op) {
            Some(op) => op,
            None => break,
        };
        let (l_bp, r_bp) = op.binding_power();
        if l_bp < min_bp {
            break;
        }
        let (rhs, new_rest) = parse_expr_bp(&rest[1..], r_bp)?;
        lhs = Expr::Binary { lhs: Box::new(lhs), op, rhs: Box::new(rhs) };
        rest = new_rest;
    }
    Ok((lhs, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Vars(HashMap<u32, f64>);

    impl VariableSource for Vars {
        fn get(&self, number: u32) -> Option<f64> {
            self.0.get(&number).copied()
        }
    }

    fn eval(src: &str) -> Result<f64, EvalError> {
        let vars = Vars(HashMap::from([(1, 4.0), (100, 2.5)]));
        parse_expr(src).unwrap().eval(&vars)
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), 7.0);
        assert_eq!(eval("[1 + 2] * 3").unwrap(), 9.0);
        assert_eq!(eval("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(eval("-#1 + 10").unwrap(), 6.0);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("#1 GT 3").unwrap(), 1.0);
        assert_eq!(eval("#1 LT 3 OR #100 EQ 2.5").unwrap(), 1.0);
        assert_eq!(eval("#1 GE 4 AND #100 NE 2.5").unwrap(), 0.0);
        assert_eq!(eval("1 + 1 EQ 2").unwrap(), 1.0);
    }

    #[test]
    fn test_functions() {
        assert!((eval("SIN[30]").unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(eval("SQRT[#1 * 4]").unwrap(), 4.0);
        assert_eq!(eval("FIX[2.7] + FUP[2.1]").unwrap(), 5.0);
        assert_eq!(eval("7 MOD 4").unwrap(), 3.0);
    }

    #[test]
    fn test_eval_errors() {
        assert_eq!(eval("#7 + 1"), Err(EvalError::UndefinedVariable(7)));
        assert_eq!(eval("1 / [#1 - 4]"), Err(EvalError::DivisionByZero));
        assert_eq!(eval("SQRT[-1]"), Err(EvalError::Domain("SQRT")));
    }

    #[test]
    fn test_non_finite_results_are_errors() {
        assert_eq!(eval("[0 - 8] ^ 0.5"), Err(EvalError::NotFinite));
        assert_eq!(eval("10 ^ 400"), Err(EvalError::NotFinite));
        // an overflowing intermediate is caught even when the outer result would be finite
        assert_eq!(eval("[10 ^ 400] GT 1"), Err(EvalError::NotFinite));
        let digits = "9".repeat(400);
        assert!(matches!(parse_expr(&digits), Err(ExprError::MalformedNumber(_))));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_expr("1 +"), Err(ExprError::UnexpectedEnd));
        assert_eq!(parse_expr("[1 + 2"), Err(ExprError::Unclosed));
        assert_eq!(parse_expr("FOO[1]"), Err(ExprError::UnknownFunction("FOO".into())));
        assert_eq!(parse_expr("1 $ 2"), Err(ExprError::UnexpectedChar('$')));
        assert!(matches!(parse_expr("1 2"), Err(ExprError::UnexpectedToken(_))));
    }
}
