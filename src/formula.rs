//! mgcv-style model formulas
//!
//! `response ~ term + term ...` where a term is a linear covariate (`rain`),
//! a smooth `s(var, k=10, bs="cc")`, or `1` for an explicit intercept. The
//! intercept is always part of the model.

use std::fmt;
use thiserror::Error;
use crate::data::canonical_name;

/// Basis dimension used when `k` is not given (mgcv's default for `cr`)
pub const DEFAULT_K: usize = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("formula '{0}' has no '~' separating response and terms")]
    MissingTilde(String),

    #[error("formula has no response variable")]
    MissingResponse,

    #[error("unbalanced parentheses in '{0}'")]
    UnbalancedParentheses(String),

    #[error("empty term in formula '{0}'")]
    EmptyTerm(String),

    #[error("invalid variable name '{0}'")]
    InvalidName(String),

    #[error("term for '{0}' appears more than once")]
    DuplicateTerm(String),

    #[error("unknown basis type '{0}' (expected \"cr\" or \"cc\")")]
    UnknownBasis(String),

    #[error("basis dimension k={k} is too small for bs=\"{bs}\" (minimum {min})")]
    BasisTooSmall { k: usize, bs: &'static str, min: usize },

    #[error("invalid smooth term '{term}': {message}")]
    InvalidSmooth { term: String, message: String },
}

/// Smooth basis types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasisType {
    /// Cubic regression spline, `bs="cr"`
    CubicRegression,
    /// Cyclic cubic regression spline, `bs="cc"`
    Cyclic,
}

impl BasisType {
    pub fn code(&self) -> &'static str {
        match self {
            BasisType::CubicRegression => "cr",
            BasisType::Cyclic => "cc",
        }
    }

    fn min_k(&self) -> usize {
        match self {
            BasisType::CubicRegression => 3,
            BasisType::Cyclic => 4,
        }
    }

    fn from_code(code: &str) -> Result<Self, FormulaError> {
        match code {
            "cr" => Ok(BasisType::CubicRegression),
            "cc" => Ok(BasisType::Cyclic),
            other => Err(FormulaError::UnknownBasis(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmoothSpec {
    pub var: String,
    pub k: usize,
    pub bs: BasisType,
}

impl SmoothSpec {
    /// Label used in summaries, e.g. `s(rain)`
    pub fn label(&self) -> String {
        format!("s({})", self.var)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Linear(String),
    Smooth(SmoothSpec),
}

impl Term {
    pub fn variable(&self) -> &str {
        match self {
            Term::Linear(name) => name,
            Term::Smooth(spec) => &spec.var,
        }
    }
}

/// A parsed model formula
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFormula {
    pub response: String,
    pub terms: Vec<Term>,
}

impl ModelFormula {
    pub fn parse(formula: &str) -> Result<Self, FormulaError> {
        check_parentheses(formula)?;

        let (lhs, rhs) = formula
            .split_once('~')
            .ok_or_else(|| FormulaError::MissingTilde(formula.to_string()))?;

        let response = lhs.trim();
        if response.is_empty() {
            return Err(FormulaError::MissingResponse);
        }
        if !is_identifier(response) {
            return Err(FormulaError::InvalidName(response.to_string()));
        }

        let mut terms: Vec<Term> = Vec::new();
        for raw in split_top_level(rhs, '+') {
            let term = raw.trim();
            if term.is_empty() {
                return Err(FormulaError::EmptyTerm(formula.to_string()));
            }
            if term == "1" {
                continue;
            }
            let parsed = if term.starts_with("s(") {
                Term::Smooth(parse_smooth(term)?)
            } else if is_identifier(term) {
                Term::Linear(term.to_string())
            } else {
                return Err(FormulaError::InvalidName(term.to_string()));
            };

            if terms
                .iter()
                .any(|t| canonical_name(t.variable()) == canonical_name(parsed.variable()))
            {
                return Err(FormulaError::DuplicateTerm(parsed.variable().to_string()));
            }
            terms.push(parsed);
        }

        Ok(Self {
            response: response.to_string(),
            terms,
        })
    }

    pub fn smooths(&self) -> impl Iterator<Item = &SmoothSpec> {
        self.terms.iter().filter_map(|t| match t {
            Term::Smooth(spec) => Some(spec),
            Term::Linear(_) => None,
        })
    }

    pub fn linear_terms(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().filter_map(|t| match t {
            Term::Linear(name) => Some(name.as_str()),
            Term::Smooth(_) => None,
        })
    }

    pub fn has_smooths(&self) -> bool {
        self.smooths().next().is_some()
    }
}

impl std::str::FromStr for ModelFormula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelFormula::parse(s)
    }
}

impl fmt::Display for SmoothSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bs {
            BasisType::CubicRegression => write!(f, "s({}, k={})", self.var, self.k),
            bs => write!(f, "s({}, bs=\"{}\", k={})", self.var, bs.code(), self.k),
        }
    }
}

impl fmt::Display for ModelFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ ", self.response)?;
        if self.terms.is_empty() {
            return write!(f, "1");
        }
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " + ")?;
            }
            match term {
                Term::Linear(name) => write!(f, "{}", name)?,
                Term::Smooth(spec) => write!(f, "{}", spec)?,
            }
        }
        Ok(())
    }
}

fn check_parentheses(s: &str) -> Result<(), FormulaError> {
    let mut depth: i32 = 0;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(FormulaError::UnbalancedParentheses(s.to_string()));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(FormulaError::UnbalancedParentheses(s.to_string()));
    }
    Ok(())
}

/// Split on `sep` outside parentheses and quotes
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' | '\'' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 && !in_quotes => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_smooth(term: &str) -> Result<SmoothSpec, FormulaError> {
    let invalid = |message: &str| FormulaError::InvalidSmooth {
        term: term.to_string(),
        message: message.to_string(),
    };

    if !term.ends_with(')') {
        return Err(invalid("expected s(var, ...)"));
    }
    let content = &term[2..term.len() - 1];
    let parts: Vec<&str> = split_top_level(content, ',').into_iter().map(str::trim).collect();

    let var = parts[0];
    if var.is_empty() {
        return Err(invalid("missing covariate"));
    }
    if !is_identifier(var) {
        return Err(FormulaError::InvalidName(var.to_string()));
    }

    let mut k: Option<usize> = None;
    let mut bs = BasisType::CubicRegression;
    for arg in &parts[1..] {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| invalid(&format!("expected key=value, got '{}'", arg)))?;
        let value = value.trim();
        match key.trim() {
            "k" => {
                let parsed = value
                    .parse::<usize>()
                    .map_err(|_| invalid(&format!("invalid k value '{}'", value)))?;
                k = Some(parsed);
            }
            "bs" => {
                let code = value.trim_matches(|c| c == '"' || c == '\'');
                bs = BasisType::from_code(code)?;
            }
            other => return Err(invalid(&format!("unknown argument '{}'", other))),
        }
    }

    let k = k.unwrap_or(DEFAULT_K);
    if k < bs.min_k() {
        return Err(FormulaError::BasisTooSmall {
            k,
            bs: bs.code(),
            min: bs.min_k(),
        });
    }

    Ok(SmoothSpec {
        var: var.to_string(),
        k,
        bs,
    })
}
