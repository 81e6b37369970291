//! A small expression tree for ffmpeg's expression language.
//!
//! Curves are built as [`Expr`] values and serialized once with `Display`.
//! Escaping for the filter-graph level is a separate step
//! ([`escape_filter_value`]) so the math and the wire format can be checked
//! independently.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal printed with a fixed number of decimals.
    Num { value: f64, decimals: usize },
    /// The frame/sample timestamp `t`, in seconds.
    Time,
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    /// `if(lt(lhs,rhs),then,otherwise)`
    IfLt {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    pub fn num(value: f64, decimals: usize) -> Self {
        Expr::Num { value, decimals }
    }

    pub fn int(value: i64) -> Self {
        Expr::Num {
            value: value as f64,
            decimals: 0,
        }
    }

    pub fn t() -> Self {
        Expr::Time
    }

    pub fn min(a: Expr, b: Expr) -> Self {
        Expr::Min(Box::new(a), Box::new(b))
    }

    pub fn max(a: Expr, b: Expr) -> Self {
        Expr::Max(Box::new(a), Box::new(b))
    }

    pub fn if_lt(lhs: Expr, rhs: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::IfLt {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    /// Evaluate at time `t` the way the serialized text would be evaluated,
    /// i.e. with every literal rounded to its printed precision.
    pub fn eval(&self, t: f64) -> f64 {
        match self {
            Expr::Num { value, decimals } => rounded(*value, *decimals),
            Expr::Time => t,
            Expr::Add(a, b) => a.eval(t) + b.eval(t),
            Expr::Sub(a, b) => a.eval(t) - b.eval(t),
            Expr::Mul(a, b) => a.eval(t) * b.eval(t),
            Expr::Div(a, b) => a.eval(t) / b.eval(t),
            Expr::Min(a, b) => a.eval(t).min(b.eval(t)),
            Expr::Max(a, b) => a.eval(t).max(b.eval(t)),
            Expr::IfLt {
                lhs,
                rhs,
                then,
                otherwise,
            } => {
                if lhs.eval(t) < rhs.eval(t) {
                    then.eval(t)
                } else {
                    otherwise.eval(t)
                }
            }
        }
    }

    /// Number of `if` nodes, used to keep an eye on expression size.
    pub fn branch_count(&self) -> usize {
        match self {
            Expr::Num { .. } | Expr::Time => 0,
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Min(a, b)
            | Expr::Max(a, b) => a.branch_count() + b.branch_count(),
            Expr::IfLt {
                lhs,
                rhs,
                then,
                otherwise,
            } => {
                1 + lhs.branch_count()
                    + rhs.branch_count()
                    + then.branch_count()
                    + otherwise.branch_count()
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Num { value, decimals } if rounded(*value, *decimals) < 0.0 => 0,
            Expr::Add(..) | Expr::Sub(..) => 1,
            Expr::Mul(..) | Expr::Div(..) => 2,
            _ => 3,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min_precedence: u8) -> fmt::Result {
        if self.precedence() < min_precedence {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }

    fn fmt_binary(
        f: &mut fmt::Formatter<'_>,
        a: &Expr,
        op: char,
        b: &Expr,
        precedence: u8,
        associative: bool,
    ) -> fmt::Result {
        a.fmt_operand(f, precedence)?;
        write!(f, "{op}")?;
        b.fmt_operand(f, if associative { precedence } else { precedence + 1 })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num { value, decimals } => f.write_str(&format_fixed(*value, *decimals)),
            Expr::Time => f.write_str("t"),
            Expr::Add(a, b) => Expr::fmt_binary(f, a, '+', b, 1, true),
            Expr::Sub(a, b) => Expr::fmt_binary(f, a, '-', b, 1, false),
            Expr::Mul(a, b) => Expr::fmt_binary(f, a, '*', b, 2, true),
            Expr::Div(a, b) => Expr::fmt_binary(f, a, '/', b, 2, false),
            Expr::Min(a, b) => write!(f, "min({a},{b})"),
            Expr::Max(a, b) => write!(f, "max({a},{b})"),
            Expr::IfLt {
                lhs,
                rhs,
                then,
                otherwise,
            } => write!(f, "if(lt({lhs},{rhs}),{then},{otherwise})"),
        }
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs))
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs))
    }
}

impl Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::Div(Box::new(self), Box::new(rhs))
    }
}

// ---------------------------------------------------------------------------
// Number formatting
// ---------------------------------------------------------------------------

/// Format with a fixed number of decimals, never printing `-0`.
pub fn format_fixed(value: f64, decimals: usize) -> String {
    let s = format!("{value:.decimals$}");
    if s.starts_with('-') && s[1..].chars().all(|c| c == '0' || c == '.') {
        s[1..].to_string()
    } else {
        s
    }
}

fn rounded(value: f64, decimals: usize) -> f64 {
    format_fixed(value, decimals).parse().unwrap_or(value)
}

// ---------------------------------------------------------------------------
// Piecewise-linear curves
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keyframe {
    pub time: f64,
    pub value: f64,
}

/// Printed decimals for each kind of literal in a piecewise curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    pub time: usize,
    pub value: usize,
    pub slope: usize,
}

impl Precision {
    /// Zoom, pixel coordinates and time boundaries at one decimal, slopes at two.
    pub const VIEWPORT: Precision = Precision {
        time: 1,
        value: 1,
        slope: 2,
    };

    /// Millisecond boundaries for gain envelopes.
    pub const GAIN: Precision = Precision {
        time: 3,
        value: 3,
        slope: 4,
    };
}

/// Linear segment `v0 + slope*(t - t0)` from `a` towards `b`.
fn segment(a: Keyframe, b: Keyframe, precision: Precision) -> Expr {
    let dt = b.time - a.time;
    let slope = if dt > 0.0 {
        (b.value - a.value) / dt
    } else {
        0.0
    };
    let start = Expr::num(a.value, precision.value);
    if rounded(slope, precision.slope) == 0.0 {
        return start;
    }

    let elapsed = if rounded(a.time, precision.time) == 0.0 {
        Expr::t()
    } else {
        Expr::t() - Expr::num(a.time, precision.time)
    };
    let ramp = Expr::num(slope.abs(), precision.slope) * elapsed;
    if slope < 0.0 {
        start - ramp
    } else {
        start + ramp
    }
}

/// Build `if(lt(t,t1),seg0,if(lt(t,t2),seg1,...,last))` over `keys`.
///
/// Built right to left so each `if` only references its own boundary; the
/// result grows linearly with the number of keyframes. An empty slice yields
/// `fallback`.
pub fn piecewise_linear(keys: &[Keyframe], precision: Precision, fallback: f64) -> Expr {
    let Some(last) = keys.last() else {
        return Expr::num(fallback, precision.value);
    };

    let mut acc = Expr::num(last.value, precision.value);
    for pair in keys.windows(2).rev() {
        let (a, b) = (pair[0], pair[1]);
        acc = Expr::if_lt(
            Expr::t(),
            Expr::num(b.time, precision.time),
            segment(a, b, precision),
            acc,
        );
    }
    acc
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

/// Escape a filter option value for embedding in a filter graph.
///
/// Commas would otherwise split the filter chain, so `if(lt(t,1),...)`
/// becomes `if(lt(t\,1)\,...)`.
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + value.len() / 4);
    for c in value.chars() {
        if matches!(c, '\\' | '\'' | ',' | ';' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
