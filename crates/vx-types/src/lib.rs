#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resolved type of an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Number,
    Category,
    Color,
    Date,
}

impl ValueType {
    /// Types that order numerically and can be interpolated linearly.
    #[must_use]
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Number | Self::Date)
    }
}

/// Linear RGBA color with channels in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

impl Color {
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);

    #[must_use]
    pub const fn new(r: f64, g: f64, b: f64, a: f64) -> Self {
        Self { r, g, b, a }
    }

    /// Builds a color from 0-255 channels and a 0-1 alpha, the way `rgba()` is written in viz strings.
    #[must_use]
    pub fn from_rgba8(r: f64, g: f64, b: f64, a: f64) -> Self {
        Self::new(r / 255.0, g / 255.0, b / 255.0, a)
    }

    /// Parses `#rgb`, `#rrggbb` and `#rrggbbaa`.
    pub fn from_hex(input: &str) -> Result<Self, TypeError> {
        let invalid = || TypeError::InvalidColor {
            input: input.to_owned(),
        };
        let digits = input.strip_prefix('#').ok_or_else(invalid)?;
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let channel = |s: &str| u8::from_str_radix(s, 16).map(f64::from).map_err(|_| invalid());
        match digits.len() {
            3 => {
                let mut out = [0.0; 3];
                for (slot, c) in out.iter_mut().zip(digits.chars()) {
                    let v = channel(&c.to_string())?;
                    *slot = (v * 16.0 + v) / 255.0;
                }
                Ok(Self::new(out[0], out[1], out[2], 1.0))
            }
            6 | 8 => {
                let r = channel(&digits[0..2])?;
                let g = channel(&digits[2..4])?;
                let b = channel(&digits[4..6])?;
                let a = if digits.len() == 8 {
                    channel(&digits[6..8])? / 255.0
                } else {
                    1.0
                };
                Ok(Self::from_rgba8(r, g, b, a))
            }
            _ => Err(invalid()),
        }
    }

    /// Channel-wise linear interpolation.
    #[must_use]
    pub fn lerp(self, other: Self, t: f64) -> Self {
        Self::new(
            lerp(self.r, other.r, t),
            lerp(self.g, other.g, t),
            lerp(self.b, other.b, t),
            lerp(self.a, other.a, t),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Number(f64),
    Category(String),
    Color(Color),
    /// Milliseconds since the UNIX epoch.
    Date(f64),
}

impl Value {
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Number(_) => ValueType::Number,
            Self::Category(_) => ValueType::Category,
            Self::Color(_) => ValueType::Color,
            Self::Date(_) => ValueType::Date,
        }
    }

    #[must_use]
    pub fn bool(v: bool) -> Self {
        Self::Number(if v { 1.0 } else { 0.0 })
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Number(v) | Self::Date(v) => Ok(*v),
            other => Err(TypeError::NonNumericValue {
                found: other.value_type(),
            }),
        }
    }

    /// Filters are numbers in `[0, 1]`; anything above one half passes.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        matches!(self, Self::Number(v) if *v > 0.5)
    }

    /// Interpolates between two values of the same type.
    ///
    /// Numbers and dates interpolate linearly, colors channel-wise; categories step at `t >= 1`.
    pub fn interpolate(&self, to: &Self, t: f64) -> Result<Self, TypeError> {
        match (self, to) {
            (Self::Number(a), Self::Number(b)) => Ok(Self::Number(lerp(*a, *b, t))),
            (Self::Date(a), Self::Date(b)) => Ok(Self::Date(lerp(*a, *b, t))),
            (Self::Color(a), Self::Color(b)) => Ok(Self::Color(a.lerp(*b, t))),
            (Self::Category(_), Self::Category(_)) => Ok(step(self, to, t)),
            (a, b) => Err(TypeError::IncompatibleTypes {
                left: a.value_type(),
                right: b.value_type(),
            }),
        }
    }
}

/// Returns `to` once `t` reaches one, `from` before that.
#[must_use]
pub fn step(from: &Value, to: &Value, t: f64) -> Value {
    if t >= 1.0 { to.clone() } else { from.clone() }
}

#[must_use]
pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("types {left:?} and {right:?} have no compatible common type")]
    IncompatibleTypes { left: ValueType, right: ValueType },
    #[error("value of type {found:?} is not numeric")]
    NonNumericValue { found: ValueType },
    #[error("invalid color literal {input:?}")]
    InvalidColor { input: String },
}
