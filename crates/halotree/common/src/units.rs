// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Physical units
//!
//! A small unit model covering the mass, length and time units found in halo
//! catalogs. Expressions such as `Msun/h`, `km/s` or `(kpc/h)**3` are parsed
//! against a fixed symbol table into a scale factor (relative to cgs) and a
//! dimension vector. The dimensionless `h` symbol is bound to the hubble
//! constant of the owning [`UnitSystem`].

use std::fmt;

use thiserror::Error;

/// Solar mass in grams.
pub const MSUN_G: f64 = 1.988_415_86e33;
/// Parsec in centimeters.
pub const PC_CM: f64 = 3.085_677_581_491_367_3e18;
/// Astronomical unit in centimeters.
pub const AU_CM: f64 = 1.495_978_707e13;
/// Julian year in seconds.
pub const YR_S: f64 = 31_557_600.0;

const SCALE_TOLERANCE: f64 = 1e-12;

/// Errors produced while parsing or converting units
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UnitError {
    #[error("Unknown unit symbol: {0}")]
    UnknownSymbol(String),

    #[error("Invalid unit expression '{expr}': {message}")]
    Syntax { expr: String, message: String },

    #[error("Cannot convert from '{from}' to '{to}': dimensions differ")]
    DimensionMismatch { from: String, to: String },

    #[error("Power {power} of '{expr}' does not yield integral dimensions")]
    NonIntegralPower { expr: String, power: f64 },
}

pub type UnitResult<T> = Result<T, UnitError>;

/// Exponents of the base dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dimensions {
    pub mass: i32,
    pub length: i32,
    pub time: i32,
}

impl Dimensions {
    pub const NONE: Dimensions = Dimensions { mass: 0, length: 0, time: 0 };
    pub const MASS: Dimensions = Dimensions { mass: 1, length: 0, time: 0 };
    pub const LENGTH: Dimensions = Dimensions { mass: 0, length: 1, time: 0 };
    pub const TIME: Dimensions = Dimensions { mass: 0, length: 0, time: 1 };

    pub fn is_dimensionless(&self) -> bool {
        *self == Self::NONE
    }

    fn combine(self, other: Dimensions, sign: i32) -> Dimensions {
        Dimensions {
            mass: self.mass + sign * other.mass,
            length: self.length + sign * other.length,
            time: self.time + sign * other.time,
        }
    }

    fn scaled(self, power: f64) -> Option<Dimensions> {
        let scale = |exponent: i32| {
            let value = exponent as f64 * power;
            if (value - value.round()).abs() < 1e-9 { Some(value.round() as i32) } else { None }
        };
        Some(Dimensions {
            mass: scale(self.mass)?,
            length: scale(self.length)?,
            time: scale(self.time)?,
        })
    }
}

/// A parsed unit expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Units {
    expr: String,
    scale: f64,
    dims: Dimensions,
}

impl Units {
    /// Units of a pure number.
    pub fn dimensionless() -> Self {
        Self {
            expr: String::new(),
            scale: 1.0,
            dims: Dimensions::NONE,
        }
    }

    /// Parses an expression with `h = 1`.
    pub fn parse(expr: &str) -> UnitResult<Self> {
        UnitSystem::default().parse(expr)
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Size of one of these units in cgs.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dims
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dims.is_dimensionless()
    }

    /// Factor that converts a value in `self` into a value in `to`.
    pub fn conversion_factor(&self, to: &Units) -> UnitResult<f64> {
        if self.dims != to.dims {
            return Err(UnitError::DimensionMismatch {
                from: self.expr.clone(),
                to: to.expr.clone(),
            });
        }
        Ok(self.scale / to.scale)
    }

    /// Same dimensions and the same scale.
    pub fn is_equivalent(&self, other: &Units) -> bool {
        self.dims == other.dims && ((self.scale - other.scale).abs() <= SCALE_TOLERANCE * self.scale.abs().max(other.scale.abs()))
    }

    pub fn multiply(&self, other: &Units) -> Units {
        let expr = match (self.expr.is_empty(), other.expr.is_empty()) {
            (true, _) => other.expr.clone(),
            (_, true) => self.expr.clone(),
            _ => format!("{}*{}", self.expr, group(&other.expr)),
        };
        Units {
            expr,
            scale: self.scale * other.scale,
            dims: self.dims.combine(other.dims, 1),
        }
    }

    pub fn divide(&self, other: &Units) -> Units {
        let expr = match (self.expr.is_empty(), other.expr.is_empty()) {
            (_, true) => self.expr.clone(),
            (true, false) => format!("1/{}", group(&other.expr)),
            _ => format!("{}/{}", self.expr, group(&other.expr)),
        };
        Units {
            expr,
            scale: self.scale / other.scale,
            dims: self.dims.combine(other.dims, -1),
        }
    }

    pub fn powf(&self, power: f64) -> UnitResult<Units> {
        let dims = self.dims.scaled(power).ok_or_else(|| UnitError::NonIntegralPower {
            expr: self.expr.clone(),
            power,
        })?;
        let expr = if self.expr.is_empty() { String::new() } else { format!("({})**{}", self.expr, power) };
        Ok(Units {
            expr,
            scale: self.scale.powf(power),
            dims,
        })
    }

    pub fn powi(&self, power: i32) -> Units {
        let expr = if self.expr.is_empty() || power == 1 { self.expr.clone() } else { format!("({})**{}", self.expr, power) };
        Units {
            expr,
            scale: self.scale.powi(power),
            dims: self.dims.combine(self.dims, power - 1),
        }
    }

    pub fn sqrt(&self) -> UnitResult<Units> {
        self.powf(0.5)
    }
}

impl Default for Units {
    fn default() -> Self {
        Self::dimensionless()
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.expr.is_empty() { write!(f, "dimensionless") } else { write!(f, "{}", self.expr) }
    }
}

fn group(expr: &str) -> String {
    if expr.contains(['*', '/']) { format!("({expr})") } else { expr.to_string() }
}

/// Symbol table bound to one cosmology.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitSystem {
    hubble_constant: f64,
}

impl Default for UnitSystem {
    fn default() -> Self {
        Self { hubble_constant: 1.0 }
    }
}

impl UnitSystem {
    /// Creates a unit system; `h` evaluates to 1 when no hubble constant is known.
    pub fn new(hubble_constant: Option<f64>) -> Self {
        Self {
            hubble_constant: hubble_constant.unwrap_or(1.0),
        }
    }

    pub fn hubble_constant(&self) -> f64 {
        self.hubble_constant
    }

    /// Parses a unit expression. The empty string is dimensionless.
    pub fn parse(&self, expr: &str) -> UnitResult<Units> {
        let trimmed = expr.trim();
        if trimmed.is_empty() || trimmed == "dimensionless" || trimmed == "None" {
            return Ok(Units::dimensionless());
        }

        let tokens = tokenize(trimmed)?;
        let mut parser = Parser {
            system: self,
            expr: trimmed,
            tokens: &tokens,
            pos: 0,
        };
        let (scale, dims) = parser.expression()?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }

        Ok(Units {
            expr: trimmed.to_string(),
            scale,
            dims,
        })
    }

    fn symbol(&self, name: &str) -> Option<(f64, Dimensions)> {
        let entry = match name {
            "g" => (1.0, Dimensions::MASS),
            "kg" => (1e3, Dimensions::MASS),
            "Msun" | "msun" => (MSUN_G, Dimensions::MASS),
            // Comoving lengths share the scale of their proper counterparts.
            "cm" | "cmcm" => (1.0, Dimensions::LENGTH),
            "m" | "mcm" => (1e2, Dimensions::LENGTH),
            "km" | "kmcm" => (1e5, Dimensions::LENGTH),
            "AU" | "au" | "AUcm" => (AU_CM, Dimensions::LENGTH),
            "pc" | "pccm" => (PC_CM, Dimensions::LENGTH),
            "kpc" | "kpccm" => (1e3 * PC_CM, Dimensions::LENGTH),
            "Mpc" | "Mpccm" => (1e6 * PC_CM, Dimensions::LENGTH),
            "s" => (1.0, Dimensions::TIME),
            "yr" => (YR_S, Dimensions::TIME),
            "Myr" => (1e6 * YR_S, Dimensions::TIME),
            "Gyr" => (1e9 * YR_S, Dimensions::TIME),
            "h" => (self.hubble_constant, Dimensions::NONE),
            "dimensionless" => (1.0, Dimensions::NONE),
            _ => return None,
        };
        Some(entry)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Symbol(String),
    Number(f64),
    Mul,
    Div,
    Pow,
    Open,
    Close,
}

fn tokenize(expr: &str) -> UnitResult<Vec<Token>> {
    let syntax = |message: &str| UnitError::Syntax {
        expr: expr.to_string(),
        message: message.to_string(),
    };
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Mul);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Pow);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Div);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| syntax(&format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Symbol(chars[start..i].iter().collect()));
            }
            other => return Err(syntax(&format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    system: &'a UnitSystem,
    expr: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> UnitError {
        UnitError::Syntax {
            expr: self.expr.to_string(),
            message: message.to_string(),
        }
    }

    fn expression(&mut self) -> UnitResult<(f64, Dimensions)> {
        let (mut scale, mut dims) = self.term()?;
        while let Some(token) = self.tokens.get(self.pos) {
            let sign = match token {
                Token::Mul => 1,
                Token::Div => -1,
                _ => break,
            };
            self.pos += 1;
            let (rhs_scale, rhs_dims) = self.term()?;
            scale = if sign > 0 { scale * rhs_scale } else { scale / rhs_scale };
            dims = dims.combine(rhs_dims, sign);
        }
        Ok((scale, dims))
    }

    fn term(&mut self) -> UnitResult<(f64, Dimensions)> {
        let (scale, dims) = self.factor()?;
        if self.tokens.get(self.pos) != Some(&Token::Pow) {
            return Ok((scale, dims));
        }
        self.pos += 1;

        let power = match self.tokens.get(self.pos) {
            Some(Token::Number(value)) => *value,
            _ => return Err(self.error("expected a numeric exponent")),
        };
        self.pos += 1;

        let dims = dims.scaled(power).ok_or_else(|| UnitError::NonIntegralPower {
            expr: self.expr.to_string(),
            power,
        })?;
        Ok((scale.powf(power), dims))
    }

    fn factor(&mut self) -> UnitResult<(f64, Dimensions)> {
        let token = self.tokens.get(self.pos).cloned().ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Symbol(name) => self.system.symbol(&name).ok_or(UnitError::UnknownSymbol(name)),
            Token::Number(value) => Ok((value, Dimensions::NONE)),
            Token::Open => {
                let inner = self.expression()?;
                if self.tokens.get(self.pos) != Some(&Token::Close) {
                    return Err(self.error("missing closing parenthesis"));
                }
                self.pos += 1;
                Ok(inner)
            }
            _ => Err(self.error("expected a unit symbol")),
        }
    }
}
