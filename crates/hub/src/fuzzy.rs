//! Fuzzy model of drying conditions: linguistic variables, membership
//! functions and the rule table.
//!
//! The model is data: rules are `(antecedent, consequent)` pairs evaluated
//! generically by [`crate::decision`]. [`FuzzyModel::drying_rack`] builds the
//! production model once at startup; it is immutable afterwards and shared
//! by reference.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Membership functions
// ---------------------------------------------------------------------------

/// Piecewise-linear membership shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MembershipFn {
    /// Feet at `a`/`c`, peak at `b`. `a == b` or `b == c` gives a shoulder.
    Triangle { a: f64, b: f64, c: f64 },
    /// Feet at `a`/`d`, plateau over `b..=c`.
    Trapezoid { a: f64, b: f64, c: f64, d: f64 },
}

impl MembershipFn {
    pub const fn tri(a: f64, b: f64, c: f64) -> Self {
        Self::Triangle { a, b, c }
    }

    pub const fn trap(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self::Trapezoid { a, b, c, d }
    }

    /// Degree of membership of `x`, in `0.0..=1.0`.
    pub fn degree(&self, x: f64) -> f64 {
        match *self {
            Self::Triangle { a, b, c } => trapezoid(x, a, b, b, c),
            Self::Trapezoid { a, b, c, d } => trapezoid(x, a, b, c, d),
        }
    }

    fn corners(&self) -> [f64; 4] {
        match *self {
            Self::Triangle { a, b, c } => [a, b, b, c],
            Self::Trapezoid { a, b, c, d } => [a, b, c, d],
        }
    }
}

fn trapezoid(x: f64, a: f64, b: f64, c: f64, d: f64) -> f64 {
    if x < a || x > d {
        0.0
    } else if (b..=c).contains(&x) {
        1.0
    } else if x < b {
        (x - a) / (b - a)
    } else {
        (d - x) / (d - c)
    }
}

// ---------------------------------------------------------------------------
// Linguistic variables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FuzzySet {
    pub name: &'static str,
    pub shape: MembershipFn,
}

#[derive(Debug, Clone)]
pub struct LinguisticVariable {
    pub name: &'static str,
    /// Closed universe of discourse.
    pub range: (f64, f64),
    pub sets: Vec<FuzzySet>,
}

impl LinguisticVariable {
    pub fn new(name: &'static str, range: (f64, f64), sets: &[(&'static str, MembershipFn)]) -> Self {
        Self {
            name,
            range,
            sets: sets
                .iter()
                .map(|&(name, shape)| FuzzySet { name, shape })
                .collect(),
        }
    }

    pub fn set_index(&self, name: &str) -> Option<usize> {
        self.sets.iter().position(|s| s.name == name)
    }

    /// Membership of `x` in every set, in declaration order.
    pub fn fuzzify(&self, x: f64) -> Vec<f64> {
        self.sets.iter().map(|s| s.shape.degree(x)).collect()
    }
}

/// The five crisp inputs, in the order [`FuzzyModel::inputs`] stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    Temperature,
    Humidity,
    Light,
    Rain,
    TimeOfDay,
}

impl Input {
    pub const ALL: [Input; 5] = [
        Input::Temperature,
        Input::Humidity,
        Input::Light,
        Input::Rain,
        Input::TimeOfDay,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Antecedent expression over input fuzzy sets.
#[derive(Debug, Clone)]
pub enum Antecedent {
    Is(Input, &'static str),
    /// Fuzzy AND (minimum).
    All(Vec<Antecedent>),
    /// Fuzzy OR (maximum).
    Any(Vec<Antecedent>),
}

impl Antecedent {
    fn terms(&self, out: &mut Vec<(Input, &'static str)>) {
        match self {
            Self::Is(input, set) => out.push((*input, *set)),
            Self::All(parts) | Self::Any(parts) => parts.iter().for_each(|p| p.terms(out)),
        }
    }
}

pub fn is(input: Input, set: &'static str) -> Antecedent {
    Antecedent::Is(input, set)
}

pub fn all(parts: impl Into<Vec<Antecedent>>) -> Antecedent {
    Antecedent::All(parts.into())
}

pub fn any(parts: impl Into<Vec<Antecedent>>) -> Antecedent {
    Antecedent::Any(parts.into())
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: &'static str,
    pub antecedent: Antecedent,
    /// Name of an output set.
    pub consequent: &'static str,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FuzzyModel {
    /// Indexed by [`Input::index`].
    pub inputs: Vec<LinguisticVariable>,
    pub output: LinguisticVariable,
    pub rules: Vec<Rule>,
    /// Sampling step over the output universe used by defuzzification.
    pub resolution: f64,
}

impl FuzzyModel {
    /// Build a model, rejecting dangling set references up front so that
    /// evaluation never meets an unknown name.
    pub fn new(
        inputs: Vec<LinguisticVariable>,
        output: LinguisticVariable,
        rules: Vec<Rule>,
        resolution: f64,
    ) -> Result<Self> {
        let model = Self {
            inputs,
            output,
            rules,
            resolution,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.inputs.len() != Input::ALL.len() {
            errors.push(format!(
                "expected {} input variables, got {}",
                Input::ALL.len(),
                self.inputs.len()
            ));
        }
        if self.resolution.is_nan() || self.resolution <= 0.0 {
            errors.push(format!("resolution must be positive, got {}", self.resolution));
        }
        let (lo, hi) = self.output.range;
        if lo.is_nan() || hi.is_nan() || lo >= hi {
            errors.push(format!("output range ({lo}, {hi}) is empty"));
        }

        for var in self.inputs.iter().chain(std::iter::once(&self.output)) {
            for set in &var.sets {
                let [a, b, c, d] = set.shape.corners();
                if !(a <= b && b <= c && c <= d) {
                    errors.push(format!(
                        "{}.{}: corners must be non-decreasing",
                        var.name, set.name
                    ));
                }
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id) {
                errors.push(format!("duplicate rule id {}", rule.id));
            }
            if self.output.set_index(rule.consequent).is_none() {
                errors.push(format!(
                    "{}: unknown output set '{}'",
                    rule.id, rule.consequent
                ));
            }
            let mut terms = Vec::new();
            rule.antecedent.terms(&mut terms);
            for (input, set) in terms {
                let known = self
                    .inputs
                    .get(input.index())
                    .is_some_and(|v| v.set_index(set).is_some());
                if !known {
                    errors.push(format!("{}: unknown set '{set}' for {input:?}", rule.id));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("invalid fuzzy model:\n  - {}", errors.join("\n  - "));
        }
    }

    pub fn input(&self, input: Input) -> &LinguisticVariable {
        &self.inputs[input.index()]
    }

    /// The drying-rack model: five inputs, a 0-100 score and seven rules.
    pub fn drying_rack() -> Result<Self> {
        use Input::*;
        use MembershipFn as Mf;

        let inputs = vec![
            LinguisticVariable::new(
                "temperature",
                (0.0, 50.0),
                &[
                    ("cold", Mf::trap(0.0, 0.0, 15.0, 22.0)),
                    ("normal", Mf::tri(20.0, 25.0, 30.0)),
                    ("hot", Mf::trap(28.0, 32.0, 50.0, 50.0)),
                ],
            ),
            LinguisticVariable::new(
                "humidity",
                (0.0, 100.0),
                &[
                    ("dry", Mf::trap(0.0, 0.0, 30.0, 50.0)),
                    ("normal", Mf::tri(40.0, 60.0, 80.0)),
                    ("humid", Mf::trap(70.0, 80.0, 100.0, 100.0)),
                ],
            ),
            // The node's LDR reads high in the dark.
            LinguisticVariable::new(
                "light",
                (0.0, 4096.0),
                &[
                    ("dark", Mf::trap(2500.0, 3000.0, 4096.0, 4096.0)),
                    ("medium", Mf::tri(1000.0, 2000.0, 3000.0)),
                    ("bright", Mf::trap(0.0, 0.0, 1500.0, 2000.0)),
                ],
            ),
            LinguisticVariable::new(
                "rain",
                (0.0, 1.0),
                &[
                    ("no_rain", Mf::tri(0.0, 0.0, 0.5)),
                    ("rain", Mf::tri(0.5, 1.0, 1.0)),
                ],
            ),
            LinguisticVariable::new(
                "time",
                (0.0, 24.0),
                &[
                    ("morning", Mf::trap(5.0, 7.0, 10.0, 12.0)),
                    ("afternoon", Mf::trap(10.0, 12.0, 15.0, 17.0)),
                    ("evening", Mf::trap(15.0, 17.0, 19.0, 21.0)),
                    ("night", Mf::trap(19.0, 21.0, 23.0, 24.0)),
                ],
            ),
        ];

        let output = LinguisticVariable::new(
            "recommendation",
            (0.0, 100.0),
            &[
                ("bad", Mf::tri(0.0, 0.0, 30.0)),
                ("fair", Mf::tri(20.0, 50.0, 80.0)),
                ("good", Mf::tri(70.0, 100.0, 100.0)),
            ],
        );

        let rules = vec![
            Rule {
                id: "R1",
                antecedent: is(Rain, "rain"),
                consequent: "bad",
            },
            Rule {
                id: "R2",
                antecedent: all([is(Rain, "no_rain"), is(TimeOfDay, "night")]),
                consequent: "bad",
            },
            Rule {
                id: "R3",
                antecedent: all([
                    is(Rain, "no_rain"),
                    is(TimeOfDay, "afternoon"),
                    is(Temperature, "normal"),
                    is(Humidity, "normal"),
                    is(Light, "bright"),
                ]),
                consequent: "good",
            },
            Rule {
                id: "R4",
                antecedent: all([
                    is(Rain, "no_rain"),
                    any([is(TimeOfDay, "morning"), is(TimeOfDay, "evening")]),
                    any([is(Temperature, "normal"), is(Temperature, "hot")]),
                    is(Humidity, "normal"),
                ]),
                consequent: "fair",
            },
            Rule {
                id: "R5",
                antecedent: all([
                    is(Rain, "no_rain"),
                    any([is(Light, "medium"), is(Humidity, "humid")]),
                ]),
                consequent: "fair",
            },
            Rule {
                id: "R6",
                antecedent: all([is(Temperature, "cold"), is(Humidity, "humid")]),
                consequent: "bad",
            },
            Rule {
                id: "R7",
                antecedent: is(Rain, "no_rain"),
                consequent: "fair",
            },
        ];

        Self::new(inputs, output, rules, 1.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
