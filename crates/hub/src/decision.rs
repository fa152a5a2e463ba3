//! Mamdani inference over [`FuzzyModel`]: fuzzify, fire rules (AND = min,
//! OR = max), aggregate per output set (max), defuzzify by centroid.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EvaluationError, ValidationError};
use crate::fuzzy::{Antecedent, FuzzyModel, Input};
use crate::state::TelemetryRecord;

/// Substituted when no rule fires.
pub const NEUTRAL_CONFIDENCE: f64 = 50.0;

const GOOD_THRESHOLD: f64 = 70.0;
const FAIR_THRESHOLD: f64 = 30.0;

const TEMPERATURE_RANGE: (f64, f64) = (0.0, 50.0);
const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);
const LIGHT_RANGE: (f64, f64) = (0.0, 4096.0);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Poor,
    Fair,
    Good,
}

impl Category {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= GOOD_THRESHOLD {
            Self::Good
        } else if confidence >= FAIR_THRESHOLD {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

/// Crisp inputs to one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationInput {
    pub temperature: f64,
    pub humidity: f64,
    pub light: f64,
    pub rain: f64,
    pub hour: f64,
}

impl EvaluationInput {
    fn get(&self, input: Input) -> f64 {
        match input {
            Input::Temperature => self.temperature,
            Input::Humidity => self.humidity,
            Input::Light => self.light,
            Input::Rain => self.rain,
            Input::TimeOfDay => self.hour,
        }
    }
}

impl From<&TelemetryRecord> for EvaluationInput {
    fn from(r: &TelemetryRecord) -> Self {
        Self {
            temperature: r.temperature,
            humidity: r.humidity,
            light: r.light as f64,
            rain: if r.rain { 1.0 } else { 0.0 },
            hour: f64::from(r.hour),
        }
    }
}

/// An out-of-domain input that was silently corrected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InputCorrection {
    pub input: Input,
    pub original: f64,
    pub corrected: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// Centroid of the aggregated output.
    Inferred,
    /// No rule fired; confidence is [`NEUTRAL_CONFIDENCE`].
    NoRuleActivated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleActivation {
    pub id: &'static str,
    pub consequent: &'static str,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub category: Category,
    /// 0..=100
    pub confidence: f64,
    pub source: ScoreSource,
    /// Inputs after correction, i.e. what the rules actually saw.
    pub inputs: EvaluationInput,
    pub corrections: Vec<InputCorrection>,
    /// Rules with nonzero firing strength, in rule order.
    pub rules_activated: Vec<RuleActivation>,
}

impl Recommendation {
    pub fn no_rule_activated(&self) -> bool {
        self.source == ScoreSource::NoRuleActivated
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless evaluator over an immutable model.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    model: FuzzyModel,
}

impl DecisionEngine {
    pub fn new(model: FuzzyModel) -> Self {
        Self { model }
    }

    pub fn drying_rack() -> anyhow::Result<Self> {
        Ok(Self::new(FuzzyModel::drying_rack()?))
    }

    pub fn model(&self) -> &FuzzyModel {
        &self.model
    }

    pub fn evaluate_record(&self, record: &TelemetryRecord) -> Result<Recommendation, EvaluationError> {
        self.evaluate(EvaluationInput::from(record))
    }

    pub fn evaluate(&self, input: EvaluationInput) -> Result<Recommendation, EvaluationError> {
        let (inputs, corrections) = normalize(input)?;
        for c in &corrections {
            warn!(
                input = ?c.input,
                original = c.original,
                corrected = c.corrected,
                "evaluation input corrected"
            );
        }

        let model = &self.model;

        // Fuzzification: degrees[input][set]
        let degrees: Vec<Vec<f64>> = Input::ALL
            .iter()
            .map(|&i| model.input(i).fuzzify(inputs.get(i)))
            .collect();

        let mut aggregated = vec![0.0_f64; model.output.sets.len()];
        let mut rules_activated = Vec::new();

        for rule in &model.rules {
            let strength = firing_strength(model, &rule.antecedent, &degrees)?;
            let out = model.output.set_index(rule.consequent).ok_or_else(|| {
                EvaluationError::Internal(format!(
                    "{}: unknown output set '{}'",
                    rule.id, rule.consequent
                ))
            })?;
            aggregated[out] = aggregated[out].max(strength);
            if strength > 0.0 {
                rules_activated.push(RuleActivation {
                    id: rule.id,
                    consequent: rule.consequent,
                    strength,
                });
            }
        }

        let (confidence, source) = if rules_activated.is_empty() {
            warn!("no rules activated, using neutral confidence");
            (NEUTRAL_CONFIDENCE, ScoreSource::NoRuleActivated)
        } else {
            let c = centroid(model, &aggregated)?;
            (c.clamp(0.0, 100.0), ScoreSource::Inferred)
        };

        let category = Category::from_confidence(confidence);
        debug!(
            confidence,
            ?category,
            rules = rules_activated.len(),
            "evaluation complete"
        );

        Ok(Recommendation {
            category,
            confidence,
            source,
            inputs,
            corrections,
            rules_activated,
        })
    }
}

/// Reject out-of-domain temperature/humidity; clamp, coerce or wrap the
/// rest.
fn normalize(input: EvaluationInput) -> Result<(EvaluationInput, Vec<InputCorrection>), ValidationError> {
    if !in_range(input.temperature, TEMPERATURE_RANGE) {
        return Err(ValidationError::TemperatureOutOfRange(input.temperature));
    }
    if !in_range(input.humidity, HUMIDITY_RANGE) {
        return Err(ValidationError::HumidityOutOfRange(input.humidity));
    }

    let light = if input.light.is_nan() {
        LIGHT_RANGE.0
    } else {
        input.light.clamp(LIGHT_RANGE.0, LIGHT_RANGE.1)
    };
    let rain = if input.rain == 0.0 { 0.0 } else { 1.0 };
    let hour = if input.hour.is_finite() {
        input.hour.rem_euclid(24.0)
    } else {
        0.0
    };

    let normalized = EvaluationInput {
        light,
        rain,
        hour,
        ..input
    };

    let corrections = [Input::Light, Input::Rain, Input::TimeOfDay]
        .into_iter()
        .filter_map(|i| {
            let (original, corrected) = (input.get(i), normalized.get(i));
            // NaN never equals itself, so it is always reported.
            (original != corrected).then_some(InputCorrection {
                input: i,
                original,
                corrected,
            })
        })
        .collect();

    Ok((normalized, corrections))
}

fn in_range(v: f64, (lo, hi): (f64, f64)) -> bool {
    (lo..=hi).contains(&v)
}

fn firing_strength(
    model: &FuzzyModel,
    antecedent: &Antecedent,
    degrees: &[Vec<f64>],
) -> Result<f64, EvaluationError> {
    match antecedent {
        Antecedent::Is(input, set) => {
            let idx = model.input(*input).set_index(set).ok_or_else(|| {
                EvaluationError::Internal(format!("unknown set '{set}' for {input:?}"))
            })?;
            Ok(degrees[input.index()][idx])
        }
        Antecedent::All(parts) => parts.iter().try_fold(1.0_f64, |acc, p| {
            Ok(acc.min(firing_strength(model, p, degrees)?))
        }),
        Antecedent::Any(parts) => parts.iter().try_fold(0.0_f64, |acc, p| {
            Ok(acc.max(firing_strength(model, p, degrees)?))
        }),
    }
}

/// Centroid of the clipped-and-maxed output surface, sampled every
/// `model.resolution` and integrated piecewise-linearly.
fn centroid(model: &FuzzyModel, aggregated: &[f64]) -> Result<f64, EvaluationError> {
    let (lo, hi) = model.output.range;
    let steps = ((hi - lo) / model.resolution).ceil() as usize;

    let surface = |x: f64| -> f64 {
        model
            .output
            .sets
            .iter()
            .zip(aggregated)
            .map(|(set, &strength)| set.shape.degree(x).min(strength))
            .fold(0.0, f64::max)
    };

    let mut area = 0.0;
    let mut moment = 0.0;
    let mut x1 = lo;
    let mut y1 = surface(x1);
    for i in 1..=steps {
        let x2 = (lo + i as f64 * model.resolution).min(hi);
        let y2 = surface(x2);
        let dx = x2 - x1;
        area += dx * (y1 + y2) / 2.0;
        moment += dx / 6.0 * (x1 * (2.0 * y1 + y2) + x2 * (y1 + 2.0 * y2));
        x1 = x2;
        y1 = y2;
    }

    if area <= 0.0 {
        return Err(EvaluationError::Internal(
            "aggregated output has zero area".to_string(),
        ));
    }
    let c = moment / area;
    if !c.is_finite() {
        return Err(EvaluationError::Internal(format!("non-finite centroid {c}")));
    }
    Ok(c)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzy::{is, LinguisticVariable, MembershipFn, Rule};
    use proptest::prelude::*;

    fn engine() -> DecisionEngine {
        DecisionEngine::drying_rack().unwrap()
    }

    fn input(temperature: f64, humidity: f64, light: f64, rain: f64, hour: f64) -> EvaluationInput {
        EvaluationInput {
            temperature,
            humidity,
            light,
            rain,
            hour,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn activated(r: &Recommendation) -> Vec<&'static str> {
        r.rules_activated.iter().map(|a| a.id).collect()
    }

    // -- Category ------------------------------------------------------------

    #[test]
    fn category_thresholds() {
        assert_eq!(Category::from_confidence(100.0), Category::Good);
        assert_eq!(Category::from_confidence(70.0), Category::Good);
        assert_eq!(Category::from_confidence(69.99), Category::Fair);
        assert_eq!(Category::from_confidence(30.0), Category::Fair);
        assert_eq!(Category::from_confidence(29.99), Category::Poor);
        assert_eq!(Category::from_confidence(0.0), Category::Poor);
    }

    // -- Validation ----------------------------------------------------------

    #[test]
    fn temperature_out_of_domain_rejected() {
        let e = engine();
        assert_eq!(
            e.evaluate(input(51.0, 50.0, 0.0, 0.0, 12.0)),
            Err(EvaluationError::Validation(ValidationError::TemperatureOutOfRange(51.0)))
        );
        assert!(e.evaluate(input(-0.1, 50.0, 0.0, 0.0, 12.0)).is_err());
        assert!(e.evaluate(input(f64::NAN, 50.0, 0.0, 0.0, 12.0)).is_err());
    }

    #[test]
    fn humidity_out_of_domain_rejected() {
        assert_eq!(
            engine().evaluate(input(25.0, 100.5, 0.0, 0.0, 12.0)),
            Err(EvaluationError::Validation(ValidationError::HumidityOutOfRange(100.5)))
        );
    }

    #[test]
    fn domain_edges_accepted() {
        let e = engine();
        assert!(e.evaluate(input(0.0, 0.0, 0.0, 0.0, 0.0)).is_ok());
        assert!(e.evaluate(input(50.0, 100.0, 4096.0, 1.0, 23.0)).is_ok());
    }

    // -- Corrections ---------------------------------------------------------

    #[test]
    fn hour_wraps_modulo_24() {
        let e = engine();
        let r = e.evaluate(input(25.0, 60.0, 1000.0, 0.0, 25.0)).unwrap();
        assert_eq!(r.inputs.hour, 1.0);
        let r = e.evaluate(input(25.0, 60.0, 1000.0, 0.0, -1.0)).unwrap();
        assert_eq!(r.inputs.hour, 23.0);
        assert_eq!(
            r.corrections,
            vec![InputCorrection {
                input: Input::TimeOfDay,
                original: -1.0,
                corrected: 23.0
            }]
        );
    }

    #[test]
    fn wrapped_hour_scores_like_its_equivalent() {
        let e = engine();
        let wrapped = e.evaluate(input(25.0, 60.0, 1000.0, 0.0, 25.0)).unwrap();
        let plain = e.evaluate(input(25.0, 60.0, 1000.0, 0.0, 1.0)).unwrap();
        assert_eq!(wrapped.confidence, plain.confidence);
    }

    #[test]
    fn light_is_clamped() {
        let e = engine();
        let r = e.evaluate(input(25.0, 60.0, 5000.0, 0.0, 12.0)).unwrap();
        assert_eq!(r.inputs.light, 4096.0);
        let r = e.evaluate(input(25.0, 60.0, -10.0, 0.0, 12.0)).unwrap();
        assert_eq!(r.inputs.light, 0.0);
        assert_eq!(r.corrections.len(), 1);
        assert_eq!(r.corrections[0].input, Input::Light);
    }

    #[test]
    fn rain_is_coerced_to_binary() {
        let e = engine();
        let r = e.evaluate(input(25.0, 60.0, 0.0, 0.3, 12.0)).unwrap();
        assert_eq!(r.inputs.rain, 1.0);
        let r = e.evaluate(input(25.0, 60.0, 0.0, 0.0, 12.0)).unwrap();
        assert_eq!(r.inputs.rain, 0.0);
        assert!(r.corrections.is_empty());
    }

    // -- Inference -----------------------------------------------------------

    #[test]
    fn rain_is_poor() {
        let r = engine().evaluate(input(25.0, 60.0, 0.0, 1.0, 12.0)).unwrap();
        assert_eq!(r.category, Category::Poor);
        // Only the "bad" triangle survives; its centroid is a third of 30.
        assert!(approx(r.confidence, 10.0), "confidence {}", r.confidence);
        assert_eq!(activated(&r), vec!["R1"]);
    }

    #[test]
    fn sunny_afternoon_blends_good_and_fair() {
        let r = engine().evaluate(input(25.0, 60.0, 1000.0, 0.0, 13.0)).unwrap();
        assert_eq!(activated(&r), vec!["R3", "R7"]);
        assert!(approx(r.confidence, 2787.5 / (45.0 - 5.0 / 6.0)), "confidence {}", r.confidence);
        assert_eq!(r.category, Category::Fair);
    }

    #[test]
    fn dry_night_leans_bad() {
        let r = engine().evaluate(input(25.0, 60.0, 3500.0, 0.0, 22.0)).unwrap();
        assert_eq!(activated(&r), vec!["R2", "R7"]);
        assert!(r.confidence < NEUTRAL_CONFIDENCE);
        // Mirror image of the afternoon case around 50.
        assert!(approx(r.confidence, 100.0 - 2787.5 / (45.0 - 5.0 / 6.0)));
    }

    #[test]
    fn cold_and_humid_fires_r6() {
        let r = engine().evaluate(input(10.0, 90.0, 0.0, 0.0, 13.0)).unwrap();
        assert!(activated(&r).contains(&"R6"));
        assert!(activated(&r).contains(&"R5"));
    }

    #[test]
    fn real_score_of_fifty_is_not_the_neutral_default() {
        // Morning, mild, bright: only "fair" rules fire, whose centroid is 50.
        let r = engine().evaluate(input(25.0, 60.0, 0.0, 0.0, 8.0)).unwrap();
        assert!(approx(r.confidence, 50.0));
        assert_eq!(r.source, ScoreSource::Inferred);
        assert!(!r.no_rule_activated());
        assert_eq!(activated(&r), vec!["R4", "R7"]);
    }

    #[test]
    fn no_rule_activated_uses_neutral_default() {
        let base = FuzzyModel::drying_rack().unwrap();
        let rules = vec![Rule {
            id: "rain-only",
            antecedent: is(Input::Rain, "rain"),
            consequent: "bad",
        }];
        let model = FuzzyModel::new(base.inputs, base.output, rules, 1.0).unwrap();
        let r = DecisionEngine::new(model)
            .evaluate(input(25.0, 60.0, 0.0, 0.0, 12.0))
            .unwrap();
        assert_eq!(r.confidence, NEUTRAL_CONFIDENCE);
        assert!(r.no_rule_activated());
        assert_eq!(r.category, Category::Fair);
        assert!(r.rules_activated.is_empty());
    }

    #[test]
    fn zero_area_output_is_internal_error() {
        // An output set narrower than the sampling step is invisible to the
        // centroid even when its rule fires.
        let base = FuzzyModel::drying_rack().unwrap();
        let output = LinguisticVariable::new(
            "recommendation",
            (0.0, 100.0),
            &[("spike", MembershipFn::tri(40.2, 40.5, 40.8))],
        );
        let rules = vec![Rule {
            id: "always",
            antecedent: is(Input::Rain, "no_rain"),
            consequent: "spike",
        }];
        let model = FuzzyModel::new(base.inputs, output, rules, 1.0).unwrap();
        let err = DecisionEngine::new(model)
            .evaluate(input(25.0, 60.0, 0.0, 0.0, 12.0))
            .unwrap_err();
        assert!(matches!(err, EvaluationError::Internal(_)));
    }

    #[test]
    fn evaluate_record_uses_record_hour() {
        use crate::payload::decode_telemetry;
        use time::macros::datetime;

        let record = decode_telemetry(
            b"suhu:28.5,kelembapan:55,cahaya_analog:1800,hujan:tidak hujan,waktu:2025-06-24 21:28:44",
            datetime!(2030-01-01 12:00:00),
        )
        .unwrap();
        let r = engine().evaluate_record(&record).unwrap();
        assert_eq!(r.inputs.hour, 21.0);
        assert_eq!(r.inputs.light, 1800.0);
        assert!(activated(&r).contains(&"R2"));
    }

    // -- Properties ----------------------------------------------------------

    proptest! {
        #[test]
        fn confidence_in_range_and_category_consistent(
            temperature in 0.0f64..=50.0,
            humidity in 0.0f64..=100.0,
            light in -1000.0f64..6000.0,
            rain in prop::bool::ANY,
            hour in -48.0f64..48.0,
        ) {
            let rain = if rain { 1.0 } else { 0.0 };
            let r = engine().evaluate(input(temperature, humidity, light, rain, hour)).unwrap();
            prop_assert!((0.0..=100.0).contains(&r.confidence));
            prop_assert_eq!(r.category, Category::from_confidence(r.confidence));
        }

        #[test]
        fn rain_always_poor(
            temperature in 0.0f64..=50.0,
            humidity in 0.0f64..=100.0,
            light in 0.0f64..=4096.0,
            hour in 0.0f64..24.0,
        ) {
            let r = engine().evaluate(input(temperature, humidity, light, 1.0, hour)).unwrap();
            prop_assert_eq!(r.category, Category::Poor);
        }

        #[test]
        fn catch_all_fires_without_rain(
            temperature in 0.0f64..=50.0,
            humidity in 0.0f64..=100.0,
            light in 0.0f64..=4096.0,
            hour in 0.0f64..24.0,
        ) {
            let r = engine().evaluate(input(temperature, humidity, light, 0.0, hour)).unwrap();
            prop_assert!(!r.no_rule_activated());
            prop_assert!(r.rules_activated.iter().any(|a| a.id == "R7" && a.strength == 1.0));
        }
    }
}
