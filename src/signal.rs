//! Threshold-based signal classification of indicator values.

use std::collections::{HashMap, HashSet};

use error_stack::{Report, bail};

use crate::config::{BandConfig, ThresholdRuleConfig, ThresholdsConfig};
use crate::error::{ClassifyError, ConfigError};
use crate::indicator::catalog::{self, IndicatorKind};
use crate::model::{SignalLabel, TimeframeBucket};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ThresholdKey {
    kind: IndicatorKind,
    params: Vec<usize>,
    bucket: TimeframeBucket,
}

#[derive(Debug, Clone, PartialEq)]
struct Band {
    label: SignalLabel,
    bound: f64,
}

/// Boundaries of one rule, sorted at load time.
#[derive(Debug, Clone, Default)]
struct Bands {
    /// Descending by bound; first match wins.
    upper: Vec<Band>,
    /// Ascending by bound; first match wins.
    lower: Vec<Band>,
}

impl Bands {
    fn classify(&self, value: f64) -> SignalLabel {
        if let Some(band) = self.upper.iter().find(|b| value >= b.bound) {
            return band.label;
        }
        if let Some(band) = self.lower.iter().find(|b| value <= b.bound) {
            return band.label;
        }
        SignalLabel::Neutral
    }
}

/// Immutable, versioned signal boundaries for every configured
/// (indicator kind, params, bucket).
#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    version: u32,
    rules: HashMap<ThresholdKey, Bands>,
}

fn invalid(field: String) -> Report<ConfigError> {
    Report::new(ConfigError::Validation { field })
}

impl ThresholdConfig {
    pub fn from_config(config: &ThresholdsConfig) -> Result<Self, Report<ConfigError>> {
        let mut rules = HashMap::new();

        for (i, rule) in config.rules.iter().enumerate() {
            let (key, bands) = parse_rule(i, rule)?;
            if rules.insert(key, bands).is_some() {
                bail!(ConfigError::Validation {
                    field: format!(
                        "thresholds.rules[{i}] duplicates {} {:?} ({})",
                        rule.indicator, rule.params, rule.bucket
                    ),
                });
            }
        }

        Ok(Self {
            version: config.version,
            rules,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_configured(
        &self,
        kind: IndicatorKind,
        params: &[usize],
        bucket: TimeframeBucket,
    ) -> bool {
        self.rules.contains_key(&ThresholdKey {
            kind,
            params: params.to_vec(),
            bucket,
        })
    }

    /// Map `value` to a label using the configured boundaries.
    ///
    /// Upper bounds (`value >= bound`) are checked highest first, then lower
    /// bounds (`value <= bound`) lowest first; otherwise `Neutral`.
    pub fn classify(
        &self,
        kind: IndicatorKind,
        params: &[usize],
        bucket: TimeframeBucket,
        value: f64,
    ) -> Result<SignalLabel, Report<ClassifyError>> {
        let key = ThresholdKey {
            kind,
            params: params.to_vec(),
            bucket,
        };
        let Some(bands) = self.rules.get(&key) else {
            bail!(ClassifyError::Unconfigured {
                indicator: column_name(kind, params),
                bucket: bucket.to_string(),
            });
        };
        if !value.is_finite() {
            bail!(ClassifyError::InvalidValue {
                indicator: column_name(kind, params),
            });
        }
        Ok(bands.classify(value))
    }
}

fn column_name(kind: IndicatorKind, params: &[usize]) -> String {
    std::iter::once(kind.as_str().to_string())
        .chain(params.iter().map(|p| p.to_string()))
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_rule(
    index: usize,
    rule: &ThresholdRuleConfig,
) -> Result<(ThresholdKey, Bands), Report<ConfigError>> {
    let prefix = format!("thresholds.rules[{index}]");

    let kind = IndicatorKind::from_str(&rule.indicator)
        .ok_or_else(|| invalid(format!("{prefix}.indicator \"{}\" is unknown", rule.indicator)))?;
    if !kind.is_classifiable() {
        bail!(ConfigError::Validation {
            field: format!("{prefix}.indicator \"{kind}\" does not produce signals"),
        });
    }
    let bucket = TimeframeBucket::from_str(&rule.bucket)
        .ok_or_else(|| invalid(format!("{prefix}.bucket \"{}\" is unknown", rule.bucket)))?;
    if catalog::find(kind, &rule.params, bucket).is_none() {
        bail!(ConfigError::Validation {
            field: format!(
                "{prefix}: {} is not computed for the {bucket} bucket",
                column_name(kind, &rule.params)
            ),
        });
    }
    if rule.upper.is_empty() && rule.lower.is_empty() {
        bail!(ConfigError::Validation {
            field: format!("{prefix} has no bands"),
        });
    }

    let mut seen = HashSet::new();
    let mut upper = parse_bands(&prefix, "upper", &rule.upper, &mut seen)?;
    let mut lower = parse_bands(&prefix, "lower", &rule.lower, &mut seen)?;
    upper.sort_by(|a, b| b.bound.total_cmp(&a.bound));
    lower.sort_by(|a, b| a.bound.total_cmp(&b.bound));

    // upper is descending, lower ascending
    if let (Some(lowest_upper), Some(highest_lower)) = (upper.last(), lower.last()) {
        if lowest_upper.bound <= highest_lower.bound {
            bail!(ConfigError::Validation {
                field: format!(
                    "{prefix}: upper bound {} must be above lower bound {}",
                    lowest_upper.bound, highest_lower.bound
                ),
            });
        }
    }

    Ok((
        ThresholdKey {
            kind,
            params: rule.params.clone(),
            bucket,
        },
        Bands { upper, lower },
    ))
}

fn parse_bands(
    prefix: &str,
    side: &str,
    bands: &[BandConfig],
    seen: &mut HashSet<SignalLabel>,
) -> Result<Vec<Band>, Report<ConfigError>> {
    bands
        .iter()
        .map(|band| {
            let label = SignalLabel::from_str(&band.label).ok_or_else(|| {
                invalid(format!("{prefix}.{side} label \"{}\" is unknown", band.label))
            })?;
            if label == SignalLabel::Neutral {
                bail!(ConfigError::Validation {
                    field: format!("{prefix}.{side}: neutral is implied and cannot be a band"),
                });
            }
            if !seen.insert(label) {
                bail!(ConfigError::Validation {
                    field: format!("{prefix}.{side}: label {label} used twice"),
                });
            }
            if !band.bound.is_finite() {
                bail!(ConfigError::Validation {
                    field: format!("{prefix}.{side}: bound for {label} must be finite"),
                });
            }
            Ok(Band {
                label,
                bound: band.bound,
            })
        })
        .collect()
}
