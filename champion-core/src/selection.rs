//! Cross-validation-aware champion selection.
//!
//! Records are grouped by trial. A trial with fold-level records is scored by
//! aggregating those folds; a trial with only an aggregate record is a one-element
//! aggregate. The best score under the objective's direction wins; ties go to the trial
//! with more contributing folds, then to the lexicographically smaller trial hash.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::SelectionConfig;
use crate::error::SelectionError;
use crate::keys::Identity;
use crate::record::TrialRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

impl Direction {
    /// Ordering where `Greater` means `a` is better than `b`.
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Direction::Maximize => ord,
            Direction::Minimize => ord.reverse(),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Maximize => write!(f, "maximize"),
            Direction::Minimize => write!(f, "minimize"),
        }
    }
}

/// How fold-level values collapse into one trial score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Mean,
    Median,
    Min,
    Max,
}

impl Aggregation {
    /// `None` for an empty slice.
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        Some(match self {
            // Identical fold scores keep their exact value so ties across fold counts hold.
            Aggregation::Mean if values.iter().all(|v| *v == values[0]) => values[0],
            Aggregation::Mean => values.iter().sum::<f64>() / n,
            Aggregation::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Aggregation::Mean => "mean",
            Aggregation::Median => "median",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        };
        f.write_str(name)
    }
}

/// Metric, direction and fold aggregation rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Objective {
    pub metric: String,
    pub direction: Direction,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl Objective {
    pub fn new(metric: impl Into<String>, direction: Direction) -> Self {
        Self {
            metric: metric.into(),
            direction,
            aggregation: Aggregation::default(),
        }
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }
}

impl From<&SelectionConfig> for Objective {
    fn from(config: &SelectionConfig) -> Self {
        Self::new(config.metric.clone(), config.direction).with_aggregation(config.aggregation)
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.direction, self.metric, self.aggregation)
    }
}

/// The winning trial of one (backbone, study family).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionRecord {
    pub backbone: String,
    pub family: Identity,
    /// Representative record: the trial's aggregate record, else its lowest fold.
    pub winner: TrialRecord,
    pub objective: Objective,
    /// Aggregated objective value of the winner.
    pub metric: f64,
    /// Records whose values were aggregated into `metric`.
    pub folds: Vec<TrialRecord>,
    /// Number of eligible trials considered.
    pub candidates: usize,
}

impl ChampionRecord {
    pub fn trial(&self) -> &Identity {
        &self.winner.trial
    }

    pub fn fold_count(&self) -> usize {
        self.folds.len()
    }

    /// Recompute the metric from the contributing records.
    pub fn reaggregate(&self) -> Option<f64> {
        let values: Vec<f64> = self
            .folds
            .iter()
            .filter_map(|r| r.metric(&self.objective.metric))
            .collect();
        self.objective.aggregation.apply(&values)
    }
}

/// Predicate deciding whether a record's artifact may still be obtainable.
pub type AvailabilityFilter = Arc<dyn Fn(&TrialRecord) -> bool + Send + Sync>;

struct Candidate<'a> {
    trial: &'a Identity,
    representative: &'a TrialRecord,
    contributing: Vec<&'a TrialRecord>,
    score: f64,
}

/// Picks the best trial per backbone.
#[derive(Clone)]
pub struct ChampionSelector {
    objective: Objective,
    availability: Option<AvailabilityFilter>,
}

impl fmt::Debug for ChampionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChampionSelector")
            .field("objective", &self.objective)
            .field("availability_filter", &self.availability.is_some())
            .finish()
    }
}

impl ChampionSelector {
    pub fn new(objective: Objective) -> Self {
        Self {
            objective,
            availability: None,
        }
    }

    /// Exclude trials whose representative record fails `filter` before ranking.
    pub fn with_availability_filter(mut self, filter: AvailabilityFilter) -> Self {
        self.availability = Some(filter);
        self
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    /// Champion among `records` belonging to `backbone`.
    pub fn select_champion(
        &self,
        backbone: &str,
        records: &[TrialRecord],
    ) -> Result<ChampionRecord, SelectionError> {
        let mine: Vec<&TrialRecord> = records.iter().filter(|r| r.backbone == backbone).collect();
        if mine.is_empty() {
            return Err(SelectionError::NoChampionFound {
                backbone: backbone.to_string(),
                reason: "no trial records".into(),
            });
        }

        let mut families: BTreeMap<&Identity, Vec<&TrialRecord>> = BTreeMap::new();
        for record in &mine {
            families.entry(&record.family).or_default().push(record);
        }
        if families.len() > 1 {
            return Err(SelectionError::AmbiguousFamily {
                backbone: backbone.to_string(),
                families: families.keys().map(|f| f.to_string()).collect(),
            });
        }
        let Some((family, family_records)) = families.into_iter().next() else {
            return Err(SelectionError::NoChampionFound {
                backbone: backbone.to_string(),
                reason: "no trial records".into(),
            });
        };

        let candidates = self.candidates(&family_records);
        let eligible = candidates.len();
        let best = candidates
            .into_iter()
            .max_by(|a, b| self.rank(a, b))
            .ok_or_else(|| SelectionError::NoChampionFound {
                backbone: backbone.to_string(),
                reason: format!(
                    "none of {} records has a usable '{}' value or an available artifact",
                    family_records.len(),
                    self.objective.metric
                ),
            })?;

        tracing::info!(
            backbone,
            trial = %best.trial,
            metric = best.score,
            folds = best.contributing.len(),
            candidates = eligible,
            objective = %self.objective,
            "Selected champion"
        );
        Ok(ChampionRecord {
            backbone: backbone.to_string(),
            family: family.clone(),
            winner: best.representative.clone(),
            objective: self.objective.clone(),
            metric: best.score,
            folds: best.contributing.into_iter().cloned().collect(),
            candidates: eligible,
        })
    }

    /// Champion per backbone; each backbone succeeds or fails independently.
    pub fn select_champions_for_backbones(
        &self,
        records_by_backbone: &BTreeMap<String, Vec<TrialRecord>>,
    ) -> BTreeMap<String, Result<ChampionRecord, SelectionError>> {
        records_by_backbone
            .iter()
            .map(|(backbone, records)| (backbone.clone(), self.select_champion(backbone, records)))
            .collect()
    }

    /// `Greater` when `a` beats `b`.
    fn rank(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        self.objective
            .direction
            .compare(a.score, b.score)
            .then_with(|| a.contributing.len().cmp(&b.contributing.len()))
            .then_with(|| b.trial.hash().cmp(a.trial.hash()))
    }

    fn candidates<'a>(&self, records: &[&'a TrialRecord]) -> Vec<Candidate<'a>> {
        let mut by_trial: BTreeMap<&Identity, Vec<&TrialRecord>> = BTreeMap::new();
        for record in records {
            by_trial.entry(&record.trial).or_default().push(record);
        }

        let metric = self.objective.metric.as_str();
        let mut out = Vec::new();
        for (trial, trial_records) in by_trial {
            let aggregate = trial_records.iter().copied().find(|r| r.is_aggregate());
            let mut folds: BTreeMap<u32, &TrialRecord> = BTreeMap::new();
            for record in trial_records.iter().copied() {
                let Some(k) = record.fold_index else {
                    continue;
                };
                if folds.contains_key(&k) {
                    tracing::warn!(trial = %trial, fold = k, "Duplicate fold record ignored");
                    continue;
                }
                folds.insert(k, record);
            }

            let contributing: Vec<&TrialRecord> = if folds.is_empty() {
                aggregate.into_iter().collect()
            } else {
                folds
                    .values()
                    .copied()
                    .filter(|r| {
                        let usable = r.metric(metric).is_some();
                        if !usable {
                            tracing::debug!(
                                trial = %trial,
                                fold = ?r.fold_index,
                                metric,
                                "Fold lacks objective metric"
                            );
                        }
                        usable
                    })
                    .collect()
            };
            let values: Vec<f64> = contributing.iter().filter_map(|r| r.metric(metric)).collect();
            let Some(score) = self.objective.aggregation.apply(&values).filter(|v| v.is_finite())
            else {
                tracing::debug!(trial = %trial, metric, "Trial has no usable objective value");
                continue;
            };
            let Some(representative) = aggregate.or_else(|| folds.values().next().copied()) else {
                continue;
            };
            if let Some(filter) = &self.availability {
                if !filter(representative) {
                    tracing::debug!(trial = %trial, "Trial excluded: artifact unavailable");
                    continue;
                }
            }
            out.push(Candidate {
                trial,
                representative,
                contributing,
                score,
            });
        }
        out
    }
}
