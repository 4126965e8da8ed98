//! Names of the downstream analysis models a run can be tagged with.
//!
//! Sweeps only check that the model suits the sweep kind and record it in
//! the run log; nothing here runs an analysis.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepKind {
    OneD,
    TwoD,
    Time,
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SweepKind::OneD => "1D",
            SweepKind::TwoD => "2D",
            SweepKind::Time => "time",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisModel {
    PinchOffClassifier,
    PinchOffParameterExtractor,
    TurnOnClassifier,
    TurnOnParameterExtractor,
    CoulombBlockadeClassifier,
    CoulombBlockadePeakDetector,
    ChargeStabilityDiagramClassifier,
    ChargeStabilityDiagramSegmenter,
    TriplePointDetector,
    HoneycombPatternDetector,
    NoiseAnalyzer,
    DriftDetector,
    StabilityAnalyzer,
}

impl AnalysisModel {
    pub const ALL: [AnalysisModel; 13] = [
        AnalysisModel::PinchOffClassifier,
        AnalysisModel::PinchOffParameterExtractor,
        AnalysisModel::TurnOnClassifier,
        AnalysisModel::TurnOnParameterExtractor,
        AnalysisModel::CoulombBlockadeClassifier,
        AnalysisModel::CoulombBlockadePeakDetector,
        AnalysisModel::ChargeStabilityDiagramClassifier,
        AnalysisModel::ChargeStabilityDiagramSegmenter,
        AnalysisModel::TriplePointDetector,
        AnalysisModel::HoneycombPatternDetector,
        AnalysisModel::NoiseAnalyzer,
        AnalysisModel::DriftDetector,
        AnalysisModel::StabilityAnalyzer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AnalysisModel::PinchOffClassifier => "pinch-off-classifier",
            AnalysisModel::PinchOffParameterExtractor => "pinch-off-parameter-extractor",
            AnalysisModel::TurnOnClassifier => "turn-on-classifier",
            AnalysisModel::TurnOnParameterExtractor => "turn-on-parameter-extractor",
            AnalysisModel::CoulombBlockadeClassifier => "coulomb-blockade-classifier",
            AnalysisModel::CoulombBlockadePeakDetector => "coulomb-blockade-peak-detector",
            AnalysisModel::ChargeStabilityDiagramClassifier => {
                "charge-stability-diagram-classifier"
            }
            AnalysisModel::ChargeStabilityDiagramSegmenter => "charge-stability-diagram-segmenter",
            AnalysisModel::TriplePointDetector => "triple-point-detector",
            AnalysisModel::HoneycombPatternDetector => "honeycomb-pattern-detector",
            AnalysisModel::NoiseAnalyzer => "noise-analyzer",
            AnalysisModel::DriftDetector => "drift-detector",
            AnalysisModel::StabilityAnalyzer => "stability-analyzer",
        }
    }

    pub fn kind(self) -> SweepKind {
        use AnalysisModel::*;
        match self {
            PinchOffClassifier
            | PinchOffParameterExtractor
            | TurnOnClassifier
            | TurnOnParameterExtractor
            | CoulombBlockadeClassifier
            | CoulombBlockadePeakDetector => SweepKind::OneD,
            ChargeStabilityDiagramClassifier
            | ChargeStabilityDiagramSegmenter
            | TriplePointDetector
            | HoneycombPatternDetector => SweepKind::TwoD,
            NoiseAnalyzer | DriftDetector | StabilityAnalyzer => SweepKind::Time,
        }
    }

    /// Models that accept data from a sweep of `kind`
    pub fn supported(kind: SweepKind) -> Vec<AnalysisModel> {
        Self::ALL.into_iter().filter(|m| m.kind() == kind).collect()
    }

    pub fn check_kind(self, kind: SweepKind) -> Result<(), GateError> {
        if self.kind() == kind {
            return Ok(());
        }
        Err(GateError::UnsupportedModel {
            model: self.name().to_string(),
            kind: kind.to_string(),
            supported: Self::supported(kind)
                .iter()
                .map(|m| m.name())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

impl fmt::Display for AnalysisModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AnalysisModel {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| GateError::UnsupportedModel {
                model: s.to_string(),
                kind: "any".to_string(),
                supported: Self::ALL
                    .iter()
                    .map(|m| m.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}
