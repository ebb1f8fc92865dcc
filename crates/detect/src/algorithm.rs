//! 탐지 알고리즘 — 태그된 변형과 로드 시점 검증
//!
//! 전략 문서의 알고리즘 페이로드는 원시 JSON으로 도착합니다. 여기서
//! `algorithm_type`별 스키마로 컴파일하며, 검증 실패는 전략 전체를
//! 거부합니다. 평가 시점에는 더 이상 스키마 오류가 없습니다.

use serde::{Deserialize, Serialize};

use watchpost_core::error::StrategyError;
use watchpost_core::strategy::AlgorithmSpec;
use watchpost_core::types::{DataPoint, Severity};

/// 정적 임계값 한 조건
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBound {
    pub method: String,
    pub threshold: f64,
}

impl ThresholdBound {
    fn matches(&self, value: f64) -> Option<bool> {
        match self.method.as_str() {
            "gt" => Some(value > self.threshold),
            "gte" => Some(value >= self.threshold),
            "lt" => Some(value < self.threshold),
            "lte" => Some(value <= self.threshold),
            "eq" => Some(value == self.threshold),
            "neq" => Some(value != self.threshold),
            _ => None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self.method.as_str() {
            "gt" => ">",
            "gte" => ">=",
            "lt" => "<",
            "lte" => "<=",
            "eq" => "==",
            _ => "!=",
        }
    }
}

/// 컴파일된 알고리즘 설정
#[derive(Debug, Clone, PartialEq)]
pub enum AlgorithmConfig {
    /// 정적 임계값 — 바깥 Vec은 OR, 안쪽 Vec은 AND
    Threshold(Vec<Vec<ThresholdBound>>),
    /// 범위 임계값 — `[floor, ceil]` 밖이면 이상
    RangeThreshold { floor: f64, ceil: f64 },
    /// 단순 환비(ring ratio) — 직전 값 대비 변화율(%)이 한도를 넘으면 이상
    SimpleRingRatio { floor: f64, ceil: f64 },
    /// 지능형 탐지 — 외부 판정기 훅으로 위임
    Intelligent { sensitivity: u32 },
}

/// 지능형 탐지 판정기 훅
///
/// `(이상 여부, 점수)`를 돌려줍니다. 훅이 등록되지 않으면 지능형
/// 알고리즘은 항상 정상으로 판정됩니다.
pub trait IntelligentDetector: Send + Sync {
    fn detect(&self, point: &DataPoint, sensitivity: u32) -> (bool, f64);
}

/// 레벨이 붙은 컴파일 결과
#[derive(Debug, Clone)]
pub struct CompiledAlgorithm {
    pub level: Severity,
    pub config: AlgorithmConfig,
}

impl CompiledAlgorithm {
    /// 원시 명세를 컴파일합니다. 스키마 위반은 [`StrategyError::InvalidAlgorithm`]입니다.
    pub fn compile(spec: &AlgorithmSpec, strategy_id: u64) -> Result<Self, StrategyError> {
        let invalid = |reason: String| StrategyError::InvalidAlgorithm {
            strategy_id,
            reason,
        };
        let config = match spec.algorithm_type.as_str() {
            "Threshold" => {
                let bounds: Vec<Vec<ThresholdBound>> = serde_json::from_value(
                    spec.config.clone(),
                )
                .map_err(|e| invalid(format!("threshold config: {e}")))?;
                if bounds.is_empty() || bounds.iter().any(|group| group.is_empty()) {
                    return Err(invalid("threshold config must not be empty".to_owned()));
                }
                for bound in bounds.iter().flatten() {
                    if !bound.threshold.is_finite() {
                        return Err(invalid("threshold is not finite".to_owned()));
                    }
                    if bound.matches(0.0).is_none() {
                        return Err(invalid(format!("unknown method '{}'", bound.method)));
                    }
                }
                AlgorithmConfig::Threshold(bounds)
            }
            "RangeThreshold" => {
                #[derive(Deserialize)]
                struct Raw {
                    floor: f64,
                    ceil: f64,
                }
                let raw: Raw = serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(format!("range threshold config: {e}")))?;
                if raw.floor > raw.ceil {
                    return Err(invalid("floor must be <= ceil".to_owned()));
                }
                AlgorithmConfig::RangeThreshold {
                    floor: raw.floor,
                    ceil: raw.ceil,
                }
            }
            "SimpleRingRatio" => {
                #[derive(Deserialize)]
                struct Raw {
                    floor: f64,
                    ceil: f64,
                }
                let raw: Raw = serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(format!("ring ratio config: {e}")))?;
                if raw.floor < 0.0 || raw.ceil < 0.0 {
                    return Err(invalid("ring ratio bounds must be >= 0".to_owned()));
                }
                AlgorithmConfig::SimpleRingRatio {
                    floor: raw.floor,
                    ceil: raw.ceil,
                }
            }
            "IntelligentDetect" => {
                #[derive(Deserialize)]
                struct Raw {
                    #[serde(default = "default_sensitivity")]
                    sensitivity: u32,
                }
                fn default_sensitivity() -> u32 {
                    5
                }
                let raw: Raw = serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(format!("intelligent config: {e}")))?;
                AlgorithmConfig::Intelligent {
                    sensitivity: raw.sensitivity,
                }
            }
            other => {
                return Err(invalid(format!("unknown algorithm type '{other}'")));
            }
        };
        Ok(Self {
            level: spec.level,
            config,
        })
    }

    /// 포인트를 평가합니다. 이상이면 탐지 메시지를 돌려줍니다.
    ///
    /// `prev`는 같은 차원 튜플의 직전 값(환비용), `intelligent`는 지능형
    /// 판정기 훅입니다.
    pub fn evaluate(
        &self,
        point: &DataPoint,
        prev: Option<f64>,
        intelligent: Option<&dyn IntelligentDetector>,
    ) -> Option<String> {
        match &self.config {
            AlgorithmConfig::Threshold(groups) => {
                for group in groups {
                    if group
                        .iter()
                        .all(|b| b.matches(point.value).unwrap_or(false))
                    {
                        let described: Vec<String> = group
                            .iter()
                            .map(|b| {
                                format!("value {} {} threshold {}", point.value, b.symbol(), b.threshold)
                            })
                            .collect();
                        return Some(described.join(" and "));
                    }
                }
                None
            }
            AlgorithmConfig::RangeThreshold { floor, ceil } => {
                if point.value < *floor || point.value > *ceil {
                    Some(format!(
                        "value {} outside range [{floor}, {ceil}]",
                        point.value
                    ))
                } else {
                    None
                }
            }
            AlgorithmConfig::SimpleRingRatio { floor, ceil } => {
                let prev = prev?;
                if prev == 0.0 {
                    return None;
                }
                let ratio = (point.value - prev) / prev * 100.0;
                if ratio > *ceil {
                    Some(format!("ring ratio {ratio:.1}% > {ceil}%"))
                } else if ratio < -*floor {
                    Some(format!("ring ratio {ratio:.1}% < -{floor}%"))
                } else {
                    None
                }
            }
            AlgorithmConfig::Intelligent { sensitivity } => {
                let hook = intelligent?;
                let (anomalous, score) = hook.detect(point, *sensitivity);
                anomalous.then(|| format!("intelligent detect score {score:.2}"))
            }
        }
    }
}
