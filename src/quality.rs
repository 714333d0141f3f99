/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! Connection-aware selection of the first model tier to fetch.

use crate::assets::{AssetCatalog, AssetVariant, VariantId};
use regex::{Regex, RegexBuilder};
use std::str::FromStr;
use tracing::debug;
use url::Url;

/// Default user-agent pattern for phones and tablets
pub const DEFAULT_MOBILE_PATTERN: &str =
    "Android|webOS|iPhone|iPad|iPod|BlackBerry|IEMobile|Opera Mini";

/// Effective connection type as reported by the Network Information API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveType {
    Slow2g,
    TwoG,
    ThreeG,
    FourG,
}

impl FromStr for EffectiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slow-2g" => Ok(EffectiveType::Slow2g),
            "2g" => Ok(EffectiveType::TwoG),
            "3g" => Ok(EffectiveType::ThreeG),
            "4g" => Ok(EffectiveType::FourG),
            other => Err(format!("unknown effective type '{}'", other)),
        }
    }
}

/// Network signal. Absence of the API is its own state, not a null.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum NetworkInfo {
    #[default]
    Unknown,
    Known {
        effective_type: Option<EffectiveType>,
        /// Measured downlink in Mbps; 0 or absent means not measured
        downlink_mbps: Option<f64>,
    },
}

impl NetworkInfo {
    /// Build from optional CLI/env inputs; both absent means unknown
    pub fn from_parts(effective_type: Option<EffectiveType>, downlink_mbps: Option<f64>) -> Self {
        if effective_type.is_none() && downlink_mbps.is_none() {
            NetworkInfo::Unknown
        } else {
            NetworkInfo::Known {
                effective_type,
                downlink_mbps,
            }
        }
    }

    /// Number of parallel chunk streams suited to this connection
    pub fn default_streams(&self) -> usize {
        match self {
            NetworkInfo::Known {
                effective_type: Some(EffectiveType::FourG),
                ..
            } => 6,
            NetworkInfo::Known {
                effective_type: Some(EffectiveType::ThreeG),
                ..
            } => 4,
            _ => 2,
        }
    }
}

/// Manual quality override, e.g. `?model=original`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityOverride(pub VariantId);

impl QualityOverride {
    /// Read the `model` query parameter; unknown values are ignored
    pub fn from_page_url(url: &Url) -> Option<Self> {
        url.query_pairs()
            .find(|(k, _)| k == "model")
            .and_then(|(_, v)| v.parse::<VariantId>().ok())
            .map(QualityOverride)
    }
}

/// Everything the selector looks at
#[derive(Debug, Clone, Default)]
pub struct ClientSignals {
    pub manual_override: Option<QualityOverride>,
    pub save_data: bool,
    pub user_agent: String,
    pub network: NetworkInfo,
}

/// Why a variant was chosen (logged and shown by the CLI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    ManualOverride,
    SaveData,
    MobileDevice,
    VerySlowConnection,
    SlowConnection,
    MediumConnection,
    FastConnection,
    UnknownConnection,
}

/// Picks exactly one variant to fetch first
#[derive(Debug, Clone)]
pub struct QualitySelector {
    catalog: AssetCatalog,
    mobile_pattern: Regex,
}

impl QualitySelector {
    pub fn new(catalog: AssetCatalog, mobile_pattern: &str) -> Result<Self, regex::Error> {
        let mobile_pattern = RegexBuilder::new(mobile_pattern)
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            catalog,
            mobile_pattern,
        })
    }

    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }

    pub fn select(&self, signals: &ClientSignals) -> &AssetVariant {
        let (id, reason) = self.decide(signals);
        debug!(variant = %id, ?reason, network = ?signals.network, "model selection");
        self.catalog.get(id)
    }

    /// The policy itself, first match wins
    pub fn decide(&self, signals: &ClientSignals) -> (VariantId, SelectionReason) {
        if let Some(QualityOverride(id)) = signals.manual_override {
            return (id, SelectionReason::ManualOverride);
        }

        if signals.save_data {
            return (VariantId::Tiny, SelectionReason::SaveData);
        }

        if self.mobile_pattern.is_match(&signals.user_agent) {
            return (VariantId::Low, SelectionReason::MobileDevice);
        }

        match signals.network {
            NetworkInfo::Known {
                effective_type,
                downlink_mbps,
            } => {
                let downlink_below = |limit: f64| match downlink_mbps {
                    Some(d) if d > 0.0 => d < limit,
                    _ => false,
                };

                if effective_type == Some(EffectiveType::Slow2g) || downlink_below(0.5) {
                    (VariantId::Tiny, SelectionReason::VerySlowConnection)
                } else if effective_type == Some(EffectiveType::TwoG) || downlink_below(2.0) {
                    (VariantId::Low, SelectionReason::SlowConnection)
                } else if effective_type == Some(EffectiveType::ThreeG) || downlink_below(10.0) {
                    (VariantId::Compressed, SelectionReason::MediumConnection)
                } else {
                    // Original is only reachable through an override
                    (VariantId::Compressed, SelectionReason::FastConnection)
                }
            }
            NetworkInfo::Unknown => (VariantId::Low, SelectionReason::UnknownConnection),
        }
    }
}
