/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! Static catalog of the temple model tiers and their support files.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Quality tier identifiers, ordered tiniest to largest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantId {
    Tiny,
    Low,
    Compressed,
    Original,
}

impl VariantId {
    pub const ALL: [VariantId; 4] = [
        VariantId::Tiny,
        VariantId::Low,
        VariantId::Compressed,
        VariantId::Original,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantId::Tiny => "tiny",
            VariantId::Low => "low",
            VariantId::Compressed => "compressed",
            VariantId::Original => "original",
        }
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiny" => Ok(VariantId::Tiny),
            "low" => Ok(VariantId::Low),
            "compressed" => Ok(VariantId::Compressed),
            "original" => Ok(VariantId::Original),
            other => Err(format!("unknown model variant '{}'", other)),
        }
    }
}

/// One quality tier of the temple model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetVariant {
    pub id: VariantId,
    /// Fully resolved URL
    pub url: String,
    /// Approximate size in bytes, used for ordering and display
    pub approx_bytes: u64,
    pub label: &'static str,
}

const MB: u64 = 1024 * 1024;

const VARIANT_TABLE: [(VariantId, &str, u64, &str); 4] = [
    (VariantId::Tiny, "/models/temple_tiny.glb", 49 * MB, "Ultra-low res"),
    (VariantId::Low, "/models/temple_low.glb", 62 * MB, "Low resolution"),
    (VariantId::Compressed, "/models/temple_draco.glb", 620 * MB, "Compressed HD"),
    (VariantId::Original, "/models/temple_opt.glb", 1126 * MB, "Original HD"),
];

/// Decoder and transcoder files the viewer needs before any model parses
pub const SUPPORT_PATHS: [&str; 4] = [
    "/draco/draco_decoder.js",
    "/draco/draco_decoder.wasm",
    "/basis/basis_transcoder.js",
    "/basis/basis_transcoder.wasm",
];

pub const SKYBOX_PATH: &str = "/textures/skybox.jpg";

/// The fixed, ordered set of variants plus support files, resolved
/// against one base URL.
#[derive(Debug, Clone)]
pub struct AssetCatalog {
    base: Url,
    variants: Vec<AssetVariant>,
}

impl AssetCatalog {
    pub fn new(base_url: &str) -> Result<Self, url::ParseError> {
        let base = Url::parse(base_url)?;
        let variants = VARIANT_TABLE
            .iter()
            .map(|(id, path, size, label)| {
                Ok(AssetVariant {
                    id: *id,
                    url: base.join(path)?.to_string(),
                    approx_bytes: *size,
                    label: *label,
                })
            })
            .collect::<Result<Vec<_>, url::ParseError>>()?;

        Ok(Self { base, variants })
    }

    /// Variants, tiniest first
    pub fn variants(&self) -> &[AssetVariant] {
        &self.variants
    }

    pub fn get(&self, id: VariantId) -> &AssetVariant {
        // VARIANT_TABLE holds every id in declaration order
        &self.variants[id as usize]
    }

    pub fn smallest(&self) -> &AssetVariant {
        self.get(VariantId::Tiny)
    }

    pub fn by_url(&self, url: &str) -> Option<&AssetVariant> {
        self.variants.iter().find(|v| v.url == url)
    }

    /// Resolve a site-relative path against the base URL
    pub fn resolve(&self, path: &str) -> Result<String, url::ParseError> {
        Ok(self.base.join(path)?.to_string())
    }

    pub fn support_urls(&self) -> Vec<String> {
        SUPPORT_PATHS
            .iter()
            .filter_map(|p| self.resolve(p).ok())
            .collect()
    }

    pub fn skybox_url(&self) -> Option<String> {
        self.resolve(SKYBOX_PATH).ok()
    }

    /// Smallest model plus decoder files, cached eagerly by the proxy
    pub fn always_available(&self) -> Vec<String> {
        let mut urls = vec![self.smallest().url.clone()];
        urls.extend(self.support_urls());
        urls
    }
}
