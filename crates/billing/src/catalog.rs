//! Product catalog
//!
//! Maps provider product ids to the membership, plan type and credits they grant.
//! Supplied as JSON, either inline or from a file.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::models::{Membership, PlanType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCatalogEntry {
    pub product_id: String,
    pub membership: Membership,
    pub plan_type: PlanType,
    /// Base credits before any offer bonus
    pub credits: i64,
    /// List price in minor currency units
    pub price: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    entries: HashMap<String, ProductCatalogEntry>,
}

impl ProductCatalog {
    pub fn new(entries: impl IntoIterator<Item = ProductCatalogEntry>) -> BillingResult<Self> {
        let mut map = HashMap::new();
        for entry in entries {
            if entry.credits < 0 || entry.price < 0 {
                return Err(BillingError::Config(format!(
                    "product {} has negative credits or price",
                    entry.product_id
                )));
            }
            if let Some(previous) = map.insert(entry.product_id.clone(), entry) {
                return Err(BillingError::Config(format!(
                    "product {} listed twice",
                    previous.product_id
                )));
            }
        }
        Ok(Self { entries: map })
    }

    pub fn from_json(json: &str) -> BillingResult<Self> {
        let entries: Vec<ProductCatalogEntry> = serde_json::from_str(json)
            .map_err(|e| BillingError::Config(format!("invalid product catalog: {}", e)))?;
        Self::new(entries)
    }

    /// Load from `PRODUCT_CATALOG_PATH`, falling back to `PRODUCT_CATALOG_JSON`
    pub fn from_env() -> BillingResult<Self> {
        if let Ok(path) = env::var("PRODUCT_CATALOG_PATH") {
            let json = std::fs::read_to_string(&path).map_err(|e| {
                BillingError::Config(format!("cannot read product catalog {}: {}", path, e))
            })?;
            let catalog = Self::from_json(&json)?;
            tracing::info!(path = %path, products = catalog.len(), "Loaded product catalog");
            return Ok(catalog);
        }

        match env::var("PRODUCT_CATALOG_JSON") {
            Ok(json) => Self::from_json(&json),
            Err(_) => {
                tracing::warn!("No product catalog configured, every purchase will be dropped");
                Ok(Self::default())
            }
        }
    }

    pub fn get_product(&self, product_id: &str) -> BillingResult<&ProductCatalogEntry> {
        self.entries
            .get(product_id)
            .ok_or_else(|| BillingError::UnresolvedProduct(product_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
