//! Material catalog records and goods receipts

use chrono::Utc;

use crate::error::WorkflowError;
use crate::timestamp::{DateStamp, TimeStamp};
use crate::utils;

/// Catalog entry for one stocked material. Note there is no quantity field;
/// stock on hand is always derived from the material's ledger.
#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct Material {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub sku: String,
    #[n(4)]
    pub unit: String,
    #[n(5)]
    pub category: String,
    #[n(6)]
    pub reorder_level: i64,
    #[n(7)]
    pub unit_price: u64, // minor currency units
    #[n(8)]
    pub location: String,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

/// Draft for registering a material, validated on finalise.
#[derive(Debug, Default)]
pub struct MaterialDraft {
    name: Option<String>,
    description: Option<String>,
    sku: Option<String>,
    unit: Option<String>,
    category: Option<String>,
    reorder_level: i64,
    unit_price: u64,
    location: Option<String>,
}

impl MaterialDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_owned());
        self
    }
    pub fn set_sku(mut self, sku: &str) -> Self {
        self.sku = Some(sku.to_owned());
        self
    }
    pub fn set_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_owned());
        self
    }
    pub fn set_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_owned());
        self
    }
    pub fn set_reorder_level(mut self, level: i64) -> Self {
        self.reorder_level = level;
        self
    }
    pub fn set_unit_price(mut self, price: u64) -> Self {
        self.unit_price = price;
        self
    }
    pub fn set_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_owned());
        self
    }

    /// Checks required fields, then mints the catalog record with a fresh id.
    pub fn validate_and_finalise(self) -> anyhow::Result<Material> {
        let require = |field: Option<String>, name: &str| -> anyhow::Result<String> {
            match field {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(WorkflowError::Validation(format!("material {name} is required")).into()),
            }
        };

        let name = require(self.name, "name")?;
        let sku = require(self.sku, "sku")?;
        let unit = require(self.unit, "unit")?;
        let category = require(self.category, "category")?;

        if self.reorder_level < 0 {
            return Err(
                WorkflowError::Validation("reorder level must not be negative".into()).into(),
            );
        }

        Ok(Material {
            id: utils::material_id()?,
            name,
            description: self.description.unwrap_or_default(),
            sku,
            unit,
            category,
            reorder_level: self.reorder_level,
            unit_price: self.unit_price,
            location: self.location.unwrap_or_default(),
            created_at: TimeStamp::new(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, minicbor::Encode, minicbor::Decode)]
pub enum QualityStatus {
    #[n(0)]
    Accepted,
    #[n(1)]
    Damaged,
    #[n(2)]
    OnHold,
}

#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct ReceiptItem {
    #[n(0)]
    pub material_id: String,
    #[n(1)]
    pub quantity: i64,
    #[n(2)]
    pub unit_price: u64,
    #[n(3)]
    pub batch_number: Option<String>,
    #[n(4)]
    pub expiration_date: Option<DateStamp>,
}

/// Delivery from a vendor. Only Accepted receipts post to the ledger;
/// Damaged and OnHold receipts are recorded and post nothing until resolved.
#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct GoodsReceipt {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub vendor_id: String,
    #[n(2)]
    pub items: Vec<ReceiptItem>,
    #[n(3)]
    pub quality_status: QualityStatus,
    #[n(4)]
    pub received_by: String,
    #[n(5)]
    pub notes: Option<String>,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

impl GoodsReceipt {
    pub fn new(
        vendor_id: String,
        items: Vec<ReceiptItem>,
        quality_status: QualityStatus,
        received_by: String,
        notes: Option<String>,
    ) -> anyhow::Result<Self> {
        if items.is_empty() {
            return Err(WorkflowError::Validation("receipt has no items".into()).into());
        }
        for item in &items {
            if item.quantity <= 0 {
                return Err(WorkflowError::Validation(format!(
                    "receipt quantity for material {} must be positive",
                    item.material_id
                ))
                .into());
            }
        }

        Ok(Self {
            id: utils::receipt_id()?,
            vendor_id,
            items,
            quality_status,
            received_by,
            notes,
            created_at: TimeStamp::new(),
        })
    }
}
