//! Reporting folds over the catalog and ledger
//!
//! Plain data for a dashboard to render; no formatting or charting here.

use crate::material::Material;

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct DashboardStats {
    pub total_materials: u64,
    pub low_stock_items: u64,
    pub pending_requests: u64,
    /// Sum of on-hand quantity times unit price, in minor currency units.
    pub total_value: u64,
    /// Ledger entries posted in the last seven days.
    pub recent_transactions: u64,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LowStockItem {
    pub material_id: String,
    pub name: String,
    pub sku: String,
    pub on_hand: i64,
    pub reorder_level: i64,
}

pub fn is_low_stock(material: &Material, on_hand: i64) -> bool {
    on_hand <= material.reorder_level
}

pub fn low_stock_item(material: &Material, on_hand: i64) -> LowStockItem {
    LowStockItem {
        material_id: material.id.clone(),
        name: material.name.clone(),
        sku: material.sku.clone(),
        on_hand,
        reorder_level: material.reorder_level,
    }
}
