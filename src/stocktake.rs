//! Stocktake sessions and stock adjustments

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::WorkflowError;
use crate::timestamp::TimeStamp;
use crate::utils;

#[derive(Debug, PartialEq, Eq, Clone, Copy, minicbor::Encode, minicbor::Decode)]
pub enum StocktakeStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    InProgress,
    #[n(2)]
    Completed,
}

/// A counting session over the materials of one location. The snapshot fixes
/// which materials are in scope; counts are recorded against it and only
/// touch the ledger when the session completes.
#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct StocktakeSession {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub location: String,
    #[n(2)]
    pub category_filter: Option<String>,
    /// material id -> system quantity when the session started
    #[n(3)]
    pub snapshot: BTreeMap<String, i64>,
    /// material id -> counted quantity
    #[n(4)]
    pub counts: BTreeMap<String, i64>,
    #[n(5)]
    pub status: StocktakeStatus,
    #[n(6)]
    pub started_by: String,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

impl StocktakeSession {
    pub fn new(
        location: String,
        category_filter: Option<String>,
        snapshot: BTreeMap<String, i64>,
        started_by: String,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::stocktake_id()?,
            location,
            category_filter,
            snapshot,
            counts: BTreeMap::new(),
            status: StocktakeStatus::InProgress,
            started_by,
            created_at: TimeStamp::new(),
        })
    }

    /// Stores a counted value. Counting never mutates the ledger; deltas are
    /// only posted at completion.
    pub fn record_count(&mut self, material_id: &str, counted: i64) -> Result<(), WorkflowError> {
        if self.status != StocktakeStatus::InProgress {
            return Err(WorkflowError::InvalidTransition(format!(
                "session {} is not in progress",
                self.id
            )));
        }
        if counted < 0 {
            return Err(WorkflowError::Validation(
                "counted quantity must not be negative".into(),
            ));
        }
        if !self.snapshot.contains_key(material_id) {
            return Err(WorkflowError::NotFound(format!(
                "material {material_id} is not in the scope of session {}",
                self.id
            )));
        }

        self.counts.insert(material_id.to_owned(), counted);
        Ok(())
    }

    /// Materials in scope that never received a count.
    pub fn not_counted(&self) -> Vec<String> {
        self.snapshot
            .keys()
            .filter(|id| !self.counts.contains_key(*id))
            .cloned()
            .collect()
    }
}

/// Audit record paired with each Adjustment ledger entry.
#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct StockAdjustment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub material_id: String,
    #[n(2)]
    pub previous_quantity: i64,
    #[n(3)]
    pub new_quantity: i64,
    #[n(4)]
    pub reason: String,
    #[n(5)]
    pub adjusted_by: String,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

impl StockAdjustment {
    pub fn new(
        material_id: String,
        previous_quantity: i64,
        new_quantity: i64,
        reason: String,
        adjusted_by: String,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::adjustment_id()?,
            material_id,
            previous_quantity,
            new_quantity,
            reason,
            adjusted_by,
            created_at: TimeStamp::new(),
        })
    }
}

/// Outcome of completing a session: the adjustments that were posted and the
/// in-scope materials that were never counted.
#[derive(Debug, Clone)]
pub struct StocktakeReport {
    pub session_id: String,
    pub adjustments: Vec<StockAdjustment>,
    pub not_counted: Vec<String>,
}
