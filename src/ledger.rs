//! Append-only inventory ledger
//!
//! On-hand stock is never stored as a flat counter. Each material carries a
//! log of signed entries; the quantity on hand is a fold over that log, and
//! the quantity available further subtracts any reservation holds that have
//! not been released. Entries are only ever appended, so the log doubles as
//! the audit trail and corrections are new offsetting entries.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::WorkflowError;
use crate::timestamp::TimeStamp;
use crate::utils;

#[derive(Debug, PartialEq, Eq, Clone, Copy, minicbor::Encode, minicbor::Decode)]
pub enum EntryKind {
    #[n(0)]
    Receipt,
    #[n(1)]
    Issue,
    #[n(2)]
    Adjustment,
    #[n(3)]
    ReservationHold,
    #[n(4)]
    ReservationRelease,
}

/// One immutable movement of stock. `reference_id` points at the request,
/// receipt or adjustment record that caused it.
#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct LedgerEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub material_id: String,
    #[n(2)]
    pub delta: i64,
    #[n(3)]
    pub kind: EntryKind,
    #[n(4)]
    pub reference_id: String,
    #[n(5)]
    pub timestamp: TimeStamp<Utc>,
    #[n(6)]
    pub actor_id: String,
}

impl LedgerEntry {
    pub fn new(
        material_id: String,
        delta: i64,
        kind: EntryKind,
        reference_id: String,
        actor_id: String,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::entry_id()?,
            material_id,
            delta,
            kind,
            reference_id,
            timestamp: TimeStamp::new(),
            actor_id,
        })
    }
}

/// The full entry log for one material, stored as a single record and saved
/// whole after every append.
#[derive(Debug, Default, Clone, minicbor::Encode, minicbor::Decode)]
pub struct MaterialLedger {
    #[n(0)]
    pub material_id: String,
    #[n(1)]
    pub entries: Vec<LedgerEntry>,
}

impl MaterialLedger {
    pub fn new(material_id: String) -> Self {
        Self {
            material_id,
            entries: vec![],
        }
    }

    /// Quantity physically on hand: the sum of Receipt, Issue and Adjustment
    /// deltas. Holds do not move stock, so they are excluded here.
    pub fn on_hand(&self) -> i64 {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EntryKind::Receipt | EntryKind::Issue | EntryKind::Adjustment
                )
            })
            .map(|e| e.delta)
            .sum()
    }

    /// Holds that have been placed and not yet released, keyed by the
    /// reference (request) that placed them.
    pub fn open_holds(&self) -> BTreeMap<&str, i64> {
        let mut holds: BTreeMap<&str, i64> = BTreeMap::new();

        for entry in &self.entries {
            match entry.kind {
                EntryKind::ReservationHold => {
                    *holds.entry(entry.reference_id.as_str()).or_default() += entry.delta;
                }
                EntryKind::ReservationRelease => {
                    holds.remove(entry.reference_id.as_str());
                }
                _ => {}
            }
        }

        holds
    }

    pub fn hold_for(&self, reference_id: &str) -> Option<i64> {
        self.open_holds().get(reference_id).copied()
    }

    pub fn held(&self) -> i64 {
        self.open_holds().values().sum()
    }

    /// Quantity free to reserve or issue: on hand minus open holds.
    pub fn available(&self) -> i64 {
        self.on_hand() - self.held()
    }

    /// Append an entry, refusing any append that would break the fold
    /// invariants. Nothing is persisted here; the caller saves the whole
    /// ledger once every append in the operation has been accepted.
    pub fn append(&mut self, entry: LedgerEntry) -> Result<(), WorkflowError> {
        if entry.material_id != self.material_id {
            return Err(WorkflowError::Validation(format!(
                "entry for material {} appended to ledger of {}",
                entry.material_id, self.material_id
            )));
        }

        match entry.kind {
            EntryKind::Receipt => {
                if entry.delta <= 0 {
                    return Err(WorkflowError::Validation(
                        "receipt entries must carry a positive delta".into(),
                    ));
                }
            }
            EntryKind::Issue => {
                if entry.delta >= 0 {
                    return Err(WorkflowError::Validation(
                        "issue entries must carry a negative delta".into(),
                    ));
                }
                if self.on_hand() + entry.delta < 0 {
                    return Err(WorkflowError::InsufficientStock {
                        material_id: self.material_id.clone(),
                        requested: -entry.delta,
                        available: self.on_hand(),
                    });
                }
            }
            // Adjustments may go either way; stocktake counts are
            // non-negative so the fold cannot be driven below zero.
            EntryKind::Adjustment => {}
            EntryKind::ReservationHold => {
                if entry.delta <= 0 {
                    return Err(WorkflowError::Validation(
                        "hold entries must carry a positive delta".into(),
                    ));
                }
                if self.available() < entry.delta {
                    return Err(WorkflowError::InsufficientStock {
                        material_id: self.material_id.clone(),
                        requested: entry.delta,
                        available: self.available(),
                    });
                }
            }
            EntryKind::ReservationRelease => {
                let Some(held) = self.hold_for(&entry.reference_id) else {
                    return Err(WorkflowError::Validation(format!(
                        "no open hold for reference {}",
                        entry.reference_id
                    )));
                };
                if entry.delta != -held {
                    return Err(WorkflowError::Validation(format!(
                        "release of {} does not match open hold of {held}",
                        -entry.delta
                    )));
                }
            }
        }

        self.entries.push(entry);
        Ok(())
    }
}
