//! Service layer API for store workflow operations
//!
//! `StoreService` is the single entry point for every workflow mutation:
//! catalog registration, goods receipts, the request lifecycle, manual
//! adjustments and stocktakes. Each operation loads the records it needs,
//! validates the transition, then persists everything it touched in one
//! sled batch, so a failed operation leaves no partial ledger entries.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use sled::Batch;
use tracing::info;

use crate::error::WorkflowError;
use crate::ledger::{EntryKind, LedgerEntry, MaterialLedger};
use crate::material::{GoodsReceipt, Material, MaterialDraft, QualityStatus, ReceiptItem};
use crate::report::{self, DashboardStats, LowStockItem};
use crate::request::{
    self, Actor, MaterialRequest, RequestEventKind, RequestItem, RequestStatus,
};
use crate::stocktake::{StockAdjustment, StocktakeReport, StocktakeSession, StocktakeStatus};
use crate::timestamp::DateStamp;

/// Workflow constraints the institution can tune.
#[derive(Debug, Clone)]
pub struct WorkflowPolicy {
    /// Reject submissions whose date-needed is already in the past.
    pub require_future_date_needed: bool,
    /// Permit issuing less than the requested quantity per item.
    pub allow_partial_issue: bool,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self {
            require_future_date_needed: true,
            allow_partial_issue: true,
        }
    }
}

pub struct StoreService {
    instance: Arc<sled::Db>,
    policy: WorkflowPolicy,
    // Serializes every check-then-append sequence so two concurrent
    // approvals cannot both observe the same availability. Reads stay
    // lock-free point-in-time snapshots.
    write_lock: Mutex<()>,
}

fn material_key(id: &str) -> String {
    format!("material/{id}")
}
fn sku_key(sku: &str) -> String {
    format!("sku/{sku}")
}
fn ledger_key(material_id: &str) -> String {
    format!("ledger/{material_id}")
}
fn request_key(id: &str) -> String {
    format!("request/{id}")
}
fn receipt_key(id: &str) -> String {
    format!("receipt/{id}")
}
fn stocktake_key(id: &str) -> String {
    format!("stocktake/{id}")
}
fn adjustment_key(id: &str) -> String {
    format!("adjustment/{id}")
}

impl StoreService {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self::with_policy(instance, WorkflowPolicy::default())
    }

    pub fn with_policy(instance: Arc<sled::Db>, policy: WorkflowPolicy) -> Self {
        Self {
            instance,
            policy,
            write_lock: Mutex::new(()),
        }
    }

    fn write_guard(&self) -> anyhow::Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("workflow write lock poisoned"))
    }

    fn fetch<T>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.instance.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Look up a material from the catalog
    pub fn material(&self, material_id: &str) -> anyhow::Result<Material> {
        match self.fetch(&material_key(material_id))? {
            Some(material) => Ok(material),
            None => {
                Err(WorkflowError::NotFound(format!("material {material_id} is not registered"))
                    .into())
            }
        }
    }

    pub fn find_material_by_sku(&self, sku: &str) -> anyhow::Result<Material> {
        match self.instance.get(sku_key(sku).as_bytes())? {
            Some(bytes) => {
                let material_id = String::from_utf8(bytes.to_vec())?;
                self.material(&material_id)
            }
            None => Err(WorkflowError::NotFound(format!("no material with sku {sku}")).into()),
        }
    }

    /// Load the ledger for a registered material, empty if nothing has been
    /// posted yet.
    fn load_ledger(&self, material_id: &str) -> anyhow::Result<MaterialLedger> {
        let material = self.material(material_id)?;

        Ok(self
            .fetch(&ledger_key(material_id))?
            .unwrap_or_else(|| MaterialLedger::new(material.id)))
    }

    /// Load a ledger into the per-operation cache exactly once, so an
    /// operation touching a material twice folds over its own appends.
    fn cached_ledger<'a>(
        &self,
        ledgers: &'a mut BTreeMap<String, MaterialLedger>,
        material_id: &str,
    ) -> anyhow::Result<&'a mut MaterialLedger> {
        if !ledgers.contains_key(material_id) {
            ledgers.insert(material_id.to_owned(), self.load_ledger(material_id)?);
        }
        ledgers
            .get_mut(material_id)
            .ok_or_else(|| anyhow::anyhow!("ledger cache lost entry for {material_id}"))
    }

    fn stage_ledgers(
        batch: &mut Batch,
        ledgers: &BTreeMap<String, MaterialLedger>,
    ) -> anyhow::Result<()> {
        for (material_id, ledger) in ledgers {
            batch.insert(ledger_key(material_id).into_bytes(), minicbor::to_vec(ledger)?);
        }
        Ok(())
    }

    pub fn load_request(&self, request_id: &str) -> anyhow::Result<MaterialRequest> {
        match self.fetch(&request_key(request_id))? {
            Some(request) => Ok(request),
            None => {
                Err(WorkflowError::NotFound(format!("request {request_id} does not exist")).into())
            }
        }
    }

    pub fn load_receipt(&self, receipt_id: &str) -> anyhow::Result<GoodsReceipt> {
        match self.fetch(&receipt_key(receipt_id))? {
            Some(receipt) => Ok(receipt),
            None => {
                Err(WorkflowError::NotFound(format!("receipt {receipt_id} does not exist")).into())
            }
        }
    }

    pub fn load_stocktake(&self, session_id: &str) -> anyhow::Result<StocktakeSession> {
        match self.fetch(&stocktake_key(session_id))? {
            Some(session) => Ok(session),
            None => Err(WorkflowError::NotFound(format!(
                "stocktake session {session_id} does not exist"
            ))
            .into()),
        }
    }

    /// Quantity physically on hand for a material.
    pub fn quantity_of(&self, material_id: &str) -> anyhow::Result<i64> {
        Ok(self.load_ledger(material_id)?.on_hand())
    }

    /// Quantity free to reserve or issue: on hand minus open holds.
    pub fn available_of(&self, material_id: &str) -> anyhow::Result<i64> {
        Ok(self.load_ledger(material_id)?.available())
    }

    /// Full movement history for a material, oldest first.
    pub fn ledger_of(&self, material_id: &str) -> anyhow::Result<Vec<LedgerEntry>> {
        Ok(self.load_ledger(material_id)?.entries)
    }

    /// Register a material in the catalog. SKUs are unique across the store.
    pub fn register_material(&self, draft: MaterialDraft) -> anyhow::Result<Material> {
        let material = draft.validate_and_finalise()?;

        let _guard = self.write_guard()?;

        if self.instance.get(sku_key(&material.sku).as_bytes())?.is_some() {
            return Err(WorkflowError::Validation(format!(
                "sku {} is already registered",
                material.sku
            ))
            .into());
        }

        let mut batch = Batch::default();
        batch.insert(
            material_key(&material.id).into_bytes(),
            minicbor::to_vec(&material)?,
        );
        batch.insert(
            sku_key(&material.sku).into_bytes(),
            material.id.as_bytes().to_vec(),
        );
        self.instance.apply_batch(batch)?;

        info!(material_id = %material.id, sku = %material.sku, "material registered");
        Ok(material)
    }

    /// Record a delivery from a vendor. Accepted receipts post one Receipt
    /// entry per item; Damaged and OnHold receipts are stored with no ledger
    /// effect until resolved.
    pub fn receive_goods(
        &self,
        vendor_id: &str,
        items: Vec<ReceiptItem>,
        quality_status: QualityStatus,
        notes: Option<&str>,
        actor: &Actor,
    ) -> anyhow::Result<GoodsReceipt> {
        if !actor.role.can_manage_stock() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not receive goods",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        let receipt = GoodsReceipt::new(
            vendor_id.to_owned(),
            items,
            quality_status,
            actor.user_id.clone(),
            notes.map(str::to_owned),
        )?;

        let mut ledgers = BTreeMap::new();
        // every received material must be registered, accepted or not
        for item in &receipt.items {
            self.cached_ledger(&mut ledgers, &item.material_id)?;
        }

        let mut batch = Batch::default();
        if receipt.quality_status == QualityStatus::Accepted {
            self.post_receipt_entries(&receipt, &mut ledgers, &actor.user_id)?;
            Self::stage_ledgers(&mut batch, &ledgers)?;
        }
        batch.insert(receipt_key(&receipt.id).into_bytes(), minicbor::to_vec(&receipt)?);
        self.instance.apply_batch(batch)?;

        info!(
            receipt_id = %receipt.id,
            quality = ?receipt.quality_status,
            "goods receipt recorded"
        );
        Ok(receipt)
    }

    /// Accept a previously Damaged or OnHold receipt and post the Receipt
    /// entries it was holding back.
    pub fn resolve_receipt(&self, receipt_id: &str, actor: &Actor) -> anyhow::Result<GoodsReceipt> {
        if !actor.role.can_manage_stock() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not resolve receipts",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        let mut receipt = self.load_receipt(receipt_id)?;
        if receipt.quality_status == QualityStatus::Accepted {
            return Err(WorkflowError::InvalidTransition(format!(
                "receipt {receipt_id} is already accepted"
            ))
            .into());
        }
        receipt.quality_status = QualityStatus::Accepted;

        let mut ledgers = BTreeMap::new();
        for item in &receipt.items {
            self.cached_ledger(&mut ledgers, &item.material_id)?;
        }
        self.post_receipt_entries(&receipt, &mut ledgers, &actor.user_id)?;

        let mut batch = Batch::default();
        Self::stage_ledgers(&mut batch, &ledgers)?;
        batch.insert(receipt_key(&receipt.id).into_bytes(), minicbor::to_vec(&receipt)?);
        self.instance.apply_batch(batch)?;

        info!(receipt_id = %receipt.id, "receipt resolved and posted");
        Ok(receipt)
    }

    fn post_receipt_entries(
        &self,
        receipt: &GoodsReceipt,
        ledgers: &mut BTreeMap<String, MaterialLedger>,
        actor_id: &str,
    ) -> anyhow::Result<()> {
        for item in &receipt.items {
            let ledger = self.cached_ledger(ledgers, &item.material_id)?;
            ledger.append(LedgerEntry::new(
                item.material_id.clone(),
                item.quantity,
                EntryKind::Receipt,
                receipt.id.clone(),
                actor_id.to_owned(),
            )?)?;
        }
        Ok(())
    }

    /// Manual stock correction: posts one Adjustment entry bringing on-hand
    /// to `new_quantity`, paired with an audit record.
    pub fn adjust_stock(
        &self,
        material_id: &str,
        new_quantity: i64,
        reason: &str,
        actor: &Actor,
    ) -> anyhow::Result<StockAdjustment> {
        if !actor.role.can_manage_stock() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not adjust stock",
                actor.role
            ))
            .into());
        }
        if new_quantity < 0 {
            return Err(
                WorkflowError::Validation("adjusted quantity must not be negative".into()).into(),
            );
        }

        let _guard = self.write_guard()?;

        let mut ledger = self.load_ledger(material_id)?;
        let previous = ledger.on_hand();
        if previous == new_quantity {
            return Err(WorkflowError::Validation(format!(
                "material {material_id} already has quantity {new_quantity}"
            ))
            .into());
        }

        let audit = StockAdjustment::new(
            material_id.to_owned(),
            previous,
            new_quantity,
            reason.to_owned(),
            actor.user_id.clone(),
        )?;
        ledger.append(LedgerEntry::new(
            material_id.to_owned(),
            new_quantity - previous,
            EntryKind::Adjustment,
            audit.id.clone(),
            actor.user_id.clone(),
        )?)?;

        let mut batch = Batch::default();
        batch.insert(ledger_key(material_id).into_bytes(), minicbor::to_vec(&ledger)?);
        batch.insert(adjustment_key(&audit.id).into_bytes(), minicbor::to_vec(&audit)?);
        self.instance.apply_batch(batch)?;

        info!(material_id, previous, new_quantity, "stock adjusted");
        Ok(audit)
    }

    /// Open a new draft request owned by the calling requester.
    pub fn create_request(
        &self,
        actor: &Actor,
        items: Vec<RequestItem>,
        purpose: &str,
        date_needed: DateStamp,
    ) -> anyhow::Result<MaterialRequest> {
        if !actor.role.can_create_request() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not create requests",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        for item in &items {
            self.material(&item.material_id)?;
        }

        let request = MaterialRequest::new(
            actor.user_id.clone(),
            actor.department.clone().unwrap_or_default(),
            items,
            purpose.to_owned(),
            date_needed,
        )?;
        self.save_request(&request)?;

        info!(request_id = %request.id, requester = %actor.user_id, "request drafted");
        Ok(request)
    }

    /// Replace the item list of a draft. Only the requester may edit, and
    /// only while the request has not been submitted.
    pub fn revise_request_items(
        &self,
        request_id: &str,
        items: Vec<RequestItem>,
        actor: &Actor,
    ) -> anyhow::Result<MaterialRequest> {
        let _guard = self.write_guard()?;

        let mut request = self.load_request(request_id)?;
        self.ensure_requester(&request, actor)?;
        if request.status() != RequestStatus::Draft {
            return Err(WorkflowError::InvalidTransition(format!(
                "request {request_id} items may only be edited while draft"
            ))
            .into());
        }

        request::validate_items(&items)?;
        for item in &items {
            self.material(&item.material_id)?;
        }

        request.items = items;
        request.record(RequestEventKind::ItemsRevised, &actor.user_id);
        self.save_request(&request)?;

        Ok(request)
    }

    /// draft -> submitted. Requires at least one item and a workable
    /// date-needed.
    pub fn submit_request(
        &self,
        request_id: &str,
        actor: &Actor,
    ) -> anyhow::Result<MaterialRequest> {
        let _guard = self.write_guard()?;

        let mut request = self.load_request(request_id)?;
        self.ensure_requester(&request, actor)?;
        request.ensure_transition(RequestStatus::Submitted)?;

        if request.items.is_empty() {
            return Err(WorkflowError::Validation(
                "a request must carry at least one item to be submitted".into(),
            )
            .into());
        }
        if self.policy.require_future_date_needed && request.date_needed < DateStamp::today() {
            return Err(
                WorkflowError::Validation("date needed is already in the past".into()).into(),
            );
        }

        request.record(RequestEventKind::Submitted, &actor.user_id);
        self.save_request(&request)?;

        info!(request_id = %request.id, "request submitted");
        Ok(request)
    }

    /// submitted -> approved. Places one reservation hold per item; if any
    /// item lacks availability nothing is persisted at all.
    pub fn approve_request(
        &self,
        request_id: &str,
        actor: &Actor,
    ) -> anyhow::Result<MaterialRequest> {
        if !actor.role.can_approve() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not approve requests",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        let mut request = self.load_request(request_id)?;
        request.ensure_transition(RequestStatus::Approved)?;

        let mut ledgers = BTreeMap::new();
        for item in &request.items {
            let ledger = self.cached_ledger(&mut ledgers, &item.material_id)?;
            ledger.append(LedgerEntry::new(
                item.material_id.clone(),
                item.requested_quantity,
                EntryKind::ReservationHold,
                request.id.clone(),
                actor.user_id.clone(),
            )?)?;
        }
        request.record(RequestEventKind::Approved, &actor.user_id);

        let mut batch = Batch::default();
        Self::stage_ledgers(&mut batch, &ledgers)?;
        batch.insert(request_key(&request.id).into_bytes(), minicbor::to_vec(&request)?);
        self.instance.apply_batch(batch)?;

        info!(request_id = %request.id, approver = %actor.user_id, "request approved");
        Ok(request)
    }

    /// submitted -> rejected (no ledger effect) or approved -> rejected
    /// (releases every hold the approval placed).
    pub fn reject_request(
        &self,
        request_id: &str,
        actor: &Actor,
    ) -> anyhow::Result<MaterialRequest> {
        if !actor.role.can_approve() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not reject requests",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        let mut request = self.load_request(request_id)?;
        request.ensure_transition(RequestStatus::Rejected)?;

        let mut ledgers = BTreeMap::new();
        if request.status() == RequestStatus::Approved {
            for item in &request.items {
                let ledger = self.cached_ledger(&mut ledgers, &item.material_id)?;
                let Some(held) = ledger.hold_for(&request.id) else {
                    return Err(WorkflowError::Validation(format!(
                        "approved request {request_id} has no hold on material {}",
                        item.material_id
                    ))
                    .into());
                };
                ledger.append(LedgerEntry::new(
                    item.material_id.clone(),
                    -held,
                    EntryKind::ReservationRelease,
                    request.id.clone(),
                    actor.user_id.clone(),
                )?)?;
            }
        }
        request.record(RequestEventKind::Rejected, &actor.user_id);

        let mut batch = Batch::default();
        Self::stage_ledgers(&mut batch, &ledgers)?;
        batch.insert(request_key(&request.id).into_bytes(), minicbor::to_vec(&request)?);
        self.instance.apply_batch(batch)?;

        info!(request_id = %request.id, "request rejected");
        Ok(request)
    }

    /// approved -> issued. For every item the hold is released and the
    /// issued quantity (possibly less than requested, possibly zero) is
    /// deducted from on-hand; the un-issued remainder simply returns to
    /// availability with the release.
    pub fn issue_request(
        &self,
        request_id: &str,
        issued: &[(String, i64)],
        actor: &Actor,
    ) -> anyhow::Result<MaterialRequest> {
        if !actor.role.can_issue() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not issue requests",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        let mut request = self.load_request(request_id)?;
        request.ensure_transition(RequestStatus::Issued)?;

        let mut issued_map: BTreeMap<&str, i64> = BTreeMap::new();
        for (material_id, quantity) in issued {
            let Some(item) = request
                .items
                .iter()
                .find(|i| i.material_id == *material_id)
            else {
                return Err(WorkflowError::Validation(format!(
                    "material {material_id} is not part of request {request_id}"
                ))
                .into());
            };
            if *quantity < 0 {
                return Err(WorkflowError::Validation(
                    "issued quantity must not be negative".into(),
                )
                .into());
            }
            if *quantity > item.requested_quantity {
                return Err(WorkflowError::Validation(format!(
                    "issued quantity {quantity} exceeds requested {} for material {material_id}",
                    item.requested_quantity
                ))
                .into());
            }
            if issued_map.insert(material_id.as_str(), *quantity).is_some() {
                return Err(WorkflowError::Validation(format!(
                    "material {material_id} listed twice in the issue"
                ))
                .into());
            }
        }

        if !self.policy.allow_partial_issue {
            for item in &request.items {
                let quantity = issued_map
                    .get(item.material_id.as_str())
                    .copied()
                    .unwrap_or(0);
                if quantity != item.requested_quantity {
                    return Err(WorkflowError::Validation(format!(
                        "partial issue is disabled: material {} requested {} but issuing {quantity}",
                        item.material_id, item.requested_quantity
                    ))
                    .into());
                }
            }
        }

        let mut ledgers = BTreeMap::new();
        let request_id_owned = request.id.clone();
        for item in &mut request.items {
            let quantity = issued_map
                .get(item.material_id.as_str())
                .copied()
                .unwrap_or(0);

            let ledger = self.cached_ledger(&mut ledgers, &item.material_id)?;
            let Some(held) = ledger.hold_for(&request_id_owned) else {
                return Err(WorkflowError::Validation(format!(
                    "approved request {request_id} has no hold on material {}",
                    item.material_id
                ))
                .into());
            };
            ledger.append(LedgerEntry::new(
                item.material_id.clone(),
                -held,
                EntryKind::ReservationRelease,
                request_id_owned.clone(),
                actor.user_id.clone(),
            )?)?;
            if quantity > 0 {
                ledger.append(LedgerEntry::new(
                    item.material_id.clone(),
                    -quantity,
                    EntryKind::Issue,
                    request_id_owned.clone(),
                    actor.user_id.clone(),
                )?)?;
            }
            item.issued_quantity = Some(quantity);
        }
        request.record(RequestEventKind::Issued, &actor.user_id);

        let mut batch = Batch::default();
        Self::stage_ledgers(&mut batch, &ledgers)?;
        batch.insert(request_key(&request.id).into_bytes(), minicbor::to_vec(&request)?);
        self.instance.apply_batch(batch)?;

        info!(request_id = %request.id, issuer = %actor.user_id, "request issued");
        Ok(request)
    }

    /// Open a counting session over the materials of one location,
    /// optionally narrowed to a category, snapshotting their current system
    /// quantities.
    pub fn start_stocktake(
        &self,
        location: &str,
        category_filter: Option<&str>,
        actor: &Actor,
    ) -> anyhow::Result<StocktakeSession> {
        if !actor.role.can_manage_stock() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not run stocktakes",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        let mut snapshot = BTreeMap::new();
        for kv in self.instance.scan_prefix(b"material/") {
            let (_key, value) = kv?;
            let material: Material = minicbor::decode(value.as_ref())?;

            if material.location != location {
                continue;
            }
            if let Some(category) = category_filter {
                if material.category != category {
                    continue;
                }
            }

            let on_hand = self
                .fetch::<MaterialLedger>(&ledger_key(&material.id))?
                .map(|l| l.on_hand())
                .unwrap_or(0);
            snapshot.insert(material.id, on_hand);
        }

        let session = StocktakeSession::new(
            location.to_owned(),
            category_filter.map(str::to_owned),
            snapshot,
            actor.user_id.clone(),
        )?;
        self.instance.insert(
            stocktake_key(&session.id).into_bytes(),
            minicbor::to_vec(&session)?,
        )?;

        info!(session_id = %session.id, location, "stocktake started");
        Ok(session)
    }

    /// Store a counted quantity against an in-progress session. The ledger
    /// is untouched until the session completes.
    pub fn record_count(
        &self,
        session_id: &str,
        material_id: &str,
        counted: i64,
        actor: &Actor,
    ) -> anyhow::Result<StocktakeSession> {
        if !actor.role.can_manage_stock() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not run stocktakes",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        let mut session = self.load_stocktake(session_id)?;
        session.record_count(material_id, counted)?;
        self.instance.insert(
            stocktake_key(&session.id).into_bytes(),
            minicbor::to_vec(&session)?,
        )?;

        Ok(session)
    }

    /// Complete a session: for every counted material whose count differs
    /// from the system quantity at completion time, post one Adjustment
    /// entry and one audit record. Uncounted materials are left untouched
    /// and listed in the report.
    pub fn complete_stocktake(
        &self,
        session_id: &str,
        actor: &Actor,
    ) -> anyhow::Result<StocktakeReport> {
        if !actor.role.can_manage_stock() {
            return Err(WorkflowError::InvalidTransition(format!(
                "role {:?} may not run stocktakes",
                actor.role
            ))
            .into());
        }

        let _guard = self.write_guard()?;

        let mut session = self.load_stocktake(session_id)?;
        if session.status != StocktakeStatus::InProgress {
            return Err(WorkflowError::InvalidTransition(format!(
                "stocktake session {session_id} is not in progress"
            ))
            .into());
        }

        let mut ledgers = BTreeMap::new();
        let mut adjustments = Vec::new();
        let mut batch = Batch::default();

        for (material_id, counted) in &session.counts {
            let ledger = self.cached_ledger(&mut ledgers, material_id)?;
            // reconcile against the quantity now, not the snapshot: stock
            // may have moved while the count was underway
            let system = ledger.on_hand();
            if *counted == system {
                continue;
            }

            let audit = StockAdjustment::new(
                material_id.clone(),
                system,
                *counted,
                format!("stocktake {}", session.id),
                actor.user_id.clone(),
            )?;
            ledger.append(LedgerEntry::new(
                material_id.clone(),
                counted - system,
                EntryKind::Adjustment,
                audit.id.clone(),
                actor.user_id.clone(),
            )?)?;
            batch.insert(adjustment_key(&audit.id).into_bytes(), minicbor::to_vec(&audit)?);
            adjustments.push(audit);
        }

        session.status = StocktakeStatus::Completed;
        let not_counted = session.not_counted();

        Self::stage_ledgers(&mut batch, &ledgers)?;
        batch.insert(stocktake_key(&session.id).into_bytes(), minicbor::to_vec(&session)?);
        self.instance.apply_batch(batch)?;

        info!(
            session_id = %session.id,
            adjustments = adjustments.len(),
            "stocktake completed"
        );
        Ok(StocktakeReport {
            session_id: session.id,
            adjustments,
            not_counted,
        })
    }

    /// Headline numbers for the dashboard, folded from the catalog, ledgers
    /// and request records.
    pub fn dashboard_stats(&self) -> anyhow::Result<DashboardStats> {
        let mut stats = DashboardStats::default();
        let cutoff = Utc::now() - chrono::Duration::days(7);

        for kv in self.instance.scan_prefix(b"material/") {
            let (_key, value) = kv?;
            let material: Material = minicbor::decode(value.as_ref())?;
            let ledger = self
                .fetch::<MaterialLedger>(&ledger_key(&material.id))?
                .unwrap_or_else(|| MaterialLedger::new(material.id.clone()));

            let on_hand = ledger.on_hand();
            stats.total_materials += 1;
            if report::is_low_stock(&material, on_hand) {
                stats.low_stock_items += 1;
            }
            stats.total_value += u64::try_from(on_hand).unwrap_or(0) * material.unit_price;
            stats.recent_transactions += ledger
                .entries
                .iter()
                .filter(|e| e.timestamp.to_datetime_utc() >= cutoff)
                .count() as u64;
        }

        for kv in self.instance.scan_prefix(b"request/") {
            let (_key, value) = kv?;
            let request: MaterialRequest = minicbor::decode(value.as_ref())?;
            if request.status() == RequestStatus::Submitted {
                stats.pending_requests += 1;
            }
        }

        Ok(stats)
    }

    /// Materials whose on-hand quantity has fallen to or below their
    /// reorder level.
    pub fn low_stock(&self) -> anyhow::Result<Vec<LowStockItem>> {
        let mut items = Vec::new();

        for kv in self.instance.scan_prefix(b"material/") {
            let (_key, value) = kv?;
            let material: Material = minicbor::decode(value.as_ref())?;
            let on_hand = self
                .fetch::<MaterialLedger>(&ledger_key(&material.id))?
                .map(|l| l.on_hand())
                .unwrap_or(0);

            if report::is_low_stock(&material, on_hand) {
                items.push(report::low_stock_item(&material, on_hand));
            }
        }

        Ok(items)
    }

    fn ensure_requester(&self, request: &MaterialRequest, actor: &Actor) -> anyhow::Result<()> {
        if request.requester_id != actor.user_id {
            return Err(WorkflowError::InvalidTransition(format!(
                "request {} is owned by {}, not {}",
                request.id, request.requester_id, actor.user_id
            ))
            .into());
        }
        Ok(())
    }

    fn save_request(&self, request: &MaterialRequest) -> anyhow::Result<()> {
        self.instance.insert(
            request_key(&request.id).into_bytes(),
            minicbor::to_vec(request)?,
        )?;
        Ok(())
    }
}
