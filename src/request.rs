//! Material requests and their lifecycle state machine
//!
//! A request never stores its status as a mutable field. It keeps an
//! append-only history of lifecycle events and derives the current status by
//! folding that history, so the audit trail and the state machine can never
//! disagree.

use chrono::Utc;

use crate::error::WorkflowError;
use crate::timestamp::{DateStamp, TimeStamp};
use crate::utils;

/// Roles supplied by the identity provider. The engine trusts the role it is
/// given and performs no authentication of its own.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Role {
    Admin,
    StoreKeeper,
    DepartmentHead,
    Staff,
    Management,
}

impl Role {
    pub fn parse(role: &str) -> Result<Self, WorkflowError> {
        match role {
            "admin" => Ok(Self::Admin),
            "store_keeper" => Ok(Self::StoreKeeper),
            "department_head" => Ok(Self::DepartmentHead),
            "staff" => Ok(Self::Staff),
            "management" => Ok(Self::Management),
            other => Err(WorkflowError::Validation(format!("unknown role: {other}"))),
        }
    }

    /// Requests are raised by the people who consume stock; admins administer
    /// the store but do not requisition from it.
    pub fn can_create_request(self) -> bool {
        matches!(self, Self::Staff | Self::DepartmentHead)
    }

    pub fn can_approve(self) -> bool {
        matches!(self, Self::DepartmentHead | Self::Admin)
    }

    pub fn can_issue(self) -> bool {
        matches!(self, Self::StoreKeeper | Self::Admin)
    }

    /// Receiving goods, manual adjustments and stocktakes are store floor
    /// operations.
    pub fn can_manage_stock(self) -> bool {
        matches!(self, Self::StoreKeeper | Self::Admin)
    }
}

/// Caller identity for a workflow operation.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
    pub department: Option<String>,
}

impl Actor {
    pub fn new(user_id: &str, role: Role) -> Self {
        Self {
            user_id: user_id.to_owned(),
            role,
            department: None,
        }
    }

    pub fn with_department(user_id: &str, role: Role, department: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            role,
            department: Some(department.to_owned()),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RequestStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
    Issued,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, minicbor::Encode, minicbor::Decode)]
pub enum RequestEventKind {
    #[n(0)]
    Drafted,
    #[n(1)]
    ItemsRevised,
    #[n(2)]
    Submitted,
    #[n(3)]
    Approved,
    #[n(4)]
    Rejected,
    #[n(5)]
    Issued,
}

#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct RequestEvent {
    #[n(0)]
    pub kind: RequestEventKind,
    #[n(1)]
    pub actor_id: String,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>,
}

#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct RequestItem {
    #[n(0)]
    pub material_id: String,
    #[n(1)]
    pub requested_quantity: i64,
    #[n(2)]
    pub issued_quantity: Option<i64>,
}

impl RequestItem {
    pub fn new(material_id: &str, requested_quantity: i64) -> Self {
        Self {
            material_id: material_id.to_owned(),
            requested_quantity,
            issued_quantity: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, minicbor::Encode, minicbor::Decode)]
pub struct MaterialRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub requester_id: String,
    #[n(2)]
    pub department: String,
    #[n(3)]
    pub items: Vec<RequestItem>,
    #[n(4)]
    pub purpose: String,
    #[n(5)]
    pub date_needed: DateStamp,
    #[n(6)]
    pub history: Vec<RequestEvent>,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

/// Every requested quantity must be positive and no material may appear
/// twice; duplicates would make the per-request reservation hold ambiguous.
pub fn validate_items(items: &[RequestItem]) -> Result<(), WorkflowError> {
    for (i, item) in items.iter().enumerate() {
        if item.requested_quantity <= 0 {
            return Err(WorkflowError::Validation(format!(
                "requested quantity for material {} must be positive",
                item.material_id
            )));
        }
        if items[..i].iter().any(|p| p.material_id == item.material_id) {
            return Err(WorkflowError::Validation(format!(
                "material {} appears more than once in the request",
                item.material_id
            )));
        }
    }
    Ok(())
}

impl MaterialRequest {
    pub fn new(
        requester_id: String,
        department: String,
        items: Vec<RequestItem>,
        purpose: String,
        date_needed: DateStamp,
    ) -> anyhow::Result<Self> {
        validate_items(&items)?;

        let mut request = Self {
            id: utils::request_id()?,
            requester_id: requester_id.clone(),
            department,
            items,
            purpose,
            date_needed,
            history: vec![],
            created_at: TimeStamp::new(),
        };
        request.record(RequestEventKind::Drafted, &requester_id);

        Ok(request)
    }

    pub fn record(&mut self, kind: RequestEventKind, actor_id: &str) {
        self.history.push(RequestEvent {
            kind,
            actor_id: actor_id.to_owned(),
            timestamp: TimeStamp::new(),
        });
    }

    /// Current status, derived from the last lifecycle event.
    pub fn status(&self) -> RequestStatus {
        match self.history.last().map(|e| e.kind) {
            None | Some(RequestEventKind::Drafted) | Some(RequestEventKind::ItemsRevised) => {
                RequestStatus::Draft
            }
            Some(RequestEventKind::Submitted) => RequestStatus::Submitted,
            Some(RequestEventKind::Approved) => RequestStatus::Approved,
            Some(RequestEventKind::Rejected) => RequestStatus::Rejected,
            Some(RequestEventKind::Issued) => RequestStatus::Issued,
        }
    }

    pub fn approved_by(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|e| e.kind == RequestEventKind::Approved)
            .map(|e| e.actor_id.as_str())
    }

    pub fn issued_by(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|e| e.kind == RequestEventKind::Issued)
            .map(|e| e.actor_id.as_str())
    }

    /// Checks the transition table of the lifecycle state machine. Role and
    /// ownership checks happen at the service boundary; this only rules on
    /// whether the status change itself is legal.
    pub fn ensure_transition(&self, to: RequestStatus) -> Result<(), WorkflowError> {
        use RequestStatus::*;

        match (self.status(), to) {
            (Draft, Submitted)
            | (Submitted, Approved)
            | (Submitted, Rejected)
            | (Approved, Issued)
            | (Approved, Rejected) => Ok(()),
            (from, to) => Err(WorkflowError::InvalidTransition(format!(
                "request {} cannot move from {from:?} to {to:?}",
                self.id
            ))),
        }
    }
}
