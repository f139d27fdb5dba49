//! End-to-end workflow scenarios against a real sled database

use std::sync::Arc;

use anyhow::Context;
use material_workflow::{
    error::WorkflowError,
    material::{MaterialDraft, QualityStatus, ReceiptItem},
    request::{Actor, RequestItem, RequestStatus, Role},
    service::{StoreService, WorkflowPolicy},
    timestamp::DateStamp,
};
use sled::open;
use tempfile::{TempDir, tempdir};

// Sled uses file-based locking to prevent concurrent access, so every test
// opens its own database under a tempdir. The TempDir must stay alive for
// the duration of the test.
fn open_store(name: &str) -> anyhow::Result<(TempDir, StoreService)> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(name))?;
    let db = Arc::new(db);
    db.clear()?;

    Ok((temp_dir, StoreService::new(db)))
}

fn staff() -> Actor {
    Actor::with_department("user_staff", Role::Staff, "Chemistry")
}

fn head() -> Actor {
    Actor::with_department("user_head", Role::DepartmentHead, "Chemistry")
}

fn keeper() -> Actor {
    Actor::new("user_keeper", Role::StoreKeeper)
}

fn register(service: &StoreService, name: &str, sku: &str) -> anyhow::Result<String> {
    let material = service.register_material(
        MaterialDraft::new()
            .set_name(name)
            .set_sku(sku)
            .set_unit("pcs")
            .set_category("Glassware")
            .set_reorder_level(5)
            .set_unit_price(1_000)
            .set_location("Main Store"),
    )?;
    Ok(material.id)
}

fn seed_stock(service: &StoreService, material_id: &str, quantity: i64) -> anyhow::Result<()> {
    service.receive_goods(
        "vendor_acme",
        vec![ReceiptItem {
            material_id: material_id.to_owned(),
            quantity,
            unit_price: 1_000,
            batch_number: None,
            expiration_date: None,
        }],
        QualityStatus::Accepted,
        None,
        &keeper(),
    )?;
    Ok(())
}

#[test]
fn submit_approve_and_issue_full_flow() -> anyhow::Result<()> {
    let (_dir, service) = open_store("full_flow.db")?;

    let material = register(&service, "Beaker 250ml", "GLS-0042")?;
    seed_stock(&service, &material, 10)?;

    let request = service
        .create_request(
            &staff(),
            vec![RequestItem::new(&material, 6)],
            "practical session",
            DateStamp::today(),
        )
        .context("request failed on create: ")?;
    assert_eq!(request.status(), RequestStatus::Draft);

    let request = service
        .submit_request(&request.id, &staff())
        .context("request failed on submit: ")?;
    assert_eq!(request.status(), RequestStatus::Submitted);

    let request = service
        .approve_request(&request.id, &head())
        .context("request failed on approval: ")?;
    assert_eq!(request.status(), RequestStatus::Approved);
    assert_eq!(request.approved_by(), Some("user_head"));

    // approval holds stock without moving it
    assert_eq!(service.quantity_of(&material)?, 10);
    assert_eq!(service.available_of(&material)?, 4);

    let request = service
        .issue_request(&request.id, &[(material.clone(), 6)], &keeper())
        .context("request failed on issue: ")?;
    assert_eq!(request.status(), RequestStatus::Issued);
    assert_eq!(request.issued_by(), Some("user_keeper"));
    assert_eq!(request.items[0].issued_quantity, Some(6));

    assert_eq!(service.quantity_of(&material)?, 4);
    assert_eq!(service.available_of(&material)?, 4);

    Ok(())
}

#[test]
fn second_approval_cannot_double_reserve() -> anyhow::Result<()> {
    let (_dir, service) = open_store("double_reserve.db")?;

    let material = register(&service, "Beaker 250ml", "GLS-0042")?;
    seed_stock(&service, &material, 10)?;

    let request_a = service.create_request(
        &staff(),
        vec![RequestItem::new(&material, 6)],
        "request a",
        DateStamp::today(),
    )?;
    service.submit_request(&request_a.id, &staff())?;
    service.approve_request(&request_a.id, &head())?;
    assert_eq!(service.available_of(&material)?, 4);

    let request_b = service.create_request(
        &staff(),
        vec![RequestItem::new(&material, 5)],
        "request b",
        DateStamp::today(),
    )?;
    service.submit_request(&request_b.id, &staff())?;

    // 4 < 5: approval must fail and place no hold for B
    let err = service.approve_request(&request_b.id, &head()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::InsufficientStock { .. })
    ));
    assert_eq!(service.available_of(&material)?, 4);
    assert!(
        !service
            .ledger_of(&material)?
            .iter()
            .any(|e| e.reference_id == request_b.id)
    );
    assert_eq!(
        service.load_request(&request_b.id)?.status(),
        RequestStatus::Submitted
    );

    // A issues in full; its hold is consumed
    service.issue_request(&request_a.id, &[(material.clone(), 6)], &keeper())?;
    assert_eq!(service.quantity_of(&material)?, 4);
    assert_eq!(service.available_of(&material)?, 4);

    Ok(())
}

#[test]
fn partial_issue_releases_the_remainder() -> anyhow::Result<()> {
    let (_dir, service) = open_store("partial_issue.db")?;

    let material = register(&service, "Ethanol 96%", "CHM-0007")?;
    seed_stock(&service, &material, 10)?;

    let request = service.create_request(
        &staff(),
        vec![RequestItem::new(&material, 6)],
        "titration",
        DateStamp::today(),
    )?;
    service.submit_request(&request.id, &staff())?;
    service.approve_request(&request.id, &head())?;

    let request = service.issue_request(&request.id, &[(material.clone(), 4)], &keeper())?;
    assert_eq!(request.items[0].issued_quantity, Some(4));

    // 4 issued, 2 of the hold released back to availability
    assert_eq!(service.quantity_of(&material)?, 6);
    assert_eq!(service.available_of(&material)?, 6);

    Ok(())
}

#[test]
fn rejecting_an_approved_request_releases_holds() -> anyhow::Result<()> {
    let (_dir, service) = open_store("reject_approved.db")?;

    let material = register(&service, "Beaker 250ml", "GLS-0042")?;
    seed_stock(&service, &material, 10)?;

    let request = service.create_request(
        &staff(),
        vec![RequestItem::new(&material, 6)],
        "practical session",
        DateStamp::today(),
    )?;
    service.submit_request(&request.id, &staff())?;
    service.approve_request(&request.id, &head())?;
    assert_eq!(service.available_of(&material)?, 4);

    let request = service.reject_request(&request.id, &head())?;
    assert_eq!(request.status(), RequestStatus::Rejected);
    assert_eq!(service.quantity_of(&material)?, 10);
    assert_eq!(service.available_of(&material)?, 10);

    // rejected is terminal
    let err = service.approve_request(&request.id, &head()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::InvalidTransition(_))
    ));

    Ok(())
}

#[test]
fn damaged_receipt_posts_nothing_until_resolved() -> anyhow::Result<()> {
    let (_dir, service) = open_store("damaged_receipt.db")?;

    let material = register(&service, "Ethanol 96%", "CHM-0007")?;

    let receipt = service.receive_goods(
        "vendor_acme",
        vec![ReceiptItem {
            material_id: material.clone(),
            quantity: 5,
            unit_price: 900,
            batch_number: Some("B-778".into()),
            expiration_date: DateStamp::from_ymd(2027, 6, 1),
        }],
        QualityStatus::Damaged,
        Some("carton crushed in transit"),
        &keeper(),
    )?;
    assert_eq!(service.quantity_of(&material)?, 0);

    let receipt = service.resolve_receipt(&receipt.id, &keeper())?;
    assert_eq!(receipt.quality_status, QualityStatus::Accepted);
    assert_eq!(service.quantity_of(&material)?, 5);

    // already accepted, must not post twice
    let err = service.resolve_receipt(&receipt.id, &keeper()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::InvalidTransition(_))
    ));
    assert_eq!(service.quantity_of(&material)?, 5);

    Ok(())
}

#[test]
fn stocktake_adjusts_counted_materials_only() -> anyhow::Result<()> {
    let (_dir, service) = open_store("stocktake.db")?;

    let counted = register(&service, "Beaker 250ml", "GLS-0042")?;
    let uncounted = register(&service, "Flask 500ml", "GLS-0043")?;
    seed_stock(&service, &counted, 4)?;
    seed_stock(&service, &uncounted, 9)?;

    let session = service.start_stocktake("Main Store", None, &keeper())?;
    assert_eq!(session.snapshot.len(), 2);

    service.record_count(&session.id, &counted, 3, &keeper())?;

    let report = service.complete_stocktake(&session.id, &keeper())?;
    assert_eq!(report.adjustments.len(), 1);
    assert_eq!(report.adjustments[0].previous_quantity, 4);
    assert_eq!(report.adjustments[0].new_quantity, 3);
    assert_eq!(report.not_counted, vec![uncounted.clone()]);

    assert_eq!(service.quantity_of(&counted)?, 3);
    assert_eq!(service.quantity_of(&uncounted)?, 9);

    // no further counting after completion
    let err = service
        .record_count(&session.id, &counted, 8, &keeper())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::InvalidTransition(_))
    ));

    Ok(())
}

#[test]
fn receipt_then_full_issue_returns_to_baseline() -> anyhow::Result<()> {
    let (_dir, service) = open_store("round_trip.db")?;

    let material = register(&service, "Beaker 250ml", "GLS-0042")?;
    seed_stock(&service, &material, 3)?;
    let baseline = service.quantity_of(&material)?;

    seed_stock(&service, &material, 7)?;
    assert_eq!(service.quantity_of(&material)?, baseline + 7);

    let request = service.create_request(
        &staff(),
        vec![RequestItem::new(&material, 7)],
        "round trip",
        DateStamp::today(),
    )?;
    service.submit_request(&request.id, &staff())?;
    service.approve_request(&request.id, &head())?;
    service.issue_request(&request.id, &[(material.clone(), 7)], &keeper())?;

    assert_eq!(service.quantity_of(&material)?, baseline);
    assert_eq!(service.available_of(&material)?, baseline);

    Ok(())
}

#[test]
fn role_gates_hold_at_every_transition() -> anyhow::Result<()> {
    let (_dir, service) = open_store("role_gates.db")?;

    let material = register(&service, "Beaker 250ml", "GLS-0042")?;
    seed_stock(&service, &material, 10)?;

    let request = service.create_request(
        &staff(),
        vec![RequestItem::new(&material, 2)],
        "practical session",
        DateStamp::today(),
    )?;

    // only the requester may submit
    let err = service.submit_request(&request.id, &head()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::InvalidTransition(_))
    ));
    service.submit_request(&request.id, &staff())?;

    // staff and store keepers cannot approve
    for actor in [staff(), keeper()] {
        let err = service.approve_request(&request.id, &actor).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::InvalidTransition(_))
        ));
    }
    service.approve_request(&request.id, &head())?;

    // department heads cannot issue
    let err = service
        .issue_request(&request.id, &[(material.clone(), 2)], &head())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::InvalidTransition(_))
    ));
    service.issue_request(&request.id, &[(material.clone(), 2)], &keeper())?;

    Ok(())
}

#[test]
fn submission_validates_items_and_date() -> anyhow::Result<()> {
    let (_dir, service) = open_store("submit_validation.db")?;

    let material = register(&service, "Beaker 250ml", "GLS-0042")?;
    seed_stock(&service, &material, 10)?;

    // empty drafts cannot be submitted
    let empty = service.create_request(&staff(), vec![], "nothing yet", DateStamp::today())?;
    let err = service.submit_request(&empty.id, &staff()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Validation(_))
    ));

    // a date needed in the past is rejected by the default policy
    let stale = service.create_request(
        &staff(),
        vec![RequestItem::new(&material, 1)],
        "too late",
        DateStamp::from_ymd(2020, 1, 1).unwrap(),
    )?;
    let err = service.submit_request(&stale.id, &staff()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Validation(_))
    ));

    Ok(())
}

#[test]
fn strict_policy_forbids_partial_issue() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("strict_policy.db"))?);
    db.clear()?;
    let service = StoreService::with_policy(
        db,
        WorkflowPolicy {
            allow_partial_issue: false,
            ..WorkflowPolicy::default()
        },
    );

    let material = register(&service, "Beaker 250ml", "GLS-0042")?;
    seed_stock(&service, &material, 10)?;

    let request = service.create_request(
        &staff(),
        vec![RequestItem::new(&material, 6)],
        "practical session",
        DateStamp::today(),
    )?;
    service.submit_request(&request.id, &staff())?;
    service.approve_request(&request.id, &head())?;

    let err = service
        .issue_request(&request.id, &[(material.clone(), 4)], &keeper())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Validation(_))
    ));

    // the hold is untouched by the failed issue
    assert_eq!(service.available_of(&material)?, 4);
    service.issue_request(&request.id, &[(material.clone(), 6)], &keeper())?;
    assert_eq!(service.quantity_of(&material)?, 4);

    Ok(())
}
