//! Identifier generation helpers
//!
//! Every entity id in the store is a uuid7 encoded with bech32, carrying a
//! human-readable prefix so ids are self-describing in logs and audit trails.

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn material_id() -> anyhow::Result<String> {
    new_uuid_to_bech32("mat_")
}

pub fn request_id() -> anyhow::Result<String> {
    new_uuid_to_bech32("req_")
}

pub fn receipt_id() -> anyhow::Result<String> {
    new_uuid_to_bech32("rcpt_")
}

pub fn stocktake_id() -> anyhow::Result<String> {
    new_uuid_to_bech32("stk_")
}

pub fn adjustment_id() -> anyhow::Result<String> {
    new_uuid_to_bech32("adj_")
}

pub fn entry_id() -> anyhow::Result<String> {
    new_uuid_to_bech32("txn_")
}
