//! Deterministic identifier derivation.
//!
//! Every identifier the agent mints is a truncated SHA-256 over a stable,
//! `|`-separated field serialization. Re-running a cycle with identical
//! inputs must reproduce identical identifiers across process restarts, so
//! no randomness and no wall-clock reads happen here.

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use super::intent::IntentReason;
use super::market::{Side, Symbol};

/// Hex length for truncated identifiers (128 bits).
const ID_HEX_LEN: usize = 32;

/// Canonical decimal rendering: trailing zeros stripped so "1.50" and
/// "1.5000" hash identically.
pub fn canonical_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

fn digest_fields(tag: &str, fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    for field in fields {
        hasher.update(b"|");
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..])[..ID_HEX_LEN].to_string()
}

/// Stable cycle identity: minute-truncated timestamp + process role +
/// per-minute counter.
pub fn cycle_id(ts_minute: i64, process_role: &str, counter: i64) -> String {
    digest_fields(
        "cycle",
        &[&ts_minute.to_string(), process_role, &counter.to_string()],
    )
}

/// Deterministic client order id. Stable across restarts so a duplicate
/// cycle cannot mint a second live order for the same quantized intent.
#[allow(clippy::too_many_arguments)]
pub fn client_order_id(
    cycle_id: &str,
    symbol: &Symbol,
    side: Side,
    quantized_price: Decimal,
    quantized_qty: Decimal,
    reason: IntentReason,
    strategy_id: &str,
) -> String {
    digest_fields(
        "order",
        &[
            cycle_id,
            &symbol.pair(),
            side.as_str(),
            &canonical_decimal(quantized_price),
            &canonical_decimal(quantized_qty),
            reason.as_str(),
            strategy_id,
        ],
    )
}

/// Hash over an intent's identifying fields, persisted with the order so a
/// later cycle can detect that the same logical intent produced it.
pub fn intent_hash(
    symbol: &Symbol,
    side: Side,
    target_price: Decimal,
    target_qty: Decimal,
    reason: IntentReason,
    strategy_id: &str,
    idempotency_seed: &str,
) -> String {
    digest_fields(
        "intent",
        &[
            &symbol.pair(),
            side.as_str(),
            &canonical_decimal(target_price),
            &canonical_decimal(target_qty),
            reason.as_str(),
            strategy_id,
            idempotency_seed,
        ],
    )
}

/// Fallback fill id when the exchange did not report a trade id.
pub fn fill_id_fallback(
    client_order_id: &str,
    ts_ms: i64,
    side: Side,
    qty: Decimal,
    price: Decimal,
) -> String {
    let digest = digest_fields(
        "fill",
        &[
            client_order_id,
            &ts_ms.to_string(),
            side.as_str(),
            &canonical_decimal(qty),
            &canonical_decimal(price),
        ],
    );
    format!("synthetic:{}", digest)
}

/// Ledger event id for a fill. Namespaced by the exchange trade id when
/// present, otherwise by the deterministic fallback fill id.
pub fn fill_event_id(fill_id: &str) -> String {
    format!("fill:{}", fill_id)
}

/// Ledger event id for the fee attached to a fill.
pub fn fee_event_id(fill_id: &str) -> String {
    format!("fee:{}", fill_id)
}

/// Ledger event id for a manual adjustment.
pub fn adjustment_event_id(symbol: &Symbol, ts_ms: i64, qty_delta: Decimal) -> String {
    let digest = digest_fields(
        "adj",
        &[
            &symbol.pair(),
            &ts_ms.to_string(),
            &canonical_decimal(qty_delta),
        ],
    );
    format!("adj:{}", digest)
}

/// Payload hash for idempotency rows and action dedupe. The payload must be
/// canonicalized by the caller (sorted keys, canonical decimals).
pub fn payload_hash(canonical_payload: &str) -> String {
    digest_fields("payload", &[canonical_payload])
}

/// Hash over the risk engine's inputs, persisted with each decision so a
/// decision can be traced back to what it saw.
pub fn inputs_hash(fields: &[String]) -> String {
    let refs: Vec<&str> = fields.iter().map(|s| s.as_str()).collect();
    digest_fields("risk", &refs)
}

/// Replace transaction id tying a cancel and its replacement submit together.
pub fn replace_tx_id(old_client_order_id: &str, new_client_order_id: &str) -> String {
    digest_fields("replace", &[old_client_order_id, new_client_order_id])
}
