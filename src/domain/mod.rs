pub mod capital;
pub mod cycle;
pub mod fill;
pub mod ids;
pub mod intent;
pub mod ledger;
pub mod market;
pub mod order;
pub mod risk;

pub use capital::{CapitalChange, CapitalState};
pub use cycle::{CycleOutcome, CycleRecord, OrderDecision};
pub use fill::Fill;
pub use intent::{sort_intents, Intent, IntentReason};
pub use ledger::{LedgerEvent, LedgerEventKind, LedgerMetrics, Position};
pub use market::{parse_side, Balance, Side, Symbol, TopOfBook};
pub use order::{Order, OrderStatus};
pub use risk::{RiskDecision, RiskMode, RiskReason};
