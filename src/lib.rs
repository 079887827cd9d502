pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod ledger;
pub mod orchestrator;
pub mod persistence;
pub mod risk;
pub mod rules;
pub mod safety;
pub mod strategy;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::AppConfig;
pub use error::{IntegrityError, LirabotError, Result, TransportErrorKind};
pub use exchange::{ExchangeTransport, RateLimiter, RequestSigner};
pub use execution::{ExecutionEngine, ReplacePlanner, SubmitContext};
pub use ledger::{AccountingLedger, ReducedState};
pub use orchestrator::CycleOrchestrator;
pub use persistence::{SingleWriterLock, StateStore};
pub use risk::{apply_filters, decide_mode, FilterContext, ModeInputs};
pub use rules::{quantize_order, RulesProvider, SymbolRules};
pub use safety::{GateDecision, RuntimeFlags};
pub use strategy::{Strategy, StrategyContext, TakeProfitStrategy};
