//! # Room Server Library
//!
//! Authoritative backend for one shared social-simulation room. The server
//! owns the canonical room state; clients submit intents, predict
//! optimistically, and conform to the server's patches.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! Every mutation — planting, harvesting, hatching, furniture placement,
//! purchases, presence movement — is validated and applied here. Clients
//! never write state directly; they receive revisioned patches and
//! reconcile their predictions against them.
//!
//! ### At-Most-Once Semantics
//! Client intents carry unique action ids. Retransmitted duplicates are
//! answered from a recorded terminal result instead of being reprocessed,
//! so a harvest or purchase can never pay out twice.
//!
//! ### Bounded Persistence Risk
//! Room state is checkpointed asynchronously, with synchronous durable
//! writes for critical economic actions. When the store fails the room
//! keeps serving non-economic gameplay from memory and gates the rest.
//!
//! ## Module Organization
//!
//! - `engine` — single-writer room state engine and submit pipeline
//! - `validate` — per-action validation producing typed transitions
//! - `permissions` — role resolution and the role/action capability matrix
//! - `ledger` — idempotency ledger with class-based retention
//! - `economy` — append-only currency ledger, the authority on funds
//! - `checkpoint` — debounced/critical/lifecycle persistence with backoff
//! - `session` — session roster, timeouts, identity resolution
//! - `network` — UDP transport and the serialized `tokio::select!` loop

pub mod checkpoint;
pub mod economy;
pub mod engine;
pub mod ledger;
pub mod network;
pub mod permissions;
pub mod session;
pub mod utils;
pub mod validate;
