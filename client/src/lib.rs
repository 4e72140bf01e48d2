//! # Room Client Library
//!
//! Client-side implementation for the shared social-simulation room:
//! optimistic prediction, reconciliation against the server's revisioned
//! patch stream, and a thin UDP transport.
//!
//! ## Architecture Overview
//!
//! ### Optimistic Prediction
//! Every intent is applied to the local room view the moment it is
//! submitted, so planting, placing, and moving feel instant. Each
//! prediction records the exact pre-prediction values it overwrote.
//!
//! ### Reconciliation
//! The server's response is terminal: an ack replaces the prediction with
//! the authoritative patch, a rejection restores the recorded base
//! snapshot. Rollback never inverts live state, and skips anything the
//! server has rewritten in the meantime.
//!
//! ### Revision Stream
//! Broadcast patches carry a strictly increasing room revision. A gap
//! means a lost patch; the client requests a full snapshot rather than
//! guess at the missing state.
//!
//! ## Module Organization
//!
//! - `pending` — per-intent records: prediction, base snapshot, retry and
//!   timeout schedule
//! - `reconcile` — the reconciliation engine owning the local room view
//! - `network` — UDP transport driving the engine

pub mod network;
pub mod pending;
pub mod reconcile;
