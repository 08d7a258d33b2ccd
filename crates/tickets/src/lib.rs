//! Ticket domain module.
//!
//! Business rules for registrations, payment proof, hand-out and
//! notification templates, implemented as deterministic domain logic
//! (no IO, no storage, no queues).

pub mod proof;
pub mod template;
pub mod ticket;

pub use proof::{
    ALLOWED_MIME_TYPES, DEFAULT_MAX_PROOF_BYTES, ProofUpload, mime_subtype, proof_object_name,
};
pub use template::{Template, render, render_for};
pub use ticket::{
    Lifecycle, Stage, Submission, TemplateSend, Ticket, TicketCommand, TicketEvent,
};
