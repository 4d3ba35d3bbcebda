//! wa-relay: bridges Chatwoot webhooks to a single WhatsApp session.
//!
//! Webhook payloads are normalized into a destination address and a message
//! body, the destination is canonicalized into a WhatsApp JID, and the text is
//! sent through one long-lived, auto-reconnecting session.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod normalize;
pub mod qr;
pub mod whatsapp;

pub mod relay;
