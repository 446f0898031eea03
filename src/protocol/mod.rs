//! Wire-level types for the Realtime API event protocol.
//!
//! Everything on the socket is a JSON object with a `type` discriminator.
//! [`client_events::ClientEvent`] covers what we send, and
//! [`server_events::ServerEvent`] covers what we consume; frames with an
//! unrecognised `type` survive as [`server_events::ServerEvent::Unknown`].

pub mod client_events;
pub mod models;
pub mod server_events;
