//! Wire protocol types shared by the fleetlink agent and its control plane.
//!
//! Every frame on the duplex connection is a JSON [`envelope::Frame`]; the
//! payload types live in [`messages`] and [`telemetry`].

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod telemetry;
