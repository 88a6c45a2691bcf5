//! # SIP core library for the voxbridge project
//!
//! `sip-core` covers the signalling edge of the connector:
//!
//! - **Switch events**: the UDP datagrams the telephony switch emits on call
//!   setup/teardown, in JSON or `key=value` form
//! - **SIP messages**: request parsing and response building for the small
//!   subset the connector answers (INVITE, BYE)
//! - **SDP**: offer parsing, codec negotiation and answer generation
//!
//! The connector only ever *answers*; it never originates SIP requests and
//! relies on the switch for transaction-layer retransmits.

pub mod backend;
pub mod error;
pub mod events;
pub mod listener;
pub mod message;
pub mod sdp;

pub use backend::{InviteHandler, InviteOutcome, SipBackend, SipBackendConfig};
pub use error::{Error, Result};
pub use events::SwitchEvent;
pub use listener::{EventListener, EventListenerConfig};
pub use message::{SipRequest, SipResponse};
pub use sdp::{choose_codec, MediaAnswer, SdpOffer};
