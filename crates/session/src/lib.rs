//! Room negotiation and the public session surface.
//!
//! Two participants join the same room on a rendezvous service. The first
//! one becomes the [`Role::Initiator`], the second the [`Role::Joiner`]. The
//! Initiator creates the data channel and issues the offer; the Joiner only
//! answers. Once the channel opens, files flow over it with the chunked
//! transfer protocol from `roomdrop-transfer`.
//!
//! The rendezvous transport and the point-to-point connection are traits
//! ([`RendezvousClient`], [`PeerConnector`]). The crate ships a direct-TCP
//! connector ([`tcp::TcpConnector`]) and in-memory implementations of both
//! ([`memory`]).

pub mod coordinator;
pub mod error;
pub mod handle;
pub mod memory;
pub mod peer;
pub mod rendezvous;
pub mod tcp;
pub mod token;

use std::future::Future;
use std::pin::Pin;

pub use coordinator::{NegotiationCoordinator, NegotiationState, Role, Session};
pub use error::{NegotiationError, RendezvousError, SessionError};
pub use handle::{SessionConfig, SessionEvent, SessionHandle};
pub use peer::{PeerConnection, PeerConnector, PeerEvent};
pub use rendezvous::{RendezvousClient, RoomEvent};
pub use token::SessionToken;

/// A boxed future returned by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
