//! The optional hub. Nodes register their address there and report what they decide, and clients
//! can send proposals through it. Peers only look addresses up there for members whose address
//! isn't in the static membership.

mod client;
mod reporter;
mod server;

pub use client::HubClient;
pub use client::HubError;
pub use client::HubProposal;
pub use client::DEFAULT_HUB_CACHE_TTL;
pub use client::DEFAULT_HUB_CALL_TIMEOUT;
pub use server::HubServeError;
pub use server::HubServer;
pub use server::ReportedDecision;

pub(crate) use reporter::spawn_decision_reporter;
