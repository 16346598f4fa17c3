//! OAuth token exchange with claim destination routing.

pub mod claims;
pub mod destinations;
pub mod exchange;
pub mod types;

// Re-export frequently used items from each module
pub use claims::{Claim, ClaimsIdentity, ClaimsPrincipal, Destination, Destinations, claim_types};
pub use destinations::destinations;
pub use exchange::TokenExchangeHandler;
pub use types::{Application, ClientType, GrantType, Scope, TokenRequest, permissions};
