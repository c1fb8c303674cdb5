//! CSPP mixing client.
//!
//! Runs a peer's side of DiceMix Light against a coordinator: peers pair on a
//! shared session, exchange hybrid X25519 / ML-KEM-768 keys, reserve message
//! slots through an exponential DC-net and publish their anonymized messages
//! through an XOR DC-net. Failed runs reveal per-run secrets so the
//! coordinator can exclude misbehaving peers, and the session reruns until
//! the mixed payload is confirmed by every peer.
//!
//! ```no_run
//! # async fn example<G: cspp_client::GenConfirmer>(mut payload: G) -> Result<(), Box<dyn std::error::Error>> {
//! use cspp_client::Session;
//! use tokio_util::sync::CancellationToken;
//!
//! let conn = tokio::net::TcpStream::connect("127.0.0.1:5760").await?;
//! let mut session = Session::new(rand::rngs::OsRng, tracing::info_span!("mix"), Vec::new(), 1)?;
//! session.dice_mix(&CancellationToken::new(), conn, &mut payload).await?;
//! # Ok(())
//! # }
//! ```

pub mod confirmer;
pub mod error;
pub mod messages;
pub mod run;
pub mod session;
pub mod slots;
pub mod transport;

pub use confirmer::{ConfirmError, GenConfirmer, MESSAGE_SIZE};
pub use error::MixError;
pub use messages::{RunContext, ServerError, Signed};
pub use session::Session;
pub use transport::{Client, Conn, TransportError};
