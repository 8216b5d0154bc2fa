//! Reader-transport boundary.
//!
//! The library never talks to PC/SC (or any other terminal service) directly.
//! A [`ReaderTransport`] enumerates readers and opens [`CardConnection`]s;
//! on-wire failures are classified into the five buckets the core cares
//! about: ok, no card, card removed, reader gone, other.
//!
//! A production backend wraps the platform terminal service in another
//! crate; [`crate::mock`] provides the in-memory backend used by the test
//! suites and the bundled CLI simulation mode.

use thiserror::Error;

/// Classified transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The reader service itself is unreachable.
    #[error("reader service unavailable")]
    ServiceUnavailable,

    /// The reader exists but holds no card.
    #[error("no card in reader")]
    NoCard,

    /// A card was present and has been withdrawn.
    #[error("card removed")]
    CardRemoved,

    /// The reader disappeared (unplugged, service restarted).
    #[error("reader gone")]
    ReaderGone,

    /// Anything else the backend reports.
    #[error("transport error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Reader-integrated capabilities discovered by the feature probe.
///
/// A zero control code means the capability is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderFeatures {
    /// Control code for direct PIN verification on a reader-integrated pad.
    pub verify_pin_direct: u32,
}

/// A terminal service: enumerates readers and connects to cards.
pub trait ReaderTransport: Send + Sync {
    /// Names of the readers currently attached.
    fn list_readers(&self) -> Result<Vec<String>>;

    /// Connect to the card in the named reader (T=1, shared access).
    fn connect(&self, reader_name: &str) -> Result<Box<dyn CardConnection>>;
}

/// A reader-scoped connection to one card.
pub trait CardConnection: Send {
    /// Exchange one command APDU for one response APDU (status bytes
    /// included). May block on the underlying transport.
    fn transmit(&mut self, capdu: &[u8]) -> Result<Vec<u8>>;

    /// Probe whether the card is still present behind this connection.
    fn status(&mut self) -> Result<()>;

    /// Answer-to-reset of the connected card.
    fn atr(&self) -> &[u8];

    /// Query reader-integrated capabilities.
    fn features(&mut self) -> Result<ReaderFeatures>;
}
