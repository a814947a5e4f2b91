//! LISTEN/NOTIFY payload models.

/// A notification as delivered by the transport, payload still undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// Backend process that issued the `NOTIFY`
    pub process_id: u32,
    pub channel: String,
    pub payload: String,
}

/// A notification whose payload has been decoded into `P`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification<P> {
    /// Identifier of the [`Connection`](crate::db::Connection) the listener was registered on.
    pub connection_id: String,
    pub process_id: u32,
    pub channel: String,
    pub payload: P,
}
