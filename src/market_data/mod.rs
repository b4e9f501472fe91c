// Market data module entrypoint
pub mod adapters;       // venue sessions (Tradier, Tastytrade, Schwab, Webull, TradeStation)
pub mod backoff;        // reconnect delay policy
pub mod cache;          // normalized per-session snapshots
pub mod estimator;      // aggressor classification + live open interest
pub mod events;         // typed pub/sub surface
pub mod external_book;  // depth book for the Schwab order-book channel
pub mod normaliser;     // venue strings/numbers -> typed values
pub mod router;         // owns the active session
pub mod symbols;        // canonical <-> venue option symbols
pub mod types;
