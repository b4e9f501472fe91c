// Router owns the active venue session and the event surface listeners attach to
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::adapters::{build_session, Credential, Venue, VenueSession};
use crate::market_data::events::{EventBus, EventKind, FeedEvent, ListenerHandle};
use crate::market_data::types::{FlowSummary, IntradayTrade, NormalizedOption, NormalizedTicker, VenueSessionState};

/// Holds zero or one venue session. Listeners registered here survive venue
/// switches because every session is built on the router's bus.
pub struct FeedRouter {
    bus: Arc<EventBus>,
    session: Option<Box<dyn VenueSession>>,
    config: FeedConfig,
}

impl FeedRouter {
    pub fn new(config: FeedConfig) -> Self {
        Self { bus: Arc::new(EventBus::new()), session: None, config }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Tear down whatever is active, then build and connect `venue`.
    pub async fn connect(&mut self, venue: Venue, credential: Credential) -> FeedResult<()> {
        let session = build_session(venue, credential, &self.config, Arc::clone(&self.bus));
        self.connect_with(session).await
    }

    /// Same as [`connect`](Self::connect) with a session built elsewhere. The
    /// session must emit on [`bus`](Self::bus) for listeners to see its events.
    pub async fn connect_with(&mut self, mut session: Box<dyn VenueSession>) -> FeedResult<()> {
        self.disconnect().await;
        let venue = session.venue();
        info!(venue = %venue, "connecting");
        match session.connect().await {
            Ok(()) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                warn!(venue = %venue, error = %e, "connect failed");
                session.disconnect().await;
                Err(e)
            }
        }
    }

    /// No-op without an active session.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!(venue = %session.venue(), "tearing down session");
            session.disconnect().await;
        }
    }

    fn active(&self) -> FeedResult<&dyn VenueSession> {
        self.session.as_deref().ok_or(FeedError::NotConnected)
    }

    fn active_mut(&mut self) -> FeedResult<&mut Box<dyn VenueSession>> {
        self.session.as_mut().ok_or(FeedError::NotConnected)
    }

    pub async fn subscribe_to_tickers(&mut self, tickers: &[String]) -> FeedResult<()> {
        self.active_mut()?.subscribe(tickers, &[]).await
    }

    pub async fn subscribe_to_options(&mut self, options: &[String]) -> FeedResult<()> {
        self.active_mut()?.subscribe(&[], options).await
    }

    pub async fn unsubscribe_tickers(&mut self, tickers: &[String]) -> FeedResult<()> {
        self.active_mut()?.unsubscribe(tickers, &[]).await
    }

    pub async fn unsubscribe_options(&mut self, options: &[String]) -> FeedResult<()> {
        self.active_mut()?.unsubscribe(&[], options).await
    }

    /// Backfill base open interest. `None` means every subscribed option.
    pub async fn fetch_open_interest(&self, options: Option<&[String]>) -> FeedResult<usize> {
        let session = self.active()?;
        let accepted = match options {
            Some(options) => session.fetch_open_interest(options).await?,
            None => session.fetch_open_interest(&session.subscribed_options()).await?,
        };
        info!(venue = %session.venue(), accepted, "open interest backfill");
        Ok(accepted)
    }

    pub fn active_venue(&self) -> Option<Venue> {
        self.session.as_ref().map(|s| s.venue())
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    pub fn session_state(&self) -> Option<VenueSessionState> {
        self.session.as_ref().map(|s| s.state())
    }

    pub fn get_ticker(&self, symbol: &str) -> Option<NormalizedTicker> {
        self.session.as_ref().and_then(|s| s.get_ticker(symbol))
    }

    pub fn get_option(&self, symbol: &str) -> Option<NormalizedOption> {
        self.session.as_ref().and_then(|s| s.get_option(symbol))
    }

    pub fn get_all_tickers(&self) -> Vec<NormalizedTicker> {
        self.session.as_ref().map(|s| s.get_all_tickers()).unwrap_or_default()
    }

    pub fn get_all_options(&self) -> Vec<NormalizedOption> {
        self.session.as_ref().map(|s| s.get_all_options()).unwrap_or_default()
    }

    pub fn get_subscribed_tickers(&self) -> Vec<String> {
        self.session.as_ref().map(|s| s.subscribed_tickers()).unwrap_or_default()
    }

    pub fn get_subscribed_options(&self) -> Vec<String> {
        self.session.as_ref().map(|s| s.subscribed_options()).unwrap_or_default()
    }

    pub fn intraday_trades(&self, symbol: &str) -> Vec<IntradayTrade> {
        self.session
            .as_ref()
            .map(|s| s.core().cache().read().intraday_trades(symbol).to_vec())
            .unwrap_or_default()
    }

    pub fn flow_summary(&self, symbol: &str) -> FlowSummary {
        self.session
            .as_ref()
            .map(|s| s.core().cache().read().flow_summary(symbol))
            .unwrap_or_default()
    }

    pub fn underlying_flow(&self, underlying: &str) -> FlowSummary {
        self.session
            .as_ref()
            .map(|s| s.core().cache().read().underlying_flow(underlying))
            .unwrap_or_default()
    }

    /// Clears trade logs and deltas; base open interest is kept.
    pub fn reset_intraday(&self) {
        if let Some(s) = &self.session {
            s.core().cache().write().reset_intraday();
        }
    }

    pub fn on<F>(&self, kind: EventKind, f: F) -> ListenerHandle
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, f)
    }

    pub fn once<F>(&self, kind: EventKind, f: F) -> ListenerHandle
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.bus.once(kind, f)
    }

    pub fn off(&self, handle: ListenerHandle) -> bool {
        self.bus.off(handle)
    }
}
