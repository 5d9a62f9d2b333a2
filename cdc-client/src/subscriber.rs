//! CDC subscriber
//!
//! Ties the push and pull halves of a change subscription together: a
//! [`StreamClient`] on the subscription's CDC stream, and an [`AckTracker`]
//! over the REST change feed. Every pushed `change_event` is recorded
//! before the consumer sees it, so events lost to a dropped connection can
//! be recovered with [`CdcSubscriber::drain_changes`] after the reconnect.

use std::sync::Arc;
use std::time::Duration;

use realtime_stream::{
    ChangeEvent, ConnectionState, Connector, DeliveryGuarantee, EventHandlers, StaticToken,
    StreamClient, StreamConfig, StreamEndpoint, TokenProvider,
};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::api::{ChangesApi, ChangesPage, HttpChangesApi};
use crate::error::{CdcError, CdcResult};
use crate::tracker::{AckTracker, PendingChangeEvent};

/// Default REST root for the change feed
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api/v1/cdc";

/// Configuration for one CDC subscription.
#[derive(Debug, Clone)]
pub struct CdcConfig {
    pub subscription_id: Uuid,
    pub guarantee: DeliveryGuarantee,
    /// REST root, e.g. `http://localhost:8080/api/v1/cdc`
    pub api_base_url: String,
    pub request_timeout: Duration,
    /// How many acknowledged or delivered ids to remember for deduplication
    pub dedup_window: usize,
    /// Page size used by [`CdcSubscriber::drain_changes`]
    pub poll_limit: usize,
    /// Stream side; its endpoint must be this subscription's CDC stream
    pub stream: StreamConfig,
}

impl CdcConfig {
    pub fn new(subscription_id: Uuid) -> Self {
        Self {
            subscription_id,
            guarantee: DeliveryGuarantee::default(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            dedup_window: 10_000,
            poll_limit: 100,
            stream: StreamConfig::cdc(subscription_id),
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> CdcResult<()> {
        let api = Url::parse(&self.api_base_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(CdcError::Configuration(format!(
                "api_base_url must use http or https, got {}",
                api.scheme()
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(CdcError::Configuration(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.dedup_window == 0 {
            return Err(CdcError::Configuration(
                "dedup_window must be greater than 0".to_string(),
            ));
        }

        if self.poll_limit == 0 {
            return Err(CdcError::Configuration(
                "poll_limit must be greater than 0".to_string(),
            ));
        }

        if self.stream.endpoint != StreamEndpoint::Cdc(self.subscription_id) {
            return Err(CdcError::Configuration(format!(
                "stream endpoint {} does not belong to subscription {}",
                self.stream.endpoint, self.subscription_id
            )));
        }

        self.stream.validate()?;
        Ok(())
    }

    pub fn with_guarantee(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Point the stream side at another server, keeping the CDC endpoint.
    pub fn with_stream_base_url(mut self, url: impl Into<String>) -> Self {
        self.stream = self.stream.with_base_url(url);
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_poll_limit(mut self, limit: usize) -> Self {
        self.poll_limit = limit;
        self
    }
}

type OnChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Wires a [`CdcSubscriber`] together.
pub struct CdcSubscriberBuilder {
    config: CdcConfig,
    connector: Option<Arc<dyn Connector>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    api: Option<Arc<dyn ChangesApi>>,
    handlers: EventHandlers,
    on_change: Option<OnChangeCallback>,
}

impl CdcSubscriberBuilder {
    pub fn new(config: CdcConfig) -> Self {
        Self {
            config,
            connector: None,
            tokens: None,
            api: None,
            handlers: EventHandlers::default(),
            on_change: None,
        }
    }

    /// Stream transport. Defaults to a WebSocket.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Token source shared by the stream and REST sides.
    pub fn token_provider(mut self, tokens: impl TokenProvider) -> Self {
        self.tokens = Some(Arc::new(tokens));
        self
    }

    pub fn token(self, token: impl Into<String>) -> Self {
        self.token_provider(StaticToken::new(token))
    }

    /// Change feed to use instead of [`HttpChangesApi`].
    pub fn api(mut self, api: impl ChangesApi + 'static) -> Self {
        self.api = Some(Arc::new(api));
        self
    }

    /// Connection hooks. A change event hook set here is replaced; use
    /// [`CdcSubscriberBuilder::on_change`].
    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Called for each pushed event the delivery guarantee lets through.
    pub fn on_change(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> CdcResult<CdcSubscriber> {
        self.config.validate()?;

        let subscription_id = self.config.subscription_id;
        let tokens: Arc<dyn TokenProvider> = self
            .tokens
            .unwrap_or_else(|| Arc::new(StaticToken::none()));

        let api: Arc<dyn ChangesApi> = match self.api {
            Some(api) => api,
            None => Arc::new(HttpChangesApi::new(
                self.config.api_base_url.clone(),
                Arc::clone(&tokens),
                self.config.request_timeout,
            )?),
        };

        let tracker = Arc::new(AckTracker::new(
            api,
            subscription_id,
            self.config.guarantee,
            self.config.dedup_window,
        ));

        let recorder = Arc::clone(&tracker);
        let on_change = self.on_change;
        let handlers = self.handlers.on_change_event(move |event| {
            if event.subscription_id != subscription_id {
                warn!(
                    event_id = %event.id,
                    subscription_id = %event.subscription_id,
                    "Ignoring change event for another subscription"
                );
                return;
            }
            if recorder.record(event) {
                if let Some(f) = &on_change {
                    f(event);
                }
            }
        });

        let mut stream = StreamClient::builder(self.config.stream.clone())
            .token_provider(tokens)
            .handlers(handlers);
        if let Some(connector) = self.connector {
            stream = stream.connector(connector);
        }

        Ok(CdcSubscriber {
            client: stream.build()?,
            tracker,
            config: self.config,
        })
    }
}

/// A change-data-capture consumer for one subscription.
#[derive(Debug, Clone)]
pub struct CdcSubscriber {
    client: StreamClient,
    tracker: Arc<AckTracker>,
    config: CdcConfig,
}

impl CdcSubscriber {
    pub fn builder(config: CdcConfig) -> CdcSubscriberBuilder {
        CdcSubscriberBuilder::new(config)
    }

    /// Open the change stream. Returns immediately.
    pub fn connect(&self) {
        info!(
            subscription_id = %self.config.subscription_id,
            guarantee = %self.config.guarantee,
            "Starting CDC subscriber"
        );
        self.client.connect();
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn pause(&self) {
        self.client.pause();
    }

    pub fn resume(&self) {
        self.client.resume();
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn subscription_id(&self) -> Uuid {
        self.config.subscription_id
    }

    pub fn config(&self) -> &CdcConfig {
        &self.config
    }

    /// Acknowledge processed events. See [`AckTracker::acknowledge`].
    pub async fn acknowledge(&self, event_ids: &[Uuid]) -> CdcResult<usize> {
        self.tracker.acknowledge(event_ids).await
    }

    pub async fn acknowledge_pending(&self) -> CdcResult<usize> {
        self.tracker.acknowledge_pending().await
    }

    /// Pull one page of changes.
    pub async fn poll_changes(
        &self,
        limit: usize,
        next_token: Option<String>,
    ) -> CdcResult<ChangesPage> {
        self.tracker.poll_changes(limit, next_token).await
    }

    /// Pull every available change in pages of the configured size.
    pub async fn drain_changes(&self) -> CdcResult<Vec<ChangeEvent>> {
        self.tracker.drain_changes(self.config.poll_limit).await
    }

    pub fn pending(&self) -> Vec<PendingChangeEvent> {
        self.tracker.pending()
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn tracker(&self) -> &Arc<AckTracker> {
        &self.tracker
    }

    /// The underlying stream client.
    pub fn client(&self) -> &StreamClient {
        &self.client
    }
}
