//! # cdc-client
//!
//! Change-data-capture consumer for RustyDB.
//!
//! Change events reach a consumer two ways: pushed over the subscription's
//! realtime stream, and pulled from the REST change feed. Both paths record
//! events in an [`AckTracker`] until they are acknowledged, which is what
//! makes at-least-once delivery hold across dropped connections.
//!
//! ```rust,no_run
//! use cdc_client::{CdcConfig, CdcSubscriber};
//! use uuid::Uuid;
//!
//! # async fn example(subscription_id: Uuid) -> cdc_client::CdcResult<()> {
//! let subscriber = CdcSubscriber::builder(CdcConfig::new(subscription_id))
//!     .token("secret")
//!     .on_change(|event| println!("{} {}", event.change_type, event.table_name))
//!     .build()?;
//! subscriber.connect();
//!
//! // catch up on anything missed while offline, then confirm it
//! let missed = subscriber.drain_changes().await?;
//! let ids: Vec<Uuid> = missed.iter().map(|e| e.id).collect();
//! subscriber.acknowledge(&ids).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod error;
pub mod subscriber;
pub mod tracker;

pub use api::{ChangesApi, ChangesPage, HttpChangesApi};
pub use error::{CdcError, CdcResult};
pub use subscriber::{CdcConfig, CdcSubscriber, CdcSubscriberBuilder, DEFAULT_API_BASE_URL};
pub use tracker::{AckTracker, PendingChangeEvent};

pub use realtime_stream::{ChangeEvent, ChangeType, DeliveryGuarantee};
