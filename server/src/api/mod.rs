pub mod auth;
pub mod error;
pub mod routes;
pub mod server;

use std::sync::Arc;

use crate::delivery::DeliveryEngine;
use crate::feed::FeedPipeline;
use crate::poller::BootstrapPoller;
use crate::store::Store;
use crate::subscriptions::SubscriptionManager;

pub use server::ApiServer;

/// Shared handles every HTTP handler needs, cloned cheaply per request
/// (every field is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub subscriptions: Arc<SubscriptionManager>,
    pub feeds: Arc<FeedPipeline>,
    pub delivery: Arc<DeliveryEngine>,
    pub poller: Arc<BootstrapPoller>,
    pub store: Arc<Store>,
}
