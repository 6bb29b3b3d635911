pub mod activation;
pub mod api;
pub mod checkout;
pub mod config;
pub mod docs;
pub mod duplicates;
pub mod error;
pub mod evidence;
pub mod intake;
pub mod models;
pub mod moderation;
pub mod provider;
pub mod provider_events;
pub mod reconcile;
pub mod registration;
pub mod review;
pub mod store;

use std::sync::Arc;

use activation::Activator;
use checkout::Checkout;
use config::Config;
use evidence::{EvidenceStore, Gatekeeper};
use moderation::Moderation;
use provider::BillingProvider;
use provider_events::ProviderEvents;
use reconcile::Reconciler;
use registration::Registrar;
use review::ReviewQueue;
use store::PaymentStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PaymentStore>,
    pub evidence: Arc<dyn EvidenceStore>,
    pub provider: Arc<dyn BillingProvider>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn registrar(&self) -> Registrar {
        Registrar::new(self.store.clone(), self.evidence.clone(), self.config.clone())
    }

    pub fn activator(&self) -> Activator {
        Activator::new(self.store.clone(), self.provider.clone(), self.config.clone())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.provider.clone(),
            self.config.provider_timeout(),
        )
    }

    pub fn checkout(&self) -> Checkout {
        Checkout::new(self.store.clone(), self.provider.clone(), self.config.clone())
    }

    pub fn provider_events(&self) -> ProviderEvents {
        ProviderEvents::new(self.store.clone(), self.reconciler())
    }

    pub fn review_queue(&self) -> ReviewQueue {
        ReviewQueue::new(self.store.clone())
    }

    pub fn gatekeeper(&self) -> Gatekeeper {
        Gatekeeper::new(self.store.clone(), self.evidence.clone())
    }

    pub fn moderation(&self) -> Moderation {
        Moderation::new(self.store.clone())
    }
}
