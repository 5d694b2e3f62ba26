//! Service aggregate assembled once at startup
//!
//! Owns the registry, the lifecycle service, the auth service, the catalog,
//! and the orchestrator handle. The gateway and the background loops all
//! share it behind an `Arc`.

use crate::auth::AuthService;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::instance::InstanceRegistry;
use crate::kubernetes::Orchestrator;
use crate::lifecycle::{InstanceService, Quotas};
use std::sync::Arc;

pub struct Services {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<InstanceRegistry>,
    pub instances: Arc<InstanceService>,
    pub auth: Arc<AuthService>,
    pub orchestrator: Arc<dyn Orchestrator>,
}

impl Services {
    pub fn new(
        config: Config,
        catalog: Catalog,
        orchestrator: Arc<dyn Orchestrator>,
        auth: AuthService,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let catalog = Arc::new(catalog);
        let registry = Arc::new(InstanceRegistry::new());
        let instances = Arc::new(InstanceService::new(
            Arc::clone(&registry),
            Arc::clone(&orchestrator),
            Arc::clone(&catalog),
            Quotas::from(config.as_ref()),
        ));

        Arc::new(Self {
            config,
            catalog,
            registry,
            instances,
            auth: Arc::new(auth),
            orchestrator,
        })
    }
}
