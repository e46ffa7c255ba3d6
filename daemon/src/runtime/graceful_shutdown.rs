use astro_protocol::server::AdminAck;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use super::service::Service;
use crate::supervisor::Supervisor;

const BUSY_RETRY: Duration = Duration::from_millis(500);

/// Runs the daemon's services until the supervisor asks the daemon to exit.
///
/// Ctrl+C becomes a full kill of the server (directory cleanup included)
/// rather than an abrupt exit.
pub struct GracefulShutdown {
    supervisor: Arc<Supervisor>,
    services: Vec<Arc<dyn Service>>,
}

impl GracefulShutdown {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            services: vec![],
        }
    }

    pub fn add_service(&mut self, service: impl Service + 'static) {
        self.services.push(Arc::new(service));
    }

    pub async fn watch(mut self, stop_notify: Arc<Notify>) {
        let mut join_set = JoinSet::new();
        for service in self.services.drain(..) {
            join_set.spawn(async move {
                debug!("{} started", service.name());
                service.run().await;
                debug!("{} finished", service.name());
            });
        }

        let supervisor = self.supervisor.clone();
        join_set.spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Can't install the Ctrl+C handler: {}", err);
                return;
            }
            info!("Ctrl+C received, shutting down");
            // an operation in progress must finish before the kill can run
            while supervisor.kill_server("Ctrl+C", true).await == AdminAck::Busy {
                tokio::time::sleep(BUSY_RETRY).await;
            }
        });

        debug!("graceful shutdown start watching");
        stop_notify.notified().await;
        join_set.shutdown().await;
    }
}
