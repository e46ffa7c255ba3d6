use std::sync::Arc;

use crate::supervisor::Supervisor;

/// A long-running task owned by the daemon until it exits.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    async fn run(&self);

    fn name(&self) -> &'static str;
}

/// Drives the supervisor's polling loop.
pub struct StatusPoller {
    supervisor: Arc<Supervisor>,
}

impl StatusPoller {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait::async_trait]
impl Service for StatusPoller {
    async fn run(&self) {
        self.supervisor.clone().run().await;
    }

    fn name(&self) -> &'static str {
        "status poller"
    }
}
