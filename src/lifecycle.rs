//! Host-side lifecycle for the selected broker.
//!
//! The host calls [`BrokerRuntime::bootstrap`] once, after every component
//! has registered its subscriptions and before external traffic starts, and
//! [`BrokerRuntime::shutdown`] before the process exits.
//!
//! ## Example
//!
//! ```ignore
//! let config = BrokerConfig::from_env();
//! let adapters = BrokerAdapters::new()
//!     .with_amqp(Arc::new(AmqpBroker::new(connection, TopicRegistry::from_config(&config))));
//! let runtime = BrokerRuntime::from_config(&config, &adapters)?;
//!
//! runtime.broker().subscribe("evaluation-results", on_result)?;
//! runtime.run_until(tokio::signal::ctrl_c().map(|_| ())).await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bus::{select_broker, BrokerAdapters, MessageBroker};
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Owns the selected broker and guards its lifecycle hooks.
pub struct BrokerRuntime {
    broker: Arc<dyn MessageBroker>,
    bootstrapped: AtomicBool,
}

impl BrokerRuntime {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            bootstrapped: AtomicBool::new(false),
        }
    }

    /// Select the configured adapter. Fails immediately on a bad selector.
    pub fn from_config(config: &BrokerConfig, adapters: &BrokerAdapters) -> Result<Self, BrokerError> {
        Ok(Self::new(select_broker(config, adapters)?))
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    /// Start consumers for every pending subscription. Runs at most once;
    /// later calls are logged and ignored.
    pub async fn bootstrap(&self) -> Result<(), BrokerError> {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            warn!(broker = %self.broker.kind(), "broker already bootstrapped, ignoring");
            return Ok(());
        }

        let pending = self.broker.pending_subscriptions();
        info!(broker = %self.broker.kind(), subscriptions = pending, "bootstrapping message broker");
        match self.broker.bootstrap().await {
            Ok(()) => {
                info!(broker = %self.broker.kind(), "message broker ready");
                Ok(())
            }
            Err(err) => {
                error!(broker = %self.broker.kind(), error = %err, "message broker bootstrap failed");
                Err(err)
            }
        }
    }

    /// Release broker resources. Errors are logged and returned so the
    /// caller can inspect them; they should not stop the process exiting.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        match self.broker.shutdown().await {
            Ok(()) => {
                info!(broker = %self.broker.kind(), "message broker shut down");
                Ok(())
            }
            Err(err) => {
                error!(broker = %self.broker.kind(), error = %err, "message broker shutdown reported errors");
                Err(err)
            }
        }
    }

    /// Bootstrap, wait for `signal`, then shut down.
    ///
    /// A failed bootstrap still shuts down before returning its error.
    /// Shutdown errors are logged only.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), BrokerError>
    where
        F: Future<Output = ()>,
    {
        if let Err(err) = self.bootstrap().await {
            let _ = self.shutdown().await;
            return Err(err);
        }
        signal.await;
        let _ = self.shutdown().await;
        Ok(())
    }
}
