//! The transport state machine
//!
//! [`Transport`] owns the persistent cache, the pairing client and the
//! current broker session. It runs as a single task: every cache mutation,
//! status change and publish decision happens on that task, in the order
//! the inputs arrive.
//!
//! Session setup runs as a background future so that publishes keep being
//! queued while pairing or the broker-info lookup is retrying:
//!
//! ```text
//! pair (if needed) -> broker info -> renewal check -> TLS identity -> connect
//! ```
//!
//! On `Connected` the transport resyncs if the broker lost the session or the
//! local sync flag is clear, then drains the retry queue. The sync flag is set
//! once the broker has confirmed every resync publish; a disconnection before
//! that leaves it clear so the next session resyncs again.

use super::adapter::InterfaceAdapter;
use super::handle::{TransportCommand, TransportHandle, TransportSnapshot, COMMAND_CAPACITY};
use super::mqtt::{
    BrokerEvent, BrokerEventReceiver, BrokerFactory, ConnectionStatus, MqttClient, MqttError,
};
use super::sync_state::SyncState;
use super::watchdog::{LoggingRebootHandler, RebootHandler, RebootWatchdog};
use super::TransportOptions;
use crate::cache::PersistentCache;
use crate::config::TransportConfig;
use crate::error::{sanitize_error_message, TransportResult};
use crate::interface::Introspection;
use crate::pairing::{CertificateStatus, PairingClient, PairingError};
use crate::protocol::topics::{self, CONTROL_INTERFACE};
use crate::protocol::{InterfaceType, Message, MessageId, Qos, Reliability, Retention};
use crate::retry::{RetryPolicy, CERTIFICATE_RENEWAL_WINDOW};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

type Task<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// What the run loop must do after an event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Handled,
    /// CONNACK never arrived: ask the pairing endpoint about the certificate.
    VerifyCertificate,
}

/// A connecting broker session and the channel it reports on.
pub struct Session {
    pub client: Box<dyn MqttClient>,
    /// Certificate common name, used as client id and root topic.
    pub root: String,
    pub events: BrokerEventReceiver,
}

/// Everything needed to build a session away from the transport task.
struct SessionBuilder {
    pairing: PairingClient,
    factory: Arc<dyn BrokerFactory>,
    pairing_retry: RetryPolicy,
    endpoint_retry: RetryPolicy,
}

impl SessionBuilder {
    /// Retry until a session is connecting. Never fails: every error is
    /// logged and followed by a randomized wait.
    async fn establish(self, mut force_pairing: bool) -> Session {
        let mut paired_now = false;
        loop {
            if force_pairing || !self.pairing.is_paired() {
                match self.pairing.pair(true).await {
                    Ok(()) => {
                        force_pairing = false;
                        paired_now = true;
                    }
                    Err(e) => {
                        self.wait("pairing", self.pairing_retry, &e.to_string()).await;
                        continue;
                    }
                }
            }

            let broker = match self.pairing.broker_info().await {
                Ok(broker) => broker,
                Err(e) => {
                    self.wait("broker_info", self.endpoint_retry, &e.to_string()).await;
                    continue;
                }
            };

            let certificate = match self.pairing.certificate_info() {
                Ok(certificate) => certificate,
                Err(e) => {
                    warn!(
                        error = %sanitize_error_message(&e.to_string()),
                        "Stored certificate is unusable, pairing again"
                    );
                    force_pairing = true;
                    continue;
                }
            };
            if !paired_now && certificate.expires_within(CERTIFICATE_RENEWAL_WINDOW, Utc::now()) {
                info!(
                    not_after = %certificate.not_after,
                    "Certificate close to expiry, renewing before connecting"
                );
                force_pairing = true;
                continue;
            }

            let identity = match self.pairing.tls_identity() {
                Ok(identity) => identity,
                Err(e) => {
                    self.wait("tls_identity", self.pairing_retry, &e.to_string()).await;
                    continue;
                }
            };

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let mut client = match self.factory.create(
                &broker,
                &identity,
                &certificate.common_name,
                events_tx,
            ) {
                Ok(client) => client,
                Err(e) => {
                    self.wait("broker_client", self.endpoint_retry, &e.to_string()).await;
                    continue;
                }
            };
            if let Err(e) = client.connect().await {
                self.wait("broker_connect", self.endpoint_retry, &e.to_string()).await;
                continue;
            }

            info!(
                broker_url = %broker.url,
                client_id = %certificate.common_name,
                "Broker session starting"
            );
            return Session {
                client,
                root: certificate.common_name,
                events: events_rx,
            };
        }
    }

    async fn wait(&self, operation: &str, policy: RetryPolicy, error: &str) {
        let delay = policy.next_delay();
        warn!(
            operation,
            delay_ms = delay.as_millis() as u64,
            error = %sanitize_error_message(error),
            "Session setup failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Device transport: pairing, broker session and delivery bookkeeping
pub struct Transport {
    cache: PersistentCache,
    pairing: PairingClient,
    factory: Arc<dyn BrokerFactory>,
    introspection: Arc<Introspection>,
    adapters: HashMap<String, Arc<dyn InterfaceAdapter>>,
    sync: SyncState,
    /// Resync publishes the broker has not confirmed yet.
    resync_pending: HashSet<MessageId>,
    options: TransportOptions,
    watchdog: RebootWatchdog,
    reboot: Arc<dyn RebootHandler>,
    broker: Option<Box<dyn MqttClient>>,
    root: Option<String>,
    events: Option<BrokerEventReceiver>,
    status: ConnectionStatus,
    commands_tx: mpsc::Sender<TransportCommand>,
    commands_rx: mpsc::Receiver<TransportCommand>,
}

impl Transport {
    /// Open the cache and prepare pairing. Fails only on fatal errors.
    pub fn new(
        config: &TransportConfig,
        hardware_id: &str,
        introspection: Introspection,
        factory: Arc<dyn BrokerFactory>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let options = TransportOptions::from_config(config);
        let cache = PersistentCache::open(&config.database_path())?;
        let pairing =
            PairingClient::new(config, hardware_id)?.with_endpoint_retry(options.endpoint_retry);
        let sync = SyncState::load(&config.sync_state_path());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        info!(
            hardware_id,
            interfaces = introspection.len(),
            retry = cache.all_retry_ids().len(),
            persistent = cache.all_persistent_entries().len(),
            synced = sync.is_synced(),
            "Transport initialized"
        );

        Ok(Self {
            cache,
            pairing,
            factory,
            introspection: Arc::new(introspection),
            adapters: HashMap::new(),
            sync,
            resync_pending: HashSet::new(),
            watchdog: watchdog_for(&options),
            options,
            reboot: Arc::new(LoggingRebootHandler),
            broker: None,
            root: None,
            events: None,
            status: ConnectionStatus::Disconnected,
            commands_tx,
            commands_rx,
        })
    }

    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.pairing = self.pairing.with_endpoint_retry(options.endpoint_retry);
        self.watchdog = watchdog_for(&options);
        self.options = options;
        self
    }

    pub fn with_reboot_handler(mut self, handler: Arc<dyn RebootHandler>) -> Self {
        self.reboot = handler;
        self
    }

    /// Route inbound traffic for `interface` to `adapter`.
    pub fn register_adapter(&mut self, interface: impl Into<String>, adapter: Arc<dyn InterfaceAdapter>) {
        self.adapters.insert(interface.into(), adapter);
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle::new(self.commands_tx.clone(), Arc::clone(&self.introspection))
    }

    pub fn cache(&self) -> &PersistentCache {
        &self.cache
    }

    pub fn pairing(&self) -> &PairingClient {
        &self.pairing
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_synced(&self) -> bool {
        self.sync.is_synced()
    }

    pub fn root_topic(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn reboot_deadline(&self) -> Option<Instant> {
        self.watchdog.deadline()
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            status: self.status,
            synced: self.sync.is_synced(),
            paired: self.pairing.is_paired(),
            in_flight: self.cache.in_flight_ids().len(),
            retry: self.cache.all_retry_ids().len(),
            persistent: self.cache.all_persistent_entries().len(),
        }
    }

    /// Run until [`TransportHandle::shutdown`].
    pub async fn run(mut self) -> TransportResult<()> {
        let span = crate::transport_span!(hardware_id = %self.pairing.hardware_id());
        async move {
            info!("Transport running");
            self.watchdog.arm();
            let mut establishing = Some(self.establish_session(false));
            let mut verifying: Option<Task<Result<CertificateStatus, PairingError>>> = None;

            loop {
                let expiry = self.cache.next_expiry();
                let reboot = self.watchdog.deadline();

                tokio::select! {
                    command = self.commands_rx.recv() => match command {
                        Some(TransportCommand::Publish(message)) => self.cache_message(message).await,
                        Some(TransportCommand::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(TransportCommand::Shutdown) | None => break,
                    },
                    event = next_event(&mut self.events) => match event {
                        Some(event) => {
                            let outcome = self.handle_broker_event(event).await;
                            if outcome == EventOutcome::VerifyCertificate && verifying.is_none() {
                                let pairing = self.pairing.clone();
                                verifying = Some(Box::pin(async move {
                                    pairing.verify_certificate().await
                                }));
                            }
                        }
                        None => self.events = None,
                    },
                    session = poll_task(&mut establishing) => {
                        establishing = None;
                        self.attach(session).await;
                    }
                    result = poll_task(&mut verifying) => {
                        verifying = None;
                        if certificate_rejected(&result) && establishing.is_none() {
                            self.detach().await;
                            establishing = Some(self.establish_session(true));
                        }
                    }
                    _ = sleep_until(expiry) => {
                        crate::cache_span!(operation = "purge_expired")
                            .in_scope(|| self.cache.purge_expired());
                    }
                    _ = sleep_until(reboot) => {
                        if self.watchdog.fire_if_due(Instant::now()) {
                            self.reboot.request_reboot();
                        }
                    }
                }
            }

            info!("Transport shutting down");
            self.detach().await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Build and attach a session in the foreground.
    pub async fn connect(&mut self, force_pairing: bool) {
        let session = self.establish_session(force_pairing).await;
        self.attach(session).await;
    }

    /// Handle every broker event already queued. Certificate verification
    /// triggered by a CONNACK timeout is awaited inline.
    pub async fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let Some(event) = self.events.as_mut().and_then(|events| events.try_recv().ok()) else {
                return handled;
            };
            handled += 1;
            if self.handle_broker_event(event).await == EventOutcome::VerifyCertificate {
                let result = self.pairing.verify_certificate().await;
                if certificate_rejected(&result) {
                    self.detach().await;
                    self.connect(true).await;
                }
            }
        }
    }

    /// Validate and publish on behalf of an adapter.
    pub async fn publish(&mut self, request: super::PublishRequest) -> TransportResult<()> {
        let message = request.into_message(&self.introspection)?;
        self.cache_message(message).await;
        Ok(())
    }

    /// Outbound publish policy.
    pub async fn cache_message(&mut self, message: Message) {
        let session = match (self.broker.as_deref(), self.root.as_deref()) {
            (Some(broker), Some(root)) if self.status == ConnectionStatus::Connected => {
                Some((broker, root))
            }
            _ => None,
        };
        let Some((broker, root)) = session else {
            debug!(target_path = %message.target, status = ?self.status, "No broker session");
            self.handle_failed_publish(message);
            return;
        };

        // Compared against the last confirmed value only; in-flight values do not count.
        if message.interface_type == InterfaceType::Properties
            && self.cache.persistent_entry(&message.target) == Some(message.payload.as_slice())
        {
            debug!(target_path = %message.target, "Property unchanged, not publishing");
            self.cache.discard(&message);
            return;
        }

        let topic = topics::data_topic(root, &message.target);
        let qos = message.reliability.qos();
        match broker.publish(&topic, message.payload.clone(), qos, false).await {
            Ok(id) => {
                debug!(message_id = %id, target_path = %message.target, ?qos, "Message published");
                self.cache.add_in_flight(id, message);
            }
            Err(e) => {
                warn!(target_path = %message.target, error = %e, "Publish rejected");
                self.handle_failed_publish(message);
            }
        }
    }

    fn handle_failed_publish(&mut self, message: Message) {
        if message.retention != Retention::Discard {
            self.cache.add_retry(message);
            return;
        }

        warn!(target_path = %message.target, "Dropping undeliverable Discard message");
        match self.adapters.get(message.interface_name()) {
            Some(adapter) => {
                adapter.on_publish_error(message.interface_name(), message.path(), &message.payload)
            }
            None => debug!(interface = %message.interface_name(), "No adapter to notify"),
        }
    }

    /// Apply one broker event.
    pub async fn handle_broker_event(&mut self, event: BrokerEvent) -> EventOutcome {
        match event {
            BrokerEvent::StatusChanged(status) => self.on_status_changed(status),
            BrokerEvent::Connected { session_present } => self.on_connected(session_present).await,
            BrokerEvent::MessageReceived { topic, payload } => self.route_inbound(&topic, &payload),
            BrokerEvent::PublishConfirmed(id) => self.on_publish_confirmed(id),
            BrokerEvent::ConnackTimeout => {
                warn!("CONNACK timeout, verifying certificate");
                return EventOutcome::VerifyCertificate;
            }
            BrokerEvent::ConnectionFailed(reason) => {
                debug!(reason = %sanitize_error_message(&reason), "Broker connection attempt failed");
            }
        }
        EventOutcome::Handled
    }

    fn on_status_changed(&mut self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut self.status, status);
        debug!(from = ?previous, to = ?status, "Transport sees broker status");

        if status == ConnectionStatus::Connected {
            self.watchdog.disarm();
        } else {
            if !self.resync_pending.is_empty() {
                warn!(
                    unconfirmed = self.resync_pending.len(),
                    "Connection lost during resync, resyncing on next connection"
                );
                self.resync_pending.clear();
            }
            self.cache.reset_in_flight();
            self.watchdog.arm();
        }
    }

    async fn on_connected(&mut self, session_present: bool) {
        if !session_present || !self.sync.is_synced() {
            info!(session_present, synced = self.sync.is_synced(), "Broker needs a full resync");
            if let Err(e) = self.synchronize().await {
                warn!(error = %e, "Resync failed, retrying on next connection");
            }
        }
        self.resend_retry_queue().await;
    }

    /// Resubscribe, announce the introspection and republish every property.
    ///
    /// Property republishes are tracked in flight like any other publish. The
    /// sync flag stays clear until every resync publish is confirmed.
    async fn synchronize(&mut self) -> TransportResult<()> {
        self.sync.set(false);
        self.resync_pending.clear();

        let (Some(broker), Some(root)) = (self.broker.as_deref(), self.root.as_deref()) else {
            return Err(MqttError::NotConnected {
                status: self.status,
            }
            .into());
        };

        broker
            .subscribe(&topics::control_subscription(root), Qos::ExactlyOnce)
            .await?;
        for interface in self.introspection.consumers() {
            for topic in topics::interface_subscriptions(root, &interface.name) {
                broker.subscribe(&topic, Qos::ExactlyOnce).await?;
            }
        }

        let mut pending = HashSet::new();
        pending.insert(
            broker
                .publish(root, self.introspection.payload().into_bytes(), Qos::ExactlyOnce, false)
                .await?,
        );
        pending.insert(
            broker
                .publish(&topics::empty_cache_topic(root), b"1".to_vec(), Qos::ExactlyOnce, false)
                .await?,
        );

        let properties = self.cache.all_persistent_entries();
        let paths = topics::producer_properties_payload(properties.keys().map(String::as_str))?;
        pending.insert(
            broker
                .publish(&topics::producer_properties_topic(root), paths, Qos::ExactlyOnce, false)
                .await?,
        );

        let mut republished = Vec::with_capacity(properties.len());
        let mut failure = None;
        for (target, payload) in properties {
            match broker
                .publish(&topics::data_topic(root, target), payload.clone(), Qos::ExactlyOnce, false)
                .await
            {
                Ok(id) => republished.push((
                    id,
                    Message::new(target.clone(), payload.clone(), InterfaceType::Properties)
                        .with_retention(Retention::Stored)
                        .with_reliability(Reliability::Unique),
                )),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let count = republished.len();
        for (id, message) in republished {
            pending.insert(id);
            self.cache.add_in_flight(id, message);
        }
        if let Some(e) = failure {
            return Err(e.into());
        }

        self.resync_pending = pending;
        info!(
            properties = count,
            unconfirmed = self.resync_pending.len(),
            "Resync sent, waiting for confirmation"
        );
        Ok(())
    }

    async fn resend_retry_queue(&mut self) {
        let ids = self.cache.all_retry_ids();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Resending queued messages");
        for id in ids {
            if let Some(message) = self.cache.take_retry(id) {
                self.cache_message(message).await;
            }
        }
    }

    fn on_publish_confirmed(&mut self, id: MessageId) {
        let resync = self.resync_pending.remove(&id);
        if resync && self.resync_pending.is_empty() {
            self.sync.set(true);
            info!("Resync complete");
        }

        let Some(message) = self.cache.take_in_flight(id) else {
            if !resync {
                debug!(message_id = %id, "Confirmation for an untracked message");
            }
            return;
        };
        debug!(message_id = %id, target_path = %message.target, "Publish confirmed");

        if message.interface_type == InterfaceType::Properties {
            if message.is_unset() {
                self.cache.remove_persistent_entry(&message.target);
            } else {
                self.cache
                    .upsert_persistent_entry(&message.target, &message.payload);
            }
        }
    }

    fn route_inbound(&self, topic: &str, payload: &[u8]) {
        let Some(root) = self.root.as_deref() else {
            return;
        };
        let Some((interface, path)) = topics::strip_root(topic, root).and_then(topics::split_target)
        else {
            warn!(topic, "Message outside the device topic tree");
            return;
        };

        if interface == CONTROL_INTERFACE {
            debug!(path, "Control message ignored");
            return;
        }

        match self.adapters.get(interface) {
            Some(adapter) if payload.is_empty() => adapter.on_unset(interface, path),
            Some(adapter) => adapter.on_receive(interface, path, payload),
            None => debug!(interface, path, "No adapter for interface, message dropped"),
        }
    }

    fn establish_session(&self, force_pairing: bool) -> Task<Session> {
        let builder = SessionBuilder {
            pairing: self.pairing.clone(),
            factory: Arc::clone(&self.factory),
            pairing_retry: self.options.pairing_retry,
            endpoint_retry: self.options.endpoint_retry,
        };
        Box::pin(builder.establish(force_pairing))
    }

    async fn attach(&mut self, session: Session) {
        self.detach().await;
        self.broker = Some(session.client);
        self.root = Some(session.root);
        self.events = Some(session.events);
    }

    /// Tear down the current session; in-flight messages go back to retry.
    async fn detach(&mut self) {
        let Some(mut broker) = self.broker.take() else {
            return;
        };
        if let Err(e) = broker.disconnect().await {
            debug!(error = %e, "Broker disconnect failed");
        }
        self.events = None;
        self.root = None;
        self.on_status_changed(ConnectionStatus::Disconnected);
    }
}

fn watchdog_for(options: &TransportOptions) -> RebootWatchdog {
    match options.reboot_retry {
        Some(policy) => RebootWatchdog::new(policy),
        None => RebootWatchdog::disabled(),
    }
}

fn certificate_rejected(result: &Result<CertificateStatus, PairingError>) -> bool {
    match result {
        Ok(status) => {
            info!(valid_until = ?status.valid_until, "Certificate still valid, waiting for the broker");
            false
        }
        Err(PairingError::InvalidCertificate { .. } | PairingError::EmptyCertificate) => {
            warn!("Certificate rejected, forcing a new pairing");
            true
        }
        Err(e) => {
            warn!(error = %sanitize_error_message(&e.to_string()), "Certificate verification failed");
            false
        }
    }
}

async fn next_event(events: &mut Option<BrokerEventReceiver>) -> Option<BrokerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_task<T>(task: &mut Option<Task<T>>) -> T {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
