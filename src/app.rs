//! App controller
//!
//! Owns the lifecycle of every subsystem: netfilter cleanup, the DNS
//! MITM listeners, the :53 port remap, the configured groups, the
//! control socket and the link monitor. Startup steps are reversed in
//! opposite order on teardown, so a cancelled run leaves no prefixed
//! chains, no prefixed sets and no socket file behind.
//!
//! The [`Engine`] half is the group engine: it receives every answer
//! section the proxy observes, feeds the record store and translates
//! domain matches into IP-set membership.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::{
    AppConfig, Config, GroupConfig, GroupId, SUPPORTED_CONFIG_VERSION_PREFIX,
    EXPORT_CONFIG_VERSION,
};
use crate::control;
use crate::dns::{
    listen_tcp, listen_udp, nxdomain_response, DnsMitmProxy, RequestAction, RequestHook,
    UpstreamResolver,
};
use crate::error::{ConfigError, GroupError, MagitrickleError, Result};
use crate::group::Group;
use crate::link::{self, LinkEvent};
use crate::netfilter::{CommandRunner, NetfilterHelper, PortRemap, SystemCommandRunner};
use crate::records::Records;

/// Group engine: shared group state plus the answer-processing paths
///
/// Incremental updates arrive through [`Engine::handle_message`]; full
/// reconciliation happens through [`Group::sync`] when a group joins at
/// runtime.
pub struct Engine {
    records: Arc<Records>,
    groups: RwLock<Vec<Arc<Group>>>,
    additional_ttl: AtomicU32,
}

impl Engine {
    /// Create an engine over a record store
    #[must_use]
    pub fn new(records: Arc<Records>, additional_ttl: u32) -> Self {
        Self {
            records,
            groups: RwLock::new(Vec::new()),
            additional_ttl: AtomicU32::new(additional_ttl),
        }
    }

    /// The record store backing this engine
    #[must_use]
    pub fn records(&self) -> &Arc<Records> {
        &self.records
    }

    /// Seconds added to each learned DNS TTL
    #[must_use]
    pub fn additional_ttl(&self) -> u32 {
        self.additional_ttl.load(Ordering::Relaxed)
    }

    /// Update the additional TTL (config import)
    pub fn set_additional_ttl(&self, seconds: u32) {
        self.additional_ttl.store(seconds, Ordering::Relaxed);
    }

    /// Snapshot of the current groups
    ///
    /// Callers iterate the snapshot so no lock is held across I/O.
    #[must_use]
    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.groups.read().clone()
    }

    /// Whether a group with this id exists
    #[must_use]
    pub fn contains_group(&self, id: GroupId) -> bool {
        self.groups.read().iter().any(|g| g.id() == id)
    }

    /// Register a constructed group
    pub fn insert_group(&self, group: Arc<Group>) {
        self.groups.write().push(group);
    }

    /// Remove and return every group (teardown)
    #[must_use]
    pub fn take_groups(&self) -> Vec<Arc<Group>> {
        std::mem::take(&mut *self.groups.write())
    }

    /// Process every answer RR of a DNS message, in order
    pub async fn handle_message(&self, message: Message) {
        for record in message.answers() {
            let name = record.name().to_ascii();
            match record.data() {
                Some(RData::A(a)) => {
                    self.process_address(&name, a.0.into(), record.ttl()).await;
                }
                Some(RData::AAAA(aaaa)) => {
                    self.process_address(&name, aaaa.0.into(), record.ttl()).await;
                }
                Some(RData::CNAME(cname)) => {
                    self.process_cname(&name, &cname.0.to_ascii(), record.ttl())
                        .await;
                }
                _ => {}
            }
        }
    }

    /// Handle an observed A/AAAA record
    async fn process_address(&self, name: &str, address: std::net::IpAddr, rr_ttl: u32) {
        let ttl = rr_ttl.saturating_add(self.additional_ttl());
        trace!(name, address = %address, ttl = rr_ttl, "processing address record");

        self.records.put_a(name, address, ttl);

        let names = self.records.aliases(name);
        for group in self.groups() {
            if !group.matches_any(&names) {
                continue;
            }
            match group.add_ip(address, Some(ttl)).await {
                Ok(()) => {
                    debug!(group = %group.id(), address = %address, name, "address added");
                }
                Err(e) => {
                    error!(group = %group.id(), address = %address, error = %e, "failed to add address");
                }
            }
        }
    }

    /// Handle an observed CNAME record
    ///
    /// A new alias edge can change which groups the already-known
    /// addresses of `name` belong to, so they are re-evaluated with
    /// their remaining lifetimes.
    async fn process_cname(&self, name: &str, target: &str, rr_ttl: u32) {
        let ttl = rr_ttl.saturating_add(self.additional_ttl());
        trace!(name, target, ttl = rr_ttl, "processing cname record");

        self.records.put_cname(name, target, ttl);

        let now = Instant::now();
        let a_records = self.records.get_a(name);
        let names = self.records.aliases(name);
        for group in self.groups() {
            if !group.matches_any(&names) {
                continue;
            }
            for record in &a_records {
                let remaining = record.remaining_secs(now);
                if remaining == 0 {
                    continue;
                }
                match group.add_ip(record.address, Some(remaining)).await {
                    Ok(()) => {
                        debug!(group = %group.id(), address = %record.address, name, "address added via cname");
                    }
                    Err(e) => {
                        error!(group = %group.id(), address = %record.address, error = %e, "failed to add address");
                    }
                }
            }
        }
    }
}

/// The daemon: configuration, engine and run lifecycle
pub struct App {
    config: RwLock<AppConfig>,
    unprocessed_groups: Mutex<Vec<GroupConfig>>,
    records: Arc<Records>,
    engine: Arc<Engine>,
    runner: Arc<dyn CommandRunner>,
    helper: RwLock<Option<Arc<NetfilterHelper>>>,
    port_remap: RwLock<Option<Arc<PortRemap>>>,
    control_socket_path: RwLock<PathBuf>,
    is_running: AtomicBool,
}

impl App {
    /// Create an app with default configuration and the system runner
    #[must_use]
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommandRunner::new()))
    }

    /// Create an app with a custom command runner
    #[must_use]
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        let config = AppConfig::default();
        let records = Arc::new(Records::new());
        let engine = Arc::new(Engine::new(
            Arc::clone(&records),
            config.netfilter.ipset.additional_ttl,
        ));
        Self {
            config: RwLock::new(config),
            unprocessed_groups: Mutex::new(Vec::new()),
            records,
            engine,
            runner,
            helper: RwLock::new(None),
            port_remap: RwLock::new(None),
            control_socket_path: RwLock::new(PathBuf::from(control::CONTROL_SOCKET_PATH)),
            is_running: AtomicBool::new(false),
        }
    }

    /// The record store
    #[must_use]
    pub fn records(&self) -> &Arc<Records> {
        &self.records
    }

    /// The group engine
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// A copy of the current daemon configuration
    #[must_use]
    pub fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Whether the app is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Override the control socket path (defaults to the well-known one)
    pub fn set_control_socket_path(&self, path: impl Into<PathBuf>) {
        *self.control_socket_path.write() = path.into();
    }

    /// Merge an imported configuration document into the app
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedVersion` unless the version
    /// carries the supported prefix; rejects invalid documents without
    /// touching state.
    pub fn import_config(&self, config: Config) -> std::result::Result<(), ConfigError> {
        if !config
            .config_version
            .starts_with(SUPPORTED_CONFIG_VERSION_PREFIX)
        {
            return Err(ConfigError::UnsupportedVersion(config.config_version));
        }
        config.validate()?;

        let incoming = config.app;
        {
            let mut current = self.config.write();
            if !incoming.dns_proxy.upstream.address.is_empty() {
                current.dns_proxy.upstream.address = incoming.dns_proxy.upstream.address;
            }
            if incoming.dns_proxy.upstream.port != 0 {
                current.dns_proxy.upstream.port = incoming.dns_proxy.upstream.port;
            }
            if !incoming.dns_proxy.host.address.is_empty() {
                current.dns_proxy.host.address = incoming.dns_proxy.host.address;
            }
            if incoming.dns_proxy.host.port != 0 {
                current.dns_proxy.host.port = incoming.dns_proxy.host.port;
            }
            current.dns_proxy.disable_remap_53 = incoming.dns_proxy.disable_remap_53;
            current.dns_proxy.disable_fake_ptr = incoming.dns_proxy.disable_fake_ptr;
            if !incoming.netfilter.iptables.chain_prefix.is_empty() {
                current.netfilter.iptables.chain_prefix = incoming.netfilter.iptables.chain_prefix;
            }
            if !incoming.netfilter.ipset.table_prefix.is_empty() {
                current.netfilter.ipset.table_prefix = incoming.netfilter.ipset.table_prefix;
            }
            current.netfilter.ipset.additional_ttl = incoming.netfilter.ipset.additional_ttl;
            if !incoming.link.is_empty() {
                current.link = incoming.link;
            }
            if !incoming.log_level.is_empty() {
                current.log_level = incoming.log_level;
            }
            self.engine
                .set_additional_ttl(current.netfilter.ipset.additional_ttl);
        }

        *self.unprocessed_groups.lock() = config.groups;

        Ok(())
    }

    /// Export the current state as a configuration document
    #[must_use]
    pub fn export_config(&self) -> Config {
        let mut groups: Vec<GroupConfig> = self
            .engine
            .groups()
            .iter()
            .map(|g| g.config().clone())
            .collect();
        groups.extend(self.unprocessed_groups.lock().iter().cloned());

        Config {
            config_version: EXPORT_CONFIG_VERSION.to_string(),
            app: self.config.read().clone(),
            groups,
        }
    }

    /// Add a group to the app
    ///
    /// Before the firewall adapter exists the group is queued; once the
    /// app is constructing state the group is built immediately and,
    /// while running, seeded from the record cache via `sync`.
    ///
    /// # Errors
    ///
    /// Returns `GroupError::GroupIdConflict`, `GroupError::RuleIdConflict`
    /// or `GroupError::MarkCollision` without touching existing state.
    pub async fn add_group(&self, group_config: GroupConfig) -> Result<()> {
        if self.engine.contains_group(group_config.id)
            || self
                .unprocessed_groups
                .lock()
                .iter()
                .any(|g| g.id == group_config.id)
        {
            return Err(GroupError::GroupIdConflict.into());
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &group_config.rules {
            if !seen.insert(rule.id) {
                return Err(GroupError::RuleIdConflict.into());
            }
        }

        let helper = self.helper.read().clone();
        let Some(helper) = helper else {
            debug!(id = %group_config.id, name = %group_config.name, "queued group");
            self.unprocessed_groups.lock().push(group_config);
            return Ok(());
        };

        let table_prefix = self.config.read().netfilter.ipset.table_prefix.clone();
        let group = Arc::new(Group::new(group_config, helper, &table_prefix).await?);

        if let Some(existing) = self
            .engine
            .groups()
            .iter()
            .find(|g| g.mark() == group.mark())
        {
            let err = GroupError::MarkCollision {
                first: existing.id().to_string(),
                second: group.id().to_string(),
            };
            group.destroy().await;
            return Err(err.into());
        }

        debug!(id = %group.id(), name = %group.name(), "added group");
        self.engine.insert_group(Arc::clone(&group));

        if self.is_running() {
            group.sync(&self.records).await?;
        }
        Ok(())
    }

    /// Run the daemon until the token is cancelled or a listener dies
    ///
    /// A panic anywhere inside the run is captured and converted into
    /// `MagitrickleError::Panic`.
    ///
    /// # Errors
    ///
    /// Returns setup failures and fatal listener errors; a cancelled run
    /// returns `Ok(())` after teardown.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(MagitrickleError::AlreadyRunning);
        }

        let app = Arc::clone(&self);
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { app.run(run_cancel).await });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(MagitrickleError::Panic(reason))
            }
            Err(_) => Ok(()),
        };

        self.is_running.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let config = self.config();

        let helper = Arc::new(NetfilterHelper::new(
            Arc::clone(&self.runner),
            config.netfilter.iptables.chain_prefix.clone(),
        ));
        *self.helper.write() = Some(Arc::clone(&helper));

        // Crash recovery: drop whatever a previous instance left behind.
        helper.clean_owned_chains().await?;

        let tasks = cancel.child_token();
        let result = self.run_services(&config, &helper, &tasks, &cancel).await;

        // Teardown, reverse of startup order.
        tasks.cancel();
        for group in self.engine.take_groups() {
            group.destroy().await;
        }
        let remap = self.port_remap.write().take();
        if let Some(remap) = remap {
            if let Err(e) = remap.disable().await {
                error!(error = %e, "failed to disable DNS port remap");
            }
        }
        let socket_path = self.control_socket_path.read().clone();
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        *self.helper.write() = None;

        info!("magitrickle stopped");
        result
    }

    async fn run_services(
        &self,
        config: &AppConfig,
        helper: &Arc<NetfilterHelper>,
        tasks: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (err_tx, mut err_rx) = mpsc::channel::<MagitrickleError>(1);

        // DNS MITM proxy, UDP + TCP.
        let listen_addr = config.dns_proxy.host.socket_addr()?;
        let upstream_addr = config.dns_proxy.upstream.socket_addr()?;
        let proxy = Arc::new(self.build_proxy(config, upstream_addr));
        {
            let proxy = Arc::clone(&proxy);
            let cancel = tasks.clone();
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = listen_udp(proxy, listen_addr, cancel).await {
                    let _ = err_tx.send(MagitrickleError::DnsProxy(e)).await;
                }
            });
        }
        {
            let proxy = Arc::clone(&proxy);
            let cancel = tasks.clone();
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = listen_tcp(proxy, listen_addr, cancel).await {
                    let _ = err_tx.send(MagitrickleError::DnsProxy(e)).await;
                }
            });
        }

        // Hijack client DNS on the LAN links.
        if !config.dns_proxy.disable_remap_53 {
            let mut addresses = Vec::new();
            for link_name in &config.link {
                addresses.extend(link::link_addresses(&self.runner, link_name).await?);
            }
            let remap = Arc::new(PortRemap::new(
                Arc::clone(helper),
                "DNSOR",
                53,
                config.dns_proxy.host.port,
                addresses,
            ));
            remap.enable().await?;
            *self.port_remap.write() = Some(remap);
        }

        // Construct and enable the configured groups.
        let pending: Vec<GroupConfig> = self.unprocessed_groups.lock().drain(..).collect();
        for group_config in pending {
            self.add_group(group_config).await?;
        }
        for group in self.engine.groups() {
            group.enable().await?;
        }

        // Control socket for netfilter.d notifications.
        let socket_path = self.control_socket_path.read().clone();
        let listener = control::bind(&socket_path)?;
        control::spawn_accept_loop(
            listener,
            Arc::clone(&self.engine),
            self.port_remap.read().clone(),
            tasks.clone(),
        );

        // Kernel link updates.
        let mut link_rx = link::subscribe_link_updates(tasks.clone())?;

        info!(
            listen = %listen_addr,
            upstream = %upstream_addr,
            groups = self.engine.groups().len(),
            "magitrickle started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                Some(event) = link_rx.recv() => self.handle_link_event(event).await,
                Some(err) = err_rx.recv() => return Err(err),
            }
        }
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        for group in self.engine.groups() {
            if group.interface() != event.name {
                continue;
            }
            if let Err(e) = group.link_update_hook(event.up).await {
                error!(group = %group.id(), interface = %event.name, error = %e, "link update hook failed");
            }
        }
    }

    fn build_proxy(&self, config: &AppConfig, upstream: SocketAddr) -> DnsMitmProxy {
        let mut proxy = DnsMitmProxy::new(UpstreamResolver::new(upstream));

        if !config.dns_proxy.disable_fake_ptr {
            proxy = proxy.with_request_hook(fake_ptr_hook());
        }

        let engine = Arc::clone(&self.engine);
        proxy = proxy.with_response_hook(Arc::new(move |client, _request, response, transport| {
            trace!(client = %client, transport = %transport, answers = response.answers().len(), "dispatching answers");
            let engine = Arc::clone(&engine);
            let response = response.clone();
            tokio::spawn(async move {
                engine.handle_message(response).await;
            });
            None
        }));

        proxy
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// Request hook suppressing reverse-DNS storms
///
/// A single-question PTR query is answered with NXDOMAIN immediately,
/// without contacting the upstream.
#[must_use]
pub fn fake_ptr_hook() -> RequestHook {
    Arc::new(|_client, request, _transport| {
        if request.queries().len() == 1 && request.queries()[0].query_type() == RecordType::PTR {
            return RequestAction::Respond(nxdomain_response(request));
        }
        RequestAction::Pass
    })
}
