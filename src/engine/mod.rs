//! Engine control loop
//!
//! Drives the device + XLink connection lifecycle on behalf of an external
//! control surface (UI, CLI). Collaborators write a [`Command`] into the
//! shared [`ControlModel`]; the engine acts on it once per tick and reports
//! through [`EngineStatus`]. Failures never block the control task: they
//! schedule a cooperative [`Command::WaitForTime`] instead of sleeping.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::capture::{create_device, CaptureDevice, Connector, DeviceKind};
use crate::config::Config;
use crate::wireless::convert::mac_to_int;
use crate::wireless::interface::WifiInterface;
use crate::xlink::{ConnectionState, XLinkKaiConnection};

/// SSID prefix of PSP ad-hoc sessions
pub const PSP_SSID_FILTER: &str = "PSP_";

/// SSID prefix of Vita ad-hoc sessions
pub const VITA_SSID_FILTER: &str = "SCE_";

/// Retry delay after a device-class failure
const DEVICE_RETRY_WAIT: Duration = Duration::from_secs(5);

/// Retry delay after an XLink-class failure
const XLINK_RETRY_WAIT: Duration = Duration::from_secs(10);

/// Commands issued by the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    StartEngine,
    StopEngine,
    StartSearchNetworks,
    StopSearchNetworks,
    WaitForTime,
    SaveSettings,
    #[default]
    NoCommand,
}

/// Engine lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineStatus {
    #[default]
    Idle,
    Running,
    Error,
}

/// Shared control surface between the engine and external collaborators.
/// Mutated only by the engine's control task; readers tolerate tick-old
/// values.
#[derive(Debug, Clone)]
pub struct ControlModel {
    pub command: Command,
    pub status: EngineStatus,
    pub adapter: String,
    pub xlink_ip: String,
    pub xlink_port: u16,
    pub use_psp_plugin: bool,
    pub auto_discover_xlink: bool,
    pub auto_discover_networks: bool,
    pub acknowledge_data_frames: bool,
    pub only_accept_from_mac: String,
    /// SSID prefixes supplied by the control surface; the PSP/Vita
    /// prefixes are appended at start when auto-discovery is on
    pub ssid_filters: Vec<String>,
    /// Result of the last ad-hoc network search
    pub discovered_networks: Vec<String>,
    pub time_to_wait: Duration,
    pub command_after_wait: Command,
    pub log_level: String,
}

impl ControlModel {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: Command::NoCommand,
            status: EngineStatus::Idle,
            adapter: config.adapter.clone(),
            xlink_ip: config.xlink_ip.clone(),
            xlink_port: config.xlink_port,
            use_psp_plugin: config.use_psp_plugin,
            auto_discover_xlink: config.auto_discover_xlink,
            auto_discover_networks: config.auto_discover_networks,
            acknowledge_data_frames: config.acknowledge_data_frames,
            only_accept_from_mac: config.only_accept_from_mac.clone(),
            ssid_filters: Vec::new(),
            discovered_networks: Vec::new(),
            time_to_wait: Duration::ZERO,
            command_after_wait: Command::NoCommand,
            log_level: config.log_level.clone(),
        }
    }

    pub fn apply_to_config(&self, config: &mut Config) {
        config.adapter = self.adapter.clone();
        config.xlink_ip = self.xlink_ip.clone();
        config.xlink_port = self.xlink_port;
        config.use_psp_plugin = self.use_psp_plugin;
        config.auto_discover_xlink = self.auto_discover_xlink;
        config.auto_discover_networks = self.auto_discover_networks;
        config.acknowledge_data_frames = self.acknowledge_data_frames;
        config.only_accept_from_mac = self.only_accept_from_mac.clone();
        config.log_level = self.log_level.clone();
    }
}

impl Default for ControlModel {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Builds the capture device for a [`DeviceKind`]; swapped out in tests.
pub type DeviceFactory = Box<dyn Fn(DeviceKind) -> Arc<dyn CaptureDevice> + Send>;

/// The engine state machine. Call [`Engine::tick`] from the control task.
pub struct Engine {
    model: Arc<Mutex<ControlModel>>,
    config_path: Option<PathBuf>,
    device: Option<Arc<dyn CaptureDevice>>,
    xlink: Option<Arc<XLinkKaiConnection>>,
    wait_start: Option<Instant>,
    device_factory: DeviceFactory,
}

impl Engine {
    pub fn new(model: Arc<Mutex<ControlModel>>) -> Self {
        Self::with_device_factory(model, Box::new(create_device))
    }

    /// Engine with a custom device factory (tests use the dummy variant).
    pub fn with_device_factory(model: Arc<Mutex<ControlModel>>, factory: DeviceFactory) -> Self {
        Self {
            model,
            config_path: None,
            device: None,
            xlink: None,
            wait_start: None,
            device_factory: factory,
        }
    }

    /// Where `SaveSettings` persists the control model.
    pub fn set_config_path(&mut self, path: PathBuf) {
        self.config_path = Some(path);
    }

    pub fn model(&self) -> Arc<Mutex<ControlModel>> {
        Arc::clone(&self.model)
    }

    /// The live XLink connection, present between start and stop.
    pub fn xlink(&self) -> Option<&Arc<XLinkKaiConnection>> {
        self.xlink.as_ref()
    }

    /// The live capture device, present between start and stop.
    pub fn device(&self) -> Option<&Arc<dyn CaptureDevice>> {
        self.device.as_ref()
    }

    /// Process the pending command, then watch the running bridge.
    pub fn tick(&mut self) {
        let command = self.model.lock().command;
        match command {
            Command::StartEngine => self.start_engine(),
            Command::StopEngine => self.stop_engine(),
            Command::WaitForTime => self.wait_for_time(),
            Command::SaveSettings => self.save_settings(),
            Command::StartSearchNetworks => self.search_networks(),
            Command::StopSearchNetworks => {
                let mut model = self.model.lock();
                model.discovered_networks.clear();
                model.command = Command::NoCommand;
            }
            Command::NoCommand => self.watch_bridge(),
        }
    }

    fn start_engine(&mut self) {
        // Running is only entered from Idle; tear down leftovers first
        if self.model.lock().status != EngineStatus::Idle {
            self.stop_engine();
        }

        let (kind, params) = {
            let model = self.model.lock();
            let kind = if model.use_psp_plugin {
                DeviceKind::PspPlugin
            } else {
                DeviceKind::Monitor
            };
            (kind, model.clone())
        };

        let device = (self.device_factory)(kind);
        device.set_source_mac_filter(mac_to_int(&params.only_accept_from_mac));
        device.set_acknowledge(params.acknowledge_data_frames);

        let xlink = Arc::new(XLinkKaiConnection::new());

        // The bridge: each side holds a weak handle to the other, so either
        // close breaks the cycle
        xlink.set_device(Arc::downgrade(&device.clone().as_connector()));
        let xlink_connector: Arc<dyn Connector> = xlink.clone();
        device.set_connector(Arc::downgrade(&xlink_connector));

        let mut ssid_filters = params.ssid_filters.clone();
        if params.auto_discover_networks {
            ssid_filters.push(PSP_SSID_FILTER.to_string());
            ssid_filters.push(VITA_SSID_FILTER.to_string());
        }

        let opened = if params.auto_discover_xlink {
            xlink.open("", params.xlink_port)
        } else {
            xlink.open(&params.xlink_ip, params.xlink_port)
        };
        if let Err(e) = opened {
            error!(error = %e, "failed to open connection to XLink Kai, retrying in 10 seconds");
            self.device = Some(device);
            self.xlink = Some(xlink);
            self.schedule_wait(EngineStatus::Error, XLINK_RETRY_WAIT, Command::NoCommand);
            return;
        }

        if let Err(e) = device.open(&params.adapter, &ssid_filters) {
            error!(error = %e, adapter = %params.adapter, "failed to activate capture interface");
            xlink.close();
            self.device = Some(device);
            self.xlink = Some(xlink);
            self.schedule_wait(EngineStatus::Error, DEVICE_RETRY_WAIT, Command::StopEngine);
            return;
        }

        let receivers = device
            .start_receiver()
            .map_err(|e| e.to_string())
            .and_then(|_| xlink.start_receiver().map_err(|e| e.to_string()));
        if let Err(e) = receivers {
            error!(error = %e, "failed to start receiver threads");
            self.device = Some(device);
            self.xlink = Some(xlink);
            self.schedule_wait(EngineStatus::Error, DEVICE_RETRY_WAIT, Command::StopEngine);
            return;
        }

        self.device = Some(device);
        self.xlink = Some(xlink);
        {
            let mut model = self.model.lock();
            model.ssid_filters = ssid_filters;
            model.status = EngineStatus::Running;
            model.command = Command::NoCommand;
        }
        info!("engine running");
    }

    fn stop_engine(&mut self) {
        if let Some(xlink) = self.xlink.take() {
            xlink.close();
        }
        if let Some(device) = self.device.take() {
            device.close();
        }

        let mut model = self.model.lock();
        model.ssid_filters.clear();
        model.status = EngineStatus::Idle;
        model.command = Command::NoCommand;
        info!("engine stopped");
    }

    /// Cooperative delay: records the entry instant, then hands over to the
    /// follow-on command once the wait has elapsed.
    fn wait_for_time(&mut self) {
        let now = Instant::now();
        let start = *self.wait_start.get_or_insert(now);

        let mut model = self.model.lock();
        if now.duration_since(start) >= model.time_to_wait {
            model.command = model.command_after_wait;
            self.wait_start = None;
        }
    }

    fn save_settings(&mut self) {
        let model = self.model.lock().clone();
        if let Some(path) = &self.config_path {
            let mut config = Config::load_or_default(path).unwrap_or_default();
            model.apply_to_config(&mut config);
            match config.save(path) {
                Ok(()) => info!(path = %path.display(), "settings saved"),
                Err(e) => warn!(error = %e, "saving settings failed"),
            }
        } else {
            warn!("no config path set, settings not saved");
        }
        self.model.lock().command = Command::NoCommand;
    }

    fn search_networks(&mut self) {
        let adapter = self.model.lock().adapter.clone();
        let networks = WifiInterface::get(&adapter)
            .and_then(|iface| iface.adhoc_networks());
        let mut model = self.model.lock();
        match networks {
            Ok(networks) => {
                info!(count = networks.len(), "ad-hoc networks found");
                model.discovered_networks = networks;
            }
            Err(e) => warn!(error = %e, "ad-hoc network search failed"),
        }
        model.command = Command::NoCommand;
    }

    /// While running, watch for the XLink session failing (handshake
    /// timeout, missed keepalives, remote disconnect).
    fn watch_bridge(&mut self) {
        let failed = self.model.lock().status == EngineStatus::Running
            && self
                .xlink
                .as_ref()
                .map(|x| x.state() == ConnectionState::Failed)
                .unwrap_or(false);
        if failed {
            error!("XLink Kai session failed, retrying in 10 seconds");
            self.schedule_wait(EngineStatus::Error, XLINK_RETRY_WAIT, Command::NoCommand);
        }
    }

    fn schedule_wait(&mut self, status: EngineStatus, wait: Duration, after: Command) {
        let mut model = self.model.lock();
        model.status = status;
        model.command = Command::WaitForTime;
        model.time_to_wait = wait;
        model.command_after_wait = after;
        self.wait_start = None;
    }
}
