//! Public client surface.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use serde_json::Value;
use tokio::time::Instant;

use crate::auth::AuthMethod;
use crate::config::Config;
use crate::connection::{ConnectionState, DeviceInfo, Session};
use crate::error::{ConnectionError, Error, PropertyError};
use crate::events::CallbackHandle;
use crate::transport::{Connector, TcpConnector};

/// Base URL of the vendor cloud API, addressed per serial.
pub const CLOUD_API_BASE_URL: &str = "https://app.wattpilot.io/app";

/// Fixed offset applied to departure times while the charger reports one of
/// the daylight-saving regimes.
const DST_OFFSET_SECS: i64 = 3600;

/// Charging load mode (`lmo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Default = 3,
    Eco = 4,
    NextTrip = 5,
}

impl LoadMode {
    fn from_value(value: i64) -> Option<Self> {
        match value {
            3 => Some(Self::Default),
            4 => Some(Self::Eco),
            5 => Some(Self::NextTrip),
            _ => None,
        }
    }
}

/// Car connection status (`car`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarStatus {
    NoCar = 1,
    Charging = 2,
    Ready = 3,
    Complete = 4,
}

impl CarStatus {
    fn from_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::NoCar),
            2 => Some(Self::Charging),
            3 => Some(Self::Ready),
            4 => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Forced charging state (`frc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceState {
    Neutral = 0,
    Off = 1,
    On = 2,
}

impl ForceState {
    fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Neutral),
            1 => Some(Self::Off),
            2 => Some(Self::On),
            _ => None,
        }
    }
}

/// Cable lock behaviour (`ust`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CableLockMode {
    Normal = 0,
    AutoUnlock = 1,
    AlwaysLock = 2,
}

impl CableLockMode {
    fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::AutoUnlock),
            2 => Some(Self::AlwaysLock),
            _ => None,
        }
    }
}

/// Result of enabling the cloud API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInfo {
    pub enabled: bool,
    pub api_key: String,
    pub url: String,
}

/// Async client for one Wattpilot charger.
///
/// Cloning is cheap and shares the underlying session; the background IO
/// task is the only writer of connection and property state.
///
/// ```no_run
/// use wattpilot::{Config, Wattpilot};
///
/// # async fn demo() -> Result<(), wattpilot::Error> {
/// let wp = Wattpilot::new(Config::new("192.168.1.50", "secret"));
/// wp.connect().await?;
/// println!("charging at {:?} A", wp.amp());
/// wp.set_power(16)?;
/// wp.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Wattpilot {
    session: Arc<Session>,
}

impl Wattpilot {
    /// Client over the default TCP transport (local device or cloud relay,
    /// per the config).
    pub fn new(config: Config) -> Self {
        let connector = Arc::new(TcpConnector::new(&config));
        Self::with_connector(config, connector)
    }

    /// Client over a custom transport seam. Tests and alternative carriers
    /// plug in here.
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            session: Session::new(config, connector),
        }
    }

    // ---- Lifecycle ----

    /// Opens the socket, authenticates, and waits for the first full
    /// property snapshot.
    ///
    /// # Guarantees
    /// * Returns only once the session is `Ready` (store initialized) or
    ///   with the failure that stopped it.
    /// * A call while already `Ready` returns immediately; a call during an
    ///   in-flight attempt awaits that attempt instead of starting another.
    ///
    /// # Errors
    /// `Error::Connection` for dial failures and timeouts, `Error::Auth`
    /// when the device rejects the credential or the negotiated algorithm is
    /// unusable.
    pub async fn connect(&self) -> Result<(), Error> {
        self.session.connect().await
    }

    /// Closes the session. Idempotent from any state; cancels in-flight
    /// connects, reconnect timers, and suspended helper waits.
    pub async fn disconnect(&self) {
        self.session.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// True once the session is authenticated, synchronized, and usable.
    pub fn connected(&self) -> bool {
        self.session.state() == ConnectionState::Ready
    }

    /// True once the first full snapshot has been assembled. Typed accessors
    /// return `None` before this point.
    pub fn initialized(&self) -> bool {
        self.session.store.initialized()
    }

    /// Identity captured from the device greeting.
    pub fn device(&self) -> DeviceInfo {
        self.session.device.lock().clone()
    }

    pub fn serial(&self) -> String {
        self.session.device.lock().serial.clone()
    }

    /// Whether write commands are HMAC-signed on this session.
    pub fn secured(&self) -> bool {
        self.session.secured_mode()
    }

    /// Password-hash scheme negotiated during the last handshake.
    pub fn auth_method(&self) -> AuthMethod {
        *self.session.auth_method.lock()
    }

    // ---- Property access ----

    /// Raw snapshot read of any property, including derived child entries
    /// and keys unknown to the schema.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.session.store.get(key)
    }

    /// Snapshot of every property currently mirrored.
    pub fn all_properties(&self) -> HashMap<String, Value> {
        self.session.store.all_properties()
    }

    fn prop_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    fn prop_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    fn prop_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    fn prop_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Requested charging current in amperes.
    pub fn amp(&self) -> Option<i64> {
        self.prop_i64("amp")
    }

    pub fn mode(&self) -> Option<LoadMode> {
        self.prop_i64("lmo").and_then(LoadMode::from_value)
    }

    pub fn car_state(&self) -> Option<CarStatus> {
        self.prop_i64("car").and_then(CarStatus::from_value)
    }

    pub fn allow_charging(&self) -> Option<bool> {
        self.prop_bool("alw")
    }

    pub fn access_state(&self) -> Option<i64> {
        self.prop_i64("acs")
    }

    pub fn cable_type(&self) -> Option<i64> {
        self.prop_i64("cbl")
    }

    pub fn cable_lock(&self) -> Option<CableLockMode> {
        self.prop_i64("ust").and_then(CableLockMode::from_value)
    }

    pub fn force_state(&self) -> Option<ForceState> {
        self.prop_i64("frc").and_then(ForceState::from_value)
    }

    /// Grid frequency in Hz.
    pub fn frequency(&self) -> Option<f64> {
        self.prop_f64("fhz")
    }

    /// Energy delivered since the car was plugged in, in Wh.
    pub fn energy_since_start(&self) -> Option<f64> {
        self.prop_f64("wh")
    }

    /// Lifetime energy counter in Wh.
    pub fn energy_total(&self) -> Option<f64> {
        self.prop_f64("eto")
    }

    pub fn error_state(&self) -> Option<i64> {
        self.prop_i64("err")
    }

    pub fn wifi_ssid(&self) -> Option<String> {
        self.prop_string("wss")
    }

    /// WiFi signal strength (RSSI, dBm).
    pub fn signal_strength(&self) -> Option<i64> {
        self.prop_i64("rssi")
    }

    /// Daylight-saving regime reported by the charger.
    pub fn daylight_saving(&self) -> Option<i64> {
        self.prop_i64("tds")
    }

    pub fn phase_switch_mode(&self) -> Option<i64> {
        self.prop_i64("psm")
    }

    pub fn pv_surplus_enabled(&self) -> Option<bool> {
        self.prop_bool("fup")
    }

    /// PV surplus start power threshold in W.
    pub fn pv_surplus_start_power(&self) -> Option<f64> {
        self.prop_f64("fst")
    }

    pub fn pv_battery_threshold(&self) -> Option<f64> {
        self.prop_f64("fam")
    }

    /// Minimum charging time in seconds.
    pub fn min_charging_time(&self) -> Option<i64> {
        self.prop_i64("fmt")
    }

    /// Planned energy for the next trip in kWh.
    pub fn next_trip_energy(&self) -> Option<f64> {
        self.prop_f64("fte")
    }

    /// Planned departure time, seconds since midnight device-local.
    pub fn next_trip_time(&self) -> Option<i64> {
        self.prop_i64("ftt")
    }

    pub fn variant(&self) -> Option<String> {
        self.prop_string("var")
    }

    pub fn model(&self) -> Option<String> {
        self.prop_string("typ")
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.prop_string("fwv")
    }

    pub fn cloud_enabled(&self) -> Option<bool> {
        self.prop_bool("cae")
    }

    pub fn cloud_api_key(&self) -> Option<String> {
        self.prop_string("cak")
    }

    pub fn cloud_api_url(&self) -> Option<String> {
        if self.cloud_enabled() != Some(true) {
            return None;
        }
        let serial = self.serial();
        if serial.is_empty() {
            return None;
        }
        Some(format!("{CLOUD_API_BASE_URL}/{serial}"))
    }

    // ---- Energy metering (children of `nrg`) ----

    pub fn voltage1(&self) -> Option<f64> {
        self.prop_f64("nrg_0")
    }

    pub fn voltage2(&self) -> Option<f64> {
        self.prop_f64("nrg_1")
    }

    pub fn voltage3(&self) -> Option<f64> {
        self.prop_f64("nrg_2")
    }

    pub fn voltage_n(&self) -> Option<f64> {
        self.prop_f64("nrg_3")
    }

    pub fn amps1(&self) -> Option<f64> {
        self.prop_f64("nrg_4")
    }

    pub fn amps2(&self) -> Option<f64> {
        self.prop_f64("nrg_5")
    }

    pub fn amps3(&self) -> Option<f64> {
        self.prop_f64("nrg_6")
    }

    /// Per-phase power in kW; the meter reports milli-kW slots.
    pub fn power1(&self) -> Option<f64> {
        self.prop_f64("nrg_7").map(|p| p * 0.001)
    }

    pub fn power2(&self) -> Option<f64> {
        self.prop_f64("nrg_8").map(|p| p * 0.001)
    }

    pub fn power3(&self) -> Option<f64> {
        self.prop_f64("nrg_9").map(|p| p * 0.001)
    }

    pub fn power_n(&self) -> Option<f64> {
        self.prop_f64("nrg_10").map(|p| p * 0.001)
    }

    /// Total charging power in kW.
    pub fn power(&self) -> Option<f64> {
        self.prop_f64("nrg_11").map(|p| p * 0.001)
    }

    // ---- Firmware ----

    /// Versions offered by the device for installation.
    pub fn available_firmware_versions(&self) -> Vec<String> {
        match self.get("onv") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => vec![s],
            _ => Vec::new(),
        }
    }

    pub fn firmware_update_available(&self) -> bool {
        let available = self.available_firmware_versions();
        if available.is_empty() {
            return false;
        }
        match self.firmware_version() {
            Some(installed) => available.iter().any(|v| *v != installed),
            None => true,
        }
    }

    // ---- Subscriptions ----

    /// Registers a synchronous property-change listener. Fires once per
    /// changed key (parents and derived children alike), in the order the
    /// key's value changed.
    pub fn on_property_change<F>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.session.events.on_property_change(listener)
    }

    /// Async variant; the future is spawned, never awaited in the receive
    /// path.
    pub fn on_property_change_async<F, Fut>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session.events.on_property_change_async(listener)
    }

    /// Registers a synchronous raw-message listener; sees every inbound
    /// frame, including types unknown to this crate.
    pub fn on_message<F>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.session.events.on_message(listener)
    }

    pub fn on_message_async<F, Fut>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session.events.on_message_async(listener)
    }

    // ---- Commands ----

    /// Validates, coerces, and sends one property write.
    ///
    /// Best-effort by protocol design: the device does not acknowledge every
    /// write, so this returns once the frame is queued on the serialized
    /// send path. Use [`Wattpilot::wait_for_property`] to observe the effect.
    ///
    /// # Errors
    /// `Error::Property` for unknown keys, read-only keys, and uncoercible
    /// values; `Error::Connection` when no link is up.
    pub fn set_property(&self, key: &str, value: Value) -> Result<(), Error> {
        self.session.set_property(key, value)
    }

    /// Waits until `pred` holds for the live value of `key`, or `wait`
    /// elapses. Disconnection cancels the wait with a connection error.
    pub async fn wait_for_property<F>(
        &self,
        key: &str,
        wait: Duration,
        pred: F,
    ) -> Result<Value, Error>
    where
        F: Fn(&Value) -> bool,
    {
        self.session.await_property(key, wait, pred).await
    }

    /// Sets the charging current in amperes.
    pub fn set_power(&self, amperage: i64) -> Result<(), Error> {
        self.set_property("amp", Value::from(amperage))
    }

    pub fn set_mode(&self, mode: LoadMode) -> Result<(), Error> {
        self.set_property("lmo", Value::from(mode as i64))
    }

    /// Schedules the energy target for the next trip, in kWh.
    ///
    /// Two ordered writes: the kWh unit mode first, then the target. The
    /// second is held back until the store reflects the first
    /// (read-your-own-write through the mirror, not the wire).
    pub async fn set_next_trip_energy(&self, energy_kwh: f64) -> Result<(), Error> {
        self.set_property("esk", Value::Bool(true))?;
        self.session
            .await_property("esk", self.session.config.command_timeout, |v| {
                v.as_bool() == Some(true)
            })
            .await?;
        self.set_property("fte", Value::from(energy_kwh))
    }

    /// Schedules the next departure time.
    ///
    /// Converts to the device's seconds-since-midnight representation and
    /// applies the DST offset when the live `tds` property reports one of
    /// the recognized daylight-saving regimes.
    pub fn set_next_trip(&self, departure: NaiveTime) -> Result<(), Error> {
        let mut seconds = i64::from(departure.num_seconds_from_midnight());
        if matches!(self.daylight_saving(), Some(1) | Some(2)) {
            seconds += DST_OFFSET_SECS;
        }
        self.set_property("ftt", Value::from(seconds))
    }

    /// Installs a firmware update and waits for the charger to reboot and
    /// the session to reconnect.
    ///
    /// # Errors
    /// `Error::Property` (`NoUpdateAvailable`) before any write when the
    /// device offers nothing to install; `Error::Connection` when the
    /// reboot/reconnect cycle does not complete within `total_wait`.
    pub async fn install_firmware_update(
        &self,
        version: Option<&str>,
        total_wait: Duration,
    ) -> Result<(), Error> {
        if !self.firmware_update_available() {
            return Err(PropertyError::NoUpdateAvailable.into());
        }
        let version = match version {
            Some(v) => v.to_string(),
            None => self
                .available_firmware_versions()
                .into_iter()
                .next()
                .ok_or(PropertyError::NoUpdateAvailable)?,
        };

        self.set_property("oct", Value::from(version))?;

        let deadline = Instant::now() + total_wait;
        // The device drops the link while flashing.
        self.session
            .await_state(deadline, "device reboot", |s| s != ConnectionState::Ready)
            .await?;
        // The automatic reconnect path brings the session back.
        self.session
            .await_state(deadline, "reconnect after firmware update", |s| {
                s == ConnectionState::Ready
            })
            .await?;
        Ok(())
    }

    /// Enables the cloud API and waits for the device to publish its key.
    pub async fn enable_cloud_api(&self) -> Result<CloudInfo, Error> {
        self.set_property("cae", Value::Bool(true))?;
        let key = self
            .session
            .await_property("cak", self.session.config.command_timeout, |v| {
                v.as_str().is_some_and(|s| !s.is_empty())
            })
            .await
            .map_err(|err| match err {
                Error::Connection(ConnectionError::Timeout(_)) => {
                    Error::Connection(ConnectionError::Timeout("cloud api key"))
                }
                other => other,
            })?;
        let api_key = key.as_str().unwrap_or_default().to_string();
        Ok(CloudInfo {
            enabled: true,
            url: format!("{CLOUD_API_BASE_URL}/{}", self.serial()),
            api_key,
        })
    }

    /// Disables the cloud API; fire-and-forget.
    pub fn disable_cloud_api(&self) -> Result<(), Error> {
        self.set_property("cae", Value::Bool(false))
    }
}

impl fmt::Display for Wattpilot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.connected() {
            return write!(f, "Wattpilot (not connected)");
        }
        let device = self.device();
        writeln!(
            f,
            "Wattpilot {} ({})",
            device.serial,
            device.hostname.as_deref().unwrap_or("?")
        )?;
        let mode = self
            .get("lmo")
            .and_then(|v| {
                self.session
                    .schema
                    .label("lmo", &v)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "?".to_string());
        let car = self
            .get("car")
            .and_then(|v| {
                self.session
                    .schema
                    .label("car", &v)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "?".to_string());
        writeln!(f, "  car: {car}  mode: {mode}  amps: {:?}", self.amp())?;
        if let Some(power) = self.power() {
            writeln!(f, "  charging at {power:.2} kW")?;
        }
        Ok(())
    }
}
