use flume::{Receiver, RecvTimeoutError, Sender};
use serde::Deserialize;
use serde_json::Value;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::characteristic::{
    Characteristic, CharacteristicValue, FanState, Reading, RotationDirection,
};
use crate::client::DeviceClient;
use crate::config::{AccessoryInformation, FanConfig};
use crate::error::{Error, Result};

const POLL_FAILED: &str = "Polling failed";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    current_state: Option<Value>,
    rotation_speed: Option<Value>,
    rotation_direction: Option<Value>,
}

/// Decodes a status body into the values to apply.
///
/// Fields of disabled characteristics are ignored. Nothing is returned
/// unless the whole body is usable.
pub fn parse_status(body: &str, config: &FanConfig) -> Result<Vec<CharacteristicValue>> {
    let payload: StatusPayload = serde_json::from_str(body)?;
    let current_state = payload
        .current_state
        .ok_or(Error::MissingField("currentState"))?;
    let mut values = vec![CharacteristicValue::from_json(
        Characteristic::On,
        &current_state,
    )?];

    let optional = [
        (Characteristic::RotationSpeed, payload.rotation_speed),
        (Characteristic::RotationDirection, payload.rotation_direction),
    ];
    for (characteristic, field) in optional {
        if !config.supports(characteristic) {
            continue;
        }
        if let Some(field) = field {
            values.push(CharacteristicValue::from_json(characteristic, &field)?);
        }
    }
    Ok(values)
}

/// One fan accessory: its configuration, device client and cached state.
///
/// Clones share the same cache, so the poll thread, the webhook listener
/// and the host API all see one state.
#[derive(Clone, Debug)]
pub struct FanAccessory {
    config: Arc<FanConfig>,
    client: DeviceClient,
    state: Arc<Mutex<FanState>>,
}

impl FanAccessory {
    pub fn new(config: FanConfig) -> Result<Self> {
        let client = DeviceClient::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            client,
            state: Arc::new(Mutex::new(FanState::default())),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &FanConfig {
        &self.config
    }

    pub fn information(&self) -> AccessoryInformation {
        self.config.information()
    }

    /// Cached characteristic values; never touches the device.
    pub fn state(&self) -> FanState {
        self.lock_state().clone()
    }

    pub fn identify(&self) {
        info!(accessory = %self.config.name, "Identify requested!");
    }

    /// Sends `value` to the device. The cache takes the value only once the
    /// device request completed.
    pub fn set(&self, value: CharacteristicValue) -> Result<()> {
        let characteristic = value.characteristic();
        if !self.config.supports(characteristic) {
            return Err(Error::Unsupported(characteristic));
        }
        debug!(
            accessory = %self.config.name,
            url = %self.client.set_url(&value),
            "setting {}",
            characteristic.push_name()
        );
        if let Err(err) = self.client.send(&value) {
            warn!(
                accessory = %self.config.name,
                error = %err,
                "error setting {}",
                characteristic.push_name()
            );
            return Err(err);
        }
        info!(
            accessory = %self.config.name,
            "set {} to {}",
            characteristic.push_name(),
            value
        );
        self.lock_state().apply(value);
        Ok(())
    }

    pub fn set_on(&self, on: bool) -> Result<()> {
        self.set(CharacteristicValue::On(on))
    }

    pub fn set_rotation_speed(&self, speed: u8) -> Result<()> {
        self.set(CharacteristicValue::RotationSpeed(speed.min(100)))
    }

    pub fn set_rotation_direction(&self, direction: RotationDirection) -> Result<()> {
        self.set(CharacteristicValue::RotationDirection(direction))
    }

    /// Polls the device once and updates the cache.
    ///
    /// A transport error marks On as failed; a bad body changes nothing.
    pub fn refresh(&self) -> Result<()> {
        debug!(
            accessory = %self.config.name,
            url = %self.client.status_url(),
            "getting status"
        );
        let body = match self.client.fetch_status() {
            Ok(body) => body,
            Err(err) => {
                warn!(accessory = %self.config.name, error = %err, "error getting status");
                self.lock_state().on = Reading::Failed(POLL_FAILED.to_string());
                return Err(err);
            }
        };
        debug!(accessory = %self.config.name, %body, "device response");

        let values = match parse_status(&body, &self.config) {
            Ok(values) => values,
            Err(err) => {
                warn!(accessory = %self.config.name, error = %err, "error parsing status");
                return Err(err);
            }
        };
        let mut state = self.lock_state();
        for value in values {
            debug!(
                accessory = %self.config.name,
                "updated {} to: {}",
                value.characteristic().push_name(),
                value
            );
            state.apply(value);
        }
        Ok(())
    }

    /// Applies a value pushed by the device. Issues no device request.
    pub fn apply_push(&self, characteristic: Characteristic, raw: Option<&str>) -> Result<()> {
        let Some(raw) = raw else {
            warn!(
                accessory = %self.config.name,
                "missing value for {}",
                characteristic.push_name()
            );
            return Err(Error::InvalidValue {
                characteristic,
                value: String::new(),
            });
        };
        let value = match CharacteristicValue::parse(characteristic, raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(accessory = %self.config.name, error = %err, "error parsing request");
                return Err(err);
            }
        };
        self.lock_state().apply(value);
        info!(
            accessory = %self.config.name,
            "updated {} to: {}",
            characteristic.push_name(),
            value
        );
        Ok(())
    }

    /// Applies a push addressed by name; unknown names are logged and ignored.
    pub fn apply_named_push(&self, name: &str, raw: Option<&str>) -> Result<()> {
        match Characteristic::from_push_name(name) {
            Some(characteristic) => self.apply_push(characteristic, raw),
            None => {
                warn!(
                    accessory = %self.config.name,
                    "unknown characteristic \"{}\" with value \"{}\"",
                    name,
                    raw.unwrap_or_default()
                );
                Err(Error::UnknownCharacteristic(name.to_string()))
            }
        }
    }

    /// Polls now and then once per interval until `shutdown` fires or is
    /// dropped. Each poll finishes before the next wait starts.
    pub fn run_poll_loop(&self, shutdown: Receiver<()>) {
        let interval = self.config.poll_interval();
        loop {
            // Failures are already logged and reflected in the cache.
            let _ = self.refresh();
            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(accessory = %self.config.name, "poll loop stopped");
    }

    pub fn spawn_poller(&self) -> io::Result<Poller> {
        let (shutdown, rx) = flume::bounded(1);
        let accessory = self.clone();
        let handle = thread::Builder::new()
            .name(format!("poll-{}", self.config.name))
            .spawn(move || accessory.run_poll_loop(rx))?;
        Ok(Poller { shutdown, handle })
    }

    fn lock_state(&self) -> MutexGuard<'_, FanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running poll thread.
pub struct Poller {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.join();
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_url, hanging_device, FakeDevice};
    use std::time::{Duration, Instant};

    fn accessory(apiroute: &str, speed: bool, direction: bool) -> FanAccessory {
        let mut config = FanConfig::new(apiroute);
        config.rotation_speed = speed;
        config.rotation_direction = direction;
        FanAccessory::new(config).unwrap()
    }

    #[test]
    fn poll_applies_current_state_and_enabled_fields() {
        let device = FakeDevice::start(
            r#"{"currentState": 1, "rotationSpeed": 64, "rotationDirection": 1}"#,
        );
        let fan = accessory(&device.url(), true, true);

        fan.refresh().unwrap();
        let state = fan.state();
        assert_eq!(state.on, Reading::Value(true));
        assert_eq!(state.rotation_speed, Reading::Value(64));
        assert_eq!(
            state.rotation_direction,
            Reading::Value(RotationDirection::CounterClockwise)
        );

        device.set_body(r#"{"currentState": false}"#);
        fan.refresh().unwrap();
        let state = fan.state();
        assert_eq!(state.on, Reading::Value(false));
        assert_eq!(state.rotation_speed, Reading::Value(64));
    }

    #[test]
    fn disabled_fields_are_never_read() {
        // Invalid values in disabled fields must not fail the poll.
        let device = FakeDevice::start(
            r#"{"currentState": 1, "rotationSpeed": "bogus", "rotationDirection": 7}"#,
        );
        let fan = accessory(&device.url(), false, false);

        fan.refresh().unwrap();
        let state = fan.state();
        assert_eq!(state.on, Reading::Value(true));
        assert_eq!(state.rotation_speed, Reading::Unknown);
        assert_eq!(state.rotation_direction, Reading::Unknown);
    }

    #[test]
    fn malformed_status_leaves_cache_unchanged() {
        let device = FakeDevice::start(r#"{"currentState": 1, "rotationSpeed": 20}"#);
        let fan = accessory(&device.url(), true, false);
        fan.refresh().unwrap();
        let before = fan.state();

        for body in [
            "<html>oops</html>",
            r#"{"rotationSpeed": 90}"#,
            r#"{"currentState": 1, "rotationSpeed": "fast"}"#,
        ] {
            device.set_body(body);
            assert!(fan.refresh().is_err());
            assert_eq!(fan.state(), before);
        }
    }

    #[test]
    fn transport_error_marks_only_on_as_failed() {
        let fan = accessory(&closed_url(), true, true);
        fan.apply_push(Characteristic::RotationSpeed, Some("40"))
            .unwrap();
        fan.apply_push(Characteristic::On, Some("1")).unwrap();

        assert!(matches!(fan.refresh(), Err(Error::Transport(_))));
        let state = fan.state();
        assert!(state.on.is_failed());
        assert_eq!(state.rotation_speed, Reading::Value(40));
        assert_eq!(state.rotation_direction, Reading::Unknown);
    }

    #[test]
    fn set_on_sends_exactly_one_request() {
        let device = FakeDevice::start("");
        let fan = accessory(&device.url(), false, false);

        fan.set_on(true).unwrap();
        assert_eq!(device.next_request().unwrap().url, "/setState?value=1");
        fan.set_on(false).unwrap();
        assert_eq!(device.next_request().unwrap().url, "/setState?value=0");
        assert_eq!(device.request_count(), 0);
        assert_eq!(fan.state().on, Reading::Value(false));
    }

    #[test]
    fn set_of_disabled_characteristic_is_rejected_without_request() {
        let device = FakeDevice::start("");
        let fan = accessory(&device.url(), false, false);

        assert!(matches!(
            fan.set_rotation_speed(50),
            Err(Error::Unsupported(Characteristic::RotationSpeed))
        ));
        assert!(matches!(
            fan.set_rotation_direction(RotationDirection::Clockwise),
            Err(Error::Unsupported(Characteristic::RotationDirection))
        ));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(device.request_count(), 0);
    }

    #[test]
    fn failed_set_returns_error_and_keeps_cache() {
        let fan = accessory(&closed_url(), true, false);
        assert!(matches!(
            fan.set_rotation_speed(80),
            Err(Error::Transport(_))
        ));
        assert_eq!(fan.state().rotation_speed, Reading::Unknown);
    }

    #[test]
    fn pushes_update_cache_without_device_requests() {
        let device = FakeDevice::start("");
        let fan = accessory(&device.url(), false, false);

        fan.apply_named_push("state", Some("1")).unwrap();
        fan.apply_named_push("rotationDirection", Some("1")).unwrap();
        assert_eq!(fan.state().on, Reading::Value(true));
        assert_eq!(
            fan.state().rotation_direction,
            Reading::Value(RotationDirection::CounterClockwise)
        );

        let before = fan.state();
        assert!(matches!(
            fan.apply_named_push("brightness", Some("1")),
            Err(Error::UnknownCharacteristic(_))
        ));
        assert!(fan.apply_named_push("state", Some("maybe")).is_err());
        assert!(fan.apply_named_push("state", None).is_err());
        assert_eq!(fan.state(), before);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(device.request_count(), 0);
    }

    #[test]
    fn poll_loop_polls_immediately_and_stops_on_shutdown() {
        let device = FakeDevice::start(r#"{"currentState": 1}"#);
        let mut config = FanConfig::new(device.url());
        config.poll_interval = 3600;
        let fan = FanAccessory::new(config).unwrap();

        let poller = fan.spawn_poller().unwrap();
        assert_eq!(device.next_request().unwrap().url, "/status");
        poller.stop();

        assert_eq!(fan.state().on, Reading::Value(true));
        assert!(device.drain().is_empty());
    }

    #[test]
    fn unresponsive_device_times_out_and_marks_on_failed() {
        let (_device, url) = hanging_device();
        let mut config = FanConfig::new(url);
        config.rotation_speed = true;
        config.timeout = 300;
        let fan = FanAccessory::new(config).unwrap();
        fan.apply_push(Characteristic::RotationSpeed, Some("25"))
            .unwrap();

        let started = Instant::now();
        assert!(matches!(fan.refresh(), Err(Error::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        let state = fan.state();
        assert!(state.on.is_failed());
        assert_eq!(state.rotation_speed, Reading::Value(25));
    }

    #[test]
    fn poll_loop_repeats_every_interval() {
        let device = FakeDevice::start(r#"{"currentState": 0}"#);
        let mut config = FanConfig::new(device.url());
        config.poll_interval = 1;
        let fan = FanAccessory::new(config).unwrap();

        let poller = fan.spawn_poller().unwrap();
        assert_eq!(device.next_request().unwrap().url, "/status");
        assert_eq!(device.next_request().unwrap().url, "/status");
        poller.stop();

        assert_eq!(fan.state().on, Reading::Value(false));
    }
}
