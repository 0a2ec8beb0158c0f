//! Deduplicated device discovery
//!
//! The registry owns the devices found by the current scan cycle. A device is
//! recorded the first time its identity is seen; later advertisements from the
//! same identity only refresh `last_seen` and never produce another event.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::bluetooth::device::{Device, DeviceId};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::feed::EventFeed;
use crate::core::bluetooth::timeout::TimerHandle;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::ScanState;
use crate::core::bluetooth::worker::{TimerAction, Timers};

pub struct ScanRegistry {
    service_uuid: Uuid,
    /// Devices in first-seen order
    devices: Vec<Device>,
    index: HashMap<DeviceId, usize>,
    scanning: bool,
    timer: Option<TimerHandle>,
    feed: EventFeed<ScanState>,
}

impl ScanRegistry {
    pub fn new(service_uuid: Uuid, feed: EventFeed<ScanState>) -> Self {
        Self {
            service_uuid,
            devices: Vec::new(),
            index: HashMap::new(),
            scanning: false,
            timer: None,
            feed,
        }
    }

    /// Starts a fresh scan cycle. Any running scan is stopped and its devices are discarded.
    pub fn start_scan(&mut self, timeout: Duration, transport: &dyn Transport, timers: &mut Timers) {
        if !transport.is_radio_powered_on() {
            warn!("Cannot start scan: Bluetooth is powered off");
            self.fail(BleError::BluetoothDisabled, transport, timers);
            return;
        }

        if self.scanning {
            info!("Restarting active scan");
            timers.cancel_slot(&mut self.timer);
            transport.stop_scan();
            self.scanning = false;
        }

        self.clear();
        self.scanning = true;
        self.feed.publish(ScanState::Scanning(Vec::new()));
        self.timer = Some(timers.schedule(timeout, TimerAction::ScanTimeout));
        info!(
            "Scanning for peripherals offering {} (timeout {:?})",
            self.service_uuid, timeout
        );
        transport.scan_for(self.service_uuid);
    }

    /// Halts discovery. Idempotent: calling it while idle only re-issues the halt.
    pub fn stop_scan(&mut self, transport: &dyn Transport, timers: &mut Timers) {
        timers.cancel_slot(&mut self.timer);
        transport.stop_scan();
        if self.scanning {
            self.scanning = false;
            info!("Scan stopped with {} device(s) found", self.devices.len());
            self.feed.publish(ScanState::Stopped);
        } else {
            debug!("stop_scan called while not scanning");
        }
    }

    pub fn on_timeout(&mut self, transport: &dyn Transport, timers: &mut Timers) {
        info!("Scan timeout elapsed");
        self.timer = None;
        self.stop_scan(transport, timers);
    }

    /// Records a discovery callback. Returns `true` when the identity was new.
    pub fn on_discovered(&mut self, id: DeviceId, name: Option<String>, rssi: Option<i16>) -> bool {
        if !self.scanning {
            debug!("Ignoring discovery of {} outside of a scan", id);
            return false;
        }

        if let Some(&position) = self.index.get(&id) {
            self.devices[position].last_seen = Utc::now();
            return false;
        }

        let device = Device::new(id.clone(), name, rssi);
        info!(
            "Found device - ID: {}, Name: {:?}, RSSI: {:?}",
            device.id, device.name, device.rssi
        );
        self.index.insert(id, self.devices.len());
        self.devices.push(device);
        self.feed.publish(ScanState::Scanning(self.devices.clone()));
        true
    }

    pub fn on_scan_failed(&mut self, error: BleError, transport: &dyn Transport, timers: &mut Timers) {
        if !self.scanning {
            debug!("Ignoring scan failure outside of a scan: {}", error);
            return;
        }
        warn!("Scan failed: {}", error);
        self.fail(error, transport, timers);
    }

    pub fn on_radio_state(&mut self, powered_on: bool, transport: &dyn Transport, timers: &mut Timers) {
        if !powered_on && self.scanning {
            warn!("Bluetooth powered off during scan");
            self.fail(BleError::BluetoothDisabled, transport, timers);
        }
    }

    fn fail(&mut self, error: BleError, transport: &dyn Transport, timers: &mut Timers) {
        timers.cancel_slot(&mut self.timer);
        if self.scanning {
            transport.stop_scan();
            self.scanning = false;
        }
        self.feed.publish(ScanState::Error(error));
    }

    /// Stops any running scan and ends the scan-state stream.
    pub fn close(&mut self, transport: &dyn Transport, timers: &mut Timers) {
        if self.scanning {
            self.stop_scan(transport, timers);
        }
        self.feed.close();
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.index.clear();
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.index.contains_key(id)
    }

    #[cfg(test)]
    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.index.get(id).map(|&position| &self.devices[position])
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    #[cfg(test)]
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::testing::{Call, RecordingTransport, timers};

    const SERVICE: Uuid = Uuid::from_u128(0x4f63756c_7573_2054_6872_65656d6f7465);

    fn registry() -> (ScanRegistry, EventFeed<ScanState>) {
        let feed = EventFeed::replaying(ScanState::Idle);
        (ScanRegistry::new(SERVICE, feed.clone()), feed)
    }

    #[tokio::test]
    async fn repeated_identities_are_recorded_once() {
        let (mut registry, feed) = registry();
        let transport = RecordingTransport::new();
        let (mut timers, _rx) = timers();
        let mut states = feed.subscribe();

        registry.start_scan(Duration::from_secs(5), &transport, &mut timers);
        let sightings = ["a", "b", "a", "c", "b", "a", "c"];
        let inserted: usize = sightings
            .iter()
            .filter(|id| registry.on_discovered(DeviceId::from(**id), None, None))
            .count();

        assert_eq!(inserted, 3);
        assert_eq!(registry.devices().len(), 3);

        let mut last = None;
        while let Some(state) = states.try_recv() {
            last = Some(state);
        }
        match last {
            Some(ScanState::Scanning(devices)) => assert_eq!(devices.len(), 3),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn first_advertisement_wins() {
        let (mut registry, _feed) = registry();
        let transport = RecordingTransport::new();
        let (mut timers, _rx) = timers();

        registry.start_scan(Duration::from_secs(5), &transport, &mut timers);
        let id = DeviceId::from("a");
        registry.on_discovered(id.clone(), Some("first".into()), Some(-40));
        let first_seen = registry.get(&id).unwrap().last_seen;
        registry.on_discovered(id.clone(), Some("second".into()), Some(-90));

        let device = registry.get(&id).unwrap();
        assert_eq!(device.name.as_deref(), Some("first"));
        assert_eq!(device.rssi, Some(-40));
        assert!(device.last_seen >= first_seen);
    }

    #[tokio::test]
    async fn start_scan_with_radio_off_reports_error() {
        let (mut registry, feed) = registry();
        let transport = RecordingTransport::new();
        transport.set_radio(false);
        let (mut timers, _rx) = timers();

        registry.start_scan(Duration::from_secs(5), &transport, &mut timers);

        assert!(!registry.is_scanning());
        assert_eq!(feed.latest(), Some(ScanState::Error(BleError::BluetoothDisabled)));
        assert!(!transport.calls().iter().any(|c| matches!(c, Call::ScanFor(_))));
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test]
    async fn new_scan_discards_previous_devices() {
        let (mut registry, _feed) = registry();
        let transport = RecordingTransport::new();
        let (mut timers, _rx) = timers();

        registry.start_scan(Duration::from_secs(5), &transport, &mut timers);
        registry.on_discovered(DeviceId::from("a"), None, None);
        registry.stop_scan(&transport, &mut timers);
        assert!(registry.contains(&DeviceId::from("a")));

        registry.start_scan(Duration::from_secs(5), &transport, &mut timers);
        assert!(registry.devices().is_empty());
        assert_eq!(timers.armed_count(), 1);
    }

    #[tokio::test]
    async fn stop_scan_is_idempotent() {
        let (mut registry, feed) = registry();
        let transport = RecordingTransport::new();
        let (mut timers, _rx) = timers();
        let mut states = feed.subscribe();

        registry.stop_scan(&transport, &mut timers);
        registry.start_scan(Duration::from_secs(5), &transport, &mut timers);
        registry.stop_scan(&transport, &mut timers);
        registry.stop_scan(&transport, &mut timers);

        let mut seen = Vec::new();
        while let Some(state) = states.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![ScanState::Idle, ScanState::Scanning(Vec::new()), ScanState::Stopped]
        );
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test]
    async fn discoveries_outside_a_scan_are_ignored() {
        let (mut registry, _feed) = registry();
        assert!(!registry.on_discovered(DeviceId::from("a"), None, None));
        assert!(registry.devices().is_empty());
    }

    #[tokio::test]
    async fn transport_scan_failure_reports_error() {
        let (mut registry, feed) = registry();
        let transport = RecordingTransport::new();
        let (mut timers, _rx) = timers();

        registry.start_scan(Duration::from_secs(5), &transport, &mut timers);
        registry.on_discovered(DeviceId::from("a"), None, None);
        registry.on_scan_failed(BleError::ScanFailed("adapter busy".into()), &transport, &mut timers);

        assert!(!registry.is_scanning());
        assert_eq!(
            feed.latest(),
            Some(ScanState::Error(BleError::ScanFailed("adapter busy".into())))
        );
        assert_eq!(transport.calls().last(), Some(&Call::StopScan));
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test]
    async fn radio_loss_during_scan_reports_error() {
        let (mut registry, feed) = registry();
        let transport = RecordingTransport::new();
        let (mut timers, _rx) = timers();

        registry.start_scan(Duration::from_secs(5), &transport, &mut timers);
        registry.on_radio_state(false, &transport, &mut timers);

        assert!(!registry.is_scanning());
        assert_eq!(feed.latest(), Some(ScanState::Error(BleError::BluetoothDisabled)));
        assert_eq!(timers.armed_count(), 0);
    }
}
