//! Candidate probing through `enumerate_devices`.

mod common;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use common::{node, node_with, EventLog, Probe};
use daq_orchestrator::device::{Device, DeviceCategory};
use daq_orchestrator::driver::{enumerate_devices, DeviceSet, Driver, DriverRef};
use daq_orchestrator::error::{DaqError, DaqResult};

/// Driver handing out a fixed candidate list.
struct Fixed {
    candidates: Vec<Arc<Device>>,
    tracked: DeviceSet,
}

#[async_trait]
impl Driver for Fixed {
    fn name(&self) -> &str {
        "fixed"
    }

    fn supported_categories(&self) -> &[DeviceCategory] {
        &[DeviceCategory::LinearAxis]
    }

    async fn candidates(&self, _this: Weak<dyn Driver>) -> DaqResult<Vec<Arc<Device>>> {
        Ok(self.candidates.clone())
    }

    fn tracked(&self) -> &DeviceSet {
        &self.tracked
    }
}

fn fixed(candidates: Vec<Arc<Device>>) -> DriverRef {
    Arc::new(Fixed {
        candidates,
        tracked: DeviceSet::new(),
    })
}

fn slow(log: &EventLog) -> Probe {
    Probe {
        log: log.clone(),
        delay: Some(Duration::from_millis(10)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_axes_sharing_a_controller_are_probed_together() {
    let log = EventLog::default();
    let controller = node_with("controller", DeviceCategory::MotionController, None, slow(&log));
    let x = node_with("x", DeviceCategory::LinearAxis, Some(&controller), slow(&log));
    let y = node_with("y", DeviceCategory::LinearAxis, Some(&controller), slow(&log));
    let driver = fixed(vec![x.clone(), y.clone()]);

    let devices = enumerate_devices(&driver).await.unwrap();

    let names: Vec<&str> = devices.iter().map(|d| d.name()).collect();
    assert_eq!(names, ["x", "y"]);
    assert_eq!(driver.tracked().len(), 2);
    for device in [&controller, &x, &y] {
        assert!(!device.is_opened());
    }
    assert!(controller.children().is_empty());

    let events = log.take();
    assert!(!events.iter().any(|e| e.contains("before its parent")), "{events:?}");
    // the controller is opened once for both axes and closed after the last one
    assert_eq!(events.iter().filter(|e| *e == "open controller").count(), 1);
    assert_eq!(events.last().map(String::as_str), Some("close controller"));
}

#[tokio::test]
async fn test_shared_controller_reopens_after_sweep() {
    let log = EventLog::default();
    let controller = node_with("controller", DeviceCategory::MotionController, None, slow(&log));
    let axes: Vec<_> = ["x", "y", "z"]
        .into_iter()
        .map(|name| node_with(name, DeviceCategory::LinearAxis, Some(&controller), slow(&log)))
        .collect();
    let driver = fixed(axes.clone());

    assert_eq!(enumerate_devices(&driver).await.unwrap().len(), 3);
    axes[0].open().await.unwrap();
    assert!(controller.is_opened());
    assert_eq!(controller.children().len(), 1);
}

#[tokio::test]
async fn test_unexpected_error_aborts_after_all_candidates_settle() {
    let log = EventLog::default();
    let good = node("good", DeviceCategory::LinearAxis, None, &log);
    let broken = node_with(
        "broken",
        DeviceCategory::LinearAxis,
        None,
        Probe {
            log: log.clone(),
            fail_info: true,
            ..Default::default()
        },
    );
    let wrong = node_with(
        "wrong",
        DeviceCategory::LinearAxis,
        None,
        Probe {
            log: log.clone(),
            fail_open: true,
            ..Default::default()
        },
    );
    let driver = fixed(vec![good.clone(), broken.clone(), wrong.clone()]);

    let err = enumerate_devices(&driver).await.unwrap_err();
    assert!(matches!(err, DaqError::Hardware(_)), "{err}");

    // every probe ran to completion and closed its device
    for device in [&good, &broken, &wrong] {
        assert!(!device.is_opened(), "{} left open", device.name());
    }
    let events = log.take();
    assert!(events.contains(&"close good".to_string()));
    assert!(events.contains(&"close broken".to_string()));
    assert!(driver.tracked().is_empty());
}

#[tokio::test]
async fn test_incompatible_and_undeclared_candidates_are_dropped() {
    let log = EventLog::default();
    let axis = node("axis", DeviceCategory::LinearAxis, None, &log);
    let camera = node("camera", DeviceCategory::Camera, None, &log);
    let wrong = node_with(
        "wrong",
        DeviceCategory::LinearAxis,
        None,
        Probe {
            log: log.clone(),
            fail_open: true,
            ..Default::default()
        },
    );
    let driver = fixed(vec![axis, camera, wrong]);

    let devices = enumerate_devices(&driver).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name(), "axis");
    // the undeclared camera was never opened
    assert!(!log.take().contains(&"open camera".to_string()));
}
