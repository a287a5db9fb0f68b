//! Discovery to binding, through the public API only.

use std::sync::Arc;

use daq_orchestrator::config::DriversConfig;
use daq_orchestrator::device::{DeviceCategory, PropertyValue};
use daq_orchestrator::driver::{enumerate_devices, DriverRegistry};
use daq_orchestrator::drivers::register_mock_drivers;
use daq_orchestrator::requirements::RequirementRegistry;
use daq_orchestrator::serial::{PortState, SerialPortManager};
use daq_orchestrator::{AppConfig, LabHub};

fn drivers_config(source: &str) -> DriversConfig {
    toml::from_str(source).unwrap()
}

#[tokio::test]
async fn test_aotf_scenario() {
    let ports = Arc::new(SerialPortManager::with_static_ports(["COM1", "COM2", "COM3"]).unwrap());
    let mut requirements = RequirementRegistry::with_requirements([(
        "aotf",
        DeviceCategory::AcustoOpticalModulator,
    )]);
    let mut drivers = DriverRegistry::with_config(drivers_config(
        r#"
        [options.mock_mds]
        ports = ["COM3"]
        settle = "1ms"
        "#,
    ));
    register_mock_drivers(&mut drivers, ports.clone()).unwrap();

    assert!(drivers.refresh(false).await > 0);
    let candidates = drivers.query_drivers(Some(DeviceCategory::AcustoOpticalModulator));
    assert!(!candidates.is_empty());

    let devices = enumerate_devices(&candidates[0]).await.unwrap();
    assert!(!devices.is_empty());
    let aotf = devices[0].clone();
    assert_eq!(aotf.name(), "mds@COM3");

    requirements.link("aotf", aotf.clone()).unwrap();
    assert!(requirements.is_satisfied());

    let returned = requirements.unlink("aotf").unwrap().unwrap();
    assert!(!requirements.is_satisfied());
    assert_eq!(returned.id(), aotf.id());
    // lifecycle end is up to the caller
    returned.close(false).await.unwrap();
    drivers.shutdown().await;
}

#[tokio::test]
async fn test_bound_device_survives_refresh() {
    let config = AppConfig::from_toml_str(
        r#"
        [serial]
        static_ports = ["COM1"]
        read_timeout = "20ms"
        retry_delay = "1ms"

        [drivers]
        disabled = ["mock_camera"]

        [drivers.options.mock_mds]
        ports = ["COM1"]
        settle = "1ms"

        [requirements]
        aotf = "AcustoOpticalModulator"
        "#,
    )
    .unwrap();
    let mut hub = LabHub::from_config(&config).unwrap();
    assert_eq!(hub.refresh(false).await.unwrap(), 2);
    assert!(hub.drivers().driver("mock_camera").is_none());

    hub.auto_link().await.unwrap();
    let aotf = hub.requirements().device("aotf").unwrap();
    aotf.open().await.unwrap();
    assert_eq!(
        hub.ports().port_state("COM1"),
        Some(PortState::Assigned("mds@COM1".into()))
    );

    aotf.set_property("frequency", PropertyValue::Float(96.5))
        .await
        .unwrap();
    aotf.sync_property("frequency").await.unwrap();

    // the driver owning the bound device is reused, so the device stays valid
    hub.refresh(false).await.unwrap();
    assert!(aotf.driver().is_some());
    assert!(aotf.is_opened());
    assert_eq!(
        aotf.get_property("frequency").await.unwrap(),
        PropertyValue::Float(96.5)
    );

    hub.shutdown().await;
    assert!(!aotf.is_opened());
    assert_eq!(hub.ports().port_state("COM1"), Some(PortState::Free));
}

#[tokio::test]
async fn test_power_sensor_tree() {
    let config = AppConfig::from_toml_str(
        r#"
        [serial]
        static_ports = ["COM1", "COM2"]
        read_timeout = "20ms"
        retry_delay = "1ms"

        [drivers.options.mock_mds]
        ports = ["COM1"]
        settle = "1ms"

        [drivers.options.mock_ophir.heads]
        COM2 = "3A-P"

        [requirements]
        aotf = "AcustoOpticalModulator"
        power = "PowerSensor"
        "#,
    )
    .unwrap();
    let mut hub = LabHub::from_config(&config).unwrap();
    hub.refresh(false).await.unwrap();
    hub.auto_link().await.unwrap();
    assert!(hub.is_satisfied());

    let head = hub.requirements().device("power").unwrap();
    assert_eq!(head.name(), "ophir@COM2/head");
    head.open().await.unwrap();

    let adapter = head.parent().unwrap();
    assert_eq!(adapter.category(), DeviceCategory::SensorAdapter);
    assert!(adapter.is_active());
    assert_eq!(
        head.info().await.unwrap().model,
        "3A-P"
    );

    // releasing the binding and closing the head shuts the adapter too
    let head = hub.unlink("power").unwrap().unwrap();
    head.close(false).await.unwrap();
    assert!(!adapter.is_opened());
    assert_eq!(hub.ports().port_state("COM2"), Some(PortState::Free));
}

#[tokio::test]
async fn test_competing_drivers_share_ports() {
    // both drivers probe every port; the arbiter keeps the probes apart
    let config = AppConfig::from_toml_str(
        r#"
        [serial]
        static_ports = ["COM1", "COM2", "COM3"]
        read_timeout = "20ms"
        retry_delay = "1ms"

        [drivers.options.mock_mds]
        ports = ["COM1", "COM3"]
        settle = "2ms"

        [drivers.options.mock_ophir.heads]
        COM2 = "PD300"
        "#,
    )
    .unwrap();
    let mut hub = LabHub::from_config(&config).unwrap();
    hub.refresh(false).await.unwrap();

    let (aotfs, sensors) = tokio::join!(
        hub.find_devices(DeviceCategory::AcustoOpticalModulator),
        hub.find_devices(DeviceCategory::PowerSensor)
    );
    let mut aotf_names: Vec<&str> = aotfs.iter().map(|d| d.name()).collect();
    aotf_names.sort();
    assert_eq!(aotf_names, ["mds@COM1", "mds@COM3"]);
    assert_eq!(sensors.len(), 1);
    for port in ["COM1", "COM2", "COM3"] {
        assert_eq!(hub.ports().port_state(port), Some(PortState::Free));
    }
}
