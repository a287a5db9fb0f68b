//! Serial port arbitration between competing probes.

use std::sync::Arc;
use std::time::Duration;

use daq_orchestrator::error::DaqError;
use daq_orchestrator::serial::{PortState, SerialPortManager, StaticPorts};
use tokio::time::timeout;

#[tokio::test]
async fn test_second_requester_fails_after_mark() {
    let manager = SerialPortManager::with_static_ports(["/dev/ttyUSB0"]).unwrap();

    manager.request_port("/dev/ttyUSB0", "mds").await.unwrap();
    manager.mark_port("/dev/ttyUSB0", "mds").unwrap();

    let err = manager
        .request_port("/dev/ttyUSB0", "ophir")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DaqError::PortAlreadyAssigned { ref port, ref owner } if port == "/dev/ttyUSB0" && owner == "mds"
    ));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_second_requester_acquires_after_release() {
    let manager = Arc::new(SerialPortManager::with_static_ports(["COM4"]).unwrap());
    manager.request_port("COM4", "mds").await.unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.request_port("COM4", "ophir").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        manager.port_state("COM4"),
        Some(PortState::Testing("mds".into()))
    );

    // probe failed, port goes back to the pool
    manager.release_port("COM4").unwrap();
    timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    manager.mark_port("COM4", "ophir").unwrap();
    assert_eq!(
        manager.port_state("COM4").unwrap().owner(),
        Some("ophir")
    );
}

#[tokio::test]
async fn test_many_waiters_are_served_one_at_a_time() {
    let manager = Arc::new(SerialPortManager::with_static_ports(["COM1"]).unwrap());

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let owner = format!("probe{i}");
                manager.request_port("COM1", &owner).await?;
                // nobody else may be testing right now
                let state = manager.port_state("COM1");
                tokio::time::sleep(Duration::from_millis(2)).await;
                manager.release_port("COM1")?;
                Ok::<_, DaqError>(state)
            })
        })
        .collect();

    for task in tasks {
        let state = timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(state, Some(PortState::Testing(_))));
    }
    assert_eq!(manager.port_state("COM1"), Some(PortState::Free));
}

#[tokio::test]
async fn test_same_owner_request_is_idempotent() {
    let manager = SerialPortManager::with_static_ports(["COM1"]).unwrap();
    manager.request_port("COM1", "mds").await.unwrap();
    manager.request_port("COM1", "mds").await.unwrap();
    manager.mark_port("COM1", "mds").unwrap();
    manager.request_port("COM1", "mds").await.unwrap();
    assert_eq!(
        manager.port_state("COM1"),
        Some(PortState::Assigned("mds".into()))
    );
}

#[tokio::test]
async fn test_unplugged_port_fails_waiters() {
    let ports = Arc::new(StaticPorts::new(["COM1"]));
    let manager = Arc::new(SerialPortManager::new(ports.clone()).unwrap());
    manager.request_port("COM1", "mds").await.unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.request_port("COM1", "ophir").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    ports.set(Vec::<String>::new());
    assert_eq!(manager.refresh().unwrap(), 0);

    let result = timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(DaqError::PortNotFound(_))));
    assert!(manager.list_ports().is_empty());
}
