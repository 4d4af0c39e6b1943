// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the deployment lifecycle
//!
//! These tests drive the application service end to end:
//! 1. Parse a protocol manifest
//! 2. Create a deployment
//! 3. Register devices and fetch/confirm configurations
//! 4. Verify device and aggregate status after every step

use fieldstudy_core::application::{DeploymentService, DeploymentServiceError, StandardDeploymentService};
use fieldstudy_core::domain::consistency::{BuiltinDeviceCapabilities, Fingerprint};
use fieldstudy_core::domain::deployment::{
    DeploymentError, DeploymentId, DeploymentState, DeviceDeploymentState, ErrorKind,
};
use fieldstudy_core::domain::device::{
    DeviceDescriptor, DeviceKind, DeviceRegistration, RegistrationDetails, RoleName,
};
use fieldstudy_core::domain::events::DeploymentEvent;
use fieldstudy_core::domain::protocol::StudyProtocol;
use fieldstudy_core::domain::repository::StudyDeploymentRepository;
use fieldstudy_core::infrastructure::event_bus::EventBus;
use fieldstudy_core::infrastructure::protocol_parser::ProtocolParser;
use fieldstudy_core::infrastructure::repositories::InMemoryStudyDeploymentRepository;
use std::sync::Arc;

fn role(name: &str) -> RoleName {
    RoleName::new(name).unwrap()
}

fn demo_protocol(file: &str) -> StudyProtocol {
    let path = format!("{}/../../demo-protocols/{}", env!("CARGO_MANIFEST_DIR"), file);
    ProtocolParser::parse_file(path).expect("Failed to parse demo protocol")
}

fn service() -> StandardDeploymentService {
    StandardDeploymentService::new(
        Arc::new(InMemoryStudyDeploymentRepository::new()),
        Arc::new(BuiltinDeviceCapabilities),
        Arc::new(EventBus::new(256)),
    )
}

fn strap(device_id: &str, mac: &str) -> DeviceRegistration {
    DeviceRegistration::new(device_id).with_details(RegistrationDetails::MacAddress {
        mac_address: mac.to_string(),
    })
}

fn beacon(device_id: &str) -> DeviceRegistration {
    DeviceRegistration::new(device_id).with_details(RegistrationDetails::AltBeacon {
        manufacturer_id: 0x0118,
        organization_id: "clinic".to_string(),
        major_id: 1,
        minor_id: 7,
    })
}

async fn deploy(service: &StandardDeploymentService, id: DeploymentId, device: &str) -> Fingerprint {
    let issued = service.get_device_deployment(id, &role(device)).await.unwrap();
    service
        .confirm_device_deployment(id, &role(device), &issued.fingerprint)
        .await
        .unwrap();
    issued.fingerprint
}

#[tokio::test]
async fn test_phone_sensor_scenario() {
    let service = service();
    let id = service
        .create_deployment(demo_protocol("phone-sensor.yaml"))
        .await
        .unwrap();
    assert_eq!(
        service.get_deployment_status(id).await.unwrap().state,
        DeploymentState::Invited
    );

    // Sensor first, then Phone
    let status = service
        .register_device(id, &role("Sensor"), strap("strap-1", "AA:BB:CC:DD:EE:01"))
        .await
        .unwrap();
    assert_eq!(status.state, DeploymentState::DeployingDevices);
    assert_eq!(
        status.device("Phone").unwrap().remaining_devices_to_register,
        vec![role("Phone")]
    );

    let status = service
        .register_device(id, &role("Phone"), DeviceRegistration::new("phone-1"))
        .await
        .unwrap();
    assert_eq!(status.state, DeploymentState::DeployingDevices);
    assert!(status.device("Phone").unwrap().can_obtain_deployment);

    let issued = service.get_device_deployment(id, &role("Phone")).await.unwrap();
    let f1 = issued.fingerprint.clone();
    assert_eq!(issued.deployment.connected_devices.len(), 1);
    assert_eq!(issued.deployment.task_controls.len(), 3);
    assert_eq!(issued.deployment.tasks.len(), 2);

    let status = service
        .confirm_device_deployment(id, &role("Phone"), &f1)
        .await
        .unwrap();
    assert_eq!(status.state, DeploymentState::DeploymentReady);
    assert_eq!(status.device("Phone").unwrap().state, DeviceDeploymentState::Deployed);
    assert_eq!(status.device("Phone").unwrap().deployed_fingerprint, Some(f1.clone()));
    assert!(status.ready_on.is_some());

    // New strap for the same role
    let status = service
        .replace_device_registration(id, &role("Sensor"), strap("strap-2", "AA:BB:CC:DD:EE:02"))
        .await
        .unwrap();
    assert_eq!(
        status.device("Phone").unwrap().state,
        DeviceDeploymentState::NeedsRedeployment
    );
    assert_eq!(status.state, DeploymentState::DeployingDevices);

    let stale = service.confirm_device_deployment(id, &role("Phone"), &f1).await;
    assert!(matches!(
        stale,
        Err(DeploymentServiceError::Domain(DeploymentError::InconsistentDeployment { .. }))
    ));
    assert_eq!(stale.unwrap_err().kind(), Some(ErrorKind::InconsistentDeployment));

    let f2 = deploy(&service, id, "Phone").await;
    assert_ne!(f1, f2);
    assert_eq!(
        service.get_deployment_status(id).await.unwrap().state,
        DeploymentState::DeploymentReady
    );
}

#[tokio::test]
async fn test_reregistration_requires_unregister_or_replace() {
    let service = service();
    let id = service
        .create_deployment(demo_protocol("phone-sensor.yaml"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Sensor"), strap("strap-1", "AA:BB:CC:DD:EE:01"))
        .await
        .unwrap();

    let result = service
        .register_device(id, &role("Sensor"), strap("strap-2", "AA:BB:CC:DD:EE:02"))
        .await;
    assert!(matches!(
        result,
        Err(DeploymentServiceError::Domain(DeploymentError::AlreadyRegistered(_)))
    ));
    assert_eq!(result.unwrap_err().kind(), Some(ErrorKind::Conflict));

    service.unregister_device(id, &role("Sensor")).await.unwrap();
    let status = service
        .register_device(id, &role("Sensor"), strap("strap-2", "AA:BB:CC:DD:EE:02"))
        .await
        .unwrap();
    assert_eq!(status.device("Sensor").unwrap().state, DeviceDeploymentState::Registered);

    let result = service.unregister_device(id, &role("Phone")).await;
    assert!(matches!(
        result,
        Err(DeploymentServiceError::Domain(DeploymentError::NotRegistered(_)))
    ));
}

#[tokio::test]
async fn test_device_ids_are_unique_per_deployment() {
    let service = service();
    let protocol = demo_protocol("phone-sensor.yaml");
    let first = service.create_deployment(protocol.clone()).await.unwrap();
    let second = service.create_deployment(protocol).await.unwrap();

    service
        .register_device(first, &role("Phone"), DeviceRegistration::new("shared"))
        .await
        .unwrap();
    let clash = service
        .register_device(first, &role("Sensor"), strap("shared", "AA:BB:CC:DD:EE:01"))
        .await;
    assert!(matches!(
        clash,
        Err(DeploymentServiceError::Domain(DeploymentError::DuplicateDeviceId { .. }))
    ));

    // Other deployments are independent
    service
        .register_device(second, &role("Sensor"), strap("shared", "AA:BB:CC:DD:EE:01"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_readiness_does_not_depend_on_registration_order() {
    let service = service();
    let protocol = demo_protocol("clinic-visit.yaml");
    let orders: [[&str; 3]; 3] = [
        ["Participant phone", "Chest strap", "Waiting room beacon"],
        ["Waiting room beacon", "Participant phone", "Chest strap"],
        ["Chest strap", "Waiting room beacon", "Participant phone"],
    ];

    let mut snapshots = Vec::new();
    for order in orders {
        let id = service.create_deployment(protocol.clone()).await.unwrap();
        for (step, device) in order.iter().enumerate() {
            let registration = match *device {
                "Chest strap" => strap("strap", "00:11:22:33:44:55"),
                "Waiting room beacon" => beacon("beacon"),
                _ => DeviceRegistration::new("phone"),
            };
            let status = service.register_device(id, &role(device), registration).await.unwrap();
            let phone = status.device("Participant phone").unwrap();
            assert_eq!(phone.can_obtain_deployment, step == 2);
        }

        let issued = service
            .get_device_deployment(id, &role("Participant phone"))
            .await
            .unwrap();
        snapshots.push(issued.deployment);
    }

    for snapshot in &snapshots {
        assert_eq!(snapshot.connected_devices, snapshots[0].connected_devices);
        assert_eq!(snapshot.connections, snapshots[0].connections);
        assert_eq!(snapshot.task_controls, snapshots[0].task_controls);
    }
}

#[tokio::test]
async fn test_issuance_is_idempotent_and_does_not_publish() {
    let service = service();
    let id = service
        .create_deployment(demo_protocol("phone-sensor.yaml"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Phone"), DeviceRegistration::new("phone"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Sensor"), strap("strap", "AA:BB:CC:DD:EE:01"))
        .await
        .unwrap();

    let mut events = service.event_bus().subscribe_deployment(id);
    let first = service.get_device_deployment(id, &role("Phone")).await.unwrap();
    let second = service.get_device_deployment(id, &role("Phone")).await.unwrap();
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first.deployment, second.deployment);

    assert!(matches!(
        events.recv().await.unwrap(),
        DeploymentEvent::DeviceDeploymentIssued { .. }
    ));
    service.stop(id).await.unwrap();
    // The second issue published nothing, so the next event is the stop.
    assert!(matches!(
        events.recv().await.unwrap(),
        DeploymentEvent::DeploymentStopped { .. }
    ));
}

#[tokio::test]
async fn test_single_primary_without_connected_devices() {
    let service = service();
    let mut protocol = StudyProtocol::new("browser-only");
    protocol
        .add_primary_device(DeviceDescriptor::primary(role("Browser"), DeviceKind::WebBrowser))
        .unwrap();
    let id = service.create_deployment(protocol).await.unwrap();

    let status = service
        .register_device(id, &role("Browser"), DeviceRegistration::new("browser"))
        .await
        .unwrap();
    assert!(status.device("Browser").unwrap().can_obtain_deployment);

    deploy(&service, id, "Browser").await;
    assert_eq!(
        service.get_deployment_status(id).await.unwrap().state,
        DeploymentState::DeploymentReady
    );
}

#[tokio::test]
async fn test_optional_primary_does_not_block_readiness() {
    let service = service();
    let id = service
        .create_deployment(demo_protocol("clinic-visit.yaml"))
        .await
        .unwrap();

    service
        .register_device(id, &role("Participant phone"), DeviceRegistration::new("phone"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Chest strap"), strap("strap", "00:11:22:33:44:55"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Waiting room beacon"), beacon("beacon"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Clinician dashboard"), DeviceRegistration::new("dashboard"))
        .await
        .unwrap();

    deploy(&service, id, "Participant phone").await;
    assert_eq!(
        service.get_deployment_status(id).await.unwrap().state,
        DeploymentState::DeployingDevices
    );

    deploy(&service, id, "Clinician dashboard").await;
    let status = service.get_deployment_status(id).await.unwrap();
    assert_eq!(status.state, DeploymentState::DeploymentReady);
    assert_eq!(
        status.device("Participant browser").unwrap().state,
        DeviceDeploymentState::Unregistered
    );
}

#[tokio::test]
async fn test_unregistering_connected_device_invalidates_primary() {
    let service = service();
    let id = service
        .create_deployment(demo_protocol("phone-sensor.yaml"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Phone"), DeviceRegistration::new("phone"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Sensor"), strap("strap", "AA:BB:CC:DD:EE:01"))
        .await
        .unwrap();
    deploy(&service, id, "Phone").await;

    let mut events = service.event_bus().subscribe_deployment(id);
    let status = service.unregister_device(id, &role("Sensor")).await.unwrap();
    let phone = status.device("Phone").unwrap();
    assert_eq!(phone.state, DeviceDeploymentState::NeedsRedeployment);
    assert!(!phone.can_obtain_deployment);
    assert_eq!(phone.remaining_devices_to_register, vec![role("Sensor")]);

    assert!(matches!(
        events.recv().await.unwrap(),
        DeploymentEvent::DeviceUnregistered { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        DeploymentEvent::RedeploymentRequired { .. }
    ));

    let result = service.get_device_deployment(id, &role("Phone")).await;
    assert!(matches!(
        result,
        Err(DeploymentServiceError::Domain(DeploymentError::NotReady { .. }))
    ));
}

/// Hub (primary) -> Phone (primary) -> Strap
fn relay_protocol() -> StudyProtocol {
    let mut protocol = StudyProtocol::new("relay");
    protocol
        .add_primary_device(DeviceDescriptor::primary(role("Hub"), DeviceKind::CustomProtocolDevice))
        .unwrap();
    protocol
        .add_connected_device(DeviceDescriptor::primary(role("Phone"), DeviceKind::Smartphone), &role("Hub"))
        .unwrap();
    protocol
        .add_connected_device(
            DeviceDescriptor::connected(role("Strap"), DeviceKind::BleHeartRateDevice),
            &role("Phone"),
        )
        .unwrap();
    protocol
}

#[tokio::test]
async fn test_nested_primary_devices() {
    let service = service();
    let id = service.create_deployment(relay_protocol()).await.unwrap();

    service
        .register_device(id, &role("Hub"), DeviceRegistration::new("hub"))
        .await
        .unwrap();
    let status = service
        .register_device(id, &role("Phone"), DeviceRegistration::new("phone"))
        .await
        .unwrap();
    assert_eq!(status.device("Hub").unwrap().remaining_devices_to_register, vec![role("Strap")]);
    assert!(!status.device("Phone").unwrap().can_obtain_deployment);

    service
        .register_device(id, &role("Strap"), strap("strap-1", "AA:BB:CC:DD:EE:01"))
        .await
        .unwrap();

    // The inner primary alone does not make the deployment ready
    deploy(&service, id, "Phone").await;
    assert_eq!(
        service.get_deployment_status(id).await.unwrap().state,
        DeploymentState::DeployingDevices
    );

    let issued = service.get_device_deployment(id, &role("Hub")).await.unwrap();
    let mut covered: Vec<RoleName> = issued
        .deployment
        .connected_devices
        .iter()
        .map(|d| d.role_name.clone())
        .collect();
    covered.sort();
    assert_eq!(covered, vec![role("Phone"), role("Strap")]);
    assert_eq!(issued.deployment.connections.get(&role("Strap")), Some(&role("Phone")));

    let hub_fingerprint = issued.fingerprint;
    let status = service
        .confirm_device_deployment(id, &role("Hub"), &hub_fingerprint)
        .await
        .unwrap();
    assert_eq!(status.state, DeploymentState::DeploymentReady);

    // Both primaries depend on the strap
    let mut events = service.event_bus().subscribe_deployment(id);
    let status = service.unregister_device(id, &role("Strap")).await.unwrap();
    assert_eq!(status.state, DeploymentState::DeployingDevices);
    for primary in ["Hub", "Phone"] {
        assert_eq!(
            status.device(primary).unwrap().state,
            DeviceDeploymentState::NeedsRedeployment
        );
    }

    assert!(matches!(
        events.recv().await.unwrap(),
        DeploymentEvent::DeviceUnregistered { .. }
    ));
    let mut flagged = Vec::new();
    for _ in 0..2 {
        match events.recv().await.unwrap() {
            DeploymentEvent::RedeploymentRequired { role_name, .. } => flagged.push(role_name),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    flagged.sort();
    assert_eq!(flagged, vec![role("Hub"), role("Phone")]);

    service
        .register_device(id, &role("Strap"), strap("strap-2", "AA:BB:CC:DD:EE:02"))
        .await
        .unwrap();
    let stale = service
        .confirm_device_deployment(id, &role("Hub"), &hub_fingerprint)
        .await;
    assert_eq!(stale.unwrap_err().kind(), Some(ErrorKind::InconsistentDeployment));

    deploy(&service, id, "Phone").await;
    let redeployed = deploy(&service, id, "Hub").await;
    assert_ne!(redeployed, hub_fingerprint);
    assert_eq!(
        service.get_deployment_status(id).await.unwrap().state,
        DeploymentState::DeploymentReady
    );
}

#[tokio::test]
async fn test_stopped_deployment_is_terminal() {
    let service = service();
    let id = service
        .create_deployment(demo_protocol("phone-sensor.yaml"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Phone"), DeviceRegistration::new("phone"))
        .await
        .unwrap();

    let status = service.stop(id).await.unwrap();
    assert_eq!(status.state, DeploymentState::Stopped);
    assert!(status.stopped_on.is_some());

    let register = service
        .register_device(id, &role("Sensor"), strap("strap", "AA:BB:CC:DD:EE:01"))
        .await;
    let unregister = service.unregister_device(id, &role("Phone")).await;
    let issue = service.get_device_deployment(id, &role("Phone")).await;
    let confirm = service
        .confirm_device_deployment(id, &role("Phone"), &Fingerprint::new("anything"))
        .await;

    for error in [
        register.unwrap_err(),
        unregister.unwrap_err(),
        issue.unwrap_err(),
        confirm.unwrap_err(),
    ] {
        assert!(matches!(
            error,
            DeploymentServiceError::Domain(DeploymentError::DeploymentStopped(_))
        ));
        assert_eq!(error.kind(), Some(ErrorKind::State));
    }

    assert_eq!(service.stop(id).await.unwrap().state, DeploymentState::Stopped);
    assert_eq!(
        service.get_deployment_status(id).await.unwrap().state,
        DeploymentState::Stopped
    );
}

#[tokio::test]
async fn test_list_deployments() {
    let service = service();
    let first = service
        .create_deployment(demo_protocol("phone-sensor.yaml"))
        .await
        .unwrap();
    let second = service
        .create_deployment(demo_protocol("clinic-visit.yaml"))
        .await
        .unwrap();

    let listed: Vec<DeploymentId> = service
        .list_deployments()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.deployment_id)
        .collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&first));
    assert!(listed.contains(&second));
}

#[tokio::test]
async fn test_failed_commands_leave_deployment_untouched() {
    let repository = Arc::new(InMemoryStudyDeploymentRepository::new());
    let service = StandardDeploymentService::new(
        repository.clone(),
        Arc::new(BuiltinDeviceCapabilities),
        Arc::new(EventBus::new(16)),
    );
    let id = service
        .create_deployment(demo_protocol("phone-sensor.yaml"))
        .await
        .unwrap();
    service
        .register_device(id, &role("Phone"), DeviceRegistration::new("phone"))
        .await
        .unwrap();
    let before = repository.load(id).await.unwrap().unwrap();

    let malformed = service
        .register_device(id, &role("Sensor"), strap("strap", "not-a-mac"))
        .await;
    assert!(matches!(
        malformed,
        Err(DeploymentServiceError::Domain(DeploymentError::InvalidRegistration { .. }))
    ));
    assert_eq!(malformed.unwrap_err().kind(), Some(ErrorKind::Validation));

    let unknown = service
        .register_device(id, &role("Watch"), DeviceRegistration::new("watch"))
        .await;
    assert!(matches!(
        unknown,
        Err(DeploymentServiceError::Domain(DeploymentError::UnknownRole(_)))
    ));

    let not_ready = service.get_device_deployment(id, &role("Phone")).await;
    assert_eq!(not_ready.unwrap_err().kind(), Some(ErrorKind::State));

    let after = repository.load(id).await.unwrap().unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.value, before.value);
}
