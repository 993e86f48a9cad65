//! Sensor runtime behavior: templates, availability, attributes, expiry,
//! and force_update.

mod common;

use std::time::Duration;

use common::TestMqtt;
use opp_core::events::StateChangedData;
use serde_json::json;

#[tokio::test]
async fn test_value_template_applied() {
    let test = TestMqtt::new().await;

    test.announce(
        "power",
        &json!({
            "name": "Power",
            "state_topic": "tele/meter/SENSOR",
            "unique_id": "meter-power",
            "value_template": "{{ value_json.ENERGY.Power }}"
        }),
    )
    .await;

    test.publish("tele/meter/SENSOR", r#"{"ENERGY": {"Power": 42}}"#).await;
    test.assert_state("sensor.power", "42");
}

#[tokio::test]
async fn test_template_error_drops_payload() {
    let test = TestMqtt::new().await;

    test.announce(
        "power",
        &json!({
            "name": "Power",
            "state_topic": "tele/meter/SENSOR",
            "unique_id": "meter-power",
            "value_template": "{{ value_json.ENERGY.Power }}"
        }),
    )
    .await;

    test.publish("tele/meter/SENSOR", r#"{"ENERGY": {"Power": 42}}"#).await;
    // value_json is undefined for non-JSON payloads; attribute access fails
    test.publish("tele/meter/SENSOR", "not json").await;
    test.assert_state("sensor.power", "42");
}

#[tokio::test]
async fn test_singular_availability() {
    let test = TestMqtt::new().await;

    test.announce(
        "pump",
        &json!({
            "name": "Pump",
            "state_topic": "tele/pump/state",
            "unique_id": "pump-1",
            "availability_topic": "tele/pump/LWT",
            "payload_available": "Online",
            "payload_not_available": "Offline"
        }),
    )
    .await;

    // No availability report yet: offline
    test.assert_state("sensor.pump", "unavailable");

    test.publish("tele/pump/LWT", "Online").await;
    test.assert_state("sensor.pump", "unknown");

    test.publish("tele/pump/state", "running").await;
    test.assert_state("sensor.pump", "running");

    test.publish("tele/pump/LWT", "Offline").await;
    test.assert_state("sensor.pump", "unavailable");
}

#[tokio::test]
async fn test_availability_all_mode() {
    let test = TestMqtt::new().await;

    test.announce(
        "link",
        &json!({
            "name": "Link",
            "state_topic": "tele/link/state",
            "unique_id": "link-1",
            "availability_mode": "all",
            "availability": [
                {"topic": "tele/link/net"},
                {"topic": "tele/link/device"}
            ]
        }),
    )
    .await;

    test.publish("tele/link/net", "online").await;
    test.assert_state("sensor.link", "unavailable");

    test.publish("tele/link/device", "online").await;
    test.assert_state("sensor.link", "unknown");

    test.publish("tele/link/net", "offline").await;
    test.assert_state("sensor.link", "unavailable");
}

#[tokio::test]
async fn test_json_attributes() {
    let test = TestMqtt::new().await;

    test.announce(
        "node",
        &json!({
            "name": "Node",
            "state_topic": "tele/node/state",
            "unique_id": "node-1",
            "json_attributes_topic": "tele/node/attrs"
        }),
    )
    .await;
    test.publish("tele/node/state", "ok").await;

    test.publish("tele/node/attrs", r#"{"batt": 94, "rssi": -60}"#).await;
    let state = test.opp.states.get("sensor.node").unwrap();
    assert_eq!(state.attributes.get("batt"), Some(&json!(94)));
    assert_eq!(state.attributes.get("rssi"), Some(&json!(-60)));

    // A non-dictionary payload is skipped; held attributes survive
    test.publish("tele/node/attrs", r#"[1, 2, 3]"#).await;
    let state = test.opp.states.get("sensor.node").unwrap();
    assert_eq!(state.attributes.get("batt"), Some(&json!(94)));
}

#[tokio::test(start_paused = true)]
async fn test_expire_after_timeline() {
    let test = TestMqtt::new().await;

    test.announce(
        "soil",
        &json!({
            "name": "Soil",
            "state_topic": "tele/soil/state",
            "unique_id": "soil-1",
            "expire_after": 5
        }),
    )
    .await;

    test.publish("tele/soil/state", "30").await;
    test.assert_state("sensor.soil", "30");

    // A fresh value resets the expiry clock
    tokio::time::sleep(Duration::from_secs(3)).await;
    test.publish("tele/soil/state", "31").await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    test.assert_state("sensor.soil", "31");

    // Two more seconds pass the deadline of the second value
    tokio::time::sleep(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;
    test.assert_state("sensor.soil", "unavailable");

    // A new value revives the sensor
    test.publish("tele/soil/state", "29").await;
    test.assert_state("sensor.soil", "29");
}

#[tokio::test(start_paused = true)]
async fn test_config_update_rearms_expiry() {
    let test = TestMqtt::new().await;

    test.announce(
        "soil",
        &json!({
            "name": "Soil",
            "state_topic": "tele/soil/state",
            "unique_id": "soil-1",
            "expire_after": 60
        }),
    )
    .await;
    test.publish("tele/soil/state", "30").await;

    // The held value follows the shortened window, not the one it
    // arrived under
    test.announce(
        "soil",
        &json!({
            "name": "Soil",
            "state_topic": "tele/soil/state",
            "unique_id": "soil-1",
            "expire_after": 2
        }),
    )
    .await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;
    test.assert_state("sensor.soil", "unavailable");
}

#[tokio::test]
async fn test_force_update_fires_repeated_events() {
    let test = TestMqtt::new().await;

    test.announce(
        "rain",
        &json!({
            "name": "Rain",
            "state_topic": "tele/rain/state",
            "unique_id": "rain-1",
            "force_update": true
        }),
    )
    .await;

    let mut rx = test.opp.bus.subscribe_typed::<StateChangedData>();
    test.publish("tele/rain/state", "0.0").await;
    test.publish("tele/rain/state", "0.0").await;

    let mut events = 0;
    while rx.try_recv().is_ok() {
        events += 1;
    }
    assert_eq!(events, 2);
}

#[tokio::test]
async fn test_identical_values_without_force_update() {
    let test = TestMqtt::new().await;

    test.announce(
        "rain",
        &json!({
            "name": "Rain",
            "state_topic": "tele/rain/state",
            "unique_id": "rain-1"
        }),
    )
    .await;

    let mut rx = test.opp.bus.subscribe_typed::<StateChangedData>();
    test.publish("tele/rain/state", "0.0").await;
    test.publish("tele/rain/state", "0.0").await;

    let mut events = 0;
    while rx.try_recv().is_ok() {
        events += 1;
    }
    // Only the first write changes the state
    assert_eq!(events, 1);
}

#[tokio::test]
async fn test_presentation_attributes_published() {
    let test = TestMqtt::new().await;

    test.announce(
        "outdoor",
        &json!({
            "name": "Outdoor",
            "state_topic": "tele/outdoor/temp",
            "unique_id": "outdoor-1",
            "unit_of_measurement": "°C",
            "device_class": "temperature",
            "icon": "mdi:thermometer"
        }),
    )
    .await;
    test.publish("tele/outdoor/temp", "21.5").await;

    let state = test.opp.states.get("sensor.outdoor").unwrap();
    assert_eq!(state.state, "21.5");
    assert_eq!(state.attributes.get("unit_of_measurement"), Some(&json!("°C")));
    assert_eq!(state.attributes.get("device_class"), Some(&json!("temperature")));
    assert_eq!(state.attributes.get("icon"), Some(&json!("mdi:thermometer")));
    assert_eq!(state.attributes.get("friendly_name"), Some(&json!("Outdoor")));
}

#[tokio::test]
async fn test_device_block_registers_device() {
    let test = TestMqtt::new().await;

    test.announce(
        "bridge_temp",
        &json!({
            "name": "Bridge Temp",
            "state_topic": "tele/bridge/temp",
            "unique_id": "bridge-temp",
            "device": {
                "identifiers": "bridge-1",
                "connections": [["mac", "AA:BB:CC:DD:EE:FF"]],
                "name": "Bridge",
                "manufacturer": "Acme",
                "model": "B100",
                "sw_version": "1.2.3"
            }
        }),
    )
    .await;

    let device = test
        .opp
        .registries
        .devices
        .get_by_identifier("mqtt", "bridge-1")
        .expect("device registered");
    assert_eq!(device.manufacturer.as_deref(), Some("Acme"));
    // MAC normalized on registration
    assert!(test
        .opp
        .registries
        .devices
        .get_by_connection("mac", "aa:bb:cc:dd:ee:ff")
        .is_some());

    let entry = test
        .opp
        .registries
        .entities
        .get("sensor.bridge_temp")
        .expect("entity registered");
    assert_eq!(entry.device_id.as_deref(), Some(device.id.as_str()));
}
