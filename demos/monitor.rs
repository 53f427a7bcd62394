//! Opens the default adapter, accepts every pairing request and logs what happens until BlueZ
//! goes away.

use std::rc::Rc;

use bluedeck::{agent::AgentEvent, manager::AdapterState, AdapterEvent, Manager, Session};

#[pollster::main]
async fn main() -> bluedeck::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .init();

    let session = Session::new().await?;
    let manager = Manager::new(session);
    manager.subscribe_notices(|notice| log::warn!("{}", notice));

    if manager.start().await == AdapterState::Unavailable {
        return Ok(());
    }
    let Some(adapter) = manager.adapter() else {
        return Ok(());
    };

    log::info!(
        "adapter {} (powered: {}, discovering: {})",
        adapter.path(),
        adapter.is_powered(),
        adapter.is_discovering(),
    );
    for device in adapter.devices() {
        log::info!("{} {}: {}", device.address(), device.display_name(), device.status());
    }

    let events = adapter.clone();
    adapter.subscribe(move |event| match event {
        AdapterEvent::DeviceAdded(path) => {
            if let Some(device) = events.device(path) {
                log::info!(
                    "found {} ({:?}): {}",
                    device.address(),
                    device.kind(),
                    device.display_name(),
                );
            }
        }
        AdapterEvent::DeviceRemoved(path) => log::info!("{} is gone", path),
        AdapterEvent::PoweredChanged(on) => log::info!("powered: {}", on),
        AdapterEvent::DiscoveringChanged(on) => log::info!("discovering: {}", on),
    });

    let agent = Rc::clone(adapter.agent());
    adapter.agent().subscribe(move |event| match event {
        AgentEvent::ConfirmationRequested {
            device,
            request,
            passkey,
        } => {
            log::info!("{}: confirming passkey {:06}", device, passkey);
            agent.confirm_pairing(*request);
        }
        AgentEvent::AuthorizationRequested { device, request } => {
            log::info!("{}: allowing pairing", device);
            agent.confirm_authorization(*request);
        }
        AgentEvent::PinDisplayRequested {
            device,
            request,
            pincode,
        } => {
            log::info!("{}: type {} on the device", device, pincode);
            agent.confirm_pairing(*request);
        }
        other => log::debug!("agent: {:?}", other),
    });

    let res = manager.run().await;
    manager.shutdown().await;
    res
}
