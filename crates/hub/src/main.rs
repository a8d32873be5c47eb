mod config;
mod control;
mod db;
mod dispense;
mod engine;
mod error;
mod monitor;
mod mqtt;
mod profile;
mod pump;
mod registry;
mod role;
mod sensor;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use control::Controller;
use db::Db;
use engine::DosingEngine;
use monitor::SafetyMonitor;
use mqtt::{Inbound, AUTO_DOSING_TOPIC, CHEM_TOPIC_FILTER};
use profile::FileProfileProvider;
use registry::ActuatorRegistry;
use sensor::{SensorProvider, TelemetrySensor};
use state::{SharedState, SystemState};
use store::DosingStore;

/// History entries restored from the database at start-up.
const SEED_HISTORY: i64 = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:nutrient.db?mode=rwc".to_string());
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    // ── Hub settings ────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Pumps ───────────────────────────────────────────────────────
    let registry = Arc::new(ActuatorRegistry::new());
    for (role, p) in cfg.pumps() {
        let pin = u8::try_from(p.gpio_pin)
            .with_context(|| format!("gpio_pin {} out of range", p.gpio_pin))?;
        let output = pump::open(&p.name, pin, active_low)?;
        registry.register(role, &p.name, p.product.clone(), output);
    }
    let roles = registry.roles();
    if roles.is_empty() {
        warn!("no pumps configured; dosing cycles will have nothing to drive");
    }

    // ── Dosing state + shared status ────────────────────────────────
    let store = Arc::new(DosingStore::open(&cfg.paths.state_path, &roles));
    info!(
        path = %store.path().display(),
        enabled = store.is_enabled(),
        "dosing state loaded"
    );
    let shared = SystemState::shared();
    {
        let doses = db.recent_doses(SEED_HISTORY).await.unwrap_or_else(|e| {
            warn!("could not restore dose history: {e:#}");
            Vec::new()
        });
        let readings = db.recent_readings(SEED_HISTORY).await.unwrap_or_else(|e| {
            warn!("could not restore sensor history: {e:#}");
            Vec::new()
        });
        let mut st = shared.write().await;
        st.seed_history(doses, readings);
        st.record_system(format!(
            "hub started ({} pump(s), auto dosing {})",
            roles.len(),
            if store.is_enabled() { "enabled" } else { "disabled" }
        ));
    }

    // ── Engine, safety loop, control surface ────────────────────────
    let sensor = Arc::new(TelemetrySensor::new(cfg.timing.sensor_stale_after()));
    let engine = Arc::new(
        DosingEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&sensor) as Arc<dyn SensorProvider>,
            Arc::clone(&shared),
            cfg.timing.engine_limits(),
        )
        .with_db(db.clone()),
    );
    let monitor = Arc::new(
        SafetyMonitor::new(Arc::clone(&engine), cfg.timing.monitor_settings())
            .with_profile(Arc::new(FileProfileProvider::new(&cfg.paths.profile_path))),
    );
    // Runs from boot so the stuck-pump sweep never depends on the enable flag.
    monitor.start();

    let controller = Arc::new(Controller::new(
        Arc::clone(&engine),
        Arc::clone(&monitor),
        &cfg.paths.history_export_path,
    ));

    // ── Web server ──────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let web = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = web::serve(controller, web_port, shutdown).await {
                error!("web server stopped: {e:#}");
            }
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("nutrient-hub", broker, mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    tokio::select! {
        _ = run_mqtt(client, eventloop, Arc::clone(&controller), sensor, Arc::clone(&shared)) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("ctrl-c handler failed: {e}");
            }
            info!("shutdown requested");
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    controller.shutdown().await;
    if let Err(e) = controller.export_history().await {
        error!("history export failed: {e:#}");
    }
    if let Err(e) = store.blocking(|s| s.persist()).await {
        error!("final dosing state write failed: {e:#}");
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = web.await {
        error!("web task ended abnormally: {e}");
    }
    info!("hub stopped");
    Ok(())
}

/// Poll the broker forever: chemistry telemetry feeds the sensor cache,
/// the auto-dosing topic toggles the enable flag.
async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    controller: Arc<Controller>,
    sensor: Arc<TelemetrySensor>,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => match mqtt::decode(&p.topic, &p.payload) {
                Ok(Some(Inbound::Chem { node_id, snapshot })) => {
                    debug!(
                        node = %node_id,
                        ph = snapshot.ph,
                        ec = snapshot.ec,
                        water_temp = snapshot.water_temp,
                        "chem telemetry"
                    );
                    sensor.ingest(snapshot);
                }
                Ok(Some(Inbound::AutoDosing(on))) => {
                    info!(on, "auto dosing command via mqtt");
                    if on {
                        controller.enable().await;
                    } else {
                        controller.disable().await;
                    }
                }
                Ok(None) => debug!(topic = %p.topic, "unhandled topic"),
                Err(msg) => {
                    warn!(topic = %p.topic, "{msg}");
                    shared.write().await.record_error(msg);
                }
            },
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean session: subscriptions do not survive a reconnect.
                for topic in [CHEM_TOPIC_FILTER, AUTO_DOSING_TOPIC] {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        error!(topic, "mqtt subscribe failed: {e}");
                    }
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
