mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Scenario, WeatherSim};

struct Topics {
    telemetry: String,
    control: String,
    status: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// The servo only understands these two commands.
fn servo_command(payload: &[u8]) -> Option<&'static str> {
    match String::from_utf8_lossy(payload).trim().to_lowercase().as_str() {
        "buka" => Some("buka"),
        "tutup" => Some("tutup"),
        _ => None,
    }
}

fn local_now(offset: UtcOffset) -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc().to_offset(offset);
    PrimitiveDateTime::new(now.date(), now.time())
}

fn hour_of_day(t: PrimitiveDateTime) -> f64 {
    f64::from(t.hour()) + f64::from(t.minute()) / 60.0
}

fn main() -> Result<()> {
    // Read while the process is still single-threaded.
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run(offset))
}

async fn run(offset: UtcOffset) -> Result<()> {
    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 10);
    let servo_delay = Duration::from_millis(env_or("SERVO_DELAY_MS", 1500));
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let topics = Topics {
        telemetry: env::var("TELEMETRY_TOPIC").unwrap_or_else(|_| "jemuran/data".to_string()),
        control: env::var("CONTROL_TOPIC").unwrap_or_else(|_| "jemuran/control".to_string()),
        status: env::var("STATUS_TOPIC").unwrap_or_else(|_| "jemuran/status".to_string()),
    };

    let mut mqttoptions = MqttOptions::new("dryrack-node", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

    tokio::spawn(drive(eventloop, client.clone(), topics.control.clone(), topics.status.clone(), servo_delay));

    info!(%scenario, topic = %topics.telemetry, every_s = sample_every_s, "publishing telemetry");

    let mut sim = WeatherSim::new(scenario);
    loop {
        let now = local_now(offset);
        let reading = sim.sample(hour_of_day(now));
        let payload = reading.to_payload(now);

        match client
            .publish(&topics.telemetry, QoS::AtLeastOnce, false, payload.clone())
            .await
        {
            Ok(()) => debug!(%payload, "published"),
            Err(e) => warn!("publish error: {e}"),
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

/// Keep the connection alive, subscribe to control after every ConnAck and
/// answer commands on the status topic once the servo has moved.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    control_topic: String,
    status_topic: String,
    servo_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("node connected to mqtt");
                if let Err(e) = client.try_subscribe(control_topic.as_str(), QoS::AtLeastOnce) {
                    warn!("subscribe {control_topic} failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) if p.topic == control_topic => {
                let Some(action) = servo_command(&p.payload) else {
                    warn!(payload = %String::from_utf8_lossy(&p.payload), "ignoring unknown command");
                    continue;
                };
                info!(action, "servo moving");
                let client = client.clone();
                let status_topic = status_topic.clone();
                tokio::spawn(async move {
                    sleep(servo_delay).await;
                    match client.publish(status_topic, QoS::AtLeastOnce, false, action).await {
                        Ok(()) => info!(action, "servo done, status sent"),
                        Err(e) => warn!("status publish error: {e}"),
                    }
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. retrying...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
