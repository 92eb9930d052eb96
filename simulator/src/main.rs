mod telemetry;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::{claim_code, Command, Hello, SimDevice};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "simulator", about = "Simulated irrigation controllers over MQTT")]
struct Args {
    #[arg(long, env = "MQTT_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: usize,

    /// Telemetry period per device
    #[arg(
        long,
        env = "INTERVAL_MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval_ms: u64,

    #[arg(long, env = "FIRMWARE", default_value = "1.0.0")]
    firmware: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Arc::new(Args::parse());

    info!("Starting irrigation simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Interval: {}ms",
        args.host, args.port, args.devices, args.interval_ms
    );

    let run_id = Uuid::new_v4().simple().to_string();
    for n in 0..args.devices {
        let device_id = format!("sim-{}-{}", &run_id[..8], n);
        tokio::spawn(run_device(Arc::clone(&args), device_id));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Simulator stopped");
}

async fn run_device(args: Arc<Args>, device_id: String) {
    let mut rng = StdRng::from_entropy();
    let mut device = SimDevice::new(device_id, &mut rng);
    let status_topic = format!("irrig/{}/status", device.id);
    let telemetry_topic = format!("irrig/{}/telemetry", device.id);

    let mut options = MqttOptions::new(device.id.clone(), &args.host, args.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(&status_topic, "offline", QoS::AtLeastOnce, true));
    if let Some(username) = &args.username {
        options.set_credentials(username, args.password.clone().unwrap_or_default());
    }

    let (client, eventloop) = AsyncClient::new(options, 100);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(16);

    let hello = Hello {
        claim_code: claim_code(&mut rng),
        fw: args.firmware.clone(),
    };
    tokio::spawn(drive_connection(
        client.clone(),
        eventloop,
        device.id.clone(),
        hello,
        cmd_tx,
    ));

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reading = device.next_reading(&mut rng, Instant::now());
                let payload = match serde_json::to_vec(&reading) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to serialize telemetry: {}", e);
                        continue;
                    }
                };
                if let Err(e) = client
                    .publish(&telemetry_topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    warn!("{}: failed to publish telemetry: {}", device.id, e);
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                info!("{}: pump command water_ms={}", device.id, cmd.water_ms);
                device.apply_command(cmd, Instant::now());
            }
        }
    }
}

/// Polls the event loop. Every (re)connect re-announces the device: command
/// subscription, retained `online`, claim hello.
async fn drive_connection(
    client: AsyncClient,
    mut eventloop: EventLoop,
    device_id: String,
    hello: Hello,
    commands: mpsc::Sender<Command>,
) {
    let status_topic = format!("irrig/{}/status", device_id);
    let command_topic = format!("irrig/{}/cmd", device_id);
    let hello_topic = format!("claim/hello/{}", device_id);
    let hello_payload = match serde_json::to_vec(&hello) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize claim hello: {}", e);
            return;
        }
    };

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("{}: connected", device_id);
                let announced = client
                    .try_subscribe(&command_topic, QoS::AtLeastOnce)
                    .and_then(|_| {
                        client.try_publish(&status_topic, QoS::AtLeastOnce, true, "online")
                    })
                    .and_then(|_| {
                        client.try_publish(
                            &hello_topic,
                            QoS::AtLeastOnce,
                            false,
                            hello_payload.clone(),
                        )
                    });
                if let Err(e) = announced {
                    warn!("{}: failed to announce: {}", device_id, e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) if p.topic == command_topic => {
                match serde_json::from_slice::<Command>(&p.payload) {
                    Ok(cmd) => {
                        if commands.send(cmd).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("{}: ignoring malformed command: {}", device_id, e),
                }
            }
            Ok(event) => debug!("{}: {:?}", device_id, event),
            Err(e) => {
                error!("{}: MQTT eventloop error: {}", device_id, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
