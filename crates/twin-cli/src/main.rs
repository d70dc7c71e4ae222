//! Command-line interface for the device configuration twin.

mod auth;
mod liveness;
mod mqtt;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use twin_commands::{
    ConfigService, MessageProcessor, ReconciliationEngine, RetryPolicy, SetDesiredOutcome,
    SetDesiredRequest, SweepConfig, SweepScheduler, TransmitQueue, TransmitWorker,
    WindowScheduler,
};
use twin_core::config::env_vars;
use twin_core::{codec, DownlinkTransport, FieldSchema, ServiceConfig, Severity, TelemetrySink, TracingTelemetry};
use twin_storage::RedbConfigStore;

use crate::auth::StaticTokenAuthorizer;
use crate::liveness::HttpLivenessClient;
use crate::mqtt::MqttBridge;

/// Device configuration twin.
#[derive(Parser, Debug)]
#[command(name = "devicetwin")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to devicetwin.toml if present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine, the fleet sweep and the MQTT bridge.
    Serve,
    /// Encode a value and print the hex payload.
    Encode {
        /// Field schema as JSON, e.g. {"i":3,"n":"roffset","t":"i"}.
        #[arg(long)]
        schema: String,
        /// Display value.
        #[arg(long)]
        value: String,
    },
    /// Decode a hex payload and print the display value.
    Decode {
        /// Field schema as JSON.
        #[arg(long)]
        schema: String,
        /// Hex payload.
        #[arg(long)]
        hex: String,
    },
    /// Print the wait before the next send window.
    Window {
        /// Reserved minutes advertised by the device.
        #[arg(long, default_value = "6,8")]
        reserved: String,
    },
    /// Run one fleet sweep and exit.
    Sweep,
    /// Change a desired value.
    SetDesired {
        #[arg(long)]
        token: String,
        #[arg(long)]
        device: String,
        #[arg(long, default_value_t = 0)]
        slot: u32,
        #[arg(long)]
        field: String,
        #[arg(long)]
        value: String,
    },
    /// Move every device's main config to the latest firmware schema.
    UpdateFirmware {
        #[arg(long)]
        token: String,
    },
    /// Show a device config document.
    Show {
        #[arg(long)]
        token: String,
        #[arg(long)]
        device: String,
        #[arg(long, default_value_t = 0)]
        slot: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let load = || ServiceConfig::load(args.config.as_deref());

    match args.command {
        Command::Serve => serve(load()?).await,
        Command::Encode { schema, value } => encode(&schema, &value),
        Command::Decode { schema, hex } => decode(&schema, &hex),
        Command::Window { reserved } => {
            let wait = WindowScheduler::default().time_until_send_window(&reserved);
            println!("{}s", wait.as_secs());
            Ok(())
        }
        Command::Sweep => sweep(load()?).await,
        Command::SetDesired {
            token,
            device,
            slot,
            field,
            value,
        } => {
            let request = SetDesiredRequest::new(device, slot, field, value);
            set_desired(load()?, &token, request).await
        }
        Command::UpdateFirmware { token } => update_firmware(load()?, &token).await,
        Command::Show {
            token,
            device,
            slot,
        } => show(load()?, &token, &device, slot).await,
    }
}

fn init_logging() {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("devicetwin=info,twin_commands=info,twin_storage=info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

fn parse_schema(schema: &str) -> Result<FieldSchema> {
    serde_json::from_str(schema).context("invalid field schema")
}

fn encode(schema: &str, value: &str) -> Result<()> {
    let schema = parse_schema(schema)?;
    let payload = codec::encode(&schema, value)?;
    println!("{}", hex::encode(payload));
    Ok(())
}

fn decode(schema: &str, payload: &str) -> Result<()> {
    let schema = parse_schema(schema)?;
    let bytes = hex::decode(payload.trim()).context("invalid hex payload")?;
    println!("{}", codec::decode(&schema, &bytes)?);
    Ok(())
}

/// Collaborators shared by every store-backed command.
struct Runtime {
    config: ServiceConfig,
    telemetry: Arc<dyn TelemetrySink>,
    store: Arc<RedbConfigStore>,
    liveness: Arc<HttpLivenessClient>,
    policy: RetryPolicy,
}

impl Runtime {
    fn open(config: ServiceConfig) -> Result<Self> {
        let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingTelemetry);

        let (policy, problems) =
            RetryPolicy::from_schedule(config.control_field.clone(), &config.repeat_check_schedule);
        for problem in &problems {
            telemetry.log_error("load_config", problem, Severity::Severe);
        }

        let store = RedbConfigStore::open(&config.store_path)
            .with_context(|| format!("failed to open store {}", config.store_path.display()))?;
        let liveness = HttpLivenessClient::new(&config.liveness, config.rpc_timeout())?;

        Ok(Self {
            config,
            telemetry,
            store: Arc::new(store),
            liveness: Arc::new(liveness),
            policy,
        })
    }

    fn engine(&self, transport: Arc<dyn DownlinkTransport>) -> ReconciliationEngine {
        ReconciliationEngine::builder(self.store.clone(), transport, self.liveness.clone())
            .telemetry(self.telemetry.clone())
            .retry_policy(self.policy.clone())
            .rpc_timeout(self.config.rpc_timeout())
            .build()
    }

    fn service(&self, engine: ReconciliationEngine) -> Result<ConfigService> {
        let authorizer = StaticTokenAuthorizer::parse(&self.config.auth.tokens)?;
        if authorizer.is_empty() {
            warn!("No auth tokens configured, every request will be rejected");
        }
        Ok(ConfigService::new(
            engine,
            self.store.clone(),
            Arc::new(authorizer),
            self.config.roles.clone(),
        )
        .with_rpc_timeout(self.config.rpc_timeout()))
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    let runtime = Runtime::open(config)?;
    let config = &runtime.config;

    let (bridge, eventloop) = MqttBridge::new(&config.mqtt);
    let (queue, receiver) = TransmitQueue::new(config.transmit_queue_capacity);
    let worker = TransmitWorker::spawn(receiver, Arc::new(bridge.clone()));

    let engine = runtime.engine(Arc::new(queue));
    let processor = Arc::new(
        MessageProcessor::new(engine.clone(), runtime.store.clone(), runtime.telemetry.clone())
            .with_rpc_timeout(config.rpc_timeout()),
    );

    let cancel = CancellationToken::new();
    let event_loop = bridge.spawn_event_loop(eventloop, Some(processor), cancel.clone());

    let sweep = Arc::new(SweepScheduler::new(
        engine.clone(),
        runtime.store.clone(),
        runtime.liveness.clone(),
        runtime.telemetry.clone(),
        SweepConfig::from(config),
    ));
    sweep.start().await;

    info!(
        broker = %config.mqtt.broker_host,
        store = %config.store_path.display(),
        "Device twin running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    info!("Shutting down, draining outstanding checks (Ctrl-C again to cancel them)");
    sweep.stop().await;
    {
        let drain = engine.shutdown(true);
        tokio::pin!(drain);
        tokio::select! {
            _ = &mut drain => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Cancelling outstanding checks");
                engine.shutdown(false).await;
            }
        }
    }

    worker.stop().await;
    bridge.disconnect().await;
    if tokio::time::timeout(config.rpc_timeout(), event_loop).await.is_err() {
        cancel.cancel();
    }
    info!("Device twin stopped");
    Ok(())
}

/// Run `work` with an engine that publishes directly over a fresh MQTT
/// connection, then flush the connection.
async fn with_direct_engine<T, F, Fut>(runtime: &Runtime, work: F) -> Result<T>
where
    F: FnOnce(ReconciliationEngine) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let (bridge, eventloop) = MqttBridge::new(&runtime.config.mqtt);
    let cancel = CancellationToken::new();
    let event_loop = bridge.spawn_event_loop(eventloop, None, cancel.clone());

    let engine = runtime.engine(Arc::new(bridge.clone()));
    let result = work(engine).await;

    bridge.disconnect().await;
    if tokio::time::timeout(runtime.config.rpc_timeout(), event_loop)
        .await
        .is_err()
    {
        warn!("MQTT connection did not close in time");
        cancel.cancel();
    }
    result
}

async fn sweep(config: ServiceConfig) -> Result<()> {
    let runtime = &Runtime::open(config)?;
    with_direct_engine(runtime, |engine| async move {
        let scheduler = SweepScheduler::new(
            engine.clone(),
            runtime.store.clone(),
            runtime.liveness.clone(),
            runtime.telemetry.clone(),
            SweepConfig::from(&runtime.config),
        );
        let report = scheduler.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);

        // First sends wait for each device's window
        engine.shutdown(true).await;
        Ok(())
    })
    .await
}

async fn set_desired(config: ServiceConfig, token: &str, request: SetDesiredRequest) -> Result<()> {
    let runtime = &Runtime::open(config)?;
    with_direct_engine(runtime, |engine| async move {
        let service = runtime.service(engine.clone())?;
        let outcome = service.set_desired(token, request).await?;
        match outcome {
            SetDesiredOutcome::Transmitted => println!("sent"),
            SetDesiredOutcome::Deferred => println!("stored, device not registered"),
        }

        // The serving process's sweep picks up anything still inconsistent
        engine.shutdown(false).await;
        Ok(())
    })
    .await
}

async fn update_firmware(config: ServiceConfig, token: &str) -> Result<()> {
    let runtime = Runtime::open(config)?;
    let (bridge, _eventloop) = MqttBridge::new(&runtime.config.mqtt);
    let service = runtime.service(runtime.engine(Arc::new(bridge)))?;

    let updated = service.update_firmware_all_devices(token).await?;
    println!("updated {} devices", updated);
    Ok(())
}

async fn show(config: ServiceConfig, token: &str, device_id: &str, slot: u32) -> Result<()> {
    let runtime = Runtime::open(config)?;
    let (bridge, _eventloop) = MqttBridge::new(&runtime.config.mqtt);
    let service = runtime.service(runtime.engine(Arc::new(bridge)))?;

    let fields = service.get_device_config(token, device_id, slot).await?;
    println!("{:>5}  {:<16} {:<16} {:<16}", "index", "name", "desired", "reported");
    for field in fields {
        let marker = if field.is_inconsistent() { " *" } else { "" };
        println!(
            "{:>5}  {:<16} {:<16} {:<16}{}",
            field.index,
            field.name,
            field.desired.unwrap_or_default(),
            field.reported.unwrap_or_default(),
            marker
        );
    }
    Ok(())
}
