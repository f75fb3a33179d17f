//! `botster-hv` — one binary, one subcommand per service process,
//! mirroring how the original `caen_tools` system spawns one OS process
//! per service from a single codebase.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use botster_hv::broker::{Broker, BrokerConfig};
use botster_hv::config::{self, Config};
use botster_hv::interlock;
use botster_hv::services::device_backend::{DeviceBackend, UnimplementedDriver};
use botster_hv::services::monitor::{Monitor, MonitorConfig, SqliteArchive};
use botster_hv::supervisor::{
    shared, HealthControl, InterlockControl, LoaderControl, ManagerScript, MchsEmitter, Memo, RampGuard, ReducerControl,
    RelaxControl, ScriptHandle, SupervisorApi,
};
use botster_hv::transport::{serve, RouterServer};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// Supervisor control plane for a high-voltage power-supply setup.
#[derive(Debug, Parser)]
#[command(name = "botster-hv", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the `device_backend` worker.
    DeviceBackend {
        /// Path to the INI config file.
        #[arg(long, default_value = "config.ini")]
        config: PathBuf,
    },
    /// Runs the `monitor` worker.
    Monitor {
        /// Path to the INI config file.
        #[arg(long, default_value = "config.ini")]
        config: PathBuf,
    },
    /// Runs the supervisor's script engine and `system_check` API worker.
    Supervisor {
        /// Path to the INI config file.
        #[arg(long, default_value = "config.ini")]
        config: PathBuf,
        /// Path to the `max_current`/`ramp_down_trip_time` JSON document.
        #[arg(long, default_value = "health.json")]
        health_config: PathBuf,
    },
    /// Runs the frontend/backend request broker.
    Broker {
        /// Address clients connect to.
        #[arg(long, default_value = "127.0.0.1:5555")]
        frontend_addr: String,
        /// Address workers register on.
        #[arg(long, default_value = "127.0.0.1:5556")]
        backend_addr: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::DeviceBackend { config } => run_device_backend(&config).await,
        Command::Monitor { config } => run_monitor(&config).await,
        Command::Supervisor { config, health_config } => run_supervisor(&config, &health_config).await,
        Command::Broker { frontend_addr, backend_addr } => run_broker(frontend_addr, backend_addr).await,
    }
}

async fn run_device_backend(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)?;
    tracing::info!(addr = %config.device.addr, "starting device_backend");

    let backend = DeviceBackend::new(Box::new(UnimplementedDriver));
    let server = RouterServer::bind(&config.device.addr).await.context("binding device_backend")?;
    serve(server, backend).await;
    Ok(())
}

async fn run_monitor(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)?;
    tracing::info!(addr = %config.monitor.addr, db = %config.monitor.db_path, "starting monitor");

    let archive = SqliteArchive::open(std::path::Path::new(&config.monitor.db_path))?;
    let monitor_config = MonitorConfig {
        param_file: PathBuf::from(&config.monitor.param_file),
        status_file: PathBuf::from(&config.monitor.status_file),
        rotate_every: config.monitor.rotate_every,
    };
    let monitor = Monitor::new(Box::new(archive), monitor_config);
    let server = RouterServer::bind(&config.monitor.addr).await.context("binding monitor")?;
    serve(server, monitor).await;
    Ok(())
}

async fn run_broker(frontend_addr: String, backend_addr: String) -> Result<()> {
    tracing::info!(%frontend_addr, %backend_addr, "starting broker");
    let broker = Broker::new(BrokerConfig {
        frontend_addr,
        backend_addr,
        ..BrokerConfig::default()
    });
    broker.run().await
}

async fn run_supervisor(config_path: &PathBuf, health_config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)?;
    let health_config = config::load_health_config(health_config_path)?;
    tracing::info!(system_check_addr = %config.check.system_check_addr, "starting supervisor");

    let mut endpoints = HashMap::new();
    endpoints.insert("device_backend".to_string(), config.check.device_backend_addr.clone());
    endpoints.insert("monitor".to_string(), config.check.monitor_addr.clone());
    // Supervisor scripts poll status on every tick; a fast timeout keeps a
    // stalled peer from stalling the whole manager loop (spec §5, §7).
    let client = botster_hv::transport::AsyncClient::new(endpoints).with_recv_timeout(std::time::Duration::from_secs(1));

    let mchs = Arc::new(
        MchsEmitter::bind(config.mchs.client_id.clone(), &config.mchs.udp_ip, config.mchs.udp_port)
            .await
            .context("binding mchs udp socket")?,
    );

    let mut memo = Memo::new(botster_hv::supervisor::MchsMemo {
        udp_ip: config.mchs.udp_ip.clone(),
        udp_port: config.mchs.udp_port,
        client_id: config.mchs.client_id.clone(),
    });

    memo.set_script("check/loader", script_slice(&config.loader));
    memo.set_script("check/health", script_slice(&config.health));
    memo.set_script("check/interlock", script_slice(&config.interlock));
    memo.set_script("check/autopilot/relax", relax_slice(&config.relax));
    memo.set_script("check/autopilot/reducer", reducer_slice(&config.reducer));
    memo.set_script("check/autopilot/ramp_guard", script_slice(&config.ramp_guard));
    let memo = shared(memo);

    let loader = Arc::new(ScriptHandle::new(Arc::new(LoaderControl::new(memo.clone(), client.clone()))));

    let relax_source = interlock::from_url(&config.check.interlock_url).context("building relax interlock source")?;
    let relax = Arc::new(ScriptHandle::new(Arc::new(RelaxControl::new(memo.clone(), client.clone(), relax_source))));

    let reducer_source = interlock::from_url(&config.check.interlock_url).context("building reducer interlock source")?;
    let reduced_voltage = config.reducer.target_voltage.unwrap_or(0.0) * config.reducer.voltage_modifier.unwrap_or(1.0);
    let reducer = Arc::new(ScriptHandle::new(Arc::new(ReducerControl::new(
        memo.clone(),
        client.clone(),
        reducer_source,
        mchs.clone(),
        reduced_voltage,
    ))));

    let ramp_guard = Arc::new(ScriptHandle::new(Arc::new(RampGuard::new(memo.clone(), client.clone(), mchs.clone()))));

    let interlock_source = interlock::from_url(&config.check.interlock_url).context("building interlock control source")?;
    let interlock_control = Arc::new(ScriptHandle::new(Arc::new(InterlockControl::new(
        memo.clone(),
        interlock_source,
        mchs.clone(),
    ))));

    let health = Arc::new(ScriptHandle::new(Arc::new(HealthControl::new(
        memo.clone(),
        client.clone(),
        mchs.clone(),
        health_config,
        vec![relax.clone(), reducer.clone()],
    ))));

    let scripts = vec![loader, health, interlock_control, relax, reducer, ramp_guard];
    let manager = ManagerScript::new(
        scripts,
        std::time::Duration::from_secs_f64(config.check.manager_tick_every),
        Some(mchs.clone()),
    );

    let api = SupervisorApi::new(memo.clone());
    let api_server = RouterServer::bind(&config.check.system_check_addr).await.context("binding system_check api")?;

    let cancel = CancellationToken::new();
    let manager_cancel = cancel.clone();
    let manager_task = tokio::spawn(async move { manager.run(manager_cancel).await });
    let api_task = tokio::spawn(async move { serve(api_server, api).await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down supervisor");
    cancel.cancel();
    api_task.abort();
    manager_task.await.context("joining manager task")?;
    Ok(())
}

fn script_slice(section: &config::ScriptSection) -> botster_hv::supervisor::ScriptMemo {
    botster_hv::supervisor::ScriptMemo {
        enable: section.enable,
        ..botster_hv::supervisor::ScriptMemo::new(section.repeat_every)
    }
}

fn relax_slice(section: &config::ScriptSection) -> botster_hv::supervisor::ScriptMemo {
    botster_hv::supervisor::ScriptMemo {
        enable: section.enable,
        target_voltage: section.target_voltage,
        voltage_modifier: section.voltage_modifier,
        ..botster_hv::supervisor::ScriptMemo::new(section.repeat_every)
    }
}

fn reducer_slice(section: &config::ScriptSection) -> botster_hv::supervisor::ScriptMemo {
    botster_hv::supervisor::ScriptMemo {
        enable: section.enable,
        target_voltage: section.target_voltage,
        voltage_modifier: section.voltage_modifier,
        reducing_period: section.reducing_period,
        ..botster_hv::supervisor::ScriptMemo::new(section.repeat_every)
    }
}
