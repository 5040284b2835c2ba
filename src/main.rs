use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use e3dc_poller::config::parse_bool_safe;
use e3dc_poller::legacy::{read_legacy_counter, LegacyBat};
use e3dc_poller::value_store::{ChannelSink, ValueSink};
use e3dc_poller::{
    Connector, DeviceConfig, DeviceSession, FaultStore, JsonFileStore, PollerConfig,
    TcpConnector, ValueStore,
};
use tokio::sync::mpsc;

const USAGE: &str = "usage: e3dc_poller [bat|counter <address1> <address2> <read_ext> <pvinv> <num>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        run_daemon().await
    } else {
        run_legacy(&args).await
    }
}

async fn run_daemon() -> anyhow::Result<()> {
    let config = PollerConfig::from_env()?;
    println!(
        "Starting E3DC poller for {}:{}",
        config.device.address, config.device.port
    );

    let store = Arc::new(JsonFileStore::new(&config.state_dir));
    let values = ValueStore::new();
    let faults = FaultStore::new();

    // Published states flow through a channel into the last-value cache
    let (tx, mut rx) = mpsc::channel(64);
    let sink = Arc::new(ChannelSink::new(tx));
    let cache = values.clone();
    tokio::spawn(async move {
        while let Some((id, state)) = rx.recv().await {
            tracing::info!("{} {id}: {state:?}", state.kind());
            cache.set(id, state);
        }
    });

    let connector = TcpConnector::new(config.device.socket_addr()?, config.device.timeout());
    let mut session = DeviceSession::new(
        config.device.clone(),
        Box::new(connector),
        Arc::new(faults.clone()),
    );
    for component in &config.components {
        session.add_component(component, store.clone(), sink.clone())?;
    }

    let mut interval = config.poll_timer();
    loop {
        interval.tick().await; // Wait for next cycle
        let report = session.poll_cycle().await;
        tracing::debug!(
            "Cycle done: {report:?}, {} cached states",
            values.snapshot().len()
        );
    }
}

/// `bat|counter <address1> <address2> <read_ext> <pvinv> <num>`
async fn run_legacy(args: &[String]) -> anyhow::Result<()> {
    let [mode, address1, address2, read_ext, pvinv, num] = args else {
        bail!(USAGE);
    };
    let num: u32 = num.parse().context("num must be an integer")?;
    let addresses: Vec<&String> = [address1, address2]
        .into_iter()
        .filter(|a| a.as_str() != "none")
        .collect();
    tracing::debug!("e3dc addresses {addresses:?} read_ext {read_ext} pvinv {pvinv} id {num}");

    let state_dir = env::var("E3DC_STATE_DIR").unwrap_or_else(|_| "state".to_string());
    let store = Arc::new(JsonFileStore::new(state_dir));
    let values = ValueStore::new();

    let mut devices = Vec::new();
    for address in &addresses {
        let mut device = DeviceConfig::new(num, address.as_str());
        device.read_ext = parse_bool_safe(Some(read_ext.clone()));
        device.validate()?;
        devices.push(device);
    }
    let Some(first) = devices.first().cloned() else {
        bail!("at least one address is required");
    };

    match mode.as_str() {
        "bat" => {
            let units = devices
                .iter()
                .map(|d| -> anyhow::Result<Box<dyn Connector>> {
                    Ok(Box::new(TcpConnector::new(d.socket_addr()?, d.timeout())))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let pv_other_power = read_pv_other_power(pvinv)?;
            let mut bat = LegacyBat::new(&first, store, Arc::new(values.clone()));
            let reading = bat.update(&units, pv_other_power).await?;
            tracing::info!("Legacy battery reading {reading:?}");
        }
        "counter" => {
            let connector = TcpConnector::new(first.socket_addr()?, first.timeout());
            let faults = FaultStore::new();
            read_legacy_counter(
                first,
                Box::new(connector),
                store,
                Arc::new(values.clone()),
                Arc::new(faults.clone()),
            )
            .await?;
            if let Some((origin, fault)) = faults.active().into_iter().next() {
                bail!("{origin}: {}", fault.message);
            }
        }
        other => bail!("unknown mode `{other}`\n{USAGE}"),
    }

    for (kind, id, state) in values.snapshot() {
        println!("{kind} {id}: {}", serde_json::to_string(&state)?);
    }
    Ok(())
}

/// When another inverter is configured its current power is taken from the
/// file named by `E3DC_PV_OTHER_FILE`
fn read_pv_other_power(pvinv: &str) -> anyhow::Result<Option<f64>> {
    if pvinv == "none" {
        return Ok(None);
    }
    let path = env::var("E3DC_PV_OTHER_FILE").unwrap_or_else(|_| "ramdisk/pvwatt".to_string());
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let power = raw
        .trim()
        .parse()
        .with_context(|| format!("{path} does not hold a number"))?;
    Ok(Some(power))
}
