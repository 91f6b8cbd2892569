use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use geofleet_config::ConfigHandle;
use geofleet_messaging::Transport;
use geofleet_messaging_nats::{NatsTransport, NatsTransportOptions};
use geofleet_node::{CollatorDeps, DnsDeps, FleetNode, MonitorDeps};
use geofleet_notifier::{MatrixConfig, MatrixTransport};
use geofleet_store::{NullGeoIp, ResultSurface, UsageLedger};
use geofleet_store_mysql::{ensure_schema, MysqlStore};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Monitor,
    Dns,
    Collator,
}

/// Geofleet node: cluster coordination for a distributed DNS/monitoring
/// fleet.
#[derive(Debug, Parser)]
#[command(name = "geofleet", version)]
struct Args {
    /// Path to the JSON config file.
    #[arg(long, env = "GEOFLEET_CONFIG")]
    config: PathBuf,

    /// Role this node runs as.
    #[arg(long, value_enum)]
    role: RoleArg,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ConfigHandle::load(&args.config)
        .await
        .context("loading config")?;
    let snapshot = config.get();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&snapshot.config().system.log_level)
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let transport: Arc<dyn Transport> = Arc::new(
        NatsTransport::connect(NatsTransportOptions {
            url: snapshot.config().nats.url.clone(),
            user: snapshot.config().nats.user.clone(),
            password: snapshot.config().nats.password.clone(),
        })
        .await
        .context("connecting to nats")?,
    );

    let node = match args.role {
        RoleArg::Monitor => {
            let store = Arc::new(
                MysqlStore::connect(&snapshot.config().mysql.dsn())
                    .await
                    .context("connecting to mysql")?,
            );
            ensure_schema(store.pool()).await.context("schema setup")?;
            // The probing side (out of process scope here) feeds this
            // surface; consensus votes read from it.
            let local = Arc::new(ResultSurface::new());
            FleetNode::start_monitor(MonitorDeps {
                config: config.clone(),
                transport,
                local,
                events: store,
            })
            .await?
        }
        RoleArg::Dns => {
            let node_id = snapshot.config().system.node_id.clone();
            let ledger = Arc::new(UsageLedger::new(node_id, Arc::new(NullGeoIp)));
            FleetNode::start_dns(DnsDeps {
                config: config.clone(),
                transport,
                usage: ledger,
            })
            .await?
        }
        RoleArg::Collator => {
            let store = Arc::new(
                MysqlStore::connect(&snapshot.config().mysql.dsn())
                    .await
                    .context("connecting to mysql")?,
            );
            ensure_schema(store.pool()).await.context("schema setup")?;

            let matrix = MatrixTransport::new(MatrixConfig {
                homeserver_url: snapshot.config().matrix.homeserver_url.clone(),
                username: snapshot.config().matrix.username.clone(),
                password: snapshot.config().matrix.password.clone(),
                room_id: snapshot.config().matrix.room_id.clone(),
            });
            let login_loop = Arc::clone(&matrix);

            FleetNode::start_collator(CollatorDeps {
                config: config.clone(),
                transport,
                usage_store: Arc::clone(&store) as _,
                events: store,
                notify: matrix,
                notify_task: Box::new(move |token: CancellationToken| login_loop.start(token)),
            })
            .await?
        }
    };

    info!("node running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    node.shutdown().await;
    Ok(())
}
