use argh::FromArgs;
use eyre::Context;
use gr_orchestrator::{
    config::Config, mysql::MySqlConnector, scenario, ClusterOrchestrator, GroupMode, NodeHandle,
};
use std::{fs, path::PathBuf};

#[derive(FromArgs)]
/// Forms a MySQL group replication cluster and verifies that it converged
struct Args {
    #[argh(positional)]
    config_file: PathBuf,

    /// schema created by the write checks (prefix in multi-primary mode)
    #[argh(option, default = "String::from(\"Testcontainers\")")]
    schema: String,

    /// print the server options of every instance and exit
    #[argh(switch)]
    print_server_options: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    if let Err(err) = set_up_logger() {
        eprintln!(
            "{:?}",
            eyre::Error::new(err).wrap_err("failed to set up logger")
        );
    }

    let args: Args = argh::from_env();

    let config: Config = serde_yaml::from_str(
        &fs::read_to_string(&args.config_file).context("failed to read config file")?,
    )
    .context("failed to parse config file")?;
    let topology = config.topology().context("invalid cluster topology")?;

    if args.print_server_options {
        for (index, node) in config.nodes.iter().enumerate() {
            let options = topology.server_options(index, node.server_id)?;
            println!("{}: {}", node.address, options.join(" "));
        }
        return Ok(());
    }

    let mut nodes = Vec::with_capacity(config.nodes.len());
    for node in &config.nodes {
        let connector =
            MySqlConnector::new(node.address.as_str(), &node.url, config.pool_settings())?;
        let handle = NodeHandle::connect(node.server_id, connector, config.pool_settings())
            .await
            .with_context(|| format!("failed to connect to {}", node.address))?;
        nodes.push(handle);
    }

    let settings = config
        .orchestrator_settings()
        .context("invalid poll settings")?;
    let timeout = settings.propagation.timeout;
    let mut orchestrator = ClusterOrchestrator::new(topology, nodes, settings)?;
    orchestrator
        .form_group()
        .await
        .context("failed to form the group")?;

    match orchestrator.topology().mode() {
        GroupMode::SinglePrimary => {
            scenario::single_primary(&orchestrator, &args.schema, timeout).await
        }
        GroupMode::MultiPrimary => {
            scenario::multi_primary(&orchestrator, &args.schema, timeout).await
        }
    }
    .context("group verification failed")?;

    for node in orchestrator.nodes()? {
        node.close().await;
    }
    log::info!("Group {} verified.", orchestrator.topology().group_name());
    Ok(())
}

fn set_up_logger() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .level_for("mysql_async", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file("gr-verify.log")?)
        .apply()?;
    Ok(())
}
