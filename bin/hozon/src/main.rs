mod config;

use std::{path::PathBuf, str::FromStr};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use fake_user_agent::get_chrome_rua;
use hozon::{
    transport::HttpTransport, Asset, Dispatch, DownloadState, Downloader, Event,
};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder,
};
use tokio::sync::broadcast::error::RecvError;
use url::Url;

use crate::config::{Config, HttpConfig};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct HozonArgs {
    /// TOML configuration file
    #[clap(long, env = "HOZON_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding every downloaded asset. Overrides the config file.
    #[clap(long, env = "HOZON_BASE_DIR", global = true)]
    base_dir: Option<PathBuf>,

    /// Debug output
    #[clap(long, alias = "debug", global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: HozonCommand,
}

#[derive(Subcommand, Debug)]
enum HozonCommand {
    /// Download an asset for offline playback
    Download {
        /// Master manifest url
        url: Url,

        /// Asset name, used as the index key
        #[clap(short, long)]
        name: String,

        /// Directory name of the asset below the base directory
        #[clap(short, long)]
        program_id: String,

        #[clap(long, default_value = "")]
        content_id: String,

        /// Segments are encrypted
        #[clap(long)]
        protected: bool,
    },
    /// Print the download state of an asset
    Status { name: String },
    /// List downloaded assets
    List,
    /// Remove a downloaded asset
    Delete { name: String },
}

fn client(config: &HttpConfig) -> anyhow::Result<Client> {
    let mut headers = HeaderMap::new();
    for header in &config.headers {
        let (key, value) = header
            .split_once(':')
            .with_context(|| format!("Invalid header: {header}"))?;
        headers.insert(
            HeaderName::from_str(key.trim())?,
            HeaderValue::from_str(value.trim())?,
        );
    }

    let user_agent = match &config.user_agent {
        Some(user_agent) => user_agent.clone(),
        None => get_chrome_rua().to_string(),
    };
    let client = ClientBuilder::new()
        .default_headers(headers)
        .user_agent(user_agent)
        .timeout(config.timeout())
        .build()?;
    Ok(client)
}

async fn download(downloader: &Downloader, asset: Asset) -> anyhow::Result<()> {
    let name = asset.name.clone();
    let mut events = downloader.subscribe();

    match downloader.download(asset).await? {
        Dispatch::Started => {}
        Dispatch::AlreadyDownloaded => {
            log::info!("{name} is already downloaded.");
            return Ok(());
        }
        Dispatch::AlreadyActive => bail!("{name} is already downloading."),
    }

    // ctrl-c handler
    let canceller = downloader.clone();
    let cancel_name = name.clone();
    let ctrlc_handler = tokio::spawn(async move {
        // wait for the first ctrl-c to cancel the download
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        log::info!("Ctrl-C received, cancelling {cancel_name}.");
        if let Err(e) = canceller.cancel(&cancel_name).await {
            log::error!("Failed to cancel {cancel_name}: {e}");
        }

        // wait for the second ctrl-c to force exit
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received again, force exit.");
            std::process::exit(1);
        }
    });

    let mut reported = 0;
    let state = loop {
        match events.recv().await {
            Ok(Event::ProgressChanged {
                asset_name,
                percent,
            }) if asset_name == name => {
                let percent = (percent * 100.0).clamp(0.0, 100.0) as u32;
                if percent >= reported + 10 {
                    reported = percent - percent % 10;
                    log::info!("{name}: {percent}%");
                }
            }
            Ok(Event::StateChanged { asset_name, state })
                if asset_name == name && state != DownloadState::Downloading =>
            {
                break state;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                log::debug!("Skipped {skipped} event(s).");
            }
            Err(RecvError::Closed) => bail!("Downloader stopped unexpectedly."),
        }
    };
    ctrlc_handler.abort();

    match state {
        DownloadState::Downloaded => {
            log::info!("{name} downloaded.");
            Ok(())
        }
        _ => bail!("{name} was not downloaded."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = HozonArgs::parse();

    let default_level = if args.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .try_from_env()
                .unwrap_or_else(|_| default_level.to_string().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(base_dir) = args.base_dir {
        config.downloader.base_dir = base_dir;
    }

    let transport = HttpTransport::new(client(&config.http)?, config.downloader.temp_dir());
    let downloader = Downloader::builder(config.downloader)
        .transport(transport)
        .start()?;

    match args.command {
        HozonCommand::Download {
            url,
            name,
            program_id,
            content_id,
            protected,
        } => {
            let asset = Asset::new(name, content_id, program_id, url).protected(protected);
            download(&downloader, asset).await?;
        }
        HozonCommand::Status { name } => {
            println!("{}", downloader.state(&name).await?);
        }
        HozonCommand::List => {
            for name in downloader.downloaded()? {
                println!("{name}");
            }
        }
        HozonCommand::Delete { name } => {
            downloader.delete(&name).await?;
            log::info!("{name} deleted.");
        }
    }

    downloader.shutdown().await?;
    Ok(())
}
