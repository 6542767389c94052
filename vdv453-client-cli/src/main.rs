/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use chrono::{DateTime, TimeDelta, Utc};
use clap::Parser;
use clap_num::number_range;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use vdv453_client::{
    ConfigurationError, HttpTransport, InMemoryStorage, LoggingHooks, Service, SubscriptionId,
    Vdv453Client, Vdv453Configuration,
};

mod output;

fn between_1_and_1024(s: &str) -> Result<usize, String> {
    number_range(s, 1, 1024)
}

// All our args
#[derive(Parser, Debug)]
#[command(version, about = "Subscribe to VDV 453/454 data and print it as JSON lines.", long_about = None)]
pub(crate) struct Args {
    /// Our own Leitstelle id, as known to the remote party
    #[arg(short, long, env = "VDV453_LEITSTELLE")]
    leitstelle: String,

    /// Base URL of the remote party's VDV 453 endpoint
    #[arg(short, long, env = "VDV453_ENDPOINT")]
    endpoint: String,

    /// Port to listen on for requests of the remote party
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Service to subscribe to, e.g. aus, ausref or dfi
    #[arg(short, long, default_value = "aus")]
    service: String,

    /// Lifetime of the subscription in minutes
    #[arg(long, default_value_t = 60)]
    expires_in: u32,

    /// Additionally poll for data every this many seconds
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Anzeigerbereich to subscribe to, required for dfi
    #[arg(long)]
    azb_id: Option<String>,

    /// Buffer size of subscription command channel - minimum 1, maximum 1024, defaults to 1024
    #[arg(long, value_parser=between_1_and_1024)]
    subscription_buffer: Option<usize>,

    /// Buffer size of data channel - minimum 1, maximum 1024, defaults to 1024
    #[arg(long, value_parser=between_1_and_1024)]
    data_buffer: Option<usize>,

    /// Timeout of requests to the remote party in seconds
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Increase verbosity of output
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Setup logging, get configuration
    std::env::set_var("RUST_LOG", "info,hyper=warn,reqwest=warn");
    if args.verbose {
        std::env::set_var("RUST_LOG", "trace,hyper=info");
    }
    vdv453_client::init_once();

    if let Err(e) = run(args).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let service: Service = args.service.parse()?;
    let config = config_from_args(&args)?;
    let transport = Arc::new(HttpTransport::new(config.clone())?);

    // Set up and run the client
    let (client, mut stopper, mut data) = Vdv453Client::run(
        config,
        transport,
        Arc::new(InMemoryStorage::new()),
        Arc::new(LoggingHooks),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!("Listening for the remote party on {}", listener.local_addr()?);
    let router = client.router();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Server error: {e}");
        }
    });

    tokio::spawn(async move {
        while let Some(event) = data.recv().await {
            match output::json_line(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Error serializing {} data: {e}", event.service),
            }
        }
    });

    // InMemoryStorage starts empty, so this only restores anything once a persistent Storage is plugged in
    let restored = client.restore_on_startup().await?;
    debug!("Restored {restored} subscriptions");

    match client.status(service).await {
        Ok(status) => info!(
            "Remote {service} service running since {:?}, data ready: {}",
            status.epoch.start_dienst_zst, status.daten_bereit
        ),
        Err(e) => warn!("Error getting {service} status: {e}"),
    }

    let expires_at = Utc::now() + TimeDelta::minutes(args.expires_in.into());
    let id = subscribe(
        &client,
        service,
        expires_at,
        args.poll_interval.map(Duration::from_secs),
        args.azb_id.as_deref(),
    )
    .await?;
    info!("Subscribed to {service} with AboID {id}, expiring at {expires_at}");

    signal::ctrl_c().await?;
    info!("Stopping VDV 453 client");
    if let Err(e) = client.unsubscribe(service, &[id], true).await {
        warn!("Error unsubscribing from {service}: {e}");
    }
    stopper.stop().await;
    Ok(())
}

async fn subscribe(
    client: &Vdv453Client,
    service: Service,
    expires_at: DateTime<Utc>,
    poll_interval: Option<Duration>,
    azb_id: Option<&str>,
) -> Result<SubscriptionId, Box<dyn std::error::Error>> {
    let id = match service {
        Service::Aus => {
            client
                .aus_subscribe(expires_at, poll_interval, None, None)
                .await?
        }
        Service::RefAus => {
            client
                .ref_aus_subscribe(expires_at, poll_interval, Utc::now(), expires_at)
                .await?
        }
        Service::Dfi => {
            let azb_id =
                azb_id.ok_or_else(|| ConfigurationError::new("--azb-id is required for dfi"))?;
            client
                .dfi_subscribe(azb_id, expires_at, poll_interval, None)
                .await?
        }
        _ => {
            client
                .subscribe(service, Vec::new(), expires_at, poll_interval)
                .await?
        }
    };
    Ok(id)
}

fn config_from_args(args: &Args) -> Result<Arc<Vdv453Configuration>, ConfigurationError> {
    let config = Vdv453Configuration::create(
        args.leitstelle.trim().to_string(),
        args.endpoint.trim().to_string(),
        args.subscription_buffer,
        args.data_buffer,
    )?;
    Ok(match args.request_timeout {
        Some(seconds) => config.with_request_timeout(Duration::from_secs(seconds)),
        None => config,
    })
}
