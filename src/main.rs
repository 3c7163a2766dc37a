extern crate structopt;
extern crate tracing;

use async_std::sync::{Arc, Mutex};
use futures::FutureExt;
use futures::future::join;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;
use tokio::select;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::client::Client;
use crate::harness::Harness;
use crate::paxos::{CrashModel, Diagnostics, FailureOptions, Options, PersistenceOptions};

mod client;
mod harness;
mod paxos;
mod replica;

// We deliberately drop and delay some messages by default.
fn make_default_failure_options(failure_probability: f64) -> FailureOptions {
    FailureOptions::fail_with_probability(failure_probability).with_latency(0.05, 50)
}

#[derive(Debug, StructOpt, Clone)]
struct Arguments {
    #[structopt(short = "n", long = "replicas", default_value = "5")]
    replicas: usize,

    #[structopt(long = "window_size", default_value = "2")]
    window_size: usize,

    // Bound on un-acknowledged client requests per replica, zero for none.
    #[structopt(long = "max_pending_requests", default_value = "2048")]
    max_pending_requests: usize,

    // One of CrashStop, FullSS, ViewSS and EpochSS.
    #[structopt(long = "crash_model", default_value = "CrashStop")]
    crash_model: CrashModel,

    #[structopt(long = "persistence_dir", parse(from_os_str))]
    persistence_dir: Option<PathBuf>,

    #[structopt(short = "w", long = "wipe_persistence")]
    wipe_persistence: bool,

    #[structopt(long = "failure_probability", default_value = "0.01")]
    failure_probability: f64,

    #[structopt(short = "d", long = "disable_disrupt")]
    disable_disrupt: bool,

    #[structopt(short = "v", long = "disable_validate")]
    disable_validate: bool,

    #[structopt(short = "r", long = "disable_requests")]
    disable_requests: bool,
}

// Starts a loop which periodically cuts the current leader off the network for
// a while, forcing the others to move to a new view. Replicas which can be
// restarted are crashed and restarted instead.
async fn run_disrupt_loop(
    args: Arc<Arguments>,
    harness: Arc<Harness>,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if args.disable_disrupt {
        info!("running without the disrupt loop");
        return;
    }

    loop {
        let body = async {
            sleep(Duration::from_secs(8)).await;

            let Some(leader) = current_leader(&harness.diagnostics()).await else {
                warn!("no leader known yet");
                return;
            };
            if args.crash_model == CrashModel::CrashStop {
                info!(leader, "disconnecting leader");
                harness.update_failures(|f| f.disconnect(leader));
                sleep(Duration::from_secs(4)).await;
                harness.update_failures(|f| f.reconnect(leader));
                info!(leader, "reconnected leader");
            } else {
                harness.crash(leader).await;
                sleep(Duration::from_secs(4)).await;
                if let Err(message) = harness.restart(leader).await {
                    error!(leader, %message, "restart failed");
                }
            }
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished")
}

// Returns the leader of the highest view any replica has reported.
async fn current_leader(diagnostics: &Arc<Mutex<Diagnostics>>) -> Option<usize> {
    let replicas = diagnostics.lock().await.replicas();
    let mut best = None;
    for replica in replicas {
        let d = replica.lock().await;
        if let (Some(view), Some(leader)) = (d.latest_view(), d.latest_leader()) {
            if best.is_none_or(|(v, _)| view > v) {
                best = Some((view, leader));
            }
        }
    }
    best.map(|(_, leader)| leader)
}

// Starts a loop which periodically asks the diagnostics object to validate the
// execution history of the cluster. If this fails, this indicates a bug in the
// protocol implementation.
async fn run_validate_loop(
    args: Arc<Arguments>,
    harness: Arc<Harness>,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if args.disable_validate {
        info!("running without the validate loop");
        return;
    }

    loop {
        let body = async {
            harness.validate().await;
            sleep(Duration::from_secs(5)).await;
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished");
}

// Repeatedly writes a key through the HTTP front-ends and reads it back.
async fn run_request_loop(
    args: Arc<Arguments>,
    harness: Arc<Harness>,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if args.disable_requests {
        info!("running without the request loop");
        return;
    }

    let client = Client::new("main-requests", harness.addresses());
    let mut i = 0;
    loop {
        let body = async {
            let start = Instant::now();
            let command = format!("set key-{} value-{}", i % 10, i);
            match client.execute(command.as_bytes()).await {
                Ok(_) => {
                    if i % 10 == 1 {
                        info!(i, latency_ms=%start.elapsed().as_millis(), "success")
                    }
                }
                Err(message) => warn!(i, latency_ms=%start.elapsed().as_millis(), %message, "failure"),
            }

            let command = format!("get key-{}", i % 10);
            match client.execute(command.as_bytes()).await {
                Ok(value) if value != format!("value-{}", i).as_bytes() => {
                    error!(i, value = ?value, "read an unexpected value")
                }
                Ok(_) => {}
                Err(message) => warn!(i, %message, "failure"),
            }
            i += 1;
            sleep(Duration::from_millis(500)).await;
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // This allows configuring the filters using the RUST_LOG env variable.
    // Example:
    // > RUST_LOG=info,paxos_smr::paxos=debug cargo run
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or(EnvFilter::from("paxos_smr=info"));

    tracing_subscriber::FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
    let arguments = Arc::new(Arguments::from_args());

    let options = Options::default()
        .with_window_size(arguments.window_size)
        .with_max_pending_requests(Some(arguments.max_pending_requests).filter(|max| *max > 0))
        .with_persistence(arguments.crash_model, PersistenceOptions::InMemory);
    let mut builder = Harness::builder(arguments.replicas)
        .with_options(options)
        .with_failure(make_default_failure_options(arguments.failure_probability))
        .with_http();
    if let Some(dir) = &arguments.persistence_dir {
        builder = builder.with_persistence(dir.clone(), arguments.wipe_persistence);
    }
    let harness = Arc::new(builder.build().await?);
    info!("Started replicas at {:?}", harness.addresses());

    // Set up a shutdown broadcast by turning the channel receiver into a shared future.
    let (shutdown, rx) = async_std::channel::unbounded::<()>();
    let sx = async move {
        let _ = rx.recv().await;
    }
    .shared();

    let args = arguments.clone();
    let loops = join(
        run_request_loop(args.clone(), harness.clone(), sx.clone())
            .instrument(info_span!("requests")),
        join(
            run_disrupt_loop(args.clone(), harness.clone(), sx.clone())
                .instrument(info_span!("disrupt")),
            run_validate_loop(args.clone(), harness.clone(), sx.clone())
                .instrument(info_span!("validate")),
        ),
    )
    .shared();

    // A replica failing on its own is a bug, and ends the whole process.
    let watched = harness.clone();
    let watchdog = async move {
        if let Some((replica, error)) = watched.next_fatal().await {
            error!(replica, %error, "replica failed, exiting");
            std::process::exit(1);
        }
    };

    // Set up a signal handler that stops the loops and then the harness.
    let signal_harness = harness.clone();
    let signal_loops = loops.clone();
    let signal_handler = async move {
        if let Err(message) = tokio::signal::ctrl_c().await {
            error!(%message, "unable to listen for SIGINT");
        }
        info!("Got SIGINT, shutting down");

        // First tell all the loops to shut down and wait for them.
        shutdown.close();
        signal_loops.await;

        // Now stop the replicas.
        signal_harness.stop().await;
    };

    select! {
        _ = watchdog => {}
        _ = join(signal_handler, loops) => {}
    }
    info!("All done, exiting");
    Ok(())
}
