use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dispatch::{DispatchConfig, DispatchError, Dispatcher, Request, Response};

const RESPONSE_POLL: Duration = Duration::from_millis(100);
const VERIFY_PATIENCE: Duration = Duration::from_secs(5);

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "dispatch-bench.toml")]
    config: String,
    /// Number of requests to issue.
    #[clap(short = 'n', long = "requests", default_value = "1000000")]
    requests: u64,
    /// Read every key back after the run and check it against the applied deltas.
    #[clap(long)]
    verify: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    dispatch: DispatchConfig,
}

#[derive(Default)]
struct Tally {
    issued: u64,
    full: u64,
    busy: u64,
    acks: u64,
    cancels: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    info!(config = ?cfg.dispatch, "loaded config");

    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    {
        let closing = Arc::clone(&closing);
        thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                warn!(signal, "signal received, winding down");
                closing.store(true, Ordering::SeqCst);
            }
        });
    }

    let dispatcher = Dispatcher::init(&cfg.dispatch)?;
    run(&dispatcher, &opts, &closing)?;

    let report = dispatcher.shutdown_and_join()?;
    info!(
        processed = report.processed(),
        failed = report.failed(),
        dropped = report.dropped(),
        completed = report.completed,
        "dispatcher drained"
    );
    Ok(())
}

#[inline]
fn collect(dispatcher: &Dispatcher, tally: &mut Tally) -> Result<Option<Response>, DispatchError> {
    let response = dispatcher.get_response()?;
    match response {
        Some(r) if r.is_ack() => tally.acks += 1,
        Some(_) => tally.cancels += 1,
        None => {}
    }
    Ok(response)
}

fn run(dispatcher: &Dispatcher, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let num_keys = dispatcher.num_keys() as u64;
    let start = Instant::now();
    let mut tally = Tally::default();
    let mut adds_per_key = vec![0i64; num_keys as usize];

    while tally.issued < opts.requests && !closing.load(Ordering::Relaxed) {
        let key = (tally.issued % num_keys) as u16;
        // alternate around the seed value so it never leaves the u16 range
        let first: i16 = if key == 0 { 1 } else { -1 };
        let delta = if (tally.issued / num_keys) % 2 == 0 { first } else { -first };
        let request = Request::add(tally.issued as u16, key, delta);
        match dispatcher.put_request(&request) {
            Ok(true) => {
                adds_per_key[key as usize] += delta as i64;
                tally.issued += 1;
                if tally.issued % 100_000 == 0 {
                    eprint!("\rTotal {} requests issued", tally.issued);
                }
            }
            Ok(false) => {
                tally.full += 1;
                collect(dispatcher, &mut tally)?;
            }
            Err(DispatchError::KeyPending { .. }) => {
                tally.busy += 1;
                collect(dispatcher, &mut tally)?;
            }
            Err(e) => return Err(Box::new(e)),
        }
    }

    while tally.acks + tally.cancels < tally.issued && !closing.load(Ordering::Relaxed) {
        match dispatcher.get_response_timeout(Duration::from_millis(100))? {
            Some(r) if r.is_ack() => tally.acks += 1,
            Some(_) => tally.cancels += 1,
            None => {}
        }
    }

    let duration = start.elapsed();
    let iops = ((tally.issued as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K requests/s. Total time: {:#?} (lane full: {}, key busy: {}, cancelled: {})",
        (iops / 1000f64) as u64,
        duration,
        tally.full,
        tally.busy,
        tally.cancels
    );

    if opts.verify && !closing.load(Ordering::Relaxed) {
        verify(dispatcher, &adds_per_key, closing)?;
    }
    Ok(())
}

/// Waits for the next response, giving up after `patience` or once `closing`
/// is raised.
fn await_response(
    dispatcher: &Dispatcher,
    closing: &AtomicBool,
    patience: Duration,
) -> Result<Response, DispatchError> {
    let deadline = Instant::now() + patience;
    loop {
        if closing.load(Ordering::Relaxed) {
            return Err(DispatchError::Logic("interrupted while waiting for a response".to_string()));
        }
        if let Some(response) = dispatcher.get_response_timeout(RESPONSE_POLL)? {
            return Ok(response);
        }
        if Instant::now() >= deadline {
            return Err(DispatchError::Logic(format!("no response within {:?}", patience)));
        }
    }
}

fn verify(dispatcher: &Dispatcher, adds_per_key: &[i64], closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let mut mismatches = 0usize;
    for (key, delta) in adds_per_key.iter().enumerate() {
        let request = Request::get(key as u16, key as u16);
        while !dispatcher.put_request(&request)? {
            thread::yield_now();
        }
        let response = await_response(dispatcher, closing, VERIFY_PATIENCE)?;
        let expected = key as i64 + delta;
        if response.value as i64 != expected {
            eprintln!("[Verify] MISMATCH key {}: GOT {}, EXPECTED {}", key, response.value, expected);
            mismatches += 1;
        }
    }
    if mismatches > 0 {
        return Err(Box::new(DispatchError::Logic(format!("{} keys did not match", mismatches))));
    }
    println!("[Verify] All {} keys verified successfully!", adds_per_key.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_dispatcher() -> Dispatcher {
        let cfg = DispatchConfig::builder()
            .num_keys(2)
            .num_workers(1)
            .build()
            .unwrap();
        Dispatcher::init(&cfg).unwrap()
    }

    #[test]
    fn waiting_for_a_lost_response_gives_up() {
        let dispatcher = idle_dispatcher();
        let closing = AtomicBool::new(false);
        let started = Instant::now();
        let result = await_response(&dispatcher, &closing, Duration::from_millis(250));
        assert!(matches!(result, Err(DispatchError::Logic(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn waiting_stops_when_closing() {
        let dispatcher = idle_dispatcher();
        let closing = AtomicBool::new(true);
        let started = Instant::now();
        let result = await_response(&dispatcher, &closing, Duration::from_secs(60));
        assert!(matches!(result, Err(DispatchError::Logic(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn answered_request_is_returned() {
        let dispatcher = idle_dispatcher();
        let closing = AtomicBool::new(false);
        assert!(dispatcher.put_request(&Request::get(4, 1)).unwrap());
        let response = await_response(&dispatcher, &closing, Duration::from_secs(5)).unwrap();
        assert_eq!(response, Response::ack(4, 1));
    }
}
