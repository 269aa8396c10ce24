// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::OnceLock;
use std::time::Duration;

use rgo_context::stack::MIN_STACK_SIZE;

/// Default routine stack size: 4 MiB.
const DEFAULT_ROUTINE_STACK_SIZE: usize = 4 * 1024 * 1024;
/// Default scheduler stack size: 64 KiB. The scheduling loop only juggles
/// queues, it never runs user code.
const DEFAULT_SCHED_STACK_SIZE: usize = 64 * 1024;
/// Default preemption period: 20 ms.
const DEFAULT_TIMER_NANOS: u64 = 20_000_000;

/// Resolved runtime knobs, read from the environment once when the runtime
/// starts.
///
/// | Variable | Effect | Default |
/// |---|---|---|
/// | `RGO_MAX_PROCS` | number of worker threads and processors | hardware concurrency |
/// | `RGO_ROUTINE_STACK_SIZE` | routine stack bytes (floor 64 KiB) | 4 MiB |
/// | `RGO_SCHED_STACK_SIZE` | scheduler context stack bytes | 64 KiB |
/// | `RGO_TIMER_NANOS` | preemption period in nanoseconds | 20,000,000 |
#[derive(Debug, Clone)]
pub struct Config {
    pub max_procs: usize,
    pub routine_stack_size: usize,
    pub sched_stack_size: usize,
    pub timer_interval: Duration,
}

impl Config {
    /// Returns the process-wide configuration, resolving it from the
    /// environment on first use.
    pub fn get() -> &'static Config {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        CONFIG.get_or_init(Config::from_env)
    }

    fn from_env() -> Config {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Config {
            max_procs: parse_count(env("RGO_MAX_PROCS").as_deref(), hardware),
            routine_stack_size: parse_stack_size(
                env("RGO_ROUTINE_STACK_SIZE").as_deref(),
                DEFAULT_ROUTINE_STACK_SIZE,
            ),
            sched_stack_size: parse_stack_size(
                env("RGO_SCHED_STACK_SIZE").as_deref(),
                DEFAULT_SCHED_STACK_SIZE,
            ),
            timer_interval: Duration::from_nanos(
                parse_nanos(env("RGO_TIMER_NANOS").as_deref(), DEFAULT_TIMER_NANOS),
            ),
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Parses a worker count; malformed or zero values fall back to `default`.
fn parse_count(raw: Option<&str>, default: usize) -> usize {
    match raw.and_then(|s| s.trim().parse::<usize>().ok()) {
        Some(n) if n > 0 => n,
        _ => default.max(1),
    }
}

/// Parses a stack size in bytes, clamped to the 64 KiB floor.
fn parse_stack_size(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(default)
        .max(MIN_STACK_SIZE)
}

/// Parses the timer period in nanoseconds; zero would disarm the timer, so
/// it is rejected like a malformed value.
fn parse_nanos(raw: Option<&str>, default: u64) -> u64 {
    match raw.and_then(|s| s.trim().parse::<u64>().ok()) {
        Some(n) if n > 0 => n,
        _ => default,
    }
}
