use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Seeded concurrency stress run for sqlite-dispatch")]
pub(crate) struct Args {
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) duration: Option<Duration>,
    #[arg(long)]
    pub(crate) iterations: Option<u64>,
    #[arg(long)]
    pub(crate) seed: Option<u64>,
    /// Database file; a temporary file is used when omitted.
    #[arg(long)]
    pub(crate) db: Option<PathBuf>,
    #[arg(long, default_value_t = 4)]
    pub(crate) max_readers: usize,
    #[arg(long, default_value_t = 4)]
    pub(crate) writers: usize,
    #[arg(long, default_value_t = 4)]
    pub(crate) auditors: usize,
    #[arg(long, default_value_t = 8)]
    pub(crate) accounts: usize,
    #[arg(long, default_value_t = 0.05)]
    pub(crate) abort_rate: f64,
    #[arg(long, default_value_t = 0.001)]
    pub(crate) panic_rate: f64,
    #[arg(long, default_value_t = 0.02)]
    pub(crate) sleep_rate: f64,
    #[arg(long, default_value = "50ms", value_parser = humantime::parse_duration)]
    pub(crate) drain_delay: Duration,
    #[arg(long)]
    pub(crate) log: Option<PathBuf>,
    #[arg(long)]
    pub(crate) quick: bool,
    #[arg(long)]
    pub(crate) stress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SimConfig {
    pub(crate) duration_ms: Option<u64>,
    pub(crate) iterations: Option<u64>,
    pub(crate) seed: u64,
    pub(crate) db: Option<PathBuf>,
    pub(crate) max_readers: usize,
    pub(crate) writers: usize,
    pub(crate) auditors: usize,
    pub(crate) accounts: usize,
    pub(crate) abort_rate: f64,
    pub(crate) panic_rate: f64,
    pub(crate) sleep_rate: f64,
    pub(crate) drain_delay_ms: u64,
    pub(crate) log: Option<PathBuf>,
    pub(crate) preset: Option<String>,
    pub(crate) first_steps: usize,
    pub(crate) tail_steps: usize,
}

impl SimConfig {
    pub(crate) fn from_args(args: Args) -> Self {
        let mut config = SimConfig {
            duration_ms: args.duration.map(duration_ms),
            iterations: args.iterations,
            seed: args.seed.unwrap_or_else(random_seed),
            db: args.db,
            max_readers: args.max_readers.max(1),
            writers: args.writers.max(1),
            auditors: args.auditors,
            accounts: args.accounts.max(2),
            abort_rate: clamp_rate(args.abort_rate),
            panic_rate: clamp_rate(args.panic_rate),
            sleep_rate: clamp_rate(args.sleep_rate),
            drain_delay_ms: duration_ms(args.drain_delay),
            log: args.log,
            preset: None,
            first_steps: 30,
            tail_steps: 80,
        };

        if args.quick {
            config.apply_quick();
        }
        if args.stress {
            config.apply_stress();
        }
        if config.iterations.is_none() && config.duration_ms.is_none() {
            config.iterations = Some(20_000);
        }

        config
    }

    pub(crate) fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    fn apply_quick(&mut self) {
        self.preset = Some("quick".to_string());
        self.iterations = Some(2_000);
        self.duration_ms = None;
        self.max_readers = 2;
        self.writers = 2;
        self.auditors = 2;
        self.abort_rate = 0.05;
        self.panic_rate = 0.001;
        self.sleep_rate = 0.02;
    }

    fn apply_stress(&mut self) {
        self.preset = Some("stress".to_string());
        self.iterations = Some(200_000);
        self.duration_ms = None;
        self.max_readers = 8;
        self.writers = 16;
        self.auditors = 16;
        self.abort_rate = 0.08;
        self.panic_rate = 0.002;
        self.sleep_rate = 0.05;
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn clamp_rate(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

fn random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs() ^ u64::from(now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rate_limits_bounds() {
        assert_eq!(clamp_rate(-1.0), 0.0);
        assert_eq!(clamp_rate(2.0), 1.0);
        assert_eq!(clamp_rate(0.5), 0.5);
        assert_eq!(clamp_rate(f64::NAN), 0.0);
    }

    #[test]
    fn quick_preset_bounds_the_run() {
        let args = Args::parse_from(["simulator", "--quick", "--seed", "7"]);
        let config = SimConfig::from_args(args);
        assert_eq!(config.seed, 7);
        assert_eq!(config.iterations, Some(2_000));
        assert_eq!(config.preset.as_deref(), Some("quick"));
    }

    #[test]
    fn unbounded_runs_get_a_default_step_budget() {
        let config = SimConfig::from_args(Args::parse_from(["simulator"]));
        assert_eq!(config.iterations, Some(20_000));
        assert!(config.accounts >= 2);
    }
}
