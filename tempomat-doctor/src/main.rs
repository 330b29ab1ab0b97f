#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use tempomat_lib::api::{Client, DumpEntry, DEFAULT_ADDR};

const ALL_BUCKETS: [&str; 4] = ["Slash32", "Slash24", "Slash16", "UserAgent"];

#[derive(Parser, Debug)]
#[command(author, version, about = "Connects to a tempomat server and dumps current bucket state")]
struct Cli {
    /// Dump a single bucket instead of all four
    #[arg(short, long, value_name = "NAME")]
    bucket: Option<String>,

    /// Introspection endpoint to dial
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_ADDR)]
    addr: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut client = match Client::connect(&cli.addr).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("failed to dial server: {err}");
            std::process::exit(1);
        }
    };

    let buckets: Vec<&str> = match &cli.bucket {
        Some(name) => vec![name.as_str()],
        None => ALL_BUCKETS.to_vec(),
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    for name in buckets {
        let mut entries = match client.dump(name).await {
            Ok(entries) => entries,
            Err(err) => {
                eprintln!("call error: {err}");
                std::process::exit(1);
            }
        };
        entries.sort_by(|a, b| b.avg_wait.total_cmp(&a.avg_wait));
        render(name, &entries, now);
    }
}

fn render(name: &str, entries: &[DumpEntry], now: f64) {
    println!("{name} ({} entries)", entries.len());
    println!("{:>10} {:>8} {:>10}  {}", "avg wait", "idle s", "cpu-s/s", "identity");
    for entry in entries {
        let idle = (now - entry.last_used).max(0.0);
        println!(
            "{:>10.2} {:>8.0} {:>10.3}  {}",
            entry.avg_wait, idle, entry.avg_cpu_secs, entry.title
        );
    }
    println!();
}
